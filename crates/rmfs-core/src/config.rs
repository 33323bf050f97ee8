//! Mount policies

use crate::tree::RemovePolicy;
use serde::{Deserialize, Serialize};

/// Behaviour switches for a [`crate::mount::Mount`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    /// What rmdir does with a non-empty folder (default: refuse)
    #[serde(default)]
    pub rmdir: RemovePolicy,

    /// Re-read the record store before every structural change, so edits made
    /// on the device since the last refresh are seen first
    #[serde(default)]
    pub refresh_before_mutation: bool,

    /// Run `reload_command` after every flush that wrote something
    #[serde(default)]
    pub reload_after_flush: bool,

    /// Command that makes the device re-read its document index
    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            rmdir: RemovePolicy::default(),
            refresh_before_mutation: false,
            reload_after_flush: false,
            reload_command: default_reload_command(),
        }
    }
}

fn default_reload_command() -> Vec<String> {
    ["systemctl", "restart", "xochitl"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
