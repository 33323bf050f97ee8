//! rmfs: mounts a reMarkable tablet's document store through FUSE.
//!
//! The filesystem model lives in rmfs-core; this crate adds the device
//! connections, configuration loading and the kernel binding.

pub mod config;
pub mod fuse;
pub mod local;
pub mod ssh;

pub use config::{Config, ConnectionConfig};
pub use local::LocalSession;
pub use ssh::SshSession;
