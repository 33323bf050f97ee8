//! RemoteSession trait abstraction over the device's document store.
//!
//! Implementations:
//! - `InMemorySession` - For testing
//! - `SshSession` (in rmfs) - Shells out to the system `ssh` binary
//! - `LocalSession` (in rmfs) - Uses tokio::fs on a copy of the data directory
//!
//! Every path handed to a session is relative to the device's data directory.

use crate::record::{Content, DocumentKind, Metadata, RawRecord};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Remote file not found: {0}")]
    NotFound(String),

    #[error("Remote command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<std::io::Error> for RemoteError {
    fn from(e: std::io::Error) -> Self {
        RemoteError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero exit status into `CommandFailed`.
    pub fn check(self, argv: &[String]) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(RemoteError::CommandFailed {
                command: argv.join(" "),
                status: self.status,
                stderr: String::from_utf8_lossy(&self.stderr).trim().to_string(),
            })
        }
    }
}

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Size in bytes, 0 for directories
    pub size: u64,
    pub is_dir: bool,
}

/// Channel to the device. Implementations must be `Send + Sync`; callers
/// serialize access so only one call is in flight at a time.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a command on the device.
    async fn execute_command(&self, argv: &[String]) -> Result<CommandOutput>;

    /// Replace the file at `path` with `data`.
    async fn upload_file(&self, data: &[u8], path: &str) -> Result<()>;

    /// Read the whole file at `path`.
    async fn download_file(&self, path: &str) -> Result<Vec<u8>>;

    /// List a directory. The empty path is the data directory itself.
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// Read every `.metadata` record together with its `.content` and payload
    /// size, sorted by id. Records whose metadata cannot be parsed are skipped.
    async fn list_metadata(&self) -> Result<Vec<RawRecord>> {
        let entries = self.list_dir("").await?;
        let sizes: HashMap<&str, u64> = entries
            .iter()
            .filter(|e| !e.is_dir)
            .map(|e| (e.name.as_str(), e.size))
            .collect();

        let mut ids: Vec<&str> = entries
            .iter()
            .filter(|e| !e.is_dir)
            .filter_map(|e| e.name.strip_suffix(".metadata"))
            .filter(|id| !id.is_empty())
            .collect();
        ids.sort_unstable();

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let bytes = match self.download_file(&metadata_path(id)).await {
                Ok(bytes) => bytes,
                Err(RemoteError::NotFound(path)) => {
                    tracing::warn!("{} vanished while listing, skipping", path);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let metadata: Metadata = match serde_json::from_slice(&bytes) {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!("Skipping {}: unparsable metadata: {}", id, e);
                    continue;
                }
            };

            let content = match self.download_file(&content_path(id)).await {
                Ok(bytes) => match serde_json::from_slice::<Content>(&bytes) {
                    Ok(content) => Some(content),
                    Err(e) => {
                        tracing::warn!("Ignoring unparsable content of {}: {}", id, e);
                        None
                    }
                },
                Err(RemoteError::NotFound(_)) => None,
                Err(e) => return Err(e),
            };

            let payload_size = ["pdf", "epub"]
                .iter()
                .find_map(|ext| sizes.get(format!("{}.{}", id, ext).as_str()).copied())
                .unwrap_or(0);

            records.push(RawRecord {
                id: id.to_string(),
                metadata,
                content,
                payload_size,
            });
        }
        tracing::debug!("Listed {} records", records.len());
        Ok(records)
    }
}

#[async_trait]
impl<T: RemoteSession + ?Sized> RemoteSession for Arc<T> {
    async fn execute_command(&self, argv: &[String]) -> Result<CommandOutput> {
        (**self).execute_command(argv).await
    }

    async fn upload_file(&self, data: &[u8], path: &str) -> Result<()> {
        (**self).upload_file(data, path).await
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>> {
        (**self).download_file(path).await
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        (**self).list_dir(path).await
    }

    async fn list_metadata(&self) -> Result<Vec<RawRecord>> {
        (**self).list_metadata().await
    }
}

// ========== Device paths ==========

pub fn metadata_path(id: &str) -> String {
    format!("{}.metadata", id)
}

pub fn content_path(id: &str) -> String {
    format!("{}.content", id)
}

/// Payload file of a PDF or EPUB document.
pub fn payload_path(id: &str, kind: DocumentKind) -> Option<String> {
    kind.payload_extension()
        .map(|ext| format!("{}.{}", id, ext))
}

/// Stroke file of one notebook page. `page` is the page id, or its index
/// for notebooks whose content lists no page ids.
pub fn page_path(id: &str, page: &str) -> String {
    format!("{}/{}.rm", id, page)
}

/// Single-file notebook in the legacy multi-page format.
pub fn lines_path(id: &str) -> String {
    format!("{}.lines", id)
}

// ========== Test double ==========

/// In-memory session for testing
#[derive(Default)]
pub struct InMemorySession {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    commands: RwLock<Vec<Vec<String>>>,
    fail_uploads: AtomicBool,
}

impl InMemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_file(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.files
            .write()
            .await
            .insert(normalize(path), data.into());
    }

    pub async fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.read().await.get(&normalize(path)).cloned()
    }

    /// Parsed JSON of a stored file.
    pub async fn json(&self, path: &str) -> Option<serde_json::Value> {
        self.file(path)
            .await
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    pub async fn paths(&self) -> Vec<String> {
        self.files.read().await.keys().cloned().collect()
    }

    /// Every command executed so far, in order.
    pub async fn commands(&self) -> Vec<Vec<String>> {
        self.commands.read().await.clone()
    }

    /// Make every following upload fail with a transport error.
    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

#[async_trait]
impl RemoteSession for InMemorySession {
    async fn execute_command(&self, argv: &[String]) -> Result<CommandOutput> {
        self.commands.write().await.push(argv.to_vec());
        Ok(CommandOutput::default())
    }

    async fn upload_file(&self, data: &[u8], path: &str) -> Result<()> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport(format!(
                "connection reset while uploading {}",
                path
            )));
        }
        self.put_file(path, data).await;
        Ok(())
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>> {
        self.file(path)
            .await
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let dir = normalize(path);
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };

        let files = self.files.read().await;
        let mut dirs = BTreeSet::new();
        let mut entries = Vec::new();
        for (key, data) in files.iter() {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((sub, _)) => {
                    dirs.insert(sub.to_string());
                }
                None => entries.push(RemoteEntry {
                    name: rest.to_string(),
                    size: data.len() as u64,
                    is_dir: false,
                }),
            }
        }
        if entries.is_empty() && dirs.is_empty() && !dir.is_empty() {
            return Err(RemoteError::NotFound(dir));
        }
        entries.extend(dirs.into_iter().map(|name| RemoteEntry {
            name,
            size: 0,
            is_dir: true,
        }));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seed(session: &InMemorySession, id: &str, metadata: serde_json::Value) {
        session
            .put_file(&metadata_path(id), metadata.to_string())
            .await;
    }

    #[tokio::test]
    async fn test_list_metadata_collects_records() {
        let session = InMemorySession::new();
        seed(
            &session,
            "b",
            json!({"type": "DocumentType", "visibleName": "Paper", "parent": ""}),
        )
        .await;
        session
            .put_file(&content_path("b"), json!({"fileType": "pdf"}).to_string())
            .await;
        session.put_file("b.pdf", b"%PDF-1.4 data".to_vec()).await;
        seed(
            &session,
            "a",
            json!({"type": "CollectionType", "visibleName": "Notes", "parent": ""}),
        )
        .await;

        let records = session.list_metadata().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "a");
        assert!(records[0].content.is_none());
        assert_eq!(records[1].id, "b");
        assert_eq!(records[1].payload_size, 13);
        assert_eq!(
            records[1].content.as_ref().unwrap().file_type.as_deref(),
            Some("pdf")
        );
    }

    #[tokio::test]
    async fn test_list_metadata_skips_garbage() {
        let session = InMemorySession::new();
        session.put_file("bad.metadata", "{not json").await;
        seed(&session, "good", json!({"type": "CollectionType"})).await;
        session.put_file("good.content", "[1, 2]").await;

        let records = session.list_metadata().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "good");
        assert!(records[0].content.is_none());
    }

    #[tokio::test]
    async fn test_list_dir_nested() {
        let session = InMemorySession::new();
        session.put_file("n.content", "{}").await;
        session.put_file("n/p1.rm", vec![1, 2, 3]).await;
        session.put_file("n/p2.rm", vec![4]).await;

        let root = session.list_dir("").await.unwrap();
        assert_eq!(root.len(), 2);
        assert!(root.iter().any(|e| e.name == "n" && e.is_dir));

        let pages = session.list_dir("n").await.unwrap();
        assert_eq!(
            pages,
            vec![
                RemoteEntry { name: "p1.rm".into(), size: 3, is_dir: false },
                RemoteEntry { name: "p2.rm".into(), size: 1, is_dir: false },
            ]
        );
        assert!(matches!(
            session.list_dir("missing").await,
            Err(RemoteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_failure_injection() {
        let session = InMemorySession::new();
        session.fail_uploads(true);
        assert!(matches!(
            session.upload_file(b"x", "a.pdf").await,
            Err(RemoteError::Transport(_))
        ));
        assert!(session.file("a.pdf").await.is_none());

        session.fail_uploads(false);
        session.upload_file(b"x", "a.pdf").await.unwrap();
        assert_eq!(session.file("a.pdf").await.unwrap(), b"x");
    }

    #[test]
    fn test_command_output_check() {
        let argv = vec!["systemctl".to_string(), "stop".to_string()];
        let failed = CommandOutput {
            status: 1,
            stdout: Vec::new(),
            stderr: b"unit not found\n".to_vec(),
        };
        match failed.check(&argv) {
            Err(RemoteError::CommandFailed { command, status, stderr }) => {
                assert_eq!(command, "systemctl stop");
                assert_eq!(status, 1);
                assert_eq!(stderr, "unit not found");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(CommandOutput::default().check(&argv).is_ok());
    }

    #[test]
    fn test_paths() {
        assert_eq!(metadata_path("x"), "x.metadata");
        assert_eq!(payload_path("x", DocumentKind::Epub).unwrap(), "x.epub");
        assert_eq!(payload_path("x", DocumentKind::Notebook), None);
        assert_eq!(page_path("x", "0"), "x/0.rm");
    }
}
