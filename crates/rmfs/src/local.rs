//! Local copy of a device data directory, using tokio::fs.
//!
//! Handy for working on a backup or for tests. Commands run on this machine
//! with the data directory as working directory.

use async_trait::async_trait;
use rmfs_core::remote::Result;
use rmfs_core::{CommandOutput, RemoteEntry, RemoteError, RemoteSession};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;

/// Session over a directory laid out like the device's data directory
pub struct LocalSession {
    base_path: PathBuf,
}

impl LocalSession {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let path = path.trim_matches('/');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

fn io_error(path: &str, e: std::io::Error) -> RemoteError {
    if e.kind() == ErrorKind::NotFound {
        RemoteError::NotFound(path.to_string())
    } else {
        RemoteError::Transport(format!("{}: {}", path, e))
    }
}

#[async_trait]
impl RemoteSession for LocalSession {
    async fn execute_command(&self, argv: &[String]) -> Result<CommandOutput> {
        let Some((program, args)) = argv.split_first() else {
            return Ok(CommandOutput::default());
        };
        let output = Command::new(program)
            .args(args)
            .current_dir(&self.base_path)
            .output()
            .await?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn upload_file(&self, data: &[u8], path: &str) -> Result<()> {
        let full_path = self.full_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }

        fs::write(&full_path, data)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.full_path(path))
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(self.full_path(path))
            .await
            .map_err(|e| io_error(path, e))?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(path, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = entry.metadata().await.map_err(|e| io_error(path, e))?;

            entries.push(RemoteEntry {
                name,
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                is_dir: metadata.is_dir(),
            });
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_creates_directories() {
        let dir = TempDir::new().unwrap();
        let session = LocalSession::new(dir.path().to_path_buf());

        session.upload_file(b"page", "abc/0.rm").await.unwrap();
        assert_eq!(session.download_file("abc/0.rm").await.unwrap(), b"page");

        let mut entries = session.list_dir("").await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            entries,
            vec![RemoteEntry {
                name: "abc".to_string(),
                size: 0,
                is_dir: true,
            }]
        );
        let entries = session.list_dir("abc").await.unwrap();
        assert_eq!(entries[0].size, 4);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let session = LocalSession::new(dir.path().to_path_buf());

        let err = session.download_file("nope.metadata").await.unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(p) if p == "nope.metadata"));
        assert!(matches!(
            session.list_dir("missing").await.unwrap_err(),
            RemoteError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_execute_command_runs_in_base_path() {
        let dir = TempDir::new().unwrap();
        let session = LocalSession::new(dir.path().to_path_buf());
        session.upload_file(b"x", "marker").await.unwrap();

        let argv = vec!["ls".to_string()];
        let output = session.execute_command(&argv).await.unwrap();
        assert!(output.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("marker"));

        let output = session.execute_command(&[]).await.unwrap();
        assert!(output.success());
    }
}
