//! Session over the system `ssh` binary.
//!
//! Every call is one `ssh` invocation running a small `sh` script in the
//! device's data directory. A control master keeps the connection open
//! between calls.

use crate::config::ConnectionConfig;
use async_trait::async_trait;
use rmfs_core::remote::Result;
use rmfs_core::{CommandOutput, RemoteEntry, RemoteError, RemoteSession};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Exit status the scripts below use for "no such file".
const MISSING: i32 = 44;

/// Exit status `ssh` itself uses when the connection fails.
const SSH_FAILED: i32 = 255;

pub struct SshSession {
    program: String,
    destination: String,
    data_dir: String,
    control_path: String,
    connect_timeout_secs: u64,
}

impl SshSession {
    pub fn new(connection: &ConnectionConfig) -> Self {
        Self {
            program: connection.ssh_program.clone(),
            destination: format!("{}@{}", connection.user, connection.host),
            data_dir: connection
                .data_dir
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string(),
            control_path: format!("/tmp/rmfs-{}-%C", std::process::id()),
            connect_timeout_secs: connection.connect_timeout_secs,
        }
    }

    /// Open the connection and stop the device UI.
    pub async fn connect(&self, stop_command: &[String]) -> Result<()> {
        tracing::info!("Connecting to {}", self.destination);
        let argv = vec!["true".to_string()];
        self.execute_command(&argv).await?.check(&argv)?;

        if !stop_command.is_empty() {
            match self.execute_command(stop_command).await {
                Ok(output) if output.success() => {
                    tracing::debug!("Stopped device UI with `{}`", stop_command.join(" "));
                }
                Ok(output) => tracing::warn!(
                    "`{}` exited with status {}: {}",
                    stop_command.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => tracing::warn!("Failed to stop device UI: {}", e),
            }
        }
        Ok(())
    }

    /// Close the control master.
    pub async fn disconnect(&self) {
        let result = Command::new(&self.program)
            .arg("-O")
            .arg("exit")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path))
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            tracing::debug!("Closing ssh control master failed: {}", e);
        }
    }

    fn options(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ]
    }

    fn full_path(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        if path.is_empty() {
            self.data_dir.clone()
        } else {
            format!("{}/{}", self.data_dir, path)
        }
    }

    /// Run `script` with `sh` on the device, feeding it `stdin`.
    async fn run(&self, script: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        tracing::debug!("ssh {}: {}", self.destination, script);
        let mut child = Command::new(&self.program)
            .args(self.options())
            .arg(&self.destination)
            .arg(script)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let status = output.status.code().unwrap_or(-1);
        if status == SSH_FAILED {
            return Err(RemoteError::Transport(format!(
                "ssh {}: {}",
                self.destination,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(CommandOutput {
            status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn execute_command(&self, argv: &[String]) -> Result<CommandOutput> {
        if argv.is_empty() {
            return Ok(CommandOutput::default());
        }
        let command: Vec<String> = argv.iter().map(|a| shell_quote(a)).collect();
        let script = format!("cd {} && {}", shell_quote(&self.data_dir), command.join(" "));
        self.run(&script, None).await
    }

    async fn upload_file(&self, data: &[u8], path: &str) -> Result<()> {
        let full = self.full_path(path);
        let dir = match full.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => dir.to_string(),
            _ => self.data_dir.clone(),
        };
        let tmp = format!("{}.rmfs-upload", full);
        let script = format!(
            "mkdir -p {dir} && cat > {tmp} && mv {tmp} {full}",
            dir = shell_quote(&dir),
            tmp = shell_quote(&tmp),
            full = shell_quote(&full),
        );
        let argv = vec!["upload".to_string(), path.to_string()];
        self.run(&script, Some(data)).await?.check(&argv)?;
        Ok(())
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>> {
        let full = shell_quote(&self.full_path(path));
        let script = format!("if [ -e {full} ]; then cat {full}; else exit {MISSING}; fi");
        let output = self.run(&script, None).await?;
        if output.status == MISSING {
            return Err(RemoteError::NotFound(path.to_string()));
        }
        let argv = vec!["download".to_string(), path.to_string()];
        Ok(output.check(&argv)?.stdout)
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let script = format!(
            concat!(
                "cd {dir} 2>/dev/null || exit {missing}; ",
                "for f in *; do ",
                "[ -e \"$f\" ] || continue; ",
                "if [ -d \"$f\" ]; then echo \"d 0 $f\"; ",
                "else echo \"f $(($(wc -c < \"$f\"))) $f\"; fi; ",
                "done"
            ),
            dir = shell_quote(&self.full_path(path)),
            missing = MISSING,
        );
        let output = self.run(&script, None).await?;
        if output.status == MISSING {
            return Err(RemoteError::NotFound(path.to_string()));
        }
        let argv = vec!["list".to_string(), path.to_string()];
        let output = output.check(&argv)?;
        Ok(parse_listing(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Quote `arg` for `sh`.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,@+%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Parse the `<d|f> <size> <name>` lines printed by the listing script.
fn parse_listing(stdout: &str) -> Vec<RemoteEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ' ');
            let kind = parts.next()?;
            let size = parts.next()?.trim().parse().ok()?;
            let name = parts.next()?;
            if name.is_empty() {
                return None;
            }
            Some(RemoteEntry {
                name: name.to_string(),
                size,
                is_dir: kind == "d",
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("systemctl"), "systemctl");
        assert_eq!(shell_quote("/home/root/x.rm"), "/home/root/x.rm");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_parse_listing() {
        let entries = parse_listing("f 120 a.metadata\nd 0 a\nf 7 name with spaces.pdf\ngarbage\n");
        assert_eq!(
            entries,
            vec![
                RemoteEntry {
                    name: "a.metadata".to_string(),
                    size: 120,
                    is_dir: false,
                },
                RemoteEntry {
                    name: "a".to_string(),
                    size: 0,
                    is_dir: true,
                },
                RemoteEntry {
                    name: "name with spaces.pdf".to_string(),
                    size: 7,
                    is_dir: false,
                },
            ]
        );
    }

    /// Stand-in for `ssh` that runs the remote script locally.
    fn fake_ssh(dir: &TempDir) -> SshSession {
        let program = dir.path().join("fake-ssh");
        std::fs::write(&program, "#!/bin/sh\nfor last; do :; done\nexec sh -c \"$last\"\n")
            .unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let data_dir = dir.path().join("xochitl");
        std::fs::create_dir(&data_dir).unwrap();

        SshSession::new(&ConnectionConfig {
            ssh_program: program.to_string_lossy().to_string(),
            data_dir,
            ..ConnectionConfig::default()
        })
    }

    #[tokio::test]
    async fn test_file_round_trip_through_scripts() {
        let dir = TempDir::new().unwrap();
        let session = fake_ssh(&dir);

        session.upload_file(b"%PDF-1.4", "doc.pdf").await.unwrap();
        session.upload_file(b"it's here", "doc/page one.rm").await.unwrap();
        assert_eq!(session.download_file("doc.pdf").await.unwrap(), b"%PDF-1.4");
        assert_eq!(
            session.download_file("doc/page one.rm").await.unwrap(),
            b"it's here"
        );

        let mut entries = session.list_dir("").await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let names: Vec<_> = entries.iter().map(|e| (e.name.as_str(), e.size, e.is_dir)).collect();
        assert_eq!(names, vec![("doc", 0, true), ("doc.pdf", 8, false)]);
    }

    #[tokio::test]
    async fn test_missing_paths() {
        let dir = TempDir::new().unwrap();
        let session = fake_ssh(&dir);

        assert!(matches!(
            session.download_file("nope.content").await.unwrap_err(),
            RemoteError::NotFound(p) if p == "nope.content"
        ));
        assert!(matches!(
            session.list_dir("nope").await.unwrap_err(),
            RemoteError::NotFound(_)
        ));
        assert!(session.list_dir("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execute_command() {
        let dir = TempDir::new().unwrap();
        let session = fake_ssh(&dir);

        let argv = vec!["sh".to_string(), "-c".to_string(), "pwd; exit 3".to_string()];
        let output = session.execute_command(&argv).await.unwrap();
        assert_eq!(output.status, 3);
        assert!(String::from_utf8_lossy(&output.stdout).trim().ends_with("xochitl"));

        let err = output.check(&argv).unwrap_err();
        assert!(matches!(err, RemoteError::CommandFailed { status: 3, .. }));

        session.connect(&[]).await.unwrap();
    }
}
