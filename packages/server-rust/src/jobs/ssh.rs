//! Remote shell seam used by the job runner and the `ssh` binlog copy mode.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use crate::config::SshConfig;
use crate::error::JobError;

/// Result of one remote script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stdout followed by stderr.
    #[must_use]
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Executes scripts and fetches files on database hosts.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Streams `script` to a shell on `host` over stdin with `env` exported.
    async fn exec(&self, host: &str, script: &str, env: &[(String, String)]) -> Result<ShellOutput, JobError>;

    /// Remote file size in bytes, `None` when the file is absent.
    async fn file_size(&self, host: &str, remote_path: &str) -> Result<Option<u64>, JobError>;

    /// Copies `remote_path` on `host` to `local_path`. Returns the bytes written.
    async fn fetch(&self, host: &str, remote_path: &str, local_path: &Path) -> Result<u64, JobError>;
}

/// Shell-quotes a value for an `export` line.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Remote command run for every streamed script.
const REMOTE_SHELL: &str = "bash -s";

/// Script body streamed on stdin: one `export K='v'` line per variable, then
/// the script. Credentials stay out of the ssh argv.
fn stdin_script(env: &[(String, String)], script: &str) -> String {
    let mut out: String = env.iter().map(|(k, v)| format!("export {k}={}\n", quote(v))).collect();
    out.push_str(script);
    out
}

/// [`RemoteShell`] over the system `ssh` and `scp` binaries.
#[derive(Debug, Clone)]
pub struct OpenSshShell {
    config: SshConfig,
}

impl OpenSshShell {
    #[must_use]
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn base_args(&self, port_flag: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            port_flag.to_string(),
            self.config.port.to_string(),
        ];
        if let Some(key) = &self.config.key_path {
            args.push("-i".into());
            args.push(key.display().to_string());
        }
        args
    }

    fn ssh_failed(host: &str, e: impl std::fmt::Display) -> JobError {
        JobError::Ssh {
            host: host.to_string(),
            message: e.to_string(),
        }
    }

    async fn run_ssh(&self, host: &str, remote: String, stdin: Option<&str>) -> Result<ShellOutput, JobError> {
        if !self.config.enabled {
            return Err(JobError::SshDisabled);
        }
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.args(self.base_args("-p"))
            .arg(format!("{}@{host}", self.config.user))
            .arg(remote)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| Self::ssh_failed(host, e))?;
        if let (Some(script), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(script.as_bytes())
                .await
                .map_err(|e| Self::ssh_failed(host, e))?;
        }
        let out = child
            .wait_with_output()
            .await
            .map_err(|e| Self::ssh_failed(host, e))?;
        Ok(ShellOutput {
            status: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl RemoteShell for OpenSshShell {
    async fn exec(&self, host: &str, script: &str, env: &[(String, String)]) -> Result<ShellOutput, JobError> {
        let body = stdin_script(env, script);
        self.run_ssh(host, REMOTE_SHELL.to_string(), Some(&body)).await
    }

    async fn file_size(&self, host: &str, remote_path: &str) -> Result<Option<u64>, JobError> {
        let out = self
            .run_ssh(host, format!("stat -c %s {}", quote(remote_path)), None)
            .await?;
        if !out.success() {
            return Ok(None);
        }
        Ok(out.stdout.trim().parse().ok())
    }

    async fn fetch(&self, host: &str, remote_path: &str, local_path: &Path) -> Result<u64, JobError> {
        if !self.config.enabled {
            return Err(JobError::SshDisabled);
        }
        let status = tokio::process::Command::new("scp")
            .args(self.base_args("-P"))
            .arg(format!("{}@{host}:{remote_path}", self.config.user))
            .arg(local_path)
            .status()
            .await
            .map_err(|e| Self::ssh_failed(host, e))?;
        if !status.success() {
            return Err(Self::ssh_failed(host, format!("scp exited with {status}")));
        }
        Ok(tokio::fs::metadata(local_path).await?.len())
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

/// One script observed by [`RecordingShell`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCall {
    pub host: String,
    pub script: String,
    pub env: Vec<(String, String)>,
}

impl ShellCall {
    #[must_use]
    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

/// [`RemoteShell`] answering from canned data.
#[derive(Debug, Default)]
pub struct RecordingShell {
    calls: Mutex<Vec<ShellCall>>,
    output: Mutex<ShellOutput>,
    /// Remote path to content served by `fetch`.
    files: Mutex<Vec<(String, Vec<u8>)>>,
    /// Reported size differs from the fetched size for these paths.
    lying_sizes: Mutex<Vec<String>>,
}

impl RecordingShell {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_output(&self, status: i32, stdout: &str) {
        *self.output.lock() = ShellOutput {
            status,
            stdout: stdout.to_string(),
            stderr: String::new(),
        };
    }

    pub fn add_file(&self, remote_path: &str, content: &[u8]) {
        self.files.lock().push((remote_path.to_string(), content.to_vec()));
    }

    /// Makes `file_size` over-report `remote_path` by one byte.
    pub fn corrupt_size(&self, remote_path: &str) {
        self.lying_sizes.lock().push(remote_path.to_string());
    }

    #[must_use]
    pub fn calls(&self) -> Vec<ShellCall> {
        self.calls.lock().clone()
    }

    fn content(&self, remote_path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .iter()
            .find(|(p, _)| p == remote_path)
            .map(|(_, c)| c.clone())
    }
}

#[async_trait]
impl RemoteShell for RecordingShell {
    async fn exec(&self, host: &str, script: &str, env: &[(String, String)]) -> Result<ShellOutput, JobError> {
        self.calls.lock().push(ShellCall {
            host: host.to_string(),
            script: script.to_string(),
            env: env.to_vec(),
        });
        Ok(self.output.lock().clone())
    }

    async fn file_size(&self, _host: &str, remote_path: &str) -> Result<Option<u64>, JobError> {
        let lying = self.lying_sizes.lock().iter().any(|p| p == remote_path);
        Ok(self
            .content(remote_path)
            .map(|c| c.len() as u64 + u64::from(lying)))
    }

    async fn fetch(&self, host: &str, remote_path: &str, local_path: &Path) -> Result<u64, JobError> {
        let content = self.content(remote_path).ok_or_else(|| JobError::Ssh {
            host: host.to_string(),
            message: format!("{remote_path}: no such file"),
        })?;
        tokio::fs::write(local_path, &content).await?;
        Ok(content.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exports_are_streamed_ahead_of_the_script() {
        let env = vec![
            ("REPLICATION_MANAGER_USER".to_string(), "root".to_string()),
            ("REPLICATION_MANAGER_PASSWORD".to_string(), "it's".to_string()),
        ];
        assert_eq!(
            stdin_script(&env, "echo ok\n"),
            "export REPLICATION_MANAGER_USER='root'\nexport REPLICATION_MANAGER_PASSWORD='it'\\''s'\necho ok\n"
        );
        assert_eq!(REMOTE_SHELL, "bash -s");
        assert_eq!(stdin_script(&[], "true"), "true");
    }

    #[tokio::test]
    async fn disabled_ssh_refuses() {
        let shell = OpenSshShell::new(SshConfig::default());
        let err = shell.exec("db1", "true", &[]).await.unwrap_err();
        assert!(matches!(err, JobError::SshDisabled));
    }

    #[tokio::test]
    async fn recording_shell_serves_files() {
        let dir = tempfile::tempdir().unwrap();
        let shell = RecordingShell::new();
        shell.add_file("/var/lib/mysql/mysql-bin.000001", b"abc");
        assert_eq!(shell.file_size("db1", "/var/lib/mysql/mysql-bin.000001").await.unwrap(), Some(3));
        let local = dir.path().join("f");
        assert_eq!(shell.fetch("db1", "/var/lib/mysql/mysql-bin.000001", &local).await.unwrap(), 3);
        assert!(shell.fetch("db1", "/nope", &local).await.is_err());
    }
}
