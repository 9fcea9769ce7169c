//! Copies leader binlogs into the node backup directory and keeps a bounded
//! window of them there.

use std::path::{Path, PathBuf};

use repman_core::binlog::{backup_files_to_delete, BinlogName};
use tracing::{debug, info, warn};

use crate::config::BinlogCopyMode;
use crate::context::BackupKind;
use crate::error::BinlogError;
use crate::logging::BINLOG;
use crate::monitor::ServerMonitor;
use crate::traits::ToolCommand;

/// Start offset of the first event after the magic header.
const FIRST_EVENT_POS: u64 = 4;
/// Back-off attempts when another binlog copy holds the guard.
const COPY_RETRIES: u32 = 3;

fn copy_error(file: &str, reason: impl std::fmt::Display) -> BinlogError {
    BinlogError::Copy {
        file: file.to_string(),
        reason: reason.to_string(),
    }
}

impl ServerMonitor {
    /// Directory holding the server binlogs, from `log_bin_basename`.
    fn binlog_dir(&self) -> String {
        self.view()
            .variables
            .get("LOG_BIN_BASENAME")
            .and_then(|b| Path::new(b).parent())
            .map_or_else(|| "/var/lib/mysql".to_string(), |p| p.display().to_string())
    }

    /// Copies `file` into the backup directory with the configured mode.
    /// Returns the paths now present there.
    ///
    /// # Errors
    ///
    /// [`BinlogError::Copy`] when another copy keeps running, the copy fails
    /// or the copied size does not match the remote size.
    pub async fn backup_binlog(&self, file: &str) -> Result<Vec<PathBuf>, BinlogError> {
        let _guard = self
            .ctx
            .backups
            .acquire(BackupKind::Binlog, COPY_RETRIES)
            .await
            .ok_or_else(|| copy_error(file, "a binlog copy is already running"))?;
        let config = self.ctx.config();
        let dir = self.backup_dir();
        tokio::fs::create_dir_all(&dir).await?;

        let copied = match config.binlog_copy_mode {
            BinlogCopyMode::Mysqlbinlog => self.copy_with_reader(file, &dir).await?,
            BinlogCopyMode::Ssh => vec![self.copy_with_ssh(file, &dir).await?],
            BinlogCopyMode::Script => {
                let script = config
                    .binlog_copy_script
                    .as_deref()
                    .ok_or_else(|| copy_error(file, "no binlog copy script configured"))?;
                let cmd = ToolCommand::new(script).args([
                    self.host.clone(),
                    self.port.to_string(),
                    file.to_string(),
                    dir.display().to_string(),
                ]);
                self.ctx
                    .collab
                    .scripts
                    .run(&cmd)
                    .await
                    .map_err(|e| copy_error(file, e))?;
                let path = dir.join(file);
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    return Err(copy_error(file, "script did not produce the file"));
                }
                vec![path]
            }
        };
        metrics::counter!("repman_binlog_copies_total").increment(copied.len() as u64);
        info!(target: BINLOG, server = %self.url, file, count = copied.len(), "binlog copied to backup");

        if config.backup_restic {
            for path in &copied {
                if let Err(e) = self.restic_forward(path).await {
                    warn!(target: BINLOG, server = %self.url, path = %path.display(), error = %e, "restic upload failed");
                }
            }
        }
        Ok(copied)
    }

    /// Downloads through the binlog reader into temporary names, then
    /// renames each result onto its binlog name.
    async fn copy_with_reader(&self, file: &str, dir: &Path) -> Result<Vec<PathBuf>, BinlogError> {
        let prefix = dir.join(".partial-");
        let written = self
            .ctx
            .collab
            .binlog_reader
            .download(&self.binlog_source(), file, FIRST_EVENT_POS, &prefix)
            .await?;
        let mut out = Vec::with_capacity(written.len());
        for tmp in written {
            let Some(name) = tmp
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(".partial-"))
            else {
                continue;
            };
            let dest = dir.join(name);
            tokio::fs::rename(&tmp, &dest).await?;
            out.push(dest);
        }
        Ok(out)
    }

    /// Fetches over ssh and accepts the file only when its size matches the
    /// remote one.
    async fn copy_with_ssh(&self, file: &str, dir: &Path) -> Result<PathBuf, BinlogError> {
        let shell = &self.ctx.collab.shell;
        let remote = format!("{}/{file}", self.binlog_dir());
        let expected = shell
            .file_size(&self.host, &remote)
            .await
            .map_err(|e| copy_error(file, e))?
            .ok_or_else(|| copy_error(file, format!("{remote} not found")))?;
        let tmp = dir.join(format!("{file}.part"));
        let got = shell
            .fetch(&self.host, &remote, &tmp)
            .await
            .map_err(|e| copy_error(file, e))?;
        if got != expected {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(copy_error(file, format!("size mismatch, expected {expected} got {got}")));
        }
        let dest = dir.join(file);
        tokio::fs::rename(&tmp, &dest).await?;
        Ok(dest)
    }

    async fn restic_forward(&self, path: &Path) -> Result<(), BinlogError> {
        let _guard = self
            .ctx
            .backups
            .acquire(BackupKind::Restic, COPY_RETRIES)
            .await
            .ok_or_else(|| copy_error(&path.display().to_string(), "restic already running"))?;
        let config = self.ctx.config();
        let version = self.version();
        let flavor = if version.is_mariadb() { "mariadb" } else { "mysql" };
        let mut cmd = ToolCommand::new("restic")
            .arg("-r")
            .arg(config.restic_repository.clone())
            .arg("backup")
            .arg(path.display().to_string());
        for tag in [
            config.cloud18_user.clone(),
            config.name.clone(),
            flavor.to_string(),
            version.to_string(),
            "binlog".to_string(),
        ] {
            if !tag.is_empty() {
                cmd = cmd.arg("--tag").arg(tag);
            }
        }
        self.ctx
            .collab
            .scripts
            .run(&cmd)
            .await
            .map(|_| ())
            .map_err(|e| copy_error(&path.display().to_string(), e))
    }

    /// Keeps the last `backup_binlogs_keep` binlogs up to `current_file` in
    /// the backup directory: copies the ones still on the server but
    /// missing locally, then deletes older ones. Returns the deleted names.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be read or `current_file` does not
    /// parse as a binlog name.
    pub async fn backup_binlog_purge(&self, current_file: &str) -> Result<Vec<String>, BinlogError> {
        let current: BinlogName = current_file
            .parse()
            .map_err(|_| copy_error(current_file, "unparsable binlog name"))?;
        let keep = self.ctx.config().backup_binlogs_keep;
        let dir = self.backup_dir();
        tokio::fs::create_dir_all(&dir).await?;

        let local = list_names(&dir).await?;
        let floor = current.suffix.saturating_sub(keep.saturating_sub(1)).max(1);
        let on_server = self.view().binary_logs;
        for suffix in floor..=current.suffix {
            let name = current.with_suffix(suffix).to_string();
            if local.contains(&name) || !on_server.iter().any(|(n, _)| *n == name) {
                continue;
            }
            debug!(target: BINLOG, server = %self.url, file = %name, "re-copying missing backup binlog");
            if let Err(e) = self.backup_binlog(&name).await {
                warn!(target: BINLOG, server = %self.url, file = %name, error = %e, "backup binlog copy failed");
            }
        }

        let local = list_names(&dir).await?;
        let doomed = backup_files_to_delete(&local, &current, keep);
        for name in &doomed {
            tokio::fs::remove_file(dir.join(name)).await?;
        }
        if !doomed.is_empty() {
            info!(target: BINLOG, server = %self.url, deleted = doomed.len(), "old backup binlogs removed");
        }
        Ok(doomed)
    }
}

async fn list_names(dir: &Path) -> Result<Vec<String>, BinlogError> {
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            out.push(name.to_string());
        }
    }
    out.sort();
    Ok(out)
}
