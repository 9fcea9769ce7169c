//! Bringing a former leader back as a replica.
//!
//! The crash record written at failover time tells whether the returning
//! node holds writes the new leader never received. A node that is not
//! ahead resumes replication at the sync point; one that is ahead is rolled
//! back with flashback or reseeded by one of the state-transfer methods, in
//! the configured order.

use std::path::PathBuf;
use std::sync::Arc;

use repman_core::binlog::BinlogName;
use repman_core::{Cookie, Crash, ServerState};
use serde::Serialize;
use tracing::{info, warn};

use super::Cluster;
use crate::error::RejoinError;
use crate::logging::REJOIN;
use crate::monitor::ServerMonitor;
use crate::traits::ToolCommand;

/// How a node rejoined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejoinMethod {
    /// The node was the leader and took its place back.
    Restored,
    SyncPoint,
    Flashback,
    ZfsSnapback,
    Mysqldump,
    LogicalBackup,
    PhysicalBackup,
    Script,
}

impl RejoinMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Restored => "restored",
            Self::SyncPoint => "sync-point",
            Self::Flashback => "flashback",
            Self::ZfsSnapback => "zfs-snapback",
            Self::Mysqldump => "mysqldump",
            Self::LogicalBackup => "logical-backup",
            Self::PhysicalBackup => "physical-backup",
            Self::Script => "script",
        }
    }
}

impl std::fmt::Display for RejoinMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Cluster {
    /// Rejoins `node` under the current leader.
    ///
    /// # Errors
    ///
    /// [`RejoinError::NoMaster`] without a leader, [`RejoinError::NoMethod`]
    /// when no crash record or enabled method applies, and
    /// [`RejoinError::WaitingBackup`] when a logical reseed awaits a backup.
    pub async fn rejoin(&self, node: &Arc<ServerMonitor>) -> Result<RejoinMethod, RejoinError> {
        let method = match self.master() {
            Some(m) if m.url == node.url => self.restore_leader(node).await?,
            Some(master) => self.rejoin_under(node, &master).await?,
            None => {
                let last = self.lastmaster();
                if last.as_ref().is_some_and(|l| l.url == node.url) {
                    self.restore_leader(node).await?
                } else {
                    return Err(RejoinError::NoMaster(node.url.clone()));
                }
            }
        };
        if method != RejoinMethod::Restored {
            node.set_state(ServerState::Slave);
        }
        self.ctx.rejoin_cond.send(true);
        metrics::counter!("repman_rejoins_total", "method" => method.as_str()).increment(1);
        info!(target: REJOIN, server = %node.url, method = %method, "rejoin done");
        Ok(method)
    }

    /// The returning node is still the recorded leader: make it writable
    /// and clear the cluster-down markers.
    async fn restore_leader(&self, node: &Arc<ServerMonitor>) -> Result<RejoinMethod, RejoinError> {
        if node.view().read_only && self.ctx.is_active() {
            node.set_read_write().await?;
        }
        node.set_state(ServerState::Master);
        let mut inner = self.inner.lock();
        inner.master = Some(Arc::clone(node));
        inner.lastmaster = None;
        inner.is_down = false;
        Ok(RejoinMethod::Restored)
    }

    async fn rejoin_under(
        &self,
        node: &Arc<ServerMonitor>,
        master: &Arc<ServerMonitor>,
    ) -> Result<RejoinMethod, RejoinError> {
        let Some(crash) = self.inner.lock().crashes.latest_for(&node.url).cloned() else {
            self.ctx.sme.raise_for("ERR00066", &node.url, &[&node.url]);
            return Err(RejoinError::NoMethod(node.url.clone()));
        };
        let view = node.view();
        let gtid_mode = crash.used_gtid_at_election();
        let cascading = !crash.covers_server(view.server_id);
        let ahead = if gtid_mode {
            view.current_gtid.seq_for_server(view.server_id) > crash.failover_io_gtid.seq_for_server(view.server_id)
        } else {
            position_ahead(&view.binary_log_file, view.binary_log_pos, &crash)
        };
        info!(target: REJOIN, server = %node.url, master = %master.url, gtid_mode, ahead, cascading, "rejoin started");

        if !ahead && !cascading {
            self.rejoin_sync_point(node, master, &crash, gtid_mode).await?;
            return Ok(RejoinMethod::SyncPoint);
        }

        let config = self.ctx.config();
        let want_flashback = config.autorejoin_flashback && gtid_mode && !cascading;
        let saved = if config.autorejoin_backup_binlog || want_flashback {
            self.download_ahead_events(node, &crash).await
        } else {
            Vec::new()
        };

        let method = if want_flashback && !saved.is_empty() {
            match self.rejoin_flashback(node, master, &crash, &saved).await {
                Ok(()) => Some(RejoinMethod::Flashback),
                Err(e) => {
                    warn!(target: REJOIN, server = %node.url, error = %e, "flashback failed, trying state transfer");
                    None
                }
            }
        } else {
            None
        };
        let method = match method {
            Some(m) => m,
            None => self.rejoin_state_transfer(node, master).await?,
        };
        if config.autorejoin_backup_binlog {
            self.archive_crash_binlogs(&saved).await?;
        }
        Ok(method)
    }

    async fn rejoin_sync_point(
        &self,
        node: &ServerMonitor,
        master: &ServerMonitor,
        crash: &Crash,
        gtid_mode: bool,
    ) -> Result<(), RejoinError> {
        if gtid_mode {
            let current = node.view().current_gtid;
            if node.version().is_mariadb() && !current.is_empty() {
                node.stop_slave().await?;
                node.set_gtid_slave_pos(&current).await?;
            }
            node.set_replication_gtid_slave_pos_from_server(master).await?;
        } else {
            node.set_replication_positional(master, &crash.new_master_log_file, crash.new_master_log_pos)
                .await?;
        }
        Ok(())
    }

    /// Downloads the events the node wrote past the crash point. Returns the
    /// local files; failures are logged and yield nothing.
    async fn download_ahead_events(&self, node: &ServerMonitor, crash: &Crash) -> Vec<PathBuf> {
        let config = self.ctx.config();
        let (file, pos) = if crash.failover_master_log_file.is_empty() {
            let v = node.view();
            (v.binary_log_file.clone(), 4)
        } else {
            (crash.failover_master_log_file.clone(), crash.failover_master_log_pos)
        };
        if file.is_empty() {
            return Vec::new();
        }
        let prefix = config
            .working_dir
            .join(format!("{}-server{}-", config.name, node.server_id()));
        match self
            .ctx
            .collab
            .binlog_reader
            .download(&node.binlog_source(), &file, pos, &prefix)
            .await
        {
            Ok(files) => files,
            Err(e) => {
                warn!(target: REJOIN, server = %node.url, error = %e, "could not save events ahead of the crash");
                Vec::new()
            }
        }
    }

    async fn rejoin_flashback(
        &self,
        node: &ServerMonitor,
        master: &ServerMonitor,
        crash: &Crash,
        files: &[PathBuf],
    ) -> Result<(), RejoinError> {
        let reader = Arc::clone(&self.ctx.collab.binlog_reader);
        let target = node.binlog_source();
        for file in files.iter().rev() {
            reader
                .flashback(file, &target)
                .await
                .map_err(|e| RejoinError::Flashback {
                    url: node.url.clone(),
                    reason: e.to_string(),
                })?;
        }
        node.stop_slave().await?;
        node.set_gtid_slave_pos(&crash.failover_io_gtid).await?;
        node.set_replication_gtid_slave_pos_from_server(master).await?;
        Ok(())
    }

    /// Reseeds the node with the first enabled transfer method.
    async fn rejoin_state_transfer(
        &self,
        node: &Arc<ServerMonitor>,
        master: &Arc<ServerMonitor>,
    ) -> Result<RejoinMethod, RejoinError> {
        let config = self.ctx.config();
        if config.autorejoin_zfs_flashback {
            let id = node.job_zfs_snapback().await?;
            Self::restart_after_job(node, master, id).await?;
            return Ok(RejoinMethod::ZfsSnapback);
        }
        if config.autorejoin_mysqldump {
            self.rejoin_mysqldump(node, master).await?;
            return Ok(RejoinMethod::Mysqldump);
        }
        if config.autorejoin_logical_backup {
            if !master.has_cookie(Cookie::LogicalBackup).await {
                node.set_cookie(Cookie::WaitBackup).await?;
                return Err(RejoinError::WaitingBackup(node.url.clone()));
            }
            let id = node.job_reseed_logical_backup(master).await?;
            Self::restart_after_job(node, master, id).await?;
            return Ok(RejoinMethod::LogicalBackup);
        }
        if config.autorejoin_physical_backup {
            let id = node.job_reseed_physical_backup(master).await?;
            Self::restart_after_job(node, master, id).await?;
            return Ok(RejoinMethod::PhysicalBackup);
        }
        if let Some(script) = config.autorejoin_script.as_ref().or(config.rejoin_script.as_ref()) {
            let cmd = ToolCommand::new(script).arg(node.host.clone()).arg(master.host.clone());
            self.ctx
                .collab
                .scripts
                .run(&cmd)
                .await
                .map_err(|e| RejoinError::Tool {
                    url: node.url.clone(),
                    reason: e.to_string(),
                })?;
            return Ok(RejoinMethod::Script);
        }
        self.ctx.sme.raise_for("ERR00066", &node.url, &[&node.url]);
        Err(RejoinError::NoMethod(node.url.clone()))
    }

    /// Points the node at the leader once its restore job is queued and
    /// leaves the channel stopped; a background callback starts it when job
    /// `id` succeeds.
    async fn restart_after_job(node: &Arc<ServerMonitor>, master: &ServerMonitor, id: i64) -> Result<(), RejoinError> {
        node.stop_slave().await?;
        node.prepare_replication_from(master).await?;
        let node = Arc::clone(node);
        tokio::spawn(async move {
            match node.start_slave_callback(id).await {
                Ok(state) => info!(target: REJOIN, server = %node.url, id, state = ?state, "restore job finished"),
                Err(e) => warn!(target: REJOIN, server = %node.url, id, error = %e, "restore job not confirmed"),
            }
        });
        Ok(())
    }

    /// Streams a dump of the leader into the node, then replicates from the
    /// GTID position captured before the dump started.
    async fn rejoin_mysqldump(&self, node: &ServerMonitor, master: &ServerMonitor) -> Result<(), RejoinError> {
        let config = self.ctx.config();
        node.stop_slave().await?;
        node.reset_master().await?;
        master.refresh().await?;
        let at = master.view().gtid_binlog_pos;
        let src = master.binlog_source();
        let dst = node.binlog_source();
        let dump = ToolCommand::new(&config.tools.mysqldump)
            .arg(format!("--host={}", src.host))
            .arg(format!("--port={}", src.port))
            .arg(format!("--user={}", src.user))
            .env("MYSQL_PWD", src.password)
            .args(["--all-databases", "--single-transaction", "--routines", "--events", "--gtid"]);
        let load = ToolCommand::new(&config.tools.mysql_client)
            .arg(format!("--host={}", dst.host))
            .arg(format!("--port={}", dst.port))
            .arg(format!("--user={}", dst.user))
            .env("MYSQL_PWD", dst.password);
        self.ctx
            .collab
            .scripts
            .pipe(&dump, &load)
            .await
            .map_err(|e| RejoinError::Tool {
                url: node.url.clone(),
                reason: e.to_string(),
            })?;
        if !at.is_empty() {
            node.set_gtid_slave_pos(&at).await?;
        }
        node.set_replication_gtid_slave_pos_from_server(master).await?;
        Ok(())
    }

    /// Moves saved events into `<working dir>/<cluster>/crash-bin-<ts>/`.
    async fn archive_crash_binlogs(&self, files: &[PathBuf]) -> Result<(), RejoinError> {
        if files.is_empty() {
            return Ok(());
        }
        let config = self.ctx.config();
        let dir = config
            .working_dir
            .join(&config.name)
            .join(format!("crash-bin-{}", chrono::Utc::now().format("%Y%m%d%H%M%S")));
        tokio::fs::create_dir_all(&dir).await?;
        for f in files {
            let Some(name) = f.file_name() else {
                continue;
            };
            tokio::fs::rename(f, dir.join(name)).await?;
        }
        info!(target: REJOIN, dir = %dir.display(), count = files.len(), "events ahead of the crash archived");
        Ok(())
    }
}

/// Whether `file:pos` lies past the coordinates recorded in `crash`.
fn position_ahead(file: &str, pos: u64, crash: &Crash) -> bool {
    if crash.failover_master_log_file.is_empty() || file.is_empty() {
        return false;
    }
    let suffix = |f: &str| f.parse::<BinlogName>().map_or(0, |b| b.suffix);
    (suffix(file), pos) > (suffix(&crash.failover_master_log_file), crash.failover_master_log_pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crash(file: &str, pos: u64) -> Crash {
        Crash {
            failover_master_log_file: file.into(),
            failover_master_log_pos: pos,
            ..Crash::default()
        }
    }

    #[test]
    fn positional_ahead_compares_file_then_position() {
        let c = crash("mysql-bin.000004", 1200);
        assert!(position_ahead("mysql-bin.000005", 4, &c));
        assert!(position_ahead("mysql-bin.000004", 1300, &c));
        assert!(!position_ahead("mysql-bin.000004", 1200, &c));
        assert!(!position_ahead("mysql-bin.000003", 9000, &c));
    }

    #[test]
    fn positional_without_record_is_not_ahead() {
        assert!(!position_ahead("mysql-bin.000009", 4, &crash("", 0)));
    }

    #[test]
    fn method_labels() {
        assert_eq!(RejoinMethod::SyncPoint.to_string(), "sync-point");
        assert_eq!(RejoinMethod::Flashback.as_str(), "flashback");
    }
}
