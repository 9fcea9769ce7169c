//! Node-level actions: read-only toggles, replication source changes,
//! table locks and credential rotation.

use std::time::Duration;

use repman_core::{ChangeSourceOptions, GtidList, ReplicationMode, ServerState};
use tracing::{info, warn};

use super::ServerMonitor;
use crate::db::sql;
use crate::error::MonitorError;
use crate::logging::MONITOR;

impl ServerMonitor {
    /// Makes the node read-only, using `super_read_only` when configured and
    /// supported.
    ///
    /// # Errors
    ///
    /// Fails when the node is not connected or the statement fails.
    pub async fn set_read_only(&self) -> Result<(), MonitorError> {
        let session = self.session()?;
        if self.ctx.config().super_read_only && self.version().has_super_read_only() {
            session.set_super_read_only(true).await?;
        } else {
            session.set_read_only(true).await?;
        }
        self.update(|v| v.read_only = true);
        Ok(())
    }

    /// Makes the node writable.
    ///
    /// # Errors
    ///
    /// [`MonitorError::ArbitrationLost`] when this instance lost arbitration.
    pub async fn set_read_write(&self) -> Result<(), MonitorError> {
        if self.ctx.is_arbitration_lost() {
            return Err(MonitorError::ArbitrationLost(self.url.clone()));
        }
        self.session()?.set_read_only(false).await?;
        self.update(|v| v.read_only = false);
        Ok(())
    }

    /// Enters or leaves maintenance.
    pub fn set_maintenance(&self, on: bool) {
        info!(target: MONITOR, server = %self.url, on, "maintenance");
        self.update(|v| {
            v.is_maintenance = on;
            if on {
                v.state = ServerState::Maintenance;
            } else if v.state == ServerState::Maintenance {
                v.state = v.prev_state;
            }
        });
    }

    /// # Errors
    ///
    /// Fails when the node is not connected or the statement fails.
    pub async fn stop_slave(&self) -> Result<(), MonitorError> {
        self.session()?.stop_replica(&self.channel(), &self.version()).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails when the node is not connected or the statement fails.
    pub async fn start_slave(&self) -> Result<(), MonitorError> {
        self.session()?.start_replica(&self.channel(), &self.version()).await?;
        Ok(())
    }

    /// `RESET SLAVE [ALL]` on the configured channel. The channel must be
    /// stopped.
    ///
    /// # Errors
    ///
    /// Fails when the node is not connected or the statement fails.
    pub async fn reset_slave(&self, all: bool) -> Result<(), MonitorError> {
        self.session()?
            .reset_replica(&self.channel(), all, &self.version())
            .await?;
        if all {
            let channel = self.channel();
            self.update(|v| {
                v.replications.retain(|r| r.channel != channel);
                v.is_slave = false;
            });
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Fails when the node is not connected or the statement fails.
    pub async fn reset_master(&self) -> Result<(), MonitorError> {
        self.session()?.reset_master().await?;
        Ok(())
    }

    /// Change-source options towards `host:port` with the cluster's
    /// replication credentials, heartbeat and TLS settings.
    #[must_use]
    pub fn source_options(&self, host: &str, port: u16, mode: ReplicationMode) -> ChangeSourceOptions {
        let config = self.ctx.config();
        let (user, password) = self.ctx.rpl_credentials();
        let mut opts = ChangeSourceOptions::new(host, port, mode)
            .credentials(user, password)
            .channel(config.replication_source_name.clone());
        if config.force_slave_heartbeat {
            opts.heartbeat = config.force_slave_heartbeat_time;
            opts.retry = config.force_slave_heartbeat_retry;
        }
        opts.ssl = config.replication_ssl;
        opts
    }

    /// Stops the channel, points it at `opts` and starts it again.
    ///
    /// # Errors
    ///
    /// Fails on the first statement that fails; the channel is left stopped.
    pub async fn change_source_to(&self, opts: &ChangeSourceOptions) -> Result<(), MonitorError> {
        let session = self.session()?;
        let version = self.version();
        session.stop_replica(&opts.channel, &version).await?;
        session.change_source(opts, &version).await?;
        session.start_replica(&opts.channel, &version).await?;
        info!(target: MONITOR, server = %self.url, source = %format!("{}:{}", opts.host, opts.port), mode = %opts.mode, "replication source changed");
        Ok(())
    }

    /// Replicates from `master` resuming from this node's own GTID slave
    /// position (MariaDB) or with auto-positioning (MySQL).
    ///
    /// # Errors
    ///
    /// Fails when a statement fails.
    pub async fn set_replication_gtid_slave_pos_from_server(&self, master: &ServerMonitor) -> Result<(), MonitorError> {
        let mode = if self.version().is_mariadb() {
            ReplicationMode::SlavePos
        } else {
            ReplicationMode::MasterAutoPosition
        };
        self.change_source_to(&self.source_options(&master.host, master.port, mode))
            .await
    }

    /// Points the stopped channel at `master` by GTID slave position without
    /// starting it. Used ahead of a restore job that starts the channel once
    /// the data is in place.
    ///
    /// # Errors
    ///
    /// Fails when a statement fails.
    pub async fn prepare_replication_from(&self, master: &ServerMonitor) -> Result<(), MonitorError> {
        let mode = if self.version().is_mariadb() {
            ReplicationMode::SlavePos
        } else {
            ReplicationMode::MasterAutoPosition
        };
        let opts = self.source_options(&master.host, master.port, mode);
        let session = self.session()?;
        let version = self.version();
        session.stop_replica(&opts.channel, &version).await?;
        session.change_source(&opts, &version).await?;
        info!(target: MONITOR, server = %self.url, source = %master.url, "replication source set, waiting for restore");
        Ok(())
    }

    /// Replicates from `master` resuming from this node's current GTID
    /// position, the way a former leader rejoins. Servers without GTID
    /// resume at `master`'s current binlog coordinates.
    ///
    /// # Errors
    ///
    /// Fails when a statement fails.
    pub async fn set_replication_gtid_current_pos_from_server(
        &self,
        master: &ServerMonitor,
    ) -> Result<(), MonitorError> {
        let version = self.version();
        let mode = if version.has_mariadb_gtid() {
            ReplicationMode::CurrentPos
        } else if version.has_mysql_gtid() && self.view().have_mysql_gtid {
            ReplicationMode::MasterAutoPosition
        } else {
            let m = master.view();
            return self
                .set_replication_positional(master, &m.binary_log_file, m.binary_log_pos)
                .await;
        };
        self.change_source_to(&self.source_options(&master.host, master.port, mode))
            .await
    }

    /// Replicates from `master` starting at `file:pos`.
    ///
    /// # Errors
    ///
    /// Fails when a statement fails.
    pub async fn set_replication_positional(
        &self,
        master: &ServerMonitor,
        file: &str,
        pos: u64,
    ) -> Result<(), MonitorError> {
        let mode = if master.view().is_maxscale {
            ReplicationMode::Mxs
        } else {
            ReplicationMode::Positional
        };
        let opts = self
            .source_options(&master.host, master.port, mode)
            .position(file, pos);
        self.change_source_to(&opts).await
    }

    /// Re-issues the change-source statement for the channel's current
    /// source with `mode` and the credentials now in effect.
    ///
    /// # Errors
    ///
    /// [`MonitorError::ChannelNotFound`] when the node does not replicate.
    pub async fn repoint_channel(&self, mode: ReplicationMode) -> Result<(), MonitorError> {
        let r = self.replication_status(&self.channel())?;
        let opts = self.source_options(&r.master_host, r.master_port, mode);
        self.change_source_to(&opts).await
    }

    /// # Errors
    ///
    /// Fails when a channel is running or the statement fails.
    pub async fn set_gtid_slave_pos(&self, gtid: &GtidList) -> Result<(), MonitorError> {
        self.session()?.set_gtid_slave_pos(gtid).await?;
        Ok(())
    }

    /// Skips one event on the stopped SQL thread.
    ///
    /// # Errors
    ///
    /// Fails when the statement fails.
    pub async fn skip_replication_event(&self) -> Result<(), MonitorError> {
        self.session()?.skip_replication_event(&self.channel()).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails when the statement fails.
    pub async fn flush_tables(&self) -> Result<(), MonitorError> {
        self.session()?.flush_tables().await?;
        Ok(())
    }

    /// `FLUSH TABLES WITH READ LOCK`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// [`crate::error::DbError::Timeout`] when the lock is not granted in time.
    pub async fn flush_tables_with_read_lock(&self, timeout: Duration) -> Result<(), MonitorError> {
        let session = self.session()?;
        match tokio::time::timeout(timeout, session.flush_tables_with_read_lock()).await {
            Ok(res) => res?,
            Err(_) => return Err(crate::error::DbError::Timeout(timeout).into()),
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Fails when the statement fails.
    pub async fn unlock_tables(&self) -> Result<(), MonitorError> {
        self.session()?.unlock_tables().await?;
        Ok(())
    }

    /// Rotates to a new binlog.
    ///
    /// # Errors
    ///
    /// Fails when the statement fails.
    pub async fn flush_logs(&self) -> Result<(), MonitorError> {
        self.session()?.flush_logs().await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails when the statement fails.
    pub async fn set_event_scheduler(&self, on: bool) -> Result<(), MonitorError> {
        self.session()?
            .set_global("event_scheduler", if on { "ON" } else { "OFF" })
            .await?;
        Ok(())
    }

    /// Applies a new replication password: a leader alters every account of
    /// the replication user, a replica re-points its channel with the new
    /// credentials.
    ///
    /// # Errors
    ///
    /// Fails on the first statement that fails.
    pub async fn rotate_replication_password(&self, password: &str) -> Result<(), MonitorError> {
        let view = self.view();
        let session = self.session()?;
        if view.is_master() {
            let (user, _) = self.ctx.rpl_credentials();
            for account in view.users.iter().filter(|u| u.user == user) {
                session
                    .exec(&sql::alter_user_password(&account.user, &account.host, password), false)
                    .await?;
            }
        }
        if let Some(r) = view.replication(&self.channel()) {
            let mode = if r.uses_gtid() {
                if self.version().is_mariadb() {
                    ReplicationMode::SlavePos
                } else {
                    ReplicationMode::MasterAutoPosition
                }
            } else {
                ReplicationMode::Positional
            };
            let mut opts = self.source_options(&r.master_host, r.master_port, mode);
            opts.password = password.to_string();
            if mode == ReplicationMode::Positional {
                opts = opts.position(r.relay_master_log_file.clone(), r.exec_master_log_pos);
            }
            if let Err(e) = self.change_source_to(&opts).await {
                warn!(target: MONITOR, server = %self.url, error = %e, "could not apply new replication password");
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::testutil::context;
    use super::*;
    use crate::context::Arbitration;
    use crate::db::fake::FakeFleet;
    use crate::db::DbUser;

    async fn pinged(fleet: &FakeFleet, dir: &std::path::Path, url: &str, f: impl FnOnce(&mut crate::config::ClusterConfig)) -> Arc<ServerMonitor> {
        let m = ServerMonitor::new(context(fleet, dir, f), url);
        m.ping(None).await;
        m
    }

    #[tokio::test]
    async fn read_only_prefers_super_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        fleet.with_node(&a, |n| {
            n.version = "8.0.36".into();
            n.version_comment = "MySQL Community Server - GPL".into();
        });
        let m = pinged(&fleet, dir.path(), &a, |c| c.super_read_only = true).await;
        m.set_read_only().await.unwrap();
        let node = fleet.node(&a).unwrap();
        assert!(node.super_read_only);
        assert!(node.read_only);
        assert!(m.view().read_only);
    }

    #[tokio::test]
    async fn read_write_refused_after_arbitration_loss() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let m = pinged(&fleet, dir.path(), &a, |c| c.arbitration = true).await;
        m.ctx.set_arbitration(Arbitration {
            lost_majority: true,
            ..Arbitration::default()
        });
        let err = m.set_read_write().await.unwrap_err();
        assert!(matches!(err, MonitorError::ArbitrationLost(_)));
        assert!(!fleet.received(&a, "read_only=0") && !fleet.received(&a, "READ_ONLY=0"));
    }

    #[tokio::test]
    async fn gtid_slave_pos_change_restarts_channel() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        let c = fleet.add_mariadb("c", 3306, 3);
        fleet.replicate(&b, &a);
        let ctx = context(&fleet, dir.path(), |_| {});
        let mb = ServerMonitor::new(Arc::clone(&ctx), &b);
        let mc = ServerMonitor::new(ctx, &c);
        mb.ping(Some(1)).await;
        mc.ping(Some(1)).await;
        mb.set_replication_gtid_slave_pos_from_server(&mc).await.unwrap();
        let ch = fleet.node(&b).unwrap().channel("").cloned().unwrap();
        assert_eq!(ch.opts.host, "c");
        assert_eq!(ch.opts.mode, ReplicationMode::SlavePos);
        assert_eq!(ch.opts.password, "repl");
        assert!(ch.started);
    }

    #[tokio::test]
    async fn heartbeat_forced_into_source_options() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let m = pinged(&fleet, dir.path(), &a, |c| {
            c.force_slave_heartbeat = true;
            c.force_slave_heartbeat_time = 1;
            c.force_slave_heartbeat_retry = 7;
            c.replication_ssl = true;
        })
        .await;
        let opts = m.source_options("b", 3307, ReplicationMode::CurrentPos);
        assert_eq!((opts.heartbeat, opts.retry), (1, 7));
        assert!(opts.ssl);
        assert_eq!(opts.user, "repl");
    }

    #[tokio::test]
    async fn rotation_alters_users_on_leader_and_repoints_replica() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        fleet.replicate(&b, &a);
        fleet.with_node(&a, |n| {
            n.users.push(DbUser {
                user: "repl".into(),
                host: "%".into(),
                password: String::new(),
            });
        });
        let ctx = context(&fleet, dir.path(), |_| {});
        let ma = ServerMonitor::new(Arc::clone(&ctx), &a);
        let mb = ServerMonitor::new(ctx, &b);
        ma.ping(Some(1)).await;
        ma.set_state(ServerState::Master);
        mb.ping(Some(1)).await;
        ma.rotate_replication_password("n3w").await.unwrap();
        mb.rotate_replication_password("n3w").await.unwrap();
        assert!(fleet.received(&a, "ALTER USER 'repl'@'%'"));
        let ch = fleet.node(&b).unwrap().channel("").cloned().unwrap();
        assert_eq!(ch.opts.password, "n3w");
        assert!(ch.started);
    }

    #[tokio::test]
    async fn maintenance_restores_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let m = pinged(&fleet, dir.path(), &a, |_| {}).await;
        m.update(|v| v.prev_state = ServerState::Slave);
        m.set_maintenance(true);
        assert_eq!(m.state(), ServerState::Maintenance);
        m.set_maintenance(false);
        assert_eq!(m.state(), ServerState::Slave);
    }
}
