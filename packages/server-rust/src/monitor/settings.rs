//! Audit of durability and replication settings against the force flags.
//!
//! A wrong value raises the role-specific warning. When the matching force
//! flag is on and the cluster is active, the value is also corrected.

use repman_core::{ReplicationMode, ReplicationStatus};
use tracing::{info, warn};

use super::{NodeView, ServerMonitor};
use crate::config::ClusterConfig;
use crate::db::{var_on, var_u64};
use crate::logging::MONITOR;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Replica,
    Leader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Setting {
    Semisync,
    BinlogRow,
    Heartbeat,
    Gtid,
    InnodbSync,
    BinlogSync,
    Checksum,
    SlowQueries,
    Annotate,
    Compress,
    LogSlaveUpdates,
    GtidStrict,
}

impl Setting {
    const ALL: [Setting; 12] = [
        Self::Semisync,
        Self::BinlogRow,
        Self::Heartbeat,
        Self::Gtid,
        Self::InnodbSync,
        Self::BinlogSync,
        Self::Checksum,
        Self::SlowQueries,
        Self::Annotate,
        Self::Compress,
        Self::LogSlaveUpdates,
        Self::GtidStrict,
    ];

    fn code(self, role: Role) -> Option<&'static str> {
        match (self, role) {
            (Self::Semisync, Role::Replica) => Some("WARN0048"),
            (Self::BinlogRow, Role::Replica) => Some("WARN0049"),
            (Self::Heartbeat, Role::Replica) => Some("WARN0050"),
            (Self::Gtid, Role::Replica) => Some("WARN0051"),
            (Self::InnodbSync, Role::Replica) => Some("WARN0052"),
            (Self::Checksum, Role::Replica) => Some("WARN0053"),
            (Self::SlowQueries, Role::Replica) => Some("WARN0054"),
            (Self::Annotate, Role::Replica) => Some("WARN0055"),
            (Self::Compress, Role::Replica) => Some("WARN0056"),
            (Self::LogSlaveUpdates, Role::Replica) => Some("WARN0057"),
            (Self::GtidStrict, Role::Replica) => Some("WARN0058"),
            (Self::Semisync, Role::Leader) => Some("WARN0060"),
            (Self::BinlogRow, Role::Leader) => Some("WARN0061"),
            (Self::BinlogSync, Role::Leader) => Some("WARN0062"),
            (Self::InnodbSync, Role::Leader) => Some("WARN0064"),
            (Self::Checksum, Role::Leader) => Some("WARN0065"),
            (Self::Annotate, Role::Leader) => Some("WARN0067"),
            (Self::Compress, Role::Leader) => Some("WARN0068"),
            (Self::LogSlaveUpdates, Role::Leader) => Some("WARN0069"),
            (Self::GtidStrict, Role::Leader) => Some("WARN0070"),
            _ => None,
        }
    }

    /// Whether the setting is audited at all under `cfg`.
    fn audited(self, cfg: &ClusterConfig) -> bool {
        match self {
            Self::BinlogRow => cfg.autorejoin_flashback || cfg.force_binlog_row,
            Self::LogSlaveUpdates => true,
            _ => self.enforced(cfg),
        }
    }

    fn enforced(self, cfg: &ClusterConfig) -> bool {
        match self {
            Self::Semisync => cfg.force_slave_semisync,
            Self::BinlogRow => cfg.force_binlog_row,
            Self::Heartbeat => cfg.force_slave_heartbeat,
            Self::Gtid => cfg.force_slave_gtid,
            Self::InnodbSync => cfg.force_sync_innodb,
            Self::BinlogSync => cfg.force_sync_binlog,
            Self::Checksum => cfg.force_binlog_checksum,
            Self::SlowQueries => cfg.force_binlog_slowqueries,
            Self::Annotate => cfg.force_binlog_annotate,
            Self::Compress => cfg.force_binlog_compress,
            Self::LogSlaveUpdates => false,
            Self::GtidStrict => cfg.force_slave_gtid_strict,
        }
    }

    /// `None` when the setting does not apply to this server.
    fn is_ok(self, v: &NodeView, r: Option<&ReplicationStatus>, role: Role, cfg: &ClusterConfig) -> Option<bool> {
        let vars = &v.variables;
        let upper = |name: &str| name.to_ascii_uppercase();
        Some(match self {
            Self::Semisync => {
                let name = match role {
                    Role::Replica => v.version.semisync_slave_variable(),
                    Role::Leader => v.version.semisync_master_variable(),
                };
                var_on(vars, &upper(name))
            }
            Self::BinlogRow => vars.get("BINLOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("ROW")),
            Self::Heartbeat => r?.heartbeat_period <= f64::from(cfg.force_slave_heartbeat_time),
            Self::Gtid => r?.uses_gtid(),
            Self::InnodbSync => var_u64(vars, "INNODB_FLUSH_LOG_AT_TRX_COMMIT") == 1,
            Self::BinlogSync => var_u64(vars, "SYNC_BINLOG") == 1,
            Self::Checksum => vars.get("BINLOG_CHECKSUM").is_some_and(|c| c.eq_ignore_ascii_case("CRC32")),
            Self::SlowQueries => var_on(vars, "LOG_SLOW_SLAVE_STATEMENTS") || var_on(vars, "LOG_SLOW_REPLICA_STATEMENTS"),
            Self::Annotate if v.version.is_mariadb() => var_on(vars, "BINLOG_ANNOTATE_ROW_EVENTS"),
            Self::Compress if v.version.has_binlog_compress() => var_on(vars, "LOG_BIN_COMPRESS"),
            Self::LogSlaveUpdates => var_on(vars, "LOG_SLAVE_UPDATES") || var_on(vars, "LOG_REPLICA_UPDATES"),
            Self::GtidStrict if v.version.is_mariadb() => var_on(vars, "GTID_STRICT_MODE"),
            Self::Annotate | Self::Compress | Self::GtidStrict => return None,
        })
    }

    /// Global variable assignment correcting the setting, if one exists.
    fn fix(self, v: &NodeView, role: Role) -> Option<(String, &'static str)> {
        let var = match self {
            Self::Semisync => match role {
                Role::Replica => v.version.semisync_slave_variable(),
                Role::Leader => v.version.semisync_master_variable(),
            },
            Self::BinlogRow => return Some(("binlog_format".into(), "ROW")),
            Self::InnodbSync => return Some(("innodb_flush_log_at_trx_commit".into(), "1")),
            Self::BinlogSync => return Some(("sync_binlog".into(), "1")),
            Self::Checksum => return Some(("binlog_checksum".into(), "CRC32")),
            Self::SlowQueries => "log_slow_slave_statements",
            Self::Annotate => "binlog_annotate_row_events",
            Self::Compress => "log_bin_compress",
            Self::GtidStrict => "gtid_strict_mode",
            Self::Heartbeat | Self::Gtid | Self::LogSlaveUpdates => return None,
        };
        Some((var.to_string(), "ON"))
    }
}

impl NodeView {
    /// Both `sync_binlog` and InnoDB log flushing are durable.
    #[must_use]
    pub fn is_acid(&self) -> bool {
        var_u64(&self.variables, "SYNC_BINLOG") == 1 && var_u64(&self.variables, "INNODB_FLUSH_LOG_AT_TRX_COMMIT") == 1
    }
}

impl ServerMonitor {
    /// Audits this node as a replica. Returns the raised codes.
    pub async fn check_replica_settings(&self) -> Vec<&'static str> {
        let raised = self.audit(Role::Replica).await;
        let config = self.ctx.config();
        if config.force_slave_readonly && self.ctx.is_active() && !self.view().read_only {
            info!(target: MONITOR, server = %self.url, "enforcing read-only on replica");
            if let Err(e) = self.set_read_only().await {
                warn!(target: MONITOR, server = %self.url, error = %e, "could not enforce read-only");
            }
        }
        raised
    }

    /// Audits this node as the leader. Returns the raised codes.
    pub async fn check_master_settings(&self) -> Vec<&'static str> {
        self.audit(Role::Leader).await
    }

    async fn audit(&self, role: Role) -> Vec<&'static str> {
        let config = self.ctx.config();
        let view = self.view();
        let channel = view.replication(&config.replication_source_name).cloned();
        let mut raised = Vec::new();
        for setting in Setting::ALL {
            let Some(code) = setting.code(role) else {
                continue;
            };
            if !setting.audited(&config) {
                continue;
            }
            if setting.is_ok(&view, channel.as_ref(), role, &config) != Some(false) {
                continue;
            }
            self.ctx.sme.raise_for(code, &self.url, &[&self.url]);
            raised.push(code);
            if setting.enforced(&config) && self.ctx.is_active() {
                self.enforce(setting, role, &view, channel.as_ref()).await;
            }
        }
        raised
    }

    async fn enforce(&self, setting: Setting, role: Role, view: &NodeView, channel: Option<&ReplicationStatus>) {
        let result = match (setting, channel) {
            (Setting::Gtid, Some(_)) => {
                let mode = if view.version.is_mariadb() {
                    ReplicationMode::SlavePos
                } else {
                    ReplicationMode::MasterAutoPosition
                };
                self.repoint_channel(mode).await
            }
            (Setting::Heartbeat, Some(r)) => {
                let mode = if !r.uses_gtid() {
                    ReplicationMode::Positional
                } else if r.using_gtid == "Current_Pos" {
                    ReplicationMode::CurrentPos
                } else if view.version.is_mariadb() {
                    ReplicationMode::SlavePos
                } else {
                    ReplicationMode::MasterAutoPosition
                };
                if mode == ReplicationMode::Positional {
                    let opts = self
                        .source_options(&r.master_host, r.master_port, mode)
                        .position(r.relay_master_log_file.clone(), r.exec_master_log_pos);
                    self.change_source_to(&opts).await
                } else {
                    self.repoint_channel(mode).await
                }
            }
            _ => {
                let Some((var, value)) = setting.fix(view, role) else {
                    return;
                };
                match self.session() {
                    Ok(s) => s.set_global(&var, value).await.map_err(Into::into),
                    Err(e) => Err(e),
                }
            }
        };
        match result {
            Ok(()) => info!(target: MONITOR, server = %self.url, setting = ?setting, "setting enforced"),
            Err(e) => warn!(target: MONITOR, server = %self.url, setting = ?setting, error = %e, "could not enforce setting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::context;
    use super::*;
    use crate::db::fake::FakeFleet;

    #[tokio::test]
    async fn durable_defaults_raise_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let m = ServerMonitor::new(context(&fleet, dir.path(), |c| c.force_sync_innodb = true), &a);
        m.ping(None).await;
        assert!(m.check_master_settings().await.is_empty());
        assert!(m.view().is_acid());
    }

    #[tokio::test]
    async fn forced_replica_settings_are_corrected() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        fleet.replicate(&b, &a);
        fleet.with_node(&b, |n| {
            n.vars.insert("INNODB_FLUSH_LOG_AT_TRX_COMMIT".into(), "2".into());
            n.vars.insert("GTID_STRICT_MODE".into(), "OFF".into());
            n.vars.insert("LOG_SLAVE_UPDATES".into(), "OFF".into());
            n.read_only = false;
        });
        let ctx = context(&fleet, dir.path(), |c| {
            c.force_sync_innodb = true;
            c.force_slave_gtid_strict = true;
            c.force_slave_readonly = true;
        });
        let m = ServerMonitor::new(std::sync::Arc::clone(&ctx), &b);
        m.ping(Some(1)).await;
        let raised = m.check_replica_settings().await;
        assert_eq!(raised, vec!["WARN0052", "WARN0057", "WARN0058"]);
        assert!(fleet.received(&b, "SET GLOBAL innodb_flush_log_at_trx_commit=1"));
        assert!(fleet.received(&b, "SET GLOBAL gtid_strict_mode=ON"));
        assert!(fleet.node(&b).unwrap().read_only);
        assert!(ctx.sme.is_in_current_state("WARN0057"));
        assert!(!m.view().is_acid());
    }

    #[tokio::test]
    async fn positional_replica_is_moved_to_gtid() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        fleet.replicate(&b, &a);
        fleet.with_node(&b, |n| {
            if let Some(ch) = n.channel_mut("") {
                ch.opts.mode = ReplicationMode::Positional;
            }
        });
        let m = ServerMonitor::new(context(&fleet, dir.path(), |c| c.force_slave_gtid = true), &b);
        m.ping(Some(1)).await;
        assert_eq!(m.check_replica_settings().await, vec!["WARN0051"]);
        let ch = fleet.node(&b).unwrap().channel("").cloned().unwrap();
        assert_eq!(ch.opts.mode, ReplicationMode::SlavePos);
        assert!(ch.started);
    }

    #[tokio::test]
    async fn audit_without_enforcement_when_passive() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        fleet.with_node(&a, |n| {
            n.vars.insert("SYNC_BINLOG".into(), "0".into());
        });
        let ctx = context(&fleet, dir.path(), |c| c.force_sync_binlog = true);
        ctx.set_status(repman_core::MonitorStatus::Standby);
        let m = ServerMonitor::new(ctx, &a);
        m.ping(None).await;
        assert_eq!(m.check_master_settings().await, vec!["WARN0062"]);
        assert!(!fleet.received(&a, "sync_binlog"));
    }
}
