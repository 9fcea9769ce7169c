//! Ping, refresh and replication health classification.

use std::sync::LazyLock;

use regex::Regex;
use repman_core::{DbVersion, GtidList, IoThread, ReplicationStatus, ServerState};
use tracing::{debug, info, warn};

use super::{NodeView, RejoinKind, ServerMonitor};
use crate::config::ClusterConfig;
use crate::db::{var_on, var_u64, DbSession, VarMap};
use crate::error::{DbError, MonitorError};
use crate::logging::MONITOR;
use crate::traits::ToolCommand;

/// What the cluster must do after a ping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingOutcome {
    /// The node changed state in a way proxies must hear about.
    pub state_changed: bool,
    pub rejoin: Option<RejoinKind>,
}

static MAXSCALE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)maxscale").unwrap_or_else(|_| unreachable!("static regex")));

fn parse_gtid(raw: Option<&String>, mysql: bool) -> GtidList {
    let Some(raw) = raw else {
        return GtidList::default();
    };
    let parsed = if mysql {
        GtidList::parse_mysql(raw)
    } else {
        GtidList::parse(raw)
    };
    parsed.unwrap_or_default()
}

/// Health of the replication channel and the state it implies.
///
/// `master_server_id` is the `server_id` of the cluster leader when known.
/// The returned state is `view.state` when the rules do not name one.
#[must_use]
pub fn classify_replication(
    view: &NodeView,
    config: &ClusterConfig,
    in_failover: bool,
    master_server_id: Option<u64>,
) -> (ServerState, String) {
    let keep = view.state;
    if in_failover {
        return (keep, "In Failover".into());
    }
    if view.have_wsrep {
        return if view.is_wsrep_sync {
            (ServerState::Wsrep, "Galera OK".into())
        } else if view.is_wsrep_donor {
            (ServerState::WsrepDonor, "Galera OK".into())
        } else {
            (ServerState::WsrepLate, "Galera Late".into())
        };
    }
    if matches!(keep, ServerState::Suspect | ServerState::Failed) && !view.is_slave {
        return (keep, "Master OK".into());
    }
    if master_server_id.is_some_and(|id| id == view.server_id) && view.server_id != 0 {
        return (keep, "Master OK".into());
    }
    if view.is_maintenance {
        return (ServerState::Maintenance, "Maintenance".into());
    }
    let Some(r) = view.replication(&config.replication_source_name) else {
        return (keep, "Not a slave".into());
    };
    let (err, late, ok) = if view.is_relay {
        (ServerState::RelayErr, ServerState::RelayLate, ServerState::RelaySlave)
    } else {
        (ServerState::SlaveErr, ServerState::SlaveLate, ServerState::Slave)
    };
    match r.seconds_behind_master {
        None => match (r.sql_running, r.io_running) {
            (true, IoThread::No) => (err, format!("NOT OK, IO Stopped ({})", r.last_io_errno)),
            (false, IoThread::Yes) => (err, format!("NOT OK, SQL Stopped ({})", r.last_sql_errno)),
            (false, IoThread::No) => (err, "NOT OK, ALL Stopped".into()),
            (_, IoThread::Connecting) => (ok, "NOT OK, IO Connecting".into()),
            (true, IoThread::Yes) => (ok, "Running OK".into()),
        },
        Some(delay) if delay > config.fail_max_delay && config.rpl_checks => {
            (late, format!("Behind master {delay}s"))
        }
        Some(_) => (ok, "Running OK".into()),
    }
}

/// Whether `r` counts as a replica within bounds for the leader health flag.
#[must_use]
pub fn is_healthy_channel(r: &ReplicationStatus, fail_max_delay: i64) -> bool {
    r.sql_running && r.seconds_behind_master.is_some_and(|d| d <= fail_max_delay)
}

impl ServerMonitor {
    /// Opens or reuses the session, refreshes the view and classifies the
    /// node. Never fails: problems become node states and state entries.
    pub async fn ping(&self, master_server_id: Option<u64>) -> PingOutcome {
        let mut outcome = PingOutcome::default();
        if self.ctx.sme.is_in_failover() {
            return outcome;
        }
        let prev = self.update(|v| {
            v.prev_state = v.state;
            v.rejoin_pending = None;
            v.state
        });

        let probe = match self.ensure_session().await {
            Ok(session) => session.ping().await.map(|()| session),
            Err(e) => Err(e),
        };
        let session = match probe {
            Ok(s) => s,
            Err(e) => return self.on_ping_failure(prev, &e).await,
        };

        if let Err(e) = self.refresh_with(&session).await {
            warn!(target: MONITOR, server = %self.url, error = %e, "replication status unreadable");
            self.update(|v| v.state = ServerState::Suspect);
            outcome.state_changed = prev != ServerState::Suspect;
            return outcome;
        }

        let config = self.ctx.config();
        let active = self.ctx.is_active();
        let discovered = self.ctx.sme.is_discovered();
        let view = self.view();
        let (mut state, health) = classify_replication(&view, &config, false, master_server_id);
        let master_elsewhere = master_server_id.is_some_and(|id| id != view.server_id);

        if view.is_slave {
            if prev == ServerState::Failed && active {
                outcome.rejoin = Some(RejoinKind::Slave);
            }
        } else if !view.have_wsrep && !view.is_maintenance {
            if prev.is_failed_or_auth() {
                if config.read_only && discovered && master_elsewhere && active {
                    if let Err(e) = self.set_read_only().await {
                        warn!(target: MONITOR, server = %self.url, error = %e, "could not set returning node read-only");
                    }
                }
                state = ServerState::Unconn;
                if config.autorejoin && active {
                    outcome.rejoin = Some(RejoinKind::Master);
                }
            } else if prev == ServerState::Suspect && master_server_id == Some(view.server_id) {
                state = ServerState::Master;
            } else if state != ServerState::Master && prev != ServerState::Unconn {
                state = ServerState::Unconn;
                if config.read_only && master_elsewhere && !view.read_only && active {
                    if let Err(e) = self.set_read_only().await {
                        warn!(target: MONITOR, server = %self.url, error = %e, "could not set standalone node read-only");
                    }
                }
            }
        }

        self.update(|v| {
            v.state = state;
            v.replication_health = health;
            v.rejoin_pending = outcome.rejoin;
            if !state.is_down() {
                v.fail_count = 0;
            }
        });
        if state != prev {
            info!(target: MONITOR, server = %self.url, from = %prev, to = %state, "server state changed");
            outcome.state_changed = true;
            if state.is_broken() && !prev.is_broken() {
                self.process_failed_slave(prev, state).await;
            }
        }
        outcome
    }

    async fn on_ping_failure(&self, prev: ServerState, e: &DbError) -> PingOutcome {
        let mut outcome = PingOutcome::default();
        self.drop_session().await;
        if e.is_auth() {
            self.ctx.sme.raise_for("ERR00004", &self.url, &[&self.url, e]);
            self.update(|v| v.state = ServerState::ErrorAuth);
            outcome.state_changed = prev != ServerState::ErrorAuth;
            return outcome;
        }
        let heartbeat = self.ctx.sme.heartbeats();
        let state = self.update(|v| {
            v.fail_count = v.fail_count.saturating_add(1);
            v.fail_suspect_heartbeat = heartbeat;
            if v.is_slave {
                v.last_seen_replication = std::mem::take(&mut v.replications);
            }
            // Suspect lasts one tick; a second consecutive failure is Failed.
            v.state = if matches!(prev, ServerState::Suspect | ServerState::Failed) {
                ServerState::Failed
            } else {
                ServerState::Suspect
            };
            v.state
        });
        debug!(target: MONITOR, server = %self.url, error = %e, state = %state, "ping failed");
        if state != prev {
            info!(target: MONITOR, server = %self.url, from = %prev, to = %state, "server state changed");
            outcome.state_changed = state != ServerState::Suspect;
        }
        outcome
    }

    /// Reads variables, status, replication, binlogs and inventory.
    ///
    /// # Errors
    ///
    /// Fails only when the replication status cannot be read; every other
    /// read keeps the previous value on error.
    pub async fn refresh(&self) -> Result<(), MonitorError> {
        let session = self.session()?;
        self.refresh_with(&session).await
    }

    async fn refresh_with(&self, session: &std::sync::Arc<dyn DbSession>) -> Result<(), MonitorError> {
        let config = self.ctx.config();
        let old = self.view();

        let variables = match session.variables().await {
            Ok(v) => v,
            Err(e) => {
                warn!(target: MONITOR, server = %self.url, error = %e, "could not read variables");
                old.variables.clone()
            }
        };
        let version = DbVersion::parse(
            variables.get("VERSION").map_or("", String::as_str),
            variables.get("VERSION_COMMENT").map_or("", String::as_str),
        );
        let status = best_effort(&self.url, "status", session.status().await).unwrap_or_else(|| old.status.clone());
        let replications = session.replication_status(&version).await?;
        let master_status =
            best_effort(&self.url, "master status", session.master_status(&version).await).unwrap_or_default();
        let binary_logs =
            best_effort(&self.url, "binary logs", session.binary_logs().await).unwrap_or_else(|| old.binary_logs.clone());
        let binlog_dump_count = match session.binlog_dump_count().await {
            Ok(n) => n,
            Err(e) => {
                self.ctx.sme.raise_for("ERR00014", &self.url, &[&self.url, &e]);
                0
            }
        };
        let schemas = best_effort(&self.url, "schemas", session.schemas().await).unwrap_or_else(|| old.schemas.clone());
        let users = best_effort(&self.url, "users", session.users().await).unwrap_or_else(|| old.users.clone());
        let plugins = best_effort(&self.url, "plugins", session.plugins().await).unwrap_or_else(|| old.plugins.clone());

        let channel = config.replication_source_name.clone();
        let now = chrono::Utc::now().timestamp();
        self.update(|v| {
            apply_variables(v, &variables, &status, version);
            let main = replications.iter().find(|r| r.channel == channel);
            v.is_slave = main.is_some();
            v.have_mariadb_gtid = main.is_some_and(|r| matches!(r.using_gtid.as_str(), "Slave_Pos" | "Current_Pos"));
            v.have_mysql_gtid = version.is_mysql_or_percona() && main.is_some_and(ReplicationStatus::uses_gtid);
            v.io_gtid = main.map(|r| r.gtid_io_pos.clone()).unwrap_or_default();
            v.replications = replications;
            v.binary_log_file.clone_from(&master_status.file);
            v.binary_log_pos = master_status.position;
            v.master_status = master_status;
            v.binary_logs = binary_logs;
            if let Some((current, _)) = v.binary_logs.last() {
                v.binary_log_oldest_file =
                    NodeView::derive_oldest_binlog(current, v.binary_logs.len()).unwrap_or_default();
            }
            v.binlog_dump_count = binlog_dump_count;
            v.schemas = schemas;
            v.users = users;
            v.plugins = plugins;
            v.prev_monitor_time = v.monitor_time;
            v.monitor_time = now;
        });
        Ok(())
    }

    /// Reacts to a replica entering a broken state: runs the operator
    /// script and restarts replication past a matching SQL error.
    pub async fn process_failed_slave(&self, prev: ServerState, state: ServerState) {
        let config = self.ctx.config();
        if let Some(script) = &config.replication_error_script {
            let cmd = ToolCommand::new(script)
                .arg(self.url.clone())
                .arg(prev.to_string())
                .arg(state.to_string());
            match self.ctx.collab.scripts.run(&cmd).await {
                Ok(out) => info!(target: MONITOR, server = %self.url, output = %out.trim(), "replication error script done"),
                Err(e) => warn!(target: MONITOR, server = %self.url, error = %e, "replication error script failed"),
            }
        }
        let Some(pattern) = &config.replication_restart_on_sql_error_match else {
            return;
        };
        let Ok(re) = Regex::new(pattern) else {
            warn!(target: MONITOR, pattern = %pattern, "invalid SQL error match pattern");
            return;
        };
        let channel = config.replication_source_name.clone();
        let Ok(r) = self.replication_status(&channel) else {
            return;
        };
        if r.sql_running || !re.is_match(&r.last_sql_error) {
            return;
        }
        info!(target: MONITOR, server = %self.url, error = %r.last_sql_error, "skipping event after matching SQL error");
        if let Err(e) = self.skip_replication_event().await {
            warn!(target: MONITOR, server = %self.url, error = %e, "could not skip replication event");
            return;
        }
        if let Err(e) = self.start_slave().await {
            warn!(target: MONITOR, server = %self.url, error = %e, "could not restart replication");
        }
    }
}

fn best_effort<T>(url: &str, what: &str, res: Result<T, DbError>) -> Option<T> {
    match res {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(target: MONITOR, server = url, error = %e, "could not read {what}");
            None
        }
    }
}

/// Derives the flags that come from variables and status alone.
fn apply_variables(v: &mut NodeView, variables: &VarMap, status: &VarMap, version: DbVersion) {
    let mysql = version.is_mysql_or_percona();
    v.version = version;
    v.server_id = var_u64(variables, "SERVER_ID");
    v.read_only = var_on(variables, "READ_ONLY");
    v.have_binlog = var_on(variables, "LOG_BIN");
    v.is_maxscale = variables
        .get("VERSION_COMMENT")
        .is_some_and(|c| MAXSCALE.is_match(c));
    if mysql {
        v.current_gtid = parse_gtid(variables.get("GTID_EXECUTED"), true);
        v.gtid_binlog_pos = v.current_gtid.clone();
        v.slave_gtid = v.current_gtid.clone();
    } else {
        v.current_gtid = parse_gtid(variables.get("GTID_CURRENT_POS"), false);
        v.gtid_binlog_pos = parse_gtid(variables.get("GTID_BINLOG_POS"), false);
        v.slave_gtid = parse_gtid(variables.get("GTID_SLAVE_POS"), false);
    }
    v.have_semisync = status.contains_key("RPL_SEMI_SYNC_SLAVE_STATUS")
        || status.contains_key("RPL_SEMI_SYNC_MASTER_STATUS");
    v.semisync_slave_status = var_on(status, "RPL_SEMI_SYNC_SLAVE_STATUS");
    v.have_wsrep = var_on(variables, "WSREP_ON");
    let wsrep_state = var_u64(status, "WSREP_LOCAL_STATE");
    v.is_wsrep_sync = wsrep_state == 4;
    v.is_wsrep_donor = wsrep_state == 2;
    v.is_wsrep_primary = v.have_wsrep && status.get("WSREP_CLUSTER_STATUS").is_some_and(|s| s == "Primary");
    let primary = status.get("GROUP_REPLICATION_PRIMARY_MEMBER");
    let uuid = variables.get("SERVER_UUID");
    v.is_group_replication_master = primary.is_some_and(|p| !p.is_empty() && Some(p) == uuid);
    v.is_group_replication_slave = primary.is_some_and(|p| !p.is_empty() && Some(p) != uuid);
    v.variables = variables.clone();
    v.status = status.clone();
}
