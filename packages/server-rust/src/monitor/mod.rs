//! Per-node monitor.
//!
//! A [`ServerMonitor`] owns the session to one database node and the
//! [`NodeView`] built from it on every tick. Readers take snapshots of the
//! view; no lock is held across a database call.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use repman_core::binlog::BinlogName;
use repman_core::{DbVersion, GtidList, MasterStatus, ReplicationStatus, ServerState};
use serde::Serialize;

use crate::context::ClusterContext;
use crate::db::dsn::{split_url, target_for};
use crate::db::{DbSession, DbUser, TlsChoice, VarMap};
use crate::error::{DbError, MonitorError};

pub mod control;
pub mod cookies;
pub mod probe;
pub mod settings;

pub use probe::{classify_replication, PingOutcome};

/// Which rejoin path a node asked for on its last ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejoinKind {
    /// A failed node came back without replication.
    Master,
    /// A failed replica came back with its channel configured.
    Slave,
}

/// Everything the monitor learned about a node on its last refresh.
#[derive(Debug, Clone, Default, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct NodeView {
    pub state: ServerState,
    pub prev_state: ServerState,
    /// Numeric `server_id` variable.
    pub server_id: u64,
    pub version: DbVersion,
    pub variables: VarMap,
    pub status: VarMap,
    pub replications: Vec<ReplicationStatus>,
    /// Channels saved when the node was last seen as a replica.
    pub last_seen_replication: Vec<ReplicationStatus>,
    pub master_status: MasterStatus,

    pub is_slave: bool,
    pub is_relay: bool,
    pub is_maxscale: bool,
    pub is_maintenance: bool,
    pub is_virtual_master: bool,
    pub have_wsrep: bool,
    pub is_wsrep_sync: bool,
    pub is_wsrep_donor: bool,
    pub is_wsrep_primary: bool,
    pub is_group_replication_master: bool,
    pub is_group_replication_slave: bool,
    pub have_semisync: bool,
    pub semisync_slave_status: bool,
    pub have_mariadb_gtid: bool,
    pub have_mysql_gtid: bool,
    pub have_binlog: bool,
    pub read_only: bool,
    pub in_capture_mode: bool,

    pub current_gtid: GtidList,
    pub slave_gtid: GtidList,
    pub io_gtid: GtidList,
    pub gtid_binlog_pos: GtidList,

    /// `SHOW BINARY LOGS`, oldest first.
    pub binary_logs: Vec<(String, u64)>,
    pub binary_log_file: String,
    pub binary_log_pos: u64,
    pub binary_log_oldest_file: String,
    /// Unix time of the first event of the oldest binlog.
    pub oldest_binary_log_timestamp: i64,
    pub binlog_dump_count: u32,

    pub fail_count: u32,
    pub fail_suspect_heartbeat: u64,
    pub monitor_time: i64,
    pub prev_monitor_time: i64,
    pub have_healthy_replica: bool,
    /// Last replication health summary.
    pub replication_health: String,

    pub schemas: Vec<String>,
    pub users: Vec<DbUser>,
    pub plugins: HashMap<String, String>,

    pub rejoin_pending: Option<RejoinKind>,
}

impl NodeView {
    /// Channel by name.
    #[must_use]
    pub fn replication(&self, channel: &str) -> Option<&ReplicationStatus> {
        self.replications.iter().find(|r| r.channel == channel)
    }

    #[must_use]
    pub fn is_master(&self) -> bool {
        self.state == ServerState::Master
    }

    #[must_use]
    pub fn is_down(&self) -> bool {
        self.state.is_down()
    }

    /// `server_id` of the source of `channel`, 0 when unknown.
    #[must_use]
    pub fn master_server_id(&self, channel: &str) -> u64 {
        self.replication(channel).map_or(0, |r| r.master_server_id)
    }

    /// Whether `channel` replicates from `host:port`.
    #[must_use]
    pub fn replicates_from(&self, channel: &str, host: &str, port: u16) -> bool {
        self.replication(channel)
            .is_some_and(|r| r.master_host == host && r.master_port == port)
    }

    /// Ordered binlog file to size map.
    #[must_use]
    pub fn binary_log_sizes(&self) -> BTreeMap<String, u64> {
        self.binary_logs.iter().cloned().collect()
    }

    /// Name of the oldest binlog implied by the current file and the count
    /// of files, using the zero-padded suffix convention.
    #[must_use]
    pub fn derive_oldest_binlog(current: &str, count: usize) -> Option<String> {
        let name: BinlogName = current.parse().ok()?;
        Some(name.oldest(count).to_string())
    }
}

// ---------------------------------------------------------------------------
// ServerMonitor
// ---------------------------------------------------------------------------

pub struct ServerMonitor {
    pub url: String,
    pub host: String,
    pub port: u16,
    /// Stable identifier derived from the cluster name and endpoint.
    pub id: String,
    pub(crate) ctx: Arc<ClusterContext>,
    session: RwLock<Option<Arc<dyn DbSession>>>,
    view: RwLock<NodeView>,
    tls_old: AtomicBool,
    pub(crate) in_purging_binary_log: AtomicBool,
    pub(crate) in_slow_query_capture: AtomicBool,
    pub(crate) in_pfs_query_capture: AtomicBool,
}

impl std::fmt::Debug for ServerMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMonitor")
            .field("url", &self.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ServerMonitor {
    #[must_use]
    pub fn new(ctx: Arc<ClusterContext>, url: &str) -> Arc<Self> {
        let config = ctx.config();
        let (host, port) = split_url(url, config.database_kind);
        let url = crate::db::dsn::join_url(&host, port);
        Arc::new(Self {
            id: repman_core::hash::server_id(&config.name, &host, port),
            url,
            host,
            port,
            ctx,
            session: RwLock::new(None),
            view: RwLock::new(NodeView::default()),
            tls_old: AtomicBool::new(false),
            in_purging_binary_log: AtomicBool::new(false),
            in_slow_query_capture: AtomicBool::new(false),
            in_pfs_query_capture: AtomicBool::new(false),
        })
    }

    /// Snapshot of the last refresh.
    #[must_use]
    pub fn view(&self) -> NodeView {
        self.view.read().clone()
    }

    /// Mutates the view under its lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut NodeView) -> R) -> R {
        f(&mut self.view.write())
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        self.view.read().state
    }

    pub fn set_state(&self, state: ServerState) {
        self.view.write().state = state;
    }

    #[must_use]
    pub fn server_id(&self) -> u64 {
        self.view.read().server_id
    }

    #[must_use]
    pub fn version(&self) -> DbVersion {
        self.view.read().version
    }

    #[must_use]
    pub fn is_ignored(&self) -> bool {
        self.ctx.config().is_ignored(&self.url)
    }

    #[must_use]
    pub fn is_preferred(&self) -> bool {
        self.ctx.config().is_preferred(&self.url)
    }

    /// Replication channel configured for the cluster.
    #[must_use]
    pub fn channel(&self) -> String {
        self.ctx.config().replication_source_name.clone()
    }

    /// Whether the last handshake needed the previous TLS profile.
    #[must_use]
    pub fn uses_old_tls(&self) -> bool {
        self.tls_old.load(Ordering::SeqCst)
    }

    /// The open session.
    ///
    /// # Errors
    ///
    /// [`MonitorError::NotConnected`] before a successful ping.
    pub fn session(&self) -> Result<Arc<dyn DbSession>, MonitorError> {
        self.session
            .read()
            .clone()
            .ok_or_else(|| MonitorError::NotConnected(self.url.clone()))
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.read().is_some()
    }

    /// Closes and forgets the session.
    pub async fn drop_session(&self) {
        let session = self.session.write().take();
        if let Some(s) = session {
            s.close().await;
        }
    }

    /// Reuses the session or opens one, falling back to the previous TLS
    /// profile once when the current one fails its handshake.
    pub(crate) async fn ensure_session(&self) -> Result<Arc<dyn DbSession>, DbError> {
        if let Some(s) = self.session.read().clone() {
            return Ok(s);
        }
        let config = self.ctx.config();
        let choice = if self.tls_old.load(Ordering::SeqCst) {
            TlsChoice::Old
        } else {
            TlsChoice::Current
        };
        let target = target_for(&config, &self.host, self.port, choice);
        let session = match self.ctx.connector.connect(&target).await {
            Err(e)
                if e.is_tls()
                    && choice == TlsChoice::Current
                    && config.tls.as_ref().is_some_and(|t| t.old.is_some()) =>
            {
                tracing::warn!(target: crate::logging::MONITOR, server = %self.url, error = %e,
                    "TLS handshake failed, retrying with the previous certificates");
                let old = target_for(&config, &self.host, self.port, TlsChoice::Old);
                let s = self.ctx.connector.connect(&old).await?;
                self.tls_old.store(true, Ordering::SeqCst);
                s
            }
            other => other?,
        };
        *self.session.write() = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Replication record of `channel` from the last refresh.
    ///
    /// # Errors
    ///
    /// [`MonitorError::ChannelNotFound`] when the node has no such channel.
    pub fn replication_status(&self, channel: &str) -> Result<ReplicationStatus, MonitorError> {
        self.view
            .read()
            .replication(channel)
            .cloned()
            .ok_or_else(|| MonitorError::ChannelNotFound {
                url: self.url.clone(),
                channel: channel.to_string(),
            })
    }

    /// Re-reads every channel from the node and stores them in the view.
    ///
    /// # Errors
    ///
    /// Fails when the node is not connected or the query fails.
    pub async fn reload_replication(&self) -> Result<Vec<ReplicationStatus>, MonitorError> {
        let session = self.session()?;
        let version = self.version();
        let replications = session.replication_status(&version).await?;
        let channel = self.channel();
        self.update(|v| {
            v.is_slave = replications.iter().any(|r| r.channel == channel);
            if let Some(r) = replications.iter().find(|r| r.channel == channel) {
                v.io_gtid = r.gtid_io_pos.clone();
            }
            v.replications = replications.clone();
        });
        Ok(replications)
    }

    /// Fresh record of the configured channel.
    ///
    /// # Errors
    ///
    /// [`MonitorError::ChannelNotFound`] when the node does not replicate.
    pub async fn fresh_replication_status(&self) -> Result<ReplicationStatus, MonitorError> {
        let channel = self.channel();
        self.reload_replication()
            .await?
            .into_iter()
            .find(|r| r.channel == channel)
            .ok_or_else(|| MonitorError::ChannelNotFound {
                url: self.url.clone(),
                channel,
            })
    }

    /// Per-node data directory.
    #[must_use]
    pub fn data_dir(&self) -> std::path::PathBuf {
        self.ctx.config().node_dir(&self.host, self.port)
    }

    /// Per-node backup directory.
    #[must_use]
    pub fn backup_dir(&self) -> std::path::PathBuf {
        self.ctx.config().node_backup_dir(&self.host, self.port)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::context::Collaborators;
    use crate::db::fake::FakeFleet;

    /// Context over `fleet` with a temporary working directory.
    pub fn context(fleet: &FakeFleet, dir: &std::path::Path, f: impl FnOnce(&mut ClusterConfig)) -> Arc<ClusterContext> {
        context_with(fleet, dir, f, |_| {})
    }

    /// Like [`context`], with collaborators replaced by `g`.
    pub fn context_with(
        fleet: &FakeFleet,
        dir: &std::path::Path,
        f: impl FnOnce(&mut ClusterConfig),
        g: impl FnOnce(&mut Collaborators),
    ) -> Arc<ClusterContext> {
        let mut config = ClusterConfig {
            name: "c1".into(),
            working_dir: dir.to_path_buf(),
            rpl_password: "repl".into(),
            ..ClusterConfig::default()
        };
        f(&mut config);
        let mut collab = Collaborators::local(&config);
        g(&mut collab);
        ClusterContext::new(config, fleet.connector(), collab)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::context;
    use super::*;
    use crate::config::{TlsFiles, TlsProfiles};
    use crate::db::fake::FakeFleet;

    #[test]
    fn oldest_binlog_from_suffix() {
        assert_eq!(
            NodeView::derive_oldest_binlog("mysql-bin.000012", 9).as_deref(),
            Some("mysql-bin.000004")
        );
        assert_eq!(
            NodeView::derive_oldest_binlog("mysql-bin.000003", 1).as_deref(),
            Some("mysql-bin.000003")
        );
    }

    #[tokio::test]
    async fn new_monitor_normalizes_url() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let ctx = context(&fleet, dir.path(), |_| {});
        let m = ServerMonitor::new(ctx, "db1");
        assert_eq!(m.url, "db1:3306");
        assert!(m.id.starts_with('s'));
        assert!(matches!(m.session(), Err(MonitorError::NotConnected(_))));
    }

    #[tokio::test]
    async fn tls_falls_back_to_old_profile_once() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let url = fleet.add_mariadb("db1", 3306, 1);
        fleet.with_node(&url, |n| n.tls_broken_current = true);
        let files = TlsFiles {
            ca_cert: "/ca.pem".into(),
            client_cert: None,
            client_key: None,
        };
        let ctx = context(&fleet, dir.path(), |c| {
            c.tls = Some(TlsProfiles {
                current: files.clone(),
                old: Some(files),
            });
        });
        let m = ServerMonitor::new(ctx, &url);
        assert!(m.ensure_session().await.is_ok());
        assert!(m.uses_old_tls());
        let tries: Vec<TlsChoice> = fleet.connects().into_iter().map(|(_, t)| t).collect();
        assert_eq!(tries, vec![TlsChoice::Current, TlsChoice::Old]);
    }

    #[tokio::test]
    async fn missing_channel_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let ctx = context(&fleet, dir.path(), |_| {});
        let m = ServerMonitor::new(ctx, "db1:3306");
        let err = m.replication_status("").unwrap_err();
        assert!(matches!(err, MonitorError::ChannelNotFound { .. }));
    }
}
