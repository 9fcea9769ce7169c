//! Cluster engine.
//!
//! A [`Cluster`] owns the node monitors of one replication cluster and the
//! derived topology: who leads, who replicates, whether the cluster is down.
//! Every monitoring tick probes the nodes, rebuilds the topology, arbitrates,
//! and decides whether a failover or a rejoin is due.
//!
//! Membership lives behind a synchronous mutex that is never held across an
//! await point; long operations take snapshots and write results back.

pub mod failover;
pub mod rejoin;
pub mod topology;
pub mod wait;

#[cfg(test)]
mod scenarios;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use repman_core::{CrashLog, MonitorStatus, ServerState, Topology};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::context::{Arbitration, ClusterContext, SECRET_DB_PASSWORD, SECRET_RPL_PASSWORD};
use crate::logging::{ARBITRATION, BINLOG, PURGE, TOPOLOGY};
use crate::monitor::{PingOutcome, RejoinKind, ServerMonitor};
use crate::proxy::{build_proxies, for_each_proxy, ProxySync, ProxyView};

pub use rejoin::RejoinMethod;

/// Published view of the cluster after each tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterSnapshot {
    pub name: String,
    pub topology: Topology,
    pub master: Option<String>,
    pub slaves: Vec<String>,
    pub states: Vec<(String, ServerState)>,
    pub is_down: bool,
    pub failover_count: u32,
    pub in_failover: bool,
}

/// Topology derived by discovery and mutated by failover.
#[derive(Default)]
struct Members {
    servers: Vec<Arc<ServerMonitor>>,
    slaves: Vec<Arc<ServerMonitor>>,
    master: Option<Arc<ServerMonitor>>,
    vmaster: Option<Arc<ServerMonitor>>,
    /// Leader recorded when the whole cluster went down.
    lastmaster: Option<Arc<ServerMonitor>>,
    topology: Topology,
    crashes: CrashLog,
    is_down: bool,
    failover_count: u32,
    /// Unix seconds of the last failover, 0 when none happened.
    failover_ts: i64,
    /// Leader url and the binlog it was writing at the last tick.
    leader_binlog: Option<(String, String)>,
}

pub struct Cluster {
    ctx: Arc<ClusterContext>,
    inner: Mutex<Members>,
    proxies: RwLock<Vec<Arc<dyn ProxySync>>>,
    proxies_ready: AtomicBool,
    snapshot: watch::Sender<ClusterSnapshot>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.ctx.name())
            .field("master", &self.master().map(|m| m.url.clone()))
            .finish_non_exhaustive()
    }
}

impl Cluster {
    /// Builds monitors for every configured host and the configured proxies.
    #[must_use]
    pub fn new(ctx: Arc<ClusterContext>) -> Arc<Self> {
        let proxies = build_proxies(&ctx);
        Self::with_proxies(ctx, proxies)
    }

    /// Like [`Self::new`] with explicit proxy synchronizers.
    #[must_use]
    pub fn with_proxies(ctx: Arc<ClusterContext>, proxies: Vec<Arc<dyn ProxySync>>) -> Arc<Self> {
        let config = ctx.config();
        let servers: Vec<Arc<ServerMonitor>> = config
            .hosts
            .iter()
            .map(|h| ServerMonitor::new(Arc::clone(&ctx), h))
            .collect();
        let (snapshot, _) = watch::channel(ClusterSnapshot {
            name: config.name.clone(),
            ..ClusterSnapshot::default()
        });
        Arc::new(Self {
            inner: Mutex::new(Members {
                servers,
                ..Members::default()
            }),
            ctx,
            proxies: RwLock::new(proxies),
            proxies_ready: AtomicBool::new(false),
            snapshot,
        })
    }

    /// [`Self::new`] followed by loading the persisted crash log.
    pub async fn open(ctx: Arc<ClusterContext>) -> Arc<Self> {
        let cluster = Self::new(ctx);
        cluster.load_crashes().await;
        cluster
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.ctx
    }

    #[must_use]
    pub fn servers(&self) -> Vec<Arc<ServerMonitor>> {
        self.inner.lock().servers.clone()
    }

    #[must_use]
    pub fn master(&self) -> Option<Arc<ServerMonitor>> {
        self.inner.lock().master.clone()
    }

    #[must_use]
    pub fn slaves(&self) -> Vec<Arc<ServerMonitor>> {
        self.inner.lock().slaves.clone()
    }

    /// Virtual leader of a multi-master topology.
    #[must_use]
    pub fn vmaster(&self) -> Option<Arc<ServerMonitor>> {
        self.inner.lock().vmaster.clone()
    }

    #[must_use]
    pub fn lastmaster(&self) -> Option<Arc<ServerMonitor>> {
        self.inner.lock().lastmaster.clone()
    }

    #[must_use]
    pub fn topology(&self) -> Topology {
        self.inner.lock().topology
    }

    #[must_use]
    pub fn is_down(&self) -> bool {
        self.inner.lock().is_down
    }

    #[must_use]
    pub fn crashes(&self) -> CrashLog {
        self.inner.lock().crashes.clone()
    }

    #[must_use]
    pub fn failover_count(&self) -> u32 {
        self.inner.lock().failover_count
    }

    #[must_use]
    pub fn proxies(&self) -> Vec<Arc<dyn ProxySync>> {
        self.proxies.read().clone()
    }

    /// Receiver of the snapshot published at the end of every tick.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ClusterSnapshot> {
        self.snapshot.subscribe()
    }

    #[must_use]
    pub fn server(&self, url: &str) -> Option<Arc<ServerMonitor>> {
        self.inner.lock().servers.iter().find(|s| s.url == url).cloned()
    }

    /// Adds a monitor for `url` unless one exists. Returns the monitor.
    pub fn add_server(&self, url: &str) -> Arc<ServerMonitor> {
        let monitor = ServerMonitor::new(Arc::clone(&self.ctx), url);
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.servers.iter().find(|s| s.url == monitor.url) {
            return Arc::clone(existing);
        }
        inner.servers.push(Arc::clone(&monitor));
        info!(target: TOPOLOGY, server = %monitor.url, "server added");
        monitor
    }

    /// Forgets `url`. The current leader cannot be removed.
    pub fn remove_server(&self, url: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.master.as_ref().is_some_and(|m| m.url == url) {
            return false;
        }
        let before = inner.servers.len();
        inner.servers.retain(|s| s.url != url);
        inner.slaves.retain(|s| s.url != url);
        before != inner.servers.len()
    }

    /// Proxy snapshot of the current leader and nodes.
    #[must_use]
    pub fn proxy_view(&self) -> ProxyView {
        let (master, servers) = {
            let inner = self.inner.lock();
            (inner.master.clone(), inner.servers.clone())
        };
        ProxyView::build(&self.ctx.name(), master.as_ref(), &servers)
    }

    fn publish(&self) {
        let snapshot = {
            let inner = self.inner.lock();
            ClusterSnapshot {
                name: self.ctx.name(),
                topology: inner.topology,
                master: inner.master.as_ref().map(|m| m.url.clone()),
                slaves: inner.slaves.iter().map(|s| s.url.clone()).collect(),
                states: inner.servers.iter().map(|s| (s.url.clone(), s.state())).collect(),
                is_down: inner.is_down,
                failover_count: inner.failover_count,
                in_failover: self.ctx.sme.is_in_failover(),
            }
        };
        self.snapshot.send_replace(snapshot);
    }

    // -----------------------------------------------------------------------
    // Crash log persistence
    // -----------------------------------------------------------------------

    /// Writes the crash log under the working directory.
    pub async fn save_crashes(&self) {
        let path = self.ctx.config().crash_log_path();
        let json = match self.inner.lock().crashes.to_json() {
            Ok(json) => json,
            Err(e) => {
                self.ctx.sme.raise("ERR00050", &[&e]);
                return;
            }
        };
        let written = async {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            tokio::fs::write(&path, json).await
        }
        .await;
        if let Err(e) = written {
            self.ctx.sme.raise("ERR00050", &[&e]);
            warn!(target: TOPOLOGY, path = %path.display(), error = %e, "could not save crash log");
        }
    }

    /// Reads the crash log written by [`Self::save_crashes`]. A missing file
    /// is an empty log.
    pub async fn load_crashes(&self) {
        let path = self.ctx.config().crash_log_path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(target: TOPOLOGY, path = %path.display(), error = %e, "could not read crash log");
                return;
            }
        };
        match CrashLog::from_json(&raw) {
            Ok(crashes) => {
                debug!(target: TOPOLOGY, count = crashes.len(), "crash log loaded");
                self.inner.lock().crashes = crashes;
            }
            Err(e) => warn!(target: TOPOLOGY, path = %path.display(), error = %e, "corrupt crash log ignored"),
        }
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// One monitoring pass.
    pub async fn tick(&self) {
        if self.ctx.sme.is_in_failover() {
            debug!(target: TOPOLOGY, "in failover, tick skipped");
            return;
        }
        let outcomes = self.probe().await;
        self.discover().await;
        self.arbitrate().await;

        if self.ctx.is_active() {
            let master_failed = self.master().is_some_and(|m| m.state() == ServerState::Failed);
            if master_failed && self.check_failed().await.is_ok() {
                if let Err(e) = self.failover().await {
                    warn!(target: TOPOLOGY, error = %e, "automatic failover failed");
                }
            }
            self.handle_rejoins(&outcomes).await;
        }

        self.account_sla();
        let changed = outcomes.iter().any(|(_, o)| o.state_changed);
        self.sync_proxies(changed).await;
        self.check_jobs().await;
        self.follow_binlog_rotation().await;
        self.purge_binlogs().await;
        self.purge_crashes().await;

        if !self.ctx.sme.is_in_failover() {
            let diff = self.ctx.sme.end_tick();
            for s in &diff.opened {
                if s.is_error() {
                    warn!(target: TOPOLOGY, code = %s.key, server = s.server_url.as_deref().unwrap_or_default(), "{}", s.desc);
                } else {
                    info!(target: TOPOLOGY, code = %s.key, server = s.server_url.as_deref().unwrap_or_default(), "{}", s.desc);
                }
            }
            for s in &diff.resolved {
                info!(target: TOPOLOGY, code = %s.key, "resolved: {}", s.desc);
            }
        }
        self.publish();
    }

    async fn handle_rejoins(&self, outcomes: &[(Arc<ServerMonitor>, PingOutcome)]) {
        for (node, outcome) in outcomes {
            match outcome.rejoin {
                Some(RejoinKind::Master) => match self.rejoin(node).await {
                    Ok(method) => info!(target: TOPOLOGY, server = %node.url, method = %method, "server rejoined"),
                    Err(e) => warn!(target: TOPOLOGY, server = %node.url, error = %e, "rejoin failed"),
                },
                Some(RejoinKind::Slave) => {
                    let stopped = node
                        .replication_status(&node.channel())
                        .is_ok_and(|r| r.io_running == repman_core::IoThread::No && !r.sql_running);
                    if stopped {
                        if let Err(e) = node.start_slave().await {
                            warn!(target: TOPOLOGY, server = %node.url, error = %e, "could not restart replication");
                        }
                    }
                }
                None => {}
            }
        }
    }

    fn account_sla(&self) {
        let (master, slaves) = {
            let inner = self.inner.lock();
            (inner.master.clone(), inner.slaves.clone())
        };
        let Some(master) = master.filter(|m| !m.state().is_down()) else {
            self.ctx.sme.set_master_up_and_sync(false, false, false);
            return;
        };
        let mv = master.view();
        let semisync = mv.have_semisync && slaves.iter().any(|s| s.view().semisync_slave_status);
        self.ctx.sme.set_master_up_and_sync(true, semisync, mv.have_healthy_replica);
    }

    async fn sync_proxies(&self, changed: bool) {
        let proxies = self.proxies();
        if proxies.is_empty() {
            return;
        }
        let view = self.proxy_view();
        if view.master.is_some() && !self.proxies_ready.swap(true, Ordering::SeqCst) {
            for_each_proxy(&proxies, "init", |p| p.init(&view)).await;
            return;
        }
        for_each_proxy(&proxies, "refresh", |p| p.refresh(&view)).await;
        if changed {
            for_each_proxy(&proxies, "state change", |p| p.backends_state_change(&view)).await;
        }
    }

    async fn check_jobs(&self) {
        for server in self.servers() {
            if server.state().is_down() || !server.is_connected() {
                continue;
            }
            if let Err(e) = server.jobs_check_running().await {
                debug!(target: TOPOLOGY, server = %server.url, error = %e, "jobs table unreadable");
            }
        }
    }

    /// Reacts to the leader switching to a new binlog: re-reads the oldest
    /// binlog timestamp and, with `backup_binlogs`, archives the file it
    /// just closed and trims the archive.
    async fn follow_binlog_rotation(&self) {
        let Some(master) = self.master().filter(|m| m.state() == ServerState::Master) else {
            return;
        };
        let file = master.view().binary_log_file;
        if file.is_empty() {
            return;
        }
        let closed = {
            let mut inner = self.inner.lock();
            let seen = (master.url.clone(), file.clone());
            match inner.leader_binlog.replace(seen) {
                Some((url, prev)) if url == master.url && prev == file => return,
                Some((url, prev)) if url == master.url => Some(prev),
                _ => None,
            }
        };
        debug!(target: BINLOG, server = %master.url, file = %file, closed = closed.as_deref().unwrap_or_default(), "leader binlog changed");
        if let Err(e) = master.refresh_oldest_binlog_timestamp().await {
            warn!(target: BINLOG, server = %master.url, error = %e, "oldest binlog timestamp unreadable");
        }
        if !self.ctx.config().backup_binlogs {
            return;
        }
        let Some(closed) = closed else {
            return;
        };
        if let Err(e) = master.backup_binlog(&closed).await {
            warn!(target: BINLOG, server = %master.url, file = %closed, error = %e, "binlog backup failed");
        }
        match master.backup_binlog_purge(&file).await {
            Ok(deleted) if !deleted.is_empty() => {
                info!(target: BINLOG, server = %master.url, count = deleted.len(), "old backup binlogs removed");
            }
            Ok(_) => {}
            Err(e) => warn!(target: BINLOG, server = %master.url, error = %e, "backup binlog retention failed"),
        }
    }

    async fn purge_binlogs(&self) {
        let config = self.ctx.config();
        if !config.force_binlog_purge || self.ctx.sme.is_in_failover() {
            return;
        }
        let (master, slaves) = {
            let inner = self.inner.lock();
            (inner.master.clone(), inner.slaves.clone())
        };
        let Some(master) = master.filter(|m| m.state() == ServerState::Master) else {
            return;
        };
        match master.purge_master_binlogs(&slaves).await {
            Ok(outcome) => debug!(target: PURGE, server = %master.url, outcome = ?outcome, "binlog purge pass"),
            Err(e) => warn!(target: PURGE, server = %master.url, error = %e, "binlog purge failed"),
        }
        if config.force_binlog_purge_replicas {
            let oldest = master.view().oldest_binary_log_timestamp;
            if oldest > 0 {
                for s in slaves.iter().filter(|s| !s.state().is_down()) {
                    if let Err(e) = s.purge_replica_binlogs(oldest).await {
                        warn!(target: PURGE, server = %s.url, error = %e, "replica binlog purge failed");
                    }
                }
            }
        }
    }

    /// Forgets crash records once every node is up and connected again.
    async fn purge_crashes(&self) {
        if self.ctx.sme.is_in_failover() {
            return;
        }
        let cleared = {
            let mut inner = self.inner.lock();
            let pending = inner
                .servers
                .iter()
                .any(|s| s.state().is_down() || s.state() == ServerState::Unconn);
            if pending || inner.crashes.is_empty() {
                false
            } else {
                inner.crashes.clear();
                true
            }
        };
        if cleared {
            debug!(target: TOPOLOGY, "every node up, crash log cleared");
            self.save_crashes().await;
        }
    }

    // -----------------------------------------------------------------------
    // Capture, rotation, arbitration
    // -----------------------------------------------------------------------

    /// Whether a diagnostic capture is running on any node.
    #[must_use]
    pub fn is_in_capture_mode(&self) -> bool {
        let config = self.ctx.config();
        config.monitor_capture
            && self.ctx.status() != MonitorStatus::Paused
            && self.servers().iter().any(|s| s.view().in_capture_mode)
    }

    /// Applies credentials found in the secret store. Returns whether the
    /// replication password changed.
    ///
    /// # Errors
    ///
    /// Fails when the secret store cannot be read.
    pub async fn rotate_passwords(&self) -> anyhow::Result<bool> {
        let Some(secrets) = self.ctx.collab.secrets.clone() else {
            return Ok(false);
        };
        let servers = self.servers();
        if servers.iter().any(|s| s.state().is_down()) {
            debug!(target: TOPOLOGY, "a node is down, rotation postponed");
            return Ok(false);
        }
        let slaves = self.slaves();
        let all_running = slaves.iter().all(|s| {
            s.replication_status(&s.channel())
                .is_ok_and(|r| r.sql_running && r.io_running == repman_core::IoThread::Yes)
        });
        if !all_running {
            self.ctx.sme.delete_state("ERR00090");
            self.ctx.sme.raise("ERR00090", &[]);
            return Ok(false);
        }

        let mut rotated = false;
        let (_, current) = self.ctx.rpl_credentials();
        if let Some(secret) = secrets.get(SECRET_RPL_PASSWORD).await? {
            if !secret.value.is_empty() && secret.value != current {
                self.ctx.set_rpl_password(&secret.value);
                for s in &servers {
                    if let Err(e) = s.rotate_replication_password(&secret.value).await {
                        warn!(target: TOPOLOGY, server = %s.url, error = %e, "replication password rotation failed");
                    }
                }
                info!(target: TOPOLOGY, "replication password rotated");
                rotated = true;
            }
        }
        let db_password = self.ctx.config().db_password.clone();
        if let Some(secret) = secrets.get(SECRET_DB_PASSWORD).await? {
            if !secret.value.is_empty() && secret.value != db_password {
                let password = secret.value.clone();
                self.ctx.update_config(|c| c.db_password.clone_from(&password));
                let proxies = self.proxies();
                for_each_proxy(&proxies, "password rotation", |p| p.rotate_monitoring_passwords(&password)).await;
                info!(target: TOPOLOGY, "monitoring password rotated");
            }
        }
        Ok(rotated)
    }

    /// Decides split-brain authority through the external arbitrator.
    pub async fn arbitrate(&self) {
        let config = self.ctx.config();
        if !config.arbitration {
            self.ctx.set_arbitration(Arbitration::default());
            return;
        }
        let servers = self.servers();
        let alive = servers.iter().filter(|s| !s.state().is_down()).count();
        let mut verdict = Arbitration {
            split_brain: !servers.is_empty() && alive * 2 <= servers.len(),
            ..Arbitration::default()
        };
        if !verdict.split_brain {
            self.ctx.set_arbitration(verdict);
            return;
        }
        self.ctx.sme.raise("WARN0079", &[]);
        let Some(arbitrator) = self.ctx.collab.arbitrator.clone() else {
            verdict.failed_arbitrator = true;
            self.ctx.sme.raise("WARN0090", &[&config.arbitrator_address]);
            self.ctx.set_arbitration(verdict);
            return;
        };
        match arbitrator.vote(&config.name, true).await {
            Ok(true) => {
                info!(target: ARBITRATION, "arbitration won");
                if self.ctx.status() == MonitorStatus::Standby {
                    self.ctx.set_status(MonitorStatus::Actif);
                }
            }
            Ok(false) => {
                verdict.lost_majority = true;
                self.ctx.sme.raise("WARN0080", &[]);
                warn!(target: ARBITRATION, "arbitration lost, standing by");
                self.ctx.set_status(MonitorStatus::Standby);
            }
            Err(e) => {
                verdict.failed_arbitrator = true;
                self.ctx.sme.raise("WARN0090", &[&config.arbitrator_address]);
                warn!(target: ARBITRATION, error = %e, "arbitrator unreachable");
            }
        }
        self.ctx.set_arbitration(verdict);
    }

    pub(crate) fn set_members(
        &self,
        f: impl FnOnce(&mut Vec<Arc<ServerMonitor>>, &mut Option<Arc<ServerMonitor>>, &mut CrashLog),
    ) {
        let mut inner = self.inner.lock();
        let Members {
            slaves, master, crashes, ..
        } = &mut *inner;
        f(slaves, master, crashes);
    }
}
