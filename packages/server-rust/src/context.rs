//! State shared by a cluster and every node monitor it owns.
//!
//! The cluster owns its monitors; monitors keep an `Arc<ClusterContext>`
//! rather than a pointer back to the cluster, so there is no ownership cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use repman_core::{MonitorStatus, NonBlockingChannel, StateMachine};
use tracing::debug;

use crate::binlog::reader::{BinlogReader, ProcessBinlogReader};
use crate::config::ClusterConfig;
use crate::db::DbConnector;
use crate::jobs::ssh::{OpenSshShell, RemoteShell};
use crate::jobs::JobRegistry;
use crate::traits::{Arbitrator, ProcessScriptRunner, Provisioner, ScriptRunner, SecretStore, SstChannel};

/// Secret-store key of the replication password.
pub const SECRET_RPL_PASSWORD: &str = "rpl_password";
/// Secret-store key of the monitoring password.
pub const SECRET_DB_PASSWORD: &str = "db_password";

/// Outward collaborators injected at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub scripts: Arc<dyn ScriptRunner>,
    pub binlog_reader: Arc<dyn BinlogReader>,
    pub shell: Arc<dyn RemoteShell>,
    pub sst: Option<Arc<dyn SstChannel>>,
    pub secrets: Option<Arc<dyn SecretStore>>,
    pub provisioner: Option<Arc<dyn Provisioner>>,
    pub arbitrator: Option<Arc<dyn Arbitrator>>,
}

impl Collaborators {
    /// Real processes on the local host: scripts, `mysqlbinlog`, `ssh`.
    #[must_use]
    pub fn local(config: &ClusterConfig) -> Self {
        let scripts: Arc<dyn ScriptRunner> = Arc::new(ProcessScriptRunner);
        Self {
            binlog_reader: Arc::new(ProcessBinlogReader::new(config.tools.clone(), Arc::clone(&scripts))),
            shell: Arc::new(OpenSshShell::new(config.ssh.clone())),
            scripts,
            sst: None,
            secrets: None,
            provisioner: None,
            arbitrator: None,
        }
    }

    #[must_use]
    pub fn with_sst(mut self, sst: Arc<dyn SstChannel>) -> Self {
        self.sst = Some(sst);
        self
    }

    #[must_use]
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    #[must_use]
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    #[must_use]
    pub fn with_arbitrator(mut self, arbitrator: Arc<dyn Arbitrator>) -> Self {
        self.arbitrator = Some(arbitrator);
        self
    }
}

/// Arbitration verdicts of the last tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Arbitration {
    pub split_brain: bool,
    pub lost_majority: bool,
    pub failed_arbitrator: bool,
}

// ---------------------------------------------------------------------------
// Backup guards
// ---------------------------------------------------------------------------

/// Kind of long-running backup guarded at cluster scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Physical,
    Logical,
    Binlog,
    Restic,
}

/// One flag per [`BackupKind`].
#[derive(Debug, Default)]
pub struct BackupFlags {
    physical: AtomicBool,
    logical: AtomicBool,
    binlog: AtomicBool,
    restic: AtomicBool,
}

impl BackupFlags {
    fn flag(&self, kind: BackupKind) -> &AtomicBool {
        match kind {
            BackupKind::Physical => &self.physical,
            BackupKind::Logical => &self.logical,
            BackupKind::Binlog => &self.binlog,
            BackupKind::Restic => &self.restic,
        }
    }

    #[must_use]
    pub fn is_running(&self, kind: BackupKind) -> bool {
        self.flag(kind).load(Ordering::SeqCst)
    }

    /// Takes the flag if it is free.
    #[must_use]
    pub fn try_acquire(&self, kind: BackupKind) -> Option<BackupGuard<'_>> {
        self.flag(kind)
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| BackupGuard { flags: self, kind })
    }

    /// Takes the flag, backing off one second between attempts, at most
    /// `retries` times.
    pub async fn acquire(&self, kind: BackupKind, retries: u32) -> Option<BackupGuard<'_>> {
        for attempt in 0..=retries {
            if let Some(guard) = self.try_acquire(kind) {
                return Some(guard);
            }
            debug!(?kind, attempt, "backup in progress, backing off");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        None
    }
}

/// Releases its flag on drop.
#[derive(Debug)]
pub struct BackupGuard<'a> {
    flags: &'a BackupFlags,
    kind: BackupKind,
}

impl Drop for BackupGuard<'_> {
    fn drop(&mut self) {
        self.flags.flag(self.kind).store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// ClusterContext
// ---------------------------------------------------------------------------

pub struct ClusterContext {
    config: ArcSwap<ClusterConfig>,
    pub sme: StateMachine,
    pub connector: Arc<dyn DbConnector>,
    pub collab: Collaborators,
    status: RwLock<MonitorStatus>,
    arbitration: RwLock<Arbitration>,
    rpl_password: RwLock<String>,
    pub failover_cond: NonBlockingChannel<bool>,
    pub switchover_cond: NonBlockingChannel<bool>,
    pub rejoin_cond: NonBlockingChannel<bool>,
    pub backups: BackupFlags,
    pub jobs: JobRegistry,
}

impl ClusterContext {
    #[must_use]
    pub fn new(config: ClusterConfig, connector: Arc<dyn DbConnector>, collab: Collaborators) -> Arc<Self> {
        let rpl_password = config.rpl_password.clone();
        Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            sme: StateMachine::new(),
            connector,
            collab,
            status: RwLock::new(MonitorStatus::Actif),
            arbitration: RwLock::new(Arbitration::default()),
            rpl_password: RwLock::new(rpl_password),
            failover_cond: NonBlockingChannel::new(),
            switchover_cond: NonBlockingChannel::new(),
            rejoin_cond: NonBlockingChannel::new(),
            backups: BackupFlags::default(),
            jobs: JobRegistry::default(),
        })
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> Arc<ClusterConfig> {
        self.config.load_full()
    }

    /// Applies `f` to a copy of the configuration and publishes it.
    pub fn update_config(&self, f: impl FnOnce(&mut ClusterConfig)) {
        let mut next = ClusterConfig::clone(&self.config.load());
        f(&mut next);
        self.config.store(Arc::new(next));
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.config.load().name.clone()
    }

    #[must_use]
    pub fn status(&self) -> MonitorStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: MonitorStatus) {
        *self.status.write() = status;
    }

    /// Topology-changing actions are allowed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status() == MonitorStatus::Actif
    }

    #[must_use]
    pub fn arbitration(&self) -> Arbitration {
        *self.arbitration.read()
    }

    pub fn set_arbitration(&self, verdict: Arbitration) {
        *self.arbitration.write() = verdict;
    }

    /// This instance lost arbitration and must not acquire writers.
    #[must_use]
    pub fn is_arbitration_lost(&self) -> bool {
        let config = self.config.load();
        config.arbitration && self.arbitration.read().lost_majority
    }

    /// Replication credentials in effect.
    #[must_use]
    pub fn rpl_credentials(&self) -> (String, String) {
        (self.config.load().rpl_user.clone(), self.rpl_password.read().clone())
    }

    pub fn set_rpl_password(&self, password: &str) {
        *self.rpl_password.write() = password.to_string();
    }
}

impl std::fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterContext")
            .field("name", &self.name())
            .field("status", &self.status())
            .field("arbitration", &self.arbitration())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::FakeFleet;

    fn ctx() -> Arc<ClusterContext> {
        let config = ClusterConfig::default();
        let collab = Collaborators::local(&config);
        ClusterContext::new(config, FakeFleet::new().connector(), collab)
    }

    #[test]
    fn backup_guard_releases_on_drop() {
        let flags = BackupFlags::default();
        let guard = flags.try_acquire(BackupKind::Binlog);
        assert!(guard.is_some());
        assert!(flags.try_acquire(BackupKind::Binlog).is_none());
        assert!(flags.try_acquire(BackupKind::Logical).is_some());
        drop(guard);
        assert!(!flags.is_running(BackupKind::Binlog));
    }

    #[tokio::test(start_paused = true)]
    async fn backup_acquire_gives_up() {
        let flags = BackupFlags::default();
        let _held = flags.try_acquire(BackupKind::Physical);
        assert!(flags.acquire(BackupKind::Physical, 2).await.is_none());
    }

    #[test]
    fn arbitration_loss_needs_the_feature() {
        let c = ctx();
        c.set_arbitration(Arbitration {
            lost_majority: true,
            ..Arbitration::default()
        });
        assert!(!c.is_arbitration_lost());
        c.update_config(|cfg| cfg.arbitration = true);
        assert!(c.is_arbitration_lost());
    }

    #[test]
    fn debug_names_the_cluster_without_secrets() {
        let c = ctx();
        c.set_rpl_password("hunter2");
        let shown = format!("{c:?}");
        assert!(shown.starts_with("ClusterContext"));
        assert!(shown.contains(&c.name()));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn status_gates_activity() {
        let c = ctx();
        assert!(c.is_active());
        c.set_status(MonitorStatus::Standby);
        assert!(!c.is_active());
    }
}
