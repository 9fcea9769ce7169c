//! Core enums shared by every component of the control plane.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ServerState
// ---------------------------------------------------------------------------

/// Role and health of a database node as classified on the last tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServerState {
    Master,
    Slave,
    RelayMaster,
    RelaySlave,
    Wsrep,
    WsrepDonor,
    WsrepLate,
    SlaveLate,
    SlaveErr,
    RelayLate,
    RelayErr,
    ErrorAuth,
    Failed,
    Suspect,
    /// Answering but with no replication role yet (standalone).
    #[default]
    Unconn,
    Maintenance,
    Shard,
}

impl ServerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Master => "Master",
            Self::Slave => "Slave",
            Self::RelayMaster => "RelayMaster",
            Self::RelaySlave => "RelaySlave",
            Self::Wsrep => "Wsrep",
            Self::WsrepDonor => "WsrepDonor",
            Self::WsrepLate => "WsrepLate",
            Self::SlaveLate => "SlaveLate",
            Self::SlaveErr => "SlaveErr",
            Self::RelayLate => "RelayLate",
            Self::RelayErr => "RelayErr",
            Self::ErrorAuth => "ErrorAuth",
            Self::Failed => "Failed",
            Self::Suspect => "Suspect",
            Self::Unconn => "StandAlone",
            Self::Maintenance => "Maintenance",
            Self::Shard => "Shard",
        }
    }

    /// Unreachable for monitoring purposes.
    #[must_use]
    pub fn is_down(self) -> bool {
        matches!(self, Self::Failed | Self::ErrorAuth | Self::Suspect)
    }

    #[must_use]
    pub fn is_failed_or_auth(self) -> bool {
        matches!(self, Self::Failed | Self::ErrorAuth)
    }

    /// Replica whose replication is broken.
    #[must_use]
    pub fn is_broken(self) -> bool {
        matches!(self, Self::SlaveErr | Self::RelayErr)
    }

    #[must_use]
    pub fn is_late(self) -> bool {
        matches!(self, Self::SlaveLate | Self::RelayLate | Self::WsrepLate)
    }

    /// Healthy replica able to serve reads.
    #[must_use]
    pub fn is_healthy_replica(self) -> bool {
        matches!(self, Self::Slave | Self::RelaySlave | Self::Wsrep)
    }

    /// States worth an alert when entered.
    #[must_use]
    pub fn is_alert_worthy(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Suspect | Self::ErrorAuth | Self::SlaveErr | Self::RelayErr
        )
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Cluster topology label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    MasterSlave,
    #[default]
    Unknown,
    BinlogServer,
    MultiTierSlave,
    MultiMaster,
    MultiMasterRing,
    MultiMasterWsrep,
    MultiMasterGrprep,
    MasterSlavePgLogical,
    MasterSlavePgStream,
    ActivePassive,
}

impl Topology {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MasterSlave => "master-slave",
            Self::Unknown => "unknown",
            Self::BinlogServer => "binlog-server",
            Self::MultiTierSlave => "multi-tier-slave",
            Self::MultiMaster => "multi-master",
            Self::MultiMasterRing => "multi-master-ring",
            Self::MultiMasterWsrep => "multi-master-wsrep",
            Self::MultiMasterGrprep => "multi-master-grprep",
            Self::MasterSlavePgLogical => "master-slave-pg-logical",
            Self::MasterSlavePgStream => "master-slave-pg-stream",
            Self::ActivePassive => "active-passive",
        }
    }

    /// Topologies where several nodes accept writes.
    #[must_use]
    pub fn is_multi_master(self) -> bool {
        matches!(
            self,
            Self::MultiMaster | Self::MultiMasterRing | Self::MultiMasterWsrep | Self::MultiMasterGrprep
        )
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// MonitorStatus
// ---------------------------------------------------------------------------

/// Whether the control plane may perform topology-changing actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MonitorStatus {
    #[default]
    Actif,
    Standby,
    Paused,
}

// ---------------------------------------------------------------------------
// Cookie
// ---------------------------------------------------------------------------

/// Durable marker files kept under a node's data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cookie {
    Prov,
    Unprov,
    WaitStart,
    WaitStop,
    WaitBackup,
    Restart,
    Reprov,
    LogicalBackup,
    PhysicalBackup,
}

impl Cookie {
    pub const ALL: [Cookie; 9] = [
        Self::Prov,
        Self::Unprov,
        Self::WaitStart,
        Self::WaitStop,
        Self::WaitBackup,
        Self::Restart,
        Self::Reprov,
        Self::LogicalBackup,
        Self::PhysicalBackup,
    ];

    /// File name of the marker.
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Prov => "cookie_prov",
            Self::Unprov => "cookie_unprov",
            Self::WaitStart => "cookie_waitstart",
            Self::WaitStop => "cookie_waitstop",
            Self::WaitBackup => "cookie_waitbackup",
            Self::Restart => "cookie_restart",
            Self::Reprov => "cookie_reprov",
            Self::LogicalBackup => "cookie_logicalbackup",
            Self::PhysicalBackup => "cookie_physicalbackup",
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Lifecycle of a row in the node jobs table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobState {
    Queued = 0,
    Running = 1,
    Success = 2,
    Terminal = 3,
}

impl JobState {
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Queued,
            1 => Self::Running,
            2 => Self::Success,
            _ => Self::Terminal,
        }
    }

    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// States that block insertion of another job of the same task.
    #[must_use]
    pub fn is_pending(self) -> bool {
        self < Self::Terminal
    }
}

/// Tasks the node-side job runner knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobTask {
    Xtrabackup,
    Mariabackup,
    ReseedXtrabackup,
    ReseedMariabackup,
    ReseedMysqldump,
    ReseedMydumper,
    FlashbackXtrabackup,
    FlashbackMariabackup,
    FlashbackMysqldump,
    FlashbackMydumper,
    Error,
    SlowQuery,
    Optimize,
    ZfsSnapback,
    Stop,
    Restart,
    Binlog,
    BinlogPurge,
}

impl JobTask {
    pub const ALL: [JobTask; 18] = [
        Self::Xtrabackup,
        Self::Mariabackup,
        Self::ReseedXtrabackup,
        Self::ReseedMariabackup,
        Self::ReseedMysqldump,
        Self::ReseedMydumper,
        Self::FlashbackXtrabackup,
        Self::FlashbackMariabackup,
        Self::FlashbackMysqldump,
        Self::FlashbackMydumper,
        Self::Error,
        Self::SlowQuery,
        Self::Optimize,
        Self::ZfsSnapback,
        Self::Stop,
        Self::Restart,
        Self::Binlog,
        Self::BinlogPurge,
    ];

    /// Value stored in the `task` column.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Xtrabackup => "xtrabackup",
            Self::Mariabackup => "mariabackup",
            Self::ReseedXtrabackup => "reseedxtrabackup",
            Self::ReseedMariabackup => "reseedmariabackup",
            Self::ReseedMysqldump => "reseedmysqldump",
            Self::ReseedMydumper => "reseedmydumper",
            Self::FlashbackXtrabackup => "flashbackxtrabackup",
            Self::FlashbackMariabackup => "flashbackmariabackup",
            Self::FlashbackMysqldump => "flashbackmysqldump",
            Self::FlashbackMydumper => "flashbackmydumper",
            Self::Error => "error",
            Self::SlowQuery => "slowquery",
            Self::Optimize => "optimize",
            Self::ZfsSnapback => "zfssnapback",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Binlog => "binlog",
            Self::BinlogPurge => "binlogpurge",
        }
    }

    /// Reseed, flashback and snapback jobs restart replication when they
    /// complete.
    #[must_use]
    pub fn restarts_replication(self) -> bool {
        matches!(
            self,
            Self::ZfsSnapback
                | Self::ReseedXtrabackup
                | Self::ReseedMariabackup
                | Self::ReseedMysqldump
                | Self::ReseedMydumper
                | Self::FlashbackXtrabackup
                | Self::FlashbackMariabackup
                | Self::FlashbackMysqldump
                | Self::FlashbackMydumper
        )
    }
}

impl fmt::Display for JobTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobTask {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown job task '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// ProxyType
// ---------------------------------------------------------------------------

/// Front-door proxy flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Haproxy,
    ProxySql,
    ProxyJanitor,
    MaxScale,
    ShardProxy,
    Consul,
    External,
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Haproxy => "haproxy",
            Self::ProxySql => "proxysql",
            Self::ProxyJanitor => "proxyjanitor",
            Self::MaxScale => "maxscale",
            Self::ShardProxy => "shardproxy",
            Self::Consul => "consul",
            Self::External => "extproxy",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_state_groups() {
        assert!(ServerState::Failed.is_down());
        assert!(ServerState::Suspect.is_down());
        assert!(!ServerState::Suspect.is_failed_or_auth());
        assert!(ServerState::RelayErr.is_broken());
        assert!(ServerState::SlaveLate.is_late());
        assert!(ServerState::Slave.is_healthy_replica());
        assert_eq!(ServerState::Unconn.to_string(), "StandAlone");
    }

    #[test]
    fn topology_labels() {
        assert_eq!(Topology::MultiMasterRing.as_str(), "multi-master-ring");
        assert_eq!(
            serde_json::to_string(&Topology::MasterSlavePgStream).unwrap(),
            "\"master-slave-pg-stream\""
        );
        assert!(Topology::MultiMasterWsrep.is_multi_master());
        assert!(!Topology::MultiTierSlave.is_multi_master());
    }

    #[test]
    fn restore_tasks_restart_replication() {
        assert!(JobTask::ZfsSnapback.restarts_replication());
        assert!(JobTask::ReseedMariabackup.restarts_replication());
        assert!(!JobTask::Mariabackup.restarts_replication());
        assert!(!JobTask::Optimize.restarts_replication());
    }

    #[test]
    fn job_task_names_fit_the_column() {
        for t in JobTask::ALL {
            assert!(t.as_str().len() <= 20, "{t} too long");
            assert_eq!(t.as_str().parse::<JobTask>().unwrap(), t);
        }
        assert!("bogus".parse::<JobTask>().is_err());
    }

    #[test]
    fn job_state_codes() {
        assert_eq!(JobState::from_code(1), JobState::Running);
        assert_eq!(JobState::from_code(9), JobState::Terminal);
        assert!(JobState::Success.is_pending());
        assert!(!JobState::Terminal.is_pending());
    }

    #[test]
    fn cookie_file_names_unique() {
        let mut names: Vec<_> = Cookie::ALL.iter().map(|c| c.file_name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Cookie::ALL.len());
    }
}
