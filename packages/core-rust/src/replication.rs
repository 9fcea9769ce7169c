//! Replication records: per-channel replica status, source binlog status,
//! and the parameters of a `CHANGE REPLICATION SOURCE` request.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::gtid::GtidList;

/// State of the replica IO thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IoThread {
    Yes,
    #[default]
    No,
    Connecting,
}

impl IoThread {
    /// Parses `Slave_IO_Running`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "Yes" => Self::Yes,
            "Connecting" => Self::Connecting,
            _ => Self::No,
        }
    }

    #[must_use]
    pub fn is_running(self) -> bool {
        self == Self::Yes
    }
}

/// One inbound replication channel as reported by `SHOW ALL SLAVES STATUS`
/// (or `SHOW REPLICA STATUS` per channel).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationStatus {
    /// Channel (`Connection_name`); empty for the default channel.
    pub channel: String,
    pub master_host: String,
    pub master_port: u16,
    pub master_user: String,
    /// `Master_Server_Id`, 0 when never connected.
    pub master_server_id: u64,
    pub master_log_file: String,
    pub read_master_log_pos: u64,
    pub relay_master_log_file: String,
    pub exec_master_log_pos: u64,
    pub io_running: IoThread,
    pub sql_running: bool,
    /// `Seconds_Behind_Master`; `None` when NULL.
    pub seconds_behind_master: Option<i64>,
    pub last_io_errno: u32,
    pub last_io_error: String,
    pub last_sql_errno: u32,
    pub last_sql_error: String,
    /// `Using_Gtid`: `No`, `Slave_Pos` or `Current_Pos` (MariaDB), or
    /// `Auto_Position` rendered as `Yes`/`No` on MySQL.
    pub using_gtid: String,
    pub gtid_io_pos: GtidList,
    pub heartbeat_period: f64,
    pub received_heartbeats: u64,
    pub sql_delay: u64,
    /// `Slave_SQL_Running_State`, used to detect a drained relay log.
    pub sql_running_state: String,
}

impl ReplicationStatus {
    #[must_use]
    pub fn threads_running(&self) -> bool {
        self.io_running.is_running() && self.sql_running
    }

    #[must_use]
    pub fn uses_gtid(&self) -> bool {
        !matches!(self.using_gtid.as_str(), "" | "No")
    }

    /// Relay log fully applied: SQL thread reached what the IO thread fetched.
    #[must_use]
    pub fn relay_drained(&self) -> bool {
        self.relay_master_log_file == self.master_log_file
            && self.exec_master_log_pos >= self.read_master_log_pos
    }

    /// `host:port` of the configured source.
    #[must_use]
    pub fn source_endpoint(&self) -> String {
        format!("{}:{}", self.master_host, self.master_port)
    }
}

/// `SHOW MASTER STATUS` plus the executed GTID set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterStatus {
    pub file: String,
    pub position: u64,
    pub executed_gtid_set: String,
}

// ---------------------------------------------------------------------------
// ChangeSourceOptions
// ---------------------------------------------------------------------------

/// How a replica locates its starting point on the new source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicationMode {
    /// MariaDB `MASTER_USE_GTID = slave_pos`.
    SlavePos,
    /// MariaDB `MASTER_USE_GTID = current_pos`.
    CurrentPos,
    /// MySQL `MASTER_AUTO_POSITION = 1`.
    MasterAutoPosition,
    /// Explicit file and position.
    Positional,
    /// MaxScale binlog server: positional without GTID clauses.
    Mxs,
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SlavePos => "SLAVE_POS",
            Self::CurrentPos => "CURRENT_POS",
            Self::MasterAutoPosition => "MASTER_AUTO_POSITION",
            Self::Positional => "POSITIONAL",
            Self::Mxs => "MXS",
        })
    }
}

/// Parameters of a `CHANGE REPLICATION SOURCE TO` request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSourceOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// `MASTER_CONNECT_RETRY` seconds.
    pub retry: u32,
    /// `MASTER_HEARTBEAT_PERIOD` seconds.
    pub heartbeat: u32,
    pub mode: ReplicationMode,
    pub logfile: String,
    pub logpos: u64,
    pub ssl: bool,
    pub channel: String,
    pub is_delayed: bool,
    pub delay: u64,
    pub postgres_db: String,
}

impl fmt::Debug for ChangeSourceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeSourceOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("mode", &self.mode)
            .field("logfile", &self.logfile)
            .field("logpos", &self.logpos)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl ChangeSourceOptions {
    /// Options with default retry/heartbeat for `host:port` in `mode`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, mode: ReplicationMode) -> Self {
        Self {
            host: host.into(),
            port,
            user: String::new(),
            password: String::new(),
            retry: 10,
            heartbeat: 3,
            mode,
            logfile: String::new(),
            logpos: 0,
            ssl: false,
            channel: String::new(),
            is_delayed: false,
            delay: 0,
            postgres_db: String::new(),
        }
    }

    #[must_use]
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    #[must_use]
    pub fn position(mut self, logfile: impl Into<String>, logpos: u64) -> Self {
        self.logfile = logfile.into();
        self.logpos = logpos;
        self
    }

    #[must_use]
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }
}
