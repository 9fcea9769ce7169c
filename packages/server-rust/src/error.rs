//! Error types, one enum per seam.
//!
//! Operational problems observed on the fleet are not errors in this sense:
//! they become state-machine entries. These types cover calls that failed.

use std::time::Duration;

/// Errors from a database session.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("access denied for {user}: {message}")]
    Auth { user: String, message: String },
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("query failed: {sql}: {message}")]
    Query { sql: String, message: String },
    #[error("unsupported on this server: {0}")]
    Unsupported(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl DbError {
    /// Builds a [`DbError::Query`].
    pub fn query(sql: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Query {
            sql: sql.into(),
            message: message.to_string(),
        }
    }

    /// Whether the error is terminal for the node (wrong credentials).
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

/// Errors from the per-node monitor.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("server {0} is not connected")]
    NotConnected(String),
    #[error("replication channel '{channel}' not found on {url}")]
    ChannelNotFound { url: String, channel: String },
    #[error("arbitration lost, {0} cannot become writable")]
    ArbitrationLost(String),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("cookie I/O on {path}: {source}")]
    Cookie {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors aborting a failover or switchover.
#[derive(Debug, thiserror::Error)]
pub enum FailoverError {
    #[error("failover already in progress")]
    InProgress,
    #[error("failover precondition {code} not met")]
    Precondition { code: &'static str },
    #[error("no electable candidate")]
    NoCandidate,
    #[error("no master to switch over from")]
    NoMaster,
    #[error("long running writes on {0}")]
    LongRunningWrites(String),
    #[error("could not freeze master {0}")]
    Freeze(String),
    #[error("candidate {url} did not catch up: {reason}")]
    CatchUp { url: String, reason: String },
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Wait(#[from] WaitError),
}

/// Errors from a rejoin attempt.
#[derive(Debug, thiserror::Error)]
pub enum RejoinError {
    #[error("no master to rejoin {0} to")]
    NoMaster(String),
    #[error("no rejoin method applies to {0}")]
    NoMethod(String),
    #[error("{0} is an extra master in master-slave topology")]
    ExtraMaster(String),
    #[error("waiting for a logical backup before rejoining {0}")]
    WaitingBackup(String),
    #[error("flashback of {url} failed: {reason}")]
    Flashback { url: String, reason: String },
    #[error("rejoin tool failed on {url}: {reason}")]
    Tool { url: String, reason: String },
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Binlog(#[from] BinlogError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("rejoin I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the node job pipeline.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("a {task} job is already pending on {url}")]
    AlreadyPending { task: String, url: String },
    #[error("job {0} not found")]
    NotFound(i64),
    #[error("ssh to {host} failed: {message}")]
    Ssh { host: String, message: String },
    #[error("ssh is disabled")]
    SshDisabled,
    #[error("no job accepted on {0} while a failover is running")]
    InFailover(String),
    #[error("no SST channel configured")]
    NoSstChannel,
    #[error("SST channel failed: {0}")]
    Sst(String),
    #[error("job {0} did not finish in time")]
    Timeout(i64),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("job I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a proxy synchronizer.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy {name} unreachable: {message}")]
    Unreachable { name: String, message: String },
    #[error("proxy {name} rejected command '{command}': {message}")]
    Command {
        name: String,
        command: String,
        message: String,
    },
    #[error("unparsable proxy output: {0}")]
    Parse(String),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("proxy I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the binlog manager.
#[derive(Debug, thiserror::Error)]
pub enum BinlogError {
    #[error("a binlog purge is already running on {0}")]
    PurgeRunning(String),
    #[error("inconsistent binlog state on {url}: {reason}")]
    Inconsistent { url: String, reason: String },
    #[error("binlog reader failed: {0}")]
    Reader(String),
    #[error("binlog copy of {file} failed: {reason}")]
    Copy { file: String, reason: String },
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("binlog I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the wait helpers.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for {what} after {ticks} ticks")]
    Timeout { what: &'static str, ticks: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_error_kinds() {
        let e = DbError::Auth {
            user: "root".into(),
            message: "denied".into(),
        };
        assert!(e.is_auth());
        assert!(!DbError::Tls("x".into()).is_auth());
        assert_eq!(
            DbError::query("SELECT 1", "boom").to_string(),
            "query failed: SELECT 1: boom"
        );
    }

    #[test]
    fn wait_timeout_message() {
        let e = WaitError::Timeout {
            what: "failover end",
            ticks: 60,
        };
        assert_eq!(e.to_string(), "timed out waiting for failover end after 60 ticks");
    }

    #[test]
    fn failover_wraps_monitor_errors() {
        let e: FailoverError = MonitorError::NotConnected("db1:3306".into()).into();
        assert!(e.to_string().contains("db1:3306"));
    }
}
