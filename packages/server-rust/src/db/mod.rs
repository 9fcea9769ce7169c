//! Database session seam.
//!
//! The monitor and the engines talk to nodes exclusively through
//! [`DbSession`]. The sqlx-backed implementations live in [`mysql`] and
//! [`postgres`]; [`fake`] is an in-memory fleet used by tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use repman_core::{ChangeSourceOptions, DbVersion, GtidList, JobState, JobTask, MasterStatus, ReplicationStatus};
use serde::{Deserialize, Serialize};

use crate::error::DbError;

pub mod dsn;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sql;

/// Upper-cased variable or status name to its textual value.
pub type VarMap = HashMap<String, String>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One account as stored in `mysql.user`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbUser {
    pub user: String,
    pub host: String,
    /// Password hash (`authentication_string`).
    pub password: String,
}

/// One row of `replication_manager_schema.jobs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRow {
    pub id: i64,
    pub task: String,
    pub port: u16,
    pub server: String,
    pub done: bool,
    pub state: JobState,
    pub result: String,
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl JobRow {
    /// Parsed task name, `None` for tasks this build does not know.
    #[must_use]
    pub fn job_task(&self) -> Option<JobTask> {
        self.task.parse().ok()
    }
}

/// Pending rows of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCount {
    pub task: String,
    pub count: u32,
    pub max_id: i64,
}

/// Which TLS profile a connection attempt uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsChoice {
    Disabled,
    Current,
    Old,
}

/// Everything needed to open a session to one node.
#[derive(Clone, PartialEq, Eq)]
pub struct DbTarget {
    pub url: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub tls: TlsChoice,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_lifetime: Duration,
}

impl std::fmt::Debug for DbTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbTarget")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Client of the per-node durable job queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Creates the schema, table and indexes when missing.
    async fn create_jobs_table(&self) -> Result<(), DbError>;

    /// Number of rows of `task` with `state < 3`.
    async fn pending_job_count(&self, task: &str) -> Result<u32, DbError>;

    /// Pending rows grouped by task.
    async fn pending_jobs_by_task(&self) -> Result<Vec<TaskCount>, DbError>;

    /// Inserts a queued row without binary logging; returns its id.
    async fn insert_job(&self, task: &str, port: u16, server: &str) -> Result<i64, DbError>;

    /// Marks every pending row of `task` except the newest as terminal.
    async fn purge_pending_jobs(&self, task: &str) -> Result<u64, DbError>;

    async fn job(&self, id: i64) -> Result<Option<JobRow>, DbError>;

    async fn set_job_state(&self, id: i64, state: JobState, done: bool, result: &str) -> Result<(), DbError>;
}

/// A live session (pool) to one database node.
///
/// Every method is a suspension point; callers never hold a lock across it.
#[async_trait]
pub trait DbSession: JobStore {
    async fn ping(&self) -> Result<(), DbError>;

    /// `SHOW GLOBAL VARIABLES`, names upper-cased.
    async fn variables(&self) -> Result<VarMap, DbError>;

    /// `SHOW GLOBAL STATUS`, names upper-cased.
    async fn status(&self) -> Result<VarMap, DbError>;

    /// Every inbound replication channel.
    async fn replication_status(&self, version: &DbVersion) -> Result<Vec<ReplicationStatus>, DbError>;

    async fn master_status(&self, version: &DbVersion) -> Result<MasterStatus, DbError>;

    /// `SHOW BINARY LOGS`, oldest first.
    async fn binary_logs(&self) -> Result<Vec<(String, u64)>, DbError>;

    /// Number of connected binlog dump threads.
    async fn binlog_dump_count(&self) -> Result<u32, DbError>;

    async fn schemas(&self) -> Result<Vec<String>, DbError>;

    async fn users(&self) -> Result<Vec<DbUser>, DbError>;

    /// Plugin name to status.
    async fn plugins(&self) -> Result<HashMap<String, String>, DbError>;

    /// Write statements running for at least `min_secs`.
    async fn long_running_writes(&self, min_secs: u64) -> Result<u32, DbError>;

    async fn set_read_only(&self, on: bool) -> Result<(), DbError>;

    async fn set_super_read_only(&self, on: bool) -> Result<(), DbError>;

    /// `SET GLOBAL name = value`.
    async fn set_global(&self, name: &str, value: &str) -> Result<(), DbError>;

    async fn change_source(&self, opts: &ChangeSourceOptions, version: &DbVersion) -> Result<(), DbError>;

    async fn start_replica(&self, channel: &str, version: &DbVersion) -> Result<(), DbError>;

    async fn stop_replica(&self, channel: &str, version: &DbVersion) -> Result<(), DbError>;

    /// `RESET SLAVE [ALL]`.
    async fn reset_replica(&self, channel: &str, all: bool, version: &DbVersion) -> Result<(), DbError>;

    async fn reset_master(&self) -> Result<(), DbError>;

    async fn set_gtid_slave_pos(&self, gtid: &GtidList) -> Result<(), DbError>;

    /// Skips one event on a stopped SQL thread.
    async fn skip_replication_event(&self, channel: &str) -> Result<(), DbError>;

    /// Waits until the replica applied up to `file:pos`.
    async fn master_pos_wait(&self, file: &str, pos: u64, timeout: Duration) -> Result<(), DbError>;

    /// Waits until the replica executed `gtid`.
    async fn master_gtid_wait(&self, gtid: &str, timeout: Duration, version: &DbVersion) -> Result<(), DbError>;

    async fn purge_binary_logs_to(&self, file: &str) -> Result<(), DbError>;

    async fn purge_binary_logs_before(&self, unix_ts: i64) -> Result<(), DbError>;

    /// `FLUSH NO_WRITE_TO_BINLOG TABLES`.
    async fn flush_tables(&self) -> Result<(), DbError>;

    /// Takes the global read lock on a dedicated connection.
    async fn flush_tables_with_read_lock(&self) -> Result<(), DbError>;

    /// Releases the lock taken by [`Self::flush_tables_with_read_lock`].
    async fn unlock_tables(&self) -> Result<(), DbError>;

    async fn flush_logs(&self) -> Result<(), DbError>;

    async fn install_plugin(&self, name: &str, soname: &str) -> Result<(), DbError>;

    /// Runs a statement that returns no rows, with binary logging disabled
    /// when `no_binlog` is set.
    async fn exec(&self, sql: &str, no_binlog: bool) -> Result<(), DbError>;

    /// Runs a query and returns each row as column name to text.
    async fn query(&self, sql: &str) -> Result<Vec<HashMap<String, String>>, DbError>;

    /// Releases pooled connections.
    async fn close(&self);
}

/// Opens sessions. One connector is shared by a cluster.
#[async_trait]
pub trait DbConnector: Send + Sync {
    async fn connect(&self, target: &DbTarget) -> Result<Arc<dyn DbSession>, DbError>;
}

/// Reads a boolean-ish variable (`ON`, `1`, `YES`).
#[must_use]
pub fn var_on(vars: &VarMap, name: &str) -> bool {
    vars.get(name)
        .is_some_and(|v| matches!(v.to_ascii_uppercase().as_str(), "ON" | "1" | "YES" | "TRUE" | "FORCE"))
}

/// Reads a numeric variable, 0 when absent or not numeric.
#[must_use]
pub fn var_u64(vars: &VarMap, name: &str) -> u64 {
    vars.get(name).and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_helpers() {
        let mut vars = VarMap::new();
        vars.insert("READ_ONLY".into(), "ON".into());
        vars.insert("SYNC_BINLOG".into(), "1".into());
        vars.insert("LOG_BIN".into(), "OFF".into());
        assert!(var_on(&vars, "READ_ONLY"));
        assert!(var_on(&vars, "SYNC_BINLOG"));
        assert!(!var_on(&vars, "LOG_BIN"));
        assert!(!var_on(&vars, "MISSING"));
        assert_eq!(var_u64(&vars, "SYNC_BINLOG"), 1);
        assert_eq!(var_u64(&vars, "READ_ONLY"), 0);
    }

    #[test]
    fn job_row_task_parsing() {
        let row = JobRow {
            id: 1,
            task: "reseedmysqldump".into(),
            port: 4444,
            server: "repman".into(),
            done: false,
            state: JobState::Queued,
            result: String::new(),
            start: None,
            end: None,
        };
        assert_eq!(row.job_task(), Some(JobTask::ReseedMysqldump));
    }
}
