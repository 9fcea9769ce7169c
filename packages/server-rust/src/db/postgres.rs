//! PostgreSQL streaming-replication sessions.
//!
//! Only the monitoring surface is implemented: ping, `SHOW ALL`, recovery
//! detection and `pg_stat_wal_receiver`. Operations that only exist on the
//! MySQL protocol report [`DbError::Unsupported`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use repman_core::{ChangeSourceOptions, DbVersion, GtidList, IoThread, JobState, MasterStatus, ReplicationStatus};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::{Column, Row};

use super::{DbConnector, DbSession, DbTarget, DbUser, JobRow, JobStore, TaskCount, TlsChoice, VarMap};
use crate::error::DbError;
use crate::logging::log_sql;

/// SQLSTATE `28P01`, invalid password.
const INVALID_PASSWORD: &str = "28P01";

#[derive(Debug, Clone)]
pub struct PgConnector {
    dbname: String,
}

impl PgConnector {
    #[must_use]
    pub fn new(dbname: impl Into<String>) -> Self {
        Self { dbname: dbname.into() }
    }
}

#[async_trait]
impl DbConnector for PgConnector {
    async fn connect(&self, target: &DbTarget) -> Result<Arc<dyn DbSession>, DbError> {
        let ssl = if target.tls == TlsChoice::Disabled {
            PgSslMode::Disable
        } else {
            PgSslMode::Require
        };
        let opts = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .username(&target.user)
            .password(&target.password)
            .database(&self.dbname)
            .ssl_mode(ssl);
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(target.connect_timeout)
            .max_lifetime(target.max_lifetime)
            .connect_with(opts)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.code().as_deref() == Some(INVALID_PASSWORD) => {
                    DbError::Auth {
                        user: target.user.clone(),
                        message: db.message().to_string(),
                    }
                }
                sqlx::Error::Tls(err) => DbError::Tls(err.to_string()),
                other => DbError::Connect(other.to_string()),
            })?;
        Ok(Arc::new(PgSession {
            url: target.url.clone(),
            pool,
            read_timeout: target.read_timeout,
        }))
    }
}

pub struct PgSession {
    url: String,
    pool: PgPool,
    read_timeout: Duration,
}

impl PgSession {
    async fn rows(&self, statement: &str) -> Result<Vec<sqlx::postgres::PgRow>, DbError> {
        let result = match tokio::time::timeout(
            self.read_timeout,
            sqlx::raw_sql(statement).fetch_all(&self.pool),
        )
        .await
        {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(e)) => Err(DbError::query(statement, e)),
            Err(_) => Err(DbError::Timeout(self.read_timeout)),
        };
        match &result {
            Ok(_) => log_sql(&self.url, statement, Ok(())),
            Err(e) => log_sql(&self.url, statement, Err(e as &dyn std::fmt::Display)),
        }
        result
    }

    async fn in_recovery(&self) -> Result<bool, DbError> {
        let rows = self.rows("SELECT pg_is_in_recovery()").await?;
        Ok(rows
            .first()
            .and_then(|r| r.try_get::<bool, _>(0).ok())
            .unwrap_or(false))
    }

    fn unsupported(what: &str) -> DbError {
        DbError::Unsupported(format!("{what} on PostgreSQL"))
    }
}

fn text(row: &sqlx::postgres::PgRow, idx: usize) -> String {
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.unwrap_or_default();
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(|n| n.to_string()).unwrap_or_default();
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|n| n.to_string()).unwrap_or_default();
    }
    String::new()
}

#[async_trait]
impl JobStore for PgSession {
    async fn create_jobs_table(&self) -> Result<(), DbError> {
        Err(Self::unsupported("job queue"))
    }

    async fn pending_job_count(&self, _task: &str) -> Result<u32, DbError> {
        Err(Self::unsupported("job queue"))
    }

    async fn pending_jobs_by_task(&self) -> Result<Vec<TaskCount>, DbError> {
        Err(Self::unsupported("job queue"))
    }

    async fn insert_job(&self, _task: &str, _port: u16, _server: &str) -> Result<i64, DbError> {
        Err(Self::unsupported("job queue"))
    }

    async fn purge_pending_jobs(&self, _task: &str) -> Result<u64, DbError> {
        Err(Self::unsupported("job queue"))
    }

    async fn job(&self, _id: i64) -> Result<Option<JobRow>, DbError> {
        Err(Self::unsupported("job queue"))
    }

    async fn set_job_state(&self, _id: i64, _state: JobState, _done: bool, _result: &str) -> Result<(), DbError> {
        Err(Self::unsupported("job queue"))
    }
}

#[async_trait]
impl DbSession for PgSession {
    async fn ping(&self) -> Result<(), DbError> {
        self.rows("SELECT 1").await.map(|_| ())
    }

    async fn variables(&self) -> Result<VarMap, DbError> {
        let rows = self.rows("SHOW ALL").await?;
        let mut vars: VarMap = rows
            .iter()
            .map(|r| (text(r, 0).to_ascii_uppercase(), text(r, 1)))
            .collect();
        let version = self.rows("SELECT version()").await?;
        if let Some(v) = version.first() {
            vars.insert("VERSION".into(), text(v, 0));
        }
        let ro = self.in_recovery().await?;
        vars.insert("READ_ONLY".into(), if ro { "ON" } else { "OFF" }.into());
        Ok(vars)
    }

    async fn status(&self) -> Result<VarMap, DbError> {
        Ok(VarMap::new())
    }

    async fn replication_status(&self, _version: &DbVersion) -> Result<Vec<ReplicationStatus>, DbError> {
        if !self.in_recovery().await? {
            return Ok(Vec::new());
        }
        let rows = self
            .rows("SELECT status, sender_host, sender_port::bigint, \
                   COALESCE(EXTRACT(EPOCH FROM (now() - last_msg_receipt_time))::bigint, 0) \
                   FROM pg_stat_wal_receiver")
            .await?;
        Ok(rows
            .iter()
            .map(|r| {
                let streaming = text(r, 0) == "streaming";
                ReplicationStatus {
                    master_host: text(r, 1),
                    master_port: text(r, 2).parse().unwrap_or(5432),
                    io_running: if streaming { IoThread::Yes } else { IoThread::Connecting },
                    sql_running: true,
                    seconds_behind_master: text(r, 3).parse().ok(),
                    ..ReplicationStatus::default()
                }
            })
            .collect())
    }

    async fn master_status(&self, _version: &DbVersion) -> Result<MasterStatus, DbError> {
        let rows = self.rows("SELECT pg_current_wal_lsn()::text").await?;
        Ok(MasterStatus {
            file: rows.first().map(|r| text(r, 0)).unwrap_or_default(),
            ..MasterStatus::default()
        })
    }

    async fn binary_logs(&self) -> Result<Vec<(String, u64)>, DbError> {
        Ok(Vec::new())
    }

    async fn binlog_dump_count(&self) -> Result<u32, DbError> {
        let rows = self.rows("SELECT COUNT(*) FROM pg_stat_replication").await?;
        Ok(rows.first().and_then(|r| text(r, 0).parse().ok()).unwrap_or(0))
    }

    async fn schemas(&self) -> Result<Vec<String>, DbError> {
        let rows = self
            .rows("SELECT datname FROM pg_database WHERE NOT datistemplate")
            .await?;
        Ok(rows.iter().map(|r| text(r, 0)).collect())
    }

    async fn users(&self) -> Result<Vec<DbUser>, DbError> {
        let rows = self.rows("SELECT rolname FROM pg_roles WHERE rolcanlogin").await?;
        Ok(rows
            .iter()
            .map(|r| DbUser {
                user: text(r, 0),
                host: "%".into(),
                password: String::new(),
            })
            .collect())
    }

    async fn plugins(&self) -> Result<HashMap<String, String>, DbError> {
        let rows = self.rows("SELECT extname, extversion FROM pg_extension").await?;
        Ok(rows.iter().map(|r| (text(r, 0), "ACTIVE".to_string())).collect())
    }

    async fn long_running_writes(&self, _min_secs: u64) -> Result<u32, DbError> {
        Ok(0)
    }

    async fn set_read_only(&self, _on: bool) -> Result<(), DbError> {
        Err(Self::unsupported("read_only"))
    }

    async fn set_super_read_only(&self, _on: bool) -> Result<(), DbError> {
        Err(Self::unsupported("super_read_only"))
    }

    async fn set_global(&self, name: &str, _value: &str) -> Result<(), DbError> {
        Err(Self::unsupported(name))
    }

    async fn change_source(&self, _opts: &ChangeSourceOptions, _version: &DbVersion) -> Result<(), DbError> {
        Err(Self::unsupported("CHANGE REPLICATION SOURCE"))
    }

    async fn start_replica(&self, _channel: &str, _version: &DbVersion) -> Result<(), DbError> {
        Err(Self::unsupported("START REPLICA"))
    }

    async fn stop_replica(&self, _channel: &str, _version: &DbVersion) -> Result<(), DbError> {
        Err(Self::unsupported("STOP REPLICA"))
    }

    async fn reset_replica(&self, _channel: &str, _all: bool, _version: &DbVersion) -> Result<(), DbError> {
        Err(Self::unsupported("RESET REPLICA"))
    }

    async fn reset_master(&self) -> Result<(), DbError> {
        Err(Self::unsupported("RESET MASTER"))
    }

    async fn set_gtid_slave_pos(&self, _gtid: &GtidList) -> Result<(), DbError> {
        Err(Self::unsupported("gtid_slave_pos"))
    }

    async fn skip_replication_event(&self, _channel: &str) -> Result<(), DbError> {
        Err(Self::unsupported("skip counter"))
    }

    async fn master_pos_wait(&self, _file: &str, _pos: u64, _timeout: Duration) -> Result<(), DbError> {
        Err(Self::unsupported("MASTER_POS_WAIT"))
    }

    async fn master_gtid_wait(&self, _gtid: &str, _timeout: Duration, _version: &DbVersion) -> Result<(), DbError> {
        Err(Self::unsupported("MASTER_GTID_WAIT"))
    }

    async fn purge_binary_logs_to(&self, _file: &str) -> Result<(), DbError> {
        Err(Self::unsupported("binlog purge"))
    }

    async fn purge_binary_logs_before(&self, _unix_ts: i64) -> Result<(), DbError> {
        Err(Self::unsupported("binlog purge"))
    }

    async fn flush_tables(&self) -> Result<(), DbError> {
        Ok(())
    }

    async fn flush_tables_with_read_lock(&self) -> Result<(), DbError> {
        Err(Self::unsupported("global read lock"))
    }

    async fn unlock_tables(&self) -> Result<(), DbError> {
        Ok(())
    }

    async fn flush_logs(&self) -> Result<(), DbError> {
        self.rows("SELECT pg_switch_wal()").await.map(|_| ())
    }

    async fn install_plugin(&self, name: &str, _soname: &str) -> Result<(), DbError> {
        Err(Self::unsupported(name))
    }

    async fn exec(&self, statement: &str, _no_binlog: bool) -> Result<(), DbError> {
        self.rows(statement).await.map(|_| ())
    }

    async fn query(&self, statement: &str) -> Result<Vec<HashMap<String, String>>, DbError> {
        let rows = self.rows(statement).await?;
        Ok(rows
            .iter()
            .map(|r| {
                r.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (c.name().to_string(), text(r, i)))
                    .collect()
            })
            .collect())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
