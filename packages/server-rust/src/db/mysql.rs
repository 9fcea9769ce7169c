//! MySQL / MariaDB sessions over a sqlx pool.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use repman_core::{ChangeSourceOptions, DbVersion, GtidList, JobState, MasterStatus, ReplicationStatus};
use sqlx::mysql::{
    MySqlConnectOptions, MySqlDatabaseError, MySqlPool, MySqlPoolOptions, MySqlQueryResult, MySqlRow, MySqlSslMode,
};
use sqlx::pool::PoolConnection;
use sqlx::{Column, MySql, Row};
use tokio::sync::Mutex;

use super::{sql, DbConnector, DbSession, DbTarget, DbUser, JobRow, JobStore, TaskCount, TlsChoice, VarMap};
use crate::config::TlsProfiles;
use crate::error::DbError;
use crate::logging::log_sql;

const ER_ACCESS_DENIED: u16 = 1045;

/// Opens sqlx pools against MySQL-protocol servers.
#[derive(Debug, Clone, Default)]
pub struct MySqlConnector {
    tls: Option<TlsProfiles>,
    max_connections: u32,
}

impl MySqlConnector {
    #[must_use]
    pub fn new(tls: Option<TlsProfiles>) -> Self {
        Self {
            tls,
            max_connections: 4,
        }
    }

    fn options(&self, target: &DbTarget) -> MySqlConnectOptions {
        let opts = MySqlConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .username(&target.user)
            .password(&target.password);
        let files = match (target.tls, &self.tls) {
            (TlsChoice::Current, Some(p)) => Some(&p.current),
            (TlsChoice::Old, Some(p)) => p.old.as_ref(),
            _ => None,
        };
        let Some(files) = files else {
            return opts.ssl_mode(MySqlSslMode::Disabled);
        };
        let mut opts = opts.ssl_mode(MySqlSslMode::VerifyCa).ssl_ca(&files.ca_cert);
        if let Some(cert) = &files.client_cert {
            opts = opts.ssl_client_cert(cert);
        }
        if let Some(key) = &files.client_key {
            opts = opts.ssl_client_key(key);
        }
        opts
    }
}

fn connect_error(user: &str, e: sqlx::Error) -> DbError {
    match e {
        sqlx::Error::Database(db)
            if db
                .try_downcast_ref::<MySqlDatabaseError>()
                .is_some_and(|m| m.number() == ER_ACCESS_DENIED) =>
        {
            DbError::Auth {
                user: user.to_string(),
                message: db.message().to_string(),
            }
        }
        sqlx::Error::Tls(err) => DbError::Tls(err.to_string()),
        other => DbError::Connect(other.to_string()),
    }
}

#[async_trait]
impl DbConnector for MySqlConnector {
    async fn connect(&self, target: &DbTarget) -> Result<Arc<dyn DbSession>, DbError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(self.max_connections.max(2))
            .acquire_timeout(target.connect_timeout)
            .max_lifetime(target.max_lifetime)
            .connect_with(self.options(target))
            .await
            .map_err(|e| connect_error(&target.user, e))?;
        Ok(Arc::new(MySqlSession {
            url: target.url.clone(),
            pool,
            read_timeout: target.read_timeout,
            lock_conn: Mutex::new(None),
        }))
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

/// Renders any scalar cell as text; NULL becomes the empty string.
fn cell(row: &MySqlRow, idx: usize) -> String {
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.unwrap_or_default();
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
        return v.map(|n| n.to_string()).unwrap_or_default();
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(|n| n.to_string()).unwrap_or_default();
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(|n| n.to_string()).unwrap_or_default();
    }
    String::new()
}

fn row_map(row: &MySqlRow) -> HashMap<String, String> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name().to_string(), cell(row, i)))
        .collect()
}

fn name_value_map(rows: &[MySqlRow]) -> VarMap {
    rows.iter()
        .map(|r| (cell(r, 0).to_ascii_uppercase(), cell(r, 1)))
        .collect()
}

// ---------------------------------------------------------------------------
// Connection-scoped statements
// ---------------------------------------------------------------------------

/// Statement future pinned to one borrowed pool connection.
type SqlFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, sqlx::Error>> + Send + 'a>>;

/// Runs `statement` on one pooled connection with `sql_log_bin=0`.
fn no_binlog<'a>(pool: &'a MySqlPool, statement: &'a str) -> SqlFuture<'a, MySqlQueryResult> {
    Box::pin(async move {
        let mut conn = pool.acquire().await?;
        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql("SET sql_log_bin=0")).await?;
        let res = sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(statement)).await;
        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql("SET sql_log_bin=1")).await?;
        res
    })
}

const INSERT_JOB: &str = "INSERT INTO replication_manager_schema.jobs(task, port, server, start) VALUES(?, ?, ?, NOW())";

fn insert_job_no_binlog<'a>(pool: &'a MySqlPool, task: &'a str, port: u16, server: &'a str) -> SqlFuture<'a, MySqlQueryResult> {
    Box::pin(async move {
        let mut conn = pool.acquire().await?;
        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql("SET sql_log_bin=0")).await?;
        let res = sqlx::query(INSERT_JOB)
            .bind(task)
            .bind(port)
            .bind(server)
            .execute(&mut *conn)
            .await;
        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql("SET sql_log_bin=1")).await?;
        res
    })
}

/// Takes a connection and leaves `FLUSH TABLES WITH READ LOCK` held on it.
fn locked_connection(pool: &MySqlPool) -> SqlFuture<'_, PoolConnection<MySql>> {
    Box::pin(async move {
        let mut conn = pool.acquire().await?;
        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql("FLUSH TABLES WITH READ LOCK")).await?;
        Ok(conn)
    })
}

fn unlock(mut conn: PoolConnection<MySql>) -> SqlFuture<'static, ()> {
    Box::pin(async move { sqlx::Executor::execute(&mut *conn, sqlx::raw_sql("UNLOCK TABLES")).await.map(|_| ()) })
}

// ---------------------------------------------------------------------------
// MySqlSession
// ---------------------------------------------------------------------------

/// Pooled session to one node.
pub struct MySqlSession {
    url: String,
    pool: MySqlPool,
    read_timeout: Duration,
    /// Connection holding `FLUSH TABLES WITH READ LOCK`.
    lock_conn: Mutex<Option<PoolConnection<MySql>>>,
}

impl MySqlSession {
    async fn timed<T, F>(&self, statement: &str, fut: F) -> Result<T, DbError>
    where
        F: Future<Output = Result<T, sqlx::Error>> + Send,
    {
        let result = match tokio::time::timeout(self.read_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(DbError::query(statement, e)),
            Err(_) => Err(DbError::Timeout(self.read_timeout)),
        };
        match &result {
            Ok(_) => log_sql(&self.url, statement, Ok(())),
            Err(e) => log_sql(&self.url, statement, Err(e as &dyn std::fmt::Display)),
        }
        result
    }

    async fn run(&self, statement: &str) -> Result<(), DbError> {
        self.timed(statement, async {
            sqlx::raw_sql(statement).execute(&self.pool).await.map(|_| ())
        })
        .await
    }

    async fn rows(&self, statement: &str) -> Result<Vec<MySqlRow>, DbError> {
        self.timed(statement, sqlx::raw_sql(statement).fetch_all(&self.pool))
            .await
    }

    async fn scalar(&self, statement: &str) -> Result<Option<i64>, DbError> {
        let rows = self.rows(statement).await?;
        Ok(rows.first().and_then(|r| cell(r, 0).trim().parse().ok()))
    }

    /// Runs `statement` on one connection with `sql_log_bin=0`.
    async fn run_no_binlog(&self, statement: &str) -> Result<u64, DbError> {
        let res = self.timed(statement, no_binlog(&self.pool, statement)).await?;
        Ok(res.last_insert_id())
    }
}

#[async_trait]
impl JobStore for MySqlSession {
    async fn create_jobs_table(&self) -> Result<(), DbError> {
        self.run_no_binlog(sql::JOBS_SCHEMA).await?;
        self.run_no_binlog(sql::JOBS_TABLE).await?;
        for m in sql::JOBS_MIGRATIONS {
            self.run_no_binlog(m).await?;
        }
        Ok(())
    }

    async fn pending_job_count(&self, task: &str) -> Result<u32, DbError> {
        let q = "SELECT COUNT(*) FROM replication_manager_schema.jobs WHERE task=? AND state<3";
        let n: i64 = self
            .timed(q, async {
                sqlx::query(q).bind(task).fetch_one(&self.pool).await?.try_get(0)
            })
            .await?;
        Ok(u32::try_from(n).unwrap_or(u32::MAX))
    }

    async fn pending_jobs_by_task(&self) -> Result<Vec<TaskCount>, DbError> {
        let q = "SELECT task, COUNT(*), MAX(id) FROM replication_manager_schema.jobs WHERE state<3 GROUP BY task";
        let rows = self.rows(q).await?;
        Ok(rows
            .iter()
            .map(|r| TaskCount {
                task: cell(r, 0),
                count: cell(r, 1).parse().unwrap_or(0),
                max_id: cell(r, 2).parse().unwrap_or(0),
            })
            .collect())
    }

    async fn insert_job(&self, task: &str, port: u16, server: &str) -> Result<i64, DbError> {
        let res = self
            .timed(INSERT_JOB, insert_job_no_binlog(&self.pool, task, port, server))
            .await?;
        Ok(i64::try_from(res.last_insert_id()).unwrap_or(i64::MAX))
    }

    async fn purge_pending_jobs(&self, task: &str) -> Result<u64, DbError> {
        let statement = format!(
            "UPDATE replication_manager_schema.jobs j \
             JOIN (SELECT MAX(id) AS keep FROM replication_manager_schema.jobs WHERE task={t} AND state<3) k \
             SET j.state=3, j.done=1, j.result='purged', j.end=NOW() \
             WHERE j.task={t} AND j.state<3 AND j.id<k.keep",
            t = sql::quote(task)
        );
        let res = self.timed(&statement, no_binlog(&self.pool, &statement)).await?;
        Ok(res.rows_affected())
    }

    async fn job(&self, id: i64) -> Result<Option<JobRow>, DbError> {
        let q = "SELECT id, task, port, server, done, state, result, start, end \
                 FROM replication_manager_schema.jobs WHERE id=?";
        let row = self
            .timed(q, sqlx::query(q).bind(id).fetch_optional(&self.pool))
            .await?;
        Ok(row.map(|r| JobRow {
            id: cell(&r, 0).parse().unwrap_or(id),
            task: cell(&r, 1),
            port: cell(&r, 2).parse().unwrap_or(0),
            server: cell(&r, 3),
            done: cell(&r, 4) == "1",
            state: JobState::from_code(cell(&r, 5).parse().unwrap_or(3)),
            result: cell(&r, 6),
            start: r.try_get::<Option<chrono::NaiveDateTime>, _>(7).ok().flatten(),
            end: r.try_get::<Option<chrono::NaiveDateTime>, _>(8).ok().flatten(),
        }))
    }

    async fn set_job_state(&self, id: i64, state: JobState, done: bool, result: &str) -> Result<(), DbError> {
        let statement = format!(
            "UPDATE replication_manager_schema.jobs SET state={}, done={}, result={}{} WHERE id={id}",
            state.code(),
            u8::from(done),
            sql::quote(result),
            if done { ", end=NOW()" } else { "" },
        );
        self.run_no_binlog(&statement).await.map(|_| ())
    }
}

#[async_trait]
impl DbSession for MySqlSession {
    async fn ping(&self) -> Result<(), DbError> {
        self.run("SELECT 1").await
    }

    async fn variables(&self) -> Result<VarMap, DbError> {
        Ok(name_value_map(&self.rows("SHOW GLOBAL VARIABLES").await?))
    }

    async fn status(&self) -> Result<VarMap, DbError> {
        Ok(name_value_map(&self.rows("SHOW GLOBAL STATUS").await?))
    }

    async fn replication_status(&self, version: &DbVersion) -> Result<Vec<ReplicationStatus>, DbError> {
        let rows = self.rows(sql::show_replication_status(version)).await?;
        Ok(rows
            .iter()
            .map(|r| sql::parse_replication_row(&row_map(r), version))
            .collect())
    }

    async fn master_status(&self, version: &DbVersion) -> Result<MasterStatus, DbError> {
        let rows = self.rows(sql::show_master_status(version)).await?;
        let Some(row) = rows.first() else {
            return Ok(MasterStatus::default());
        };
        let m = row_map(row);
        Ok(MasterStatus {
            file: m.get("File").cloned().unwrap_or_default(),
            position: m.get("Position").and_then(|p| p.parse().ok()).unwrap_or(0),
            executed_gtid_set: m.get("Executed_Gtid_Set").cloned().unwrap_or_default(),
        })
    }

    async fn binary_logs(&self) -> Result<Vec<(String, u64)>, DbError> {
        let rows = self.rows("SHOW BINARY LOGS").await?;
        Ok(rows
            .iter()
            .map(|r| (cell(r, 0), cell(r, 1).parse().unwrap_or(0)))
            .collect())
    }

    async fn binlog_dump_count(&self) -> Result<u32, DbError> {
        let n = self.scalar(sql::BINLOG_DUMP_COUNT).await?.unwrap_or(0);
        Ok(u32::try_from(n).unwrap_or(0))
    }

    async fn schemas(&self) -> Result<Vec<String>, DbError> {
        let rows = self.rows("SHOW DATABASES").await?;
        Ok(rows.iter().map(|r| cell(r, 0)).collect())
    }

    async fn users(&self) -> Result<Vec<DbUser>, DbError> {
        let rows = self.rows(sql::USERS).await?;
        Ok(rows
            .iter()
            .map(|r| DbUser {
                user: cell(r, 0),
                host: cell(r, 1),
                password: cell(r, 2),
            })
            .collect())
    }

    async fn plugins(&self) -> Result<HashMap<String, String>, DbError> {
        let rows = self.rows(sql::PLUGINS).await?;
        Ok(rows.iter().map(|r| (cell(r, 0), cell(r, 1))).collect())
    }

    async fn long_running_writes(&self, min_secs: u64) -> Result<u32, DbError> {
        let n = self.scalar(&sql::long_running_writes(min_secs)).await?.unwrap_or(0);
        Ok(u32::try_from(n).unwrap_or(0))
    }

    async fn set_read_only(&self, on: bool) -> Result<(), DbError> {
        self.run(&sql::set_read_only(on)).await
    }

    async fn set_super_read_only(&self, on: bool) -> Result<(), DbError> {
        self.run(&sql::set_super_read_only(on)).await
    }

    async fn set_global(&self, name: &str, value: &str) -> Result<(), DbError> {
        self.run(&sql::set_global(name, value)).await
    }

    async fn change_source(&self, opts: &ChangeSourceOptions, version: &DbVersion) -> Result<(), DbError> {
        self.run(&sql::change_source(opts, version)).await
    }

    async fn start_replica(&self, channel: &str, version: &DbVersion) -> Result<(), DbError> {
        self.run(&sql::start_replica(channel, version)).await
    }

    async fn stop_replica(&self, channel: &str, version: &DbVersion) -> Result<(), DbError> {
        self.run(&sql::stop_replica(channel, version)).await
    }

    async fn reset_replica(&self, channel: &str, all: bool, version: &DbVersion) -> Result<(), DbError> {
        self.run(&sql::reset_replica(channel, all, version)).await
    }

    async fn reset_master(&self) -> Result<(), DbError> {
        self.run("RESET MASTER").await
    }

    async fn set_gtid_slave_pos(&self, gtid: &GtidList) -> Result<(), DbError> {
        self.run(&sql::set_gtid_slave_pos(gtid)).await
    }

    async fn skip_replication_event(&self, channel: &str) -> Result<(), DbError> {
        if !channel.is_empty() {
            self.run(&format!("SET @@default_master_connection={}", sql::quote(channel)))
                .await?;
        }
        self.run("SET GLOBAL sql_slave_skip_counter=1").await
    }

    async fn master_pos_wait(&self, file: &str, pos: u64, timeout: Duration) -> Result<(), DbError> {
        let statement = sql::master_pos_wait(file, pos, timeout.as_secs());
        let waited = tokio::time::timeout(timeout + self.read_timeout, async {
            sqlx::raw_sql(&statement).fetch_all(&self.pool).await
        })
        .await
        .map_err(|_| DbError::Timeout(timeout))?
        .map_err(|e| DbError::query(&statement, e))?;
        let result = waited.first().and_then(|r| cell(r, 0).trim().parse().ok());
        if sql::wait_succeeded(result, true) {
            Ok(())
        } else {
            Err(DbError::Timeout(timeout))
        }
    }

    async fn master_gtid_wait(&self, gtid: &str, timeout: Duration, version: &DbVersion) -> Result<(), DbError> {
        let statement = sql::master_gtid_wait(gtid, timeout.as_secs(), version);
        let waited = tokio::time::timeout(timeout + self.read_timeout, async {
            sqlx::raw_sql(&statement).fetch_all(&self.pool).await
        })
        .await
        .map_err(|_| DbError::Timeout(timeout))?
        .map_err(|e| DbError::query(&statement, e))?;
        let result = waited.first().and_then(|r| cell(r, 0).trim().parse().ok());
        if sql::wait_succeeded(result, false) {
            Ok(())
        } else {
            Err(DbError::Timeout(timeout))
        }
    }

    async fn purge_binary_logs_to(&self, file: &str) -> Result<(), DbError> {
        self.run(&sql::purge_binary_logs_to(file)).await
    }

    async fn purge_binary_logs_before(&self, unix_ts: i64) -> Result<(), DbError> {
        self.run(&sql::purge_binary_logs_before(unix_ts)).await
    }

    async fn flush_tables(&self) -> Result<(), DbError> {
        self.run("FLUSH NO_WRITE_TO_BINLOG TABLES").await
    }

    async fn flush_tables_with_read_lock(&self) -> Result<(), DbError> {
        let mut slot = self.lock_conn.lock().await;
        let conn = self
            .timed("FLUSH TABLES WITH READ LOCK", locked_connection(&self.pool))
            .await?;
        *slot = Some(conn);
        Ok(())
    }

    async fn unlock_tables(&self) -> Result<(), DbError> {
        let mut slot = self.lock_conn.lock().await;
        let Some(conn) = slot.take() else {
            return Ok(());
        };
        self.timed("UNLOCK TABLES", unlock(conn)).await
    }

    async fn flush_logs(&self) -> Result<(), DbError> {
        self.run("FLUSH BINARY LOGS").await
    }

    async fn install_plugin(&self, name: &str, soname: &str) -> Result<(), DbError> {
        self.run(&sql::install_plugin(name, soname)).await
    }

    async fn exec(&self, statement: &str, no_binlog: bool) -> Result<(), DbError> {
        if no_binlog {
            self.run_no_binlog(statement).await.map(|_| ())
        } else {
            self.run(statement).await
        }
    }

    async fn query(&self, statement: &str) -> Result<Vec<HashMap<String, String>>, DbError> {
        Ok(self.rows(statement).await?.iter().map(row_map).collect())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn connection_scoped_statements_are_send() {
        let pool = MySqlPoolOptions::new()
            .connect_lazy("mysql://root@127.0.0.1:1/none")
            .unwrap();
        assert_send(&no_binlog(&pool, "DELETE FROM t"));
        assert_send(&insert_job_no_binlog(&pool, "reseedmysqldump", 3306, "db1"));
        assert_send(&locked_connection(&pool));

        let session: Arc<dyn DbSession> = Arc::new(MySqlSession {
            url: "db1:3306".into(),
            pool,
            read_timeout: Duration::from_secs(1),
            lock_conn: Mutex::new(None),
        });
        assert_send(&session.flush_tables_with_read_lock());
        assert_send(&session.exec("SELECT 1", true));
        assert!(session.unlock_tables().await.is_ok());
    }
}
