//! In-memory database fleet.
//!
//! Nodes replicate from each other with MariaDB GTID semantics: every
//! transaction written on a node advances domain 0 with that node's
//! `server_id`, and [`FakeFleet::settle`] pushes executed positions along
//! running channels until nothing changes. Every mutating session call is
//! appended to the node's statement log as the SQL a real server would have
//! received, so tests can assert on what the engines issued.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use repman_core::binlog::BinlogName;
use repman_core::{
    ChangeSourceOptions, DbVersion, Gtid, GtidList, IoThread, JobState, MasterStatus, ReplicationMode,
    ReplicationStatus,
};

use super::dsn::join_url;
use super::{sql, DbConnector, DbSession, DbTarget, DbUser, JobRow, JobStore, TaskCount, TlsChoice, VarMap};
use crate::error::DbError;

/// Bytes appended to the current binlog per transaction.
pub const WRITE_BYTES: u64 = 1000;

/// Size of an empty binlog (format description event).
const EMPTY_BINLOG: u64 = 256;

// ---------------------------------------------------------------------------
// Node model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FakeBinlog {
    pub name: String,
    pub size: u64,
    /// Unix time of the first event.
    pub first_event: i64,
}

#[derive(Debug, Clone)]
pub struct FakeChannel {
    pub opts: ChangeSourceOptions,
    pub started: bool,
    pub io_gtid: GtidList,
    pub read_file: String,
    pub read_pos: u64,
    pub exec_pos: u64,
    /// Reported `Seconds_Behind_Master` while both threads run.
    pub delay: i64,
    pub sql_error: Option<(u32, String)>,
    pub heartbeats: u64,
}

impl FakeChannel {
    fn new(opts: ChangeSourceOptions) -> Self {
        Self {
            read_file: opts.logfile.clone(),
            read_pos: opts.logpos,
            exec_pos: opts.logpos,
            opts,
            started: false,
            io_gtid: GtidList::default(),
            delay: 0,
            sql_error: None,
            heartbeats: 0,
        }
    }

    #[must_use]
    pub fn source_url(&self) -> String {
        join_url(&self.opts.host, self.opts.port)
    }
}

#[derive(Debug, Clone)]
pub struct FakeNode {
    pub url: String,
    pub host: String,
    pub port: u16,
    pub server_id: u64,
    pub version: String,
    pub version_comment: String,
    pub up: bool,
    pub auth_fail: bool,
    /// Handshakes with the current TLS profile fail.
    pub tls_broken_current: bool,
    pub vars: VarMap,
    pub status: VarMap,
    pub read_only: bool,
    pub super_read_only: bool,
    pub channels: Vec<FakeChannel>,
    pub binlogs: Vec<FakeBinlog>,
    pub executed: GtidList,
    pub slave_pos: GtidList,
    /// Global read lock held.
    pub locked: bool,
    /// When false, replicas cannot fetch new events from this node.
    pub serve_binlogs: bool,
    pub statements: Vec<String>,
    pub jobs: Vec<JobRow>,
    pub users: Vec<DbUser>,
    pub plugins: HashMap<String, String>,
    pub schemas: Vec<String>,
    pub long_running_writes: u32,
    pub flush_delay: Duration,
    /// Session operations that fail with an injected error.
    pub failing: HashSet<String>,
    /// Rows returned by [`DbSession::query`] for statements starting with the key.
    pub canned: Vec<(String, Vec<HashMap<String, String>>)>,
}

impl FakeNode {
    /// A MariaDB 10.11 node with durable settings and one empty binlog.
    #[must_use]
    pub fn mariadb(host: &str, port: u16, server_id: u64) -> Self {
        let vars: VarMap = [
            ("SYNC_BINLOG", "1"),
            ("INNODB_FLUSH_LOG_AT_TRX_COMMIT", "1"),
            ("BINLOG_FORMAT", "ROW"),
            ("BINLOG_CHECKSUM", "CRC32"),
            ("LOG_SLAVE_UPDATES", "ON"),
            ("GTID_STRICT_MODE", "ON"),
            ("BINLOG_ANNOTATE_ROW_EVENTS", "ON"),
            ("LOG_SLOW_SLAVE_STATEMENTS", "ON"),
            ("LOG_BIN_COMPRESS", "ON"),
            ("RPL_SEMI_SYNC_MASTER_ENABLED", "ON"),
            ("RPL_SEMI_SYNC_SLAVE_ENABLED", "ON"),
            ("LOG_BIN_BASENAME", "/var/lib/mysql/mysql-bin"),
            ("EVENT_SCHEDULER", "OFF"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let status: VarMap = [("RPL_SEMI_SYNC_SLAVE_STATUS", "ON"), ("WSREP_LOCAL_STATE", "0")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            url: join_url(host, port),
            host: host.to_string(),
            port,
            server_id,
            version: "10.11.6-MariaDB-log".into(),
            version_comment: "MariaDB Server".into(),
            up: true,
            auth_fail: false,
            tls_broken_current: false,
            vars,
            status,
            read_only: false,
            super_read_only: false,
            channels: Vec::new(),
            binlogs: vec![FakeBinlog {
                name: "mysql-bin.000001".into(),
                size: EMPTY_BINLOG,
                first_event: chrono::Utc::now().timestamp(),
            }],
            executed: GtidList::default(),
            slave_pos: GtidList::default(),
            locked: false,
            serve_binlogs: true,
            statements: Vec::new(),
            jobs: Vec::new(),
            users: vec![DbUser {
                user: "root".into(),
                host: "%".into(),
                password: "*81F5E21E35407D884A6CD4A731AEBFB6AF209E1B".into(),
            }],
            plugins: HashMap::from([("binlog".to_string(), "ACTIVE".to_string())]),
            schemas: vec!["mysql".into(), "information_schema".into()],
            long_running_writes: 0,
            flush_delay: Duration::ZERO,
            failing: HashSet::new(),
            canned: Vec::new(),
        }
    }

    #[must_use]
    pub fn db_version(&self) -> DbVersion {
        DbVersion::parse(&self.version, &self.version_comment)
    }

    /// Current binlog file and position.
    #[must_use]
    pub fn binlog_position(&self) -> (String, u64) {
        self.binlogs
            .last()
            .map(|b| (b.name.clone(), b.size))
            .unwrap_or_default()
    }

    /// Highest sequence number in domain 0.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.executed.seq_for_domain(0).into_iter().max().unwrap_or(0)
    }

    #[must_use]
    pub fn channel(&self, name: &str) -> Option<&FakeChannel> {
        self.channels.iter().find(|c| c.opts.channel == name)
    }

    pub fn channel_mut(&mut self, name: &str) -> Option<&mut FakeChannel> {
        self.channels.iter_mut().find(|c| c.opts.channel == name)
    }

    /// Commits `n` transactions unless the node refuses writes.
    fn commit(&mut self, n: u64) -> bool {
        if !self.up || self.read_only || self.locked {
            return false;
        }
        let seq = self.seq() + n;
        let mut entries: Vec<Gtid> = self.executed.iter().filter(|g| g.domain_id != 0).copied().collect();
        entries.push(Gtid::new(0, self.server_id, seq));
        self.executed = GtidList::new(entries).sorted();
        self.append(n * WRITE_BYTES);
        true
    }

    fn append(&mut self, bytes: u64) {
        if let Some(last) = self.binlogs.last_mut() {
            last.size += bytes;
        }
    }

    fn rotate(&mut self) {
        let next = self
            .binlogs
            .last()
            .and_then(|b| b.name.parse::<BinlogName>().ok())
            .map_or_else(|| BinlogName::new("mysql-bin", 1), |b| b.with_suffix(b.suffix + 1));
        self.binlogs.push(FakeBinlog {
            name: next.to_string(),
            size: EMPTY_BINLOG,
            first_event: chrono::Utc::now().timestamp(),
        });
    }

    fn log(&mut self, statement: impl Into<String>) {
        self.statements.push(statement.into());
    }
}

/// Whether every domain of `target` has been executed by `have`.
fn gtid_reached(target: &GtidList, have: &GtidList) -> bool {
    target.iter().all(|t| {
        have.seq_for_domain(t.domain_id)
            .into_iter()
            .max()
            .is_some_and(|s| s >= t.seq_no)
    })
}

/// Per-domain merge keeping the entry with the highest sequence.
fn merge_gtid(mine: &GtidList, theirs: &GtidList) -> GtidList {
    let mut by_domain: BTreeMap<u32, Gtid> = BTreeMap::new();
    for g in mine.iter().chain(theirs.iter()) {
        by_domain
            .entry(g.domain_id)
            .and_modify(|cur| {
                if g.seq_no >= cur.seq_no {
                    *cur = *g;
                }
            })
            .or_insert(*g);
    }
    GtidList::new(by_domain.into_values().collect())
}

// ---------------------------------------------------------------------------
// Fleet
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FleetState {
    nodes: BTreeMap<String, FakeNode>,
    connects: Vec<(String, TlsChoice)>,
}

impl FleetState {
    /// Pushes executed positions along running channels to a fixpoint.
    fn settle(&mut self) {
        for _ in 0..=self.nodes.len() {
            let mut changed = false;
            let urls: Vec<String> = self.nodes.keys().cloned().collect();
            for url in urls {
                let Some(node) = self.nodes.get(&url) else {
                    continue;
                };
                if !node.up {
                    continue;
                }
                let pulls: Vec<(usize, GtidList, (String, u64))> = node
                    .channels
                    .iter()
                    .enumerate()
                    .filter(|(_, ch)| ch.started && ch.sql_error.is_none())
                    .filter_map(|(i, ch)| {
                        let src = self.nodes.get(&ch.source_url())?;
                        (src.up && !src.auth_fail && src.serve_binlogs)
                            .then(|| (i, src.executed.clone(), src.binlog_position()))
                    })
                    .collect();
                let Some(node) = self.nodes.get_mut(&url) else {
                    continue;
                };
                for (i, src_executed, (file, pos)) in pulls {
                    let merged = merge_gtid(&node.executed, &src_executed);
                    if merged != node.executed {
                        let gained = merged.seq_sum().saturating_sub(node.executed.seq_sum());
                        node.append(gained * WRITE_BYTES);
                        node.executed = merged.clone();
                        node.slave_pos = merged;
                        changed = true;
                    }
                    let ch = &mut node.channels[i];
                    if ch.io_gtid != src_executed || ch.read_file != file || ch.read_pos != pos {
                        ch.io_gtid = src_executed;
                        ch.read_file = file;
                        ch.read_pos = pos;
                        ch.exec_pos = pos;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn heartbeat(&mut self) {
        let live: HashSet<String> = self
            .nodes
            .values()
            .filter(|n| n.up)
            .map(|n| n.url.clone())
            .collect();
        for node in self.nodes.values_mut().filter(|n| n.up) {
            for ch in node.channels.iter_mut().filter(|c| c.started) {
                if live.contains(&ch.source_url()) {
                    ch.heartbeats += 1;
                }
            }
        }
    }
}

/// Shared handle on an in-memory fleet.
#[derive(Debug, Clone, Default)]
pub struct FakeFleet {
    state: Arc<Mutex<FleetState>>,
}

impl FakeFleet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a MariaDB node and returns its URL.
    pub fn add_mariadb(&self, host: &str, port: u16, server_id: u64) -> String {
        self.add_node(FakeNode::mariadb(host, port, server_id))
    }

    pub fn add_node(&self, node: FakeNode) -> String {
        let url = node.url.clone();
        self.state.lock().nodes.insert(url.clone(), node);
        url
    }

    #[must_use]
    pub fn connector(&self) -> Arc<dyn DbConnector> {
        Arc::new(FakeConnector { fleet: self.clone() })
    }

    /// Snapshot of a node.
    #[must_use]
    pub fn node(&self, url: &str) -> Option<FakeNode> {
        self.state.lock().nodes.get(url).cloned()
    }

    /// Mutates a node in place, then settles replication.
    pub fn with_node<R>(&self, url: &str, f: impl FnOnce(&mut FakeNode) -> R) -> Option<R> {
        let mut state = self.state.lock();
        let out = state.nodes.get_mut(url).map(f);
        state.settle();
        out
    }

    /// Points `replica` at `source` on the default channel (GTID slave_pos)
    /// and starts replication.
    pub fn replicate(&self, replica: &str, source: &str) {
        let mut state = self.state.lock();
        let Some(src) = state.nodes.get(source) else {
            return;
        };
        let opts = ChangeSourceOptions::new(src.host.clone(), src.port, ReplicationMode::SlavePos)
            .credentials("repl", "repl");
        if let Some(node) = state.nodes.get_mut(replica) {
            node.channels.retain(|c| !c.opts.channel.is_empty());
            let mut ch = FakeChannel::new(opts);
            ch.started = true;
            node.channels.push(ch);
            node.read_only = true;
        }
        state.settle();
    }

    /// Commits `n` transactions on `url`. Returns false when the node
    /// refuses writes (down, read-only or locked).
    pub fn write(&self, url: &str, n: u64) -> bool {
        let mut state = self.state.lock();
        let Some(node) = state.nodes.get_mut(url) else {
            return false;
        };
        if !node.commit(n) {
            return false;
        }
        state.settle();
        true
    }

    /// Commits `n` transactions without letting replicas pull them. They
    /// ship on the next settle that finds the node up.
    pub fn write_unreplicated(&self, url: &str, n: u64) -> bool {
        self.state.lock().nodes.get_mut(url).is_some_and(|node| node.commit(n))
    }

    /// Stops the server process.
    pub fn crash(&self, url: &str) {
        self.with_node(url, |node| {
            node.up = false;
            node.locked = false;
        });
    }

    /// Starts the server process again; replication channels keep their
    /// configuration and running flag.
    pub fn start(&self, url: &str) {
        self.with_node(url, |node| node.up = true);
    }

    /// Breaks the SQL thread of the default channel.
    pub fn break_sql(&self, url: &str, errno: u32, message: &str) {
        self.with_node(url, |node| {
            if let Some(ch) = node.channel_mut("") {
                ch.sql_error = Some((errno, message.to_string()));
            }
        });
    }

    /// Delivers one heartbeat on every started channel with a live source.
    pub fn heartbeat(&self) {
        self.state.lock().heartbeat();
    }

    pub fn settle(&self) {
        self.state.lock().settle();
    }

    /// Statements received by `url`, oldest first.
    #[must_use]
    pub fn statements(&self, url: &str) -> Vec<String> {
        self.node(url).map(|n| n.statements).unwrap_or_default()
    }

    /// Whether `url` received a statement containing `needle`.
    #[must_use]
    pub fn received(&self, url: &str, needle: &str) -> bool {
        self.statements(url).iter().any(|s| s.contains(needle))
    }

    /// Every connection attempt with the TLS profile it used.
    #[must_use]
    pub fn connects(&self) -> Vec<(String, TlsChoice)> {
        self.state.lock().connects.clone()
    }

    /// Replaces the binlog list of `url` with `count` files of `size` bytes.
    pub fn set_binlogs(&self, url: &str, count: u32, size: u64) {
        let now = chrono::Utc::now().timestamp();
        self.with_node(url, |node| {
            node.binlogs = (1..=count)
                .map(|i| FakeBinlog {
                    name: format!("mysql-bin.{i:06}"),
                    size,
                    first_event: now - i64::from(count - i) * 3600,
                })
                .collect();
        });
    }

    /// Makes the named session operation fail on `url`.
    pub fn fail_op(&self, url: &str, op: &str) {
        self.with_node(url, |node| {
            node.failing.insert(op.to_string());
        });
    }

    fn run<R>(&self, url: &str, op: &str, f: impl FnOnce(&mut FleetState, &str) -> Result<R, DbError>) -> Result<R, DbError> {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get(url)
            .ok_or_else(|| DbError::Connect(format!("unknown host {url}")))?;
        if !node.up {
            return Err(DbError::Connect(format!("{url}: connection refused")));
        }
        if node.failing.contains(op) {
            return Err(DbError::query(op, "injected failure"));
        }
        f(&mut state, url)
    }

    fn run_node<R>(&self, url: &str, op: &str, f: impl FnOnce(&mut FakeNode) -> Result<R, DbError>) -> Result<R, DbError> {
        self.run(url, op, |state, url| {
            let node = state
                .nodes
                .get_mut(url)
                .ok_or_else(|| DbError::Connect(format!("unknown host {url}")))?;
            f(node)
        })
    }
}

// ---------------------------------------------------------------------------
// Connector and session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FakeConnector {
    fleet: FakeFleet,
}

#[async_trait]
impl DbConnector for FakeConnector {
    async fn connect(&self, target: &DbTarget) -> Result<Arc<dyn DbSession>, DbError> {
        let mut state = self.fleet.state.lock();
        state.connects.push((target.url.clone(), target.tls));
        let node = state
            .nodes
            .get(&target.url)
            .ok_or_else(|| DbError::Connect(format!("unknown host {}", target.url)))?;
        if !node.up {
            return Err(DbError::Connect(format!("{}: connection refused", target.url)));
        }
        if node.auth_fail {
            return Err(DbError::Auth {
                user: target.user.clone(),
                message: "Access denied".into(),
            });
        }
        if node.tls_broken_current && target.tls == TlsChoice::Current {
            return Err(DbError::Tls("certificate verify failed".into()));
        }
        Ok(Arc::new(FakeSession {
            fleet: self.fleet.clone(),
            url: target.url.clone(),
        }))
    }
}

pub struct FakeSession {
    fleet: FakeFleet,
    url: String,
}

fn job_pending(row: &JobRow) -> bool {
    row.state.is_pending()
}

#[async_trait]
impl JobStore for FakeSession {
    async fn create_jobs_table(&self) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "create_jobs_table", |node| {
            node.log(sql::JOBS_SCHEMA);
            node.log(sql::JOBS_TABLE);
            if !node.schemas.iter().any(|s| s == "replication_manager_schema") {
                node.schemas.push("replication_manager_schema".into());
            }
            Ok(())
        })
    }

    async fn pending_job_count(&self, task: &str) -> Result<u32, DbError> {
        self.fleet.run_node(&self.url, "pending_job_count", |node| {
            let n = node.jobs.iter().filter(|j| j.task == task && job_pending(j)).count();
            Ok(u32::try_from(n).unwrap_or(u32::MAX))
        })
    }

    async fn pending_jobs_by_task(&self) -> Result<Vec<TaskCount>, DbError> {
        self.fleet.run_node(&self.url, "pending_jobs_by_task", |node| {
            let mut by_task: BTreeMap<String, TaskCount> = BTreeMap::new();
            for j in node.jobs.iter().filter(|j| job_pending(j)) {
                let e = by_task.entry(j.task.clone()).or_insert_with(|| TaskCount {
                    task: j.task.clone(),
                    count: 0,
                    max_id: 0,
                });
                e.count += 1;
                e.max_id = e.max_id.max(j.id);
            }
            Ok(by_task.into_values().collect())
        })
    }

    async fn insert_job(&self, task: &str, port: u16, server: &str) -> Result<i64, DbError> {
        self.fleet.run_node(&self.url, "insert_job", |node| {
            let id = node.jobs.iter().map(|j| j.id).max().unwrap_or(0) + 1;
            node.log("SET sql_log_bin=0");
            node.log(format!(
                "INSERT INTO replication_manager_schema.jobs(task, port, server, start) VALUES({}, {port}, {}, NOW())",
                sql::quote(task),
                sql::quote(server)
            ));
            node.log("SET sql_log_bin=1");
            node.jobs.push(JobRow {
                id,
                task: task.to_string(),
                port,
                server: server.to_string(),
                done: false,
                state: JobState::Queued,
                result: String::new(),
                start: Some(chrono::Utc::now().naive_utc()),
                end: None,
            });
            Ok(id)
        })
    }

    async fn purge_pending_jobs(&self, task: &str) -> Result<u64, DbError> {
        self.fleet.run_node(&self.url, "purge_pending_jobs", |node| {
            let newest = node
                .jobs
                .iter()
                .filter(|j| j.task == task && job_pending(j))
                .map(|j| j.id)
                .max();
            let mut n = 0;
            for j in node.jobs.iter_mut() {
                if j.task == task && job_pending(j) && Some(j.id) != newest {
                    j.state = JobState::Terminal;
                    j.done = true;
                    j.result = "purged".into();
                    n += 1;
                }
            }
            Ok(n)
        })
    }

    async fn job(&self, id: i64) -> Result<Option<JobRow>, DbError> {
        self.fleet
            .run_node(&self.url, "job", |node| Ok(node.jobs.iter().find(|j| j.id == id).cloned()))
    }

    async fn set_job_state(&self, id: i64, state: JobState, done: bool, result: &str) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "set_job_state", |node| {
            let row = node
                .jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| DbError::NotFound(format!("job {id}")))?;
            row.state = state;
            row.done = done;
            row.result = result.to_string();
            if done {
                row.end = Some(chrono::Utc::now().naive_utc());
            }
            Ok(())
        })
    }
}

#[async_trait]
impl DbSession for FakeSession {
    async fn ping(&self) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "ping", |_| Ok(()))
    }

    async fn variables(&self) -> Result<VarMap, DbError> {
        self.fleet.run_node(&self.url, "variables", |node| {
            let mut vars = node.vars.clone();
            let onoff = |b: bool| (if b { "ON" } else { "OFF" }).to_string();
            vars.insert("SERVER_ID".into(), node.server_id.to_string());
            vars.insert("VERSION".into(), node.version.clone());
            vars.insert("VERSION_COMMENT".into(), node.version_comment.clone());
            vars.insert("HOSTNAME".into(), node.host.clone());
            vars.insert("PORT".into(), node.port.to_string());
            vars.insert("READ_ONLY".into(), onoff(node.read_only));
            vars.insert("SUPER_READ_ONLY".into(), onoff(node.super_read_only));
            vars.entry("LOG_BIN".into()).or_insert_with(|| "ON".into());
            vars.insert("GTID_BINLOG_POS".into(), node.executed.to_string());
            vars.insert("GTID_CURRENT_POS".into(), node.executed.to_string());
            vars.insert("GTID_SLAVE_POS".into(), node.slave_pos.to_string());
            Ok(vars)
        })
    }

    async fn status(&self) -> Result<VarMap, DbError> {
        self.fleet.run(&self.url, "status", |state, url| {
            let connected = state
                .nodes
                .values()
                .filter(|n| n.up && n.channels.iter().any(|c| c.started && c.source_url() == url))
                .count();
            let node = state
                .nodes
                .get(url)
                .ok_or_else(|| DbError::Connect(url.to_string()))?;
            let mut status = node.status.clone();
            status.insert("SLAVES_CONNECTED".into(), connected.to_string());
            status.insert(
                "RPL_SEMI_SYNC_MASTER_CLIENTS".into(),
                connected.to_string(),
            );
            Ok(status)
        })
    }

    async fn replication_status(&self, _version: &DbVersion) -> Result<Vec<ReplicationStatus>, DbError> {
        self.fleet.run(&self.url, "replication_status", |state, url| {
            let node = state
                .nodes
                .get(url)
                .ok_or_else(|| DbError::Connect(url.to_string()))?;
            Ok(node
                .channels
                .iter()
                .map(|ch| {
                    let src = state.nodes.get(&ch.source_url());
                    let io_running = if !ch.started {
                        IoThread::No
                    } else if src.is_some_and(|s| s.up && !s.auth_fail) {
                        IoThread::Yes
                    } else {
                        IoThread::Connecting
                    };
                    let sql_running = ch.started && ch.sql_error.is_none();
                    let (sql_errno, sql_error) = ch.sql_error.clone().unwrap_or_default();
                    ReplicationStatus {
                        channel: ch.opts.channel.clone(),
                        master_host: ch.opts.host.clone(),
                        master_port: ch.opts.port,
                        master_user: ch.opts.user.clone(),
                        master_server_id: src.map_or(0, |s| s.server_id),
                        master_log_file: ch.read_file.clone(),
                        read_master_log_pos: ch.read_pos,
                        relay_master_log_file: ch.read_file.clone(),
                        exec_master_log_pos: ch.exec_pos,
                        io_running,
                        sql_running,
                        seconds_behind_master: (io_running.is_running() && sql_running).then_some(ch.delay),
                        last_sql_errno: sql_errno,
                        last_sql_error: sql_error,
                        using_gtid: match ch.opts.mode {
                            ReplicationMode::SlavePos => "Slave_Pos",
                            ReplicationMode::CurrentPos => "Current_Pos",
                            ReplicationMode::MasterAutoPosition => "Yes",
                            ReplicationMode::Positional | ReplicationMode::Mxs => "No",
                        }
                        .into(),
                        gtid_io_pos: ch.io_gtid.clone(),
                        heartbeat_period: f64::from(ch.opts.heartbeat),
                        received_heartbeats: ch.heartbeats,
                        sql_delay: ch.opts.delay,
                        sql_running_state: if sql_running {
                            "Slave has read all relay log; waiting for more updates".into()
                        } else {
                            String::new()
                        },
                        ..ReplicationStatus::default()
                    }
                })
                .collect())
        })
    }

    async fn master_status(&self, _version: &DbVersion) -> Result<MasterStatus, DbError> {
        self.fleet.run_node(&self.url, "master_status", |node| {
            let (file, position) = node.binlog_position();
            Ok(MasterStatus {
                file,
                position,
                executed_gtid_set: String::new(),
            })
        })
    }

    async fn binary_logs(&self) -> Result<Vec<(String, u64)>, DbError> {
        self.fleet.run_node(&self.url, "binary_logs", |node| {
            Ok(node.binlogs.iter().map(|b| (b.name.clone(), b.size)).collect())
        })
    }

    async fn binlog_dump_count(&self) -> Result<u32, DbError> {
        self.fleet.run(&self.url, "binlog_dump_count", |state, url| {
            let n = state
                .nodes
                .values()
                .filter(|n| n.up && n.channels.iter().any(|c| c.started && c.source_url() == url))
                .count();
            Ok(u32::try_from(n).unwrap_or(u32::MAX))
        })
    }

    async fn schemas(&self) -> Result<Vec<String>, DbError> {
        self.fleet.run_node(&self.url, "schemas", |node| Ok(node.schemas.clone()))
    }

    async fn users(&self) -> Result<Vec<DbUser>, DbError> {
        self.fleet.run_node(&self.url, "users", |node| Ok(node.users.clone()))
    }

    async fn plugins(&self) -> Result<HashMap<String, String>, DbError> {
        self.fleet.run_node(&self.url, "plugins", |node| Ok(node.plugins.clone()))
    }

    async fn long_running_writes(&self, _min_secs: u64) -> Result<u32, DbError> {
        self.fleet
            .run_node(&self.url, "long_running_writes", |node| Ok(node.long_running_writes))
    }

    async fn set_read_only(&self, on: bool) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "set_read_only", |node| {
            node.log(sql::set_read_only(on));
            node.read_only = on;
            if !on {
                node.super_read_only = false;
            }
            Ok(())
        })
    }

    async fn set_super_read_only(&self, on: bool) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "set_super_read_only", |node| {
            node.log(sql::set_super_read_only(on));
            node.super_read_only = on;
            if on {
                node.read_only = true;
            }
            Ok(())
        })
    }

    async fn set_global(&self, name: &str, value: &str) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "set_global", |node| {
            node.log(sql::set_global(name, value));
            let on = matches!(value.to_ascii_uppercase().as_str(), "ON" | "1");
            match name.to_ascii_uppercase().as_str() {
                "READ_ONLY" => node.read_only = on,
                "SUPER_READ_ONLY" => node.super_read_only = on,
                "GTID_SLAVE_POS" => {
                    node.slave_pos = GtidList::parse(value).map_err(|e| DbError::query(name, e))?;
                }
                upper => {
                    node.vars.insert(upper.to_string(), value.to_string());
                }
            }
            Ok(())
        })
    }

    async fn change_source(&self, opts: &ChangeSourceOptions, version: &DbVersion) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "change_source", |node| {
            let statement = sql::change_source(opts, version);
            if node.channel(&opts.channel).is_some_and(|c| c.started) {
                return Err(DbError::query(
                    statement,
                    "This operation cannot be performed as you have a running slave; run STOP SLAVE first",
                ));
            }
            node.log(statement);
            node.channels.retain(|c| c.opts.channel != opts.channel);
            node.channels.push(FakeChannel::new(opts.clone()));
            Ok(())
        })
    }

    async fn start_replica(&self, channel: &str, version: &DbVersion) -> Result<(), DbError> {
        self.fleet.run(&self.url, "start_replica", |state, url| {
            let node = state
                .nodes
                .get_mut(url)
                .ok_or_else(|| DbError::Connect(url.to_string()))?;
            let statement = sql::start_replica(channel, version);
            let Some(ch) = node.channel_mut(channel) else {
                return Err(DbError::query(statement, "Misconfigured slave: MASTER_HOST was not set"));
            };
            ch.started = true;
            node.log(statement);
            state.settle();
            Ok(())
        })
    }

    async fn stop_replica(&self, channel: &str, version: &DbVersion) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "stop_replica", |node| {
            node.log(sql::stop_replica(channel, version));
            if let Some(ch) = node.channel_mut(channel) {
                ch.started = false;
            }
            Ok(())
        })
    }

    async fn reset_replica(&self, channel: &str, all: bool, version: &DbVersion) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "reset_replica", |node| {
            let statement = sql::reset_replica(channel, all, version);
            if node.channel(channel).is_some_and(|c| c.started) {
                return Err(DbError::query(statement, "slave is running"));
            }
            node.log(statement);
            if all {
                node.channels.retain(|c| c.opts.channel != channel);
            } else if let Some(ch) = node.channel_mut(channel) {
                ch.io_gtid = GtidList::default();
                ch.read_file.clear();
                ch.read_pos = 0;
                ch.exec_pos = 0;
            }
            Ok(())
        })
    }

    async fn reset_master(&self) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "reset_master", |node| {
            node.log("RESET MASTER");
            node.binlogs = vec![FakeBinlog {
                name: "mysql-bin.000001".into(),
                size: EMPTY_BINLOG,
                first_event: chrono::Utc::now().timestamp(),
            }];
            node.executed = GtidList::default();
            Ok(())
        })
    }

    async fn set_gtid_slave_pos(&self, gtid: &GtidList) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "set_gtid_slave_pos", |node| {
            let statement = sql::set_gtid_slave_pos(gtid);
            if node.channels.iter().any(|c| c.started) {
                return Err(DbError::query(statement, "slave is running"));
            }
            node.log(statement);
            node.slave_pos = gtid.clone();
            Ok(())
        })
    }

    async fn skip_replication_event(&self, channel: &str) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "skip_replication_event", |node| {
            node.log("SET GLOBAL sql_slave_skip_counter=1");
            if let Some(ch) = node.channel_mut(channel) {
                ch.sql_error = None;
            }
            Ok(())
        })
    }

    async fn master_pos_wait(&self, file: &str, pos: u64, timeout: Duration) -> Result<(), DbError> {
        self.fleet.run(&self.url, "master_pos_wait", |state, url| {
            state.settle();
            let node = state
                .nodes
                .get_mut(url)
                .ok_or_else(|| DbError::Connect(url.to_string()))?;
            node.log(sql::master_pos_wait(file, pos, timeout.as_secs()));
            let reached = node.channels.iter().any(|c| {
                c.read_file.as_str() > file || (c.read_file == file && c.exec_pos >= pos)
            });
            if reached {
                Ok(())
            } else {
                Err(DbError::Timeout(timeout))
            }
        })
    }

    async fn master_gtid_wait(&self, gtid: &str, timeout: Duration, version: &DbVersion) -> Result<(), DbError> {
        self.fleet.run(&self.url, "master_gtid_wait", |state, url| {
            state.settle();
            let node = state
                .nodes
                .get_mut(url)
                .ok_or_else(|| DbError::Connect(url.to_string()))?;
            let statement = sql::master_gtid_wait(gtid, timeout.as_secs(), version);
            let target = GtidList::parse(gtid).map_err(|e| DbError::query(statement.clone(), e))?;
            node.log(statement);
            if gtid_reached(&target, &node.executed) {
                Ok(())
            } else {
                Err(DbError::Timeout(timeout))
            }
        })
    }

    async fn purge_binary_logs_to(&self, file: &str) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "purge_binary_logs_to", |node| {
            let statement = sql::purge_binary_logs_to(file);
            let Some(idx) = node.binlogs.iter().position(|b| b.name == file) else {
                return Err(DbError::query(statement, "Target log not found in binlog index"));
            };
            node.log(statement);
            node.binlogs.drain(..idx);
            Ok(())
        })
    }

    async fn purge_binary_logs_before(&self, unix_ts: i64) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "purge_binary_logs_before", |node| {
            node.log(sql::purge_binary_logs_before(unix_ts));
            // A file goes once every event in it predates the cutoff, i.e.
            // its successor started before it. The current file always stays.
            let keep_from = node
                .binlogs
                .windows(2)
                .position(|w| w[1].first_event > unix_ts)
                .unwrap_or(node.binlogs.len().saturating_sub(1));
            node.binlogs.drain(..keep_from);
            Ok(())
        })
    }

    async fn flush_tables(&self) -> Result<(), DbError> {
        let delay = self
            .fleet
            .run_node(&self.url, "flush_tables", |node| Ok(node.flush_delay))?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.fleet.run_node(&self.url, "flush_tables", |node| {
            node.log("FLUSH NO_WRITE_TO_BINLOG TABLES");
            Ok(())
        })
    }

    async fn flush_tables_with_read_lock(&self) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "flush_tables_with_read_lock", |node| {
            node.log("FLUSH TABLES WITH READ LOCK");
            node.locked = true;
            Ok(())
        })
    }

    async fn unlock_tables(&self) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "unlock_tables", |node| {
            node.log("UNLOCK TABLES");
            node.locked = false;
            Ok(())
        })
    }

    async fn flush_logs(&self) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "flush_logs", |node| {
            node.log("FLUSH BINARY LOGS");
            node.rotate();
            Ok(())
        })
    }

    async fn install_plugin(&self, name: &str, soname: &str) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "install_plugin", |node| {
            node.log(sql::install_plugin(name, soname));
            node.plugins.insert(name.to_ascii_lowercase(), "ACTIVE".into());
            Ok(())
        })
    }

    async fn query(&self, statement: &str) -> Result<Vec<HashMap<String, String>>, DbError> {
        self.fleet.run_node(&self.url, "query", |node| {
            node.log(statement);
            Ok(node
                .canned
                .iter()
                .find(|(prefix, _)| statement.starts_with(prefix.as_str()))
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default())
        })
    }

    async fn exec(&self, statement: &str, no_binlog: bool) -> Result<(), DbError> {
        self.fleet.run_node(&self.url, "exec", |node| {
            if no_binlog {
                node.log("SET sql_log_bin=0");
            }
            node.log(statement);
            if no_binlog {
                node.log("SET sql_log_bin=1");
            }
            Ok(())
        })
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use repman_core::Flavor;

    use super::*;

    fn target(url: &str, tls: TlsChoice) -> DbTarget {
        let (host, port) = url.split_once(':').unwrap();
        DbTarget {
            url: url.to_string(),
            host: host.to_string(),
            port: port.parse().unwrap(),
            user: "root".into(),
            password: "pw".into(),
            tls,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            max_lifetime: Duration::from_secs(60),
        }
    }

    fn maria() -> DbVersion {
        DbVersion::new(Flavor::MariaDB, 10, 11, 6)
    }

    #[tokio::test]
    async fn writes_propagate_through_chain() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        let c = fleet.add_mariadb("c", 3306, 3);
        fleet.replicate(&b, &a);
        fleet.replicate(&c, &b);
        assert!(fleet.write(&a, 5));
        assert_eq!(fleet.node(&c).unwrap().executed.to_string(), "0-1-5");
        assert!(!fleet.write(&b, 1), "replicas are read-only");

        let session = fleet.connector().connect(&target(&c, TlsChoice::Disabled)).await.unwrap();
        let rs = session.replication_status(&maria()).await.unwrap();
        assert_eq!(rs.len(), 1);
        assert!(rs[0].threads_running());
        assert_eq!(rs[0].master_server_id, 2);
        assert_eq!(rs[0].seconds_behind_master, Some(0));
    }

    #[tokio::test]
    async fn unreplicated_writes_leave_replicas_behind() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        fleet.replicate(&b, &a);
        fleet.write(&a, 10);
        fleet.write_unreplicated(&a, 3);
        fleet.crash(&a);
        assert_eq!(fleet.node(&a).unwrap().seq(), 13);
        assert_eq!(fleet.node(&b).unwrap().seq(), 10);

        let session = fleet.connector().connect(&target(&b, TlsChoice::Disabled)).await.unwrap();
        let rs = session.replication_status(&maria()).await.unwrap();
        assert_eq!(rs[0].io_running, IoThread::Connecting);
        assert_eq!(rs[0].seconds_behind_master, None);
    }

    #[tokio::test]
    async fn connect_failures_are_classified() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        fleet.with_node(&a, |n| n.tls_broken_current = true);
        let conn = fleet.connector();
        assert!(conn.connect(&target(&a, TlsChoice::Current)).await.err().unwrap().is_tls());
        assert!(conn.connect(&target(&a, TlsChoice::Old)).await.is_ok());
        fleet.with_node(&a, |n| n.auth_fail = true);
        assert!(conn.connect(&target(&a, TlsChoice::Old)).await.err().unwrap().is_auth());
        assert_eq!(fleet.connects().len(), 3);
    }

    #[tokio::test]
    async fn change_source_requires_stopped_replica() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        fleet.replicate(&b, &a);
        let s = fleet.connector().connect(&target(&b, TlsChoice::Disabled)).await.unwrap();
        let opts = ChangeSourceOptions::new("a", 3306, ReplicationMode::SlavePos);
        assert!(s.change_source(&opts, &maria()).await.is_err());
        s.stop_replica("", &maria()).await.unwrap();
        s.change_source(&opts, &maria()).await.unwrap();
        s.start_replica("", &maria()).await.unwrap();
        assert!(fleet.received(&b, "MASTER_USE_GTID=slave_pos"));
        assert!(fleet.received(&b, "START SLAVE"));
    }

    #[tokio::test]
    async fn purge_and_jobs() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        fleet.set_binlogs(&a, 5, 100);
        let s = fleet.connector().connect(&target(&a, TlsChoice::Disabled)).await.unwrap();
        s.purge_binary_logs_to("mysql-bin.000003").await.unwrap();
        assert_eq!(s.binary_logs().await.unwrap().len(), 3);
        assert!(s.purge_binary_logs_to("mysql-bin.000009").await.is_err());

        let first = s.insert_job("optimize", 0, "repman").await.unwrap();
        let second = s.insert_job("optimize", 0, "repman").await.unwrap();
        assert_eq!(s.pending_job_count("optimize").await.unwrap(), 2);
        assert_eq!(s.purge_pending_jobs("optimize").await.unwrap(), 1);
        assert_eq!(s.job(first).await.unwrap().unwrap().state, JobState::Terminal);
        assert_eq!(s.job(second).await.unwrap().unwrap().state, JobState::Queued);
    }

    #[tokio::test]
    async fn gtid_wait_compares_domains() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        fleet.replicate(&b, &a);
        fleet.write(&a, 4);
        let s = fleet.connector().connect(&target(&b, TlsChoice::Disabled)).await.unwrap();
        let t = Duration::from_secs(1);
        s.master_gtid_wait("0-1-4", t, &maria()).await.unwrap();
        assert!(matches!(s.master_gtid_wait("0-1-9", t, &maria()).await, Err(DbError::Timeout(_))));
    }
}
