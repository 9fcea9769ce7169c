//! Per-node job pipeline.
//!
//! Jobs are rows of `replication_manager_schema.jobs` on the node itself.
//! The control plane inserts them, a node-side shell streamed over ssh
//! executes them, and the control plane polls their `done` flag. At most one
//! non-terminal row per task exists at any time; [`JobRegistry`] mirrors the
//! jobs this process started so overlapping requests are refused without a
//! round trip.

pub mod ssh;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use dashmap::DashMap;
use repman_core::{Cookie, JobState, JobTask};
use tracing::{debug, info, warn};

use crate::config::{LogicalBackupTool, PhysicalBackupTool};
use crate::db::TaskCount;
use crate::error::JobError;
use crate::logging::JOB;
use crate::monitor::ServerMonitor;

/// Poll period of [`ServerMonitor::start_slave_callback`].
const CALLBACK_POLL: Duration = Duration::from_secs(2);
/// Pending rows of one task above which the oldest are purged.
const MAX_QUEUED: u32 = 10;

/// Success marker printed by xtrabackup and mariabackup.
const PHYSICAL_OK: &str = "completed OK!";
/// Trailer written by mysqldump.
const LOGICAL_OK: &str = "Dump completed";

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Jobs started by this process, keyed by node URL and task.
#[derive(Debug, Default)]
pub struct JobRegistry {
    running: DashMap<(String, JobTask), i64>,
    results: DashMap<String, JobResults>,
}

impl JobRegistry {
    /// Records `id` as the running `task` on `url`. False when one is
    /// already recorded.
    pub fn try_begin(&self, url: &str, task: JobTask, id: i64) -> bool {
        match self.running.entry((url.to_string(), task)) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(id);
                true
            }
        }
    }

    pub fn finish(&self, url: &str, task: JobTask) {
        self.running.remove(&(url.to_string(), task));
    }

    #[must_use]
    pub fn is_running(&self, url: &str, task: JobTask) -> bool {
        self.running.contains_key(&(url.to_string(), task))
    }

    /// Id of the running `task` on `url`.
    #[must_use]
    pub fn running_id(&self, url: &str, task: JobTask) -> Option<i64> {
        self.running.get(&(url.to_string(), task)).map(|e| *e.value())
    }

    /// Tasks recorded as running on `url`.
    #[must_use]
    pub fn running_on(&self, url: &str) -> Vec<JobTask> {
        self.running
            .iter()
            .filter(|e| e.key().0 == url)
            .map(|e| e.key().1)
            .collect()
    }

    /// Last parsed output of the job shell on `url`.
    #[must_use]
    pub fn results(&self, url: &str) -> Option<JobResults> {
        self.results.get(url).map(|r| r.clone())
    }
}

/// Per-task outcome reported by the node job shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobResults {
    pub tasks: BTreeMap<String, bool>,
    pub physical_backup_ok: bool,
    pub logical_backup_ok: bool,
}

impl JobResults {
    /// A task succeeded unless the shell printed `no <task>`.
    #[must_use]
    pub fn parse(output: &str) -> Self {
        let lower = output.to_lowercase();
        let tasks = JobTask::ALL
            .iter()
            .map(|t| (t.as_str().to_string(), !lower.contains(&format!("no {}", t.as_str()))))
            .collect();
        Self {
            tasks,
            physical_backup_ok: output.contains(PHYSICAL_OK),
            logical_backup_ok: output.contains(LOGICAL_OK),
        }
    }

    #[must_use]
    pub fn succeeded(&self, task: JobTask) -> bool {
        self.tasks.get(task.as_str()).copied().unwrap_or(false)
    }
}

fn physical_task(tool: PhysicalBackupTool, reseed: bool, flashback: bool) -> JobTask {
    match (tool, reseed, flashback) {
        (PhysicalBackupTool::Xtrabackup, true, _) => JobTask::ReseedXtrabackup,
        (PhysicalBackupTool::Mariabackup, true, _) => JobTask::ReseedMariabackup,
        (PhysicalBackupTool::Xtrabackup, _, true) => JobTask::FlashbackXtrabackup,
        (PhysicalBackupTool::Mariabackup, _, true) => JobTask::FlashbackMariabackup,
        (PhysicalBackupTool::Xtrabackup, ..) => JobTask::Xtrabackup,
        (PhysicalBackupTool::Mariabackup, ..) => JobTask::Mariabackup,
    }
}

fn physical_name(tool: PhysicalBackupTool) -> &'static str {
    match tool {
        PhysicalBackupTool::Xtrabackup => "xtrabackup",
        PhysicalBackupTool::Mariabackup => "mariabackup",
    }
}

fn logical_name(tool: LogicalBackupTool) -> &'static str {
    match tool {
        LogicalBackupTool::Mysqldump => "mysqldump",
        LogicalBackupTool::Mydumper => "mydumper",
    }
}

// ---------------------------------------------------------------------------
// ServerMonitor job operations
// ---------------------------------------------------------------------------

impl ServerMonitor {
    /// Inserts a queued `task` row on this node.
    ///
    /// # Errors
    ///
    /// [`JobError::InFailover`] during a failover and
    /// [`JobError::AlreadyPending`] when a non-terminal row of `task` exists.
    pub async fn job_insert_task(&self, task: JobTask, port: u16, server: &str) -> Result<i64, JobError> {
        if self.ctx.sme.is_in_failover() {
            info!(target: JOB, server = %self.url, task = %task, "job cancelled during failover");
            return Err(JobError::InFailover(self.url.clone()));
        }
        let pending = || JobError::AlreadyPending {
            task: task.to_string(),
            url: self.url.clone(),
        };
        if self.ctx.jobs.is_running(&self.url, task) {
            return Err(pending());
        }
        let session = self.session()?;
        session.create_jobs_table().await?;
        let queued = session.pending_job_count(task.as_str()).await?;
        if queued > MAX_QUEUED {
            let purged = session.purge_pending_jobs(task.as_str()).await?;
            self.ctx.sme.raise_for("ERR00060", &self.url, &[&self.url]);
            warn!(target: JOB, server = %self.url, task = %task, purged, "queued jobs purged");
        }
        if queued > 0 {
            return Err(pending());
        }
        let id = session.insert_job(task.as_str(), port, server).await?;
        self.ctx.jobs.try_begin(&self.url, task, id);
        metrics::counter!("repman_jobs_inserted_total", "task" => task.as_str()).increment(1);
        info!(target: JOB, server = %self.url, task = %task, id, port, "job queued");
        Ok(id)
    }

    /// Counts non-terminal rows per task, raising the matching "in queue"
    /// warning and purging overfull queues. Registry entries whose row is no
    /// longer pending are released.
    ///
    /// # Errors
    ///
    /// Fails when the jobs table cannot be read.
    pub async fn jobs_check_running(&self) -> Result<Vec<TaskCount>, JobError> {
        if self.view().is_down() {
            return Ok(Vec::new());
        }
        let session = self.session()?;
        session.create_jobs_table().await?;
        let counts = session.pending_jobs_by_task().await?;
        let config = self.ctx.config();
        let physical = physical_name(config.backup_physical_type);
        let logical = logical_name(config.backup_logical_type);
        let url = self.url.as_str();

        for tc in counts.iter().filter(|c| c.count > 0) {
            if tc.count > MAX_QUEUED {
                self.ctx.sme.raise_for("ERR00060", url, &[&url]);
                session.purge_pending_jobs(&tc.task).await?;
                continue;
            }
            let Ok(task) = tc.task.parse::<JobTask>() else {
                continue;
            };
            match task {
                JobTask::Optimize => self.ctx.sme.raise_for("WARN0072", url, &[&url]),
                JobTask::Restart => self.ctx.sme.raise_for("WARN0096", url, &[&url]),
                JobTask::Stop => self.ctx.sme.raise_for("WARN0097", url, &[&url]),
                JobTask::Xtrabackup | JobTask::Mariabackup => {
                    self.ctx.sme.raise_for("WARN0073", url, &[&physical, &url]);
                }
                JobTask::ReseedXtrabackup | JobTask::ReseedMariabackup => {
                    self.ctx.sme.raise_for("WARN0074", url, &[&physical, &url]);
                }
                JobTask::ReseedMysqldump | JobTask::ReseedMydumper => {
                    self.ctx.sme.raise_for("WARN0075", url, &[&logical, &url]);
                }
                JobTask::FlashbackXtrabackup | JobTask::FlashbackMariabackup => {
                    self.ctx.sme.raise_for("WARN0076", url, &[&physical, &url]);
                }
                JobTask::FlashbackMysqldump | JobTask::FlashbackMydumper => {
                    self.ctx.sme.raise_for("WARN0077", url, &[&logical, &url]);
                }
                _ => {}
            }
        }

        for task in self.ctx.jobs.running_on(url) {
            if !counts.iter().any(|c| c.task == task.as_str() && c.count > 0) {
                debug!(target: JOB, server = url, task = %task, "job left the queue");
                self.ctx.jobs.finish(url, task);
            }
        }
        Ok(counts)
    }

    /// Streams the job shell to the node over ssh with the job environment
    /// exported, parses its output and sets the completion cookies.
    ///
    /// # Errors
    ///
    /// [`JobError::InFailover`] during a failover, ssh and I/O failures.
    pub async fn job_run_via_ssh(&self, task: JobTask) -> Result<JobResults, JobError> {
        if self.ctx.sme.is_in_failover() {
            return Err(JobError::InFailover(self.url.clone()));
        }
        let config = self.ctx.config();
        let script = tokio::fs::read_to_string(&config.ssh.job_script).await?;
        let env: Vec<(String, String)> = [
            ("REPLICATION_MANAGER_USER", config.db_user.clone()),
            ("REPLICATION_MANAGER_PASSWORD", config.db_password.clone()),
            ("REPLICATION_MANAGER_URL", config.ssh.api_url.clone()),
            ("REPLICATION_MANAGER_CLUSTER_NAME", config.name.clone()),
            ("REPLICATION_MANAGER_HOST_NAME", self.host.clone()),
            ("REPLICATION_MANAGER_HOST_PORT", self.port.to_string()),
            ("REPLICATION_MANAGER_TASK", task.to_string()),
            ("REPLICATION_MANAGER_LOG_MODULE", "job".to_string()),
            ("REPLICATION_MANAGER_LOG_LEVEL", config.log.job_level.clone()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let out = self.ctx.collab.shell.exec(&self.host, &script, &env).await?;
        if !out.success() {
            warn!(target: JOB, server = %self.url, task = %task, status = out.status, stderr = %out.stderr, "job shell failed");
        }
        let results = JobResults::parse(&out.combined());
        if results.physical_backup_ok {
            self.set_cookie(Cookie::PhysicalBackup).await?;
        }
        if results.logical_backup_ok {
            self.set_cookie(Cookie::LogicalBackup).await?;
        }
        self.ctx.jobs.results.insert(self.url.clone(), results.clone());
        debug!(target: JOB, server = %self.url, task = %task, "job shell output parsed");
        Ok(results)
    }

    /// Polls job `id` every two seconds until it is done, then restarts
    /// replication when the job was a successful reseed or flashback.
    /// Gives up after `monitor_wait_retry` polls.
    ///
    /// # Errors
    ///
    /// [`JobError::NotFound`] for an unknown id and [`JobError::Timeout`]
    /// when the job never finishes.
    pub async fn start_slave_callback(&self, id: i64) -> Result<JobState, JobError> {
        let retries = self.ctx.config().monitor_wait_retry;
        for _ in 0..retries {
            let row = self.session()?.job(id).await?.ok_or(JobError::NotFound(id))?;
            if row.done {
                let task = row.job_task();
                if let Some(task) = task {
                    self.ctx.jobs.finish(&self.url, task);
                }
                if row.state == JobState::Success && task.is_some_and(JobTask::restarts_replication) {
                    self.start_slave().await?;
                    info!(target: JOB, server = %self.url, id, "replication restarted after job");
                }
                return Ok(row.state);
            }
            tokio::time::sleep(CALLBACK_POLL).await;
        }
        Err(JobError::Timeout(id))
    }

    fn sst(&self) -> Result<&std::sync::Arc<dyn crate::traits::SstChannel>, JobError> {
        self.ctx.collab.sst.as_ref().ok_or(JobError::NoSstChannel)
    }

    fn physical_backup_path(&self) -> PathBuf {
        let tool = physical_name(self.ctx.config().backup_physical_type);
        self.backup_dir().join(format!("{tool}.xbtream"))
    }

    /// Opens a receiver for a physical backup stream, then queues the backup.
    ///
    /// # Errors
    ///
    /// Fails without an SST channel or when the job cannot be inserted.
    pub async fn job_backup_physical(&self) -> Result<i64, JobError> {
        if self.view().is_down() {
            return Err(JobError::Monitor(crate::error::MonitorError::NotConnected(self.url.clone())));
        }
        let config = self.ctx.config();
        tokio::fs::create_dir_all(self.backup_dir()).await?;
        let port = self
            .sst()?
            .run_receiver_to_file(&self.physical_backup_path())
            .await
            .map_err(|e| JobError::Sst(e.to_string()))?;
        let task = physical_task(config.backup_physical_type, false, false);
        self.job_insert_task(task, port, &config.ssh.api_url).await
    }

    /// Serves `source`'s physical backup to this node and queues the reseed.
    ///
    /// # Errors
    ///
    /// Fails without an SST channel or when the job cannot be inserted.
    pub async fn job_reseed_physical_backup(&self, source: &ServerMonitor) -> Result<i64, JobError> {
        self.job_physical_restore(source, true).await
    }

    /// Like [`Self::job_reseed_physical_backup`], keeping the node's
    /// identity for a flashback restore.
    ///
    /// # Errors
    ///
    /// Fails without an SST channel or when the job cannot be inserted.
    pub async fn job_flashback_physical_backup(&self, source: &ServerMonitor) -> Result<i64, JobError> {
        self.job_physical_restore(source, false).await
    }

    async fn job_physical_restore(&self, source: &ServerMonitor, reseed: bool) -> Result<i64, JobError> {
        let config = self.ctx.config();
        let port = self
            .sst()?
            .run_sender(&source.physical_backup_path())
            .await
            .map_err(|e| JobError::Sst(e.to_string()))?;
        let task = physical_task(config.backup_physical_type, reseed, !reseed);
        self.job_insert_task(task, port, &config.ssh.api_url).await
    }

    /// Queues a logical reseed from `source`'s last dump. mysqldump is served
    /// over the SST channel; mydumper reads from shared storage.
    ///
    /// # Errors
    ///
    /// Fails when the channel or the insert fails.
    pub async fn job_reseed_logical_backup(&self, source: &ServerMonitor) -> Result<i64, JobError> {
        self.job_logical_restore(source, true).await
    }

    /// Logical restore for a flashback.
    ///
    /// # Errors
    ///
    /// Fails when the channel or the insert fails.
    pub async fn job_flashback_logical_backup(&self, source: &ServerMonitor) -> Result<i64, JobError> {
        self.job_logical_restore(source, false).await
    }

    async fn job_logical_restore(&self, source: &ServerMonitor, reseed: bool) -> Result<i64, JobError> {
        let config = self.ctx.config();
        let (task, port) = match (config.backup_logical_type, reseed) {
            (LogicalBackupTool::Mysqldump, _) => {
                let dump = source.backup_dir().join("mysqldump.sql.gz");
                let port = self
                    .sst()?
                    .run_sender(&dump)
                    .await
                    .map_err(|e| JobError::Sst(e.to_string()))?;
                let task = if reseed {
                    JobTask::ReseedMysqldump
                } else {
                    JobTask::FlashbackMysqldump
                };
                (task, port)
            }
            (LogicalBackupTool::Mydumper, true) => (JobTask::ReseedMydumper, 0),
            (LogicalBackupTool::Mydumper, false) => (JobTask::FlashbackMydumper, 0),
        };
        self.job_insert_task(task, port, &config.ssh.api_url).await
    }

    /// Receives the node error log into its data directory.
    ///
    /// # Errors
    ///
    /// Fails when the channel or the insert fails.
    pub async fn job_backup_error_log(&self) -> Result<i64, JobError> {
        self.job_receive_log(JobTask::Error, "error.log").await
    }

    /// Receives the node slow query log into its data directory.
    ///
    /// # Errors
    ///
    /// Fails when the channel or the insert fails.
    pub async fn job_backup_slow_query_log(&self) -> Result<i64, JobError> {
        self.job_receive_log(JobTask::SlowQuery, "slow_query.log").await
    }

    async fn job_receive_log(&self, task: JobTask, file: &str) -> Result<i64, JobError> {
        let dir = self.data_dir().join("log");
        tokio::fs::create_dir_all(&dir).await?;
        let port = self
            .sst()?
            .run_receiver_to_file(&dir.join(file))
            .await
            .map_err(|e| JobError::Sst(e.to_string()))?;
        let api = self.ctx.config().ssh.api_url.clone();
        self.job_insert_task(task, port, &api).await
    }

    /// Queues a task that needs no transfer channel.
    ///
    /// # Errors
    ///
    /// As [`Self::job_insert_task`].
    pub async fn job_simple(&self, task: JobTask) -> Result<i64, JobError> {
        let api = self.ctx.config().ssh.api_url.clone();
        self.job_insert_task(task, 0, &api).await
    }

    /// Queues a table optimization.
    ///
    /// # Errors
    ///
    /// As [`Self::job_insert_task`].
    pub async fn job_optimize(&self) -> Result<i64, JobError> {
        self.job_simple(JobTask::Optimize).await
    }

    /// Queues a server stop.
    ///
    /// # Errors
    ///
    /// As [`Self::job_insert_task`].
    pub async fn job_server_stop(&self) -> Result<i64, JobError> {
        self.job_simple(JobTask::Stop).await
    }

    /// Queues a server restart.
    ///
    /// # Errors
    ///
    /// As [`Self::job_insert_task`].
    pub async fn job_server_restart(&self) -> Result<i64, JobError> {
        self.job_simple(JobTask::Restart).await
    }

    /// Queues a ZFS snapshot rollback.
    ///
    /// # Errors
    ///
    /// As [`Self::job_insert_task`].
    pub async fn job_zfs_snapback(&self) -> Result<i64, JobError> {
        self.job_simple(JobTask::ZfsSnapback).await
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::db::fake::FakeFleet;
    use crate::jobs::ssh::RecordingShell;
    use crate::monitor::testutil::{context, context_with};
    use crate::traits::SstChannel;

    #[derive(Default)]
    struct FakeSst {
        opened: Mutex<Vec<(String, PathBuf)>>,
    }

    #[async_trait]
    impl SstChannel for FakeSst {
        async fn run_receiver_to_file(&self, dest: &Path) -> anyhow::Result<u16> {
            self.opened.lock().push(("file".into(), dest.to_path_buf()));
            Ok(4444)
        }

        async fn run_receiver_to_gzip(&self, dest: &Path) -> anyhow::Result<u16> {
            self.opened.lock().push(("gzip".into(), dest.to_path_buf()));
            Ok(4445)
        }

        async fn run_sender(&self, source: &Path) -> anyhow::Result<u16> {
            self.opened.lock().push(("send".into(), source.to_path_buf()));
            Ok(4446)
        }
    }

    #[tokio::test]
    async fn insert_refuses_a_second_pending_job() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let m = ServerMonitor::new(context(&fleet, dir.path(), |_| {}), &a);
        m.ping(None).await;
        let id = m.job_optimize().await.unwrap();
        assert_eq!(id, 1);
        assert!(matches!(m.job_optimize().await, Err(JobError::AlreadyPending { .. })));
        assert!(m.ctx.jobs.is_running(&a, JobTask::Optimize));
        assert!(fleet.received(&a, "INSERT INTO replication_manager_schema.jobs"));
        let pending = fleet
            .node(&a)
            .unwrap()
            .jobs
            .iter()
            .filter(|j| j.task == "optimize" && j.state.is_pending())
            .count();
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn no_job_during_failover() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let m = ServerMonitor::new(context(&fleet, dir.path(), |_| {}), &a);
        m.ping(None).await;
        m.ctx.sme.set_failover_state();
        assert!(matches!(m.job_server_restart().await, Err(JobError::InFailover(_))));
        assert!(fleet.node(&a).unwrap().jobs.is_empty());
    }

    #[tokio::test]
    async fn overfull_queue_is_purged_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        fleet.with_node(&a, |n| {
            for id in 1..=12 {
                n.jobs.push(crate::db::JobRow {
                    id,
                    task: "restart".into(),
                    port: 0,
                    server: "repman".into(),
                    done: false,
                    state: JobState::Queued,
                    result: String::new(),
                    start: None,
                    end: None,
                });
            }
            n.jobs.push(crate::db::JobRow {
                id: 13,
                task: "optimize".into(),
                port: 0,
                server: "repman".into(),
                done: false,
                state: JobState::Queued,
                result: String::new(),
                start: None,
                end: None,
            });
        });
        let m = ServerMonitor::new(context(&fleet, dir.path(), |_| {}), &a);
        m.ping(None).await;
        let counts = m.jobs_check_running().await.unwrap();
        assert_eq!(counts.len(), 2);
        assert!(m.ctx.sme.is_in_state("ERR00060"));
        assert!(m.ctx.sme.is_in_state("WARN0072"));
        assert!(!m.ctx.sme.is_in_state("WARN0096"));
        let still = fleet
            .node(&a)
            .unwrap()
            .jobs
            .iter()
            .filter(|j| j.task == "restart" && j.state.is_pending())
            .count();
        assert_eq!(still, 1);
    }

    #[tokio::test]
    async fn registry_releases_finished_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let m = ServerMonitor::new(context(&fleet, dir.path(), |_| {}), &a);
        m.ping(None).await;
        let id = m.job_server_stop().await.unwrap();
        m.session().unwrap().set_job_state(id, JobState::Terminal, true, "ok").await.unwrap();
        m.jobs_check_running().await.unwrap();
        assert!(!m.ctx.jobs.is_running(&a, JobTask::Stop));
        assert!(m.job_server_stop().await.is_ok());
    }

    #[tokio::test]
    async fn ssh_run_exports_environment_and_sets_cookies() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("dbjobs");
        std::fs::write(&script, "#!/bin/sh\necho run\n").unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("db1", 3306, 1);
        let shell = RecordingShell::new();
        shell.set_output(0, "[230101] mariabackup: completed OK!\nno optimize\n");
        let s = shell.clone();
        let ctx = context_with(
            &fleet,
            dir.path(),
            |c| {
                c.ssh.job_script = script.clone();
                c.db_password = "secret".into();
            },
            move |c| c.shell = s,
        );
        let m = ServerMonitor::new(ctx, &a);
        let results = m.job_run_via_ssh(JobTask::Mariabackup).await.unwrap();
        assert!(results.physical_backup_ok);
        assert!(!results.succeeded(JobTask::Optimize));
        assert!(results.succeeded(JobTask::Mariabackup));
        assert!(m.has_cookie(Cookie::PhysicalBackup).await);
        assert!(!m.has_cookie(Cookie::LogicalBackup).await);
        let call = &shell.calls()[0];
        assert_eq!(call.host, "db1");
        assert_eq!(call.script, "#!/bin/sh\necho run\n");
        assert_eq!(call.env_var("REPLICATION_MANAGER_PASSWORD"), Some("secret"));
        assert_eq!(call.env_var("REPLICATION_MANAGER_HOST_PORT"), Some("3306"));
        assert_eq!(call.env_var("REPLICATION_MANAGER_TASK"), Some("mariabackup"));
        assert_eq!(call.env_var("REPLICATION_MANAGER_CLUSTER_NAME"), Some("c1"));
        assert_eq!(m.ctx.jobs.results(&a), Some(results));
    }

    #[tokio::test]
    async fn physical_backup_opens_a_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let sst = Arc::new(FakeSst::default());
        let s = sst.clone();
        let ctx = context_with(&fleet, dir.path(), |_| {}, move |c| c.sst = Some(s));
        let m = ServerMonitor::new(ctx, &a);
        m.ping(None).await;
        let id = m.job_backup_physical().await.unwrap();
        let row = fleet.node(&a).unwrap().jobs.into_iter().find(|j| j.id == id).unwrap();
        assert_eq!(row.task, "mariabackup");
        assert_eq!(row.port, 4444);
        let opened = sst.opened.lock().clone();
        assert!(opened[0].1.ends_with("mariabackup.xbtream"));
    }

    #[tokio::test]
    async fn logical_reseed_serves_the_dump() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        let sst = Arc::new(FakeSst::default());
        let s = sst.clone();
        let ctx = context_with(&fleet, dir.path(), |_| {}, move |c| c.sst = Some(s));
        let source = ServerMonitor::new(Arc::clone(&ctx), &a);
        let target = ServerMonitor::new(ctx, &b);
        target.ping(None).await;
        let id = target.job_reseed_logical_backup(&source).await.unwrap();
        let row = fleet.node(&b).unwrap().jobs.into_iter().find(|j| j.id == id).unwrap();
        assert_eq!(row.task, "reseedmysqldump");
        assert_eq!(row.port, 4446);
        assert!(sst.opened.lock()[0].1.ends_with("a_3306/mysqldump.sql.gz"));
    }

    #[tokio::test]
    async fn missing_sst_channel_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let m = ServerMonitor::new(context(&fleet, dir.path(), |_| {}), &a);
        m.ping(None).await;
        assert!(matches!(m.job_backup_error_log().await, Err(JobError::NoSstChannel)));
    }

    #[tokio::test(start_paused = true)]
    async fn callback_restarts_replication_after_reseed() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        fleet.replicate(&b, &a);
        let ctx = context(&fleet, dir.path(), |_| {});
        let m = ServerMonitor::new(ctx, &b);
        m.ping(Some(1)).await;
        m.stop_slave().await.unwrap();
        let id = m.job_simple(JobTask::ReseedMysqldump).await.unwrap();
        let session = m.session().unwrap();
        let waiter = tokio::spawn({
            let m = Arc::clone(&m);
            async move { m.start_slave_callback(id).await }
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        session.set_job_state(id, JobState::Success, true, "ok").await.unwrap();
        let state = waiter.await.unwrap().unwrap();
        assert_eq!(state, JobState::Success);
        assert!(fleet.node(&b).unwrap().channel("").unwrap().started);
        assert!(!m.ctx.jobs.is_running(&b, JobTask::ReseedMysqldump));
    }

    #[tokio::test(start_paused = true)]
    async fn callback_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let m = ServerMonitor::new(context(&fleet, dir.path(), |c| c.monitor_wait_retry = 3), &a);
        m.ping(None).await;
        let id = m.job_optimize().await.unwrap();
        assert!(matches!(m.start_slave_callback(id).await, Err(JobError::Timeout(_))));
        assert!(matches!(m.start_slave_callback(99).await, Err(JobError::NotFound(99))));
    }

    #[test]
    fn results_parse_negative_markers() {
        let r = JobResults::parse("no xtrabackup\n-- Dump completed on 2024-01-01\n");
        assert!(!r.succeeded(JobTask::Xtrabackup));
        assert!(r.succeeded(JobTask::Restart));
        assert!(r.logical_backup_ok);
        assert!(!r.physical_backup_ok);
    }
}
