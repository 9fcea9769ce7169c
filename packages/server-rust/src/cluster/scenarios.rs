//! End-to-end runs of the control loop over an in-memory fleet.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use repman_core::{Cookie, JobState, ProxyType, ServerState};

use super::Cluster;
use crate::binlog::reader::{FakeBinlogReader, ReaderCall};
use crate::config::ClusterConfig;
use crate::db::fake::FakeFleet;
use crate::error::ProxyError;
use crate::monitor::testutil::context_with;
use crate::proxy::{BackendNode, ProxyInfo, ProxySync, ProxyView};
use crate::traits::{RecordingScriptRunner, SstChannel};

/// Proxy remembering every leader it was told to route writes to.
#[derive(Default)]
struct RecordingProxy {
    failovers: Mutex<Vec<String>>,
}

impl RecordingProxy {
    fn masters(&self) -> Vec<String> {
        self.failovers.lock().clone()
    }
}

#[async_trait]
impl ProxySync for RecordingProxy {
    fn info(&self) -> ProxyInfo {
        ProxyInfo::new("c1", ProxyType::External, "proxy", 6032, 3306)
    }

    async fn init(&self, _view: &ProxyView) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn refresh(&self, _view: &ProxyView) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn failover(&self, view: &ProxyView) -> Result<(), ProxyError> {
        if let Some(m) = &view.master {
            self.failovers.lock().push(m.host.clone());
        }
        Ok(())
    }

    async fn backends_state_change(&self, _view: &ProxyView) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn set_maintenance(&self, _view: &ProxyView, _node: &BackendNode) -> Result<(), ProxyError> {
        Ok(())
    }
}

/// Transfer channel that hands out a fixed port and moves no data.
struct FixedPortSst;

#[async_trait]
impl SstChannel for FixedPortSst {
    async fn run_receiver_to_file(&self, _dest: &Path) -> anyhow::Result<u16> {
        Ok(4444)
    }

    async fn run_receiver_to_gzip(&self, _dest: &Path) -> anyhow::Result<u16> {
        Ok(4445)
    }

    async fn run_sender(&self, _source: &Path) -> anyhow::Result<u16> {
        Ok(4446)
    }
}

struct Rig {
    fleet: FakeFleet,
    urls: Vec<String>,
    cluster: Arc<Cluster>,
    proxy: Arc<RecordingProxy>,
    reader: Arc<FakeBinlogReader>,
    scripts: Arc<RecordingScriptRunner>,
    dir: tempfile::TempDir,
}

/// Three MariaDB nodes, `a` leading, discovered by two ticks.
async fn rig(f: impl FnOnce(&mut ClusterConfig)) -> Rig {
    let fleet = FakeFleet::new();
    let a = fleet.add_mariadb("a", 3306, 1);
    let b = fleet.add_mariadb("b", 3306, 2);
    let c = fleet.add_mariadb("c", 3306, 3);
    fleet.replicate(&b, &a);
    fleet.replicate(&c, &a);
    let urls = vec![a, b, c];
    let dir = tempfile::tempdir().unwrap();
    let reader = FakeBinlogReader::new();
    let scripts = RecordingScriptRunner::new();
    let ctx = {
        let hosts = urls.clone();
        let reader = Arc::clone(&reader);
        let scripts = Arc::clone(&scripts);
        context_with(
            &fleet,
            dir.path(),
            |c| {
                c.hosts = hosts;
                c.interactive = false;
                c.max_fail = 2;
                f(c);
            },
            |collab| {
                collab.binlog_reader = reader;
                collab.scripts = scripts;
                collab.sst = Some(Arc::new(FixedPortSst));
            },
        )
    };
    let proxy = Arc::new(RecordingProxy::default());
    let proxies: Vec<Arc<dyn ProxySync>> = vec![Arc::clone(&proxy) as Arc<dyn ProxySync>];
    let cluster = Cluster::with_proxies(ctx, proxies);
    cluster.tick().await;
    cluster.tick().await;
    Rig {
        fleet,
        urls,
        cluster,
        proxy,
        reader,
        scripts,
        dir,
    }
}

fn source_host(fleet: &FakeFleet, url: &str) -> Option<(String, bool)> {
    let node = fleet.node(url)?;
    let ch = node.channel("")?;
    Some((ch.opts.host.clone(), ch.started))
}

fn job_id(fleet: &FakeFleet, url: &str, task: &str) -> Option<i64> {
    fleet.node(url)?.jobs.into_iter().find(|j| j.task == task).map(|j| j.id)
}

/// Crashes `a` with one unreplicated write and brings it back after the
/// failover. Returns the new leader's host.
async fn leader_returns_ahead(r: &Rig) -> String {
    let a = &r.urls[0];
    assert!(r.fleet.write(a, 2));
    assert!(r.fleet.write_unreplicated(a, 3));
    r.fleet.crash(a);
    r.cluster.tick().await;
    r.cluster.tick().await;
    let master = r.cluster.master().unwrap();
    assert_ne!(&master.url, a);
    master.host.clone()
}

#[tokio::test(start_paused = true)]
async fn switchover_moves_leader_and_replicas() {
    let r = rig(|_| {}).await;
    let [a, b, c] = [&r.urls[0], &r.urls[1], &r.urls[2]];
    assert!(r.fleet.write(a, 5));

    let new = r.cluster.switchover(Some(b.as_str())).await.unwrap();
    assert_eq!(&new.url, b);
    assert_eq!(r.cluster.master().unwrap().url, *b);

    assert_eq!(source_host(&r.fleet, a), Some(("b".to_string(), true)));
    assert_eq!(source_host(&r.fleet, c), Some(("b".to_string(), true)));
    assert!(!r.fleet.node(b).unwrap().read_only);
    assert!(r.fleet.node(a).unwrap().read_only);
    assert_eq!(r.proxy.masters(), vec!["b".to_string()]);

    let crash = r.cluster.crashes().latest_for(a).cloned().unwrap();
    assert!(crash.switchover);
    assert_eq!(crash.elected_master_url, *b);
}

#[tokio::test(start_paused = true)]
async fn crashed_leader_is_replaced_after_two_ticks() {
    let r = rig(|_| {}).await;
    let [a, _, _] = [&r.urls[0], &r.urls[1], &r.urls[2]];
    assert!(r.fleet.write(a, 3));
    r.fleet.crash(a);

    r.cluster.tick().await;
    assert_eq!(r.cluster.server(a).unwrap().state(), ServerState::Suspect);
    assert_eq!(r.cluster.failover_count(), 0);

    r.cluster.tick().await;
    let master = r.cluster.master().unwrap();
    assert_ne!(&master.url, a);
    assert_eq!(r.cluster.failover_count(), 1);

    let other = r.urls.iter().find(|u| **u != *a && **u != master.url).unwrap();
    assert_eq!(source_host(&r.fleet, other), Some((master.host.clone(), true)));
    assert_eq!(r.proxy.masters(), vec![master.host.clone()]);

    let crash = r.cluster.crashes().latest_for(a).cloned().unwrap();
    assert!(!crash.switchover);
    assert_eq!(crash.elected_master_url, master.url);
    assert!(crash.used_gtid_at_election());
    assert!(r.dir.path().join("c1").join("crashes.json").exists());
}

#[tokio::test(start_paused = true)]
async fn whole_cluster_down_waits_for_the_last_leader() {
    let r = rig(|_| {}).await;
    let [a, b, c] = [&r.urls[0], &r.urls[1], &r.urls[2]];
    for u in [a, b, c] {
        r.fleet.crash(u);
    }
    r.cluster.tick().await;
    r.cluster.tick().await;

    let sme = &r.cluster.context().sme;
    assert!(sme.is_in_state("ERR00021") || sme.is_in_current_state("ERR00021"));
    assert!(r.cluster.is_down());
    assert!(r.cluster.master().is_none());
    assert_eq!(r.cluster.lastmaster().unwrap().url, *a);
    assert_eq!(r.cluster.failover_count(), 0);

    r.fleet.start(b);
    r.cluster.tick().await;
    assert!(r.cluster.master().is_none());

    r.fleet.start(a);
    r.cluster.tick().await;
    r.cluster.tick().await;
    assert_eq!(r.cluster.master().unwrap().url, *a);
    assert!(r.cluster.lastmaster().is_none());
    assert!(!r.cluster.is_down());
}

#[tokio::test(start_paused = true)]
async fn returning_leader_ahead_is_flashed_back() {
    let r = rig(|c| c.autorejoin_flashback = true).await;
    let a = r.urls[0].clone();
    assert!(r.fleet.write(&a, 2));
    assert!(r.fleet.write_unreplicated(&a, 3));
    r.fleet.crash(&a);
    r.cluster.tick().await;
    r.cluster.tick().await;
    let master = r.cluster.master().unwrap();
    assert_ne!(master.url, a);

    r.fleet.start(&a);
    r.cluster.tick().await;

    assert_eq!(source_host(&r.fleet, &a), Some((master.host.clone(), true)));
    assert_eq!(r.cluster.server(&a).unwrap().state(), ServerState::Slave);
    let calls = r.reader.calls();
    assert!(calls
        .iter()
        .any(|c| matches!(c, ReaderCall::Download { host, .. } if host == "a")));
    assert!(calls.iter().any(|c| matches!(c, ReaderCall::Flashback { .. })));

    let archived = std::fs::read_dir(r.dir.path().join("c1"))
        .unwrap()
        .filter_map(Result::ok)
        .any(|e| e.file_name().to_string_lossy().starts_with("crash-bin-"));
    assert!(archived);
}

#[tokio::test(start_paused = true)]
async fn returning_leader_ahead_is_reseeded_with_mysqldump() {
    let r = rig(|c| c.autorejoin_mysqldump = true).await;
    let a = r.urls[0].clone();
    assert!(r.fleet.write(&a, 2));
    assert!(r.fleet.write_unreplicated(&a, 3));
    r.fleet.crash(&a);
    r.cluster.tick().await;
    r.cluster.tick().await;
    let master = r.cluster.master().unwrap();
    let crash = r.cluster.crashes().latest_for(&a).cloned().unwrap();
    assert_eq!(crash.failover_io_gtid.seq_for_server(1), 2);

    r.fleet.start(&a);
    r.cluster.tick().await;

    let lines = r.scripts.lines();
    assert!(lines
        .iter()
        .any(|l| l.contains("mysqldump") && l.contains(&format!("--host={}", master.host)) && l.contains("--host=a")));
    assert!(r.fleet.received(&a, "RESET MASTER"));
    assert_eq!(source_host(&r.fleet, &a), Some((master.host.clone(), true)));
    assert!(!r
        .reader
        .calls()
        .iter()
        .any(|c| matches!(c, ReaderCall::Flashback { .. })));

    let bin_dir = std::fs::read_dir(r.dir.path().join("c1"))
        .unwrap()
        .filter_map(Result::ok)
        .find(|e| e.file_name().to_string_lossy().starts_with("crash-bin-"))
        .unwrap();
    let saved: Vec<String> = std::fs::read_dir(bin_dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(saved.iter().any(|n| n.starts_with("c1-server1-")));
}

#[tokio::test(start_paused = true)]
async fn returning_leader_not_ahead_resumes_at_sync_point() {
    let r = rig(|_| {}).await;
    let a = r.urls[0].clone();
    assert!(r.fleet.write(&a, 2));
    r.fleet.crash(&a);
    r.cluster.tick().await;
    r.cluster.tick().await;
    let master = r.cluster.master().unwrap();

    r.fleet.start(&a);
    r.cluster.tick().await;

    assert_eq!(source_host(&r.fleet, &a), Some((master.host.clone(), true)));
    assert!(r.fleet.received(&a, "MASTER_USE_GTID=slave_pos"));
    assert!(!r
        .reader
        .calls()
        .iter()
        .any(|c| matches!(c, ReaderCall::Download { .. })));
}

#[tokio::test(start_paused = true)]
async fn rejoin_without_crash_record_has_no_method() {
    let r = rig(|_| {}).await;
    let b = r.cluster.server(&r.urls[1]).unwrap();
    let err = r.cluster.rejoin(&b).await.unwrap_err();
    assert!(matches!(err, crate::error::RejoinError::NoMethod(_)));
    assert!(r.cluster.context().sme.is_in_current_state("ERR00066"));
}

#[tokio::test(start_paused = true)]
async fn returning_leader_ahead_is_reseeded_from_physical_backup() {
    let r = rig(|c| c.autorejoin_physical_backup = true).await;
    let a = r.urls[0].clone();
    let host = leader_returns_ahead(&r).await;

    r.fleet.start(&a);
    r.cluster.tick().await;

    assert_eq!(source_host(&r.fleet, &a), Some((host.clone(), false)));
    assert!(r.fleet.received(&a, "MASTER_USE_GTID=slave_pos"));
    let id = job_id(&r.fleet, &a, "reseedmariabackup").unwrap();

    let node = r.cluster.server(&a).unwrap();
    node.session()
        .unwrap()
        .set_job_state(id, JobState::Success, true, "ok")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(source_host(&r.fleet, &a), Some((host, true)));
}

#[tokio::test(start_paused = true)]
async fn returning_leader_ahead_is_reseeded_from_logical_backup() {
    let r = rig(|c| c.autorejoin_logical_backup = true).await;
    let a = r.urls[0].clone();
    let host = leader_returns_ahead(&r).await;
    r.cluster.master().unwrap().set_cookie(Cookie::LogicalBackup).await.unwrap();

    r.fleet.start(&a);
    r.cluster.tick().await;

    assert_eq!(source_host(&r.fleet, &a), Some((host, false)));
    assert!(job_id(&r.fleet, &a, "reseedmysqldump").is_some());
    assert_eq!(r.cluster.server(&a).unwrap().state(), ServerState::Slave);
}

#[tokio::test(start_paused = true)]
async fn leader_binlog_rotation_archives_and_purges_replicas() {
    let r = rig(|c| {
        c.force_binlog_purge = true;
        c.force_binlog_purge_replicas = true;
        c.backup_binlogs = true;
    })
    .await;
    let [a, b, c] = [&r.urls[0], &r.urls[1], &r.urls[2]];
    assert!(!r.fleet.received(b, "PURGE BINARY LOGS BEFORE"));
    r.reader.set_first_event("mysql-bin.000001", 1_700_000_000);

    r.fleet.set_binlogs(a, 3, 100);
    r.cluster.tick().await;

    let leader = r.cluster.server(a).unwrap();
    assert_eq!(leader.view().oldest_binary_log_timestamp, 1_700_000_000);
    assert!(leader.backup_dir().join("mysql-bin.000001").exists());
    assert!(r.fleet.received(b, "PURGE BINARY LOGS BEFORE"));
    assert!(r.fleet.received(c, "PURGE BINARY LOGS BEFORE"));
    assert!(r
        .reader
        .calls()
        .iter()
        .any(|call| matches!(call, ReaderCall::FirstEvent { file, .. } if file == "mysql-bin.000001")));

    let downloads = r.reader.calls().len();
    r.cluster.tick().await;
    assert_eq!(r.reader.calls().len(), downloads);
}
