//! Background worker driving a cluster.
//!
//! A `BackgroundWorker<R>` owns one tokio task that processes submitted tasks
//! from an mpsc channel and calls `on_tick` at a fixed interval. The cluster
//! runnable ticks the control loop and executes operator requests
//! (switchover, failover, rejoin, password rotation) between ticks, so a
//! request never overlaps a monitoring pass.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cluster::Cluster;
use crate::logging::TOPOLOGY;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Processes a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called on each tick interval.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// ClusterTask
// ---------------------------------------------------------------------------

/// Operator requests run by the cluster worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterTask {
    /// Switch over to the given node, or to the elected one.
    Switchover(Option<String>),
    /// Fail over now, skipping the automatic gates.
    Failover,
    /// Rejoin the node with this URL.
    Rejoin(String),
    RotatePasswords,
}

/// Ticks `cluster` and runs its [`ClusterTask`]s.
pub struct ClusterRunnable {
    cluster: Arc<Cluster>,
}

impl ClusterRunnable {
    #[must_use]
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl BackgroundRunnable for ClusterRunnable {
    type Task = ClusterTask;

    async fn run(&mut self, task: ClusterTask) {
        let cluster = &self.cluster;
        let name = cluster.context().name();
        match task {
            ClusterTask::Switchover(target) => match cluster.switchover(target.as_deref()).await {
                Ok(m) => info!(target: TOPOLOGY, cluster = %name, master = %m.url, "switchover requested and done"),
                Err(e) => warn!(target: TOPOLOGY, cluster = %name, error = %e, "switchover request failed"),
            },
            ClusterTask::Failover => match cluster.failover().await {
                Ok(m) => info!(target: TOPOLOGY, cluster = %name, master = %m.url, "failover requested and done"),
                Err(e) => warn!(target: TOPOLOGY, cluster = %name, error = %e, "failover request failed"),
            },
            ClusterTask::Rejoin(url) => {
                let Some(node) = cluster.server(&url) else {
                    warn!(target: TOPOLOGY, cluster = %name, server = %url, "rejoin requested for unknown server");
                    return;
                };
                if let Err(e) = cluster.rejoin(&node).await {
                    warn!(target: TOPOLOGY, cluster = %name, server = %url, error = %e, "rejoin request failed");
                }
            }
            ClusterTask::RotatePasswords => match cluster.rotate_passwords().await {
                Ok(true) => info!(target: TOPOLOGY, cluster = %name, "passwords rotated"),
                Ok(false) => info!(target: TOPOLOGY, cluster = %name, "password rotation skipped"),
                Err(e) => warn!(target: TOPOLOGY, cluster = %name, error = %e, "password rotation failed"),
            },
        }
    }

    async fn on_tick(&mut self) {
        self.cluster.tick().await;
    }

    async fn shutdown(&mut self) {
        info!(target: TOPOLOGY, cluster = %self.cluster.context().name(), "cluster worker stopped");
    }
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle on a spawned runnable.
///
/// The first interval tick is skipped so `on_tick` does not fire at startup.
/// The task channel holds 256 entries.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    #[must_use]
    pub fn start(mut runnable: R, tick: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(256);
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    _ = interval.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Queues a task.
    ///
    /// # Errors
    ///
    /// Fails once the worker is stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Stops the worker and waits for its task to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Starts a worker ticking `cluster` every monitoring interval.
#[must_use]
pub fn spawn_cluster(cluster: Arc<Cluster>) -> BackgroundWorker<ClusterRunnable> {
    let tick = cluster.context().config().ticker();
    BackgroundWorker::start(ClusterRunnable::new(cluster), tick)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::db::fake::FakeFleet;
    use crate::monitor::testutil::context;

    struct CountingRunnable {
        run_count: Arc<AtomicU32>,
        tick_count: Arc<AtomicU32>,
        shutdown_called: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = String;

        async fn run(&mut self, _task: String) {
            self.run_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.tick_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.shutdown_called.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (CountingRunnable, [Arc<AtomicU32>; 3]) {
        let counters = [
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicU32::new(0)),
        ];
        let r = CountingRunnable {
            run_count: Arc::clone(&counters[0]),
            tick_count: Arc::clone(&counters[1]),
            shutdown_called: Arc::clone(&counters[2]),
        };
        (r, counters)
    }

    #[tokio::test]
    async fn start_submit_and_stop() {
        let (runnable, [runs, _, shutdowns]) = counting();
        let mut worker = BackgroundWorker::start(runnable, Duration::from_secs(60));

        worker.submit("task-1".to_string()).await.unwrap();
        worker.submit("task-2".to_string()).await.unwrap();
        worker.submit("task-3".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        worker.stop().await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_fires_periodically() {
        let (runnable, [_, ticks, _]) = counting();
        let mut worker = BackgroundWorker::start(runnable, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop().await;
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn submit_after_stop_returns_error() {
        let (runnable, _) = counting();
        let mut worker = BackgroundWorker::start(runnable, Duration::from_secs(60));
        worker.stop().await;
        assert!(worker.submit("late-task".to_string()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cluster_worker_discovers_and_switches_over() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        fleet.replicate(&b, &a);
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&fleet, dir.path(), |c| c.hosts = vec![a.clone(), b.clone()]);
        let cluster = Cluster::with_proxies(ctx, Vec::new());
        let mut worker = spawn_cluster(Arc::clone(&cluster));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(cluster.master().unwrap().url, a);

        worker.submit(ClusterTask::Switchover(Some(b.clone()))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        worker.stop().await;
        assert_eq!(cluster.master().unwrap().url, b);
    }
}
