//! Polling waits over cluster conditions.
//!
//! Every wait checks its condition once per monitoring tick, up to
//! `monitor_wait_retry` ticks, and fails with [`WaitError::Timeout`]
//! otherwise. No lock is held while sleeping.

use std::future::Future;

use repman_core::ServerState;
use tracing::debug;

use super::Cluster;
use crate::error::WaitError;
use crate::logging::TOPOLOGY;

impl Cluster {
    async fn wait_until<F, Fut>(&self, what: &'static str, mut done: F) -> Result<(), WaitError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let config = self.ctx.config();
        let ticks = config.monitor_wait_retry;
        let period = config.ticker();
        for tick in 0..ticks {
            if done().await {
                return Ok(());
            }
            debug!(target: TOPOLOGY, what, tick, "waiting");
            tokio::time::sleep(period).await;
        }
        if done().await {
            return Ok(());
        }
        Err(WaitError::Timeout { what, ticks })
    }

    /// Waits for the running failover to signal its end.
    ///
    /// # Errors
    ///
    /// [`WaitError::Timeout`] when no signal arrives in time.
    pub async fn wait_failover_end(&self) -> Result<(), WaitError> {
        self.wait_until("failover end", || async move {
            self.ctx.failover_cond.try_recv().is_some()
        })
        .await
    }

    /// # Errors
    ///
    /// [`WaitError::Timeout`] when no signal arrives in time.
    pub async fn wait_switchover_end(&self) -> Result<(), WaitError> {
        self.wait_until("switchover end", || async move {
            self.ctx.switchover_cond.try_recv().is_some()
        })
        .await
    }

    /// # Errors
    ///
    /// [`WaitError::Timeout`] when no rejoin completes in time.
    pub async fn wait_rejoin(&self) -> Result<(), WaitError> {
        self.wait_until("rejoin", || async move { self.ctx.rejoin_cond.try_recv().is_some() })
            .await
    }

    /// Waits until every server is failed.
    ///
    /// # Errors
    ///
    /// [`WaitError::Timeout`] when a server keeps answering.
    pub async fn wait_cluster_stop(&self) -> Result<(), WaitError> {
        self.wait_until("cluster stop", || async move {
            self.servers().iter().all(|s| s.state().is_failed_or_auth())
        })
        .await
    }

    /// Waits until every proxy routes writes to the current leader.
    ///
    /// # Errors
    ///
    /// [`WaitError::Timeout`] when a proxy still points elsewhere.
    pub async fn wait_proxy_equal_master(&self) -> Result<(), WaitError> {
        self.wait_until("proxy equal master", || async move {
            let Some(master) = self.master() else {
                return false;
            };
            self.proxies().iter().all(|p| {
                p.info()
                    .backends_write
                    .first()
                    .is_some_and(|b| b.host == master.host && b.port == master.port)
            })
        })
        .await
    }

    /// Waits until `url` answers again.
    ///
    /// # Errors
    ///
    /// [`WaitError::Timeout`] when the node stays down.
    pub async fn wait_database_start(&self, url: &str) -> Result<(), WaitError> {
        self.wait_until("database start", || async move {
            self.server(url).is_some_and(|s| !s.state().is_down())
        })
        .await
    }

    /// # Errors
    ///
    /// [`WaitError::Timeout`] when the node keeps answering.
    pub async fn wait_database_failed(&self, url: &str) -> Result<(), WaitError> {
        self.wait_until("database failed", || async move {
            self.server(url).is_some_and(|s| s.state() == ServerState::Failed)
        })
        .await
    }

    /// # Errors
    ///
    /// [`WaitError::Timeout`] when no leader is elected or discovered.
    pub async fn wait_master_discovery(&self) -> Result<(), WaitError> {
        self.wait_until("master discovery", || async move { self.master().is_some() })
            .await
    }

    /// Waits until the topology engine has completed a discovery.
    ///
    /// # Errors
    ///
    /// [`WaitError::Timeout`] when discovery never settles.
    pub async fn wait_bootstrap_discovery(&self) -> Result<(), WaitError> {
        self.wait_until("bootstrap discovery", || async move { self.ctx.sme.is_discovered() })
            .await
    }

    /// Waits until a session to every server answers a ping.
    ///
    /// # Errors
    ///
    /// [`WaitError::Timeout`] when a server stays unreachable.
    pub async fn wait_database_can_conn(&self) -> Result<(), WaitError> {
        self.wait_until("database connection", || async move {
            for s in self.servers() {
                let Ok(session) = s.ensure_session().await else {
                    return false;
                };
                if session.ping().await.is_err() {
                    return false;
                }
            }
            true
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::db::fake::FakeFleet;
    use crate::monitor::testutil::context;

    #[tokio::test(start_paused = true)]
    async fn master_discovery_waits_for_ticks() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        fleet.replicate(&b, &a);
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&fleet, dir.path(), |c| {
            c.hosts = vec![a.clone(), b.clone()];
            c.monitor_wait_retry = 5;
        });
        let cluster = Cluster::new(ctx);

        let waiter = {
            let cluster = std::sync::Arc::clone(&cluster);
            tokio::spawn(async move { cluster.wait_master_discovery().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cluster.tick().await;
        cluster.tick().await;
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_after_retries() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&fleet, dir.path(), |c| {
            c.hosts = vec![a.clone()];
            c.monitor_wait_retry = 3;
        });
        let cluster = Cluster::new(ctx);

        let err = cluster.wait_failover_end().await.unwrap_err();
        assert!(matches!(err, WaitError::Timeout { what: "failover end", ticks: 3 }));
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_signal_is_consumed_once() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&fleet, dir.path(), |c| {
            c.hosts = vec![a.clone()];
            c.monitor_wait_retry = 2;
        });
        let cluster = Cluster::new(ctx);

        cluster.context().rejoin_cond.send(true);
        assert!(cluster.wait_rejoin().await.is_ok());
        assert!(cluster.wait_rejoin().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn database_failed_follows_crash() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&fleet, dir.path(), |c| {
            c.hosts = vec![a.clone()];
            c.monitor_wait_retry = 2;
        });
        let cluster = Cluster::new(ctx);
        cluster.tick().await;
        assert!(cluster.wait_database_start(&a).await.is_ok());

        fleet.crash(&a);
        assert!(cluster.wait_database_failed(&a).await.is_err());
        for _ in 0..6 {
            cluster.tick().await;
        }
        assert!(cluster.wait_database_failed(&a).await.is_ok());
    }
}
