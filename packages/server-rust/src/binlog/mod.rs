//! Binlog lifecycle: oldest-event indexing and bounded purge.
//!
//! Copying binlogs into the backup directory lives in [`copy`]; the
//! `mysqlbinlog` seam lives in [`reader`].

pub mod copy;
pub mod reader;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use repman_core::binlog::{plan_master_purge, BinlogName, PurgePlan, GIB};
use tracing::{debug, info, warn};

use crate::error::BinlogError;
use crate::logging::PURGE;
use crate::monitor::ServerMonitor;
use reader::BinlogSource;

/// Result of a leader purge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeOutcome {
    /// `force_binlog_purge` is off.
    Disabled,
    /// Fewer replicas than required are connected.
    NotEnoughReplicas { connected: u32, required: u32 },
    /// Nothing older than the kept window.
    Kept,
    Purged { until: String, capped: bool },
    /// The server bounds its own binlog size.
    TotalSizeSet(u64),
}

/// Clears an in-progress flag on drop.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn take(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ServerMonitor {
    /// Connection parameters for reading this node's binlogs remotely.
    #[must_use]
    pub fn binlog_source(&self) -> BinlogSource {
        let config = self.ctx.config();
        BinlogSource {
            host: self.host.clone(),
            port: self.port,
            user: config.db_user.clone(),
            password: config.db_password.clone(),
        }
    }

    /// Reads the first event of the oldest binlog and stores its time.
    ///
    /// # Errors
    ///
    /// Fails when the reader fails.
    pub async fn refresh_oldest_binlog_timestamp(&self) -> Result<Option<i64>, BinlogError> {
        let oldest = self.view().binary_log_oldest_file;
        if oldest.is_empty() {
            return Ok(None);
        }
        let ts = self
            .ctx
            .collab
            .binlog_reader
            .first_event_time(&self.binlog_source(), &oldest)
            .await?;
        if let Some(ts) = ts {
            self.update(|v| v.oldest_binary_log_timestamp = ts);
        }
        Ok(ts)
    }

    /// Purges this leader's binlogs down to the size budget, never past the
    /// file the slowest of `replicas` is reading.
    ///
    /// # Errors
    ///
    /// [`BinlogError::PurgeRunning`] when a purge is already in progress and
    /// [`BinlogError::Inconsistent`] when replica positions contradict the
    /// binlog list.
    pub async fn purge_master_binlogs(&self, replicas: &[Arc<ServerMonitor>]) -> Result<PurgeOutcome, BinlogError> {
        let config = self.ctx.config();
        if !config.force_binlog_purge {
            return Ok(PurgeOutcome::Disabled);
        }
        let _guard = FlagGuard::take(&self.in_purging_binary_log)
            .ok_or_else(|| BinlogError::PurgeRunning(self.url.clone()))?;
        let view = self.view();
        let required = config.force_binlog_purge_min_replica;
        if view.binlog_dump_count < required {
            self.ctx.sme.raise("WARN0106", &[&required]);
            debug!(target: PURGE, server = %self.url, connected = view.binlog_dump_count, required, "not enough replicas for purge");
            return Ok(PurgeOutcome::NotEnoughReplicas {
                connected: view.binlog_dump_count,
                required,
            });
        }
        let session = self
            .session()
            .map_err(|e| BinlogError::Reader(e.to_string()))?;
        let budget = config.force_binlog_purge_total_size.saturating_mul(GIB);

        if view.version.has_binlog_total_size() {
            session.set_global("max_binlog_total_size", &budget.to_string()).await?;
            info!(target: PURGE, server = %self.url, bytes = budget, "binlog total size bound set");
            return Ok(PurgeOutcome::TotalSizeSet(budget));
        }

        let Some((current, _)) = view.binary_logs.last() else {
            return Ok(PurgeOutcome::Kept);
        };
        let current: BinlogName = current.parse().map_err(|_| BinlogError::Inconsistent {
            url: self.url.clone(),
            reason: format!("unparsable binlog {current}"),
        })?;
        let channel = config.replication_source_name.clone();
        let slowest = replicas
            .iter()
            .filter_map(|r| {
                let rv = r.view();
                let rs = rv.replication(&channel)?;
                (rs.master_host == self.host && rs.master_port == self.port)
                    .then(|| rs.master_log_file.parse::<BinlogName>().ok())
                    .flatten()
            })
            .min_by_key(|b| b.suffix)
            .unwrap_or(current);

        match plan_master_purge(&view.binary_logs, budget, &slowest) {
            PurgePlan::Keep => Ok(PurgeOutcome::Kept),
            PurgePlan::Inconsistent(reason) => Err(BinlogError::Inconsistent {
                url: self.url.clone(),
                reason,
            }),
            PurgePlan::PurgeTo { until, capped } => {
                if capped {
                    let detail = format!("binlog purge capped at slowest replica file {slowest}");
                    self.ctx.sme.raise_for("WARN0105", &self.url, &[&self.url, &detail]);
                    warn!(target: PURGE, server = %self.url, until = %until, "purge cutoff capped by slowest replica");
                }
                session.purge_binary_logs_to(&until).await?;
                metrics::counter!("repman_binlog_purges_total", "role" => "master").increment(1);
                info!(target: PURGE, server = %self.url, until = %until, capped, "binary logs purged");
                if let Ok(files) = session.binary_logs().await {
                    self.update(|v| v.binary_logs = files);
                }
                Ok(PurgeOutcome::Purged { until, capped })
            }
        }
    }

    /// Purges this replica's own binlogs older than `before_ts`, normally the
    /// leader's oldest binlog timestamp.
    ///
    /// # Errors
    ///
    /// [`BinlogError::PurgeRunning`] when a purge is already in progress.
    pub async fn purge_replica_binlogs(&self, before_ts: i64) -> Result<bool, BinlogError> {
        let config = self.ctx.config();
        if !config.force_binlog_purge_replicas || before_ts <= 0 {
            return Ok(false);
        }
        let _guard = FlagGuard::take(&self.in_purging_binary_log)
            .ok_or_else(|| BinlogError::PurgeRunning(self.url.clone()))?;
        let session = self
            .session()
            .map_err(|e| BinlogError::Reader(e.to_string()))?;
        session.purge_binary_logs_before(before_ts).await?;
        metrics::counter!("repman_binlog_purges_total", "role" => "replica").increment(1);
        info!(target: PURGE, server = %self.url, before_ts, "replica binary logs purged");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::FakeFleet;
    use crate::monitor::testutil::context;

    struct Fixture {
        _dir: tempfile::TempDir,
        fleet: FakeFleet,
        master: Arc<ServerMonitor>,
        replicas: Vec<Arc<ServerMonitor>>,
    }

    async fn fixture(f: impl FnOnce(&mut crate::config::ClusterConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        let c = fleet.add_mariadb("c", 3306, 3);
        fleet.replicate(&b, &a);
        fleet.replicate(&c, &a);
        fleet.set_binlogs(&a, 12, GIB);
        let ctx = context(&fleet, dir.path(), f);
        let master = ServerMonitor::new(Arc::clone(&ctx), &a);
        let replicas = vec![ServerMonitor::new(Arc::clone(&ctx), &b), ServerMonitor::new(ctx, &c)];
        master.ping(None).await;
        for r in &replicas {
            r.ping(Some(1)).await;
        }
        Fixture {
            _dir: dir,
            fleet,
            master,
            replicas,
        }
    }

    #[tokio::test]
    async fn purge_is_capped_by_slowest_replica() {
        let fx = fixture(|c| {
            c.force_binlog_purge = true;
            c.force_binlog_purge_total_size = 5;
        })
        .await;
        fx.replicas[1].update(|v| v.replications[0].master_log_file = "mysql-bin.000004".into());
        let out = fx.master.purge_master_binlogs(&fx.replicas).await.unwrap();
        assert_eq!(
            out,
            PurgeOutcome::Purged {
                until: "mysql-bin.000004".into(),
                capped: true
            }
        );
        let files = fx.fleet.node("a:3306").unwrap().binlogs;
        assert_eq!(files.first().unwrap().name, "mysql-bin.000004");
        assert_eq!(files.len(), 9);
        assert!(fx.master.ctx.sme.is_in_current_state("WARN0105"));
        assert!(!fx.master.in_purging_binary_log.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn purge_requires_connected_replicas() {
        let fx = fixture(|c| {
            c.force_binlog_purge = true;
            c.force_binlog_purge_min_replica = 3;
        })
        .await;
        let out = fx.master.purge_master_binlogs(&fx.replicas).await.unwrap();
        assert_eq!(
            out,
            PurgeOutcome::NotEnoughReplicas {
                connected: 2,
                required: 3
            }
        );
        assert!(fx.master.ctx.sme.is_in_current_state("WARN0106"));
    }

    #[tokio::test]
    async fn purge_disabled_by_default() {
        let fx = fixture(|_| {}).await;
        assert_eq!(
            fx.master.purge_master_binlogs(&fx.replicas).await.unwrap(),
            PurgeOutcome::Disabled
        );
    }

    #[tokio::test]
    async fn concurrent_purge_is_refused() {
        let fx = fixture(|c| c.force_binlog_purge = true).await;
        fx.master.in_purging_binary_log.store(true, Ordering::SeqCst);
        let err = fx.master.purge_master_binlogs(&fx.replicas).await.unwrap_err();
        assert!(matches!(err, BinlogError::PurgeRunning(_)));
    }

    #[tokio::test]
    async fn replica_purge_uses_leader_timestamp() {
        let fx = fixture(|c| c.force_binlog_purge_replicas = true).await;
        let b = &fx.replicas[0];
        fx.fleet.set_binlogs("b:3306", 4, 100);
        assert!(b.purge_replica_binlogs(1_700_000_000).await.unwrap());
        assert!(fx.fleet.received("b:3306", "PURGE BINARY LOGS BEFORE"));
    }
}
