//! Failover gates, candidate election, failover and switchover.

use std::sync::Arc;
use std::time::Duration;

use repman_core::binlog::BinlogName;
use repman_core::{Crash, ServerState};
use tracing::{debug, info, warn};

use super::Cluster;
use crate::error::{FailoverError, MonitorError};
use crate::logging::FAILOVER;
use crate::monitor::ServerMonitor;
use crate::proxy::for_each_proxy;
use crate::traits::ToolCommand;

/// Ordering key of an electable replica: GTID sequence sum, then binlog
/// file suffix and executed position on the old leader.
type ElectionKey = (u64, u32, u64);

impl Cluster {
    /// Runs every automatic failover gate in order. The first gate that
    /// blocks records its code and is returned.
    ///
    /// # Errors
    ///
    /// [`FailoverError::Precondition`] naming the blocking gate.
    pub async fn check_failed(&self) -> Result<(), FailoverError> {
        let blocked = |code: &'static str| Err(FailoverError::Precondition { code });
        let sme = &self.ctx.sme;
        if sme.is_in_failover() {
            sme.raise("ERR00001", &[]);
            return blocked("ERR00001");
        }
        let Some(master) = self.master() else {
            return blocked("ERR00012");
        };
        let config = self.ctx.config();

        let gate = self.failover_gate(&master).await;
        if let Err(FailoverError::Precondition { code }) = &gate {
            if master.state() == ServerState::Failed && *code != "ERR00002" {
                let max_fail = master.view().fail_count >= config.max_fail;
                sme.raise("ERR00023", &[&master.state(), &config.interactive, &max_fail]);
            }
        }
        gate
    }

    async fn failover_gate(&self, master: &Arc<ServerMonitor>) -> Result<(), FailoverError> {
        let blocked = |code: &'static str| Err(FailoverError::Precondition { code });
        let sme = &self.ctx.sme;
        let config = self.ctx.config();

        if self.elect_candidate(&self.slaves(), true).is_none() {
            sme.raise("ERR00032", &[]);
            return blocked("ERR00032");
        }
        let last = self.inner.lock().failover_ts;
        let now = chrono::Utc::now().timestamp();
        if last != 0 && now - last < config.fail_time {
            sme.raise("ERR00029", &[]);
            return blocked("ERR00029");
        }
        if master.view().fail_count < config.max_fail {
            return blocked("WARN0023");
        }
        sme.raise("WARN0023", &[]);
        if self.ctx.is_arbitration_lost() {
            sme.raise("WARN0080", &[]);
            return blocked("WARN0080");
        }
        if config.fail_limit > 0 && self.failover_count() >= config.fail_limit {
            sme.raise("ERR00027", &[]);
            return blocked("ERR00027");
        }
        if config.interactive {
            sme.raise("ERR00002", &[]);
            return blocked("ERR00002");
        }
        if master.state() != ServerState::Failed {
            return blocked("ERR00023");
        }
        if config.check_false_positive_heartbeat {
            if let Some(url) = self.heartbeat_still_flowing(master).await {
                sme.raise_for("ERR00028", &url, &[&url]);
                return blocked("ERR00028");
            }
        }
        Ok(())
    }

    /// A replica whose heartbeat counter still moves can reach the leader.
    async fn heartbeat_still_flowing(&self, master: &Arc<ServerMonitor>) -> Option<String> {
        let config = self.ctx.config();
        let channel = config.replication_source_name.clone();
        let followers: Vec<(Arc<ServerMonitor>, u64)> = self
            .slaves()
            .into_iter()
            .filter(|s| s.view().replicates_from(&channel, &master.host, master.port))
            .filter_map(|s| {
                let seen = s.received_heartbeats(&channel)?;
                Some((s, seen))
            })
            .collect();
        tokio::time::sleep(Duration::from_secs(config.check_false_positive_heartbeat_timeout)).await;
        for (s, before) in followers {
            match s.fresh_replication_status().await {
                Ok(r) if r.heartbeat_period > 0.0 && r.received_heartbeats > before => {
                    return Some(s.url.clone());
                }
                Ok(_) => {}
                Err(e) => debug!(target: FAILOVER, server = %s.url, error = %e, "heartbeat probe failed"),
            }
        }
        None
    }

    /// Best replica to promote among `slaves`, recording why others were
    /// skipped. A preferred replica wins a switchover outright.
    #[must_use]
    pub fn elect_candidate(&self, slaves: &[Arc<ServerMonitor>], for_failover: bool) -> Option<Arc<ServerMonitor>> {
        let config = self.ctx.config();
        let sme = &self.ctx.sme;
        let channel = config.replication_source_name.clone();
        let topology = self.topology();
        let master = self.master();
        let mut best: Option<(ElectionKey, Arc<ServerMonitor>)> = None;

        for s in slaves {
            let url = &s.url;
            let v = s.view();
            if config.is_ignored(url) {
                sme.raise_for("ERR00037", url, &[url]);
                continue;
            }
            if topology.is_multi_master() && v.state == ServerState::Master {
                sme.raise_for("ERR00035", url, &[url]);
                continue;
            }
            if v.is_relay {
                sme.raise_for("ERR00036", url, &[url]);
                continue;
            }
            let Some(r) = v.replication(&channel) else {
                sme.raise_for("ERR00033", url, &[url]);
                continue;
            };
            if r.master_log_file.is_empty() {
                sme.raise_for("ERR00033", url, &[url]);
                continue;
            }
            if let Some(m) = &master {
                if !topology.is_multi_master() && !v.replicates_from(&channel, &m.host, m.port) {
                    let code = if for_failover { "ERR00038" } else { "ERR00034" };
                    sme.raise_for(code, url, &[url]);
                    continue;
                }
            }
            if v.state.is_down() || !v.have_binlog {
                sme.raise_for("ERR00040", url, &[url]);
                continue;
            }
            if config.rpl_checks {
                if let Some(delay) = r.seconds_behind_master.filter(|d| *d > config.fail_max_delay) {
                    sme.raise_for("ERR00041", url, &[url, &config.fail_max_delay, &delay]);
                    continue;
                }
            }
            if !r.sql_running {
                sme.raise_for("ERR00042", url, &[url]);
                continue;
            }
            let sync_required = if for_failover { config.fail_sync } else { config.switch_sync };
            if sync_required && v.have_semisync && !v.semisync_slave_status {
                sme.raise_for("ERR00043", url, &[url]);
                continue;
            }
            if !for_failover && s.is_preferred() {
                return Some(Arc::clone(s));
            }
            let gtid = if for_failover { &v.io_gtid } else { &v.slave_gtid };
            let suffix = r.master_log_file.parse::<BinlogName>().map_or(0, |b| b.suffix);
            let key = (gtid.seq_sum(), suffix, r.exec_master_log_pos);
            if best.as_ref().map_or(true, |(k, _)| key > *k) {
                best = Some((key, Arc::clone(s)));
            }
        }
        best.map(|(_, s)| s)
    }

    // -----------------------------------------------------------------------
    // Failover
    // -----------------------------------------------------------------------

    /// Replaces the failed leader with the best replica.
    ///
    /// # Errors
    ///
    /// [`FailoverError::InProgress`] when another failover runs, and any
    /// error of the promotion itself.
    pub async fn failover(&self) -> Result<Arc<ServerMonitor>, FailoverError> {
        if !self.ctx.sme.try_enter_failover() {
            return Err(FailoverError::InProgress);
        }
        let res = self.run_failover().await;
        self.ctx.sme.remove_failover_state();
        self.ctx.failover_cond.send(res.is_ok());
        let new = match res {
            Ok(new) => new,
            Err(e) => {
                warn!(target: FAILOVER, error = %e, "failover aborted");
                return Err(e);
            }
        };

        let preferred = self
            .slaves()
            .into_iter()
            .find(|s| s.is_preferred() && s.url != new.url && !s.state().is_down());
        if let Some(pm) = preferred {
            info!(target: FAILOVER, server = %pm.url, "switching over to the preferred master");
            if let Err(e) = self.switchover(Some(&pm.url)).await {
                warn!(target: FAILOVER, server = %pm.url, error = %e, "switchover to preferred master failed");
            }
            return Ok(self.master().unwrap_or(new));
        }
        Ok(new)
    }

    async fn run_failover(&self) -> Result<Arc<ServerMonitor>, FailoverError> {
        let config = self.ctx.config();
        let old = self.master().ok_or(FailoverError::NoMaster)?;
        let slaves = self.slaves();
        let Some(candidate) = self.elect_candidate(&slaves, true) else {
            self.ctx.sme.raise("ERR00032", &[]);
            return Err(FailoverError::NoCandidate);
        };
        info!(target: FAILOVER, old = %old.url, new = %candidate.url, "failover started");
        self.run_hook(config.pre_failover_script.as_deref(), &old.host, &candidate.host).await;

        self.wait_relay_drain(&candidate).await;
        let r = candidate.fresh_replication_status().await?;
        let cv = candidate.view();
        let mut crash = Crash {
            url: old.url.clone(),
            server_id: old.server_id(),
            failover_io_gtid: if cv.have_mariadb_gtid || cv.have_mysql_gtid {
                cv.io_gtid.clone()
            } else {
                repman_core::GtidList::default()
            },
            failover_master_log_file: r.master_log_file.clone(),
            failover_master_log_pos: r.read_master_log_pos,
            elected_master_url: candidate.url.clone(),
            failover_semisync_slave_status: cv.semisync_slave_status,
            switchover: false,
            timestamp: chrono::Utc::now().timestamp(),
            ..Crash::default()
        };

        self.promote(&candidate).await?;
        let nv = candidate.view();
        crash.new_master_log_file.clone_from(&nv.binary_log_file);
        crash.new_master_log_pos = nv.binary_log_pos;
        self.set_members(|_, _, crashes| crashes.push(crash.clone()));

        let others: Vec<Arc<ServerMonitor>> = slaves.into_iter().filter(|s| s.url != candidate.url).collect();
        self.repoint_replicas(&others, &candidate, &crash).await;

        {
            let mut inner = self.inner.lock();
            inner.master = Some(Arc::clone(&candidate));
            inner.slaves = others;
            inner.failover_count += 1;
            inner.failover_ts = chrono::Utc::now().timestamp();
        }
        old.update(|v| v.fail_count = 0);

        let view = self.proxy_view();
        let proxies = self.proxies();
        for_each_proxy(&proxies, "failover", |p| p.failover(&view)).await;
        self.run_hook(config.post_failover_script.as_deref(), &old.host, &candidate.host).await;

        metrics::counter!("repman_failovers_total", "cluster" => config.name.clone()).increment(1);
        info!(target: FAILOVER, old = %old.url, new = %candidate.url, "failover done");
        self.save_crashes().await;
        Ok(candidate)
    }

    /// Lets the candidate apply what it already fetched.
    async fn wait_relay_drain(&self, candidate: &ServerMonitor) {
        let config = self.ctx.config();
        for attempt in 0..config.monitor_wait_retry.max(1) {
            match candidate.fresh_replication_status().await {
                Ok(r) if r.exec_master_log_pos >= r.read_master_log_pos => return,
                Ok(r) => debug!(target: FAILOVER, server = %candidate.url, attempt, read = r.read_master_log_pos,
                    exec = r.exec_master_log_pos, "waiting for relay log"),
                Err(e) => {
                    warn!(target: FAILOVER, server = %candidate.url, error = %e, "relay state unreadable");
                    return;
                }
            }
            tokio::time::sleep(config.ticker()).await;
        }
        warn!(target: FAILOVER, server = %candidate.url, "relay log not drained, promoting anyway");
    }

    /// Turns a replica into a writable leader.
    async fn promote(&self, candidate: &ServerMonitor) -> Result<(), FailoverError> {
        let config = self.ctx.config();
        candidate.stop_slave().await?;
        candidate.reset_slave(true).await?;
        candidate.set_read_write().await?;
        if config.failover_event_scheduler {
            if let Err(e) = candidate.set_event_scheduler(true).await {
                warn!(target: FAILOVER, server = %candidate.url, error = %e, "could not enable the event scheduler");
            }
        }
        if let Err(e) = candidate.refresh().await {
            warn!(target: FAILOVER, server = %candidate.url, error = %e, "new leader refresh failed");
        }
        candidate.update(|v| {
            v.state = ServerState::Master;
            v.fail_count = 0;
        });
        Ok(())
    }

    /// Points `replicas` at `new`, by GTID when they use it, otherwise at the
    /// coordinates the new leader had right after promotion.
    async fn repoint_replicas(&self, replicas: &[Arc<ServerMonitor>], new: &ServerMonitor, crash: &Crash) {
        for s in replicas.iter().filter(|s| !s.state().is_down()) {
            let v = s.view();
            let res = if v.have_mariadb_gtid || v.have_mysql_gtid {
                s.set_replication_gtid_slave_pos_from_server(new).await
            } else {
                s.set_replication_positional(new, &crash.new_master_log_file, crash.new_master_log_pos)
                    .await
            };
            match res {
                Ok(()) => info!(target: FAILOVER, server = %s.url, master = %new.url, "replica repointed"),
                Err(e) => warn!(target: FAILOVER, server = %s.url, error = %e, "could not repoint replica"),
            }
        }
    }

    async fn run_hook(&self, script: Option<&str>, old_host: &str, new_host: &str) {
        let Some(script) = script else {
            return;
        };
        let cmd = ToolCommand::new(script).arg(old_host).arg(new_host);
        match self.ctx.collab.scripts.run(&cmd).await {
            Ok(out) => info!(target: FAILOVER, script, output = %out.trim(), "failover script done"),
            Err(e) => warn!(target: FAILOVER, script, error = %e, "failover script failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Switchover
    // -----------------------------------------------------------------------

    /// Hands leadership from a live leader to `target`, or to the best
    /// replica when `target` is `None`.
    ///
    /// # Errors
    ///
    /// [`FailoverError::LongRunningWrites`], [`FailoverError::Freeze`] or
    /// [`FailoverError::CatchUp`] when the old leader cannot be frozen or
    /// the candidate cannot catch up; the old leader is writable again.
    pub async fn switchover(&self, target: Option<&str>) -> Result<Arc<ServerMonitor>, FailoverError> {
        if self.master().map_or(true, |m| m.state().is_down()) {
            return Err(FailoverError::NoMaster);
        }
        if !self.ctx.sme.try_enter_failover() {
            return Err(FailoverError::InProgress);
        }
        let res = self.run_switchover(target).await;
        self.ctx.sme.remove_failover_state();
        self.ctx.switchover_cond.send(res.is_ok());
        if let Err(e) = &res {
            warn!(target: FAILOVER, error = %e, "switchover aborted");
        }
        res
    }

    async fn run_switchover(&self, target: Option<&str>) -> Result<Arc<ServerMonitor>, FailoverError> {
        let config = self.ctx.config();
        let old = self.master().ok_or(FailoverError::NoMaster)?;
        let slaves = self.slaves();
        let pool: Vec<Arc<ServerMonitor>> = match target {
            Some(url) => slaves.iter().filter(|s| s.url == url).cloned().collect(),
            None => slaves.clone(),
        };
        let Some(candidate) = self.elect_candidate(&pool, false) else {
            self.ctx.sme.raise("ERR00032", &[]);
            return Err(FailoverError::NoCandidate);
        };
        info!(target: FAILOVER, old = %old.url, new = %candidate.url, "switchover started");

        let session = old.session()?;
        if session.long_running_writes(config.switchover_wait_write_query).await? > 0 {
            return Err(FailoverError::LongRunningWrites(old.url.clone()));
        }
        let wait = Duration::from_secs(config.switchover_wait_trx);
        match tokio::time::timeout(wait, old.flush_tables()).await {
            Ok(res) => res?,
            Err(_) => return Err(FailoverError::Freeze(old.url.clone())),
        }

        self.run_hook(config.pre_failover_script.as_deref(), &old.host, &candidate.host).await;
        old.set_read_only().await?;
        if let Err(e) = old.flush_tables_with_read_lock(wait).await {
            warn!(target: FAILOVER, server = %old.url, error = %e, "read lock not granted");
            self.thaw(&old).await;
            return Err(FailoverError::Freeze(old.url.clone()));
        }
        if let Err(e) = old.refresh().await {
            self.thaw(&old).await;
            return Err(e.into());
        }
        let ov = old.view();

        let catch_up = async {
            let s = candidate.session()?;
            let cv = candidate.view();
            if cv.have_mariadb_gtid || cv.have_mysql_gtid {
                s.master_gtid_wait(&ov.gtid_binlog_pos.to_string(), wait, &candidate.version()).await?;
            } else {
                s.master_pos_wait(&ov.binary_log_file, ov.binary_log_pos, wait).await?;
            }
            Ok::<(), MonitorError>(())
        };
        if let Err(e) = catch_up.await {
            self.thaw(&old).await;
            return Err(FailoverError::CatchUp {
                url: candidate.url.clone(),
                reason: e.to_string(),
            });
        }

        let mut crash = Crash {
            url: old.url.clone(),
            server_id: old.server_id(),
            failover_io_gtid: ov.gtid_binlog_pos.clone(),
            failover_master_log_file: ov.binary_log_file.clone(),
            failover_master_log_pos: ov.binary_log_pos,
            elected_master_url: candidate.url.clone(),
            failover_semisync_slave_status: candidate.view().semisync_slave_status,
            switchover: true,
            timestamp: chrono::Utc::now().timestamp(),
            ..Crash::default()
        };
        if let Err(e) = self.promote(&candidate).await {
            self.thaw(&old).await;
            return Err(e);
        }
        let nv = candidate.view();
        crash.new_master_log_file.clone_from(&nv.binary_log_file);
        crash.new_master_log_pos = nv.binary_log_pos;
        self.set_members(|_, _, crashes| crashes.push(crash.clone()));

        if let Err(e) = old.unlock_tables().await {
            warn!(target: FAILOVER, server = %old.url, error = %e, "could not release the read lock");
        }
        match old.set_replication_gtid_current_pos_from_server(&candidate).await {
            Ok(()) => old.set_state(ServerState::Slave),
            Err(e) => warn!(target: FAILOVER, server = %old.url, error = %e, "old leader could not replicate"),
        }

        let others: Vec<Arc<ServerMonitor>> = slaves.into_iter().filter(|s| s.url != candidate.url).collect();
        self.repoint_replicas(&others, &candidate, &crash).await;
        {
            let mut inner = self.inner.lock();
            inner.master = Some(Arc::clone(&candidate));
            let mut slaves = others;
            slaves.push(Arc::clone(&old));
            inner.slaves = slaves;
        }

        let view = self.proxy_view();
        let proxies = self.proxies();
        for_each_proxy(&proxies, "switchover", |p| p.failover(&view)).await;
        self.run_hook(config.post_failover_script.as_deref(), &old.host, &candidate.host).await;

        metrics::counter!("repman_switchovers_total", "cluster" => config.name.clone()).increment(1);
        info!(target: FAILOVER, old = %old.url, new = %candidate.url, "switchover done");
        self.save_crashes().await;
        Ok(candidate)
    }

    /// Undoes the freeze of an aborted switchover.
    async fn thaw(&self, old: &ServerMonitor) {
        if let Err(e) = old.unlock_tables().await {
            warn!(target: FAILOVER, server = %old.url, error = %e, "could not release the read lock");
        }
        if let Err(e) = old.set_read_write().await {
            warn!(target: FAILOVER, server = %old.url, error = %e, "old leader left read-only");
        }
    }
}

impl ServerMonitor {
    /// Heartbeat counter of `channel` from the last refresh.
    fn received_heartbeats(&self, channel: &str) -> Option<u64> {
        self.view().replication(channel).map(|r| r.received_heartbeats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::FakeFleet;
    use crate::monitor::testutil::context;

    fn fleet3() -> (FakeFleet, Vec<String>) {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        let c = fleet.add_mariadb("c", 3306, 3);
        fleet.replicate(&b, &a);
        fleet.replicate(&c, &a);
        (fleet, vec![a, b, c])
    }

    async fn discovered(fleet: &FakeFleet, dir: &std::path::Path, f: impl FnOnce(&mut crate::config::ClusterConfig)) -> Arc<Cluster> {
        let hosts = vec!["a:3306".to_string(), "b:3306".to_string(), "c:3306".to_string()];
        let ctx = context(fleet, dir, |c| {
            c.hosts = hosts;
            f(c);
        });
        let cluster = Cluster::with_proxies(ctx, Vec::new());
        cluster.tick().await;
        cluster.tick().await;
        cluster
    }

    #[tokio::test(start_paused = true)]
    async fn election_prefers_most_advanced_replica() {
        let (fleet, _) = fleet3();
        let dir = tempfile::tempdir().unwrap();
        let cluster = discovered(&fleet, dir.path(), |_| {}).await;
        let b = cluster.server("b:3306").unwrap();
        let c = cluster.server("c:3306").unwrap();
        b.update(|v| v.slave_gtid = repman_core::GtidList::parse("0-1-7").unwrap());
        c.update(|v| v.slave_gtid = repman_core::GtidList::parse("0-1-10").unwrap());
        assert_eq!(cluster.elect_candidate(&cluster.slaves(), false).unwrap().url, "c:3306");
        b.update(|v| v.io_gtid = repman_core::GtidList::parse("0-1-12").unwrap());
        c.update(|v| v.io_gtid = repman_core::GtidList::parse("0-1-11").unwrap());
        assert_eq!(cluster.elect_candidate(&cluster.slaves(), true).unwrap().url, "b:3306");
    }

    #[tokio::test(start_paused = true)]
    async fn election_skips_ignored_and_broken_replicas() {
        let (fleet, _) = fleet3();
        let dir = tempfile::tempdir().unwrap();
        let cluster = discovered(&fleet, dir.path(), |c| c.ignore_servers = vec!["b:3306".into()]).await;
        fleet.break_sql("c:3306", 1062, "Duplicate entry");
        cluster.tick().await;
        assert!(cluster.elect_candidate(&cluster.slaves(), true).is_none());
        let sme = &cluster.context().sme;
        assert!(sme.is_in_current_state("ERR00037") || sme.is_in_state("ERR00037"));
    }

    #[tokio::test(start_paused = true)]
    async fn preferred_master_wins_switchover_election() {
        let (fleet, _) = fleet3();
        let dir = tempfile::tempdir().unwrap();
        let cluster = discovered(&fleet, dir.path(), |c| c.pref_master = vec!["c:3306".into()]).await;
        let best = cluster.elect_candidate(&cluster.slaves(), false).unwrap();
        assert_eq!(best.url, "c:3306");
    }

    #[tokio::test(start_paused = true)]
    async fn interactive_mode_blocks_failover() {
        let (fleet, _) = fleet3();
        let dir = tempfile::tempdir().unwrap();
        let cluster = discovered(&fleet, dir.path(), |c| c.max_fail = 1).await;
        fleet.crash("a:3306");
        cluster.tick().await;
        cluster.tick().await;
        assert_eq!(cluster.master().unwrap().url, "a:3306");
        assert_eq!(cluster.master().unwrap().state(), ServerState::Failed);
        let res = cluster.check_failed().await;
        assert!(matches!(res, Err(FailoverError::Precondition { code: "ERR00002" })));
    }

    #[tokio::test(start_paused = true)]
    async fn failover_limit_is_enforced() {
        let (fleet, _) = fleet3();
        let dir = tempfile::tempdir().unwrap();
        let cluster = discovered(&fleet, dir.path(), |c| {
            c.interactive = false;
            c.max_fail = 1;
            c.fail_limit = 1;
        })
        .await;
        cluster.inner.lock().failover_count = 1;
        fleet.crash("a:3306");
        cluster.tick().await;
        cluster.tick().await;
        let res = cluster.check_failed().await;
        assert!(matches!(res, Err(FailoverError::Precondition { code: "ERR00027" })));
        assert_eq!(cluster.master().unwrap().url, "a:3306");
    }

    #[tokio::test(start_paused = true)]
    async fn switchover_refused_with_long_running_writes() {
        let (fleet, _) = fleet3();
        let dir = tempfile::tempdir().unwrap();
        let cluster = discovered(&fleet, dir.path(), |_| {}).await;
        fleet.with_node("a:3306", |n| n.long_running_writes = 2);
        let res = cluster.switchover(None).await;
        assert!(matches!(res, Err(FailoverError::LongRunningWrites(_))));
        assert!(!cluster.context().sme.is_in_failover());
        assert_eq!(cluster.master().unwrap().url, "a:3306");
    }

    #[tokio::test(start_paused = true)]
    async fn second_failover_is_rejected_while_one_runs() {
        let (fleet, _) = fleet3();
        let dir = tempfile::tempdir().unwrap();
        let cluster = discovered(&fleet, dir.path(), |_| {}).await;
        assert!(cluster.context().sme.try_enter_failover());
        assert!(matches!(cluster.failover().await, Err(FailoverError::InProgress)));
        assert!(matches!(
            cluster.check_failed().await,
            Err(FailoverError::Precondition { code: "ERR00001" })
        ));
        cluster.context().sme.remove_failover_state();
    }
}
