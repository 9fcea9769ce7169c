//! Probing and topology discovery.

use std::sync::Arc;

use futures_util::future::join_all;
use repman_core::{IoThread, ServerState, Topology};
use tracing::{debug, info, warn};

use super::Cluster;
use crate::config::DatabaseKind;
use crate::logging::TOPOLOGY;
use crate::monitor::probe::is_healthy_channel;
use crate::monitor::{PingOutcome, ServerMonitor};

/// Result of classifying the live nodes of one tick.
#[derive(Default)]
struct Classified {
    slaves: Vec<Arc<ServerMonitor>>,
    master: Option<Arc<ServerMonitor>>,
    vmaster: Option<Arc<ServerMonitor>>,
}

impl Cluster {
    /// Pings every node, ignored ones first, and returns what each ping
    /// asked of the cluster.
    pub async fn probe(&self) -> Vec<(Arc<ServerMonitor>, PingOutcome)> {
        let master_id = self.master().map(|m| m.server_id()).filter(|id| *id != 0);
        let servers = self.servers();
        let (ignored, rest): (Vec<_>, Vec<_>) = servers.into_iter().partition(|s| s.is_ignored());
        let mut out = Vec::new();
        for batch in [ignored, rest] {
            let outcomes = join_all(batch.iter().map(|s| s.ping(master_id))).await;
            out.extend(batch.into_iter().zip(outcomes));
            if self.ctx.sme.is_in_failover() {
                break;
            }
        }
        out
    }

    /// Rebuilds leader, replicas and topology from the last pings.
    pub async fn discover(&self) {
        if self.ctx.sme.is_in_failover() {
            return;
        }
        let config = self.ctx.config();
        let servers = self.servers();
        let active = self.ctx.is_active();

        if servers.len() == 1 {
            self.discover_single(&servers[0]);
            return;
        }

        if self.detect_cluster_down(&servers) {
            return;
        }
        self.check_same_server_id(&servers);

        let prev_master = self.master();
        let mut found = self.classify(&servers, prev_master, active).await;

        if found.slaves.is_empty() && !config.multi_master_wsrep {
            self.ctx.sme.raise("ERR00010", &[]);
        }

        let mut topology = self.detect_multi_master(&servers, &mut found);
        if topology.is_multi_master() {
            for s in &found.slaves {
                s.update(|v| v.is_relay = false);
            }
        } else if self.mark_relays(&found.slaves) && config.multi_tier_slave {
            topology = Topology::MultiTierSlave;
        }
        if topology.is_multi_master() && topology != Topology::MultiMasterWsrep {
            self.audit_multi_master(&found.slaves, active).await;
        }

        if found.master.is_none() && !found.slaves.is_empty() {
            found.master = self.infer_master(&servers, &found.slaves, topology, active).await;
        }

        match &found.master {
            None => self.ctx.sme.raise("ERR00012", &[]),
            Some(master) => self.audit_replicas(master, &found.slaves, active).await,
        }

        let mut inner = self.inner.lock();
        if found.master.is_some() {
            inner.lastmaster = None;
        }
        inner.master = found.master;
        inner.vmaster = found.vmaster;
        inner.slaves = found.slaves;
        inner.topology = topology;
        inner.is_down = false;
    }

    fn discover_single(&self, node: &Arc<ServerMonitor>) {
        let view = node.view();
        let mut inner = self.inner.lock();
        inner.topology = Topology::ActivePassive;
        inner.slaves.clear();
        inner.is_down = view.state.is_failed_or_auth();
        if !view.state.is_down() && !view.is_slave {
            node.set_state(ServerState::Master);
            inner.master = Some(Arc::clone(node));
        }
    }

    /// Leader gone and every other node failed: remember the leader, keep
    /// it unelected unless unsafe restarts are allowed.
    fn detect_cluster_down(&self, servers: &[Arc<ServerMonitor>]) -> bool {
        let config = self.ctx.config();
        let master = self.master();
        let master_failed = master.as_ref().map_or(true, |m| m.state().is_failed_or_auth());
        let others: Vec<&Arc<ServerMonitor>> = servers
            .iter()
            .filter(|s| !s.is_ignored())
            .filter(|s| master.as_ref().map_or(true, |m| m.url != s.url))
            .collect();
        let all_others_failed = !others.is_empty() && others.iter().all(|s| s.state().is_failed_or_auth());
        let known = master.is_some() || self.lastmaster().is_some() || self.ctx.sme.is_discovered();
        if !(master_failed && all_others_failed && known) {
            return false;
        }
        self.ctx.sme.raise("ERR00021", &[]);
        if servers.iter().all(|s| s.state().is_failed_or_auth()) {
            self.ctx.sme.raise("ERR00077", &[]);
        }
        let mut inner = self.inner.lock();
        if !inner.is_down {
            warn!(target: TOPOLOGY, "every node is down");
        }
        inner.is_down = true;
        if !config.fail_restart_unsafe {
            if let Some(m) = inner.master.take() {
                info!(target: TOPOLOGY, server = %m.url, "leader remembered until it restarts");
                inner.lastmaster = Some(m);
            }
        }
        true
    }

    fn check_same_server_id(&self, servers: &[Arc<ServerMonitor>]) {
        for (i, a) in servers.iter().enumerate() {
            let id = a.server_id();
            if id == 0 || a.state().is_down() {
                continue;
            }
            for b in servers.iter().skip(i + 1) {
                if b.server_id() == id && !b.state().is_down() {
                    self.ctx.sme.raise("ERR00080", &[&a.url, &b.url, &id]);
                }
            }
        }
    }

    async fn classify(
        &self,
        servers: &[Arc<ServerMonitor>],
        prev_master: Option<Arc<ServerMonitor>>,
        active: bool,
    ) -> Classified {
        let config = self.ctx.config();
        let mut found = Classified {
            master: prev_master,
            ..Classified::default()
        };
        for s in servers {
            let view = s.view();
            if view.state.is_failed_or_auth() {
                continue;
            }
            if view.is_slave || view.is_wsrep_primary || view.is_group_replication_slave {
                found.slaves.push(Arc::clone(s));
                continue;
            }
            if view.is_group_replication_master {
                found.master = Some(Arc::clone(s));
                found.vmaster = Some(Arc::clone(s));
                continue;
            }
            if view.binlog_dump_count == 0 && view.state != ServerState::Master {
                continue;
            }
            let elsewhere = found.master.as_ref().is_some_and(|m| m.url != s.url && !m.state().is_down());
            if active && elsewhere && !config.multi_master && !config.multi_master_ring {
                self.ctx.sme.raise_for("ERR00063", &s.url, &[&s.url]);
                continue;
            }
            if found.master.as_ref().map_or(true, |m| m.url != s.url) {
                info!(target: TOPOLOGY, server = %s.url, "leader discovered");
            }
            if !view.state.is_down() {
                s.set_state(ServerState::Master);
                if view.read_only && !view.is_relay && active {
                    if let Err(e) = s.set_read_write().await {
                        warn!(target: TOPOLOGY, server = %s.url, error = %e, "could not make leader writable");
                    }
                }
            }
            found.master = Some(Arc::clone(s));
        }
        if config.multi_master_wsrep {
            found.master = self.elect_wsrep_leader(&found.slaves, active).await;
            found.vmaster.clone_from(&found.master);
        }
        found
    }

    /// Picks the writable synced Galera node, or makes the preferred (else
    /// the first) synced node writable when all are read-only.
    async fn elect_wsrep_leader(&self, nodes: &[Arc<ServerMonitor>], active: bool) -> Option<Arc<ServerMonitor>> {
        let synced: Vec<&Arc<ServerMonitor>> = nodes.iter().filter(|s| s.view().is_wsrep_sync).collect();
        if let Some(rw) = synced.iter().find(|s| !s.view().read_only) {
            return Some(Arc::clone(rw));
        }
        let pick = synced.iter().find(|s| s.is_preferred()).or_else(|| synced.first())?;
        if active {
            if let Err(e) = pick.set_read_write().await {
                warn!(target: TOPOLOGY, server = %pick.url, error = %e, "could not make Galera leader writable");
            }
        }
        Some(Arc::clone(pick))
    }

    /// Detects replication cycles among replicas and returns the topology.
    fn detect_multi_master(&self, servers: &[Arc<ServerMonitor>], found: &mut Classified) -> Topology {
        let config = self.ctx.config();
        let channel = config.replication_source_name.clone();
        let mut topology = if config.multi_master_wsrep {
            Topology::MultiMasterWsrep
        } else if config.multi_master_grprep {
            Topology::MultiMasterGrprep
        } else if config.multi_master_ring {
            Topology::MultiMasterRing
        } else if config.multi_master {
            Topology::MultiMaster
        } else if config.database_kind == DatabaseKind::Postgres {
            Topology::MasterSlavePgStream
        } else {
            Topology::MasterSlave
        };
        if topology.is_multi_master() {
            if topology == Topology::MultiMasterRing && found.vmaster.is_none() {
                found.vmaster = found.slaves.iter().find(|s| !s.view().read_only).cloned();
                if found.vmaster.is_none() {
                    self.ctx.sme.raise("ERR00048", &[]);
                }
            }
            return topology;
        }
        for s in &found.slaves {
            let Some(len) = cycle_length(servers, s, &channel) else {
                continue;
            };
            if len <= 2 && servers.len() == 2 {
                self.ctx.sme.raise("ERR00011", &[]);
                topology = Topology::MultiMaster;
            } else {
                topology = Topology::MultiMasterRing;
                found.vmaster = found.slaves.iter().find(|n| !n.view().read_only).cloned();
                if found.vmaster.is_none() {
                    self.ctx.sme.raise("ERR00048", &[]);
                }
            }
            break;
        }
        if topology.is_multi_master() {
            found.master = found.slaves.iter().find(|s| !s.view().read_only).cloned();
        }
        topology
    }

    /// Flags replicas that have replicas of their own. Returns whether any
    /// relay exists.
    fn mark_relays(&self, slaves: &[Arc<ServerMonitor>]) -> bool {
        let channel = self.ctx.config().replication_source_name.clone();
        let mut any = false;
        for s in slaves {
            let relay = slaves
                .iter()
                .any(|o| o.url != s.url && o.view().replicates_from(&channel, &s.host, s.port));
            any |= relay;
            s.update(|v| v.is_relay = relay);
        }
        any
    }

    async fn audit_multi_master(&self, slaves: &[Arc<ServerMonitor>], active: bool) {
        let rw = slaves.iter().filter(|s| !s.view().read_only).count();
        let ro = slaves.len() - rw;
        if rw > 1 {
            self.ctx.sme.raise("WARN0003", &[]);
        }
        if ro > 1 {
            self.ctx.sme.raise("WARN0004", &[]);
            match slaves.iter().find(|s| s.is_preferred()) {
                Some(pm) if active => {
                    if let Err(e) = pm.set_read_write().await {
                        warn!(target: TOPOLOGY, server = %pm.url, error = %e, "could not make preferred master writable");
                    }
                }
                Some(_) => {}
                None => self.ctx.sme.raise("WARN0006", &[]),
            }
        }
    }

    /// Finds the leader the replicas point at: an unconnected node with the
    /// replicated `server_id`, else a failed one matching their source.
    async fn infer_master(
        &self,
        servers: &[Arc<ServerMonitor>],
        slaves: &[Arc<ServerMonitor>],
        topology: Topology,
        active: bool,
    ) -> Option<Arc<ServerMonitor>> {
        let channel = self.ctx.config().replication_source_name.clone();
        let inferred = if topology.is_multi_master() {
            servers.iter().find(|s| !s.state().is_down() && !s.view().read_only)
        } else {
            let sid = agreed_source_id(slaves, &channel);
            servers
                .iter()
                .find(|s| sid != 0 && s.state() == ServerState::Unconn && s.server_id() == sid)
        };
        if let Some(m) = inferred {
            info!(target: TOPOLOGY, server = %m.url, "leader inferred from replicas");
            m.set_state(ServerState::Master);
            if active && m.view().read_only {
                if let Err(e) = m.set_read_write().await {
                    warn!(target: TOPOLOGY, server = %m.url, error = %e, "could not make leader writable");
                }
            }
            return Some(Arc::clone(m));
        }
        self.failed_master_discovery(servers, slaves)
    }

    /// A failed node the first replica still points at stays the leader, so
    /// that failover can replace it.
    fn failed_master_discovery(
        &self,
        servers: &[Arc<ServerMonitor>],
        slaves: &[Arc<ServerMonitor>],
    ) -> Option<Arc<ServerMonitor>> {
        let config = self.ctx.config();
        let channel = config.replication_source_name.clone();
        let r = slaves[0].view().replication(&channel).cloned()?;
        let failed = servers.iter().find(|s| {
            s.state().is_failed_or_auth() && s.host == r.master_host && s.port == r.master_port
        })?;
        let followers = slaves
            .iter()
            .filter(|s| !s.state().is_down() && s.view().replicates_from(&channel, &failed.host, failed.port))
            .count();
        if !(config.fail_restart_unsafe || followers > 1) {
            debug!(target: TOPOLOGY, server = %failed.url, followers, "failed leader not adopted");
            return None;
        }
        failed.update(|v| v.prev_state = ServerState::Master);
        Some(Arc::clone(failed))
    }

    /// Settings checks, source audit and the leader health flag.
    async fn audit_replicas(&self, master: &Arc<ServerMonitor>, slaves: &[Arc<ServerMonitor>], active: bool) {
        let config = self.ctx.config();
        let channel = config.replication_source_name.clone();
        if !master.state().is_down() {
            master.set_state(ServerState::Master);
            master.check_master_settings().await;
        }
        let master_id = master.server_id();
        let mut healthy = false;
        let mut all_running = !slaves.is_empty();
        for s in slaves {
            let view = s.view();
            if !view.is_maxscale {
                s.check_replica_settings().await;
            }
            let Some(r) = view.replication(&channel) else {
                all_running = false;
                continue;
            };
            healthy |= is_healthy_channel(r, config.fail_max_delay);
            all_running &= r.io_running == IoThread::Yes && r.sql_running;

            if view.is_relay || master_id == 0 || r.master_server_id == master_id {
                continue;
            }
            let source = format!("{}:{}", r.master_host, r.master_port);
            let via_relay = slaves
                .iter()
                .any(|o| o.host == r.master_host && o.port == r.master_port && o.view().is_relay);
            if via_relay && config.multi_tier_slave {
                continue;
            }
            self.ctx.sme.raise_for("ERR00064", &s.url, &[&s.url, &source, &master.url]);
            if via_relay && config.replication_no_relay && active {
                if view.state.is_late() {
                    self.ctx.sme.raise_for("ERR00046", &s.url, &[&s.url, &source]);
                } else {
                    self.ctx.sme.raise_for("ERR00045", &s.url, &[&s.url, &source]);
                    if let Err(e) = s.set_replication_gtid_slave_pos_from_server(master).await {
                        warn!(target: TOPOLOGY, server = %s.url, error = %e, "could not move replica under the leader");
                    }
                }
            }
        }
        master.update(|v| v.have_healthy_replica = healthy);
        if master.state() == ServerState::Failed && all_running {
            self.ctx.sme.raise("ERR00016", &[]);
        }
    }
}

/// Length of the replication cycle through `start`, if any.
fn cycle_length(servers: &[Arc<ServerMonitor>], start: &Arc<ServerMonitor>, channel: &str) -> Option<usize> {
    let start_id = start.server_id();
    let mut current = start.view().master_server_id(channel);
    for step in 1..=servers.len() {
        if current == 0 {
            return None;
        }
        if current == start_id {
            return (step > 1).then_some(step);
        }
        let next = servers.iter().find(|s| s.server_id() == current)?;
        current = next.view().master_server_id(channel);
    }
    None
}

/// The source `server_id` every replica reporting one agrees on, 0 when
/// none reports one or they disagree.
fn agreed_source_id(slaves: &[Arc<ServerMonitor>], channel: &str) -> u64 {
    let mut ids = slaves
        .iter()
        .map(|s| s.view().master_server_id(channel))
        .filter(|id| *id != 0);
    let Some(first) = ids.next() else {
        return 0;
    };
    if ids.all(|id| id == first) {
        first
    } else {
        debug!(target: TOPOLOGY, "replicas disagree on their source, no leader inferred");
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::FakeFleet;
    use crate::monitor::testutil::context;

    fn cluster(fleet: &FakeFleet, dir: &std::path::Path, hosts: &[&str]) -> Arc<Cluster> {
        let hosts: Vec<String> = hosts.iter().map(ToString::to_string).collect();
        let ctx = context(fleet, dir, |c| c.hosts = hosts);
        Cluster::with_proxies(ctx, Vec::new())
    }

    #[tokio::test(start_paused = true)]
    async fn single_node_is_active_passive() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let dir = tempfile::tempdir().unwrap();
        let c = cluster(&fleet, dir.path(), &[&a]);
        c.tick().await;
        assert_eq!(c.topology(), Topology::ActivePassive);
        assert_eq!(c.master().unwrap().state(), ServerState::Master);
    }

    #[tokio::test(start_paused = true)]
    async fn readonly_leader_is_made_writable() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        fleet.replicate(&b, &a);
        fleet.with_node(&a, |n| n.read_only = true);
        let dir = tempfile::tempdir().unwrap();
        let c = cluster(&fleet, dir.path(), &[&a, &b]);
        c.tick().await;
        assert_eq!(c.master().unwrap().url, a);
        assert!(fleet.received(&a, "SET GLOBAL read_only=0"));
    }

    #[tokio::test(start_paused = true)]
    async fn no_replica_raises_err00010() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        let dir = tempfile::tempdir().unwrap();
        let c = cluster(&fleet, dir.path(), &[&a, &b]);
        c.tick().await;
        assert!(c.context().sme.is_in_current_state("ERR00012") || c.master().is_none());
        c.discover().await;
        assert!(c.context().sme.is_in_current_state("ERR00010"));
    }

    #[tokio::test(start_paused = true)]
    async fn two_node_cycle_switches_to_multi_master() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        fleet.replicate(&b, &a);
        fleet.replicate(&a, &b);
        fleet.with_node(&a, |n| n.read_only = false);
        let dir = tempfile::tempdir().unwrap();
        let c = cluster(&fleet, dir.path(), &[&a, &b]);
        c.tick().await;
        assert_eq!(c.topology(), Topology::MultiMaster);
        assert!(c.context().sme.is_in_state("ERR00011") || c.context().sme.is_in_current_state("ERR00011"));
        assert_eq!(c.master().unwrap().url, a);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_is_flagged() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        let c3 = fleet.add_mariadb("c", 3306, 3);
        fleet.replicate(&b, &a);
        fleet.replicate(&c3, &b);
        let dir = tempfile::tempdir().unwrap();
        let c = cluster(&fleet, dir.path(), &[&a, &b, &c3]);
        c.tick().await;
        c.tick().await;
        assert!(c.server(&b).unwrap().view().is_relay);
        assert_eq!(c.master().unwrap().url, a);
        assert!(!c.server(&c3).unwrap().view().is_relay);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_server_id_is_reported() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 1);
        fleet.replicate(&b, &a);
        let dir = tempfile::tempdir().unwrap();
        let c = cluster(&fleet, dir.path(), &[&a, &b]);
        c.tick().await;
        c.discover().await;
        assert!(c.context().sme.is_in_current_state("ERR00080"));
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_replica_flag_follows_replicas() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        fleet.replicate(&b, &a);
        let dir = tempfile::tempdir().unwrap();
        let c = cluster(&fleet, dir.path(), &[&a, &b]);
        c.tick().await;
        assert!(c.master().unwrap().view().have_healthy_replica);
        fleet.break_sql(&b, 1146, "Table doesn't exist");
        c.tick().await;
        assert!(!c.master().unwrap().view().have_healthy_replica);
    }

    #[tokio::test(start_paused = true)]
    async fn ring_members_are_not_relays_and_stay_electable() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        fleet.replicate(&b, &a);
        fleet.replicate(&a, &b);
        fleet.with_node(&a, |n| n.read_only = false);
        let dir = tempfile::tempdir().unwrap();
        let c = cluster(&fleet, dir.path(), &[&a, &b]);
        c.tick().await;
        assert!(c.topology().is_multi_master());
        assert!(!c.server(&a).unwrap().view().is_relay);
        assert!(!c.server(&b).unwrap().view().is_relay);

        let elected = c.elect_candidate(&c.slaves(), true).map(|s| s.url.clone());
        assert_eq!(elected, Some(b));
        assert!(!c.context().sme.is_in_current_state("ERR00036"));
    }

    #[tokio::test(start_paused = true)]
    async fn leader_inferred_only_when_replicas_agree() {
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        let c3 = fleet.add_mariadb("c", 3306, 3);
        let d = fleet.add_mariadb("d", 3306, 4);
        fleet.replicate(&b, &a);
        fleet.replicate(&c3, &d);
        for r in [&b, &c3] {
            fleet.with_node(r, |n| n.channels[0].started = false);
        }
        let dir = tempfile::tempdir().unwrap();
        let c = cluster(&fleet, dir.path(), &[&a, &b, &c3, &d]);
        c.tick().await;
        assert!(c.master().is_none());
        assert_eq!(c.server(&a).unwrap().state(), ServerState::Unconn);
        assert_eq!(c.server(&d).unwrap().state(), ServerState::Unconn);

        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        let c3 = fleet.add_mariadb("c", 3306, 3);
        fleet.replicate(&b, &a);
        fleet.replicate(&c3, &a);
        for r in [&b, &c3] {
            fleet.with_node(r, |n| n.channels[0].started = false);
        }
        let dir = tempfile::tempdir().unwrap();
        let c = cluster(&fleet, dir.path(), &[&a, &b, &c3]);
        c.tick().await;
        assert_eq!(c.master().unwrap().url, a);
    }
}
