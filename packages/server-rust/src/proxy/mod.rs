//! Proxy synchronizers.
//!
//! Every front-door proxy is driven through [`ProxySync`]. The cluster hands
//! each synchronizer a [`ProxyView`], a plain snapshot of the leader and the
//! other nodes, so flavors never reach into the topology engine.

pub mod consul;
pub mod haproxy;
pub mod maxscale;
pub mod proxysql;
pub mod shard;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use repman_core::{ProxyType, ServerState};
use serde::Serialize;
use tracing::{debug, warn};

use crate::context::ClusterContext;
use crate::db::DbUser;
use crate::error::ProxyError;
use crate::logging::PROXY;
use crate::monitor::ServerMonitor;

/// Drift corrections per backend before further ones are muted.
pub const MAX_DRIFT_EMISSIONS: u32 = 5;

// ---------------------------------------------------------------------------
// Snapshot handed to proxies
// ---------------------------------------------------------------------------

/// One database node as a proxy sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendNode {
    pub url: String,
    pub host: String,
    pub port: u16,
    /// Stable node id, also used as the backend server name.
    pub id: String,
    pub state: ServerState,
    pub maintenance: bool,
}

impl BackendNode {
    #[must_use]
    pub fn from_monitor(m: &ServerMonitor) -> Self {
        let v = m.view();
        Self {
            url: m.url.clone(),
            host: m.host.clone(),
            port: m.port,
            id: m.id.clone(),
            state: v.state,
            maintenance: v.is_maintenance,
        }
    }

    /// Whether reads may be routed to the node.
    #[must_use]
    pub fn is_readable(&self) -> bool {
        !self.maintenance && self.state.is_healthy_replica()
    }

    /// Whether the node is broken or unreachable.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.state.is_broken() || self.state.is_down()
    }
}

/// Leader and other nodes at one instant.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProxyView {
    pub cluster: String,
    pub master: Option<BackendNode>,
    /// Every other node, in server order.
    pub replicas: Vec<BackendNode>,
    /// Accounts found on the leader.
    pub users: Vec<DbUser>,
    /// Schemas found on the leader.
    pub schemas: Vec<String>,
}

impl ProxyView {
    #[must_use]
    pub fn build(cluster: &str, master: Option<&Arc<ServerMonitor>>, servers: &[Arc<ServerMonitor>]) -> Self {
        let master_url = master.map(|m| m.url.clone());
        Self {
            cluster: cluster.to_string(),
            master: master.map(|m| BackendNode::from_monitor(m)),
            replicas: servers
                .iter()
                .filter(|s| Some(&s.url) != master_url.as_ref())
                .map(|s| BackendNode::from_monitor(s))
                .collect(),
            users: master.map(|m| m.view().users).unwrap_or_default(),
            schemas: master.map(|m| m.view().schemas).unwrap_or_default(),
        }
    }

    #[must_use]
    pub fn node(&self, url: &str) -> Option<&BackendNode> {
        self.master
            .iter()
            .chain(self.replicas.iter())
            .find(|n| n.url == url)
    }
}

// ---------------------------------------------------------------------------
// Proxy record
// ---------------------------------------------------------------------------

/// Reachability of the proxy itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ProxyHealth {
    #[default]
    Unknown,
    Up,
    Suspect,
    Failed,
}

/// A backend entry as reported by the proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Backend {
    pub host: String,
    pub port: u16,
    /// State of the node behind the entry, when known.
    pub status: String,
    pub prx_name: String,
    pub prx_status: String,
    pub prx_connections: String,
    pub prx_byte_in: String,
    pub prx_byte_out: String,
    pub prx_latency: String,
    pub prx_hostgroup: String,
}

/// Identity and last refresh of one proxy.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyInfo {
    pub id: String,
    pub name: String,
    pub kind: ProxyType,
    pub host: String,
    pub port: u16,
    pub write_port: u16,
    pub read_port: u16,
    pub read_write_port: u16,
    pub writer_hostgroup: u32,
    pub reader_hostgroup: u32,
    pub state: ProxyHealth,
    pub prev_state: ProxyHealth,
    pub fail_count: u32,
    pub backends_write: Vec<Backend>,
    pub backends_read: Vec<Backend>,
}

impl ProxyInfo {
    #[must_use]
    pub fn new(cluster: &str, kind: ProxyType, host: &str, port: u16, write_port: u16) -> Self {
        let name = format!("{host}:{port}");
        Self {
            id: repman_core::hash::proxy_id(cluster, &name, write_port),
            name,
            kind,
            host: host.to_string(),
            port,
            write_port,
            read_port: 0,
            read_write_port: 0,
            writer_hostgroup: 0,
            reader_hostgroup: 0,
            state: ProxyHealth::Unknown,
            prev_state: ProxyHealth::Unknown,
            fail_count: 0,
            backends_write: Vec::new(),
            backends_read: Vec::new(),
        }
    }
}

/// Counts drift corrections per backend and mutes noisy ones.
#[derive(Debug, Default)]
pub struct DriftLimiter {
    emitted: DashMap<String, u32>,
}

impl DriftLimiter {
    /// Counts one correction for `server`. False once the budget is spent.
    pub fn allow(&self, server: &str) -> bool {
        let mut n = self.emitted.entry(server.to_string()).or_insert(0);
        if *n >= MAX_DRIFT_EMISSIONS {
            return false;
        }
        *n += 1;
        true
    }

    /// Forgets `server` after a refresh without drift.
    pub fn settle(&self, server: &str) {
        self.emitted.remove(server);
    }

    #[must_use]
    pub fn count(&self, server: &str) -> u32 {
        self.emitted.get(server).map_or(0, |n| *n)
    }
}

/// State shared by every flavor.
#[derive(Debug)]
pub struct ProxyBase {
    pub ctx: Arc<ClusterContext>,
    info: RwLock<ProxyInfo>,
    pub drift: DriftLimiter,
}

impl ProxyBase {
    #[must_use]
    pub fn new(ctx: Arc<ClusterContext>, info: ProxyInfo) -> Self {
        Self {
            ctx,
            info: RwLock::new(info),
            drift: DriftLimiter::default(),
        }
    }

    #[must_use]
    pub fn info(&self) -> ProxyInfo {
        self.info.read().clone()
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.info.read().name.clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut ProxyInfo)) {
        f(&mut self.info.write());
    }

    pub fn mark_up(&self) {
        self.update(|i| {
            i.prev_state = i.state;
            i.state = ProxyHealth::Up;
            i.fail_count = 0;
        });
    }

    /// Suspect on the first failure, failed on the next.
    pub fn mark_failure(&self, e: &ProxyError) {
        let name = self.name();
        self.update(|i| {
            i.prev_state = i.state;
            i.fail_count = i.fail_count.saturating_add(1);
            i.state = if matches!(i.state, ProxyHealth::Suspect | ProxyHealth::Failed) {
                ProxyHealth::Failed
            } else {
                ProxyHealth::Suspect
            };
        });
        debug!(target: PROXY, proxy = %name, error = %e, "proxy refresh failed");
    }

    /// Counts a command sent to the proxy.
    pub fn count_command(&self) {
        let kind = self.info.read().kind.to_string();
        metrics::counter!("repman_proxy_commands_total", "proxy" => kind).increment(1);
    }

    /// Spends drift budget for `backend`; raises the mute warning once it
    /// runs out.
    pub fn drift_allowed(&self, backend: &str) -> bool {
        if self.drift.allow(backend) {
            return true;
        }
        let name = self.name();
        self.ctx.sme.raise("WARN0112", &[&name, &backend]);
        false
    }
}

// ---------------------------------------------------------------------------
// Interface
// ---------------------------------------------------------------------------

/// Uniform interface of every proxy flavor.
#[async_trait]
pub trait ProxySync: Send + Sync {
    fn info(&self) -> ProxyInfo;

    /// First configuration after discovery.
    async fn init(&self, view: &ProxyView) -> Result<(), ProxyError>;

    /// Reads the proxy's backends and repairs drift from `view`.
    async fn refresh(&self, view: &ProxyView) -> Result<(), ProxyError>;

    /// Moves write traffic to `view.master` after a failover or switchover.
    async fn failover(&self, view: &ProxyView) -> Result<(), ProxyError>;

    /// Re-applies every backend state from `view`.
    async fn backends_state_change(&self, view: &ProxyView) -> Result<(), ProxyError>;

    /// Applies `node`'s maintenance flag.
    async fn set_maintenance(&self, view: &ProxyView, node: &BackendNode) -> Result<(), ProxyError>;

    async fn certificates_reload(&self) -> Result<(), ProxyError> {
        Ok(())
    }

    /// New password of the account the proxy monitors backends with.
    async fn rotate_monitoring_passwords(&self, _password: &str) -> Result<(), ProxyError> {
        Ok(())
    }

    /// New password of the proxy's own admin account.
    async fn rotate_proxy_passwords(&self, _password: &str) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ProxyError> {
        Ok(())
    }
}

/// Proxy whose routing is managed outside; every call succeeds untouched.
#[derive(Debug)]
pub struct ExternalProxy {
    base: ProxyBase,
}

impl ExternalProxy {
    #[must_use]
    pub fn new(ctx: Arc<ClusterContext>, config: &crate::config::ExternalProxyConfig) -> Self {
        let mut info = ProxyInfo::new(&ctx.name(), ProxyType::External, &config.host, config.write_port, config.write_port);
        info.read_port = config.read_port;
        Self {
            base: ProxyBase::new(ctx, info),
        }
    }
}

#[async_trait]
impl ProxySync for ExternalProxy {
    fn info(&self) -> ProxyInfo {
        self.base.info()
    }

    async fn init(&self, _view: &ProxyView) -> Result<(), ProxyError> {
        self.base.mark_up();
        Ok(())
    }

    async fn refresh(&self, _view: &ProxyView) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn failover(&self, _view: &ProxyView) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn backends_state_change(&self, _view: &ProxyView) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn set_maintenance(&self, _view: &ProxyView, _node: &BackendNode) -> Result<(), ProxyError> {
        Ok(())
    }
}

/// Builds one synchronizer per configured proxy.
#[must_use]
pub fn build_proxies(ctx: &Arc<ClusterContext>) -> Vec<Arc<dyn ProxySync>> {
    let config = ctx.config();
    let mut out: Vec<Arc<dyn ProxySync>> = Vec::new();
    for c in &config.proxies.haproxy {
        let transport = Arc::new(haproxy::SocketTransport::new(c));
        out.push(Arc::new(haproxy::HaproxySync::new(Arc::clone(ctx), c.clone(), transport)));
    }
    for c in &config.proxies.proxysql {
        out.push(Arc::new(proxysql::ProxySqlSync::new(Arc::clone(ctx), c.clone())));
    }
    for c in &config.proxies.maxscale {
        out.push(Arc::new(maxscale::MaxScaleSync::new(Arc::clone(ctx), c.clone())));
    }
    for c in &config.proxies.shardproxy {
        out.push(Arc::new(shard::ShardProxySync::new(Arc::clone(ctx), c.clone())));
    }
    for c in &config.proxies.consul {
        out.push(Arc::new(consul::ConsulSync::new(Arc::clone(ctx), c.clone())));
    }
    for c in &config.proxies.external {
        out.push(Arc::new(ExternalProxy::new(Arc::clone(ctx), c)));
    }
    out
}

/// Runs `f` on every proxy concurrently, logging failures.
pub async fn for_each_proxy<'a, F, Fut>(proxies: &'a [Arc<dyn ProxySync>], what: &str, f: F)
where
    F: Fn(&'a Arc<dyn ProxySync>) -> Fut,
    Fut: std::future::Future<Output = Result<(), ProxyError>> + 'a,
{
    let results = futures_util::future::join_all(proxies.iter().map(|p| {
        let fut = f(p);
        async move { (p.info().name, fut.await) }
    }))
    .await;
    for (name, res) in results {
        if let Err(e) = res {
            warn!(target: PROXY, proxy = %name, error = %e, "proxy {what} failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::FakeFleet;
    use crate::monitor::testutil::context;

    #[test]
    fn drift_limiter_mutes_after_budget() {
        let d = DriftLimiter::default();
        for _ in 0..MAX_DRIFT_EMISSIONS {
            assert!(d.allow("s1"));
        }
        assert!(!d.allow("s1"));
        assert!(d.allow("s2"));
        d.settle("s1");
        assert_eq!(d.count("s1"), 0);
        assert!(d.allow("s1"));
    }

    #[tokio::test]
    async fn view_splits_master_from_others() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let b = fleet.add_mariadb("b", 3306, 2);
        fleet.replicate(&b, &a);
        let ctx = context(&fleet, dir.path(), |_| {});
        let ma = ServerMonitor::new(Arc::clone(&ctx), &a);
        let mb = ServerMonitor::new(ctx, &b);
        ma.ping(None).await;
        mb.ping(Some(1)).await;
        let servers = vec![Arc::clone(&ma), Arc::clone(&mb)];
        let view = ProxyView::build("c1", Some(&ma), &servers);
        assert_eq!(view.master.as_ref().unwrap().url, "a:3306");
        assert_eq!(view.replicas.len(), 1);
        assert!(view.replicas[0].is_readable());
        assert_eq!(view.users[0].user, "root");
        assert!(view.node("b:3306").is_some());
    }

    #[tokio::test]
    async fn external_proxy_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let ctx = context(&fleet, dir.path(), |_| {});
        let p = ExternalProxy::new(
            ctx,
            &crate::config::ExternalProxyConfig {
                host: "lb".into(),
                write_port: 3306,
                read_port: 3307,
            },
        );
        let view = ProxyView::default();
        p.init(&view).await.unwrap();
        p.failover(&view).await.unwrap();
        let info = p.info();
        assert_eq!(info.kind, ProxyType::External);
        assert!(info.id.starts_with("px"));
        assert_eq!(info.state, ProxyHealth::Up);
        let shown = format!("{p:?}");
        assert!(shown.contains("ExternalProxy") && shown.contains("ClusterContext"));
    }

    #[test]
    fn broken_and_readable_nodes() {
        let mut n = BackendNode {
            url: "b:3306".into(),
            host: "b".into(),
            port: 3306,
            id: "s1".into(),
            state: ServerState::SlaveErr,
            maintenance: false,
        };
        assert!(n.is_broken());
        assert!(!n.is_readable());
        n.state = ServerState::Slave;
        assert!(n.is_readable());
        n.maintenance = true;
        assert!(!n.is_readable());
    }
}
