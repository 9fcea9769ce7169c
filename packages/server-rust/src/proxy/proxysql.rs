//! ProxySQL synchronizer.
//!
//! Talks to the admin interface with plain SQL. The leader lives alone in
//! the writer hostgroup; readable replicas are `ONLINE` in the reader
//! hostgroup, broken ones `OFFLINE_SOFT`, nodes in maintenance
//! `OFFLINE_HARD`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use repman_core::ProxyType;
use tracing::{debug, info};

use super::{Backend, BackendNode, ProxyBase, ProxyInfo, ProxySync, ProxyView};
use crate::config::ProxySqlConfig;
use crate::context::ClusterContext;
use crate::db::dsn::join_url;
use crate::db::sql::quote;
use crate::db::{DbSession, DbTarget, DbUser, TlsChoice};
use crate::error::ProxyError;
use crate::logging::PROXYSQL;

const ONLINE: &str = "ONLINE";
const OFFLINE_SOFT: &str = "OFFLINE_SOFT";
const OFFLINE_HARD: &str = "OFFLINE_HARD";

/// Status a reader entry should carry for `node`.
#[must_use]
pub fn reader_status(node: &BackendNode) -> &'static str {
    if node.maintenance {
        OFFLINE_HARD
    } else if node.is_readable() {
        ONLINE
    } else {
        OFFLINE_SOFT
    }
}

/// Accounts to load into `mysql_users`. A janitor also federates each
/// account under `user@domain`. Duplicates are dropped.
#[must_use]
pub fn federated_users(users: &[DbUser], janitor_domain: Option<&str>) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for u in users.iter().filter(|u| !u.user.is_empty()) {
        let mut names = vec![u.user.clone()];
        if let Some(domain) = janitor_domain {
            names.push(format!("{}@{domain}", u.user));
        }
        for name in names {
            if seen.insert(format!("{name}:{}", u.password)) {
                out.push((name, u.password.clone()));
            }
        }
    }
    out
}

/// One row of `runtime_mysql_servers`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RuntimeServer {
    hostgroup: u32,
    host: String,
    port: u16,
    status: String,
}

pub struct ProxySqlSync {
    base: ProxyBase,
    config: ProxySqlConfig,
    session: RwLock<Option<Arc<dyn DbSession>>>,
}

impl std::fmt::Debug for ProxySqlSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySqlSync")
            .field("name", &self.base.name())
            .finish_non_exhaustive()
    }
}

impl ProxySqlSync {
    #[must_use]
    pub fn new(ctx: Arc<ClusterContext>, config: ProxySqlConfig) -> Self {
        let kind = if config.janitor_domain.is_some() {
            ProxyType::ProxyJanitor
        } else {
            ProxyType::ProxySql
        };
        let mut info = ProxyInfo::new(&ctx.name(), kind, &config.host, config.admin_port, config.port);
        info.read_port = config.port;
        info.read_write_port = config.port;
        info.writer_hostgroup = config.writer_hostgroup;
        info.reader_hostgroup = config.reader_hostgroup;
        Self {
            base: ProxyBase::new(ctx, info),
            config,
            session: RwLock::new(None),
        }
    }

    fn target(&self) -> DbTarget {
        let cfg = self.base.ctx.config();
        DbTarget {
            url: join_url(&self.config.host, self.config.admin_port),
            host: self.config.host.clone(),
            port: self.config.admin_port,
            user: self.config.user.clone(),
            password: self.config.password.clone(),
            tls: TlsChoice::Disabled,
            connect_timeout: cfg.connect_timeout(),
            read_timeout: cfg.read_timeout(),
            max_lifetime: Duration::from_secs(cfg.timeouts.conn_max_lifetime_secs),
        }
    }

    async fn admin(&self) -> Result<Arc<dyn DbSession>, ProxyError> {
        if let Some(s) = self.session.read().clone() {
            return Ok(s);
        }
        let session = self
            .base
            .ctx
            .connector
            .connect(&self.target())
            .await
            .map_err(|e| ProxyError::Unreachable {
                name: self.base.name(),
                message: e.to_string(),
            })?;
        *self.session.write() = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn exec(&self, sql: &str) -> Result<(), ProxyError> {
        let admin = self.admin().await?;
        self.base.count_command();
        debug!(target: PROXYSQL, proxy = %self.base.name(), "{sql}");
        admin.exec(sql, false).await.map_err(|e| ProxyError::Command {
            name: self.base.name(),
            command: sql.to_string(),
            message: e.to_string(),
        })
    }

    async fn load_servers(&self) -> Result<(), ProxyError> {
        self.exec("LOAD MYSQL SERVERS TO RUNTIME").await?;
        self.exec("SAVE MYSQL SERVERS TO DISK").await
    }

    async fn set_writer(&self, master: &BackendNode) -> Result<(), ProxyError> {
        let hg = self.config.writer_hostgroup;
        self.exec(&format!(
            "DELETE FROM mysql_servers WHERE hostgroup_id={hg} AND NOT (hostname={} AND port={})",
            quote(&master.host),
            master.port
        ))
        .await?;
        let res = self
            .exec(&format!(
                "REPLACE INTO mysql_servers (hostgroup_id, hostname, port, status) VALUES ({hg}, {}, {}, '{ONLINE}')",
                quote(&master.host),
                master.port
            ))
            .await;
        if let Err(e) = &res {
            self.base.ctx.sme.raise("ERR00070", &[&master.url, e]);
        }
        res
    }

    /// Applies the reader entry of one node. Failures are reported, not
    /// propagated.
    async fn set_reader(&self, node: &BackendNode) {
        let hg = self.config.reader_hostgroup;
        let status = reader_status(node);
        let sql = if status == ONLINE {
            format!(
                "REPLACE INTO mysql_servers (hostgroup_id, hostname, port, status) VALUES ({hg}, {}, {}, '{ONLINE}')",
                quote(&node.host),
                node.port
            )
        } else {
            format!(
                "UPDATE mysql_servers SET status='{status}' WHERE hostname={} AND port={}",
                quote(&node.host),
                node.port
            )
        };
        if let Err(e) = self.exec(&sql).await {
            let code = if status == ONLINE { "ERR00069" } else { "ERR00072" };
            self.base.ctx.sme.raise(code, &[&node.url, &e]);
        }
    }

    async fn apply(&self, view: &ProxyView) -> Result<(), ProxyError> {
        if let Some(master) = &view.master {
            self.set_writer(master).await?;
        }
        for node in &view.replicas {
            self.set_reader(node).await;
        }
        self.load_servers().await
    }

    async fn runtime_servers(&self) -> Result<Vec<RuntimeServer>, ProxyError> {
        let admin = self.admin().await?;
        self.base.count_command();
        let rows = admin
            .query("SELECT hostgroup_id, hostname, port, status FROM runtime_mysql_servers")
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| RuntimeServer {
                hostgroup: r.get("hostgroup_id").and_then(|v| v.parse().ok()).unwrap_or(0),
                host: r.get("hostname").cloned().unwrap_or_default(),
                port: r.get("port").and_then(|v| v.parse().ok()).unwrap_or(0),
                status: r.get("status").cloned().unwrap_or_default(),
            })
            .collect())
    }

    /// Entries that disagree with `view`, as backend urls.
    fn drifted(&self, view: &ProxyView, runtime: &[RuntimeServer]) -> Vec<String> {
        let mut out = Vec::new();
        let writers: Vec<&RuntimeServer> = runtime
            .iter()
            .filter(|s| s.hostgroup == self.config.writer_hostgroup)
            .collect();
        if let Some(master) = &view.master {
            let placed = writers.len() == 1
                && writers[0].host == master.host
                && writers[0].port == master.port
                && writers[0].status == ONLINE;
            if !placed {
                out.push(master.url.clone());
            }
        }
        for node in &view.replicas {
            let entry = runtime.iter().find(|s| {
                s.hostgroup == self.config.reader_hostgroup && s.host == node.host && s.port == node.port
            });
            let want = reader_status(node);
            let ok = match entry {
                Some(e) => e.status == want,
                None => want != ONLINE,
            };
            if !ok {
                out.push(node.url.clone());
            }
        }
        out
    }

    async fn bootstrap_users(&self, users: &[DbUser]) -> Result<(), ProxyError> {
        let accounts = federated_users(users, self.config.janitor_domain.as_deref());
        if accounts.is_empty() {
            return Ok(());
        }
        for (name, password) in &accounts {
            self.exec(&format!(
                "REPLACE INTO mysql_users (username, password, default_hostgroup) VALUES ({}, {}, {})",
                quote(name),
                quote(password),
                self.config.writer_hostgroup
            ))
            .await?;
        }
        self.exec("LOAD MYSQL USERS TO RUNTIME").await?;
        self.exec("SAVE MYSQL USERS TO DISK").await
    }

    fn record_backends(&self, view: &ProxyView, runtime: &[RuntimeServer]) {
        let status_of = |host: &str, port: u16| {
            view.master
                .iter()
                .chain(view.replicas.iter())
                .find(|n| n.host == host && n.port == port)
                .map(|n| n.state.to_string())
                .unwrap_or_default()
        };
        let to_backend = |s: &RuntimeServer| Backend {
            host: s.host.clone(),
            port: s.port,
            status: status_of(&s.host, s.port),
            prx_name: join_url(&s.host, s.port),
            prx_status: s.status.clone(),
            prx_hostgroup: s.hostgroup.to_string(),
            ..Backend::default()
        };
        let (w, r) = (self.config.writer_hostgroup, self.config.reader_hostgroup);
        self.base.update(|i| {
            i.backends_write = runtime.iter().filter(|s| s.hostgroup == w).map(to_backend).collect();
            i.backends_read = runtime.iter().filter(|s| s.hostgroup == r).map(to_backend).collect();
        });
    }

    async fn refresh_inner(&self, view: &ProxyView) -> Result<(), ProxyError> {
        let runtime = self.runtime_servers().await?;
        self.record_backends(view, &runtime);
        let drifted = self.drifted(view, &runtime);
        let mut dirty = false;
        for url in &drifted {
            if self.base.drift_allowed(url) {
                self.base.ctx.sme.raise("WARN0105", &[&self.base.name(), &format!("{url} out of place")]);
                dirty = true;
            }
        }
        for node in view.master.iter().chain(view.replicas.iter()) {
            if !drifted.contains(&node.url) {
                self.base.drift.settle(&node.url);
            }
        }
        if dirty {
            self.apply(view).await?;
        }
        if self.config.bootstrap_users {
            self.bootstrap_users(&view.users).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProxySync for ProxySqlSync {
    fn info(&self) -> ProxyInfo {
        self.base.info()
    }

    async fn init(&self, view: &ProxyView) -> Result<(), ProxyError> {
        self.apply(view).await?;
        if self.config.bootstrap_users {
            self.bootstrap_users(&view.users).await?;
        }
        self.base.mark_up();
        info!(target: PROXYSQL, proxy = %self.base.name(), "ProxySQL initialized");
        Ok(())
    }

    async fn refresh(&self, view: &ProxyView) -> Result<(), ProxyError> {
        match self.refresh_inner(view).await {
            Ok(()) => {
                self.base.mark_up();
                Ok(())
            }
            Err(e) => {
                if matches!(e, ProxyError::Unreachable { .. } | ProxyError::Db(_)) {
                    *self.session.write() = None;
                }
                self.base.mark_failure(&e);
                Err(e)
            }
        }
    }

    async fn failover(&self, view: &ProxyView) -> Result<(), ProxyError> {
        if let Some(m) = &view.master {
            info!(target: PROXYSQL, proxy = %self.base.name(), master = %m.url, "moving writer hostgroup");
        }
        self.apply(view).await
    }

    async fn backends_state_change(&self, view: &ProxyView) -> Result<(), ProxyError> {
        self.apply(view).await
    }

    async fn set_maintenance(&self, _view: &ProxyView, node: &BackendNode) -> Result<(), ProxyError> {
        let status = if node.maintenance { OFFLINE_HARD } else { reader_status(node) };
        self.exec(&format!(
            "UPDATE mysql_servers SET status='{status}' WHERE hostname={} AND port={}",
            quote(&node.host),
            node.port
        ))
        .await?;
        self.load_servers().await
    }

    async fn certificates_reload(&self) -> Result<(), ProxyError> {
        self.exec("PROXYSQL RELOAD TLS").await
    }

    async fn rotate_monitoring_passwords(&self, password: &str) -> Result<(), ProxyError> {
        let res = async {
            self.exec(&format!(
                "UPDATE global_variables SET variable_value={} WHERE variable_name='mysql-monitor_password'",
                quote(password)
            ))
            .await?;
            self.exec("LOAD MYSQL VARIABLES TO RUNTIME").await?;
            self.exec("SAVE MYSQL VARIABLES TO DISK").await
        }
        .await;
        if let Err(e) = &res {
            self.base.ctx.sme.raise("ERR00086", &[&self.base.name(), e]);
        }
        res
    }

    async fn rotate_proxy_passwords(&self, password: &str) -> Result<(), ProxyError> {
        let res = async {
            self.exec(&format!(
                "UPDATE global_variables SET variable_value={} WHERE variable_name='admin-admin_credentials'",
                quote(&format!("{}:{password}", self.config.user))
            ))
            .await?;
            self.exec("LOAD ADMIN VARIABLES TO RUNTIME").await?;
            self.exec("SAVE ADMIN VARIABLES TO DISK").await
        }
        .await;
        if let Err(e) = &res {
            self.base.ctx.sme.raise("ERR00086", &[&self.base.name(), e]);
        }
        res
    }

    async fn shutdown(&self) -> Result<(), ProxyError> {
        let session = self.session.write().take();
        if let Some(s) = session {
            s.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use repman_core::ServerState;

    use super::*;
    use crate::db::fake::FakeFleet;
    use crate::monitor::testutil::context;

    fn node(host: &str, id: &str, state: ServerState) -> BackendNode {
        BackendNode {
            url: format!("{host}:3306"),
            host: host.into(),
            port: 3306,
            id: id.into(),
            state,
            maintenance: false,
        }
    }

    fn view() -> ProxyView {
        ProxyView {
            cluster: "c1".into(),
            master: Some(node("db1", "s1", ServerState::Master)),
            replicas: vec![
                node("db2", "s2", ServerState::Slave),
                node("db3", "s3", ServerState::SlaveErr),
            ],
            users: vec![DbUser {
                user: "app".into(),
                host: "%".into(),
                password: "*HASH".into(),
            }],
            schemas: Vec::new(),
        }
    }

    fn row(hg: &str, host: &str, status: &str) -> HashMap<String, String> {
        HashMap::from([
            ("hostgroup_id".to_string(), hg.to_string()),
            ("hostname".to_string(), host.to_string()),
            ("port".to_string(), "3306".to_string()),
            ("status".to_string(), status.to_string()),
        ])
    }

    fn setup(janitor: Option<&str>) -> (FakeFleet, tempfile::TempDir, ProxySqlSync, String) {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let px = fleet.add_mariadb("px", 6032, 99);
        let ctx = context(&fleet, dir.path(), |_| {});
        let sync = ProxySqlSync::new(
            ctx,
            ProxySqlConfig {
                host: "px".into(),
                janitor_domain: janitor.map(str::to_string),
                ..ProxySqlConfig::default()
            },
        );
        (fleet, dir, sync, px)
    }

    #[tokio::test]
    async fn init_places_writer_and_readers() {
        let (fleet, _dir, sync, px) = setup(None);
        sync.init(&view()).await.unwrap();
        assert!(fleet.received(&px, "DELETE FROM mysql_servers WHERE hostgroup_id=0 AND NOT (hostname='db1' AND port=3306)"));
        assert!(fleet.received(&px, "VALUES (0, 'db1', 3306, 'ONLINE')"));
        assert!(fleet.received(&px, "VALUES (1, 'db2', 3306, 'ONLINE')"));
        assert!(fleet.received(&px, "SET status='OFFLINE_SOFT' WHERE hostname='db3'"));
        assert!(fleet.received(&px, "LOAD MYSQL SERVERS TO RUNTIME"));
        assert!(fleet.received(&px, "VALUES ('app', '*HASH', 0)"));
        assert!(fleet.received(&px, "LOAD MYSQL USERS TO RUNTIME"));
        assert_eq!(sync.info().kind, ProxyType::ProxySql);
        assert_eq!(sync.info().state, super::super::ProxyHealth::Up);
    }

    #[tokio::test]
    async fn refresh_repairs_a_misplaced_writer() {
        let (fleet, _dir, sync, px) = setup(None);
        fleet.with_node(&px, |n| {
            n.canned.push((
                "SELECT hostgroup_id".into(),
                vec![
                    row("0", "db2", "ONLINE"),
                    row("1", "db2", "ONLINE"),
                    row("1", "db3", "OFFLINE_SOFT"),
                ],
            ));
        });
        sync.refresh(&view()).await.unwrap();
        assert!(sync.base.ctx.sme.is_in_state("WARN0105"));
        assert!(fleet.received(&px, "VALUES (0, 'db1', 3306, 'ONLINE')"));
        let info = sync.info();
        assert_eq!(info.backends_write.len(), 1);
        assert_eq!(info.backends_write[0].host, "db2");
        assert_eq!(info.backends_read.len(), 2);
    }

    #[tokio::test]
    async fn refresh_without_drift_leaves_servers_alone() {
        let (fleet, _dir, sync, px) = setup(None);
        fleet.with_node(&px, |n| {
            n.canned.push((
                "SELECT hostgroup_id".into(),
                vec![
                    row("0", "db1", "ONLINE"),
                    row("1", "db2", "ONLINE"),
                    row("1", "db3", "OFFLINE_SOFT"),
                ],
            ));
        });
        sync.refresh(&view()).await.unwrap();
        assert!(!sync.base.ctx.sme.is_in_state("WARN0105"));
        assert!(!fleet.received(&px, "LOAD MYSQL SERVERS TO RUNTIME"));
    }

    #[tokio::test]
    async fn failed_reader_updates_are_reported() {
        let (fleet, _dir, sync, px) = setup(None);
        fleet.fail_op(&px, "exec");
        let mut v = view();
        v.master = None;
        assert!(sync.backends_state_change(&v).await.is_err());
        assert!(sync.base.ctx.sme.is_in_state("ERR00069"));
        assert!(sync.base.ctx.sme.is_in_state("ERR00072"));
    }

    #[tokio::test]
    async fn unreachable_admin_marks_suspect() {
        let (fleet, _dir, sync, px) = setup(None);
        fleet.crash(&px);
        assert!(sync.refresh(&view()).await.is_err());
        assert_eq!(sync.info().state, super::super::ProxyHealth::Suspect);
    }

    #[tokio::test]
    async fn credential_rotation() {
        let (fleet, _dir, sync, px) = setup(None);
        sync.rotate_monitoring_passwords("n3w").await.unwrap();
        assert!(fleet.received(&px, "variable_value='n3w' WHERE variable_name='mysql-monitor_password'"));
        sync.rotate_proxy_passwords("adm2").await.unwrap();
        assert!(fleet.received(&px, "variable_value='admin:adm2'"));
        assert!(fleet.received(&px, "LOAD ADMIN VARIABLES TO RUNTIME"));
        fleet.fail_op(&px, "exec");
        assert!(sync.rotate_proxy_passwords("adm3").await.is_err());
        assert!(sync.base.ctx.sme.is_in_state("ERR00086"));
    }

    #[test]
    fn janitor_federates_users_once() {
        let users = vec![
            DbUser { user: "app".into(), host: "%".into(), password: "*A".into() },
            DbUser { user: "app".into(), host: "10.%".into(), password: "*A".into() },
            DbUser { user: String::new(), host: "%".into(), password: String::new() },
        ];
        let out = federated_users(&users, Some("eu"));
        assert_eq!(
            out,
            vec![("app".to_string(), "*A".to_string()), ("app@eu".to_string(), "*A".to_string())]
        );
        assert_eq!(federated_users(&users, None).len(), 1);
    }

    #[test]
    fn reader_status_by_node_state() {
        let mut n = node("db2", "s2", ServerState::Slave);
        assert_eq!(reader_status(&n), ONLINE);
        n.state = ServerState::SlaveLate;
        assert_eq!(reader_status(&n), OFFLINE_SOFT);
        n.maintenance = true;
        assert_eq!(reader_status(&n), OFFLINE_HARD);
    }
}
