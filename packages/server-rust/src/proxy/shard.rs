//! MariaDB Spider shard gateway.
//!
//! The gateway reaches the cluster through one `RW<crc>` and one `RO<crc>`
//! federated server per schema, where `<crc>` is the CRC64 of
//! `schema_cluster`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use repman_core::ProxyType;
use repman_core::hash::crc64;
use tracing::{debug, info, warn};

use super::{Backend, BackendNode, ProxyBase, ProxyInfo, ProxySync, ProxyView};
use crate::config::ShardProxyConfig;
use crate::context::ClusterContext;
use crate::db::dsn::{join_url, target_for};
use crate::db::sql::quote;
use crate::db::{DbSession, TlsChoice};
use crate::error::ProxyError;
use crate::logging::PROXY;

/// Federated server name for `schema` in `cluster`, `RW` or `RO` prefixed.
#[must_use]
pub fn server_name(prefix: &str, schema: &str, cluster: &str) -> String {
    format!("{prefix}{}", crc64(format!("{schema}_{cluster}").as_bytes()))
}

/// `CREATE ... SERVER` statement pointing `name` at `node`.
#[must_use]
pub fn server_statement(replace: bool, name: &str, node: &BackendNode, schema: &str, user: &str, password: &str) -> String {
    let verb = if replace { "CREATE OR REPLACE SERVER" } else { "CREATE SERVER IF NOT EXISTS" };
    format!(
        "{verb} {name} FOREIGN DATA WRAPPER mysql OPTIONS (HOST {}, DATABASE {}, USER {}, PASSWORD {}, PORT {})",
        quote(&node.host),
        quote(schema),
        quote(user),
        quote(password),
        node.port
    )
}

pub struct ShardProxySync {
    base: ProxyBase,
    config: ShardProxyConfig,
    session: RwLock<Option<Arc<dyn DbSession>>>,
}

impl std::fmt::Debug for ShardProxySync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardProxySync")
            .field("name", &self.base.name())
            .finish_non_exhaustive()
    }
}

impl ShardProxySync {
    #[must_use]
    pub fn new(ctx: Arc<ClusterContext>, config: ShardProxyConfig) -> Self {
        let mut info = ProxyInfo::new(&ctx.name(), ProxyType::ShardProxy, &config.host, config.port, config.port);
        info.read_port = config.port;
        info.read_write_port = config.port;
        Self {
            base: ProxyBase::new(ctx, info),
            config,
            session: RwLock::new(None),
        }
    }

    async fn gateway(&self) -> Result<Arc<dyn DbSession>, ProxyError> {
        if let Some(s) = self.session.read().clone() {
            return Ok(s);
        }
        let target = target_for(&self.base.ctx.config(), &self.config.host, self.config.port, TlsChoice::Disabled);
        let session = self
            .base
            .ctx
            .connector
            .connect(&target)
            .await
            .map_err(|e| ProxyError::Unreachable {
                name: self.base.name(),
                message: e.to_string(),
            })?;
        *self.session.write() = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Runs `sql`, logging failures instead of returning them.
    async fn exec_logged(&self, gw: &Arc<dyn DbSession>, sql: &str) {
        self.base.count_command();
        debug!(target: PROXY, proxy = %self.base.name(), "{sql}");
        if let Err(e) = gw.exec(sql, false).await {
            warn!(target: PROXY, proxy = %self.base.name(), error = %e, "shard proxy statement failed");
        }
    }

    /// Declares the federated servers. `replace` repoints existing ones.
    async fn declare_servers(&self, view: &ProxyView, replace: bool) -> Result<(), ProxyError> {
        let Some(master) = &view.master else {
            return Ok(());
        };
        let gw = self.gateway().await?;
        let config = self.base.ctx.config();
        let reader = view.replicas.iter().find(|n| n.is_readable()).unwrap_or(master);
        for schema in &view.schemas {
            let rw = server_name("RW", schema, &view.cluster);
            let ro = server_name("RO", schema, &view.cluster);
            self.exec_logged(&gw, &server_statement(replace, &rw, master, schema, &config.db_user, &config.db_password))
                .await;
            self.exec_logged(&gw, &server_statement(replace, &ro, reader, schema, &config.db_user, &config.db_password))
                .await;
            if replace {
                self.exec_logged(&gw, &format!("CREATE DATABASE IF NOT EXISTS `{}`", schema.replace('`', "``")))
                    .await;
            }
        }
        if replace {
            self.exec_logged(&gw, "FLUSH TABLES").await;
        }
        Ok(())
    }

    async fn read_servers(&self) -> Result<Vec<Backend>, ProxyError> {
        let gw = self.gateway().await?;
        self.base.count_command();
        let rows = gw.query("SELECT Server_name, Host, Port FROM mysql.servers").await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let host = r.get("Host").cloned().unwrap_or_default();
                let port = r.get("Port").and_then(|p| p.parse().ok()).unwrap_or(0);
                Backend {
                    prx_name: join_url(&host, port),
                    host,
                    port,
                    prx_status: "ONLINE".into(),
                    prx_hostgroup: r.get("Server_name").cloned().unwrap_or_default(),
                    ..Backend::default()
                }
            })
            .collect())
    }
}

#[async_trait]
impl ProxySync for ShardProxySync {
    fn info(&self) -> ProxyInfo {
        self.base.info()
    }

    async fn init(&self, view: &ProxyView) -> Result<(), ProxyError> {
        self.declare_servers(view, false).await?;
        self.base.mark_up();
        info!(target: PROXY, proxy = %self.base.name(), "shard proxy initialized");
        Ok(())
    }

    async fn refresh(&self, view: &ProxyView) -> Result<(), ProxyError> {
        let backends = match self.read_servers().await {
            Ok(b) => b,
            Err(e) => {
                *self.session.write() = None;
                self.base.mark_failure(&e);
                return Err(e);
            }
        };
        self.base.mark_up();
        self.base.update(|i| {
            i.backends_write = backends.iter().filter(|b| b.prx_hostgroup.starts_with("RW")).cloned().collect();
            i.backends_read = backends.iter().filter(|b| b.prx_hostgroup.starts_with("RO")).cloned().collect();
        });
        self.declare_servers(view, false).await
    }

    async fn failover(&self, view: &ProxyView) -> Result<(), ProxyError> {
        self.declare_servers(view, true).await
    }

    async fn backends_state_change(&self, _view: &ProxyView) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn set_maintenance(&self, _view: &ProxyView, _node: &BackendNode) -> Result<(), ProxyError> {
        Ok(())
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

    fn node(host: &str, state: ServerState) -> BackendNode {
        BackendNode {
            url: format!("{host}:3306"),
            host: host.into(),
            port: 3306,
            id: host.into(),
            state,
            maintenance: false,
        }
    }

    fn view(master: &str) -> ProxyView {
        ProxyView {
            cluster: "c1".into(),
            master: Some(node(master, ServerState::Master)),
            replicas: vec![node("db2", ServerState::Slave)],
            schemas: vec!["shop".into()],
            ..ProxyView::default()
        }
    }

    #[test]
    fn names_are_stable_per_schema_and_cluster() {
        let a = server_name("RW", "shop", "c1");
        assert_eq!(a, format!("RW{}", crc64(b"shop_c1")));
        assert_ne!(a, server_name("RW", "shop", "c2"));
        assert!(server_name("RO", "shop", "c1").starts_with("RO"));
    }

    #[tokio::test]
    async fn failover_repoints_servers_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let gw = fleet.add_mariadb("spider", 3306, 50);
        let ctx = context(&fleet, dir.path(), |_| {});
        let sync = ShardProxySync::new(
            ctx,
            ShardProxyConfig {
                host: "spider".into(),
                port: 3306,
            },
        );
        sync.failover(&view("db3")).await.unwrap();
        let rw = server_name("RW", "shop", "c1");
        assert!(fleet.received(&gw, &format!("CREATE OR REPLACE SERVER {rw} FOREIGN DATA WRAPPER mysql OPTIONS (HOST 'db3'")));
        assert!(fleet.received(&gw, "HOST 'db2', DATABASE 'shop'"));
        assert!(fleet.received(&gw, "CREATE DATABASE IF NOT EXISTS `shop`"));
        assert!(fleet.received(&gw, "FLUSH TABLES"));
    }

    #[tokio::test]
    async fn refresh_reads_declared_servers() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let gw = fleet.add_mariadb("spider", 3306, 50);
        fleet.with_node(&gw, |n| {
            n.canned.push((
                "SELECT Server_name".into(),
                vec![HashMap::from([
                    ("Server_name".to_string(), "RW1".to_string()),
                    ("Host".to_string(), "db1".to_string()),
                    ("Port".to_string(), "3306".to_string()),
                ])],
            ));
        });
        let ctx = context(&fleet, dir.path(), |_| {});
        let sync = ShardProxySync::new(
            ctx,
            ShardProxyConfig {
                host: "spider".into(),
                port: 3306,
            },
        );
        sync.refresh(&view("db1")).await.unwrap();
        let info = sync.info();
        assert_eq!(info.backends_write.len(), 1);
        assert_eq!(info.backends_write[0].prx_name, "db1:3306");
        assert!(info.backends_read.is_empty());
        assert!(fleet.received(&gw, "CREATE SERVER IF NOT EXISTS"));
        assert!(!fleet.received(&gw, "FLUSH TABLES"));
    }
}
