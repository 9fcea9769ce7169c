//! MaxScale synchronizer over the REST API.

use std::sync::Arc;

use async_trait::async_trait;
use repman_core::ProxyType;
use serde::Deserialize;
use tracing::{debug, info};

use super::{Backend, BackendNode, ProxyBase, ProxyInfo, ProxySync, ProxyView};
use crate::config::MaxScaleConfig;
use crate::context::ClusterContext;
use crate::db::dsn::join_url;
use crate::error::ProxyError;
use crate::logging::PROXY;

/// One server object as MaxScale reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaxScaleServer {
    pub id: String,
    pub address: String,
    pub port: u16,
    /// Comma separated flags such as `Master, Running`.
    pub state: String,
    pub connections: u64,
}

impl MaxScaleServer {
    #[must_use]
    pub fn has_flag(&self, flag: &str) -> bool {
        self.state.split(',').any(|f| f.trim().eq_ignore_ascii_case(flag))
    }
}

#[derive(Deserialize)]
struct ServersDoc {
    #[serde(default)]
    data: Vec<ServerDoc>,
}

#[derive(Deserialize)]
struct ServerDoc {
    id: String,
    #[serde(default)]
    attributes: AttributesDoc,
}

#[derive(Deserialize, Default)]
struct AttributesDoc {
    #[serde(default)]
    state: String,
    #[serde(default)]
    parameters: ParametersDoc,
    #[serde(default)]
    statistics: StatisticsDoc,
}

#[derive(Deserialize, Default)]
struct ParametersDoc {
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: u16,
}

#[derive(Deserialize, Default)]
struct StatisticsDoc {
    #[serde(default)]
    connections: u64,
}

/// Parses the body of `GET /v1/servers`.
///
/// # Errors
///
/// [`ProxyError::Parse`] when the document is not a server collection.
pub fn parse_servers(body: &str) -> Result<Vec<MaxScaleServer>, ProxyError> {
    let doc: ServersDoc = serde_json::from_str(body).map_err(|e| ProxyError::Parse(e.to_string()))?;
    Ok(doc
        .data
        .into_iter()
        .map(|s| MaxScaleServer {
            id: s.id,
            address: s.attributes.parameters.address,
            port: s.attributes.parameters.port,
            state: s.attributes.state,
            connections: s.attributes.statistics.connections,
        })
        .collect())
}

/// Path that sets (`on`) or clears a state flag of a server.
#[must_use]
pub fn state_path(server_id: &str, flag: &str, on: bool) -> String {
    let verb = if on { "set" } else { "clear" };
    format!("/v1/servers/{server_id}/{verb}?state={flag}")
}

/// State commands that bring `servers` in line with `view`.
#[must_use]
pub fn plan_commands(view: &ProxyView, servers: &[MaxScaleServer]) -> Vec<String> {
    let find = |n: &BackendNode| servers.iter().find(|s| s.address == n.host && s.port == n.port);
    let mut out = Vec::new();
    let master = view.master.as_ref().and_then(|m| find(m).map(|s| (m, s)));
    for s in servers.iter().filter(|s| s.has_flag("Master")) {
        if !matches!(master, Some((_, ms)) if ms.id == s.id) {
            out.push(state_path(&s.id, "master", false));
        }
    }
    if let Some((_, s)) = master {
        if !s.has_flag("Master") {
            out.push(state_path(&s.id, "master", true));
        }
    }
    for node in view.master.iter().chain(view.replicas.iter()) {
        let Some(s) = find(node) else { continue };
        let in_maint = s.has_flag("Maintenance");
        if node.maintenance != in_maint {
            out.push(state_path(&s.id, "maintenance", node.maintenance));
        }
    }
    out
}

#[derive(Debug)]
pub struct MaxScaleSync {
    base: ProxyBase,
    config: MaxScaleConfig,
    client: reqwest::Client,
}

impl MaxScaleSync {
    #[must_use]
    pub fn new(ctx: Arc<ClusterContext>, config: MaxScaleConfig) -> Self {
        let mut info = ProxyInfo::new(&ctx.name(), ProxyType::MaxScale, &config.host, config.api_port, config.write_port);
        info.read_port = config.read_port;
        let client = reqwest::Client::builder()
            .timeout(ctx.config().read_timeout())
            .build()
            .unwrap_or_default();
        Self {
            base: ProxyBase::new(ctx, info),
            config,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", join_url(&self.config.host, self.config.api_port))
    }

    fn unreachable(&self, e: &reqwest::Error) -> ProxyError {
        ProxyError::Unreachable {
            name: self.base.name(),
            message: e.to_string(),
        }
    }

    async fn servers(&self) -> Result<Vec<MaxScaleServer>, ProxyError> {
        self.base.count_command();
        let body = self
            .client
            .get(self.url("/v1/servers"))
            .basic_auth(&self.config.user, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| self.unreachable(&e))?
            .error_for_status()?
            .text()
            .await?;
        parse_servers(&body)
    }

    async fn put(&self, path: &str) -> Result<(), ProxyError> {
        self.base.count_command();
        debug!(target: PROXY, proxy = %self.base.name(), "PUT {path}");
        let resp = self
            .client
            .put(self.url(path))
            .basic_auth(&self.config.user, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| self.unreachable(&e))?;
        if !resp.status().is_success() {
            let message = resp.status().to_string();
            self.base.ctx.sme.raise("WARN0111", &[&self.base.name(), &message]);
            return Err(ProxyError::Command {
                name: self.base.name(),
                command: path.to_string(),
                message,
            });
        }
        Ok(())
    }

    fn record_backends(&self, view: &ProxyView, servers: &[MaxScaleServer]) {
        let to_backend = |s: &MaxScaleServer| Backend {
            host: s.address.clone(),
            port: s.port,
            status: view
                .master
                .iter()
                .chain(view.replicas.iter())
                .find(|n| n.host == s.address && n.port == s.port)
                .map(|n| n.state.to_string())
                .unwrap_or_default(),
            prx_name: s.id.clone(),
            prx_status: s.state.clone(),
            prx_connections: s.connections.to_string(),
            ..Backend::default()
        };
        self.base.update(|i| {
            i.backends_write = servers.iter().filter(|s| s.has_flag("Master")).map(to_backend).collect();
            i.backends_read = servers.iter().filter(|s| s.has_flag("Slave")).map(to_backend).collect();
        });
    }

    async fn reconcile(&self, view: &ProxyView, servers: &[MaxScaleServer]) -> Result<(), ProxyError> {
        for path in plan_commands(view, servers) {
            let Some(id) = path.split('/').nth(3) else { continue };
            if !self.base.drift_allowed(id) {
                continue;
            }
            self.base.ctx.sme.raise("WARN0105", &[&self.base.name(), &path]);
            self.put(&path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProxySync for MaxScaleSync {
    fn info(&self) -> ProxyInfo {
        self.base.info()
    }

    async fn init(&self, view: &ProxyView) -> Result<(), ProxyError> {
        self.refresh(view).await?;
        info!(target: PROXY, proxy = %self.base.name(), monitor = %self.config.monitor, "MaxScale initialized");
        Ok(())
    }

    async fn refresh(&self, view: &ProxyView) -> Result<(), ProxyError> {
        let servers = match self.servers().await {
            Ok(s) => s,
            Err(e) => {
                self.base.mark_failure(&e);
                return Err(e);
            }
        };
        self.base.mark_up();
        self.record_backends(view, &servers);
        let planned = plan_commands(view, &servers);
        for s in &servers {
            if !planned.iter().any(|p| p.split('/').nth(3) == Some(s.id.as_str())) {
                self.base.drift.settle(&s.id);
            }
        }
        self.reconcile(view, &servers).await
    }

    async fn failover(&self, view: &ProxyView) -> Result<(), ProxyError> {
        let servers = self.servers().await?;
        for path in plan_commands(view, &servers) {
            self.put(&path).await?;
        }
        Ok(())
    }

    async fn backends_state_change(&self, view: &ProxyView) -> Result<(), ProxyError> {
        self.failover(view).await
    }

    async fn set_maintenance(&self, view: &ProxyView, node: &BackendNode) -> Result<(), ProxyError> {
        let servers = self.servers().await?;
        let Some(s) = servers.iter().find(|s| s.address == node.host && s.port == node.port) else {
            return Ok(());
        };
        let code = if node.maintenance { "WARN0108" } else { "WARN0109" };
        self.base.ctx.sme.raise(code, &[&self.base.name(), &node.url]);
        self.put(&state_path(&s.id, "maintenance", node.maintenance)).await?;
        self.record_backends(view, &servers);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use repman_core::ServerState;

    use super::*;
    use crate::db::fake::FakeFleet;
    use crate::monitor::testutil::context;

    const SERVERS: &str = r#"{
        "data": [
            {"id": "server1", "attributes": {"state": "Master, Running",
                "parameters": {"address": "db1", "port": 3306},
                "statistics": {"connections": 12}}},
            {"id": "server2", "attributes": {"state": "Slave, Running",
                "parameters": {"address": "db2", "port": 3306},
                "statistics": {"connections": 3}}},
            {"id": "server3", "attributes": {"state": "Maintenance, Running",
                "parameters": {"address": "db3", "port": 3306}}}
        ]
    }"#;

    fn node(host: &str, state: ServerState, maintenance: bool) -> BackendNode {
        BackendNode {
            url: format!("{host}:3306"),
            host: host.into(),
            port: 3306,
            id: host.into(),
            state,
            maintenance,
        }
    }

    #[test]
    fn servers_document() {
        let servers = parse_servers(SERVERS).unwrap();
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0].id, "server1");
        assert!(servers[0].has_flag("master"));
        assert_eq!(servers[1].connections, 3);
        assert_eq!(servers[2].connections, 0);
        assert!(parse_servers("[1,2]").is_err());
    }

    #[test]
    fn in_line_view_needs_no_commands() {
        let servers = parse_servers(SERVERS).unwrap();
        let view = ProxyView {
            master: Some(node("db1", ServerState::Master, false)),
            replicas: vec![node("db2", ServerState::Slave, false), node("db3", ServerState::Slave, true)],
            ..ProxyView::default()
        };
        assert!(plan_commands(&view, &servers).is_empty());
    }

    #[test]
    fn new_leader_moves_the_master_flag() {
        let servers = parse_servers(SERVERS).unwrap();
        let view = ProxyView {
            master: Some(node("db2", ServerState::Master, false)),
            replicas: vec![node("db1", ServerState::Failed, false), node("db3", ServerState::Slave, false)],
            ..ProxyView::default()
        };
        assert_eq!(
            plan_commands(&view, &servers),
            vec![
                "/v1/servers/server1/clear?state=master".to_string(),
                "/v1/servers/server2/set?state=master".to_string(),
                "/v1/servers/server3/clear?state=maintenance".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn unreachable_api_marks_suspect() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let ctx = context(&fleet, dir.path(), |_| {});
        let sync = MaxScaleSync::new(
            ctx,
            MaxScaleConfig {
                host: "127.0.0.1".into(),
                api_port: 1,
                ..MaxScaleConfig::default()
            },
        );
        assert!(sync.refresh(&ProxyView::default()).await.is_err());
        assert_eq!(sync.info().state, super::super::ProxyHealth::Suspect);
        assert_eq!(sync.info().kind, ProxyType::MaxScale);
    }
}
