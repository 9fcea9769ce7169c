//! Consul service registry.
//!
//! The leader is published as `write_<cluster>`; every readable replica as
//! an instance of `read_<cluster>` keyed by its node id.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use repman_core::ProxyType;
use serde::Serialize;
use tracing::{debug, info};

use super::{Backend, BackendNode, ProxyBase, ProxyInfo, ProxySync, ProxyView};
use crate::config::ConsulConfig;
use crate::context::ClusterContext;
use crate::db::dsn::join_url;
use crate::error::ProxyError;
use crate::logging::PROXY;

/// Agent registration payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConsulService {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
}

fn service(id: String, name: String, node: &BackendNode, tag: &str) -> ConsulService {
    ConsulService {
        id,
        name,
        address: node.host.clone(),
        port: node.port,
        tags: vec![tag.to_string(), node.state.to_string()],
    }
}

/// Services `view` should publish, keyed by service id.
#[must_use]
pub fn desired_services(view: &ProxyView) -> BTreeMap<String, ConsulService> {
    let mut out = BTreeMap::new();
    if let Some(m) = &view.master {
        let id = format!("write_{}", view.cluster);
        out.insert(id.clone(), service(id.clone(), id, m, "master"));
    }
    for n in view.replicas.iter().filter(|n| n.is_readable()) {
        out.insert(n.id.clone(), service(n.id.clone(), format!("read_{}", view.cluster), n, "replica"));
    }
    out
}

/// Registrations to send and service ids to withdraw.
#[must_use]
pub fn diff(
    current: &BTreeMap<String, ConsulService>,
    desired: &BTreeMap<String, ConsulService>,
) -> (Vec<ConsulService>, Vec<String>) {
    let register = desired
        .iter()
        .filter(|(id, s)| current.get(*id) != Some(*s))
        .map(|(_, s)| s.clone())
        .collect();
    let deregister = current.keys().filter(|id| !desired.contains_key(*id)).cloned().collect();
    (register, deregister)
}

#[derive(Debug)]
pub struct ConsulSync {
    base: ProxyBase,
    config: ConsulConfig,
    client: reqwest::Client,
    registered: Mutex<BTreeMap<String, ConsulService>>,
}

impl ConsulSync {
    #[must_use]
    pub fn new(ctx: Arc<ClusterContext>, config: ConsulConfig) -> Self {
        let (host, port) = agent_endpoint(&config.address);
        let info = ProxyInfo::new(&ctx.name(), ProxyType::Consul, &host, port, port);
        let client = reqwest::Client::builder()
            .timeout(ctx.config().read_timeout())
            .build()
            .unwrap_or_default();
        Self {
            base: ProxyBase::new(ctx, info),
            config,
            client,
            registered: Mutex::new(BTreeMap::new()),
        }
    }

    fn put(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .put(format!("{}{path}", self.config.address.trim_end_matches('/')));
        if let Some(token) = &self.config.token {
            req = req.header("X-Consul-Token", token);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<(), ProxyError> {
        self.base.count_command();
        debug!(target: PROXY, proxy = %self.base.name(), "consul {what}");
        let resp = req.send().await.map_err(|e| ProxyError::Unreachable {
            name: self.base.name(),
            message: e.to_string(),
        })?;
        if !resp.status().is_success() {
            let message = resp.status().to_string();
            self.base.ctx.sme.raise("WARN0111", &[&self.base.name(), &message]);
            return Err(ProxyError::Command {
                name: self.base.name(),
                command: what.to_string(),
                message,
            });
        }
        Ok(())
    }

    async fn publish(&self, view: &ProxyView) -> Result<(), ProxyError> {
        let desired = desired_services(view);
        let current = self.registered.lock().clone();
        let (register, deregister) = diff(&current, &desired);
        for id in deregister {
            self.send(self.put(&format!("/v1/agent/service/deregister/{id}")), &format!("deregister {id}"))
                .await?;
            self.registered.lock().remove(&id);
        }
        for s in register {
            info!(target: PROXY, service = %s.name, id = %s.id, address = %join_url(&s.address, s.port), "registering consul service");
            self.send(self.put("/v1/agent/service/register").json(&s), &format!("register {}", s.id))
                .await?;
            self.registered.lock().insert(s.id.clone(), s);
        }
        let to_backend = |s: &ConsulService| Backend {
            host: s.address.clone(),
            port: s.port,
            prx_name: s.id.clone(),
            prx_status: "registered".into(),
            prx_hostgroup: s.name.clone(),
            ..Backend::default()
        };
        let registered = self.registered.lock().clone();
        self.base.update(|i| {
            i.backends_write = registered.values().filter(|s| s.name.starts_with("write_")).map(to_backend).collect();
            i.backends_read = registered.values().filter(|s| s.name.starts_with("read_")).map(to_backend).collect();
        });
        Ok(())
    }
}

/// Host and port of an agent base URL such as `http://127.0.0.1:8500`.
fn agent_endpoint(address: &str) -> (String, u16) {
    let rest = address.split_once("://").map_or(address, |(_, r)| r);
    let rest = rest.split('/').next().unwrap_or(rest);
    match rest.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().unwrap_or(8500)),
        None => (rest.to_string(), 8500),
    }
}

#[async_trait]
impl ProxySync for ConsulSync {
    fn info(&self) -> ProxyInfo {
        self.base.info()
    }

    async fn init(&self, view: &ProxyView) -> Result<(), ProxyError> {
        self.refresh(view).await
    }

    async fn refresh(&self, view: &ProxyView) -> Result<(), ProxyError> {
        match self.publish(view).await {
            Ok(()) => {
                self.base.mark_up();
                Ok(())
            }
            Err(e) => {
                self.base.mark_failure(&e);
                Err(e)
            }
        }
    }

    async fn failover(&self, view: &ProxyView) -> Result<(), ProxyError> {
        self.publish(view).await
    }

    async fn backends_state_change(&self, view: &ProxyView) -> Result<(), ProxyError> {
        self.publish(view).await
    }

    async fn set_maintenance(&self, view: &ProxyView, _node: &BackendNode) -> Result<(), ProxyError> {
        self.publish(view).await
    }

    async fn shutdown(&self) -> Result<(), ProxyError> {
        let ids: Vec<String> = self.registered.lock().keys().cloned().collect();
        for id in ids {
            self.send(self.put(&format!("/v1/agent/service/deregister/{id}")), &format!("deregister {id}"))
                .await?;
            self.registered.lock().remove(&id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use repman_core::ServerState;

    use super::*;
    use crate::db::fake::FakeFleet;
    use crate::monitor::testutil::context;

    fn node(id: &str, host: &str, state: ServerState) -> BackendNode {
        BackendNode {
            url: format!("{host}:3306"),
            host: host.into(),
            port: 3306,
            id: id.into(),
            state,
            maintenance: false,
        }
    }

    fn view(master: &str) -> ProxyView {
        let hosts = [("s1", "db1"), ("s2", "db2"), ("s3", "db3")];
        ProxyView {
            cluster: "c1".into(),
            master: hosts
                .iter()
                .find(|(_, h)| *h == master)
                .map(|(id, h)| node(id, h, ServerState::Master)),
            replicas: hosts
                .iter()
                .filter(|(_, h)| *h != master)
                .map(|(id, h)| node(id, h, ServerState::Slave))
                .collect(),
            ..ProxyView::default()
        }
    }

    #[test]
    fn leader_and_readable_replicas_are_published() {
        let mut v = view("db1");
        v.replicas[1].state = ServerState::SlaveErr;
        let d = desired_services(&v);
        assert_eq!(d.len(), 2);
        assert_eq!(d["write_c1"].address, "db1");
        assert_eq!(d["s2"].name, "read_c1");
        assert!(!d.contains_key("s3"));
    }

    #[test]
    fn diff_after_failover() {
        let before = desired_services(&view("db1"));
        let after = desired_services(&view("db2"));
        let (register, deregister) = diff(&before, &after);
        let ids: Vec<&str> = register.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "write_c1"]);
        assert_eq!(deregister, vec!["s2".to_string()]);
        let (r, d) = diff(&after, &after);
        assert!(r.is_empty() && d.is_empty());
    }

    #[test]
    fn registration_payload_uses_agent_field_names() {
        let d = desired_services(&view("db1"));
        let json = serde_json::to_value(&d["write_c1"]).unwrap();
        assert_eq!(json["ID"], "write_c1");
        assert_eq!(json["Name"], "write_c1");
        assert_eq!(json["Port"], 3306);
        assert_eq!(json["Tags"][0], "master");
    }

    #[test]
    fn agent_address_parsing() {
        assert_eq!(agent_endpoint("http://10.0.0.9:8600/"), ("10.0.0.9".to_string(), 8600));
        assert_eq!(agent_endpoint("consul"), ("consul".to_string(), 8500));
    }

    #[tokio::test]
    async fn unreachable_agent_marks_suspect() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let ctx = context(&fleet, dir.path(), |_| {});
        let sync = ConsulSync::new(
            ctx,
            ConsulConfig {
                address: "http://127.0.0.1:1".into(),
                token: Some("t".into()),
            },
        );
        assert!(sync.refresh(&view("db1")).await.is_err());
        assert_eq!(sync.info().state, super::super::ProxyHealth::Suspect);
    }
}
