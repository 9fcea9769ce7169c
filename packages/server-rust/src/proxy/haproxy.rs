//! HAProxy synchronizer.
//!
//! Standby mode renders a configuration file and reloads the process.
//! Runtime-API mode reads `show stat` and `show servers state` from the
//! admin socket and issues `set server` commands for every drift between the
//! proxy and the cluster.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use repman_core::ProxyType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{Backend, BackendNode, ProxyBase, ProxyInfo, ProxySync, ProxyView};
use crate::config::{HaproxyConfig, HaproxyMode};
use crate::context::ClusterContext;
use crate::error::ProxyError;
use crate::logging::HAPROXY;
use crate::traits::ToolCommand;

/// Server slot of the leader inside the write backend.
pub const LEADER_SLOT: &str = "leader";

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Line-oriented admin connection to HAProxy.
#[async_trait]
pub trait HaproxyTransport: Send + Sync {
    /// Sends one command and returns the full answer.
    async fn command(&self, cmd: &str) -> Result<String, ProxyError>;
}

/// Runtime API over the stats socket, or its TCP listener.
#[derive(Debug, Clone)]
pub struct SocketTransport {
    socket: Option<PathBuf>,
    host: String,
    port: u16,
}

impl SocketTransport {
    #[must_use]
    pub fn new(config: &HaproxyConfig) -> Self {
        Self {
            socket: config.socket.clone(),
            host: config.host.clone(),
            port: config.api_port,
        }
    }

    #[cfg(unix)]
    async fn unix_command(&self, path: &std::path::Path, cmd: &str) -> Result<String, ProxyError> {
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(|e| self.unreachable(&e))?;
        exchange(stream, cmd).await.map_err(|e| self.unreachable(&e))
    }

    #[cfg(not(unix))]
    async fn unix_command(&self, path: &std::path::Path, _cmd: &str) -> Result<String, ProxyError> {
        Err(ProxyError::Unreachable {
            name: path.display().to_string(),
            message: "unix sockets are not supported on this platform".into(),
        })
    }

    fn unreachable(&self, e: &std::io::Error) -> ProxyError {
        ProxyError::Unreachable {
            name: format!("{}:{}", self.host, self.port),
            message: e.to_string(),
        }
    }
}

async fn exchange<S>(mut stream: S, cmd: &str) -> std::io::Result<String>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(cmd.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;
    let mut out = String::new();
    stream.read_to_string(&mut out).await?;
    Ok(out)
}

#[async_trait]
impl HaproxyTransport for SocketTransport {
    async fn command(&self, cmd: &str) -> Result<String, ProxyError> {
        if let Some(path) = &self.socket {
            return self.unix_command(path, cmd).await;
        }
        let stream = tokio::net::TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| self.unreachable(&e))?;
        exchange(stream, cmd).await.map_err(|e| self.unreachable(&e))
    }
}

/// Scripted transport answering `show` commands and recording the rest.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Default)]
pub struct FakeHaproxyTransport {
    stat: parking_lot::Mutex<String>,
    servers_state: parking_lot::Mutex<String>,
    commands: parking_lot::Mutex<Vec<String>>,
    down: std::sync::atomic::AtomicBool,
}

#[cfg(any(test, feature = "testing"))]
impl FakeHaproxyTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_stat(&self, csv: &str) {
        *self.stat.lock() = csv.to_string();
    }

    pub fn set_servers_state(&self, text: &str) {
        *self.servers_state.lock() = text.to_string();
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, std::sync::atomic::Ordering::SeqCst);
    }

    /// Commands other than `show`, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl HaproxyTransport for FakeHaproxyTransport {
    async fn command(&self, cmd: &str) -> Result<String, ProxyError> {
        if self.down.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ProxyError::Unreachable {
                name: "haproxy".into(),
                message: "connection refused".into(),
            });
        }
        match cmd {
            "show stat" => Ok(self.stat.lock().clone()),
            "show servers state" => Ok(self.servers_state.lock().clone()),
            other => {
                self.commands.lock().push(other.to_string());
                Ok(String::new())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// One row of `show stat`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatRow {
    pub pxname: String,
    pub svname: String,
    pub status: String,
    pub scur: String,
    pub bin: String,
    pub bout: String,
    pub rtime: String,
}

/// Parses the CSV answer of `show stat`, locating columns by header name.
///
/// # Errors
///
/// [`ProxyError::Parse`] when the header lacks the name or status columns.
pub fn parse_show_stat(csv: &str) -> Result<Vec<StatRow>, ProxyError> {
    let mut lines = csv.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| ProxyError::Parse("empty show stat".into()))?;
    let cols: HashMap<&str, usize> = header
        .trim_start_matches('#')
        .trim()
        .split(',')
        .enumerate()
        .map(|(i, c)| (c.trim(), i))
        .collect();
    let idx = |name: &str| cols.get(name).copied();
    let (Some(px), Some(sv), Some(st)) = (idx("pxname"), idx("svname"), idx("status")) else {
        return Err(ProxyError::Parse(format!("unexpected show stat header: {header}")));
    };
    let field = |f: &[&str], i: Option<usize>| i.and_then(|i| f.get(i)).map_or(String::new(), |s| (*s).to_string());
    Ok(lines
        .map(|l| {
            let f: Vec<&str> = l.split(',').collect();
            StatRow {
                pxname: field(&f, Some(px)),
                svname: field(&f, Some(sv)),
                status: field(&f, Some(st)),
                scur: field(&f, idx("scur")),
                bin: field(&f, idx("bin")),
                bout: field(&f, idx("bout")),
                rtime: field(&f, idx("rtime")),
            }
        })
        .filter(|r| r.svname != "FRONTEND" && r.svname != "BACKEND")
        .collect())
}

/// One row of `show servers state`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStateRow {
    pub backend: String,
    pub server: String,
    pub addr: String,
    pub port: u16,
}

/// Parses `show servers state`: a version line, a `#` header, then
/// space-separated rows.
#[must_use]
pub fn parse_servers_state(text: &str) -> Vec<ServerStateRow> {
    let mut cols: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(h) = line.strip_prefix('#') {
            cols = h
                .split_whitespace()
                .enumerate()
                .map(|(i, c)| (c.to_string(), i))
                .collect();
            continue;
        }
        if cols.is_empty() {
            continue;
        }
        let f: Vec<&str> = line.split_whitespace().collect();
        let get = |name: &str| cols.get(name).and_then(|i| f.get(*i)).copied().unwrap_or_default();
        out.push(ServerStateRow {
            backend: get("be_name").to_string(),
            server: get("srv_name").to_string(),
            addr: get("srv_addr").to_string(),
            port: get("srv_port").parse().unwrap_or(0),
        });
    }
    out
}

/// Whether `addr` designates `host`, resolving names when they differ.
async fn addr_matches(addr: &str, host: &str, port: u16) -> bool {
    if addr == host {
        return true;
    }
    match tokio::net::lookup_host((host, port)).await {
        Ok(mut addrs) => addrs.any(|a| a.ip().to_string() == addr),
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Standby rendering
// ---------------------------------------------------------------------------

/// Renders the full configuration for standby mode.
#[must_use]
pub fn render_config(config: &HaproxyConfig, view: &ProxyView) -> String {
    let mut out = String::new();
    out.push_str("global\n    daemon\n    maxconn 4096\n");
    if let Some(socket) = &config.socket {
        out.push_str(&format!("    stats socket {} level admin\n", socket.display()));
    }
    out.push_str("\ndefaults\n    mode tcp\n    timeout connect 5s\n    timeout client 1m\n    timeout server 1m\n");
    out.push_str(&format!(
        "\nlisten stats\n    bind {}:{}\n    mode http\n    stats enable\n    stats uri /\n",
        config.host, config.api_port
    ));

    let w = &config.write_backend;
    out.push_str(&format!(
        "\nfrontend {w}_frontend\n    bind *:{}\n    default_backend {w}\n",
        config.write_port
    ));
    out.push_str(&format!("\nbackend {w}\n"));
    if let Some(m) = &view.master {
        out.push_str(&format!("    server {LEADER_SLOT} {}:{} check\n", m.host, m.port));
    }

    let r = &config.read_backend;
    out.push_str(&format!(
        "\nfrontend {r}_frontend\n    bind *:{}\n    default_backend {r}\n",
        config.read_port
    ));
    out.push_str(&format!("\nbackend {r}\n    balance leastconn\n"));
    for n in view.replicas.iter().filter(|n| n.is_readable()) {
        out.push_str(&format!("    server {} {}:{} check\n", n.id, n.host, n.port));
    }
    if let Some(m) = &view.master {
        out.push_str(&format!("    server {} {}:{} check backup\n", m.id, m.host, m.port));
    }
    out
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

pub struct HaproxySync {
    base: ProxyBase,
    config: HaproxyConfig,
    transport: Arc<dyn HaproxyTransport>,
}

impl std::fmt::Debug for HaproxySync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaproxySync")
            .field("name", &self.base.name())
            .field("mode", &self.config.mode)
            .finish_non_exhaustive()
    }
}

/// What to send for one backend entry.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Correction {
    Drain,
    Ready,
    Maint,
    LeaveMaint,
}

impl HaproxySync {
    #[must_use]
    pub fn new(ctx: Arc<ClusterContext>, config: HaproxyConfig, transport: Arc<dyn HaproxyTransport>) -> Self {
        let mut info = ProxyInfo::new(&ctx.name(), ProxyType::Haproxy, &config.host, config.api_port, config.write_port);
        info.read_port = config.read_port;
        Self {
            base: ProxyBase::new(ctx, info),
            config,
            transport,
        }
    }

    async fn send(&self, cmd: &str) -> Result<(), ProxyError> {
        self.base.count_command();
        match self.transport.command(cmd).await {
            Ok(answer) if answer.trim().is_empty() => {
                info!(target: HAPROXY, proxy = %self.base.name(), command = cmd, "runtime command sent");
                Ok(())
            }
            Ok(answer) => {
                let name = self.base.name();
                self.base.ctx.sme.raise("WARN0111", &[&name, &answer.trim()]);
                Err(ProxyError::Command {
                    name,
                    command: cmd.to_string(),
                    message: answer.trim().to_string(),
                })
            }
            Err(e) => {
                let name = self.base.name();
                self.base.ctx.sme.raise("WARN0111", &[&name, &e]);
                Err(e)
            }
        }
    }

    /// Writes the rendered file when it changed, then reloads.
    async fn render_and_reload(&self, view: &ProxyView) -> Result<(), ProxyError> {
        let text = render_config(&self.config, view);
        let path = &self.config.config_path;
        if tokio::fs::read_to_string(path).await.ok().as_deref() == Some(text.as_str()) {
            return Ok(());
        }
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("cfg.tmp");
        tokio::fs::write(&tmp, &text).await?;
        tokio::fs::rename(&tmp, path).await?;
        info!(target: HAPROXY, proxy = %self.base.name(), path = %path.display(), "configuration rendered");
        if let Some(reload) = &self.config.reload_command {
            let cmd = ToolCommand::new("sh").arg("-c").arg(reload.clone());
            self.base
                .ctx
                .collab
                .scripts
                .run(&cmd)
                .await
                .map_err(|e| ProxyError::Command {
                    name: self.base.name(),
                    command: reload.clone(),
                    message: e.to_string(),
                })?;
            self.base.count_command();
        }
        Ok(())
    }

    fn correction(node: &BackendNode, status: &str) -> Option<Correction> {
        let status = status.to_ascii_uppercase();
        let up = status.starts_with("UP");
        let maint = status.starts_with("MAINT");
        let drain = status.starts_with("DRAIN");
        if node.maintenance {
            return (!maint).then_some(Correction::Maint);
        }
        if maint {
            return Some(Correction::LeaveMaint);
        }
        if node.is_broken() && up {
            return Some(Correction::Drain);
        }
        if node.is_readable() && drain {
            return Some(Correction::Ready);
        }
        None
    }

    /// Repairs the read backend and the write backend against `view`.
    async fn reconcile(&self, view: &ProxyView) -> Result<(), ProxyError> {
        let stats = parse_show_stat(&self.transport.command("show stat").await?)?;
        let servers = parse_servers_state(&self.transport.command("show servers state").await?);
        let name = self.base.name();
        let rb = &self.config.read_backend;
        let wb = &self.config.write_backend;

        let mut read = Vec::new();
        for node in &view.replicas {
            let Some(row) = stats.iter().find(|r| &r.pxname == rb && r.svname == node.id) else {
                continue;
            };
            read.push(backend_of(node, row));
            let Some(fix) = Self::correction(node, &row.status) else {
                self.base.drift.settle(&node.id);
                continue;
            };
            let backend = format!("{rb}/{}", node.id);
            if !self.base.drift_allowed(&node.id) {
                debug!(target: HAPROXY, proxy = %name, backend = %backend, "drift correction muted");
                continue;
            }
            let (state, code, detail) = match fix {
                Correction::Drain => ("drain", "WARN0105", format!("{backend} is UP while {} is {}", node.url, node.state)),
                Correction::Ready => ("ready", "WARN0107", backend.clone()),
                Correction::Maint => ("maint", "WARN0108", backend.clone()),
                Correction::LeaveMaint => ("ready", "WARN0109", backend.clone()),
            };
            if code == "WARN0105" {
                self.base.ctx.sme.raise(code, &[&name, &detail]);
            } else {
                self.base.ctx.sme.raise(code, &[&name, &backend]);
            }
            // A failed command was reported; the next refresh retries it.
            let _ = self.send(&format!("set server {backend} state {state}")).await;
        }

        let mut write = Vec::new();
        if let Some(m) = &view.master {
            let slot = servers
                .iter()
                .find(|s| &s.backend == wb && s.server == LEADER_SLOT);
            let placed = match slot {
                Some(s) => s.port == m.port && addr_matches(&s.addr, &m.host, m.port).await,
                None => false,
            };
            if let Some(row) = stats.iter().find(|r| &r.pxname == wb && r.svname == LEADER_SLOT) {
                write.push(backend_of(m, row));
            }
            if !placed {
                self.base.ctx.sme.raise("WARN0110", &[&name, &m.url]);
                self.send(&format!("set server {wb}/{LEADER_SLOT} addr {} port {}", m.host, m.port))
                    .await?;
                self.send(&format!("set server {wb}/{LEADER_SLOT} state ready")).await?;
            }
        }

        self.base.update(|i| {
            i.backends_read = read;
            i.backends_write = write;
        });
        Ok(())
    }

    async fn apply(&self, view: &ProxyView) -> Result<(), ProxyError> {
        match self.config.mode {
            HaproxyMode::Standby => self.render_and_reload(view).await,
            HaproxyMode::RuntimeApi => self.reconcile(view).await,
        }
    }
}

fn backend_of(node: &BackendNode, row: &StatRow) -> Backend {
    Backend {
        host: node.host.clone(),
        port: node.port,
        status: node.state.to_string(),
        prx_name: row.svname.clone(),
        prx_status: row.status.clone(),
        prx_connections: row.scur.clone(),
        prx_byte_in: row.bin.clone(),
        prx_byte_out: row.bout.clone(),
        prx_latency: row.rtime.clone(),
        prx_hostgroup: row.pxname.clone(),
    }
}

#[async_trait]
impl ProxySync for HaproxySync {
    fn info(&self) -> ProxyInfo {
        self.base.info()
    }

    async fn init(&self, view: &ProxyView) -> Result<(), ProxyError> {
        self.apply(view).await?;
        self.base.mark_up();
        Ok(())
    }

    async fn refresh(&self, view: &ProxyView) -> Result<(), ProxyError> {
        match self.apply(view).await {
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
        match self.config.mode {
            HaproxyMode::Standby => self.render_and_reload(view).await,
            HaproxyMode::RuntimeApi => {
                let Some(m) = &view.master else {
                    return Ok(());
                };
                let wb = &self.config.write_backend;
                self.send(&format!("set server {wb}/{LEADER_SLOT} addr {} port {}", m.host, m.port))
                    .await?;
                self.send(&format!("set server {wb}/{LEADER_SLOT} state ready")).await?;
                self.base.ctx.sme.raise("WARN0110", &[&self.base.name(), &m.url]);
                self.reconcile(view).await
            }
        }
    }

    async fn backends_state_change(&self, view: &ProxyView) -> Result<(), ProxyError> {
        self.apply(view).await
    }

    async fn set_maintenance(&self, view: &ProxyView, node: &BackendNode) -> Result<(), ProxyError> {
        match self.config.mode {
            HaproxyMode::Standby => self.render_and_reload(view).await,
            HaproxyMode::RuntimeApi => {
                let state = if node.maintenance { "maint" } else { "ready" };
                self.send(&format!("set server {}/{} state {state}", self.config.read_backend, node.id))
                    .await
            }
        }
    }

    async fn shutdown(&self) -> Result<(), ProxyError> {
        warn!(target: HAPROXY, proxy = %self.base.name(), "synchronizer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use repman_core::ServerState;

    use super::*;
    use crate::db::fake::FakeFleet;
    use crate::monitor::testutil::context;
    use crate::traits::RecordingScriptRunner;

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

    fn view(replica_state: ServerState) -> ProxyView {
        ProxyView {
            cluster: "c1".into(),
            master: Some(node("s1", "10.0.0.1", ServerState::Master)),
            replicas: vec![node("s2", "10.0.0.2", replica_state)],
            ..ProxyView::default()
        }
    }

    const STAT: &str = "# pxname,svname,qcur,qmax,scur,smax,slim,stot,bin,bout,status,rtime\n\
        service_write,FRONTEND,,,0,0,,0,0,0,OPEN,\n\
        service_write,leader,0,0,2,5,,9,100,200,UP,1\n\
        service_read,s2,0,0,1,3,,7,10,20,UP,2\n\
        service_read,BACKEND,0,0,1,3,,7,10,20,UP,2\n";

    const SERVERS: &str = "1\n\
        # be_id be_name srv_id srv_name srv_addr srv_op_state srv_admin_state srv_port\n\
        3 service_write 1 leader 10.0.0.1 2 0 3306\n\
        4 service_read 1 s2 10.0.0.2 2 0 3306\n";

    fn runtime(
        ctx: Arc<ClusterContext>,
        transport: Arc<FakeHaproxyTransport>,
    ) -> HaproxySync {
        let config = HaproxyConfig {
            mode: HaproxyMode::RuntimeApi,
            ..HaproxyConfig::default()
        };
        HaproxySync::new(ctx, config, transport)
    }

    #[test]
    fn show_stat_by_header() {
        let rows = parse_show_stat(STAT).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].svname, "s2");
        assert_eq!(rows[1].status, "UP");
        assert_eq!(rows[0].scur, "2");
        assert!(parse_show_stat("# a,b\n").is_err());
    }

    #[test]
    fn servers_state_rows() {
        let rows = parse_servers_state(SERVERS);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].backend, "service_write");
        assert_eq!(rows[0].addr, "10.0.0.1");
        assert_eq!(rows[0].port, 3306);
    }

    #[tokio::test]
    async fn broken_replica_is_drained_then_muted() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let ctx = context(&fleet, dir.path(), |_| {});
        let t = FakeHaproxyTransport::new();
        t.set_stat(STAT);
        t.set_servers_state(SERVERS);
        let p = runtime(Arc::clone(&ctx), t.clone());
        let v = view(ServerState::SlaveErr);
        for _ in 0..7 {
            p.refresh(&v).await.unwrap();
        }
        let drains: Vec<_> = t
            .commands()
            .into_iter()
            .filter(|c| c == "set server service_read/s2 state drain")
            .collect();
        assert_eq!(drains.len(), 5);
        assert!(ctx.sme.is_in_state("WARN0105"));
        assert!(ctx.sme.is_in_state("WARN0112"));
        assert!(!ctx.sme.is_in_state("WARN0110"));
        assert_eq!(p.info().backends_read[0].prx_status, "UP");
        assert_eq!(p.info().backends_write[0].prx_connections, "2");
    }

    #[tokio::test]
    async fn healthy_drained_replica_is_made_ready() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let ctx = context(&fleet, dir.path(), |_| {});
        let t = FakeHaproxyTransport::new();
        t.set_stat(&STAT.replace("7,10,20,UP,2\nservice_read,BACKEND", "7,10,20,DRAIN,2\nservice_read,BACKEND"));
        t.set_servers_state(SERVERS);
        let p = runtime(Arc::clone(&ctx), t.clone());
        p.refresh(&view(ServerState::Slave)).await.unwrap();
        assert_eq!(t.commands(), vec!["set server service_read/s2 state ready".to_string()]);
        assert!(ctx.sme.is_in_state("WARN0107"));
    }

    #[tokio::test]
    async fn maintenance_flag_follows_node() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let ctx = context(&fleet, dir.path(), |_| {});
        let t = FakeHaproxyTransport::new();
        t.set_stat(STAT);
        t.set_servers_state(SERVERS);
        let p = runtime(Arc::clone(&ctx), t.clone());
        let mut v = view(ServerState::Slave);
        v.replicas[0].maintenance = true;
        p.refresh(&v).await.unwrap();
        assert_eq!(t.commands(), vec!["set server service_read/s2 state maint".to_string()]);
        assert!(ctx.sme.is_in_state("WARN0108"));
    }

    #[tokio::test]
    async fn moved_leader_is_repointed() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let ctx = context(&fleet, dir.path(), |_| {});
        let t = FakeHaproxyTransport::new();
        t.set_stat(STAT);
        t.set_servers_state(&SERVERS.replace("leader 10.0.0.1", "leader 10.0.0.9"));
        let p = runtime(Arc::clone(&ctx), t.clone());
        p.refresh(&view(ServerState::Slave)).await.unwrap();
        assert_eq!(
            t.commands(),
            vec![
                "set server service_write/leader addr 10.0.0.1 port 3306".to_string(),
                "set server service_write/leader state ready".to_string(),
            ]
        );
        assert!(ctx.sme.is_in_state("WARN0110"));
    }

    #[tokio::test]
    async fn unreachable_proxy_goes_suspect_then_failed() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let ctx = context(&fleet, dir.path(), |_| {});
        let t = FakeHaproxyTransport::new();
        t.set_down(true);
        let p = runtime(ctx, t);
        let v = view(ServerState::Slave);
        assert!(p.refresh(&v).await.is_err());
        assert_eq!(p.info().state, super::super::ProxyHealth::Suspect);
        assert!(p.refresh(&v).await.is_err());
        assert_eq!(p.info().state, super::super::ProxyHealth::Failed);
        assert_eq!(p.info().fail_count, 2);
    }

    #[tokio::test]
    async fn standby_renders_and_reloads_once() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let runner = RecordingScriptRunner::new();
        let r = runner.clone();
        let ctx = crate::monitor::testutil::context_with(&fleet, dir.path(), |_| {}, move |c| c.scripts = r);
        let config = HaproxyConfig {
            config_path: dir.path().join("haproxy/haproxy.cfg"),
            reload_command: Some("systemctl reload haproxy".into()),
            ..HaproxyConfig::default()
        };
        let p = HaproxySync::new(ctx, config.clone(), FakeHaproxyTransport::new());
        let v = view(ServerState::Slave);
        p.init(&v).await.unwrap();
        p.backends_state_change(&v).await.unwrap();
        let text = std::fs::read_to_string(&config.config_path).unwrap();
        assert!(text.contains("server leader 10.0.0.1:3306 check\n"));
        assert!(text.contains("server s2 10.0.0.2:3306 check\n"));
        assert!(text.contains("server s1 10.0.0.1:3306 check backup\n"));
        assert_eq!(runner.lines(), vec!["sh -c systemctl reload haproxy".to_string()]);

        p.failover(&view(ServerState::SlaveErr)).await.unwrap();
        let text = std::fs::read_to_string(&config.config_path).unwrap();
        assert!(!text.contains("server s2 "));
        assert_eq!(runner.lines().len(), 2);
    }
}
