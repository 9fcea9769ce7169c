//! Seams to collaborators that live outside the control plane.
//!
//! Secret backends, orchestrators, SST transport, arbitration peers and
//! operator scripts are reached only through these traits. Process-backed
//! implementations are provided where the collaborator is a local command;
//! in-memory doubles are provided for tests.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::debug;

// ---------------------------------------------------------------------------
// SecretStore
// ---------------------------------------------------------------------------

/// A decrypted credential with the value it replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secret {
    pub value: String,
    pub old_value: Option<String>,
}

/// Key-value secret backend.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Secret>>;

    /// Stores `value`, keeping the previous one as `old_value`.
    async fn put(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// Secret store kept in process memory.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: DashMap<String, Secret>,
}

impl MemorySecretStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Secret>> {
        Ok(self.secrets.get(key).map(|s| s.clone()))
    }

    async fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let old_value = self.secrets.get(key).map(|s| s.value.clone());
        self.secrets.insert(
            key.to_string(),
            Secret {
                value: value.to_string(),
                old_value,
            },
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

/// OS orchestrator able to manage a database or proxy service by URL.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, url: &str) -> anyhow::Result<()>;
    async fn unprovision(&self, url: &str) -> anyhow::Result<()>;
    async fn start(&self, url: &str) -> anyhow::Result<()>;
    async fn stop(&self, url: &str) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// SstChannel
// ---------------------------------------------------------------------------

/// State snapshot transfer endpoints opened by the control plane. Each call
/// returns the TCP port the node-side job must connect to.
#[async_trait]
pub trait SstChannel: Send + Sync {
    /// Receives a stream into `dest` as is.
    async fn run_receiver_to_file(&self, dest: &Path) -> anyhow::Result<u16>;

    /// Receives a stream into `dest`, gzip-compressed.
    async fn run_receiver_to_gzip(&self, dest: &Path) -> anyhow::Result<u16>;

    /// Serves `source` to the first client that connects.
    async fn run_sender(&self, source: &Path) -> anyhow::Result<u16>;
}

// ---------------------------------------------------------------------------
// Arbitrator
// ---------------------------------------------------------------------------

/// Peer deciding which of two partitioned control planes keeps authority.
#[async_trait]
pub trait Arbitrator: Send + Sync {
    /// Returns whether this control plane won the vote.
    async fn vote(&self, cluster: &str, split_brain: bool) -> anyhow::Result<bool>;
}

/// Arbitrator reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpArbitrator {
    client: reqwest::Client,
    address: String,
    uuid: String,
}

impl HttpArbitrator {
    #[must_use]
    pub fn new(address: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            address: address.into(),
            uuid: uuid.into(),
        }
    }
}

#[derive(serde::Serialize)]
struct VoteRequest<'a> {
    uuid: &'a str,
    cluster: &'a str,
    split_brain: bool,
}

#[derive(serde::Deserialize)]
struct VoteResponse {
    arbitration: String,
}

#[async_trait]
impl Arbitrator for HttpArbitrator {
    async fn vote(&self, cluster: &str, split_brain: bool) -> anyhow::Result<bool> {
        let url = format!("http://{}/arbitrator", self.address);
        let resp: VoteResponse = self
            .client
            .post(url)
            .json(&VoteRequest {
                uuid: &self.uuid,
                cluster,
                split_brain,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.arbitration == "winner")
    }
}

// ---------------------------------------------------------------------------
// ScriptRunner
// ---------------------------------------------------------------------------

/// A local command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ToolCommand {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Command line as logged; `--password=` values are masked.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().map(|a| {
                if a.starts_with("--password=") {
                    "--password=XXXX".to_string()
                } else {
                    a.clone()
                }
            }))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }
}

/// Runs operator scripts and local tools.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Runs `cmd` and returns its standard output.
    async fn run(&self, cmd: &ToolCommand) -> anyhow::Result<String>;

    /// Runs `producer | consumer`.
    async fn pipe(&self, producer: &ToolCommand, consumer: &ToolCommand) -> anyhow::Result<()>;
}

/// [`ScriptRunner`] spawning real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessScriptRunner;

#[async_trait]
impl ScriptRunner for ProcessScriptRunner {
    async fn run(&self, cmd: &ToolCommand) -> anyhow::Result<String> {
        debug!(command = %cmd.display(), "running command");
        let out = cmd.to_tokio().stdin(Stdio::null()).output().await?;
        if !out.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                cmd.program.display(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    async fn pipe(&self, producer: &ToolCommand, consumer: &ToolCommand) -> anyhow::Result<()> {
        debug!(producer = %producer.display(), consumer = %consumer.display(), "running pipe");
        let mut source = producer.to_tokio().stdout(Stdio::piped()).spawn()?;
        let mut sink = consumer.to_tokio().stdin(Stdio::piped()).spawn()?;
        let mut out = source
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("producer stdout unavailable"))?;
        let mut inp = sink
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("consumer stdin unavailable"))?;
        tokio::io::copy(&mut out, &mut inp).await?;
        inp.shutdown().await?;
        drop(inp);
        let (p, c) = (source.wait().await?, sink.wait().await?);
        if !p.success() || !c.success() {
            anyhow::bail!("pipe failed: producer {p}, consumer {c}");
        }
        Ok(())
    }
}

/// One call observed by [`RecordingScriptRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Run(ToolCommand),
    Pipe(ToolCommand, ToolCommand),
}

/// [`ScriptRunner`] that records calls and returns canned output.
#[derive(Debug, Default)]
pub struct RecordingScriptRunner {
    calls: Mutex<Vec<RecordedCall>>,
    output: Mutex<String>,
    failing: Mutex<Vec<String>>,
}

impl RecordingScriptRunner {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_output(&self, out: impl Into<String>) {
        *self.output.lock() = out.into();
    }

    /// Makes every command whose line contains `needle` fail.
    pub fn fail_when(&self, needle: impl Into<String>) {
        self.failing.lock().push(needle.into());
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Command lines of every call, pipes rendered as `a | b`.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|c| match c {
                RecordedCall::Run(cmd) => cmd.display(),
                RecordedCall::Pipe(a, b) => format!("{} | {}", a.display(), b.display()),
            })
            .collect()
    }

    fn check(&self, line: &str) -> anyhow::Result<()> {
        if let Some(n) = self.failing.lock().iter().find(|n| line.contains(n.as_str())) {
            anyhow::bail!("injected failure on '{n}'");
        }
        Ok(())
    }
}

#[async_trait]
impl ScriptRunner for RecordingScriptRunner {
    async fn run(&self, cmd: &ToolCommand) -> anyhow::Result<String> {
        self.calls.lock().push(RecordedCall::Run(cmd.clone()));
        self.check(&cmd.display())?;
        Ok(self.output.lock().clone())
    }

    async fn pipe(&self, producer: &ToolCommand, consumer: &ToolCommand) -> anyhow::Result<()> {
        self.calls
            .lock()
            .push(RecordedCall::Pipe(producer.clone(), consumer.clone()));
        self.check(&format!("{} | {}", producer.display(), consumer.display()))
    }
}
