//! Binlog reader seam over `mysqlbinlog`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use repman_core::binlog::parse_event_timestamp;

use crate::config::BackupTools;
use crate::error::BinlogError;
use crate::traits::{ScriptRunner, ToolCommand};

/// Server the reader connects to.
#[derive(Clone, PartialEq, Eq)]
pub struct BinlogSource {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for BinlogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinlogSource")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl BinlogSource {
    /// Adds the connection flags to `cmd`. The password goes in `MYSQL_PWD`,
    /// never on the command line.
    fn connect(&self, cmd: ToolCommand) -> ToolCommand {
        cmd.args([
            format!("--host={}", self.host),
            format!("--port={}", self.port),
            format!("--user={}", self.user),
        ])
        .env("MYSQL_PWD", self.password.clone())
    }
}

/// Reads binlogs from a running server or from local files.
#[async_trait]
pub trait BinlogReader: Send + Sync {
    /// Unix time of the first event of `file` on `source`.
    async fn first_event_time(&self, source: &BinlogSource, file: &str) -> Result<Option<i64>, BinlogError>;

    /// Downloads `file` from `start_pos` up to the last log, raw, into files
    /// named `<dest_prefix><binlog name>`. Returns the written paths.
    async fn download(
        &self,
        source: &BinlogSource,
        file: &str,
        start_pos: u64,
        dest_prefix: &Path,
    ) -> Result<Vec<PathBuf>, BinlogError>;

    /// Replays the inverse of the events in `file` into `target`.
    async fn flashback(&self, file: &Path, target: &BinlogSource) -> Result<(), BinlogError>;
}

/// [`BinlogReader`] shelling out to `mysqlbinlog` and the `mysql` client.
pub struct ProcessBinlogReader {
    tools: BackupTools,
    scripts: Arc<dyn ScriptRunner>,
}

impl ProcessBinlogReader {
    #[must_use]
    pub fn new(tools: BackupTools, scripts: Arc<dyn ScriptRunner>) -> Self {
        Self { tools, scripts }
    }

    fn mysqlbinlog(&self) -> ToolCommand {
        ToolCommand::new(&self.tools.mysqlbinlog)
    }
}

/// Files in `dir` whose name starts with the file-name part of `prefix`.
async fn files_with_prefix(prefix: &Path) -> Result<Vec<PathBuf>, BinlogError> {
    let dir = prefix.parent().unwrap_or_else(|| Path::new("."));
    let stem = prefix
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with(&stem) {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

#[async_trait]
impl BinlogReader for ProcessBinlogReader {
    async fn first_event_time(&self, source: &BinlogSource, file: &str) -> Result<Option<i64>, BinlogError> {
        let cmd = source
            .connect(self.mysqlbinlog().arg("--read-from-remote-server"))
            .arg("--stop-position=1024")
            .arg(file);
        let out = self
            .scripts
            .run(&cmd)
            .await
            .map_err(|e| BinlogError::Reader(e.to_string()))?;
        Ok(out.lines().find_map(parse_event_timestamp))
    }

    async fn download(
        &self,
        source: &BinlogSource,
        file: &str,
        start_pos: u64,
        dest_prefix: &Path,
    ) -> Result<Vec<PathBuf>, BinlogError> {
        if let Some(dir) = dest_prefix.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let cmd = source
            .connect(
                self.mysqlbinlog()
                    .arg("--read-from-remote-server")
                    .arg("--raw")
                    .arg("--to-last-log")
                    .arg("--stop-never-slave-server-id=10000"),
            )
            .arg(format!("--result-file={}", dest_prefix.display()))
            .arg(format!("--start-position={start_pos}"))
            .arg(file);
        self.scripts
            .run(&cmd)
            .await
            .map_err(|e| BinlogError::Reader(e.to_string()))?;
        files_with_prefix(dest_prefix).await
    }

    async fn flashback(&self, file: &Path, target: &BinlogSource) -> Result<(), BinlogError> {
        let producer = self
            .mysqlbinlog()
            .arg("--flashback")
            .arg("--to-last-log")
            .arg(file.display().to_string());
        let consumer = target.connect(ToolCommand::new(&self.tools.mysql_client));
        self.scripts
            .pipe(&producer, &consumer)
            .await
            .map_err(|e| BinlogError::Reader(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

/// One call observed by [`FakeBinlogReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderCall {
    FirstEvent { host: String, file: String },
    Download { host: String, file: String, start_pos: u64, dest: PathBuf },
    Flashback { file: PathBuf, target: String },
}

/// [`BinlogReader`] writing placeholder files and recording calls.
#[derive(Debug, Default)]
pub struct FakeBinlogReader {
    calls: Mutex<Vec<ReaderCall>>,
    first_events: Mutex<Vec<(String, i64)>>,
    fail_flashback: Mutex<bool>,
}

impl FakeBinlogReader {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer for [`BinlogReader::first_event_time`] on `file`.
    pub fn set_first_event(&self, file: &str, ts: i64) {
        self.first_events.lock().push((file.to_string(), ts));
    }

    pub fn fail_flashback(&self) {
        *self.fail_flashback.lock() = true;
    }

    #[must_use]
    pub fn calls(&self) -> Vec<ReaderCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl BinlogReader for FakeBinlogReader {
    async fn first_event_time(&self, source: &BinlogSource, file: &str) -> Result<Option<i64>, BinlogError> {
        self.calls.lock().push(ReaderCall::FirstEvent {
            host: source.host.clone(),
            file: file.to_string(),
        });
        Ok(self
            .first_events
            .lock()
            .iter()
            .rev()
            .find(|(f, _)| f == file)
            .map(|(_, ts)| *ts))
    }

    async fn download(
        &self,
        source: &BinlogSource,
        file: &str,
        start_pos: u64,
        dest_prefix: &Path,
    ) -> Result<Vec<PathBuf>, BinlogError> {
        self.calls.lock().push(ReaderCall::Download {
            host: source.host.clone(),
            file: file.to_string(),
            start_pos,
            dest: dest_prefix.to_path_buf(),
        });
        if let Some(dir) = dest_prefix.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let path = PathBuf::from(format!("{}{file}", dest_prefix.display()));
        tokio::fs::write(&path, format!("events of {}:{} from {start_pos}\n", source.host, source.port)).await?;
        Ok(vec![path])
    }

    async fn flashback(&self, file: &Path, target: &BinlogSource) -> Result<(), BinlogError> {
        self.calls.lock().push(ReaderCall::Flashback {
            file: file.to_path_buf(),
            target: format!("{}:{}", target.host, target.port),
        });
        if *self.fail_flashback.lock() {
            return Err(BinlogError::Reader("flashback failed".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{RecordedCall, RecordingScriptRunner};

    fn source() -> BinlogSource {
        BinlogSource {
            host: "db1".into(),
            port: 3306,
            user: "root".into(),
            password: "pw".into(),
        }
    }

    #[tokio::test]
    async fn process_reader_parses_first_event() {
        let runner = RecordingScriptRunner::new();
        runner.set_output("# at 4\n#240102 10:00:00 server id 1  end_log_pos 256 Start: binlog v 4\n");
        let reader = ProcessBinlogReader::new(BackupTools::default(), runner.clone());
        let ts = reader.first_event_time(&source(), "mysql-bin.000001").await.unwrap();
        assert!(ts.is_some());
        let line = &runner.lines()[0];
        assert!(line.contains("--read-from-remote-server"));
        assert!(line.ends_with("mysql-bin.000001"));
        let RecordedCall::Run(cmd) = &runner.calls()[0] else {
            panic!("expected a run");
        };
        assert!(cmd.args.iter().all(|a| !a.contains("pw")));
        assert_eq!(cmd.env, vec![("MYSQL_PWD".to_string(), "pw".to_string())]);
    }

    #[tokio::test]
    async fn process_reader_download_lists_result_files() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("c1-server1-");
        std::fs::write(dir.path().join("c1-server1-mysql-bin.000003"), b"x").unwrap();
        std::fs::write(dir.path().join("other"), b"x").unwrap();
        let runner = RecordingScriptRunner::new();
        let reader = ProcessBinlogReader::new(BackupTools::default(), runner.clone());
        let files = reader
            .download(&source(), "mysql-bin.000003", 256, &prefix)
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        let line = &runner.lines()[0];
        assert!(line.contains("--raw"));
        assert!(line.contains("--start-position=256"));
        assert!(line.contains("--stop-never-slave-server-id=10000"));
    }

    #[tokio::test]
    async fn process_reader_flashback_pipes_into_client() {
        let runner = RecordingScriptRunner::new();
        let reader = ProcessBinlogReader::new(BackupTools::default(), runner.clone());
        reader
            .flashback(Path::new("/w/c1-server1-mysql-bin.000003"), &source())
            .await
            .unwrap();
        match &runner.calls()[0] {
            RecordedCall::Pipe(a, b) => {
                assert!(a.args.contains(&"--flashback".to_string()));
                assert!(b.args.contains(&"--host=db1".to_string()));
                assert!(b.args.iter().all(|a| !a.starts_with("--password")));
                assert!(b.env.contains(&("MYSQL_PWD".to_string(), "pw".to_string())));
            }
            RecordedCall::Run(_) => panic!("expected a pipe"),
        }
    }

    #[tokio::test]
    async fn fake_reader_writes_download() {
        let dir = tempfile::tempdir().unwrap();
        let reader = FakeBinlogReader::new();
        let files = reader
            .download(&source(), "mysql-bin.000002", 4, &dir.path().join("c1-server1-"))
            .await
            .unwrap();
        assert!(files[0].exists());
        assert_eq!(reader.calls().len(), 1);
    }
}
