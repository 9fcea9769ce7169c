//! Configuration record for one managed cluster.
//!
//! Every knob is a plain field with a default; component code only asks
//! boolean or enum questions of the record and never parses text itself.
//! Durations are stored in seconds and exposed through `Duration` helpers.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Which SQL dialect the nodes speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[default]
    Mysql,
    Postgres,
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default `EnvFilter` directive, overridden by `RUST_LOG`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Level used by node-side job scripts (`REPLICATION_MANAGER_LOG_LEVEL`).
    pub job_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            job_level: "info".to_string(),
        }
    }
}

/// Connection timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbTimeouts {
    pub connect_secs: u64,
    pub read_secs: u64,
    /// Pool connection lifetime.
    pub conn_max_lifetime_secs: u64,
}

impl Default for DbTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            read_secs: 15,
            conn_max_lifetime_secs: 3595,
        }
    }
}

/// TLS material for the current and the previous certificate generation.
///
/// A handshake failure with `current` falls back to `old` once.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsProfiles {
    pub current: TlsFiles,
    pub old: Option<TlsFiles>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsFiles {
    pub ca_cert: PathBuf,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

/// How leader binlogs are copied into the backup directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinlogCopyMode {
    #[default]
    Mysqlbinlog,
    Ssh,
    Script,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalBackupTool {
    #[default]
    Mysqldump,
    Mydumper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhysicalBackupTool {
    Xtrabackup,
    #[default]
    Mariabackup,
}

/// Paths of client binaries the control plane shells out to.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupTools {
    pub mysqlbinlog: PathBuf,
    pub mysql_client: PathBuf,
    pub mysqldump: PathBuf,
}

impl Default for BackupTools {
    fn default() -> Self {
        Self {
            mysqlbinlog: PathBuf::from("mysqlbinlog"),
            mysql_client: PathBuf::from("mysql"),
            mysqldump: PathBuf::from("mysqldump"),
        }
    }
}

/// SSH access used by the job runner and the `ssh` binlog copy mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub enabled: bool,
    pub user: String,
    pub port: u16,
    pub key_path: Option<PathBuf>,
    /// Base URL of the control plane API exported to node scripts.
    pub api_url: String,
    /// Local path of the job shell piped to the node.
    pub job_script: PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user: "root".to_string(),
            port: 22,
            key_path: None,
            api_url: "https://127.0.0.1:10005".to_string(),
            job_script: PathBuf::from("share/scripts/dbjobs_new"),
        }
    }
}

// ---------------------------------------------------------------------------
// Proxies
// ---------------------------------------------------------------------------

/// HAProxy integration mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaproxyMode {
    /// Render a configuration file and reload the process.
    #[default]
    Standby,
    /// Reconcile through the runtime API socket.
    RuntimeApi,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HaproxyConfig {
    pub host: String,
    /// Stats / runtime API TCP port, used when `socket` is unset.
    pub api_port: u16,
    /// Unix socket path of the runtime API.
    pub socket: Option<PathBuf>,
    pub mode: HaproxyMode,
    pub write_port: u16,
    pub read_port: u16,
    pub write_backend: String,
    pub read_backend: String,
    /// Rendered configuration file (standby mode).
    pub config_path: PathBuf,
    /// Command reloading HAProxy after a render.
    pub reload_command: Option<String>,
}

impl Default for HaproxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            api_port: 1999,
            socket: None,
            mode: HaproxyMode::Standby,
            write_port: 3306,
            read_port: 3307,
            write_backend: "service_write".to_string(),
            read_backend: "service_read".to_string(),
            config_path: PathBuf::from("haproxy.cfg"),
            reload_command: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySqlConfig {
    pub host: String,
    pub admin_port: u16,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub writer_hostgroup: u32,
    pub reader_hostgroup: u32,
    /// Copy users from the leader into `mysql_users`.
    pub bootstrap_users: bool,
    /// When set the instance acts as a janitor federating this domain.
    pub janitor_domain: Option<String>,
}

impl Default for ProxySqlConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            admin_port: 6032,
            port: 6033,
            user: "admin".to_string(),
            password: "admin".to_string(),
            writer_hostgroup: 0,
            reader_hostgroup: 1,
            bootstrap_users: true,
            janitor_domain: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaxScaleConfig {
    pub host: String,
    /// REST API port.
    pub api_port: u16,
    pub user: String,
    pub password: String,
    pub write_port: u16,
    pub read_port: u16,
    /// Name of the MaxScale monitor driving the servers.
    pub monitor: String,
}

impl Default for MaxScaleConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            api_port: 8989,
            user: "admin".to_string(),
            password: "mariadb".to_string(),
            write_port: 4007,
            read_port: 4008,
            monitor: "MariaDB-Monitor".to_string(),
        }
    }
}

/// MariaDB Spider gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShardProxyConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ShardProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsulConfig {
    /// Agent base URL, e.g. `http://127.0.0.1:8500`.
    pub address: String,
    pub token: Option<String>,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExternalProxyConfig {
    pub host: String,
    pub write_port: u16,
    pub read_port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProxiesConfig {
    pub haproxy: Vec<HaproxyConfig>,
    pub proxysql: Vec<ProxySqlConfig>,
    pub maxscale: Vec<MaxScaleConfig>,
    pub shardproxy: Vec<ShardProxyConfig>,
    pub consul: Vec<ConsulConfig>,
    pub external: Vec<ExternalProxyConfig>,
}

// ---------------------------------------------------------------------------
// ClusterConfig
// ---------------------------------------------------------------------------

/// Policy and mechanism settings for one cluster.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct ClusterConfig {
    pub name: String,
    /// Seed node URLs, `host[:port]`.
    pub hosts: Vec<String>,
    pub database_kind: DatabaseKind,
    /// Monitoring user; may name a secret in the secret store.
    pub db_user: String,
    pub db_password: String,
    /// Replication user.
    pub rpl_user: String,
    pub rpl_password: String,
    pub working_dir: PathBuf,
    pub log: LogConfig,
    pub timeouts: DbTimeouts,
    pub tls: Option<TlsProfiles>,

    // Monitoring cadence
    pub monitoring_ticker: u64,
    pub monitor_wait_retry: u32,
    pub max_fail: u32,
    pub fail_max_delay: i64,
    pub rpl_checks: bool,
    pub monitor_process_list: bool,
    pub monitor_pfs: bool,
    pub monitor_queries: bool,
    pub monitor_capture: bool,
    pub monitor_disk_usage_pct: u32,
    pub check_grants: bool,

    // Topology
    pub pref_master: Vec<String>,
    pub ignore_servers: Vec<String>,
    pub multi_master: bool,
    pub multi_master_ring: bool,
    pub multi_master_wsrep: bool,
    pub multi_master_grprep: bool,
    pub multi_tier_slave: bool,
    pub replication_no_relay: bool,
    pub replication_source_name: String,
    pub replication_ssl: bool,
    pub read_only: bool,
    pub super_read_only: bool,
    pub arbitration: bool,
    pub arbitrator_address: String,

    // Failover policy
    pub interactive: bool,
    pub fail_restart_unsafe: bool,
    pub fail_limit: u32,
    pub fail_time: i64,
    pub fail_sync: bool,
    pub switch_sync: bool,
    pub switchover_wait_trx: u64,
    pub switchover_wait_write_query: u64,
    pub check_false_positive_heartbeat: bool,
    pub check_false_positive_heartbeat_timeout: u64,
    pub pre_failover_script: Option<String>,
    pub post_failover_script: Option<String>,
    pub failover_event_scheduler: bool,

    // Rejoin policy
    pub autorejoin: bool,
    pub autorejoin_flashback: bool,
    pub autorejoin_mysqldump: bool,
    pub autorejoin_logical_backup: bool,
    pub autorejoin_physical_backup: bool,
    pub autorejoin_zfs_flashback: bool,
    pub autorejoin_backup_binlog: bool,
    pub autorejoin_script: Option<String>,
    pub rejoin_script: Option<String>,
    pub replication_error_script: Option<String>,
    pub replication_restart_on_sql_error_match: Option<String>,

    // Enforcement
    pub force_slave_semisync: bool,
    pub force_slave_readonly: bool,
    pub force_slave_heartbeat: bool,
    pub force_slave_heartbeat_time: u32,
    pub force_slave_heartbeat_retry: u32,
    pub force_slave_gtid: bool,
    pub force_slave_gtid_strict: bool,
    pub force_sync_innodb: bool,
    pub force_sync_binlog: bool,
    pub force_binlog_row: bool,
    pub force_binlog_checksum: bool,
    pub force_binlog_slowqueries: bool,
    pub force_binlog_annotate: bool,
    pub force_binlog_compress: bool,

    // Binlogs
    pub force_binlog_purge: bool,
    /// GiB kept on the leader.
    pub force_binlog_purge_total_size: u64,
    pub force_binlog_purge_min_replica: u32,
    pub force_binlog_purge_replicas: bool,
    pub force_binlog_purge_on_restore: bool,
    pub backup_binlogs: bool,
    pub backup_binlogs_keep: u32,
    pub binlog_copy_mode: BinlogCopyMode,
    pub binlog_copy_script: Option<String>,
    pub backup_restic: bool,
    pub restic_repository: String,
    pub cloud18_user: String,
    pub backup_logical_type: LogicalBackupTool,
    pub backup_physical_type: PhysicalBackupTool,
    pub tools: BackupTools,

    pub ssh: SshConfig,
    pub proxies: ProxiesConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "cluster1".to_string(),
            hosts: Vec::new(),
            database_kind: DatabaseKind::Mysql,
            db_user: "root".to_string(),
            db_password: String::new(),
            rpl_user: "repl".to_string(),
            rpl_password: String::new(),
            working_dir: PathBuf::from("/var/lib/replication-manager"),
            log: LogConfig::default(),
            timeouts: DbTimeouts::default(),
            tls: None,

            monitoring_ticker: 2,
            monitor_wait_retry: 60,
            max_fail: 5,
            fail_max_delay: 30,
            rpl_checks: true,
            monitor_process_list: true,
            monitor_pfs: false,
            monitor_queries: false,
            monitor_capture: false,
            monitor_disk_usage_pct: 80,
            check_grants: false,

            pref_master: Vec::new(),
            ignore_servers: Vec::new(),
            multi_master: false,
            multi_master_ring: false,
            multi_master_wsrep: false,
            multi_master_grprep: false,
            multi_tier_slave: false,
            replication_no_relay: false,
            replication_source_name: String::new(),
            replication_ssl: false,
            read_only: true,
            super_read_only: false,
            arbitration: false,
            arbitrator_address: String::new(),

            interactive: true,
            fail_restart_unsafe: false,
            fail_limit: 5,
            fail_time: 300,
            fail_sync: false,
            switch_sync: false,
            switchover_wait_trx: 10,
            switchover_wait_write_query: 10,
            check_false_positive_heartbeat: false,
            check_false_positive_heartbeat_timeout: 3,
            pre_failover_script: None,
            post_failover_script: None,
            failover_event_scheduler: false,

            autorejoin: true,
            autorejoin_flashback: false,
            autorejoin_mysqldump: false,
            autorejoin_logical_backup: false,
            autorejoin_physical_backup: false,
            autorejoin_zfs_flashback: false,
            autorejoin_backup_binlog: true,
            autorejoin_script: None,
            rejoin_script: None,
            replication_error_script: None,
            replication_restart_on_sql_error_match: None,

            force_slave_semisync: false,
            force_slave_readonly: false,
            force_slave_heartbeat: false,
            force_slave_heartbeat_time: 3,
            force_slave_heartbeat_retry: 5,
            force_slave_gtid: false,
            force_slave_gtid_strict: false,
            force_sync_innodb: false,
            force_sync_binlog: false,
            force_binlog_row: false,
            force_binlog_checksum: false,
            force_binlog_slowqueries: false,
            force_binlog_annotate: false,
            force_binlog_compress: false,

            force_binlog_purge: false,
            force_binlog_purge_total_size: 30,
            force_binlog_purge_min_replica: 1,
            force_binlog_purge_replicas: false,
            force_binlog_purge_on_restore: false,
            backup_binlogs: false,
            backup_binlogs_keep: 10,
            binlog_copy_mode: BinlogCopyMode::Mysqlbinlog,
            binlog_copy_script: None,
            backup_restic: false,
            restic_repository: String::new(),
            cloud18_user: String::new(),
            backup_logical_type: LogicalBackupTool::Mysqldump,
            backup_physical_type: PhysicalBackupTool::Mariabackup,
            tools: BackupTools::default(),

            ssh: SshConfig::default(),
            proxies: ProxiesConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Monitoring tick period.
    #[must_use]
    pub fn ticker(&self) -> Duration {
        Duration::from_secs(self.monitoring_ticker.max(1))
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.connect_secs)
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.read_secs)
    }

    /// Whether `url` (`host:port`) is in the ignore list.
    #[must_use]
    pub fn is_ignored(&self, url: &str) -> bool {
        self.ignore_servers.iter().any(|s| s == url)
    }

    /// Whether `url` is a preferred leader.
    #[must_use]
    pub fn is_preferred(&self, url: &str) -> bool {
        self.pref_master.iter().any(|s| s == url)
    }

    /// Any SST rejoin method is enabled.
    #[must_use]
    pub fn has_sst_method(&self) -> bool {
        self.autorejoin_mysqldump
            || self.autorejoin_zfs_flashback
            || self.autorejoin_logical_backup
            || self.autorejoin_physical_backup
            || self.rejoin_script.is_some()
    }

    /// Per-node data directory `<working_dir>/<cluster>/<host>_<port>`.
    #[must_use]
    pub fn node_dir(&self, host: &str, port: u16) -> PathBuf {
        self.working_dir
            .join(&self.name)
            .join(format!("{host}_{port}"))
    }

    /// Per-node backup destination `<working_dir>/streaming/<cluster>/<host>_<port>`.
    #[must_use]
    pub fn node_backup_dir(&self, host: &str, port: u16) -> PathBuf {
        self.working_dir
            .join("streaming")
            .join(&self.name)
            .join(format!("{host}_{port}"))
    }

    /// Crash log file.
    #[must_use]
    pub fn crash_log_path(&self) -> PathBuf {
        self.working_dir.join(&self.name).join("crashes.json")
    }
}
