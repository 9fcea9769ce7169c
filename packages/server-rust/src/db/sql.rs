//! Statement builders and result parsers.
//!
//! Pure functions: the flavor and version of the target decide the syntax,
//! the session implementations only execute what is built here.

use std::collections::HashMap;

use repman_core::{ChangeSourceOptions, DbVersion, GtidList, IoThread, ReplicationMode, ReplicationStatus};

pub const JOBS_SCHEMA: &str = "CREATE DATABASE IF NOT EXISTS replication_manager_schema";

pub const JOBS_TABLE: &str = "CREATE TABLE IF NOT EXISTS replication_manager_schema.jobs(\
id INT NOT NULL AUTO_INCREMENT PRIMARY KEY, \
task VARCHAR(20), \
port INT, \
server VARCHAR(255), \
done TINYINT NOT NULL DEFAULT 0, \
state TINYINT NOT NULL DEFAULT 0, \
result VARCHAR(1000), \
start DATETIME, \
end DATETIME, \
KEY idx1(task, done), \
KEY idx2(result(1), task)) ENGINE=InnoDB";

/// Additive migrations applied after [`JOBS_TABLE`] on older deployments.
pub const JOBS_MIGRATIONS: &[&str] = &[
    "ALTER TABLE replication_manager_schema.jobs ADD COLUMN IF NOT EXISTS state TINYINT NOT NULL DEFAULT 0",
    "ALTER TABLE replication_manager_schema.jobs ADD INDEX IF NOT EXISTS idx3(task, state)",
];

/// Quotes a string literal.
#[must_use]
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn is_mariadb(version: &DbVersion) -> bool {
    version.is_mariadb()
}

// ---------------------------------------------------------------------------
// Replication control
// ---------------------------------------------------------------------------

/// `CHANGE MASTER TO` / `CHANGE REPLICATION SOURCE TO` for `opts`.
#[must_use]
pub fn change_source(opts: &ChangeSourceOptions, version: &DbVersion) -> String {
    let source = !is_mariadb(version) && version.has_source_syntax();
    let kw = if source { "SOURCE" } else { "MASTER" };
    let mut parts = vec![
        format!("{kw}_HOST={}", quote(&opts.host)),
        format!("{kw}_PORT={}", opts.port),
        format!("{kw}_USER={}", quote(&opts.user)),
        format!("{kw}_PASSWORD={}", quote(&opts.password)),
        format!("{kw}_CONNECT_RETRY={}", opts.retry),
        format!("{kw}_HEARTBEAT_PERIOD={}", opts.heartbeat),
    ];
    match opts.mode {
        ReplicationMode::SlavePos => parts.push("MASTER_USE_GTID=slave_pos".into()),
        ReplicationMode::CurrentPos => parts.push("MASTER_USE_GTID=current_pos".into()),
        ReplicationMode::MasterAutoPosition => parts.push(format!("{kw}_AUTO_POSITION=1")),
        ReplicationMode::Positional | ReplicationMode::Mxs => {
            if is_mariadb(version) && opts.mode == ReplicationMode::Positional {
                parts.push("MASTER_USE_GTID=no".into());
            }
            parts.push(format!("{kw}_LOG_FILE={}", quote(&opts.logfile)));
            parts.push(format!("{kw}_LOG_POS={}", opts.logpos));
        }
    }
    if opts.ssl {
        parts.push(format!("{kw}_SSL=1"));
    }
    if opts.is_delayed {
        parts.push(format!("{kw}_DELAY={}", opts.delay));
    }
    let body = parts.join(", ");
    let head = if source { "CHANGE REPLICATION SOURCE" } else { "CHANGE MASTER" };
    if opts.channel.is_empty() {
        format!("{head} TO {body}")
    } else if is_mariadb(version) {
        format!("{head} {} TO {body}", quote(&opts.channel))
    } else {
        format!("{head} TO {body} FOR CHANNEL {}", quote(&opts.channel))
    }
}

fn replica_command(verb: &str, suffix: &str, channel: &str, version: &DbVersion) -> String {
    let noun = if !is_mariadb(version) && version.has_source_syntax() {
        "REPLICA"
    } else {
        "SLAVE"
    };
    let mut sql = format!("{verb} {noun}");
    if !channel.is_empty() && is_mariadb(version) {
        sql.push(' ');
        sql.push_str(&quote(channel));
    }
    if !suffix.is_empty() {
        sql.push(' ');
        sql.push_str(suffix);
    }
    if !channel.is_empty() && !is_mariadb(version) {
        sql.push_str(" FOR CHANNEL ");
        sql.push_str(&quote(channel));
    }
    sql
}

#[must_use]
pub fn start_replica(channel: &str, version: &DbVersion) -> String {
    replica_command("START", "", channel, version)
}

#[must_use]
pub fn stop_replica(channel: &str, version: &DbVersion) -> String {
    replica_command("STOP", "", channel, version)
}

#[must_use]
pub fn reset_replica(channel: &str, all: bool, version: &DbVersion) -> String {
    replica_command("RESET", if all { "ALL" } else { "" }, channel, version)
}

/// Query listing every replication channel.
#[must_use]
pub fn show_replication_status(version: &DbVersion) -> &'static str {
    if is_mariadb(version) {
        "SHOW ALL SLAVES STATUS"
    } else if version.at_least(8, 0, 22) {
        "SHOW REPLICA STATUS"
    } else {
        "SHOW SLAVE STATUS"
    }
}

#[must_use]
pub fn show_master_status(version: &DbVersion) -> &'static str {
    if version.is_mysql_or_percona() && version.at_least(8, 2, 0) {
        "SHOW BINARY LOG STATUS"
    } else {
        "SHOW MASTER STATUS"
    }
}

#[must_use]
pub fn set_read_only(on: bool) -> String {
    format!("SET GLOBAL read_only={}", u8::from(on))
}

#[must_use]
pub fn set_super_read_only(on: bool) -> String {
    format!("SET GLOBAL super_read_only={}", u8::from(on))
}

/// `SET GLOBAL`, quoting `value` unless it is numeric or a keyword.
#[must_use]
pub fn set_global(name: &str, value: &str) -> String {
    let bare = value.parse::<f64>().is_ok()
        || matches!(value.to_ascii_uppercase().as_str(), "ON" | "OFF" | "DEFAULT");
    if bare {
        format!("SET GLOBAL {name}={value}")
    } else {
        format!("SET GLOBAL {name}={}", quote(value))
    }
}

#[must_use]
pub fn set_gtid_slave_pos(gtid: &GtidList) -> String {
    format!("SET GLOBAL gtid_slave_pos={}", quote(&gtid.to_string()))
}

#[must_use]
pub fn master_pos_wait(file: &str, pos: u64, timeout_secs: u64) -> String {
    format!("SELECT MASTER_POS_WAIT({}, {pos}, {timeout_secs})", quote(file))
}

#[must_use]
pub fn master_gtid_wait(gtid: &str, timeout_secs: u64, version: &DbVersion) -> String {
    if is_mariadb(version) {
        format!("SELECT MASTER_GTID_WAIT({}, {timeout_secs})", quote(gtid))
    } else {
        format!("SELECT WAIT_FOR_EXECUTED_GTID_SET({}, {timeout_secs})", quote(gtid))
    }
}

/// Whether a wait function result means the position was reached.
///
/// `MASTER_GTID_WAIT` and `WAIT_FOR_EXECUTED_GTID_SET` return 0 on success;
/// `MASTER_POS_WAIT` returns the number of events waited for, or -1 / NULL.
#[must_use]
pub fn wait_succeeded(result: Option<i64>, positional: bool) -> bool {
    match result {
        None => false,
        Some(v) if positional => v >= 0,
        Some(v) => v == 0,
    }
}

#[must_use]
pub fn purge_binary_logs_to(file: &str) -> String {
    format!("PURGE BINARY LOGS TO {}", quote(file))
}

#[must_use]
pub fn purge_binary_logs_before(unix_ts: i64) -> String {
    format!("PURGE BINARY LOGS BEFORE FROM_UNIXTIME({unix_ts})")
}

#[must_use]
pub fn install_plugin(name: &str, soname: &str) -> String {
    format!("INSTALL PLUGIN {name} SONAME {}", quote(soname))
}

#[must_use]
pub fn long_running_writes(min_secs: u64) -> String {
    format!(
        "SELECT COUNT(*) FROM information_schema.PROCESSLIST WHERE COMMAND = 'Query' \
         AND TIME >= {min_secs} AND INFO IS NOT NULL AND UPPER(LEFT(TRIM(INFO), 6)) <> 'SELECT'"
    )
}

pub const BINLOG_DUMP_COUNT: &str = "SELECT COUNT(*) FROM information_schema.PROCESSLIST \
WHERE COMMAND IN ('Binlog Dump', 'Binlog Dump GTID')";

pub const USERS: &str = "SELECT user, host, authentication_string FROM mysql.user";

pub const PLUGINS: &str = "SELECT PLUGIN_NAME, PLUGIN_STATUS FROM information_schema.PLUGINS";

/// `ALTER USER` for a credential rotation.
#[must_use]
pub fn alter_user_password(user: &str, host: &str, password: &str) -> String {
    format!(
        "ALTER USER {}@{} IDENTIFIED BY {}",
        quote(user),
        quote(host),
        quote(password)
    )
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn col<'a>(row: &'a HashMap<String, String>, names: &[&str]) -> &'a str {
    names
        .iter()
        .find_map(|n| row.get(*n))
        .map_or("", String::as_str)
}

fn col_u64(row: &HashMap<String, String>, names: &[&str]) -> u64 {
    col(row, names).trim().parse().unwrap_or(0)
}

/// Builds a [`ReplicationStatus`] from one `SHOW ... STATUS` row.
///
/// Accepts both the `Master_*` and the `Source_*` column families.
#[must_use]
pub fn parse_replication_row(row: &HashMap<String, String>, version: &DbVersion) -> ReplicationStatus {
    let gtid_text = col(row, &["Gtid_IO_Pos", "Retrieved_Gtid_Set"]);
    let gtid_io_pos = if is_mariadb(version) {
        GtidList::parse(gtid_text).unwrap_or_default()
    } else {
        GtidList::parse_mysql(gtid_text).unwrap_or_default()
    };
    let using_gtid = if is_mariadb(version) {
        col(row, &["Using_Gtid"]).to_string()
    } else if col(row, &["Auto_Position"]) == "1" {
        "Yes".to_string()
    } else {
        "No".to_string()
    };
    ReplicationStatus {
        channel: col(row, &["Connection_name", "Channel_Name", "Channel_name"]).to_string(),
        master_host: col(row, &["Master_Host", "Source_Host"]).to_string(),
        master_port: u16::try_from(col_u64(row, &["Master_Port", "Source_Port"])).unwrap_or(0),
        master_user: col(row, &["Master_User", "Source_User"]).to_string(),
        master_server_id: col_u64(row, &["Master_Server_Id", "Source_Server_Id"]),
        master_log_file: col(row, &["Master_Log_File", "Source_Log_File"]).to_string(),
        read_master_log_pos: col_u64(row, &["Read_Master_Log_Pos", "Read_Source_Log_Pos"]),
        relay_master_log_file: col(row, &["Relay_Master_Log_File", "Relay_Source_Log_File"]).to_string(),
        exec_master_log_pos: col_u64(row, &["Exec_Master_Log_Pos", "Exec_Source_Log_Pos"]),
        io_running: IoThread::parse(col(row, &["Slave_IO_Running", "Replica_IO_Running"])),
        sql_running: col(row, &["Slave_SQL_Running", "Replica_SQL_Running"]) == "Yes",
        seconds_behind_master: col(row, &["Seconds_Behind_Master", "Seconds_Behind_Source"])
            .trim()
            .parse()
            .ok(),
        last_io_errno: u32::try_from(col_u64(row, &["Last_IO_Errno"])).unwrap_or(0),
        last_io_error: col(row, &["Last_IO_Error"]).to_string(),
        last_sql_errno: u32::try_from(col_u64(row, &["Last_SQL_Errno"])).unwrap_or(0),
        last_sql_error: col(row, &["Last_SQL_Error"]).to_string(),
        using_gtid,
        gtid_io_pos,
        heartbeat_period: col(row, &["Slave_heartbeat_period", "Replica_heartbeat_period"])
            .trim()
            .parse()
            .unwrap_or(0.0),
        received_heartbeats: col_u64(row, &["Slave_received_heartbeats", "Replica_received_heartbeats"]),
        sql_delay: col_u64(row, &["SQL_Delay"]),
        sql_running_state: col(row, &["Slave_SQL_Running_State", "Replica_SQL_Running_State"]).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use repman_core::Flavor;

    use super::*;

    fn mariadb() -> DbVersion {
        DbVersion::new(Flavor::MariaDB, 10, 11, 6)
    }

    fn mysql8() -> DbVersion {
        DbVersion::new(Flavor::MySQL, 8, 0, 36)
    }

    #[test]
    fn change_master_mariadb_gtid() {
        let o = ChangeSourceOptions::new("db2", 3306, ReplicationMode::SlavePos).credentials("repl", "pw");
        let sql = change_source(&o, &mariadb());
        assert!(sql.starts_with("CHANGE MASTER TO MASTER_HOST='db2', MASTER_PORT=3306"));
        assert!(sql.contains("MASTER_USE_GTID=slave_pos"));
        assert!(!sql.contains("MASTER_LOG_FILE"));
    }

    #[test]
    fn change_source_mysql8_auto_position_with_channel() {
        let o = ChangeSourceOptions::new("db2", 3306, ReplicationMode::MasterAutoPosition).channel("c1");
        let sql = change_source(&o, &mysql8());
        assert!(sql.starts_with("CHANGE REPLICATION SOURCE TO SOURCE_HOST='db2'"));
        assert!(sql.contains("SOURCE_AUTO_POSITION=1"));
        assert!(sql.ends_with("FOR CHANNEL 'c1'"));
    }

    #[test]
    fn change_master_positional() {
        let o = ChangeSourceOptions::new("db2", 3306, ReplicationMode::Positional).position("bin.000004", 1234);
        let sql = change_source(&o, &mariadb());
        assert!(sql.contains("MASTER_USE_GTID=no"));
        assert!(sql.contains("MASTER_LOG_FILE='bin.000004', MASTER_LOG_POS=1234"));
    }

    #[test]
    fn replica_commands_by_flavor() {
        assert_eq!(start_replica("", &mariadb()), "START SLAVE");
        assert_eq!(stop_replica("c1", &mariadb()), "STOP SLAVE 'c1'");
        assert_eq!(reset_replica("", true, &mariadb()), "RESET SLAVE ALL");
        assert_eq!(start_replica("c1", &mysql8()), "START REPLICA FOR CHANNEL 'c1'");
        assert_eq!(
            start_replica("", &DbVersion::new(Flavor::MySQL, 5, 7, 40)),
            "START SLAVE"
        );
    }

    #[test]
    fn quoting_escapes() {
        assert_eq!(quote("it's"), "'it\\'s'");
        assert_eq!(set_global("gtid_strict_mode", "ON"), "SET GLOBAL gtid_strict_mode=ON");
        assert_eq!(set_global("binlog_format", "ROW"), "SET GLOBAL binlog_format='ROW'");
        assert_eq!(set_global("sync_binlog", "1"), "SET GLOBAL sync_binlog=1");
    }

    #[test]
    fn wait_results() {
        assert!(wait_succeeded(Some(0), false));
        assert!(!wait_succeeded(Some(1), false));
        assert!(!wait_succeeded(Some(-1), false));
        assert!(wait_succeeded(Some(12), true));
        assert!(!wait_succeeded(Some(-1), true));
        assert!(!wait_succeeded(None, true));
    }

    #[test]
    fn parses_mariadb_status_row() {
        let row: HashMap<String, String> = [
            ("Connection_name", ""),
            ("Master_Host", "db1"),
            ("Master_Port", "3306"),
            ("Master_Server_Id", "1"),
            ("Master_Log_File", "bin.000004"),
            ("Read_Master_Log_Pos", "900"),
            ("Relay_Master_Log_File", "bin.000004"),
            ("Exec_Master_Log_Pos", "900"),
            ("Slave_IO_Running", "Yes"),
            ("Slave_SQL_Running", "Yes"),
            ("Seconds_Behind_Master", "0"),
            ("Using_Gtid", "Slave_Pos"),
            ("Gtid_IO_Pos", "0-1-42"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let r = parse_replication_row(&row, &mariadb());
        assert_eq!(r.source_endpoint(), "db1:3306");
        assert!(r.threads_running());
        assert!(r.uses_gtid());
        assert_eq!(r.seconds_behind_master, Some(0));
        assert_eq!(r.gtid_io_pos.seq_for_server(1), 42);
        assert!(r.relay_drained());
    }

    #[test]
    fn null_delay_parses_as_none() {
        let row: HashMap<String, String> = [("Source_Host", "db1"), ("Seconds_Behind_Source", "")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let r = parse_replication_row(&row, &mysql8());
        assert_eq!(r.master_host, "db1");
        assert_eq!(r.seconds_behind_master, None);
        assert_eq!(r.using_gtid, "No");
    }
}
