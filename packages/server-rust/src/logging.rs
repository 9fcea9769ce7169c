//! Tracing bootstrap and the shared SQL logger.
//!
//! Every component logs under a `repman::<module>` target so operators can
//! filter with directives such as `repman::failover=debug`.

use std::sync::LazyLock;

use regex::Regex;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

pub const TOPOLOGY: &str = "repman::topology";
pub const FAILOVER: &str = "repman::failover";
pub const REJOIN: &str = "repman::rejoin";
pub const MONITOR: &str = "repman::monitor";
pub const PROXY: &str = "repman::proxy";
pub const HAPROXY: &str = "repman::haproxy";
pub const PROXYSQL: &str = "repman::proxysql";
pub const JOB: &str = "repman::job";
pub const PURGE: &str = "repman::purge";
pub const BINLOG: &str = "repman::binlog";
pub const SQL: &str = "repman::sql";
pub const ARBITRATION: &str = "repman::arbitration";

/// Installs the global subscriber.
///
/// The default directive comes from `config.level`; `RUST_LOG` overrides it.
///
/// # Errors
///
/// Fails when the directive does not parse or a subscriber is already set.
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directive) if !directive.is_empty() => EnvFilter::try_new(directive)?,
        _ => EnvFilter::try_new(&config.level)?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.json {
        builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("tracing init: {e}"))
    } else {
        builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("tracing init: {e}"))
    }
}

static PASSWORD_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)((?:MASTER|SOURCE)_PASSWORD\s*=\s*|IDENTIFIED BY\s+|PASSWORD\s*\(\s*)'[^']*'")
        .unwrap_or_else(|_| unreachable!("static regex"))
});

/// Replaces password literals in a statement with `'XXXX'`.
#[must_use]
pub fn mask_password(sql: &str) -> String {
    PASSWORD_CLAUSE.replace_all(sql, "${1}'XXXX'").into_owned()
}

/// Logs a statement against `url`, with its error when it failed.
pub fn log_sql(url: &str, sql: &str, result: Result<(), &dyn std::fmt::Display>) {
    let sql = mask_password(sql);
    match result {
        Ok(()) => tracing::debug!(target: SQL, server = url, sql = %sql, "statement ok"),
        Err(e) => tracing::error!(target: SQL, server = url, sql = %sql, error = %e, "statement failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_change_source_password() {
        let sql = "CHANGE MASTER TO MASTER_HOST='db2', MASTER_USER='repl', MASTER_PASSWORD='s3cret'";
        let masked = mask_password(sql);
        assert!(!masked.contains("s3cret"));
        assert!(masked.contains("MASTER_PASSWORD='XXXX'"));
        assert!(masked.contains("MASTER_USER='repl'"));
    }

    #[test]
    fn masks_identified_by() {
        let masked = mask_password("ALTER USER 'u'@'%' IDENTIFIED BY 'pw'");
        assert_eq!(masked, "ALTER USER 'u'@'%' IDENTIFIED BY 'XXXX'");
    }

    #[test]
    fn leaves_plain_statements_alone() {
        assert_eq!(mask_password("STOP SLAVE"), "STOP SLAVE");
    }

    proptest::proptest! {
        #[test]
        fn masked_statements_never_leak(pw in "[a-zA-Z0-9]{6,24}") {
            let sql = format!("CHANGE MASTER TO MASTER_HOST='db', MASTER_PASSWORD='{pw}', MASTER_USE_GTID=slave_pos");
            let masked = mask_password(&sql);
            let quoted = format!("'{pw}'");
            proptest::prop_assert!(!masked.contains(&quoted));
            proptest::prop_assert!(masked.ends_with("MASTER_USE_GTID=slave_pos"));
        }
    }
}
