//! Connection strings and endpoint parsing.

use std::time::Duration;

use super::{DbTarget, TlsChoice};
use crate::config::{ClusterConfig, DatabaseKind};

/// Splits `host[:port][/db]` (IPv6 hosts in brackets) into host and port.
///
/// The default port is 3306 for MySQL and 5432 for PostgreSQL.
#[must_use]
pub fn split_url(url: &str, kind: DatabaseKind) -> (String, u16) {
    let default_port = match kind {
        DatabaseKind::Mysql => 3306,
        DatabaseKind::Postgres => 5432,
    };
    let endpoint = url.split('/').next().unwrap_or(url);
    if let Some(rest) = endpoint.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            (host.to_string(), port.parse().unwrap_or(default_port))
        }
        _ => (endpoint.to_string(), default_port),
    }
}

/// Canonical `host:port` URL.
#[must_use]
pub fn join_url(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Target for a node of the cluster with the monitoring credentials.
#[must_use]
pub fn target_for(config: &ClusterConfig, host: &str, port: u16, tls: TlsChoice) -> DbTarget {
    DbTarget {
        url: join_url(host, port),
        host: host.to_string(),
        port,
        user: config.db_user.clone(),
        password: config.db_password.clone(),
        tls: if config.tls.is_some() { tls } else { TlsChoice::Disabled },
        connect_timeout: config.connect_timeout(),
        read_timeout: config.read_timeout(),
        max_lifetime: Duration::from_secs(config.timeouts.conn_max_lifetime_secs),
    }
}

/// Go-driver style MySQL DSN, as handed to node-side tools.
#[must_use]
pub fn mysql_dsn(target: &DbTarget) -> String {
    let mut dsn = format!(
        "{}:{}@tcp({})/?timeout={}s&readTimeout={}s",
        target.user,
        target.password,
        join_url(&target.host, target.port),
        target.connect_timeout.as_secs(),
        target.read_timeout.as_secs(),
    );
    match target.tls {
        TlsChoice::Disabled => {}
        TlsChoice::Current => dsn.push_str("&tls=current"),
        TlsChoice::Old => dsn.push_str("&tls=old"),
    }
    dsn
}

/// libpq keyword/value connection string.
#[must_use]
pub fn postgres_dsn(target: &DbTarget, dbname: &str) -> String {
    let sslmode = if target.tls == TlsChoice::Disabled {
        "disable"
    } else {
        "enable"
    };
    format!(
        "sslmode={sslmode} host={} port={} user={} dbname={} connect_timeout={} password={}",
        target.host,
        target.port,
        target.user,
        dbname,
        target.connect_timeout.as_secs(),
        target.password,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_urls() {
        assert_eq!(split_url("db1:3307", DatabaseKind::Mysql), ("db1".into(), 3307));
        assert_eq!(split_url("db1", DatabaseKind::Mysql), ("db1".into(), 3306));
        assert_eq!(split_url("db1/app", DatabaseKind::Postgres), ("db1".into(), 5432));
        assert_eq!(split_url("[::1]:3310", DatabaseKind::Mysql), ("::1".into(), 3310));
        assert_eq!(join_url("::1", 3310), "[::1]:3310");
    }

    #[test]
    fn mysql_dsn_carries_timeouts_and_tls() {
        let config = ClusterConfig {
            db_user: "root".into(),
            db_password: "pw".into(),
            ..ClusterConfig::default()
        };
        let mut t = target_for(&config, "db1", 3306, TlsChoice::Current);
        assert_eq!(t.tls, TlsChoice::Disabled);
        assert_eq!(mysql_dsn(&t), "root:pw@tcp(db1:3306)/?timeout=5s&readTimeout=15s");
        t.tls = TlsChoice::Old;
        assert!(mysql_dsn(&t).ends_with("&tls=old"));
    }

    #[test]
    fn postgres_dsn_fields() {
        let config = ClusterConfig {
            db_user: "postgres".into(),
            db_password: "pw".into(),
            ..ClusterConfig::default()
        };
        let t = target_for(&config, "pg1", 5432, TlsChoice::Disabled);
        assert_eq!(
            postgres_dsn(&t, "postgres"),
            "sslmode=disable host=pg1 port=5432 user=postgres dbname=postgres connect_timeout=5 password=pw"
        );
    }
}
