//! Database server version and derived capabilities.
//!
//! Capabilities are pure functions of the flavor and version numbers; the
//! monitor combines them with live variables to decide which statements a
//! server understands.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Server flavor as reported by `version` / `version_comment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Flavor {
    MariaDB,
    #[default]
    MySQL,
    Percona,
    PostgreSQL,
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MariaDB => "MariaDB",
            Self::MySQL => "MySQL",
            Self::Percona => "Percona",
            Self::PostgreSQL => "PostgreSQL",
        })
    }
}

/// `{Flavor, Major, Minor, Release}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbVersion {
    pub flavor: Flavor,
    pub major: u32,
    pub minor: u32,
    pub release: u32,
}

impl DbVersion {
    #[must_use]
    pub fn new(flavor: Flavor, major: u32, minor: u32, release: u32) -> Self {
        Self {
            flavor,
            major,
            minor,
            release,
        }
    }

    /// Parses the `version` and `version_comment` variables.
    ///
    /// # Examples
    ///
    /// ```
    /// use repman_core::version::{DbVersion, Flavor};
    ///
    /// let v = DbVersion::parse("10.11.6-MariaDB-log", "MariaDB Server");
    /// assert_eq!(v, DbVersion::new(Flavor::MariaDB, 10, 11, 6));
    /// let pg = DbVersion::parse("PostgreSQL 15.4 on x86_64", "");
    /// assert_eq!(pg.flavor, Flavor::PostgreSQL);
    /// assert_eq!(pg.major, 15);
    /// ```
    #[must_use]
    pub fn parse(version: &str, comment: &str) -> Self {
        let flavor = if version.contains("MariaDB") || comment.contains("MariaDB") {
            Flavor::MariaDB
        } else if version.contains("PostgreSQL") || comment.contains("PostgreSQL") {
            Flavor::PostgreSQL
        } else if comment.contains("Percona") {
            Flavor::Percona
        } else {
            Flavor::MySQL
        };
        let numeric = if flavor == Flavor::PostgreSQL {
            version.split_whitespace().nth(1).unwrap_or_default()
        } else {
            version.split('-').next().unwrap_or_default()
        };
        let mut tokens = numeric
            .split('.')
            .map(|t| t.trim().parse::<u32>().unwrap_or(0));
        Self {
            flavor,
            major: tokens.next().unwrap_or(0),
            minor: tokens.next().unwrap_or(0),
            release: tokens.next().unwrap_or(0),
        }
    }

    #[must_use]
    pub fn is_mariadb(&self) -> bool {
        self.flavor == Flavor::MariaDB
    }

    #[must_use]
    pub fn is_mysql(&self) -> bool {
        self.flavor == Flavor::MySQL
    }

    #[must_use]
    pub fn is_percona(&self) -> bool {
        self.flavor == Flavor::Percona
    }

    #[must_use]
    pub fn is_mysql_or_percona(&self) -> bool {
        matches!(self.flavor, Flavor::MySQL | Flavor::Percona)
    }

    #[must_use]
    pub fn is_postgres(&self) -> bool {
        self.flavor == Flavor::PostgreSQL
    }

    /// Version triple comparison, flavor ignored.
    #[must_use]
    pub fn cmp_numbers(&self, major: u32, minor: u32, release: u32) -> Ordering {
        (self.major, self.minor, self.release).cmp(&(major, minor, release))
    }

    #[must_use]
    pub fn at_least(&self, major: u32, minor: u32, release: u32) -> bool {
        self.cmp_numbers(major, minor, release) != Ordering::Less
    }

    /// Domain-server-seq GTIDs (MariaDB 10.0+).
    #[must_use]
    pub fn has_mariadb_gtid(&self) -> bool {
        self.is_mariadb() && self.at_least(10, 0, 0)
    }

    /// UUID-based GTIDs (MySQL / Percona 5.6+).
    #[must_use]
    pub fn has_mysql_gtid(&self) -> bool {
        self.is_mysql_or_percona() && self.at_least(5, 6, 0)
    }

    /// `MASTER_AUTO_POSITION` re-attachment (MySQL / Percona 5.7+).
    #[must_use]
    pub fn has_auto_position(&self) -> bool {
        self.is_mysql_or_percona() && self.at_least(5, 7, 0)
    }

    #[must_use]
    pub fn has_super_read_only(&self) -> bool {
        self.is_mysql_or_percona() && self.at_least(5, 7, 8)
    }

    /// `CHANGE REPLICATION SOURCE TO` and `START REPLICA` (MySQL 8.0.23+).
    #[must_use]
    pub fn has_source_syntax(&self) -> bool {
        self.is_mysql_or_percona() && self.at_least(8, 0, 23)
    }

    /// Semi-sync compiled into the server rather than loaded as a plugin.
    #[must_use]
    pub fn has_builtin_semisync(&self) -> bool {
        self.is_mariadb() && self.at_least(10, 3, 3)
    }

    /// Name of the variable that enables semi-sync on the source side.
    #[must_use]
    pub fn semisync_master_variable(&self) -> &'static str {
        if self.is_mysql_or_percona() && self.at_least(8, 0, 26) {
            "rpl_semi_sync_source_enabled"
        } else {
            "rpl_semi_sync_master_enabled"
        }
    }

    /// Name of the variable that enables semi-sync on the replica side.
    #[must_use]
    pub fn semisync_slave_variable(&self) -> &'static str {
        if self.is_mysql_or_percona() && self.at_least(8, 0, 26) {
            "rpl_semi_sync_replica_enabled"
        } else {
            "rpl_semi_sync_slave_enabled"
        }
    }

    #[must_use]
    pub fn has_clone_plugin(&self) -> bool {
        self.is_mysql_or_percona() && self.at_least(8, 0, 17)
    }

    #[must_use]
    pub fn has_binlog_compress(&self) -> bool {
        self.is_mariadb() && self.at_least(10, 2, 0)
    }

    /// `mysqlbinlog --flashback` availability.
    #[must_use]
    pub fn has_flashback(&self) -> bool {
        self.is_mariadb() && self.at_least(10, 2, 4)
    }

    /// Size-bounded binlog retention via `max_binlog_total_size`.
    #[must_use]
    pub fn has_binlog_total_size(&self) -> bool {
        self.is_mariadb() && self.at_least(11, 4, 0)
    }
}

impl fmt::Display for DbVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.{}.{}", self.flavor, self.major, self.minor, self.release)
    }
}
