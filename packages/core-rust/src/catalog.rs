//! Error and warning catalog.
//!
//! Every operational problem the control plane can report is identified by a
//! stable code (`ERR000NN` or `WARN00NN`). The catalog maps each code to its
//! severity, the subsystem that raises it by default, and a message template
//! whose `{}` placeholders are filled positionally by [`render`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a state entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrType {
    Error,
    Warning,
}

impl fmt::Display for ErrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Error => "ERROR",
            Self::Warning => "WARNING",
        })
    }
}

/// Subsystem that raised a state entry. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrFrom {
    Topo,
    Mon,
    Net,
    Conf,
    Job,
    Prx,
    Arb,
    Rejoin,
    Purge,
    Check,
    Security,
}

impl fmt::Display for ErrFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Topo => "TOPO",
            Self::Mon => "MON",
            Self::Net => "NET",
            Self::Conf => "CONF",
            Self::Job => "JOB",
            Self::Prx => "PRX",
            Self::Arb => "ARB",
            Self::Rejoin => "REJOIN",
            Self::Purge => "PURGE",
            Self::Check => "CHECK",
            Self::Security => "SECURITY",
        })
    }
}

/// One catalog row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub code: &'static str,
    pub err_type: ErrType,
    pub from: ErrFrom,
    pub template: &'static str,
}

const fn entry(
    code: &'static str,
    err_type: ErrType,
    from: ErrFrom,
    template: &'static str,
) -> CatalogEntry {
    CatalogEntry {
        code,
        err_type,
        from,
        template,
    }
}

use ErrFrom::{Arb, Check, Conf, Job, Mon, Net, Prx, Purge, Rejoin, Security, Topo};
use ErrType::{Error, Warning};

/// The catalog, sorted by code.
pub static CATALOG: &[CatalogEntry] = &[
    entry("ERR00001", Warning, Check, "Monitor is already in failover, skipping failover check"),
    entry("ERR00002", Error, Check, "Interactive mode, failover must be triggered manually"),
    entry("ERR00004", Error, Mon, "Database {} access denied: {}"),
    entry("ERR00005", Error, Conf, "Could not get privileges for user {} on server {}: {}"),
    entry("ERR00006", Error, Conf, "User must have REPLICATION CLIENT privilege"),
    entry("ERR00007", Error, Conf, "User must have REPLICATION SLAVE privilege"),
    entry("ERR00008", Error, Conf, "User must have SUPER privilege"),
    entry("ERR00009", Error, Conf, "User must have RELOAD privilege"),
    entry("ERR00010", Error, Topo, "Could not find a slave in topology"),
    entry("ERR00011", Warning, Topo, "Found multiple masters in topology, switching to multi-master monitoring"),
    entry("ERR00012", Error, Topo, "Could not find a master in topology"),
    entry("ERR00013", Error, Topo, "Binary log disabled on slave: {}"),
    entry("ERR00014", Error, Conf, "Could not get binlog dump count on server {}: {}"),
    entry("ERR00016", Error, Net, "Master is unreachable but slaves are replicating"),
    entry("ERR00017", Error, Prx, "Unable to fetch MaxScale monitoring information"),
    entry("ERR00018", Error, Prx, "Could not connect to MaxScale: {}"),
    entry("ERR00019", Error, Prx, "Could not get MaxScale server list: {}"),
    entry("ERR00021", Error, Topo, "All cluster down in non-interactive mode"),
    entry("ERR00022", Error, Check, "Running in passive mode"),
    entry("ERR00023", Error, Check, "Constraint is blocking state {}, interactive: {}, max fail reached: {}"),
    entry("ERR00026", Error, Check, "First node restarted is a slave, non-interactive mode"),
    entry("ERR00027", Error, Check, "Number of cluster failovers exceeded"),
    entry("ERR00028", Error, Check, "Slave {} can still communicate with the master"),
    entry("ERR00029", Error, Check, "Time between failovers too short"),
    entry("ERR00030", Error, Check, "MaxScale {} can still communicate with the master"),
    entry("ERR00032", Error, Check, "No candidates found in slaves list"),
    entry("ERR00033", Warning, Check, "Skip slave in election {}: no master log file, slave might have failed"),
    entry("ERR00034", Warning, Check, "Skip slave in election {}: replication not electable for switchover"),
    entry("ERR00035", Warning, Check, "Skip slave in election {}: multi-master and already the master"),
    entry("ERR00036", Warning, Check, "Skip slave in election {}: is relay"),
    entry("ERR00037", Warning, Check, "Skip slave in election {}: in ignore list"),
    entry("ERR00038", Warning, Check, "Skip slave in election {}: replication not electable for failover"),
    entry("ERR00040", Warning, Check, "Skip slave in election {}: does not ping or has no binlogs"),
    entry("ERR00041", Warning, Check, "Skip slave in election {}: more than {} seconds of replication delay ({})"),
    entry("ERR00042", Warning, Check, "Skip slave in election {}: SQL thread is stopped"),
    entry("ERR00043", Warning, Check, "Skip slave in election {}: semi-sync reports unsynced"),
    entry("ERR00045", Warning, Topo, "Replica {} replicates through relay {}, moving it under the master"),
    entry("ERR00046", Warning, Topo, "Replica {} is delayed, not moving it off relay {}"),
    entry("ERR00048", Error, Topo, "Multi-master ring is broken, no virtual master found"),
    entry("ERR00049", Error, Topo, "Waiting for old master {} to rejoin before positional switch of {}"),
    entry("ERR00050", Error, Rejoin, "Could not persist crash log: {}"),
    entry("ERR00056", Error, Security, "User {} on the master is missing on server {}"),
    entry("ERR00060", Warning, Job, "Too many queued jobs on {}, oldest entries purged"),
    entry("ERR00063", Error, Topo, "Extra master {} found in master-slave topology, not rejoining it"),
    entry("ERR00064", Error, Topo, "Server {} replicates from {} instead of the cluster master {}"),
    entry("ERR00066", Error, Rejoin, "No rejoin method applies to {}, crash info missing or all methods disabled"),
    entry("ERR00069", Warning, Prx, "ProxySQL could not set {} as reader: {}"),
    entry("ERR00070", Warning, Prx, "ProxySQL could not set {} as writer: {}"),
    entry("ERR00072", Warning, Prx, "ProxySQL could not set {} offline: {}"),
    entry("ERR00077", Error, Topo, "All databases state down"),
    entry("ERR00080", Error, Conf, "Servers {} and {} share the same server_id {}"),
    entry("ERR00086", Warning, Prx, "Proxy {} could not rotate credentials: {}"),
    entry("ERR00090", Error, Security, "Cluster replication is not all up, credentials rotation cancelled"),
    entry("WARN0003", Warning, Topo, "RW server count > 1 in multi-master mode, switching to preferred master"),
    entry("WARN0004", Warning, Topo, "RO server count > 1 in multi-master mode, switching to preferred master"),
    entry("WARN0006", Warning, Topo, "No preferred master to promote in multi-master mode"),
    entry("WARN0007", Warning, Conf, "At least one server is not ACID-compliant, sync_binlog and innodb_flush_log_at_trx_commit must be 1"),
    entry("WARN0023", Warning, Check, "Master failure count reached max fail"),
    entry("WARN0048", Warning, Topo, "No semi-sync settings on slave {}"),
    entry("WARN0049", Warning, Topo, "No binlog format ROW on slave {} and flashback activated"),
    entry("WARN0050", Warning, Topo, "No heartbeat <= 1s on slave {}"),
    entry("WARN0051", Warning, Topo, "No GTID replication on slave {}"),
    entry("WARN0052", Warning, Topo, "No InnoDB durability on slave {}"),
    entry("WARN0053", Warning, Topo, "No replication checksum on slave {}"),
    entry("WARN0054", Warning, Topo, "No log of replication queries in slow query log on slave {}"),
    entry("WARN0055", Warning, Topo, "ROW replication without annotate on slave {}"),
    entry("WARN0056", Warning, Topo, "No compression of binlog on slave {}"),
    entry("WARN0057", Warning, Topo, "No log-slave-updates on slave {}"),
    entry("WARN0058", Warning, Topo, "No GTID strict mode on slave {}"),
    entry("WARN0060", Warning, Topo, "No semi-sync settings on master {}"),
    entry("WARN0061", Warning, Topo, "No binlog format ROW on master {} and flashback activated"),
    entry("WARN0062", Warning, Topo, "No durability of binlog on master {}"),
    entry("WARN0064", Warning, Topo, "No InnoDB durability on master {}"),
    entry("WARN0065", Warning, Topo, "No replication checksum on master {}"),
    entry("WARN0067", Warning, Topo, "ROW replication without annotate on master {}"),
    entry("WARN0068", Warning, Topo, "No compression of binlog on master {}"),
    entry("WARN0069", Warning, Topo, "No log-slave-updates on master {}"),
    entry("WARN0070", Warning, Topo, "No GTID strict mode on master {}"),
    entry("WARN0072", Warning, Job, "Optimize job in queue on {}"),
    entry("WARN0073", Warning, Job, "Backup {} job in queue on {}"),
    entry("WARN0074", Warning, Job, "Reseed {} job in queue on {}"),
    entry("WARN0075", Warning, Job, "Reseed {} job in queue on {}"),
    entry("WARN0076", Warning, Job, "Flashback {} job in queue on {}"),
    entry("WARN0077", Warning, Job, "Flashback {} job in queue on {}"),
    entry("WARN0078", Warning, Prx, "HAProxy stats could not be parsed: {}"),
    entry("WARN0079", Warning, Arb, "Arbitration: cluster is in split brain"),
    entry("WARN0080", Warning, Arb, "Arbitration: cluster lost majority, failover disabled"),
    entry("WARN0090", Warning, Arb, "Arbitration: arbitrator {} failed"),
    entry("WARN0096", Warning, Job, "Restart job in queue on {}"),
    entry("WARN0097", Warning, Job, "Stop job in queue on {}"),
    entry("WARN0105", Warning, Prx, "Reconciliation drift on {}: {}"),
    entry("WARN0106", Warning, Purge, "Binlog purge skipped: fewer than {} replicas connected"),
    entry("WARN0107", Warning, Prx, "Proxy {}: backend {} set ready after recovery"),
    entry("WARN0108", Warning, Prx, "Proxy {}: backend {} set in maintenance"),
    entry("WARN0109", Warning, Prx, "Proxy {}: backend {} leaves maintenance"),
    entry("WARN0110", Warning, Prx, "Proxy {}: write backend repointed to master {}"),
    entry("WARN0111", Warning, Prx, "Proxy {}: runtime command failed: {}"),
    entry("WARN0112", Warning, Prx, "Proxy {}: backend {} state changes muted after repeated drift"),
];

/// Looks up a code in the catalog.
#[must_use]
pub fn lookup(code: &str) -> Option<&'static CatalogEntry> {
    CATALOG
        .binary_search_by(|e| e.code.cmp(code))
        .ok()
        .map(|i| &CATALOG[i])
}

/// Substitutes each `{}` in `template` with the next argument.
///
/// Missing arguments render as empty strings; extra arguments are ignored.
///
/// # Examples
///
/// ```
/// use repman_core::catalog::render;
///
/// assert_eq!(render("Slave {} is late by {}s", &[&"db2", &12]), "Slave db2 is late by 12s");
/// ```
#[must_use]
pub fn render(template: &str, args: &[&dyn fmt::Display]) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;
    let mut args = args.iter();
    while let Some(pos) = rest.find("{}") {
        out.push_str(&rest[..pos]);
        if let Some(a) = args.next() {
            out.push_str(&a.to_string());
        }
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_sorted_and_unique() {
        for pair in CATALOG.windows(2) {
            assert!(pair[0].code < pair[1].code, "{} >= {}", pair[0].code, pair[1].code);
        }
    }

    #[test]
    fn every_entry_has_a_message() {
        for e in CATALOG {
            assert!(!e.template.trim().is_empty(), "{} has no message", e.code);
        }
    }

    #[test]
    fn lookup_known_codes() {
        let e = lookup("ERR00021").unwrap();
        assert_eq!(e.err_type, ErrType::Error);
        assert_eq!(e.from, ErrFrom::Topo);
        assert_eq!(lookup("WARN0080").unwrap().from, ErrFrom::Arb);
        assert!(lookup("ERR99999").is_none());
    }

    #[test]
    fn render_fills_placeholders_in_order() {
        assert_eq!(
            render("{} and {} share {}", &[&"a", &"b", &7]),
            "a and b share 7"
        );
        assert_eq!(render("no args {}", &[]), "no args ");
        assert_eq!(render("plain", &[&1]), "plain");
    }
}
