//! CRC64 utilities for minting stable identifiers.
//!
//! Every identifier the control plane hands out (database nodes, proxies,
//! MySQL GTID source UUIDs) is derived from a 64-bit CRC over a canonical
//! string, rendered in decimal. The polynomial is CRC-64/ECMA-182 in its
//! reflected form with inverted init and output (`CRC-64/XZ`), which keeps
//! identifiers stable across restarts and across tools that share the table.

use crc::{Crc, CRC_64_XZ};

/// Shared CRC64 table used for every identifier.
pub const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Computes the CRC64 checksum of `data`.
///
/// # Examples
///
/// ```
/// use repman_core::hash::crc64;
///
/// assert_eq!(crc64(b"123456789"), 0x995d_c9bb_df19_39fa);
/// assert_eq!(crc64(b""), 0);
/// ```
#[must_use]
pub fn crc64(data: &[u8]) -> u64 {
    CRC64.checksum(data)
}

/// Stable identifier of a database node: `"s" + crc64(cluster + host + ":" + port)`.
///
/// # Examples
///
/// ```
/// use repman_core::hash::{crc64, server_id};
///
/// let id = server_id("cl1", "db1", 3306);
/// assert_eq!(id, format!("s{}", crc64(b"cl1db1:3306")));
/// ```
#[must_use]
pub fn server_id(cluster: &str, host: &str, port: u16) -> String {
    format!("s{}", crc64(format!("{cluster}{host}:{port}").as_bytes()))
}

/// Stable identifier of a proxy: `"px" + crc64(cluster + name + ":" + write_port)`.
#[must_use]
pub fn proxy_id(cluster: &str, name: &str, write_port: u16) -> String {
    format!("px{}", crc64(format!("{cluster}{name}:{write_port}").as_bytes()))
}

/// Checksum of a replication endpoint (`host` followed by `port`).
///
/// Used to match a replica's configured source against the node list when
/// the source cannot be reached and its `server_id` is unknown.
#[must_use]
pub fn endpoint_checksum(host: &str, port: u16) -> u64 {
    crc64(format!("{host}{port}").as_bytes())
}

/// Maps a MySQL server UUID onto a numeric server id.
///
/// MySQL GTIDs are keyed by source UUID rather than by numeric
/// `server_id`; the UUID is upper-cased before hashing so the mapping is
/// independent of how the server printed it.
#[must_use]
pub fn uuid_server_id(uuid: &str) -> u64 {
    crc64(uuid.to_ascii_uppercase().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc64_check_value() {
        assert_eq!(crc64(b"123456789"), 0x995d_c9bb_df19_39fa);
    }

    #[test]
    fn server_id_is_deterministic() {
        assert_eq!(server_id("c", "h", 3306), server_id("c", "h", 3306));
        assert_ne!(server_id("c", "h", 3306), server_id("c", "h", 3307));
        assert_ne!(server_id("c1", "h", 3306), server_id("c2", "h", 3306));
        assert!(server_id("c", "h", 3306).starts_with('s'));
    }

    #[test]
    fn proxy_id_prefix() {
        let id = proxy_id("c", "haproxy1", 3306);
        assert!(id.starts_with("px"));
        assert!(id[2..].parse::<u64>().is_ok());
    }

    #[test]
    fn uuid_case_insensitive() {
        let lower = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
        assert_eq!(uuid_server_id(lower), uuid_server_id(&lower.to_uppercase()));
    }
}
