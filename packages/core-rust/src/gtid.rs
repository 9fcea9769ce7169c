//! Global transaction identifier sets.
//!
//! MariaDB renders a GTID position as a comma-separated list of
//! `domain-server-seq` triples. MySQL renders executed sets as
//! `uuid:lo-hi[:lo-hi...]`; those are folded onto the same shape by hashing
//! the source UUID into a numeric server id (see [`crate::hash::uuid_server_id`])
//! and keeping the highest sequence number, domain 0.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::hash::uuid_server_id;

/// Errors produced while parsing GTID text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GtidError {
    #[error("malformed gtid '{0}': expected domain-server-seq")]
    Malformed(String),
    #[error("malformed mysql gtid '{0}': expected uuid:interval")]
    MalformedMySql(String),
}

/// One `(domain, server) -> seq` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gtid {
    pub domain_id: u32,
    pub server_id: u64,
    pub seq_no: u64,
}

impl Gtid {
    #[must_use]
    pub fn new(domain_id: u32, server_id: u64, seq_no: u64) -> Self {
        Self {
            domain_id,
            server_id,
            seq_no,
        }
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.seq_no)
    }
}

impl FromStr for Gtid {
    type Err = GtidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut parts = s.splitn(3, '-');
        let (Some(d), Some(srv), Some(seq)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(GtidError::Malformed(s.to_string()));
        };
        let bad = |_| GtidError::Malformed(s.to_string());
        Ok(Self {
            domain_id: d.parse().map_err(bad)?,
            server_id: srv.parse().map_err(bad)?,
            seq_no: seq.parse().map_err(bad)?,
        })
    }
}

// ---------------------------------------------------------------------------
// GtidList
// ---------------------------------------------------------------------------

/// An ordered GTID position (one entry per domain/server pair).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GtidList(Vec<Gtid>);

impl GtidList {
    #[must_use]
    pub fn new(entries: Vec<Gtid>) -> Self {
        Self(entries)
    }

    /// Parses a MariaDB position such as `0-1-100,1-2-7`. Empty input yields
    /// an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`GtidError::Malformed`] when any element is not a triple of
    /// unsigned integers.
    pub fn parse(s: &str) -> Result<Self, GtidError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }
        s.split(',')
            .filter(|p| !p.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Parses a MySQL executed set such as
    /// `3E11FA47-71CA-11E1-9E33-C80AA9429562:1-5,`. Line breaks and spaces,
    /// which MySQL inserts into long sets, are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`GtidError::MalformedMySql`] when an element lacks an interval.
    pub fn parse_mysql(s: &str) -> Result<Self, GtidError> {
        let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        if cleaned.is_empty() {
            return Ok(Self::default());
        }
        let mut out = Vec::new();
        for item in cleaned.split(',').filter(|p| !p.is_empty()) {
            let mut fields = item.split(':');
            let uuid = fields.next().unwrap_or_default();
            let last = fields
                .last()
                .ok_or_else(|| GtidError::MalformedMySql(item.to_string()))?;
            let upper = last.rsplit('-').next().unwrap_or(last);
            let seq_no = upper
                .parse()
                .map_err(|_| GtidError::MalformedMySql(item.to_string()))?;
            out.push(Gtid::new(0, uuid_server_id(uuid), seq_no));
        }
        Ok(Self(out))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gtid> {
        self.0.iter()
    }

    #[must_use]
    pub fn domain_ids(&self) -> Vec<u32> {
        self.0.iter().map(|g| g.domain_id).collect()
    }

    #[must_use]
    pub fn server_ids(&self) -> Vec<u64> {
        self.0.iter().map(|g| g.server_id).collect()
    }

    #[must_use]
    pub fn seq_nos(&self) -> Vec<u64> {
        self.0.iter().map(|g| g.seq_no).collect()
    }

    /// Sequence numbers recorded for one replication domain.
    #[must_use]
    pub fn seq_for_domain(&self, domain_id: u32) -> Vec<u64> {
        self.0
            .iter()
            .filter(|g| g.domain_id == domain_id)
            .map(|g| g.seq_no)
            .collect()
    }

    /// Sequence number of the first entry written by `server_id`, or 0.
    #[must_use]
    pub fn seq_for_server(&self, server_id: u64) -> u64 {
        self.0
            .iter()
            .find(|g| g.server_id == server_id)
            .map_or(0, |g| g.seq_no)
    }

    /// Whether any entry was written by `server_id`.
    #[must_use]
    pub fn has_server(&self, server_id: u64) -> bool {
        self.0.iter().any(|g| g.server_id == server_id)
    }

    /// Sum of all sequence numbers, the ranking key used when electing a
    /// candidate among replicas of the same source.
    #[must_use]
    pub fn seq_sum(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, g| acc.saturating_add(g.seq_no))
    }

    /// Returns a copy sorted by `(domain, server)`.
    #[must_use]
    pub fn sorted(&self) -> Self {
        let mut v = self.0.clone();
        v.sort_by_key(|g| (g.domain_id, g.server_id));
        Self(v)
    }

    /// Positions are equivalent when, once sorted, `self` equals `other` or
    /// is a leading prefix of it.
    #[must_use]
    pub fn equivalent(&self, other: &Self) -> bool {
        let a = self.sorted().to_string();
        let b = other.sorted().to_string();
        a == b || format!("{b},").contains(&format!("{a},"))
    }

    /// True when no entry of `self` is ahead of the matching
    /// `(domain, server)` entry of `other`. Entries missing from `other`
    /// count as ahead unless their sequence is 0.
    #[must_use]
    pub fn is_behind_or_equal(&self, other: &Self) -> bool {
        self.0.iter().all(|g| {
            let theirs = other
                .0
                .iter()
                .filter(|o| o.domain_id == g.domain_id && o.server_id == g.server_id)
                .map(|o| o.seq_no)
                .max()
                .unwrap_or(0);
            g.seq_no <= theirs
        })
    }
}

impl fmt::Display for GtidList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, g) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{g}")?;
        }
        Ok(())
    }
}

impl FromStr for GtidList {
    type Err = GtidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Vec<Gtid>> for GtidList {
    fn from(v: Vec<Gtid>) -> Self {
        Self(v)
    }
}

impl Serialize for GtidList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GtidList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parse_mariadb_list() {
        let l = GtidList::parse("0-1-100,1-2-7").unwrap();
        assert_eq!(l.len(), 2);
        assert_eq!(l.seq_for_server(1), 100);
        assert_eq!(l.seq_for_server(2), 7);
        assert_eq!(l.seq_for_server(3), 0);
        assert_eq!(l.seq_for_domain(1), vec![7]);
        assert_eq!(l.seq_sum(), 107);
        assert_eq!(l.to_string(), "0-1-100,1-2-7");
    }

    #[test]
    fn parse_empty_and_malformed() {
        assert!(GtidList::parse("").unwrap().is_empty());
        assert!(GtidList::parse("  ").unwrap().is_empty());
        assert!(matches!(
            GtidList::parse("0-1"),
            Err(GtidError::Malformed(_))
        ));
        assert!(GtidList::parse("a-b-c").is_err());
    }

    #[test]
    fn parse_mysql_set_takes_upper_bound() {
        let uuid = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
        let l = GtidList::parse_mysql(&format!("{uuid}:1-5:7-42,\n{uuid}:9")).unwrap();
        assert_eq!(l.len(), 2);
        let sid = uuid_server_id(uuid);
        assert_eq!(l.seq_nos(), vec![42, 9]);
        assert_eq!(l.server_ids(), vec![sid, sid]);
        assert!(GtidList::parse_mysql("nointerval").is_err());
    }

    #[test]
    fn equivalent_ignores_order_and_accepts_prefix() {
        let a = GtidList::parse("1-2-7,0-1-100").unwrap();
        let b = GtidList::parse("0-1-100,1-2-7").unwrap();
        assert!(a.equivalent(&b));
        let prefix = GtidList::parse("0-1-100").unwrap();
        assert!(prefix.equivalent(&b));
        let other = GtidList::parse("0-1-99").unwrap();
        assert!(!other.equivalent(&b));
    }

    #[test]
    fn behind_or_equal() {
        let crash = GtidList::parse("0-1-100").unwrap();
        assert!(GtidList::parse("0-1-90").unwrap().is_behind_or_equal(&crash));
        assert!(GtidList::parse("0-1-100").unwrap().is_behind_or_equal(&crash));
        assert!(!GtidList::parse("0-1-103").unwrap().is_behind_or_equal(&crash));
        assert!(!GtidList::parse("0-3-1").unwrap().is_behind_or_equal(&crash));
    }

    #[test]
    fn serde_as_string() {
        let l = GtidList::parse("0-1-5").unwrap();
        let json = serde_json::to_string(&l).unwrap();
        assert_eq!(json, "\"0-1-5\"");
        let back: GtidList = serde_json::from_str(&json).unwrap();
        assert_eq!(back, l);
    }

    proptest! {
        #[test]
        fn display_parses_back(entries in prop::collection::vec((0u32..4, 1u64..1000, 0u64..1_000_000), 0..6)) {
            let list = GtidList::new(entries.into_iter().map(|(d, s, q)| Gtid::new(d, s, q)).collect());
            let parsed = GtidList::parse(&list.to_string()).unwrap();
            prop_assert_eq!(parsed, list);
        }

        #[test]
        fn every_list_is_behind_or_equal_itself(entries in prop::collection::vec((0u32..4, 1u64..1000, 0u64..1_000_000), 0..6)) {
            let list = GtidList::new(entries.into_iter().map(|(d, s, q)| Gtid::new(d, s, q)).collect());
            prop_assert!(list.is_behind_or_equal(&list));
        }
    }
}
