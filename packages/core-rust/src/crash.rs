//! Crash records.
//!
//! A crash record captures the coordinates of a leader at the moment a
//! failover (or switchover) started, plus the new leader's binlog position
//! right after promotion. When the former leader comes back, the rejoin
//! logic compares its own position against the record to pick a strategy.

use serde::{Deserialize, Serialize};

use crate::gtid::GtidList;

/// Upper bound on retained crash records; the oldest is evicted first.
pub const MAX_CRASHES: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Crash {
    /// URL (`host:port`) of the leader that was replaced.
    pub url: String,
    /// Numeric `server_id` of that leader.
    pub server_id: u64,
    /// GTID position the elected candidate had fetched from the old leader.
    pub failover_io_gtid: GtidList,
    pub failover_master_log_file: String,
    pub failover_master_log_pos: u64,
    pub new_master_log_file: String,
    pub new_master_log_pos: u64,
    pub elected_master_url: String,
    pub failover_semisync_slave_status: bool,
    pub switchover: bool,
    /// Unix seconds.
    pub timestamp: i64,
}

impl Crash {
    /// Whether the election relied on GTID positions.
    #[must_use]
    pub fn used_gtid_at_election(&self) -> bool {
        !self.failover_io_gtid.is_empty()
    }

    /// Whether the record knows anything about writes from `server_id`.
    /// Without such knowledge the failure is treated as cascading.
    #[must_use]
    pub fn covers_server(&self, server_id: u64) -> bool {
        !self.used_gtid_at_election() || self.failover_io_gtid.has_server(server_id)
    }
}

/// Bounded, append-only log of crash records owned by a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CrashLog {
    crashes: Vec<Crash>,
}

impl CrashLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `crash`, evicting the oldest record beyond [`MAX_CRASHES`].
    pub fn push(&mut self, crash: Crash) {
        self.crashes.push(crash);
        if self.crashes.len() > MAX_CRASHES {
            let excess = self.crashes.len() - MAX_CRASHES;
            self.crashes.drain(..excess);
        }
    }

    /// Most recent record for `url`.
    #[must_use]
    pub fn latest_for(&self, url: &str) -> Option<&Crash> {
        self.crashes.iter().rev().find(|c| c.url == url)
    }

    /// Mutable access to the most recent record for `url`.
    pub fn latest_for_mut(&mut self, url: &str) -> Option<&mut Crash> {
        self.crashes.iter_mut().rev().find(|c| c.url == url)
    }

    #[must_use]
    pub fn last(&self) -> Option<&Crash> {
        self.crashes.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut Crash> {
        self.crashes.last_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.crashes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.crashes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Crash> {
        self.crashes.iter()
    }

    /// Discards every record.
    pub fn clear(&mut self) {
        self.crashes.clear();
    }

    /// JSON array form used for persistence.
    ///
    /// # Errors
    ///
    /// Propagates `serde_json` serialization errors.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// # Errors
    ///
    /// Returns an error on malformed JSON or a malformed GTID string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        let mut log: Self = serde_json::from_str(s)?;
        if log.crashes.len() > MAX_CRASHES {
            let excess = log.crashes.len() - MAX_CRASHES;
            log.crashes.drain(..excess);
        }
        Ok(log)
    }
}
