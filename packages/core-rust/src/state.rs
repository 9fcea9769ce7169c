//! Cluster state machine.
//!
//! Operational problems are never raised as errors to the monitoring loop.
//! Instead they accumulate as [`State`] entries keyed by catalog code in the
//! *current* tick. At the end of each tick [`StateMachine::end_tick`] diffs
//! the current set against the previous one (yielding opened and resolved
//! entries), then rotates: current becomes previous and a fresh set starts.
//!
//! Queries about "being in a state" look at the previous, completed tick so
//! that readers never observe a half-built set.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::catalog::{self, ErrFrom, ErrType};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// A single error or warning entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub key: String,
    pub err_type: ErrType,
    pub desc: String,
    pub from: ErrFrom,
    pub server_url: Option<String>,
}

impl State {
    /// Builds an entry from the catalog, rendering the message with `args`.
    ///
    /// Unknown codes produce an `ERROR` entry raised by `CHECK` whose
    /// description is the code itself, so no entry ever has an empty message.
    #[must_use]
    pub fn from_catalog(code: &str, args: &[&dyn fmt::Display]) -> Self {
        match catalog::lookup(code) {
            Some(e) => Self {
                key: code.to_string(),
                err_type: e.err_type,
                desc: catalog::render(e.template, args),
                from: e.from,
                server_url: None,
            },
            None => Self {
                key: code.to_string(),
                err_type: ErrType::Error,
                desc: code.to_string(),
                from: ErrFrom::Check,
                server_url: None,
            },
        }
    }

    /// Attaches the URL of the server the entry is about.
    #[must_use]
    pub fn with_server(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    /// Overrides the raising subsystem.
    #[must_use]
    pub fn with_from(mut self, from: ErrFrom) -> Self {
        self.from = from;
        self
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.err_type == ErrType::Error
    }
}

/// Entries opened and resolved by one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDiff {
    pub opened: Vec<State>,
    pub resolved: Vec<State>,
}

impl StateDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.resolved.is_empty()
    }

    /// Human-readable lines: `RESOLV <code> : <desc>` then `OPENED <code> : <desc>`.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.resolved
            .iter()
            .map(|s| format!("RESOLV {} : {}", s.key, s.desc))
            .chain(
                self.opened
                    .iter()
                    .map(|s| format!("OPENED {} : {}", s.key, s.desc)),
            )
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Sla
// ---------------------------------------------------------------------------

/// Uptime accounting advanced at the end of every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sla {
    pub first_time: i64,
    pub last_time: i64,
    pub uptime: i64,
    pub uptime_failable: i64,
    pub uptime_semisync: i64,
}

impl Sla {
    #[must_use]
    pub fn starting_at(now: i64) -> Self {
        Self {
            first_time: now,
            last_time: now,
            ..Self::default()
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn percent(&self, part: i64) -> f64 {
        let span = self.last_time - self.first_time;
        if span <= 0 {
            return 0.0;
        }
        100.0 * part as f64 / span as f64
    }

    #[must_use]
    pub fn uptime_pct(&self) -> String {
        Self::format(self.percent(self.uptime))
    }

    #[must_use]
    pub fn uptime_failable_pct(&self) -> String {
        Self::format(self.percent(self.uptime_failable))
    }

    #[must_use]
    pub fn uptime_semisync_pct(&self) -> String {
        Self::format(self.percent(self.uptime_semisync))
    }

    /// Five decimals; a full 100% is shown as `99.99999`.
    #[must_use]
    pub fn format(pct: f64) -> String {
        let s = format!("{pct:.5}");
        if s == "100.00000" {
            "99.99999".to_string()
        } else {
            s
        }
    }
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Sets {
    current: BTreeMap<String, State>,
    previous: BTreeMap<String, State>,
    heartbeats: u64,
    sla: Sla,
}

/// Concurrent set of active state entries with tick diffing.
#[derive(Debug)]
pub struct StateMachine {
    sets: Mutex<Sets>,
    in_failover: AtomicBool,
    discovered: AtomicBool,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sets: Mutex::new(Sets {
                sla: Sla::starting_at(chrono::Utc::now().timestamp()),
                ..Sets::default()
            }),
            in_failover: AtomicBool::new(false),
            discovered: AtomicBool::new(false),
        }
    }

    /// Records `state` for the current tick. A code already present keeps
    /// its first entry. Before the first completed tick entries are also
    /// visible to [`Self::is_in_state`].
    pub fn add_state(&self, state: State) {
        let mut sets = self.sets.lock();
        if sets.heartbeats == 0 {
            sets.previous
                .entry(state.key.clone())
                .or_insert_with(|| state.clone());
        }
        sets.current.entry(state.key.clone()).or_insert(state);
    }

    /// Shorthand for `add_state(State::from_catalog(code, args))`.
    pub fn raise(&self, code: &str, args: &[&dyn fmt::Display]) {
        self.add_state(State::from_catalog(code, args));
    }

    /// Like [`Self::raise`] but tags the entry with a server URL.
    pub fn raise_for(&self, code: &str, server_url: &str, args: &[&dyn fmt::Display]) {
        self.add_state(State::from_catalog(code, args).with_server(server_url));
    }

    pub fn delete_state(&self, key: &str) {
        self.sets.lock().current.remove(key);
    }

    /// Whether `key` was active at the end of the previous tick.
    #[must_use]
    pub fn is_in_state(&self, key: &str) -> bool {
        self.sets.lock().previous.contains_key(key)
    }

    /// Whether `key` has been raised during the running tick.
    #[must_use]
    pub fn is_in_current_state(&self, key: &str) -> bool {
        self.sets.lock().current.contains_key(key)
    }

    /// Snapshot of the entries raised during the running tick.
    #[must_use]
    pub fn current_states(&self) -> Vec<State> {
        self.sets.lock().current.values().cloned().collect()
    }

    /// Entries present now but absent from the previous tick.
    #[must_use]
    pub fn opened_states(&self) -> Vec<State> {
        let sets = self.sets.lock();
        sets.current
            .iter()
            .filter(|(k, _)| !sets.previous.contains_key(*k))
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Entries present in the previous tick but absent now.
    #[must_use]
    pub fn resolved_states(&self) -> Vec<State> {
        let sets = self.sets.lock();
        sets.previous
            .iter()
            .filter(|(k, _)| !sets.current.contains_key(*k))
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Closes the running tick: computes the diff, then rotates the sets.
    pub fn end_tick(&self) -> StateDiff {
        let mut sets = self.sets.lock();
        let opened = sets
            .current
            .iter()
            .filter(|(k, _)| !sets.previous.contains_key(*k))
            .map(|(_, v)| v.clone())
            .collect();
        let resolved = sets
            .previous
            .iter()
            .filter(|(k, _)| !sets.current.contains_key(*k))
            .map(|(_, v)| v.clone())
            .collect();
        let current = std::mem::take(&mut sets.current);
        sets.previous = current;
        StateDiff { opened, resolved }
    }

    pub fn set_failover_state(&self) {
        self.in_failover.store(true, Ordering::SeqCst);
    }

    pub fn remove_failover_state(&self) {
        self.in_failover.store(false, Ordering::SeqCst);
    }

    /// Atomically enters failover; returns `false` when one is already running.
    #[must_use]
    pub fn try_enter_failover(&self) -> bool {
        self.in_failover
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[must_use]
    pub fn is_in_failover(&self) -> bool {
        self.in_failover.load(Ordering::SeqCst)
    }

    /// No `ERROR` entry survived the previous tick. Marks the cluster discovered.
    #[must_use]
    pub fn is_failable(&self) -> bool {
        let ok = !self.sets.lock().previous.values().any(State::is_error);
        if ok {
            self.discovered.store(true, Ordering::SeqCst);
        }
        ok
    }

    /// No `ERROR` entry raised so far in the running tick. Marks the cluster
    /// discovered.
    #[must_use]
    pub fn can_monitor(&self) -> bool {
        let ok = !self.sets.lock().current.values().any(State::is_error);
        if ok {
            self.discovered.store(true, Ordering::SeqCst);
        }
        ok
    }

    pub fn undiscovered(&self) {
        self.discovered.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_discovered(&self) -> bool {
        self.discovered.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn heartbeats(&self) -> u64 {
        self.sets.lock().heartbeats
    }

    #[must_use]
    pub fn sla(&self) -> Sla {
        self.sets.lock().sla
    }

    pub fn set_sla(&self, sla: Sla) {
        self.sets.lock().sla = sla;
    }

    pub fn reset_uptime(&self) {
        self.sets.lock().sla = Sla::starting_at(chrono::Utc::now().timestamp());
    }

    /// Advances the SLA counters to now and counts a heartbeat.
    pub fn set_master_up_and_sync(&self, valid_master: bool, semisync: bool, not_delayed: bool) {
        self.set_master_up_and_sync_at(
            chrono::Utc::now().timestamp(),
            valid_master,
            semisync,
            not_delayed,
        );
    }

    /// Same as [`Self::set_master_up_and_sync`] with an explicit clock.
    pub fn set_master_up_and_sync_at(
        &self,
        now: i64,
        valid_master: bool,
        semisync: bool,
        not_delayed: bool,
    ) {
        let mut sets = self.sets.lock();
        let elapsed = now - sets.sla.last_time;
        if semisync {
            sets.sla.uptime_semisync += elapsed;
        }
        if not_delayed {
            sets.sla.uptime_failable += elapsed;
        }
        if valid_master {
            sets.sla.uptime += elapsed;
        }
        sets.sla.last_time = now;
        sets.heartbeats += 1;
    }
}
