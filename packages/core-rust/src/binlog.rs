//! Binary log naming, event-header timestamps and bounded purge planning.
//!
//! Binlog files are named `<prefix>.NNNNNN` with a zero-padded numeric
//! suffix; ordering, window arithmetic and replica-safety caps all operate on
//! that suffix.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;

/// One GiB, the unit of the purge size budget.
pub const GIB: u64 = 1024 * 1024 * 1024;

// ---------------------------------------------------------------------------
// BinlogName
// ---------------------------------------------------------------------------

/// Errors parsing a binlog file name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid binlog file name '{0}'")]
pub struct BinlogNameError(pub String);

/// A parsed `<prefix>.<suffix>` binlog file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BinlogName {
    pub prefix: String,
    pub suffix: u32,
    width: usize,
}

impl BinlogName {
    #[must_use]
    pub fn new(prefix: impl Into<String>, suffix: u32) -> Self {
        Self {
            prefix: prefix.into(),
            suffix,
            width: 6,
        }
    }

    /// Same prefix and padding, different suffix.
    #[must_use]
    pub fn with_suffix(&self, suffix: u32) -> Self {
        Self {
            prefix: self.prefix.clone(),
            suffix,
            width: self.width,
        }
    }

    /// Name of the oldest file when `count` files end at `self`.
    ///
    /// # Examples
    ///
    /// ```
    /// use repman_core::binlog::BinlogName;
    ///
    /// let cur: BinlogName = "mysql-bin.000012".parse().unwrap();
    /// assert_eq!(cur.oldest(9).to_string(), "mysql-bin.000004");
    /// assert_eq!(cur.oldest(1), cur);
    /// ```
    #[must_use]
    pub fn oldest(&self, count: usize) -> Self {
        let back = u32::try_from(count.saturating_sub(1)).unwrap_or(u32::MAX);
        self.with_suffix(self.suffix.saturating_sub(back))
    }

    /// Ordering by suffix; `None` when prefixes differ.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        (self.prefix == other.prefix).then(|| self.suffix.cmp(&other.suffix))
    }
}

impl FromStr for BinlogName {
    type Err = BinlogNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, suffix) = s
            .rsplit_once('.')
            .ok_or_else(|| BinlogNameError(s.to_string()))?;
        if prefix.is_empty() || suffix.is_empty() {
            return Err(BinlogNameError(s.to_string()));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            suffix: suffix.parse().map_err(|_| BinlogNameError(s.to_string()))?,
            width: suffix.len(),
        })
    }
}

impl fmt::Display for BinlogName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:0width$}", self.prefix, self.suffix, width = self.width)
    }
}

// ---------------------------------------------------------------------------
// Event header timestamps
// ---------------------------------------------------------------------------

static EVENT_TS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9]{2})([0-9]{2})([0-9]{2})[ ]{1,2}([0-9]{1,2}):([0-9]{2}):([0-9]{2})")
        .unwrap_or_else(|_| unreachable!("static regex"))
});

/// Extracts the `#YYMMDD HH:MM:SS` header of a decoded binlog event.
///
/// The two-digit year is placed in the century of `now_year`, stepping back
/// one century when that would land in the future.
///
/// # Examples
///
/// ```
/// use repman_core::binlog::parse_event_time;
///
/// let t = parse_event_time("#240115  9:05:03 server id 1  end_log_pos 256", 2024).unwrap();
/// assert_eq!(t.to_string(), "2024-01-15 09:05:03");
/// let t = parse_event_time("#991231 23:59:59 server id 1", 2001).unwrap();
/// assert_eq!(t.to_string(), "1999-12-31 23:59:59");
/// ```
#[must_use]
pub fn parse_event_time(line: &str, now_year: i32) -> Option<NaiveDateTime> {
    let caps = EVENT_TS.captures(line)?;
    let num = |i: usize| caps.get(i)?.as_str().parse::<u32>().ok();
    let yy = i32::try_from(num(1)?).ok()?;
    let mut year = now_year - now_year.rem_euclid(100) + yy;
    if year > now_year {
        year -= 100;
    }
    let date = NaiveDate::from_ymd_opt(year, num(2)?, num(3)?)?;
    let time = NaiveTime::from_hms_opt(num(4)?, num(5)?, num(6)?)?;
    Some(NaiveDateTime::new(date, time))
}

/// [`parse_event_time`] against the local clock, as unix seconds.
#[must_use]
pub fn parse_event_timestamp(line: &str) -> Option<i64> {
    let now = chrono::Local::now();
    let naive = parse_event_time(line, now.year())?;
    naive
        .and_local_timezone(chrono::Local)
        .earliest()
        .map(|t| t.timestamp())
}

// ---------------------------------------------------------------------------
// Purge planning
// ---------------------------------------------------------------------------

/// Outcome of [`plan_master_purge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgePlan {
    /// Nothing to purge.
    Keep,
    /// `PURGE BINARY LOGS TO until`; `capped` when the slowest replica
    /// forced the cutoff back.
    PurgeTo { until: String, capped: bool },
    /// Refused: replica position has another prefix or is ahead of the source.
    Inconsistent(String),
}

/// Computes the size-bounded purge cutoff.
///
/// `files` lists `(name, size)` oldest first. Walking from the newest file,
/// sizes accumulate until the total exceeds `max_total_bytes`; the last file
/// that still fits becomes the cutoff. The cutoff never passes
/// `slowest_replica_file`, the oldest source file any replica is reading.
#[must_use]
pub fn plan_master_purge(
    files: &[(String, u64)],
    max_total_bytes: u64,
    slowest_replica_file: &BinlogName,
) -> PurgePlan {
    let Some((current, _)) = files.last() else {
        return PurgePlan::Keep;
    };
    let Ok(current) = current.parse::<BinlogName>() else {
        return PurgePlan::Inconsistent(format!("unparsable binlog {current}"));
    };
    match current.compare(slowest_replica_file) {
        None => return PurgePlan::Inconsistent("replica reads a different binlog prefix".into()),
        Some(Ordering::Less) => {
            return PurgePlan::Inconsistent("replica source file is ahead of the binlog".into())
        }
        Some(_) => {}
    }

    let mut total = 0u64;
    let mut until: Option<&str> = None;
    for (name, size) in files.iter().rev() {
        total = total.saturating_add(*size);
        if total > max_total_bytes {
            break;
        }
        until = Some(name);
    }
    let Some(until) = until else {
        return PurgePlan::Keep;
    };
    let Ok(mut cutoff) = until.parse::<BinlogName>() else {
        return PurgePlan::Inconsistent(format!("unparsable binlog {until}"));
    };
    let mut capped = false;
    if cutoff.suffix > slowest_replica_file.suffix {
        cutoff = cutoff.with_suffix(slowest_replica_file.suffix);
        capped = true;
    }
    let until = cutoff.to_string();
    if !files.iter().any(|(n, _)| *n == until) {
        return PurgePlan::Inconsistent(format!("binlog {until} not found"));
    }
    if files.first().is_some_and(|(n, _)| *n == until) {
        return PurgePlan::Keep;
    }
    PurgePlan::PurgeTo { until, capped }
}

/// Files to delete from a backup directory so only the last `keep` files
/// (by suffix, same prefix as `current`) remain.
#[must_use]
pub fn backup_files_to_delete(names: &[String], current: &BinlogName, keep: u32) -> Vec<String> {
    let floor = current.suffix.saturating_sub(keep.saturating_sub(1));
    names
        .iter()
        .filter(|n| {
            n.parse::<BinlogName>()
                .is_ok_and(|b| b.prefix == current.prefix && b.suffix < floor)
        })
        .cloned()
        .collect()
}
