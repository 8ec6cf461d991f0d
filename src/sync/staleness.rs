use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Point in time the staleness window is measured back from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessAnchor {
    /// Midnight UTC of the current day (`current_date - interval 'N days'`).
    StartOfDay,
    /// The current instant.
    Now,
}

impl fmt::Display for StalenessAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StalenessAnchor::StartOfDay => f.write_str("start_of_day"),
            StalenessAnchor::Now => f.write_str("now"),
        }
    }
}

impl FromStr for StalenessAnchor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start_of_day" | "start-of-day" | "day" | "date" => Ok(StalenessAnchor::StartOfDay),
            "now" | "instant" => Ok(StalenessAnchor::Now),
            other => Err(format!("unknown staleness anchor '{other}'")),
        }
    }
}

/// Configured "how old is too old" rule, independent of when it is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalenessWindow {
    pub days: i64,
    pub anchor: StalenessAnchor,
}

impl Default for StalenessWindow {
    fn default() -> Self {
        Self {
            days: 7,
            anchor: StalenessAnchor::StartOfDay,
        }
    }
}

impl StalenessWindow {
    pub fn new(days: i64, anchor: StalenessAnchor) -> Self {
        Self {
            days: days.max(0),
            anchor,
        }
    }

    /// Resolve the window against `now`.
    pub fn predicate_at(&self, now: DateTime<Utc>) -> StalenessPredicate {
        let anchor = match self.anchor {
            StalenessAnchor::Now => now,
            StalenessAnchor::StartOfDay => now.date_naive().and_time(NaiveTime::MIN).and_utc(),
        };
        StalenessPredicate {
            cutoff: anchor - Duration::days(self.days),
        }
    }
}

/// A resolved staleness rule: records last checked strictly before `cutoff` are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalenessPredicate {
    cutoff: DateTime<Utc>,
}

impl StalenessPredicate {
    pub fn checked_before(cutoff: DateTime<Utc>) -> Self {
        Self { cutoff }
    }

    pub fn cutoff(&self) -> DateTime<Utc> {
        self.cutoff
    }

    pub fn holds(&self, last_checked: DateTime<Utc>) -> bool {
        last_checked < self.cutoff
    }
}
