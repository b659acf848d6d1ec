//! Time-window schedules for sensors and devices.
//!
//! A schedule is a window `[starts_at, ends_at)` plus a recurrence rule:
//!
//! - `none`: the window is taken literally.
//! - `daily` / `weekly` / `monthly`: only the time-of-day part of the window
//!   is used, repeated on every day / on the start date's weekday / on the
//!   start date's day-of-month, from the start date onwards. A window whose
//!   end time is earlier than its start time runs past midnight; the part
//!   after midnight belongs to the previous day's occurrence.
//!
//! Times are controller-local wall-clock times; the evaluator converts "now"
//! using a fixed UTC offset from the config.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::warn;

use crate::store::Store;

/// Storage format of `starts_at` / `ends_at`.
pub const DATETIME_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

pub fn parse_datetime(s: &str) -> Result<PrimitiveDateTime> {
    PrimitiveDateTime::parse(s.trim(), DATETIME_FORMAT)
        .with_context(|| format!("bad schedule time '{s}' (want YYYY-MM-DD HH:MM:SS)"))
}

pub fn format_datetime(t: PrimitiveDateTime) -> Result<String> {
    t.format(DATETIME_FORMAT).context("failed to format schedule time")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    None,
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

impl FromStr for Recurrence {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(anyhow!("unknown recurrence '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Sensor(i64),
    Device(i64),
}

impl Target {
    pub fn kind(self) -> &'static str {
        match self {
            Self::Sensor(_) => "sensor",
            Self::Device(_) => "device",
        }
    }

    pub fn id(self) -> i64 {
        match self {
            Self::Sensor(id) | Self::Device(id) => id,
        }
    }

    pub fn from_parts(kind: &str, id: i64) -> Result<Self> {
        match kind {
            "sensor" => Ok(Self::Sensor(id)),
            "device" => Ok(Self::Device(id)),
            other => Err(anyhow!("unknown schedule target kind '{other}'")),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub id: i64,
    pub target: Target,
    pub recurrence: Recurrence,
    pub starts_at: PrimitiveDateTime,
    pub ends_at: PrimitiveDateTime,
}

impl Schedule {
    pub fn is_active_at(&self, now: PrimitiveDateTime) -> bool {
        if self.recurrence == Recurrence::None {
            return self.starts_at <= now && now < self.ends_at;
        }

        let (start, end) = (self.starts_at.time(), self.ends_at.time());
        let t = now.time();

        let day = if start < end {
            (start <= t && t < end).then_some(now.date())
        } else if end < start {
            if t >= start {
                Some(now.date())
            } else if t < end {
                now.date().previous_day()
            } else {
                None
            }
        } else {
            // Zero-length window.
            None
        };

        match day {
            Some(day) => self.occurs_on(day),
            None => false,
        }
    }

    /// Whether a recurring window opens on `day`.
    fn occurs_on(&self, day: Date) -> bool {
        let first = self.starts_at.date();
        if day < first {
            return false;
        }
        match self.recurrence {
            Recurrence::None => day == first,
            Recurrence::Daily => true,
            Recurrence::Weekly => day.weekday() == first.weekday(),
            // Months without that day (e.g. the 31st) are skipped.
            Recurrence::Monthly => day.day() == first.day(),
        }
    }
}

/// True when any of `schedules` covers `now`.
pub fn any_active(schedules: &[Schedule], now: PrimitiveDateTime) -> bool {
    schedules.iter().any(|s| s.is_active_at(now))
}

/// Answers "is this target inside one of its windows right now?" against
/// the store.
#[derive(Clone)]
pub struct ScheduleEvaluator {
    store: Arc<dyn Store>,
    offset: UtcOffset,
}

impl ScheduleEvaluator {
    pub fn new(store: Arc<dyn Store>, offset: UtcOffset) -> Self {
        Self { store, offset }
    }

    pub fn local_now(&self) -> PrimitiveDateTime {
        let now = OffsetDateTime::now_utc().to_offset(self.offset);
        PrimitiveDateTime::new(now.date(), now.time())
    }

    pub async fn is_active(&self, target: Target) -> bool {
        self.is_active_at(target, self.local_now()).await
    }

    /// A store failure reads as "not active".
    pub async fn is_active_at(&self, target: Target, now: PrimitiveDateTime) -> bool {
        match self.store.schedules_for(target).await {
            Ok(schedules) => any_active(&schedules, now),
            Err(e) => {
                warn!(%target, "schedule lookup failed, treating as inactive: {e:#}");
                false
            }
        }
    }
}
