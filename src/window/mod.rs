//! Window clock, aggregation and the windower task.

use chrono::{DateTime, TimeDelta, Utc};
use std::fmt;
use std::time::Duration;

use crate::error::{AgentError, Result};

mod record;
mod windower;

pub use record::{Summary, WindowRecord, percentile};
pub use windower::{Windower, WindowerConfig};

/// A half-open interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format("%H:%M:%S%.3f"),
            self.end.format("%H:%M:%S%.3f")
        )
    }
}

/// The global window grid: windows of one fixed length aligned to the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    millis: i64,
}

impl WindowSpec {
    pub fn new(duration: Duration) -> Result<Self> {
        let millis = i64::try_from(duration.as_millis())
            .map_err(|_| AgentError::config("window duration out of range"))?;
        if millis <= 0 {
            return Err(AgentError::config("window duration must be positive"));
        }
        Ok(Self { millis })
    }

    pub fn duration(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.millis)
    }

    /// Start of the window containing `ts`
    pub fn start_of(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let start = ts.timestamp_millis().div_euclid(self.millis) * self.millis;
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::milliseconds(start)
    }

    /// The window containing `ts`
    pub fn window_of(&self, ts: DateTime<Utc>) -> Window {
        self.window_at(self.start_of(ts))
    }

    /// The window starting at an aligned `start`
    pub fn window_at(&self, start: DateTime<Utc>) -> Window {
        Window {
            start,
            end: start + self.duration(),
        }
    }
}

/// Source of wall-clock time
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
