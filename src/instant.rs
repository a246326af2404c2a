use std::time::Duration;

use chrono::{DateTime, Utc};

/// A UTC wall-clock instant.
///
/// The engine never measures elapsed time with [`std::time::Instant`]: every
/// staleness/expiry check in spec section 3 is defined against `now`, and
/// entries are meant to be comparable across process restarts and (for a
/// future persister) across serialization boundaries. `Instant` is a thin
/// newtype over [`chrono::DateTime<Utc>`] for that reason.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Instant(DateTime<Utc>);

impl Instant {
    /// The current instant.
    pub fn now() -> Self {
        Instant(Utc::now())
    }

    /// Elapsed duration since this instant, saturating at zero if `self` is
    /// in the future relative to now.
    pub fn elapsed(&self) -> Duration {
        let now = Utc::now();
        (now - self.0).to_std().unwrap_or(Duration::ZERO)
    }

    /// `self + duration`.
    pub fn plus(&self, duration: Duration) -> Self {
        let duration = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        Instant(self.0 + duration)
    }

    /// The underlying `DateTime<Utc>`.
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Instant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl From<DateTime<Utc>> for Instant {
    fn from(dt: DateTime<Utc>) -> Self {
        Instant(dt)
    }
}
