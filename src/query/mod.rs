pub mod historical;
pub mod realtime;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use historical::HistoricalProducer;
pub use realtime::RealtimeProducer;

/// A half-open `[start, end)` interval of source time to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl QueryWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Length of the window, zero if `end <= start`.
    pub fn length(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or(Duration::ZERO)
    }

    /// Window start as milliseconds since the Unix epoch.
    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }
}

impl fmt::Display for QueryWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Collection mode. Drives queue sizing and the backlog policy of the
/// transport client, and whether a bounded range can run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMode {
    Historical,
    Realtime,
}

impl CollectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Historical => "historical",
            Self::Realtime => "realtime",
        }
    }
}

impl fmt::Display for CollectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete producer implementation, reported for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerKind {
    Historical,
    Realtime,
}

/// Raised by a bounded producer once its final window has been collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queries complete at {last_data_point} (continue in realtime: {continue_realtime})")]
pub struct QueriesComplete {
    /// Switch to a realtime producer instead of finishing.
    pub continue_realtime: bool,
    /// The last point in time that was collected.
    pub last_data_point: DateTime<Utc>,
}

/// Supplies query windows and inter-poll sleeps to a poller.
///
/// Implementations are not required to be thread-safe; the poller serializes
/// every call through a single mutex.
pub trait QueryWindowProducer: Send {
    /// The next window to poll.
    fn next_window(&self) -> QueryWindow;

    /// Record that data up to `end` has been collected.
    fn complete_window(&mut self, end: DateTime<Utc>) -> Result<(), QueriesComplete>;

    /// How long to sleep before the next cycle, given what the last one cost.
    fn sleep_duration(&self, last_cycle_cost: Duration) -> Duration;

    fn mode(&self) -> CollectionMode;

    fn kind(&self) -> ProducerKind;

    /// A producer in the state this one was built in, before any window
    /// was completed.
    fn restarted(&self) -> Box<dyn QueryWindowProducer>;

    /// True once a bounded range has been fully collected.
    fn queries_finished(&self) -> bool {
        false
    }

    /// Start of the very first window this producer hands out.
    fn first_query_start(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// End of the final window, if the range is bounded.
    fn final_query_end(&self) -> Option<DateTime<Utc>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_length() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let w = QueryWindow::new(start, start + chrono::Duration::minutes(5));
        assert_eq!(w.length(), Duration::from_secs(300));

        let inverted = QueryWindow::new(w.end, w.start);
        assert_eq!(inverted.length(), Duration::ZERO);
    }

    #[test]
    fn test_collection_mode_serde_names() {
        let mode: CollectionMode = serde_yaml::from_str("historical").expect("parse");
        assert_eq!(mode, CollectionMode::Historical);
        assert_eq!(CollectionMode::Realtime.to_string(), "realtime");
    }
}
