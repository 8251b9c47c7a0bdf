use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use super::{CollectionMode, ProducerKind, QueriesComplete, QueryWindow, QueryWindowProducer};

/// Walks a bounded `[start, end)` range in fixed-length windows.
///
/// Once the window ending at `end` has been completed the producer reports
/// [`QueriesComplete`], optionally asking the poller to carry on in realtime.
#[derive(Debug)]
pub struct HistoricalProducer {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    query_length: chrono::Duration,
    continue_realtime: bool,
    pause_between_queries: Duration,
    next_start: DateTime<Utc>,
    finished: bool,
}

impl HistoricalProducer {
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        query_length: Duration,
        continue_realtime: bool,
    ) -> Result<Self> {
        if start >= end {
            bail!("historical start {start} must be before end {end}");
        }

        if query_length.is_zero() {
            bail!("query_length must be > 0");
        }

        let query_length = chrono::Duration::from_std(query_length)
            .context("query_length out of range")?;

        Ok(Self {
            start,
            end,
            query_length,
            continue_realtime,
            pause_between_queries: Duration::ZERO,
            next_start: start,
            finished: false,
        })
    }

    /// Sleep this long between windows instead of catching up flat out.
    pub fn with_pause_between_queries(mut self, pause: Duration) -> Self {
        self.pause_between_queries = pause;
        self
    }

}

impl QueryWindowProducer for HistoricalProducer {
    fn next_window(&self) -> QueryWindow {
        let end = (self.next_start + self.query_length).min(self.end);
        QueryWindow::new(self.next_start, end)
    }

    fn complete_window(&mut self, end: DateTime<Utc>) -> Result<(), QueriesComplete> {
        self.next_start = end.min(self.end);

        if self.next_start >= self.end {
            self.finished = true;
            return Err(QueriesComplete {
                continue_realtime: self.continue_realtime,
                last_data_point: self.end,
            });
        }

        Ok(())
    }

    fn sleep_duration(&self, _last_cycle_cost: Duration) -> Duration {
        self.pause_between_queries
    }

    fn mode(&self) -> CollectionMode {
        CollectionMode::Historical
    }

    fn kind(&self) -> ProducerKind {
        ProducerKind::Historical
    }

    fn restarted(&self) -> Box<dyn QueryWindowProducer> {
        Box::new(Self {
            next_start: self.start,
            finished: false,
            ..*self
        })
    }

    fn queries_finished(&self) -> bool {
        self.finished
    }

    fn first_query_start(&self) -> Option<DateTime<Utc>> {
        Some(self.start)
    }

    fn final_query_end(&self) -> Option<DateTime<Utc>> {
        Some(self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, min, 0).unwrap()
    }

    #[test]
    fn test_walks_range_in_fixed_windows() {
        let mut p = HistoricalProducer::new(t(0, 0), t(2, 0), Duration::from_secs(3600), false)
            .expect("valid range");

        let w1 = p.next_window();
        assert_eq!(w1, QueryWindow::new(t(0, 0), t(1, 0)));
        assert!(p.complete_window(w1.end).is_ok());

        let w2 = p.next_window();
        assert_eq!(w2, QueryWindow::new(t(1, 0), t(2, 0)));

        let done = p.complete_window(w2.end).expect_err("range exhausted");
        assert!(!done.continue_realtime);
        assert_eq!(done.last_data_point, t(2, 0));
        assert!(p.queries_finished());
    }

    #[test]
    fn test_last_window_is_clipped_to_end() {
        let mut p = HistoricalProducer::new(t(0, 0), t(0, 50), Duration::from_secs(1800), true)
            .expect("valid range");

        let w1 = p.next_window();
        p.complete_window(w1.end).expect("first window");
        let w2 = p.next_window();
        assert_eq!(w2, QueryWindow::new(t(0, 30), t(0, 50)));

        let done = p.complete_window(w2.end).expect_err("exhausted");
        assert!(done.continue_realtime);
    }

    #[test]
    fn test_rejects_empty_range_and_zero_length() {
        let err = HistoricalProducer::new(t(1, 0), t(1, 0), Duration::from_secs(60), false)
            .expect_err("empty range");
        assert!(err.to_string().contains("before end"));

        let err = HistoricalProducer::new(t(0, 0), t(1, 0), Duration::ZERO, false)
            .expect_err("zero length");
        assert!(err.to_string().contains("query_length"));
    }

    #[test]
    fn test_restarted_walks_range_again() {
        let mut p = HistoricalProducer::new(t(0, 0), t(2, 0), Duration::from_secs(3600), true)
            .expect("valid range")
            .with_pause_between_queries(Duration::from_millis(5));
        p.complete_window(t(1, 0)).expect("first window");
        p.complete_window(t(2, 0)).expect_err("exhausted");

        let mut fresh = p.restarted();
        assert!(!fresh.queries_finished());
        assert_eq!(fresh.next_window(), QueryWindow::new(t(0, 0), t(1, 0)));
        assert_eq!(fresh.sleep_duration(Duration::ZERO), Duration::from_millis(5));
        fresh.complete_window(t(1, 0)).expect("first window");
        let done = fresh.complete_window(t(2, 0)).expect_err("exhausted");
        assert!(done.continue_realtime);
    }

    #[test]
    fn test_sleep_uses_configured_pause() {
        let p = HistoricalProducer::new(t(0, 0), t(1, 0), Duration::from_secs(60), false)
            .expect("valid range")
            .with_pause_between_queries(Duration::from_millis(250));
        assert_eq!(p.sleep_duration(Duration::from_secs(5)), Duration::from_millis(250));
        assert_eq!(p.mode(), CollectionMode::Historical);
        assert_eq!(p.first_query_start(), Some(t(0, 0)));
        assert_eq!(p.final_query_end(), Some(t(1, 0)));
    }
}
