use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{CollectionMode, ProducerKind, QueriesComplete, QueryWindow, QueryWindowProducer};

/// Follows the wall clock: each window runs from the end of the previous one
/// up to now, and polls are spaced `update_interval` apart.
#[derive(Debug)]
pub struct RealtimeProducer {
    update_interval: Duration,
    seed: Option<DateTime<Utc>>,
    last_end: Option<DateTime<Utc>>,
    first_start: Option<DateTime<Utc>>,
}

impl RealtimeProducer {
    pub fn new(update_interval: Duration) -> Self {
        Self {
            update_interval,
            seed: None,
            last_end: None,
            first_start: None,
        }
    }

    /// Seed the producer so the first window starts at `t`.
    pub fn starting_at(mut self, t: DateTime<Utc>) -> Self {
        self.seed = Some(t);
        self.last_end = Some(t);
        self.first_start = Some(t);
        self
    }

    pub fn update_interval(&self) -> Duration {
        self.update_interval
    }

    fn interval(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.update_interval).unwrap_or_else(|_| chrono::Duration::zero())
    }

    fn window_at(&self, now: DateTime<Utc>) -> QueryWindow {
        let start = self.last_end.unwrap_or_else(|| now - self.interval());
        QueryWindow::new(start, now.max(start))
    }
}

impl QueryWindowProducer for RealtimeProducer {
    fn next_window(&self) -> QueryWindow {
        self.window_at(Utc::now())
    }

    fn complete_window(&mut self, end: DateTime<Utc>) -> Result<(), QueriesComplete> {
        if self.first_start.is_none() {
            self.first_start = Some(end - self.interval());
        }
        self.last_end = Some(end);
        Ok(())
    }

    fn sleep_duration(&self, last_cycle_cost: Duration) -> Duration {
        self.update_interval.saturating_sub(last_cycle_cost)
    }

    fn mode(&self) -> CollectionMode {
        CollectionMode::Realtime
    }

    fn kind(&self) -> ProducerKind {
        ProducerKind::Realtime
    }

    fn restarted(&self) -> Box<dyn QueryWindowProducer> {
        let fresh = Self::new(self.update_interval);
        Box::new(match self.seed {
            Some(t) => fresh.starting_at(t),
            None => fresh,
        })
    }

    fn first_query_start(&self) -> Option<DateTime<Utc>> {
        self.first_start
    }
}
