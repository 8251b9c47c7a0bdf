use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

/// Identifies a poller registered with the barrier.
pub type PollerId = u64;

/// Default maximum spread between the slowest and fastest poller.
pub const DEFAULT_MAX_WINDOW: Duration = Duration::from_secs(3 * 60);

/// Waiters re-check the barrier at least this often even without a wakeup.
const FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("sync window cannot be changed once pollers have started reporting")]
    AlreadyStarted,
    #[error("sync window must be positive")]
    InvalidWindow,
}

/// Per-poller record held by the barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncEntry {
    pub poller_id: PollerId,
    pub last_reported_start_ms: i64,
    pub is_set: bool,
}

impl SyncEntry {
    fn new(poller_id: PollerId) -> Self {
        Self {
            poller_id,
            last_reported_start_ms: 0,
            is_set: false,
        }
    }
}

/// How a `report` call was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The caller is within the window of its slowest sibling.
    InSync,
    /// The barrier has been stopped; synchronisation no longer applies.
    Stopped,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<PollerId, SyncEntry>,
    max_window_ms: i64,
    started: bool,
    stopped: bool,
}

impl Inner {
    fn reported(&self) -> impl Iterator<Item = i64> + '_ {
        self.entries
            .values()
            .filter(|e| e.is_set)
            .map(|e| e.last_reported_start_ms)
    }

    fn oldest(&self) -> Option<i64> {
        self.reported().min()
    }

    fn latest(&self) -> Option<i64> {
        self.reported().max()
    }

    fn within_window(&self) -> bool {
        match (self.oldest(), self.latest()) {
            (Some(oldest), Some(latest)) => latest - oldest <= self.max_window_ms,
            _ => true,
        }
    }
}

/// Keeps concurrently running pollers within `max_window` of each other in
/// source time.
///
/// Every poller reports the start of the window it is about to collect. A
/// poller that has run more than `max_window` ahead of the slowest reporter
/// waits until the spread narrows or the barrier is stopped.
#[derive(Debug)]
pub struct SyncBarrier {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl SyncBarrier {
    pub fn new() -> Self {
        Self::with_max_window(DEFAULT_MAX_WINDOW)
    }

    pub fn with_max_window(max_window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                max_window_ms: duration_ms(max_window),
                started: false,
                stopped: false,
            }),
            changed: Notify::new(),
        }
    }

    /// Change the window size. Only allowed before any poller has reported.
    pub fn set_max_window(&self, max_window: Duration) -> Result<(), SyncError> {
        if max_window.is_zero() {
            return Err(SyncError::InvalidWindow);
        }

        let mut inner = self.inner.lock();
        if inner.started {
            return Err(SyncError::AlreadyStarted);
        }
        inner.max_window_ms = duration_ms(max_window);
        Ok(())
    }

    pub fn max_window(&self) -> Duration {
        let ms = self.inner.lock().max_window_ms;
        Duration::from_millis(u64::try_from(ms).unwrap_or(0))
    }

    pub fn register(&self, id: PollerId) {
        self.inner
            .lock()
            .entries
            .entry(id)
            .or_insert_with(|| SyncEntry::new(id));
    }

    /// Remove a poller. Waiters are woken since the oldest entry may be gone.
    pub fn deregister(&self, id: PollerId) {
        let removed = self.inner.lock().entries.remove(&id).is_some();
        if removed {
            self.changed.notify_waiters();
        }
    }

    pub fn registered(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn entry(&self, id: PollerId) -> Option<SyncEntry> {
        self.inner.lock().entries.get(&id).copied()
    }

    /// Current spread between the latest and oldest reported start.
    pub fn spread(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        let (oldest, latest) = (inner.oldest()?, inner.latest()?);
        Some(Duration::from_millis(u64::try_from(latest - oldest).unwrap_or(0)))
    }

    /// Report the start of the next window for `id`, waiting while the caller
    /// is too far ahead of the slowest registered poller.
    pub async fn report(&self, id: PollerId, start_ms: i64) -> SyncOutcome {
        {
            let mut inner = self.inner.lock();
            inner.started = true;

            let entry = inner.entries.entry(id).or_insert_with(|| SyncEntry::new(id));
            entry.last_reported_start_ms = start_ms;
            entry.is_set = true;

            if inner.stopped {
                return SyncOutcome::Stopped;
            }

            let oldest = inner.oldest().unwrap_or(start_ms);
            if start_ms - oldest < inner.max_window_ms {
                drop(inner);
                // Siblings waiting on us may now be back inside the window.
                self.changed.notify_waiters();
                return SyncOutcome::InSync;
            }

            debug!(
                poller_id = id,
                ahead_ms = start_ms - oldest,
                max_window_ms = inner.max_window_ms,
                "poller ahead of slowest sibling, waiting",
            );
        }

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.inner.lock();
                if inner.stopped {
                    return SyncOutcome::Stopped;
                }
                if inner.within_window() {
                    break;
                }
            }

            let _ = tokio::time::timeout(FALLBACK_POLL_INTERVAL, notified).await;
        }

        debug!(poller_id = id, "poller back in sync");
        SyncOutcome::InSync
    }

    /// Permanently release every current and future waiter.
    pub fn stop(&self) {
        self.inner.lock().stopped = true;
        self.changed.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    /// Re-arm a stopped barrier for a new collection run. Reported starts are
    /// forgotten; registrations are kept.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = false;
        inner.started = false;
        for entry in inner.entries.values_mut() {
            entry.is_set = false;
        }
    }
}

impl Default for SyncBarrier {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const MIN: i64 = 60_000;

    #[tokio::test]
    async fn test_single_poller_never_blocks() {
        let barrier = SyncBarrier::new();
        barrier.register(1);

        for start in [0, 100 * MIN, 10_000 * MIN] {
            let outcome = tokio::time::timeout(Duration::from_millis(100), barrier.report(1, start))
                .await
                .expect("single poller must not block");
            assert_eq!(outcome, SyncOutcome::InSync);
        }
    }

    #[tokio::test]
    async fn test_empty_barrier_never_blocks() {
        let barrier = SyncBarrier::new();
        let outcome = tokio::time::timeout(Duration::from_millis(100), barrier.report(7, 42))
            .await
            .expect("unregistered reporter must not block");
        assert_eq!(outcome, SyncOutcome::InSync);
        assert_eq!(barrier.registered(), 1);
    }

    #[tokio::test]
    async fn test_within_window_proceeds() {
        let barrier = SyncBarrier::new();
        barrier.register(1);
        barrier.register(2);

        assert_eq!(barrier.report(1, 0).await, SyncOutcome::InSync);
        let outcome = tokio::time::timeout(Duration::from_millis(100), barrier.report(2, 2 * MIN))
            .await
            .expect("two minutes ahead is inside the default window");
        assert_eq!(outcome, SyncOutcome::InSync);
        assert_eq!(barrier.spread(), Some(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn test_fast_poller_waits_for_slow_sibling() {
        let barrier = Arc::new(SyncBarrier::new());
        barrier.register(1);
        barrier.register(2);

        barrier.report(1, 0).await;

        let fast = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.report(2, 10 * MIN).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fast.is_finished(), "fast poller should be blocked");

        // Slow poller catches up to within three minutes.
        barrier.report(1, 8 * MIN).await;

        let outcome = tokio::time::timeout(Duration::from_millis(500), fast)
            .await
            .expect("fast poller released")
            .expect("join");
        assert_eq!(outcome, SyncOutcome::InSync);
        assert!(barrier.spread().expect("spread") <= barrier.max_window());
    }

    #[tokio::test]
    async fn test_stop_releases_waiters() {
        let barrier = Arc::new(SyncBarrier::new());
        barrier.register(1);
        barrier.register(2);
        barrier.report(1, 0).await;

        let fast = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.report(2, 60 * MIN).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        barrier.stop();
        let outcome = tokio::time::timeout(Duration::from_millis(200), fast)
            .await
            .expect("released promptly")
            .expect("join");
        assert_eq!(outcome, SyncOutcome::Stopped);

        // Once stopped, reports never block.
        assert_eq!(barrier.report(2, 600 * MIN).await, SyncOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_deregister_releases_waiters() {
        let barrier = Arc::new(SyncBarrier::new());
        barrier.register(1);
        barrier.register(2);
        barrier.report(1, 0).await;

        let fast = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.report(2, 60 * MIN).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        barrier.deregister(1);
        let outcome = tokio::time::timeout(Duration::from_millis(200), fast)
            .await
            .expect("released once the slow poller leaves")
            .expect("join");
        assert_eq!(outcome, SyncOutcome::InSync);
    }

    #[tokio::test]
    async fn test_window_cannot_change_after_start() {
        let barrier = SyncBarrier::new();
        barrier
            .set_max_window(Duration::from_secs(30))
            .expect("allowed before start");
        assert_eq!(barrier.max_window(), Duration::from_secs(30));
        assert_eq!(
            barrier.set_max_window(Duration::ZERO),
            Err(SyncError::InvalidWindow)
        );

        barrier.report(1, 0).await;
        assert_eq!(
            barrier.set_max_window(Duration::from_secs(60)),
            Err(SyncError::AlreadyStarted)
        );

        barrier.reset();
        assert!(barrier.set_max_window(Duration::from_secs(60)).is_ok());
        assert!(!barrier.entry(1).expect("still registered").is_set);
    }
}
