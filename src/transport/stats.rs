use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free transport counters.
///
/// Counters are cumulative for the lifetime of the client; `snapshot()`
/// reads them without resetting so several observers can share one set.
#[derive(Debug, Default)]
pub struct TransportStats {
    connect_attempts: AtomicU64,
    connections_opened: AtomicU64,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_lost: AtomicU64,
    messages_discarded: AtomicU64,
}

/// Point-in-time copy of `TransportStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    pub connect_attempts: u64,
    pub connections_opened: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_lost: u64,
    pub messages_discarded: u64,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_lost(&self) {
        self.messages_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self, n: usize) {
        self.messages_discarded.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_lost: self.messages_lost.load(Ordering::Relaxed),
            messages_discarded: self.messages_discarded.load(Ordering::Relaxed),
        }
    }
}

impl TransportStatsSnapshot {
    /// Counter increments since `earlier`.
    pub fn since(&self, earlier: &Self) -> Self {
        Self {
            connect_attempts: self.connect_attempts.saturating_sub(earlier.connect_attempts),
            connections_opened: self
                .connections_opened
                .saturating_sub(earlier.connections_opened),
            messages_sent: self.messages_sent.saturating_sub(earlier.messages_sent),
            bytes_sent: self.bytes_sent.saturating_sub(earlier.bytes_sent),
            messages_lost: self.messages_lost.saturating_sub(earlier.messages_lost),
            messages_discarded: self
                .messages_discarded
                .saturating_sub(earlier.messages_discarded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = TransportStats::new();
        stats.record_connect_attempt();
        stats.record_connect_attempt();
        stats.record_connection_opened();
        stats.record_sent(10);
        stats.record_sent(5);
        stats.record_lost();
        stats.record_discarded(7);

        let snap = stats.snapshot();
        assert_eq!(snap.connect_attempts, 2);
        assert_eq!(snap.connections_opened, 1);
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_sent, 15);
        assert_eq!(snap.messages_lost, 1);
        assert_eq!(snap.messages_discarded, 7);
    }

    #[test]
    fn test_snapshot_does_not_reset() {
        let stats = TransportStats::new();
        stats.record_sent(1);
        assert_eq!(stats.snapshot(), stats.snapshot());
    }

    #[test]
    fn test_since_computes_delta() {
        let stats = TransportStats::new();
        stats.record_sent(4);
        let first = stats.snapshot();
        stats.record_sent(6);
        stats.record_lost();

        let delta = stats.snapshot().since(&first);
        assert_eq!(delta.messages_sent, 1);
        assert_eq!(delta.bytes_sent, 6);
        assert_eq!(delta.messages_lost, 1);
        assert_eq!(delta.connect_attempts, 0);
    }
}
