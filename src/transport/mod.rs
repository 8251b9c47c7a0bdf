//! Client for the backend's framed TCP protocol.
//!
//! Pollers hand messages to a bounded queue; one worker task per client
//! drains it over a single connection, reconnecting and retrying as needed
//! and honouring the backend's slow-down requests.

pub mod protocol;
mod queue;
mod sender;
mod stats;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::query::CollectionMode;

pub use queue::MessageQueue;
pub use stats::{TransportStats, TransportStatsSnapshot};

use sender::Sender;

pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_HISTORICAL_QUEUE_CAPACITY: usize = 1_000;
pub const DEFAULT_REALTIME_QUEUE_CAPACITY: usize = 1_000_000;

/// How long an idle worker waits on the queue before re-checking for quit.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

const DRAIN_POLL_FAST: Duration = Duration::from_millis(100);
const DRAIN_POLL_SLOW: Duration = Duration::from_secs(1);
const DRAIN_FAST_BELOW: usize = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connecting to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("message not sent and lost after {attempts} attempts")]
    MessageLost { attempts: u32 },
    #[error("transport client is closed")]
    Closed,
    #[error("transport queue is full")]
    QueueFull,
    #[error("transport I/O")]
    Io(#[from] io::Error),
}

/// Connection and queueing settings for a `TransportClient`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// Send `PRELERT_CMD_ABP` on connect and honour slow-down requests.
    pub accept_back_pressure: bool,
    /// Extra attempts after the first failed send.
    pub retries: u32,
    pub retry_delay: Duration,
    pub historical_queue_capacity: usize,
    pub realtime_queue_capacity: usize,
    /// Upper bound on `wait_until_all_sent`. `None` waits until drained.
    pub drain_timeout: Option<Duration>,
}

impl TransportConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            accept_back_pressure: true,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            historical_queue_capacity: DEFAULT_HISTORICAL_QUEUE_CAPACITY,
            realtime_queue_capacity: DEFAULT_REALTIME_QUEUE_CAPACITY,
            drain_timeout: None,
        }
    }

    pub fn queue_capacity(&self, mode: CollectionMode) -> usize {
        match mode {
            CollectionMode::Historical => self.historical_queue_capacity,
            CollectionMode::Realtime => self.realtime_queue_capacity,
        }
    }
}

/// A message waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub text: String,
    /// Set on the first message of each collected batch; triggers the
    /// backlog check on enqueue.
    pub first_in_batch: bool,
}

impl OutboundMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            first_in_batch: false,
        }
    }

    pub fn first_in_batch(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            first_in_batch: true,
        }
    }
}

/// State shared by the client handle, the sender and the control reader.
#[derive(Debug)]
struct Shared {
    queue: MessageQueue,
    stats: TransportStats,
    /// Current back-pressure delay. Written only by the control reader and
    /// on reconnect.
    slow_down_ms: AtomicU64,
    /// Set while a shutdown drain is in progress.
    draining: AtomicBool,
    /// Set while a message is mid-send.
    sending: AtomicBool,
    mode: Mutex<CollectionMode>,
    cancel: CancellationToken,
}

impl Shared {
    fn new(capacity: usize, mode: CollectionMode) -> Self {
        Self {
            queue: MessageQueue::new(capacity),
            stats: TransportStats::new(),
            slow_down_ms: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            sending: AtomicBool::new(false),
            mode: Mutex::new(mode),
            cancel: CancellationToken::new(),
        }
    }
}

/// Delivers text messages to one backend over a persistent connection.
pub struct TransportClient {
    cfg: TransportConfig,
    shared: Arc<Shared>,
    sender: Arc<tokio::sync::Mutex<Sender>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransportClient {
    /// Create a client whose queue is sized for `mode`. Nothing connects
    /// until `start` or the first `send_now`.
    pub fn new(cfg: TransportConfig, mode: CollectionMode) -> Self {
        let shared = Arc::new(Shared::new(cfg.queue_capacity(mode), mode));
        info!(
            host = %cfg.host,
            port = cfg.port,
            mode = %mode,
            capacity = shared.queue.capacity(),
            "transport queue capacity set",
        );

        let sender = Sender::new(&cfg, Arc::clone(&shared));
        Self {
            cfg,
            shared,
            sender: Arc::new(tokio::sync::Mutex::new(sender)),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the sending worker. It opens the connection straight away so
    /// a bad host or port shows up in the log before any data is ready.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() || self.shared.cancel.is_cancelled() {
            return;
        }

        *worker = Some(tokio::spawn(run_worker(
            Arc::clone(&self.shared),
            Arc::clone(&self.sender),
        )));
    }

    /// Queue a message, waiting while the queue is full.
    ///
    /// The first message of a batch runs the backlog handler first.
    pub async fn enqueue(&self, msg: OutboundMessage) -> Result<(), TransportError> {
        if msg.first_in_batch {
            self.handle_backlog();
        }
        self.shared.queue.push(msg).await
    }

    /// Queue a message only if there is room right now. Usable from
    /// synchronous callbacks.
    pub fn try_enqueue(&self, msg: OutboundMessage) -> Result<(), TransportError> {
        if msg.first_in_batch {
            self.handle_backlog();
        }
        self.shared.queue.try_push(msg)
    }

    /// Deal with messages still queued from earlier batches.
    ///
    /// Realtime data goes stale, so the backlog is dropped. Historical data
    /// is kept and only a warning is logged. Returns the number dropped.
    pub fn handle_backlog(&self) -> usize {
        let backlog = self.shared.queue.len();
        if backlog == 0 {
            return 0;
        }

        match self.collection_mode() {
            CollectionMode::Historical => {
                warn!(
                    port = self.cfg.port,
                    backlog,
                    "backend is not keeping up with the data rate",
                );
                0
            }
            CollectionMode::Realtime => {
                let dropped = self.shared.queue.discard_all();
                self.shared.stats.record_discarded(dropped);
                warn!(
                    port = self.cfg.port,
                    discarded = dropped,
                    "backend is not keeping up with the data rate, discarding backlog",
                );
                dropped
            }
        }
    }

    /// Send one message immediately on the caller's task, bypassing the
    /// queue. Waits for any send already in progress.
    pub async fn send_now(&self, text: &str) -> Result<(), TransportError> {
        if self.shared.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.sender.lock().await.send(text, true).await
    }

    /// Wait for the queue to empty and the in-flight message to finish.
    ///
    /// While waiting, a failure to reconnect discards the rest of the queue
    /// so shutdown cannot stall on retries. `drain_timeout` caps the wait.
    pub async fn wait_until_all_sent(&self) {
        let queue = &self.shared.queue;
        if queue.is_empty() && !self.is_sending() {
            info!(
                host = %self.cfg.host,
                port = self.cfg.port,
                "no messages are waiting to be sent",
            );
            return;
        }

        info!(
            host = %self.cfg.host,
            port = self.cfg.port,
            queued = queue.len(),
            "waiting for all messages to be sent",
        );

        let deadline = self.cfg.drain_timeout.map(|d| Instant::now() + d);
        let expired = || deadline.is_some_and(|d| Instant::now() >= d);

        self.shared.draining.store(true, Ordering::Release);
        loop {
            let remaining = queue.len();
            if remaining == 0 {
                break;
            }
            if !self.worker_alive() {
                warn!(remaining, "transport worker is not running, giving up on drain");
                break;
            }
            if expired() {
                warn!(remaining, "drain timeout reached with messages still queued");
                break;
            }

            let pause = if remaining < DRAIN_FAST_BELOW {
                DRAIN_POLL_FAST
            } else {
                DRAIN_POLL_SLOW
            };
            tokio::time::sleep(pause).await;
        }
        self.shared.draining.store(false, Ordering::Release);

        if queue.is_empty() {
            info!(
                host = %self.cfg.host,
                port = self.cfg.port,
                "queue of messages to be sent is now empty",
            );
        }

        while self.is_sending() && !expired() {
            tokio::time::sleep(DRAIN_POLL_FAST).await;
        }
    }

    /// Stop the worker and close the connection. Queued messages that have
    /// not been sent are left unsent.
    pub async fn quit(&self) {
        self.shared.cancel.cancel();
        self.shared.queue.close();

        let handle = self.worker.lock().take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!(error = %e, "transport worker did not exit cleanly");
                }
            }
            None => self.sender.lock().await.close().await,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    fn worker_alive(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn set_collection_mode(&self, mode: CollectionMode) {
        let mut current = self.shared.mode.lock();
        if *current != mode {
            let previous = *current;
            *current = mode;
            debug!(from = %previous, to = %mode, "transport collection mode changed");
        }
    }

    pub fn collection_mode(&self) -> CollectionMode {
        *self.shared.mode.lock()
    }

    /// Back-pressure delay currently applied before each send.
    pub fn slow_down(&self) -> Duration {
        Duration::from_millis(self.shared.slow_down_ms.load(Ordering::Acquire))
    }

    pub fn is_sending(&self) -> bool {
        self.shared.sending.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.shared.queue.capacity()
    }

    pub fn host(&self) -> &str {
        &self.cfg.host
    }

    pub fn port(&self) -> u16 {
        self.cfg.port
    }

    pub fn config(&self) -> &TransportConfig {
        &self.cfg
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn run_worker(shared: Arc<Shared>, sender: Arc<tokio::sync::Mutex<Sender>>) {
    {
        let mut sender = sender.lock().await;
        tokio::select! {
            _ = shared.cancel.cancelled() => {}
            // Failures are logged by the sender; the first send reconnects.
            _ = sender.ensure_connected() => {}
        }
    }

    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            msg = shared.queue.pop_timeout(IDLE_POLL_INTERVAL) => msg,
        };
        let Some(msg) = next else {
            continue;
        };

        let flush = shared.queue.is_empty();
        if let Err(e) = sender.lock().await.send(&msg.text, flush).await {
            debug!(error = %e, "queued message dropped");
        }
    }

    sender.lock().await.close().await;

    let unsent = shared.queue.len();
    if unsent > 0 {
        warn!(unsent, "transport worker ending with unsent messages");
    }
}
