//! Per-source polling state machine.
//!
//! A `Poller` asks its query window producer for the next window, waits on
//! the shared sync barrier, collects the window through its strategy and
//! sleeps until the next cycle. Configuration is fixed once `run` starts.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collect::{CollectContext, CollectError, MetadataSink, SourcePlugin, Strategy};
use crate::query::{
    CollectionMode, ProducerKind, QueriesComplete, QueryWindow, QueryWindowProducer,
    RealtimeProducer,
};
use crate::sync::{PollerId, SyncBarrier, SyncError};
use crate::transport::{
    OutboundMessage, TransportClient, TransportConfig, TransportError, TransportStatsSnapshot,
};

/// Default realtime cadence, also passed to the plugin as its fetch hint.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("cannot {operation} once the poller has started")]
    AlreadyStarted { operation: &'static str },
    #[error("a plugin has already been attached to this poller")]
    PluginAlreadyAttached,
    #[error("no plugin attached")]
    MissingPlugin,
    #[error("no query window producer attached")]
    MissingProducer,
    #[error("no transport client configured")]
    MissingTransport,
    #[error("poller is still running")]
    StillRunning,
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    New,
    Configured,
    Running,
    Paused,
    Finished,
}

impl fmt::Display for PollerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Passed to the finished callback when a run ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedReport {
    pub poller_id: PollerId,
    pub name: String,
    pub queries_finished: bool,
    pub cycles: u64,
}

pub type FinishedCallback = Arc<dyn Fn(FinishedReport) + Send + Sync>;

/// Polls one source and forwards what it collects.
pub struct Poller<P: SourcePlugin> {
    id: PollerId,
    name: String,
    barrier: Arc<SyncBarrier>,

    // Producers are not thread safe; every access goes through this lock.
    producer: Mutex<Option<Box<dyn QueryWindowProducer>>>,
    // Untouched copy of the attached producer, restored by `reset`.
    initial_producer: Mutex<Option<Box<dyn QueryWindowProducer>>>,
    plugin: Mutex<Option<Arc<P>>>,
    strategy: Mutex<Strategy>,
    transport_cfg: Mutex<Option<TransportConfig>>,
    transport: Mutex<Option<Arc<TransportClient>>>,
    metadata: Mutex<Option<Arc<dyn MetadataSink>>>,
    initial_message: Mutex<Option<String>>,
    update_interval: Mutex<Duration>,
    finished_callback: Mutex<Option<FinishedCallback>>,

    update_schema_on_start: AtomicBool,
    schema_armed: AtomicBool,

    cancel: Mutex<CancellationToken>,
    started: AtomicBool,
    finished: AtomicBool,
    paused: AtomicBool,
    pause_changed: Notify,
    started_at: Mutex<Option<DateTime<Utc>>>,
    cycles: AtomicU64,
    fetch_failures: AtomicU64,
}

impl<P: SourcePlugin> Poller<P> {
    pub fn new(id: PollerId, name: impl Into<String>, barrier: Arc<SyncBarrier>) -> Self {
        Self {
            id,
            name: name.into(),
            barrier,
            producer: Mutex::new(None),
            initial_producer: Mutex::new(None),
            plugin: Mutex::new(None),
            strategy: Mutex::new(Strategy::internal_time_series()),
            transport_cfg: Mutex::new(None),
            transport: Mutex::new(None),
            metadata: Mutex::new(None),
            initial_message: Mutex::new(None),
            update_interval: Mutex::new(DEFAULT_UPDATE_INTERVAL),
            finished_callback: Mutex::new(None),
            update_schema_on_start: AtomicBool::new(false),
            schema_armed: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            pause_changed: Notify::new(),
            started_at: Mutex::new(None),
            cycles: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
        }
    }

    // --- configuration -----------------------------------------------------

    fn ensure_not_started(&self, operation: &'static str) -> Result<(), PollerError> {
        if self.started.load(Ordering::Acquire) {
            error!(poller = %self.name, operation, "poller configuration changed after start");
            return Err(PollerError::AlreadyStarted { operation });
        }
        Ok(())
    }

    pub fn set_plugin(&self, plugin: Arc<P>) -> Result<(), PollerError> {
        self.ensure_not_started("set the plugin")?;

        let mut slot = self.plugin.lock();
        if slot.is_some() {
            error!(poller = %self.name, "a plugin is already attached");
            return Err(PollerError::PluginAlreadyAttached);
        }
        *slot = Some(plugin);
        Ok(())
    }

    pub fn set_producer(
        &self,
        producer: Box<dyn QueryWindowProducer>,
    ) -> Result<(), PollerError> {
        self.ensure_not_started("set the query window producer")?;
        *self.initial_producer.lock() = Some(producer.restarted());
        *self.producer.lock() = Some(producer);
        Ok(())
    }

    pub fn set_strategy(&self, strategy: Strategy) -> Result<(), PollerError> {
        self.ensure_not_started("set the collection strategy")?;
        *self.strategy.lock() = strategy;
        Ok(())
    }

    /// Create the transport client. The producer must be attached first so
    /// the queue can be sized for its mode.
    pub fn set_transport(&self, cfg: TransportConfig) -> Result<(), PollerError> {
        self.ensure_not_started("configure the transport")?;

        let mode = self.mode().ok_or_else(|| {
            error!(poller = %self.name, "transport configured before query window producer");
            PollerError::MissingProducer
        })?;

        let client = TransportClient::new(cfg.clone(), mode);
        *self.transport.lock() = Some(Arc::new(client));
        *self.transport_cfg.lock() = Some(cfg);
        Ok(())
    }

    pub fn set_sync_window_size(&self, secs: u64) -> Result<(), PollerError> {
        self.set_sync_window(Duration::from_secs(secs))
    }

    pub fn set_sync_window(&self, window: Duration) -> Result<(), PollerError> {
        self.ensure_not_started("set the sync window size")?;
        self.barrier
            .set_max_window(window)
            .map_err(|e| {
                error!(poller = %self.name, error = %e, "sync window size rejected");
                PollerError::Sync(e)
            })
    }

    pub fn set_initial_message(&self, message: impl Into<String>) -> Result<(), PollerError> {
        self.ensure_not_started("set the initial message")?;
        *self.initial_message.lock() = Some(message.into());
        Ok(())
    }

    pub fn set_update_interval(&self, interval: Duration) -> Result<(), PollerError> {
        self.ensure_not_started("set the update interval")?;
        *self.update_interval.lock() = interval;
        Ok(())
    }

    pub fn set_update_schema_on_start(&self, value: bool) -> Result<(), PollerError> {
        self.ensure_not_started("set update schema on start")?;
        self.update_schema_on_start.store(value, Ordering::Release);
        Ok(())
    }

    /// Arm schema registration again for the next run.
    pub fn rearm_schema_update(&self) -> Result<(), PollerError> {
        self.set_update_schema_on_start(true)
    }

    pub fn set_metadata_sink(&self, sink: Arc<dyn MetadataSink>) -> Result<(), PollerError> {
        self.ensure_not_started("set the metadata sink")?;
        *self.metadata.lock() = Some(sink);
        Ok(())
    }

    /// Called once at the end of every run.
    pub fn set_finished_callback(
        &self,
        callback: impl Fn(FinishedReport) + Send + Sync + 'static,
    ) {
        *self.finished_callback.lock() = Some(Arc::new(callback));
    }

    // --- accessors ---------------------------------------------------------

    pub fn id(&self) -> PollerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PollerState {
        if self.finished.load(Ordering::Acquire) {
            PollerState::Finished
        } else if self.started.load(Ordering::Acquire) {
            if self.paused.load(Ordering::Acquire) {
                PollerState::Paused
            } else {
                PollerState::Running
            }
        } else if self.is_configured() && self.plugin.lock().is_some() {
            PollerState::Configured
        } else {
            PollerState::New
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.finished.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// A configured poller has a query window producer.
    pub fn is_configured(&self) -> bool {
        self.producer.lock().is_some()
    }

    fn with_producer<T>(&self, f: impl FnOnce(&mut dyn QueryWindowProducer) -> T) -> Option<T> {
        let mut producer = self.producer.lock();
        producer.as_mut().map(|p| f(&mut **p))
    }

    pub fn mode(&self) -> Option<CollectionMode> {
        self.with_producer(|p| p.mode())
    }

    pub fn producer_kind(&self) -> Option<ProducerKind> {
        self.with_producer(|p| p.kind())
    }

    pub fn queries_finished(&self) -> bool {
        self.with_producer(|p| p.queries_finished()).unwrap_or(false)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock()
    }

    pub fn first_query_start(&self) -> Option<DateTime<Utc>> {
        self.with_producer(|p| p.first_query_start()).flatten()
    }

    pub fn final_query_end(&self) -> Option<DateTime<Utc>> {
        self.with_producer(|p| p.final_query_end()).flatten()
    }

    pub fn next_query_start(&self) -> Option<DateTime<Utc>> {
        self.with_producer(|p| p.next_window().start)
    }

    pub fn plugin_name(&self) -> Option<String> {
        self.plugin.lock().as_ref().map(|p| p.name().to_string())
    }

    pub fn update_interval(&self) -> Duration {
        *self.update_interval.lock()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn fetch_failures(&self) -> u64 {
        self.fetch_failures.load(Ordering::Relaxed)
    }

    pub fn transport(&self) -> Result<Arc<TransportClient>, PollerError> {
        self.transport
            .lock()
            .clone()
            .ok_or(PollerError::MissingTransport)
    }

    pub fn transport_stats(&self) -> Option<TransportStatsSnapshot> {
        self.transport.lock().as_ref().map(|t| t.stats())
    }

    // --- control -----------------------------------------------------------

    /// Stop the poller. Pause waits, sync waits and sleeps end immediately;
    /// a fetch already in progress runs to completion.
    pub fn quit(&self) {
        info!(poller = %self.name, "poller asked to quit");
        self.cancel.lock().cancel();
        self.pause_changed.notify_waiters();
    }

    /// Pause after the window currently being collected.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            info!(poller = %self.name, "poller paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            info!(poller = %self.name, "poller resumed");
        }
        self.pause_changed.notify_waiters();
    }

    /// Return a finished poller to its configured state: the producer is
    /// rebuilt as it was attached, with a fresh cancellation token and a
    /// transport client sized for that producer's mode.
    pub fn reset(&self) -> Result<(), PollerError> {
        if self.is_running() {
            error!(poller = %self.name, "cannot reset a running poller");
            return Err(PollerError::StillRunning);
        }

        *self.cancel.lock() = CancellationToken::new();
        self.paused.store(false, Ordering::Release);
        self.finished.store(false, Ordering::Release);
        self.cycles.store(0, Ordering::Relaxed);
        self.fetch_failures.store(0, Ordering::Relaxed);
        *self.started_at.lock() = None;

        let fresh = self.initial_producer.lock().as_ref().map(|p| p.restarted());
        if let Some(fresh) = fresh {
            *self.producer.lock() = Some(fresh);
        }

        let cfg = self.transport_cfg.lock().clone();
        if let Some(cfg) = cfg {
            let mode = self.mode().unwrap_or(CollectionMode::Realtime);
            *self.transport.lock() = Some(Arc::new(TransportClient::new(cfg, mode)));
        }

        self.started.store(false, Ordering::Release);
        debug!(poller = %self.name, "poller reset");
        Ok(())
    }

    /// Hand a message to the transport, running the backlog handler first if
    /// it starts a batch. Without a transport the message is dropped.
    pub async fn transfer_message(&self, msg: OutboundMessage) -> Result<(), PollerError> {
        let transport = self.transport.lock().clone();
        let Some(transport) = transport else {
            warn!(poller = %self.name, "no transport client configured, message dropped");
            return Ok(());
        };
        transport.enqueue(msg).await.map_err(PollerError::Transport)
    }

    // --- run loop ----------------------------------------------------------

    /// Run until `quit` or until a bounded producer runs out.
    ///
    /// Whatever way the loop ends, the transport is drained, the finished
    /// callback runs once and the transport is closed. A panic inside the
    /// loop is re-raised after that cleanup.
    pub async fn run(self: &Arc<Self>) -> Result<(), PollerError> {
        let plugin = self.plugin.lock().clone().ok_or_else(|| {
            error!(poller = %self.name, "run called without a plugin");
            PollerError::MissingPlugin
        })?;
        if !self.is_configured() {
            error!(poller = %self.name, "run called without a query window producer");
            return Err(PollerError::MissingProducer);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(PollerError::AlreadyStarted { operation: "run" });
        }

        *self.started_at.lock() = Some(Utc::now());
        self.schema_armed.store(
            self.update_schema_on_start.load(Ordering::Acquire),
            Ordering::Release,
        );
        self.barrier.register(self.id);

        let transport = self.transport.lock().clone();
        if let Some(transport) = &transport {
            transport.start();
        }

        info!(
            poller = %self.name,
            id = self.id,
            plugin = %plugin.name(),
            mode = ?self.mode(),
            "poller started",
        );

        let this = Arc::clone(self);
        let outcome = tokio::spawn(async move { this.poll_loop(plugin).await }).await;

        self.finish(transport).await;

        match outcome {
            Ok(()) => Ok(()),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                error!(poller = %self.name, error = %e, "poll loop task was cancelled");
                Ok(())
            }
        }
    }

    async fn poll_loop(&self, plugin: Arc<P>) {
        let cancel = self.cancel.lock().clone();

        self.send_initial_message().await;

        while !cancel.is_cancelled() {
            if !self.wait_while_paused(&cancel).await {
                break;
            }

            let cycle_started = Instant::now();
            let Some(window) = self.with_producer(|p| p.next_window()) else {
                error!(poller = %self.name, "query window producer disappeared");
                break;
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.barrier.report(self.id, window.start_ms()) => {}
            }

            self.collect_window(&plugin, &window, &cancel).await;
            self.cycles.fetch_add(1, Ordering::Relaxed);

            let mut cost = cycle_started.elapsed();
            let completion = self
                .with_producer(|p| p.complete_window(window.end))
                .unwrap_or(Ok(()));

            if let Err(done) = completion {
                if !done.continue_realtime {
                    info!(
                        poller = %self.name,
                        last_data_point = %done.last_data_point,
                        "all historical queries complete",
                    );
                    self.quit();
                    break;
                }
                self.switch_to_realtime(&done);
                cost = (Utc::now() - done.last_data_point)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
            }

            let sleep = self
                .with_producer(|p| p.sleep_duration(cost))
                .unwrap_or(Duration::ZERO);
            if !sleep.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(sleep) => {}
                }
            }
        }
    }

    async fn send_initial_message(&self) {
        let message = self.initial_message.lock().clone();
        let Some(message) = message else {
            return;
        };

        debug!(poller = %self.name, "sending initial message");
        if let Err(e) = self.transfer_message(OutboundMessage::new(message)).await {
            warn!(poller = %self.name, error = %e, "failed to queue initial message");
        }
    }

    /// Returns false if the poller was cancelled while waiting.
    async fn wait_while_paused(&self, cancel: &CancellationToken) -> bool {
        loop {
            let notified = self.pause_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return false;
            }
            if !self.paused.load(Ordering::Acquire) {
                return true;
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = notified => {}
            }
        }
    }

    async fn collect_window(&self, plugin: &P, window: &QueryWindow, cancel: &CancellationToken) {
        let strategy = self.strategy.lock().clone();
        let transport = self.transport.lock().clone();
        let metadata = self.metadata.lock().clone();

        let ctx = CollectContext {
            source: &self.name,
            hint_interval_secs: self.update_interval().as_secs(),
            transport: transport.as_deref(),
            metadata: metadata.as_deref(),
            update_schema: &self.schema_armed,
            cancel,
        };

        match strategy.collect(plugin, window, &ctx).await {
            Ok(true) => debug!(poller = %self.name, window = %window, "window collected"),
            Ok(false) => {}
            Err(CollectError::FetchFailed { reason }) => {
                self.fetch_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    poller = %self.name,
                    window = %window,
                    reason = %reason,
                    "fetch failed, no data this cycle",
                );
            }
            Err(e) => warn!(
                poller = %self.name,
                window = %window,
                error = %e,
                "collection failed, no data this cycle",
            ),
        }
    }

    fn switch_to_realtime(&self, done: &QueriesComplete) {
        let interval = self.update_interval();
        *self.producer.lock() = Some(Box::new(
            RealtimeProducer::new(interval).starting_at(done.last_data_point),
        ));

        if let Some(transport) = self.transport.lock().as_ref() {
            transport.set_collection_mode(CollectionMode::Realtime);
        }

        info!(
            poller = %self.name,
            last_data_point = %done.last_data_point,
            "historical queries complete, continuing in realtime",
        );
    }

    async fn finish(&self, transport: Option<Arc<TransportClient>>) {
        if let Some(transport) = &transport {
            transport.wait_until_all_sent().await;
        }

        self.paused.store(false, Ordering::Release);
        self.finished.store(true, Ordering::Release);

        let callback = self.finished_callback.lock().clone();
        match callback {
            Some(callback) => {
                debug!(poller = %self.name, "invoking finished callback");
                callback(FinishedReport {
                    poller_id: self.id,
                    name: self.name.clone(),
                    queries_finished: self.queries_finished(),
                    cycles: self.cycles(),
                });
            }
            None => warn!(poller = %self.name, "no finish callback has been set"),
        }

        self.barrier.deregister(self.id);

        if let Some(transport) = transport {
            // The callback may have queued a final message.
            transport.wait_until_all_sent().await;
            transport.quit().await;
        }

        info!(poller = %self.name, cycles = self.cycles(), "poller finished");
    }
}
