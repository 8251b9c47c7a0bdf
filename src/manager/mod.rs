//! Owns a set of pollers that share one sync barrier.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collect::SourcePlugin;
use crate::config::{BackendConfig, SourceConfig};
use crate::export::HealthMetrics;
use crate::poller::{Poller, PollerError};
use crate::query::CollectionMode;
use crate::sync::{PollerId, SyncBarrier};
use crate::transport::TransportStatsSnapshot;

/// How often the stats reporter refreshes health metrics.
pub const STATS_INTERVAL: Duration = Duration::from_secs(10);

type PollerTask = JoinHandle<Result<(), PollerError>>;

pub struct CollectionManager<P: SourcePlugin> {
    barrier: Arc<SyncBarrier>,
    pollers: Vec<Arc<Poller<P>>>,
    tasks: Mutex<Vec<(String, PollerTask)>>,
    next_id: AtomicU64,
    total: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
    stagger: Duration,
    stats_interval: Duration,
    health: Option<Arc<HealthMetrics>>,
    cancel: Mutex<CancellationToken>,
}

impl<P: SourcePlugin> CollectionManager<P> {
    pub fn new(barrier: Arc<SyncBarrier>) -> Self {
        Self {
            barrier,
            pollers: Vec::new(),
            tasks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            total: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
            stagger: Duration::ZERO,
            stats_interval: STATS_INTERVAL,
            health: None,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Delay between starting consecutive pollers.
    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn barrier(&self) -> &Arc<SyncBarrier> {
        &self.barrier
    }

    /// A poller bound to this manager's barrier with a fresh id. It still
    /// has to be passed to `add_poller`.
    pub fn new_poller(&self, name: impl Into<String>) -> Arc<Poller<P>> {
        let id: PollerId = self.next_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Poller::new(id, name, Arc::clone(&self.barrier)))
    }

    pub fn add_poller(&mut self, poller: Arc<Poller<P>>) {
        let total = Arc::clone(&self.total);
        let finished = Arc::clone(&self.finished);
        let health = self.health.clone();

        poller.set_finished_callback(move |report| {
            let done = finished.fetch_add(1, Ordering::AcqRel) + 1;
            let all = total.load(Ordering::Acquire);

            if let Some(health) = &health {
                health.pollers_finished.set(done as f64);
            }

            debug!(
                poller = %report.name,
                cycles = report.cycles,
                queries_finished = report.queries_finished,
                finished = done,
                total = all,
                "poller reported finished",
            );

            if done == all {
                info!(total = all, "all pollers have finished");
            }
        });

        self.total.fetch_add(1, Ordering::AcqRel);
        self.pollers.push(poller);
    }

    pub fn pollers(&self) -> &[Arc<Poller<P>>] {
        &self.pollers
    }

    pub fn len(&self) -> usize {
        self.pollers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }

    /// Spawn every poller that can run. Realtime pollers always start;
    /// historical ones need a producer and a plugin. Returns false if any
    /// poller was left behind.
    pub async fn start(&self) -> bool {
        let mut all_started = true;
        let mut spawned = 0usize;

        for poller in &self.pollers {
            let startable = match poller.mode() {
                Some(CollectionMode::Realtime) => true,
                Some(CollectionMode::Historical) => poller.is_configured(),
                None => false,
            };

            if !startable || poller.plugin_name().is_none() {
                error!(poller = %poller.name(), state = %poller.state(), "poller is not configured, not starting");
                all_started = false;
                continue;
            }

            if spawned > 0 && !self.stagger.is_zero() {
                tokio::time::sleep(self.stagger).await;
            }

            let p = Arc::clone(poller);
            let handle = tokio::spawn(async move { p.run().await });
            self.tasks.lock().push((poller.name().to_string(), handle));
            spawned += 1;
        }

        if let Some(health) = &self.health {
            health.pollers_running.set(spawned as f64);
            self.spawn_stats_reporter(Arc::clone(health));
        }

        info!(started = spawned, total = self.pollers.len(), "collection started");
        all_started
    }

    pub fn pause(&self) {
        for poller in &self.pollers {
            poller.pause();
        }
    }

    pub fn resume(&self) {
        for poller in &self.pollers {
            poller.resume();
        }
    }

    /// Quit every poller, release barrier waits and join them.
    pub async fn stop(&self) -> Result<()> {
        for poller in &self.pollers {
            poller.quit();
        }
        self.barrier.stop();

        let result = self.wait().await;
        self.cancel.lock().cancel();

        if let Some(health) = &self.health {
            health.pollers_running.set(0.0);
        }

        info!("collection stopped");
        result
    }

    /// Join every spawned poller. Fails if any ended with an error or a
    /// panic; every poller is still joined.
    pub async fn wait(&self) -> Result<()> {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let mut failed = 0usize;

        for (name, handle) in tasks {
            match handle.await {
                Ok(Ok(())) => debug!(poller = %name, "poller joined"),
                Ok(Err(e)) => {
                    error!(poller = %name, error = %e, "poller failed");
                    failed += 1;
                }
                Err(e) => {
                    error!(poller = %name, error = %e, "poller task panicked or was aborted");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            bail!("{failed} poller(s) ended abnormally");
        }
        Ok(())
    }

    /// Re-arm every poller and the barrier for another run.
    pub fn reset(&self) -> Result<(), PollerError> {
        if self.pollers.iter().any(|p| p.is_running()) {
            error!("cannot reset while pollers are running");
            return Err(PollerError::StillRunning);
        }

        for poller in &self.pollers {
            poller.reset()?;
        }
        self.barrier.reset();
        self.finished.store(0, Ordering::Release);
        *self.cancel.lock() = CancellationToken::new();

        if let Some(health) = &self.health {
            health.pollers_finished.set(0.0);
        }

        debug!(pollers = self.pollers.len(), "collection reset");
        Ok(())
    }

    pub fn finished_count(&self) -> usize {
        self.finished.load(Ordering::Acquire)
    }

    pub fn all_finished(&self) -> bool {
        let total = self.total.load(Ordering::Acquire);
        total > 0 && self.finished_count() >= total
    }

    /// Spawn background transport stats reporter.
    fn spawn_stats_reporter(&self, health: Arc<HealthMetrics>) {
        let cancel = self.cancel.lock().clone();
        let pollers = self.pollers.clone();
        let interval = self.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut previous: HashMap<PollerId, (TransportStatsSnapshot, u64, u64)> =
                HashMap::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let mut sent = 0u64;
                        let mut lost = 0u64;

                        for poller in &pollers {
                            let (stats, cycles, failures) = previous
                                .get(&poller.id())
                                .copied()
                                .unwrap_or_default();
                            let now_stats = poller.transport_stats().unwrap_or_default();
                            let now_cycles = poller.cycles();
                            let now_failures = poller.fetch_failures();

                            let delta = now_stats.since(&stats);
                            health.record_transport(poller.name(), &delta);
                            health.record_cycles(
                                poller.name(),
                                now_cycles.saturating_sub(cycles),
                                now_failures.saturating_sub(failures),
                            );

                            if let Ok(transport) = poller.transport() {
                                health
                                    .queue_depth
                                    .with_label_values(&[poller.name()])
                                    .set(transport.queued() as f64);
                            }

                            sent += delta.messages_sent;
                            lost += delta.messages_lost;
                            previous.insert(poller.id(), (now_stats, now_cycles, now_failures));
                        }

                        let running = pollers.iter().filter(|p| p.is_running()).count();
                        health.pollers_running.set(running as f64);

                        if sent > 0 || lost > 0 {
                            info!(sent, lost, running, "transport stats");
                        }
                    }
                }
            }
        });
    }
}

/// Apply one source's configuration to a poller.
pub fn configure_poller<P: SourcePlugin>(
    poller: &Poller<P>,
    source: &SourceConfig,
    backend: &BackendConfig,
    sync_window: Duration,
) -> Result<()> {
    let strategy = source.strategy()?;
    let producer = source.producer()?;
    let uses_transport = strategy.uses_transport();

    poller
        .set_update_interval(source.update_interval)
        .and_then(|()| poller.set_producer(producer))
        .and_then(|()| poller.set_strategy(strategy))
        .and_then(|()| poller.set_update_schema_on_start(source.update_schema_on_start))
        .and_then(|()| poller.set_sync_window(sync_window))
        .with_context(|| format!("configuring source {}", source.name))?;

    if uses_transport {
        poller
            .set_transport(backend.transport_config())
            .with_context(|| format!("configuring transport for source {}", source.name))?;
    } else if source.initial_message.is_some() {
        warn!(source = %source.name, "initial_message ignored for a strategy without transport");
    }

    if let Some(message) = &source.initial_message {
        poller
            .set_initial_message(message.clone())
            .with_context(|| format!("configuring source {}", source.name))?;
    }

    Ok(())
}
