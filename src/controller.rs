//! Data stream controller.
//!
//! One poll thread owns the estimator and normalizer and runs two timers: the
//! fast poll tick (read adapters, fuse, merge, publish) and the slow health
//! tick (reconnect, re-evaluate). Adapter reads may fan out over a small
//! rayon pool; everything after the reads is sequential, so snapshots are
//! published strictly in tick order.

use crossbeam::channel::{
    bounded, tick, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError,
};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::adapters::{ReadOutcome, SourceAdapter};
use crate::config::{PipelineConfig, TelemetryConfig};
use crate::error::{AdapterError, ConfigError, ConfigResult, MeasurementError};
use crate::fusion::{FusionEstimator, FusionEvent};
use crate::health::{HealthMonitor, HealthState, ReconnectPolicy, SourceHealth, SourceHealthReport};
use crate::normalizer::{CanonicalSample, ChannelNormalizer};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::subscribe::{SubscriberId, SubscriberRegistry, SubscriberStats};
use crate::types::{current_timestamp, RawReading, Reading, SourceKind};

const MAX_READ_WORKERS: usize = 8;

// ─── Adapter slots ───────────────────────────────────────────────────────────

/// One adapter behind its own lock. The poll and health paths only ever
/// `try_lock`, so an adapter stuck in a hung `close()` is skipped rather than
/// stalling a tick.
struct AdapterSlot {
    source_id: String,
    kind: SourceKind,
    adapter: Mutex<Box<dyn SourceAdapter>>,
}

impl AdapterSlot {
    fn new(adapter: Box<dyn SourceAdapter>) -> Self {
        Self {
            source_id: adapter.source_id().to_string(),
            kind: adapter.kind(),
            adapter: Mutex::new(adapter),
        }
    }

    fn try_adapter(&self) -> Option<MutexGuard<'_, Box<dyn SourceAdapter>>> {
        match self.adapter.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// One bounded read, then drain whatever is already buffered.
    fn poll(&self, timeout: Duration, max_drain: usize) -> Vec<ReadOutcome> {
        let Some(mut adapter) = self.try_adapter() else {
            debug!("[adapter:{}] busy, skipped this tick", self.source_id);
            return Vec::new();
        };
        if !adapter.is_connected() {
            return Vec::new();
        }

        let mut outcomes = vec![read_guarded(&mut **adapter, timeout)];
        while outcomes.len() <= max_drain
            && matches!(outcomes.last(), Some(ReadOutcome::Reading(_)))
        {
            match read_guarded(&mut **adapter, Duration::ZERO) {
                // Running dry mid-drain is expected, not a missed deadline
                ReadOutcome::Timeout => break,
                other => outcomes.push(other),
            }
        }
        outcomes
    }

    fn connect(&self) -> Option<Result<(), AdapterError>> {
        let mut adapter = self.try_adapter()?;
        Some(
            catch_unwind(AssertUnwindSafe(|| adapter.connect())).unwrap_or_else(|_| {
                Err(AdapterError::Connection(
                    "adapter panicked during connect".to_string(),
                ))
            }),
        )
    }
}

fn read_guarded(adapter: &mut dyn SourceAdapter, timeout: Duration) -> ReadOutcome {
    match catch_unwind(AssertUnwindSafe(|| adapter.read(timeout))) {
        Ok(result) => ReadOutcome::from(result),
        Err(_) => ReadOutcome::Failed(AdapterError::Io(
            "adapter panicked during read".to_string(),
        )),
    }
}

/// Record the outcome of a connect attempt in the source's health.
fn record_connect(
    health: &HealthMonitor,
    slot: &AdapterSlot,
    result: &Result<(), AdapterError>,
    policy: &ReconnectPolicy,
    reconnect: bool,
) {
    let now = Instant::now();
    health.with_source(&slot.source_id, |h| match result {
        Ok(()) => {
            h.record_connected(now);
            h.restart.record_success(policy, now);
            if reconnect {
                h.record_reconnect();
                info!("[adapter:{}] reconnected", slot.source_id);
            } else {
                info!("[adapter:{}] connected ({})", slot.source_id, slot.kind);
            }
        }
        Err(err) => {
            h.record_error(err);
            h.record_disconnected();
            h.restart.record_failed_attempt(policy, now);
            warn!(
                "[adapter:{}] connect failed: {} (attempt {}, next retry in {:.1}s)",
                slot.source_id,
                err,
                h.restart.attempts,
                h.restart.current_cooldown.as_secs_f64()
            );
        }
    });
}

fn read_pool(config: &PipelineConfig, adapters: usize) -> Option<ThreadPool> {
    if !config.parallel_reads || adapters < 2 {
        return None;
    }
    match rayon::ThreadPoolBuilder::new()
        .num_threads(adapters.min(MAX_READ_WORKERS))
        .thread_name(|i| format!("telemetry-read-{}", i))
        .build()
    {
        Ok(pool) => Some(pool),
        Err(e) => {
            warn!("[poll] read pool unavailable, reading sequentially: {}", e);
            None
        }
    }
}

fn log_fusion_events(source_id: &str, events: &[FusionEvent]) {
    for event in events {
        match event {
            FusionEvent::StatusChanged { from, to } => {
                info!("[fusion] status {} -> {}", from, to)
            }
            FusionEvent::GpsRejected(err) | FusionEvent::ImuRejected(err) => match err {
                MeasurementError::StaleData { .. } => {
                    debug!("[fusion] {} reading dropped: {}", source_id, err)
                }
                MeasurementError::InvalidMeasurement(_) => {
                    warn!("[fusion] {} reading rejected: {}", source_id, err)
                }
            },
            FusionEvent::OriginSeeded { lat, lon } => {
                info!("[fusion] origin seeded at {:.6}, {:.6}", lat, lon)
            }
            FusionEvent::BiasSettled { bias, samples } => info!(
                "[fusion] IMU bias settled from {} samples: accel {:?} gyro {:?}",
                samples, bias.accel, bias.gyro
            ),
            FusionEvent::SettlingRestarted { reason } => {
                info!("[fusion] bias settling restarted: {}", reason)
            }
            FusionEvent::ImuGap { dt } => {
                debug!("[fusion] IMU gap of {:.2}s clamped", dt)
            }
            FusionEvent::FilterFault(err) => error!("[fusion] filter fault: {}", err),
        }
    }
}

fn rejection(events: &[FusionEvent]) -> Option<&MeasurementError> {
    events.iter().find_map(|event| match event {
        FusionEvent::GpsRejected(err) | FusionEvent::ImuRejected(err) => Some(err),
        _ => None,
    })
}

// ─── Poll thread ─────────────────────────────────────────────────────────────

struct PollLoop {
    config: PipelineConfig,
    policy: ReconnectPolicy,
    slots: Vec<Arc<AdapterSlot>>,
    normalizer: ChannelNormalizer,
    estimator: FusionEstimator,
    store: Arc<SnapshotStore>,
    health: Arc<HealthMonitor>,
    subscribers: Arc<SubscriberRegistry>,
    pool: Option<ThreadPool>,
    /// Store epoch this loop publishes into; stale once `stop()` clears it
    epoch: u64,
    ticks: u64,
}

impl PollLoop {
    fn run(mut self, stop_rx: Receiver<()>) {
        let poll = tick(self.config.poll_period());
        let health = tick(self.config.health_period());
        info!(
            "[poll] started: {} adapter(s), poll every {:?}, health every {:?}",
            self.slots.len(),
            self.config.poll_period(),
            self.config.health_period()
        );

        loop {
            crossbeam::select! {
                recv(stop_rx) -> _ => break,
                recv(poll) -> _ => self.poll_once(),
                recv(health) -> _ => self.health_check(),
            }
        }
        info!("[poll] stopped after {} tick(s)", self.ticks);
    }

    fn read_all(&self) -> Vec<Vec<ReadOutcome>> {
        let max_drain = self.config.max_drain_per_tick;
        let read = |slot: &Arc<AdapterSlot>| {
            slot.poll(self.config.read_timeout(slot.kind), max_drain)
        };
        match &self.pool {
            Some(pool) => pool.install(|| self.slots.par_iter().map(read).collect()),
            None => self.slots.iter().map(read).collect(),
        }
    }

    fn poll_once(&mut self) {
        let started = Instant::now();
        let outcomes = self.read_all();

        let now = current_timestamp();
        let read_at = Instant::now();
        let mut readings: Vec<RawReading> = Vec::new();

        for (slot, outcomes) in self.slots.iter().zip(outcomes) {
            for outcome in outcomes {
                match outcome {
                    ReadOutcome::Reading(reading) => {
                        let events = match &reading {
                            Reading::Gps(fix) => self.estimator.feed_gps(fix, now),
                            Reading::Imu(imu) => self.estimator.feed_imu(imu, now),
                            Reading::Channels(_) => Vec::new(),
                        };
                        log_fusion_events(&slot.source_id, &events);
                        let rejected = rejection(&events);
                        self.health.with_source(&slot.source_id, |h| {
                            h.record_read(read_at);
                            if let Some(err) = rejected {
                                h.record_rejection(&err.to_string());
                            }
                        });
                        if rejected.is_none() {
                            readings.push(reading.to_raw(&slot.source_id));
                        }
                    }
                    ReadOutcome::Timeout => {
                        self.health.with_source(&slot.source_id, |h| h.record_timeout());
                    }
                    ReadOutcome::Failed(err) => {
                        debug!("[adapter:{}] read failed: {}", slot.source_id, err);
                        self.health.with_source(&slot.source_id, |h| {
                            h.record_error(&err);
                            h.restart.signal_restart();
                        });
                    }
                }
            }
        }

        let events = self.estimator.check_timeouts(now);
        log_fusion_events(&self.config.fusion_source_id, &events);

        let fused = self.estimator.state();
        readings.push(fused.to_raw_reading(&self.config.fusion_source_id));

        let sample = self.normalizer.merge(now, &readings);
        let Some(snapshot) = self.store.publish(self.epoch, sample, fused.status) else {
            debug!("[poll] store was cleared, dropping tick");
            return;
        };
        self.subscribers.publish(&snapshot);
        self.ticks += 1;

        let elapsed = started.elapsed();
        if elapsed > self.config.poll_period() {
            debug!(
                "[poll] tick {} took {:?} (period {:?})",
                snapshot.sequence,
                elapsed,
                self.config.poll_period()
            );
        }
    }

    fn health_check(&self) {
        for slot in &self.slots {
            self.check_slot(slot);
        }
        let now = Instant::now();
        let policy = self.policy;
        self.health.for_each(|h| {
            h.evaluate(&policy, now);
        });
        debug!("[health] {}", self.health.format_status());
    }

    /// Sync connection state with the adapter and retry it when due.
    fn check_slot(&self, slot: &AdapterSlot) {
        let connected = match slot.try_adapter() {
            Some(adapter) => adapter.is_connected(),
            None => return,
        };
        let now = Instant::now();
        let due = self
            .health
            .with_source(&slot.source_id, |h| {
                if connected {
                    if !h.connected {
                        h.record_connected(now);
                    }
                    return false;
                }
                if h.connected {
                    warn!("[adapter:{}] connection lost", slot.source_id);
                    h.record_disconnected();
                }
                h.restart.signal_restart();
                h.restart.can_retry(now) && !h.restart.exhausted(&self.policy)
            })
            .unwrap_or(false);
        if !due {
            return;
        }

        debug!("[adapter:{}] attempting reconnect", slot.source_id);
        if let Some(result) = slot.connect() {
            record_connect(&self.health, slot, &result, &self.policy, true);
        }
    }
}

struct Worker {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

// ─── Controller ──────────────────────────────────────────────────────────────

/// Owns the adapters, the shared snapshot store and the poll thread.
///
/// Several controllers can coexist; nothing here is process-global.
pub struct DataStreamController {
    config: TelemetryConfig,
    slots: Vec<Arc<AdapterSlot>>,
    normalizer: ChannelNormalizer,
    store: Arc<SnapshotStore>,
    health: Arc<HealthMonitor>,
    subscribers: Arc<SubscriberRegistry>,
    worker: Mutex<Option<Worker>>,
    /// Completion signal of a poll thread that outlived the stop grace period
    detached: Mutex<Option<Receiver<()>>>,
}

impl DataStreamController {
    /// Validate the configuration and take ownership of the detected
    /// adapters. Nothing is opened until [`start`](Self::start).
    pub fn new(
        config: TelemetryConfig,
        adapters: Vec<Box<dyn SourceAdapter>>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let normalizer = ChannelNormalizer::new(config.aliases.clone())?;

        let mut ids = BTreeSet::new();
        for adapter in &adapters {
            let id = adapter.source_id();
            if id == config.pipeline.fusion_source_id || !ids.insert(id.to_string()) {
                return Err(ConfigError::DuplicateSource(id.to_string()));
            }
        }

        let policy = config.pipeline.reconnect_policy();
        let now = Instant::now();
        let health = HealthMonitor::new();
        let slots: Vec<Arc<AdapterSlot>> = adapters
            .into_iter()
            .map(|adapter| Arc::new(AdapterSlot::new(adapter)))
            .collect();
        for slot in &slots {
            health.register(SourceHealth::new(
                &slot.source_id,
                slot.kind,
                config.pipeline.silence_threshold(slot.kind),
                &policy,
                now,
            ));
        }
        for id in config.expected_source_ids() {
            if !ids.contains(&id) {
                warn!("[health] configured source {} was not detected", id);
                health.register(SourceHealth::missing(&id, &policy, now));
            }
        }

        let store = SnapshotStore::new(normalizer.empty_sample(current_timestamp()));
        Ok(Self {
            config,
            slots,
            normalizer,
            store: Arc::new(store),
            health: Arc::new(health),
            subscribers: Arc::new(SubscriberRegistry::new()),
            worker: Mutex::new(None),
            detached: Mutex::new(None),
        })
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Always taken while holding the worker lock.
    fn detached(&self) -> MutexGuard<'_, Option<Receiver<()>>> {
        self.detached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open every adapter (best effort) and start polling. Calling it while
    /// already running does nothing. Fails with `WouldBlock` while a poll
    /// thread detached by `stop()` is still running, or if the poll thread
    /// cannot be spawned.
    pub fn start(&self) -> io::Result<()> {
        let mut worker = self.worker();
        if worker.is_some() {
            debug!("[poll] start ignored: already running");
            return Ok(());
        }
        {
            let mut detached = self.detached();
            let straggling = matches!(
                detached.as_ref().map(|done_rx| done_rx.try_recv()),
                Some(Err(TryRecvError::Empty))
            );
            if straggling {
                warn!("[poll] start refused: previous poll thread has not exited");
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "previous poll thread is still running",
                ));
            }
            *detached = None;
        }

        let pipeline = &self.config.pipeline;
        let policy = pipeline.reconnect_policy();
        for slot in &self.slots {
            match slot.connect() {
                Some(result) => record_connect(&self.health, slot, &result, &policy, false),
                None => warn!(
                    "[adapter:{}] still busy from a previous stop, will retry",
                    slot.source_id
                ),
            }
        }
        let now = Instant::now();
        self.health.for_each(|h| {
            h.evaluate(&policy, now);
        });

        let poll_loop = PollLoop {
            config: pipeline.clone(),
            policy,
            slots: self.slots.clone(),
            normalizer: {
                let mut normalizer = self.normalizer.clone();
                normalizer.reset();
                normalizer
            },
            estimator: FusionEstimator::new(self.config.fusion.clone()),
            store: Arc::clone(&self.store),
            health: Arc::clone(&self.health),
            subscribers: Arc::clone(&self.subscribers),
            pool: read_pool(pipeline, self.slots.len()),
            epoch: self.store.epoch(),
            ticks: 0,
        };

        let (stop_tx, stop_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("telemetry-poll".to_string())
            .spawn(move || {
                poll_loop.run(stop_rx);
                let _ = done_tx.send(());
            })?;

        *worker = Some(Worker {
            stop_tx,
            done_rx,
            handle,
        });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker().is_some()
    }

    /// Halt polling, close every adapter and clear the snapshot. Returns
    /// within the configured stop grace period even if a `close()` hangs.
    /// Calling it while stopped does nothing.
    pub fn stop(&self) {
        let mut worker = self.worker();
        let Some(running) = worker.take() else {
            return;
        };
        let pipeline = &self.config.pipeline;
        let grace = pipeline.stop_grace();
        let deadline = Instant::now() + grace;

        let _ = running.stop_tx.send(());
        match running.done_rx.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if running.handle.join().is_err() {
                    error!("[poll] poll thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("[poll] poll thread did not stop within {:?}, detaching", grace);
                *self.detached() = Some(running.done_rx);
            }
        }

        self.close_adapters(pipeline.close_timeout(), deadline);
        self.store.clear(current_timestamp());

        let policy = pipeline.reconnect_policy();
        let now = Instant::now();
        self.health.for_each(|h| {
            h.record_disconnected();
            h.evaluate(&policy, now);
        });
        info!("[poll] controller stopped at sequence {}", self.store.sequence());
    }

    /// Close adapters on their own threads and wait for them until the close
    /// timeout or the stop deadline, whichever comes first.
    fn close_adapters(&self, close_timeout: Duration, deadline: Instant) {
        let (tx, rx) = unbounded::<(String, Result<(), AdapterError>)>();
        let mut pending = BTreeSet::new();

        for slot in &self.slots {
            let id = slot.source_id.clone();
            let slot = Arc::clone(slot);
            let tx = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("telemetry-close-{}", id))
                .spawn(move || {
                    let mut adapter = slot
                        .adapter
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    let result = catch_unwind(AssertUnwindSafe(|| adapter.close()))
                        .unwrap_or_else(|_| {
                            Err(AdapterError::Io("adapter panicked during close".to_string()))
                        });
                    let _ = tx.send((slot.source_id.clone(), result));
                });
            match spawned {
                Ok(_) => {
                    pending.insert(id);
                }
                Err(e) => error!("[adapter:{}] could not spawn closer: {}", id, e),
            }
        }
        drop(tx);

        let wait_until = (Instant::now() + close_timeout).min(deadline);
        while !pending.is_empty() {
            let remaining = wait_until.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((id, result)) => {
                    pending.remove(&id);
                    match result {
                        Ok(()) => debug!("[adapter:{}] closed", id),
                        Err(err) => warn!("[adapter:{}] close failed: {}", id, err),
                    }
                }
                Err(_) => break,
            }
        }
        for id in &pending {
            warn!(
                "[adapter:{}] close did not finish within {:?}, abandoning it",
                id, close_timeout
            );
        }
    }

    /// Latest published snapshot: sequence number, fusion status and sample.
    pub fn get_latest_snapshot(&self) -> Snapshot {
        self.store.latest()
    }

    pub fn get_latest_sample(&self) -> CanonicalSample {
        self.store.latest_sample()
    }

    pub fn get_health(&self) -> BTreeMap<String, HealthState> {
        self.health.states()
    }

    pub fn get_health_report(&self) -> Vec<SourceHealthReport> {
        self.health.reports()
    }

    /// Call `callback` once per tick from a dedicated delivery thread.
    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&Snapshot) + Send + 'static,
    {
        self.subscribers
            .subscribe(self.config.pipeline.subscriber_queue_depth, callback)
    }

    pub fn subscribe_channel(&self, capacity: usize) -> (SubscriberId, Receiver<Snapshot>) {
        self.subscribers.subscribe_channel(capacity)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn subscriber_stats(&self, id: SubscriberId) -> Option<SubscriberStats> {
        self.subscribers.stats(id)
    }

    /// Shared handle to the snapshot store, for readers that outlive a borrow
    /// of the controller.
    pub fn store(&self) -> Arc<SnapshotStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }
}

impl Drop for DataStreamController {
    fn drop(&mut self) {
        self.stop();
    }
}
