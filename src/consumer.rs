//! Stream consumer: drives readings from the queue through the rule engine.
//!
//! Per message: decode, append to the window cache, run the instant rule,
//! run the sustained rule (cache window, or store history when the cache is
//! cold), write alerts, then settle the delivery according to the
//! configured [`AckStrategy`]. Per-message failures are logged and counted,
//! never propagated out of the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{ConsumerError, ProcessError, StoreError};
use crate::models::{Alert, AlertKind, HistoryPoint, Reading};
use crate::queue::{Envelope, MessageSource};
use crate::rules::{self, SustainedRule};
use crate::store::HistoryStore;
use crate::window::{WindowCache, WindowSnapshot};

// ---

/// How a delivery is settled once processing has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStrategy {
    // ---
    /// Acknowledge every message whatever the outcome. At-most-once.
    BestEffort,
    /// Requeue messages that failed on a transient store error, up to
    /// `max_redeliveries` times, then acknowledge.
    Redeliver { max_redeliveries: u32 },
}

/// Settlement decision for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
}

impl AckStrategy {
    // ---
    pub fn settle<T>(&self, outcome: &Result<T, ProcessError>, redelivered: u32) -> Settlement {
        // ---
        match (self, outcome) {
            (AckStrategy::Redeliver { max_redeliveries }, Err(e))
                if e.is_transient() && redelivered < *max_redeliveries =>
            {
                Settlement::Requeue
            }
            _ => Settlement::Ack,
        }
    }
}

/// Values the engine consumes from configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    // ---
    /// Sustained window size N.
    pub window_size: usize,
    /// Sustained pressure delta threshold (MPa).
    pub delta_pressure: f64,
    /// Deadline for all store interactions of one message.
    pub store_timeout: Duration,
    pub ack_strategy: AckStrategy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            window_size: 10,
            delta_pressure: crate::config::DEFAULT_DELTA_PRESSURE,
            store_timeout: Duration::from_secs(5),
            ack_strategy: AckStrategy::BestEffort,
        }
    }
}

/// Where the sustained rule took its window from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSource {
    // ---
    Cache,
    Store,
    /// Neither the cache nor the store held N readings.
    Insufficient,
}

/// Result of processing one message successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    // ---
    pub reading: Reading,
    pub window_source: WindowSource,
    /// Alerts written to the store, instant first.
    pub alerts: Vec<Alert>,
}

/// Engine counters, shared by every consumer of one engine.
#[derive(Debug, Default)]
pub struct EngineStats {
    // ---
    pub received: AtomicU64,
    pub processed: AtomicU64,
    pub decode_errors: AtomicU64,
    pub store_errors: AtomicU64,
    pub timeouts: AtomicU64,
    pub instant_alerts: AtomicU64,
    pub sustained_alerts: AtomicU64,
    pub store_fallbacks: AtomicU64,
    pub acked: AtomicU64,
    pub requeued: AtomicU64,
    pub settle_failures: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    // ---
    pub received: u64,
    pub processed: u64,
    pub decode_errors: u64,
    pub store_errors: u64,
    pub timeouts: u64,
    pub instant_alerts: u64,
    pub sustained_alerts: u64,
    pub store_fallbacks: u64,
    pub acked: u64,
    pub requeued: u64,
    pub settle_failures: u64,
}

impl EngineStats {
    // ---
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            received: load(&self.received),
            processed: load(&self.processed),
            decode_errors: load(&self.decode_errors),
            store_errors: load(&self.store_errors),
            timeouts: load(&self.timeouts),
            instant_alerts: load(&self.instant_alerts),
            sustained_alerts: load(&self.sustained_alerts),
            store_fallbacks: load(&self.store_fallbacks),
            acked: load(&self.acked),
            requeued: load(&self.requeued),
            settle_failures: load(&self.settle_failures),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ---

/// The rule engine. Cheap to clone; clones share the cache, store and stats.
#[derive(Clone)]
pub struct RuleEngine {
    cache: Arc<WindowCache>,
    store: Arc<dyn HistoryStore>,
    settings: EngineSettings,
    rule: SustainedRule,
    stats: Arc<EngineStats>,
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("cache", &self.cache)
            .field("store", &self.store.backend_type())
            .field("settings", &self.settings)
            .finish()
    }
}

impl RuleEngine {
    // ---
    /// Build an engine over an explicit cache handle.
    ///
    /// The cache capacity is the sustained window size; `settings.window_size`
    /// is overridden by it so the two can never disagree.
    pub fn new(
        cache: Arc<WindowCache>,
        store: Arc<dyn HistoryStore>,
        mut settings: EngineSettings,
    ) -> Self {
        // ---
        settings.window_size = cache.capacity();
        let rule = SustainedRule {
            window_size: settings.window_size,
            delta_pressure: settings.delta_pressure,
        };
        Self {
            cache,
            store,
            settings,
            rule,
            stats: Arc::new(EngineStats::default()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<WindowCache> {
        &self.cache
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// Process one payload: decode, update the cache, evaluate, write alerts.
    ///
    /// A decode failure leaves the cache untouched. Once decoded, the reading
    /// is always cached, even if a later store call fails.
    pub async fn process(&self, payload: &[u8]) -> Result<Evaluation, ProcessError> {
        self.process_attempt(payload, false).await
    }

    /// Steps 1 to 4 for one attempt. A redelivered attempt does not cache its
    /// reading a second time; alert writes are idempotent in the store.
    async fn process_attempt(
        &self,
        payload: &[u8],
        redelivered: bool,
    ) -> Result<Evaluation, ProcessError> {
        // ---
        let reading: Reading = serde_json::from_slice(payload)?;
        if !redelivered {
            self.cache.append(reading.clone());
        } else if !self.cache.append_once(reading.clone()) {
            debug!(device_id = reading.device_id, "redelivered reading already cached");
        }

        let deadline = Instant::now() + self.settings.store_timeout;
        let mut alerts = Vec::new();

        if let Some(alert) = rules::evaluate_instant(&reading) {
            self.write_alert(&alert, deadline).await?;
            bump(&self.stats.instant_alerts);
            info!(
                device_id = alert.device_id,
                reason = %alert.reason,
                "instant alert"
            );
            alerts.push(alert);
        }

        let (window_source, window) = self.resolve_window(&reading, deadline).await?;
        if let Some(alert) = self.rule.evaluate(&reading, &window) {
            self.write_alert(&alert, deadline).await?;
            bump(&self.stats.sustained_alerts);
            if let AlertKind::Sustained { change } = alert.kind {
                info!(
                    device_id = alert.device_id,
                    reason = %alert.reason,
                    change,
                    "sustained alert"
                );
            }
            alerts.push(alert);
        }

        Ok(Evaluation {
            reading,
            window_source,
            alerts,
        })
    }

    /// Pick the sustained window: the cache when warm, else the store.
    async fn resolve_window(
        &self,
        reading: &Reading,
        deadline: Instant,
    ) -> Result<(WindowSource, Vec<HistoryPoint>), ProcessError> {
        // ---
        if let WindowSnapshot::Warm(window) = self.cache.snapshot(reading.device_id) {
            let points = window.iter().map(Reading::to_history_point).collect();
            return Ok((WindowSource::Cache, points));
        }

        bump(&self.stats.store_fallbacks);
        let limit = self.settings.window_size;
        let points = self
            .with_deadline(deadline, self.store.find_recent(reading.device_id, limit))
            .await?;

        if points.len() < limit {
            debug!(
                device_id = reading.device_id,
                available = points.len(),
                needed = limit,
                "not enough history for sustained rule"
            );
            return Ok((WindowSource::Insufficient, Vec::new()));
        }
        Ok((WindowSource::Store, points))
    }

    async fn write_alert(&self, alert: &Alert, deadline: Instant) -> Result<(), ProcessError> {
        self.with_deadline(deadline, self.store.insert_alert(alert))
            .await
    }

    async fn with_deadline<T>(
        &self,
        deadline: Instant,
        op: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, ProcessError> {
        // ---
        match tokio::time::timeout_at(deadline, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProcessError::Timeout(self.settings.store_timeout)),
        }
    }

    /// Process one delivery and settle it exactly once.
    pub async fn handle<D: Envelope>(&self, delivery: D) -> Result<Evaluation, ProcessError> {
        // ---
        bump(&self.stats.received);
        let tag = delivery.delivery_tag();
        let span = tracing::debug_span!(
            "message",
            delivery_tag = tag,
            redelivered = delivery.redelivered()
        );

        let outcome = self
            .process_attempt(delivery.payload(), delivery.redelivered() > 0)
            .instrument(span)
            .await;
        match &outcome {
            Ok(evaluation) => {
                bump(&self.stats.processed);
                debug!(
                    delivery_tag = tag,
                    device_id = evaluation.reading.device_id,
                    alerts = evaluation.alerts.len(),
                    window = ?evaluation.window_source,
                    "message processed"
                );
            }
            Err(e) => {
                match e {
                    ProcessError::Decode(_) => bump(&self.stats.decode_errors),
                    ProcessError::Store(_) => bump(&self.stats.store_errors),
                    ProcessError::Timeout(_) => bump(&self.stats.timeouts),
                }
                error!(delivery_tag = tag, "process message error: {}", e);
            }
        }

        let redelivered = delivery.redelivered();
        match self.settings.ack_strategy.settle(&outcome, redelivered) {
            Settlement::Ack => match delivery.ack() {
                Ok(()) => bump(&self.stats.acked),
                Err(e) => {
                    bump(&self.stats.settle_failures);
                    error!(delivery_tag = tag, "ack error: {}", e);
                }
            },
            Settlement::Requeue => match delivery.requeue() {
                Ok(()) => {
                    bump(&self.stats.requeued);
                    warn!(delivery_tag = tag, redelivered, "message requeued");
                }
                Err(e) => {
                    bump(&self.stats.settle_failures);
                    error!(delivery_tag = tag, "requeue failed, message dropped: {}", e);
                }
            },
        }

        outcome
    }
}

// ---

/// Lifecycle of a [`StreamConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Consuming,
    Stopped,
}

/// One consumer instance pulling from a message source.
#[derive(Debug)]
pub struct StreamConsumer<S> {
    id: usize,
    engine: RuleEngine,
    source: S,
    state: ConsumerState,
}

impl<S: MessageSource> StreamConsumer<S> {
    // ---
    pub fn new(id: usize, engine: RuleEngine, source: S) -> Self {
        Self {
            id,
            engine,
            source,
            state: ConsumerState::Idle,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    fn transition(&mut self, next: ConsumerState) {
        debug!(consumer = self.id, from = ?self.state, to = ?next, "consumer state");
        self.state = next;
    }

    /// Consume until cancelled or the delivery channel closes.
    ///
    /// Cancellation is only observed between messages: a message already
    /// taken off the queue is processed and settled first. Returns
    /// [`ConsumerError::ChannelClosed`] when the source ends.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), ConsumerError> {
        // ---
        self.transition(ConsumerState::Consuming);
        info!(
            consumer = self.id,
            queue = self.source.queue_name(),
            "consumer started"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = self.source.next() => Some(next),
            };

            let Some(next) = next else {
                self.transition(ConsumerState::Stopped);
                info!(consumer = self.id, "consumer stopped");
                return Ok(());
            };

            let Some(delivery) = next else {
                self.transition(ConsumerState::Stopped);
                error!(consumer = self.id, "channel closed");
                return Err(ConsumerError::ChannelClosed(
                    self.source.queue_name().to_string(),
                ));
            };

            // Errors were logged and counted by `handle`.
            let _ = self.engine.handle(delivery).await;
        }
    }
}
