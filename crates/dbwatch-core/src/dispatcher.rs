//! Batch dispatcher.
//!
//! Jobs push observations into one bounded FIFO buffer through a
//! [`DispatcherHandle`]. A single flush loop drains it into batches of at
//! most `max_batch_size` observations, on a fixed cadence or as soon as a
//! full batch is waiting.
//!
//! Delivery policy per batch:
//! - 2xx: done
//! - retryable (network, 5xx): exponential backoff, at most `max_retries`
//!   retries, then the batch is dropped with one delivery-failure signal
//! - 401/403: delivery stops for the rest of the process and the fatal
//!   token is cancelled
//! - other 4xx: the batch is dropped without retry

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::DeliveryError;
use crate::export::BatchExporter;
use crate::health::HealthRegistry;
use crate::ingest::{AgentIdentity, IngestPayload, IngestTransport};
use crate::model::{Batch, Observation};
use crate::scheduler::ObservationSink;

// ============================================================
// Retry policy
// ============================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }

    /// Rejects schedules whose delays would not strictly increase.
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_backoff.is_zero() {
            return Err("initial backoff must be greater than 0".into());
        }
        if self.multiplier <= 1.0 || !self.multiplier.is_finite() {
            return Err(format!(
                "backoff multiplier must be greater than 1, got {}",
                self.multiplier
            ));
        }
        if self.max_retries > 0 {
            let last = self.initial_backoff.as_secs_f64()
                * self.multiplier.powi(self.max_retries as i32 - 1);
            if last > self.max_backoff.as_secs_f64() {
                return Err(format!(
                    "retry {} would wait {:.1}s, above max backoff {:?}",
                    self.max_retries, last, self.max_backoff
                ));
            }
        }
        Ok(())
    }
}

// ============================================================
// Buffer
// ============================================================

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub flush_interval: Duration,
    pub max_batch_size: usize,
    pub max_buffered: usize,
    pub retry: RetryPolicy,
    /// Bound for the last flush on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(60),
            max_batch_size: 5_000,
            max_buffered: 50_000,
            retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

struct Shared {
    buffer: Mutex<VecDeque<(Arc<str>, Observation)>>,
    notify: Notify,
    stopped: AtomicBool,
    max_batch_size: usize,
    max_buffered: usize,
    health: HealthRegistry,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, VecDeque<(Arc<str>, Observation)>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes up to `max_batch_size` entries from the front.
    fn take(&self) -> Vec<(Arc<str>, Observation)> {
        let mut buffer = self.lock();
        let n = buffer.len().min(self.max_batch_size);
        buffer.drain(..n).collect()
    }

    /// Puts an unsent batch back at the front, then applies the buffer bound.
    fn requeue(&self, owners: Vec<Arc<str>>, observations: Vec<Observation>) {
        let evicted = {
            let mut buffer = self.lock();
            for entry in owners.into_iter().zip(observations).rev() {
                buffer.push_front(entry);
            }
            self.trim(&mut buffer)
        };
        self.record_evicted(evicted);
    }

    /// Evicts the oldest entries beyond `max_buffered`, counted per owner.
    fn trim(&self, buffer: &mut VecDeque<(Arc<str>, Observation)>) -> BTreeMap<Arc<str>, u64> {
        let mut evicted: BTreeMap<Arc<str>, u64> = BTreeMap::new();
        while buffer.len() > self.max_buffered {
            if let Some((owner, _)) = buffer.pop_front() {
                *evicted.entry(owner).or_default() += 1;
            }
        }
        evicted
    }

    fn record_evicted(&self, evicted: BTreeMap<Arc<str>, u64>) {
        for (owner, count) in evicted {
            warn!(job = %owner, count, "buffer full, evicted oldest observations");
            self.health.record_evicted(&owner, count);
        }
    }
}

/// Producer side, cloned into the scheduler.
#[derive(Clone)]
pub struct DispatcherHandle {
    shared: Arc<Shared>,
}

impl DispatcherHandle {
    pub fn buffered(&self) -> usize {
        self.shared.lock().len()
    }
}

impl ObservationSink for DispatcherHandle {
    fn push(&self, job: &str, observations: Vec<Observation>) {
        if observations.is_empty() || self.shared.stopped.load(Ordering::Acquire) {
            return;
        }

        let job: Arc<str> = Arc::from(job);
        let (evicted, ready) = {
            let mut buffer = self.shared.lock();
            buffer.extend(observations.into_iter().map(|o| (Arc::clone(&job), o)));
            let evicted = self.shared.trim(&mut buffer);
            (evicted, buffer.len() >= self.shared.max_batch_size)
        };

        self.shared.record_evicted(evicted);
        if ready {
            self.shared.notify.notify_one();
        }
    }
}

// ============================================================
// Flush loop
// ============================================================

#[derive(Debug)]
enum Outcome {
    Delivered,
    Rejected,
    Exhausted,
    Fatal(DeliveryError),
    Abandoned,
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    config: DispatcherConfig,
    identity: AgentIdentity,
    transport: Arc<dyn IngestTransport>,
    exporter: Option<BatchExporter>,
    seq: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        identity: AgentIdentity,
        transport: Arc<dyn IngestTransport>,
        health: HealthRegistry,
    ) -> (Self, DispatcherHandle) {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            stopped: AtomicBool::new(false),
            max_batch_size: config.max_batch_size.max(1),
            max_buffered: config.max_buffered.max(config.max_batch_size).max(1),
            health,
        });
        let handle = DispatcherHandle {
            shared: Arc::clone(&shared),
        };
        let dispatcher = Self {
            shared,
            config,
            identity,
            transport,
            exporter: None,
            seq: AtomicU64::new(0),
        };
        (dispatcher, handle)
    }

    pub fn with_exporter(mut self, exporter: BatchExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Flushes until `stop` is cancelled, then makes one bounded final flush.
    ///
    /// On a credential rejection the loop ends early and `fatal` is cancelled.
    pub async fn run(self, stop: CancellationToken, fatal: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.flush_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            max_batch_size = self.shared.max_batch_size,
            max_retries = self.config.retry.max_retries,
            "dispatcher started"
        );

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = tick.tick() => {}
                _ = self.shared.notify.notified() => {}
            }

            if let Err(err) = self.flush(&stop).await {
                self.go_fatal(err, &fatal);
                return;
            }
        }

        let pending = self.shared.lock().len();
        if pending > 0 {
            info!(pending, "final flush");
            // The deadline interrupts the delivery in flight; its batch is
            // requeued and counted below.
            let deadline = CancellationToken::new();
            let flush = self.flush(&deadline);
            tokio::pin!(flush);
            let drained = tokio::select! {
                drained = &mut flush => drained,
                _ = tokio::time::sleep(self.config.shutdown_grace) => {
                    deadline.cancel();
                    flush.await
                }
            };
            match drained {
                Ok(()) => {
                    let left = self.shared.lock().len();
                    if left > 0 {
                        warn!(
                            dropped = left,
                            "final flush did not finish within the grace period"
                        );
                    }
                }
                Err(err) => self.go_fatal(err, &fatal),
            }
        }
        self.shared.stopped.store(true, Ordering::Release);
        info!("dispatcher stopped");
    }

    /// Delivers everything buffered, one batch at a time, until `stop`.
    async fn flush(&self, stop: &CancellationToken) -> Result<(), DeliveryError> {
        loop {
            if stop.is_cancelled() {
                return Ok(());
            }
            let (owners, observations): (Vec<_>, Vec<_>) =
                self.shared.take().into_iter().unzip();
            if observations.is_empty() {
                return Ok(());
            }
            let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
            let mut batch = Batch::new(seq, observations);

            let (outcome, attempts) = self.deliver(&batch, stop).await;
            batch.attempt_count = attempts;
            match outcome {
                Outcome::Fatal(err) => return Err(err),
                Outcome::Abandoned => {
                    // Back to the front so the final flush still sees it.
                    self.shared.requeue(owners, batch.observations);
                    return Ok(());
                }
                Outcome::Delivered | Outcome::Rejected | Outcome::Exhausted => {
                    self.export(&batch, &owners).await;
                }
            }
        }
    }

    /// Sends one batch, retrying per the policy. Returns the outcome and the
    /// number of attempts made.
    async fn deliver(&self, batch: &Batch, stop: &CancellationToken) -> (Outcome, u32) {
        let n = batch.len();
        let policy = &self.config.retry;
        let payload = IngestPayload::new(&self.identity, batch);
        let mut last_error = None;

        for retry in 0..=policy.max_retries {
            if retry > 0 {
                let delay = policy.delay(retry);
                warn!(
                    seq = batch.seq,
                    retry,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "retrying delivery"
                );
                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!(seq = batch.seq, "delivery interrupted by shutdown");
                        return (Outcome::Abandoned, retry);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let attempts = retry + 1;
            let sent = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!(seq = batch.seq, attempt = attempts, "delivery interrupted by shutdown");
                    return (Outcome::Abandoned, retry);
                }
                sent = self.transport.send(&payload) => sent,
            };
            match sent {
                Ok(()) => {
                    self.shared.health.record_batch_sent(n);
                    if retry > 0 {
                        info!(
                            seq = batch.seq,
                            observations = n,
                            attempts,
                            "batch delivered after retries"
                        );
                    } else {
                        debug!(seq = batch.seq, observations = n, "batch delivered");
                    }
                    return (Outcome::Delivered, attempts);
                }
                Err(err) if err.is_retryable() => {
                    debug!(
                        seq = batch.seq,
                        attempt = attempts,
                        error = %err,
                        "delivery attempt failed"
                    );
                    last_error = Some(err);
                }
                Err(err @ DeliveryError::Auth { .. }) => return (Outcome::Fatal(err), attempts),
                Err(err) => {
                    error!(
                        seq = batch.seq,
                        observations = n,
                        error = %err,
                        "batch rejected, dropping"
                    );
                    self.shared.health.record_batch_rejected(n);
                    return (Outcome::Rejected, attempts);
                }
            }
        }

        let attempts = policy.max_retries + 1;
        error!(
            seq = batch.seq,
            observations = n,
            attempts,
            error = ?last_error,
            "delivery failed after retries, dropping batch"
        );
        self.shared.health.record_delivery_failure(n);
        (Outcome::Exhausted, attempts)
    }

    /// Writes one object per job present in the batch.
    async fn export(&self, batch: &Batch, owners: &[Arc<str>]) {
        let Some(exporter) = self.exporter.clone() else {
            return;
        };
        let mut objects = Vec::new();
        for (job, observations) in split_by_job(owners, &batch.observations) {
            let part = Batch {
                seq: batch.seq,
                observations,
                attempt_count: batch.attempt_count,
                created_at: batch.created_at,
            };
            match IngestPayload::new(&self.identity, &part).to_json() {
                Ok(json) => objects.push((job, json)),
                Err(e) => warn!(seq = batch.seq, job = %job, error = %e, "export skipped"),
            }
        }
        if objects.is_empty() {
            return;
        }

        let (at, seq) = (batch.created_at, batch.seq);
        let written = tokio::task::spawn_blocking(move || {
            objects
                .into_iter()
                .map(|(job, json)| exporter.write(&job, at, seq, &json))
                .collect::<Vec<_>>()
        })
        .await;
        match written {
            Ok(results) => {
                for result in results {
                    match result {
                        Ok(path) => debug!(seq, path = %path.display(), "batch exported"),
                        Err(e) => warn!(seq, error = %e, "batch export failed"),
                    }
                }
            }
            Err(e) => warn!(seq, error = %e, "batch export task failed"),
        }
    }

    fn go_fatal(&self, err: DeliveryError, fatal: &CancellationToken) {
        self.shared.stopped.store(true, Ordering::Release);
        let dropped = {
            let mut buffer = self.shared.lock();
            let n = buffer.len();
            buffer.clear();
            n
        };
        error!(
            error = %err,
            dropped,
            "ingestion service rejected credentials, delivery stopped"
        );
        self.shared.health.set_fatal(err.to_string());
        fatal.cancel();
    }
}

/// Groups observations by owning job, in order of first appearance.
fn split_by_job(
    owners: &[Arc<str>],
    observations: &[Observation],
) -> Vec<(Arc<str>, Vec<Observation>)> {
    let mut parts: Vec<(Arc<str>, Vec<Observation>)> = Vec::new();
    for (owner, observation) in owners.iter().zip(observations) {
        match parts.iter_mut().find(|(job, _)| *job == *owner) {
            Some((_, part)) => part.push(observation.clone()),
            None => parts.push((Arc::clone(owner), vec![observation.clone()])),
        }
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::mock::ScriptedIngest;
    use chrono::Utc;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }

    fn identity() -> AgentIdentity {
        AgentIdentity {
            organization_id: "org".into(),
            db_key: "db".into(),
        }
    }

    fn obs(name: &str) -> Observation {
        Observation::new(name, 1.0, "count", Utc::now())
    }

    struct Running {
        ingest: ScriptedIngest,
        health: HealthRegistry,
        handle: DispatcherHandle,
        stop: CancellationToken,
        fatal: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(config: DispatcherConfig, ingest: ScriptedIngest) -> Running {
        let health = HealthRegistry::new();
        let (dispatcher, handle) =
            Dispatcher::new(config, identity(), Arc::new(ingest.clone()), health.clone());
        let stop = CancellationToken::new();
        let fatal = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(stop.clone(), fatal.clone()));
        Running {
            ingest,
            health,
            handle,
            stop,
            fatal,
            task,
        }
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            flush_interval: Duration::from_secs(10),
            max_batch_size: 100,
            max_buffered: 1_000,
            retry: policy(),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    #[test]
    fn delays_grow_exponentially() {
        let p = policy();
        assert_eq!(p.delay(1), Duration::from_secs(1));
        assert_eq!(p.delay(2), Duration::from_secs(2));
        assert_eq!(p.delay(3), Duration::from_secs(4));
        assert!(p.validate().is_ok());
    }

    #[test]
    fn validation_rejects_flat_or_clipped_schedules() {
        let flat = RetryPolicy {
            multiplier: 1.0,
            ..policy()
        };
        assert!(flat.validate().is_err());

        let clipped = RetryPolicy {
            max_retries: 10,
            ..policy()
        };
        assert!(clipped.validate().unwrap_err().contains("max backoff"));

        let zero = RetryPolicy {
            initial_backoff: Duration::ZERO,
            ..policy()
        };
        assert!(zero.validate().is_err());

        let none = RetryPolicy {
            max_retries: 0,
            ..policy()
        };
        assert!(none.validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_three_times_with_growing_delay_then_succeeds() {
        let ingest = ScriptedIngest::new();
        ingest.push_status(503).push_status(503).push_status(503).push_status(200);
        let r = start(config(), ingest);

        r.handle.push("server_status", vec![obs("a"), obs("b")]);
        tokio::time::sleep(Duration::from_secs(30)).await;

        let attempts = r.ingest.attempts();
        assert_eq!(attempts.len(), 4);
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1].at - w[0].at).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        let delivery = r.health.delivery();
        assert_eq!(delivery.batches_sent, 1);
        assert_eq!(delivery.observations_sent, 2);
        assert_eq!(delivery.delivery_failures, 0);
        assert_eq!(r.handle.buffered(), 0);

        r.stop.cancel();
        r.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_stops_delivery_for_good() {
        let ingest = ScriptedIngest::new();
        ingest.push_status(401);
        let r = start(config(), ingest);

        r.handle.push("server_status", vec![obs("a")]);
        tokio::time::timeout(Duration::from_secs(60), r.fatal.cancelled())
            .await
            .expect("fatal token cancelled");
        r.task.await.unwrap();

        r.handle.push("server_status", vec![obs("b")]);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(r.ingest.attempts().len(), 1);
        assert!(r.health.is_fatal());
        assert_eq!(r.health.status(), crate::health::AgentStatus::Fatal);
        assert_eq!(r.handle.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_signal_once_and_move_on() {
        let ingest = ScriptedIngest::new();
        for _ in 0..4 {
            ingest.push_status(503);
        }
        let r = start(config(), ingest);

        r.handle.push("table_stats", vec![obs("lost")]);
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(r.ingest.attempts().len(), 4);
        assert_eq!(r.health.delivery().delivery_failures, 1);
        assert_eq!(r.health.delivery().observations_dropped, 1);

        r.handle.push("table_stats", vec![obs("kept")]);
        tokio::time::sleep(Duration::from_secs(20)).await;
        let attempts = r.ingest.attempts();
        assert_eq!(attempts.len(), 5);
        assert_eq!(attempts[4].metric_names, vec!["kept".to_string()]);
        assert_eq!(r.health.delivery().delivery_failures, 1);
        assert_eq!(r.health.delivery().batches_sent, 1);

        r.stop.cancel();
        r.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn client_error_drops_batch_without_retry() {
        let ingest = ScriptedIngest::new();
        ingest.push_status(400);
        let r = start(config(), ingest);

        r.handle.push("schema_monitor", vec![obs("a")]);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(r.ingest.attempts().len(), 1);
        let delivery = r.health.delivery();
        assert_eq!(delivery.batches_rejected, 1);
        assert_eq!(delivery.delivery_failures, 0);
        assert!(!r.health.is_fatal());

        r.stop.cancel();
        r.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_before_the_interval() {
        let cfg = DispatcherConfig {
            flush_interval: Duration::from_secs(3600),
            max_batch_size: 2,
            ..config()
        };
        let r = start(cfg, ScriptedIngest::new());
        // Let the immediate first tick pass on an empty buffer.
        tokio::time::sleep(Duration::from_secs(1)).await;

        r.handle.push("query_monitor", vec![obs("a"), obs("b"), obs("c")]);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let attempts = r.ingest.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].observations, 2);
        assert_eq!(attempts[1].observations, 1);

        r.stop.cancel();
        r.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn full_buffer_evicts_oldest_and_counts_per_job() {
        let cfg = DispatcherConfig {
            flush_interval: Duration::from_secs(3600),
            max_batch_size: 10,
            max_buffered: 10,
            ..config()
        };
        let health = HealthRegistry::new();
        let ingest = ScriptedIngest::new();
        let (_dispatcher, handle) =
            Dispatcher::new(cfg, identity(), Arc::new(ingest), health.clone());

        handle.push("a", (0..6).map(|i| obs(&format!("a{i}"))).collect());
        handle.push("b", (0..7).map(|i| obs(&format!("b{i}"))).collect());

        assert_eq!(handle.buffered(), 10);
        assert_eq!(health.job("a").unwrap().evicted_observations, 3);
        assert!(health.job("b").is_none());
        assert_eq!(health.delivery().observations_dropped, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn job_order_is_preserved_within_a_batch() {
        let r = start(config(), ScriptedIngest::new());
        tokio::time::sleep(Duration::from_secs(1)).await;

        r.handle.push("a", vec![obs("a1"), obs("a2")]);
        r.handle.push("b", vec![obs("b1")]);
        r.handle.push("a", vec![obs("a3")]);
        tokio::time::sleep(Duration::from_secs(10)).await;

        let attempts = r.ingest.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].metric_names, vec!["a1", "a2", "b1", "a3"]);

        r.stop.cancel();
        r.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_what_is_left() {
        let r = start(config(), ScriptedIngest::new());
        tokio::time::sleep(Duration::from_secs(1)).await;

        r.handle.push("a", vec![obs("last")]);
        r.stop.cancel();
        r.task.await.unwrap();

        assert_eq!(r.ingest.attempts().len(), 1);
        assert_eq!(r.health.delivery().batches_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_slow_delivery_within_grace() {
        let ingest = ScriptedIngest::new();
        ingest.set_delay(Duration::from_secs(20));
        let cfg = DispatcherConfig {
            flush_interval: Duration::from_secs(3600),
            max_batch_size: 10,
            ..config()
        };
        let r = start(cfg, ingest);
        tokio::time::sleep(Duration::from_secs(1)).await;

        r.handle.push("table_stats", (0..100).map(|i| obs(&format!("t{i}"))).collect());
        tokio::time::sleep(Duration::from_secs(1)).await;
        let stopped_at = tokio::time::Instant::now();
        r.stop.cancel();
        r.task.await.unwrap();

        let took = stopped_at.elapsed();
        assert!(took <= Duration::from_secs(6), "shutdown took {took:?}");
        // One send cut by the stop, one by the grace deadline; nothing sent
        // batch after batch past either of them.
        assert_eq!(r.ingest.attempts().len(), 2);
        assert_eq!(r.health.delivery().batches_sent, 0);
        assert_eq!(r.handle.buffered(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_interrupted_by_stop_is_sent_by_the_final_flush() {
        let ingest = ScriptedIngest::new();
        ingest.set_delay(Duration::from_secs(2));
        let r = start(config(), ingest);
        tokio::time::sleep(Duration::from_secs(1)).await;

        r.handle.push("server_status", vec![obs("a"), obs("b")]);
        // The flush tick at 10s starts a send; stop arrives mid-send.
        tokio::time::sleep(Duration::from_secs(10)).await;
        r.stop.cancel();
        r.task.await.unwrap();

        let attempts = r.ingest.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].metric_names, vec!["a", "b"]);
        assert_eq!(r.health.delivery().batches_sent, 1);
        assert_eq!(r.handle.buffered(), 0);
    }

    #[test]
    fn requeued_batch_respects_the_buffer_bound() {
        let cfg = DispatcherConfig {
            max_batch_size: 5,
            max_buffered: 10,
            ..config()
        };
        let health = HealthRegistry::new();
        let (dispatcher, handle) = Dispatcher::new(
            cfg,
            identity(),
            Arc::new(ScriptedIngest::new()),
            health.clone(),
        );

        handle.push("a", (0..10).map(|i| obs(&format!("a{i}"))).collect());
        let (owners, observations): (Vec<_>, Vec<_>) =
            dispatcher.shared.take().into_iter().unzip();
        assert_eq!(observations.len(), 5);
        handle.push("b", (0..5).map(|i| obs(&format!("b{i}"))).collect());

        dispatcher.shared.requeue(owners, observations);

        assert_eq!(handle.buffered(), 10);
        assert_eq!(health.job("a").unwrap().evicted_observations, 5);
        assert!(health.job("b").is_none());
        assert_eq!(health.delivery().observations_dropped, 5);
    }

    #[test]
    fn split_keeps_first_appearance_order() {
        let (a, b): (Arc<str>, Arc<str>) = (Arc::from("a"), Arc::from("b"));
        let owners = vec![a.clone(), b.clone(), a.clone()];
        let parts = split_by_job(&owners, &[obs("a1"), obs("b1"), obs("a2")]);
        let names: Vec<(&str, Vec<&str>)> = parts
            .iter()
            .map(|(job, o)| (&**job, o.iter().map(|o| o.metric_name()).collect()))
            .collect();
        assert_eq!(names, vec![("a", vec!["a1", "a2"]), ("b", vec!["b1"])]);
    }

    #[tokio::test]
    async fn delivered_batches_are_exported_per_job() {
        let dir = tempfile::tempdir().unwrap();
        let health = HealthRegistry::new();
        let (dispatcher, handle) = Dispatcher::new(
            config(),
            identity(),
            Arc::new(ScriptedIngest::new()),
            health,
        );
        let dispatcher = dispatcher.with_exporter(BatchExporter::new(dir.path(), "org"));
        let stop = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(stop.clone(), CancellationToken::new()));

        handle.push("table_stats", vec![obs("x")]);
        handle.push("schema_monitor", vec![obs("y"), obs("z")]);
        stop.cancel();
        task.await.unwrap();

        for (job, expected) in [("table_stats", 1), ("schema_monitor", 2)] {
            let org_dir = dir.path().join(job).join("org");
            let day = std::fs::read_dir(&org_dir).unwrap().next().unwrap().unwrap().path();
            let hour = std::fs::read_dir(day).unwrap().next().unwrap().unwrap().path();
            let files: Vec<_> = std::fs::read_dir(hour)
                .unwrap()
                .map(|e| e.unwrap().path())
                .collect();
            assert_eq!(files.len(), 1);
            let json = zstd::decode_all(&std::fs::read(&files[0]).unwrap()[..]).unwrap();
            let body: serde_json::Value = serde_json::from_slice(&json).unwrap();
            assert_eq!(body["observations"].as_array().unwrap().len(), expected);
        }
    }
}
