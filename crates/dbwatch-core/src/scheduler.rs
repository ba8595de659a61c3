//! Job scheduler.
//!
//! Every enabled job gets its own driver task with its own timer. A tick is
//! spawned as a separate task so a slow collector only delays itself:
//!
//! ```text
//!   driver(job) ──interval──► running.swap(true)? ──yes──► skip (counted)
//!                                     │no
//!                                     ▼
//!                    spawn tick: timeout(sample) → normalize_all → sink.push
//!                                     │
//!                    RunningGuard dropped → running = false
//! ```
//!
//! Shutdown: cancelling the root token stops all drivers. In-flight ticks
//! get `shutdown_grace` to finish; after that the abandon token fires and
//! their results are discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::collector::Collector;
use crate::error::CollectError;
use crate::health::HealthRegistry;
use crate::model::{CollectorResult, Observation};
use crate::rates::normalize_all;
use crate::snapshot::SnapshotStore;

/// Minimum time a counter key is kept after its last sample.
const MIN_SNAPSHOT_RETENTION: Duration = Duration::from_secs(10 * 60);

/// Receiver of the observations produced by a tick.
pub trait ObservationSink: Send + Sync + 'static {
    fn push(&self, job: &str, observations: Vec<Observation>);
}

/// Static description of a job, built from configuration.
pub struct JobSpec {
    pub collector: Arc<dyn Collector>,
    pub interval: Duration,
    pub timeout: Duration,
    pub enabled: bool,
}

impl JobSpec {
    pub fn new(collector: Arc<dyn Collector>, interval: Duration, timeout: Duration) -> Self {
        Self {
            collector,
            interval,
            timeout,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound of the random delay before a job's first tick.
    pub max_jitter: Duration,
    /// How long in-flight ticks may run after shutdown is requested.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_jitter: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

struct Job {
    name: String,
    collector: Arc<dyn Collector>,
    interval: Duration,
    timeout: Duration,
    running: AtomicBool,
    enabled: AtomicBool,
}

impl Job {
    fn snapshot_retention(&self) -> Duration {
        (self.interval * 3).max(MIN_SNAPSHOT_RETENTION)
    }
}

/// Clears the job's in-flight flag however the tick ends.
struct RunningGuard(Arc<Job>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
struct TickContext {
    store: SnapshotStore,
    health: HealthRegistry,
    sink: Arc<dyn ObservationSink>,
    tracker: TaskTracker,
    abandon: CancellationToken,
}

pub struct Scheduler {
    jobs: Vec<Arc<Job>>,
    config: SchedulerConfig,
    store: SnapshotStore,
    health: HealthRegistry,
    sink: Arc<dyn ObservationSink>,
}

impl Scheduler {
    pub fn new(
        specs: Vec<JobSpec>,
        config: SchedulerConfig,
        store: SnapshotStore,
        health: HealthRegistry,
        sink: Arc<dyn ObservationSink>,
    ) -> Self {
        let mut jobs = Vec::with_capacity(specs.len());
        for spec in specs {
            let name = spec.collector.name().to_string();
            if !spec.enabled {
                info!(job = %name, "job disabled by configuration");
                continue;
            }
            health.register_job(&name);
            jobs.push(Arc::new(Job {
                name,
                collector: spec.collector,
                interval: spec.interval,
                timeout: spec.timeout,
                running: AtomicBool::new(false),
                enabled: AtomicBool::new(true),
            }));
        }
        Self {
            jobs,
            config,
            store,
            health,
            sink,
        }
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name.as_str()).collect()
    }

    /// Runs until `shutdown` is cancelled, then drains in-flight ticks.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(jobs = ?self.job_names(), "scheduler started");

        let tracker = TaskTracker::new();
        let ctx = TickContext {
            store: self.store,
            health: self.health,
            sink: self.sink,
            tracker: tracker.clone(),
            abandon: CancellationToken::new(),
        };

        let mut drivers = Vec::with_capacity(self.jobs.len());
        for job in self.jobs {
            let jitter = random_jitter(self.config.max_jitter);
            drivers.push(tokio::spawn(drive(
                job,
                jitter,
                ctx.clone(),
                shutdown.clone(),
            )));
        }

        for driver in drivers {
            if let Err(e) = driver.await {
                error!(error = %e, "job driver panicked");
            }
        }

        // No driver can spawn ticks any more.
        tracker.close();
        if tracker.is_empty() {
            info!("scheduler stopped");
            return;
        }

        info!(
            in_flight = tracker.len(),
            grace_ms = self.config.shutdown_grace.as_millis() as u64,
            "waiting for in-flight ticks"
        );
        if tokio::time::timeout(self.config.shutdown_grace, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                abandoned = tracker.len(),
                "shutdown grace period elapsed, abandoning in-flight ticks"
            );
            ctx.abandon.cancel();
            tracker.wait().await;
        }
        info!("scheduler stopped");
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

async fn drive(job: Arc<Job>, jitter: Duration, ctx: TickContext, shutdown: CancellationToken) {
    if !jitter.is_zero() {
        debug!(job = %job.name, jitter_ms = jitter.as_millis() as u64, "delaying first tick");
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(jitter) => {}
        }
    }

    let mut tick = tokio::time::interval(job.interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }

        if !job.enabled.load(Ordering::Acquire) {
            break;
        }

        if job.running.swap(true, Ordering::AcqRel) {
            ctx.health.record_skip(&job.name);
            debug!(job = %job.name, "previous tick still running, skipping");
            continue;
        }

        let guard = RunningGuard(Arc::clone(&job));
        ctx.tracker.spawn(run_tick(guard, ctx.clone()));
    }

    debug!(job = %job.name, "job driver stopped");
}

async fn run_tick(guard: RunningGuard, ctx: TickContext) {
    let job = Arc::clone(&guard.0);
    let t0 = Instant::now();

    let sampled = tokio::select! {
        biased;
        _ = ctx.abandon.cancelled() => {
            debug!(job = %job.name, "tick abandoned");
            return;
        }
        r = tokio::time::timeout(job.timeout, job.collector.sample()) => r,
    };
    let elapsed = t0.elapsed();

    let result = match sampled {
        Ok(Ok(samples)) => {
            let (observations, stats) = normalize_all(&job.name, &samples, &ctx.store);
            debug!(
                job = %job.name,
                duration_ms = elapsed.as_millis() as u64,
                samples = samples.len(),
                emitted = stats.emitted,
                baselines = stats.baselines,
                resets = stats.resets,
                duplicates = stats.duplicates,
                "tick completed"
            );
            CollectorResult::success(observations)
        }
        Ok(Err(e)) => CollectorResult::failure(e),
        Err(_) => CollectorResult::failure(CollectError::Timeout(job.timeout)),
    };

    if ctx.abandon.is_cancelled() {
        return;
    }

    if elapsed > job.interval / 2 {
        warn!(
            job = %job.name,
            duration_ms = elapsed.as_millis() as u64,
            interval_ms = job.interval.as_millis() as u64,
            "tick exceeded 50% of interval"
        );
    }

    record(&job, result, &ctx);
    drop(guard);
}

fn record(job: &Job, result: CollectorResult, ctx: &TickContext) {
    let now = Utc::now();
    match result.error {
        None => {
            ctx.health.record_success(&job.name, now);
            if !result.observations.is_empty() {
                ctx.sink.push(&job.name, result.observations);
            }
            job.collector.handed_off();
            let retention = chrono::Duration::from_std(job.snapshot_retention())
                .ok()
                .and_then(|r| now.checked_sub_signed(r));
            if let Some(cutoff) = retention {
                let evicted = ctx.store.evict_stale(&job.name, cutoff);
                if evicted > 0 {
                    debug!(job = %job.name, evicted, "evicted stale counter baselines");
                }
            }
        }
        Some(err) => {
            let kind = err.kind();
            ctx.health.record_failure(&job.name, &err, now);
            if kind.disables_job() {
                job.enabled.store(false, Ordering::Release);
                ctx.health.record_disabled(&job.name, kind);
                ctx.store.forget_source(&job.name);
                error!(
                    job = %job.name,
                    kind = %kind,
                    error = %err,
                    "job disabled for the rest of the process lifetime"
                );
            } else {
                warn!(job = %job.name, kind = %kind, error = %err, "tick failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RawSample;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI64, AtomicUsize};

    #[derive(Default)]
    struct VecSink {
        pushed: Mutex<Vec<(String, Observation)>>,
    }

    impl VecSink {
        fn for_job(&self, job: &str) -> Vec<Observation> {
            self.pushed
                .lock()
                .unwrap()
                .iter()
                .filter(|(j, _)| j == job)
                .map(|(_, o)| o.clone())
                .collect()
        }

        fn len(&self) -> usize {
            self.pushed.lock().unwrap().len()
        }
    }

    impl ObservationSink for VecSink {
        fn push(&self, job: &str, observations: Vec<Observation>) {
            let mut pushed = self.pushed.lock().unwrap();
            pushed.extend(observations.into_iter().map(|o| (job.to_string(), o)));
        }
    }

    /// Counter that grows by 60 per tick, stamped one minute apart.
    struct TestCollector {
        name: String,
        delay: Duration,
        error: Option<CollectError>,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        seq: AtomicI64,
        handed_off: AtomicUsize,
    }

    impl TestCollector {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                delay: Duration::ZERO,
                error: None,
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                seq: AtomicI64::new(0),
                handed_off: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing(mut self, err: CollectError) -> Self {
            self.error = Some(err);
            self
        }
    }

    #[async_trait]
    impl Collector for TestCollector {
        fn name(&self) -> &str {
            &self.name
        }

        async fn sample(&self) -> Result<Vec<RawSample>, CollectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            if let Some(err) = &self.error {
                return Err(err.clone());
            }
            let n = self.seq.fetch_add(1, Ordering::SeqCst);
            let at = Utc::now() + chrono::Duration::seconds(60 * n);
            Ok(vec![
                RawSample::counter("instance", "queries_executed", (n * 60) as f64, "count", at),
                RawSample::gauge("instance", "connections", 5.0, "connections", at),
            ])
        }

        fn handed_off(&self) {
            self.handed_off.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        health: HealthRegistry,
        sink: Arc<VecSink>,
        shutdown: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(specs: Vec<JobSpec>, grace: Duration) -> Harness {
        let health = HealthRegistry::new();
        let sink = Arc::new(VecSink::default());
        let scheduler = Scheduler::new(
            specs,
            SchedulerConfig {
                max_jitter: Duration::ZERO,
                shutdown_grace: grace,
            },
            SnapshotStore::new(),
            health.clone(),
            sink.clone(),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(shutdown.clone()));
        Harness {
            health,
            sink,
            shutdown,
            handle,
        }
    }

    impl Harness {
        async fn stop(self) -> (HealthRegistry, Arc<VecSink>) {
            self.shutdown.cancel();
            self.handle.await.unwrap();
            (self.health, self.sink)
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test(start_paused = true)]
    async fn slow_job_never_overlaps_and_counts_skips() {
        let collector = Arc::new(TestCollector::new("slow").with_delay(secs(150)));
        let h = start(
            vec![JobSpec::new(collector.clone(), secs(60), secs(500))],
            secs(1),
        );

        tokio::time::sleep(secs(400)).await;
        let (health, _) = h.stop().await;

        assert_eq!(collector.max_active.load(Ordering::SeqCst), 1);
        // Started at 0, 180 and 360; 60, 120, 240 and 300 were skipped.
        assert_eq!(collector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(health.job("slow").unwrap().skipped_ticks, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn only_successful_ticks_are_handed_off() {
        let good = Arc::new(TestCollector::new("good"));
        let stuck = Arc::new(TestCollector::new("stuck").with_delay(secs(1000)));
        let h = start(
            vec![
                JobSpec::new(good.clone(), secs(60), secs(10)),
                JobSpec::new(stuck.clone(), secs(60), secs(10)),
            ],
            secs(1),
        );

        tokio::time::sleep(secs(150)).await;
        h.stop().await;

        assert_eq!(good.calls.load(Ordering::SeqCst), 3);
        assert_eq!(good.handed_off.load(Ordering::SeqCst), 3);
        assert_eq!(stuck.handed_off.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_tick_and_frees_the_job() {
        let collector = Arc::new(TestCollector::new("stuck").with_delay(secs(1000)));
        let h = start(
            vec![JobSpec::new(collector.clone(), secs(60), secs(10))],
            secs(1),
        );

        tokio::time::sleep(secs(125)).await;
        let (health, _) = h.stop().await;

        assert_eq!(collector.calls.load(Ordering::SeqCst), 3);
        let job = health.job("stuck").unwrap();
        assert_eq!(job.skipped_ticks, 0);
        assert_eq!(job.consecutive_failures, 2);
        assert_eq!(
            job.last_error.unwrap().kind,
            crate::error::ErrorKind::Timeout
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_does_not_block_others() {
        let bad = Arc::new(
            TestCollector::new("bad").failing(CollectError::Connection("refused".into())),
        );
        let good = Arc::new(TestCollector::new("good"));
        let h = start(
            vec![
                JobSpec::new(bad.clone(), secs(60), secs(30)),
                JobSpec::new(good.clone(), secs(60), secs(30)),
            ],
            secs(1),
        );

        tokio::time::sleep(secs(130)).await;
        let (health, sink) = h.stop().await;

        assert_eq!(bad.calls.load(Ordering::SeqCst), 3);
        assert!(health.job("bad").unwrap().is_failing());
        assert!(sink.for_job("bad").is_empty());

        let good_obs = sink.for_job("good");
        // Three gauges plus two rates (the first counter sample is a baseline).
        assert_eq!(good_obs.len(), 5);
        let rates: Vec<_> = good_obs
            .iter()
            .filter(|o| o.metric_name() == "queries_executed")
            .collect();
        assert_eq!(rates.len(), 2);
        assert!(rates.iter().all(|o| (o.value() - 1.0).abs() < 1e-3));
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_disables_job_after_one_call() {
        let collector =
            Arc::new(TestCollector::new("denied").failing(CollectError::Auth("28P01".into())));
        let h = start(
            vec![JobSpec::new(collector.clone(), secs(60), secs(30))],
            secs(1),
        );

        tokio::time::sleep(secs(300)).await;
        let (health, _) = h.stop().await;

        assert_eq!(collector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            health.job("denied").unwrap().disabled,
            Some(crate::error::ErrorKind::Auth)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_discards_abandoned_ticks() {
        let collector = Arc::new(TestCollector::new("long").with_delay(secs(100)));
        let h = start(
            vec![JobSpec::new(collector.clone(), secs(300), secs(200))],
            secs(5),
        );

        tokio::time::sleep(secs(10)).await;
        let started = tokio::time::Instant::now();
        let (health, sink) = h.stop().await;

        assert!(started.elapsed() <= secs(6));
        assert_eq!(collector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.len(), 0);
        assert_eq!(health.job("long").unwrap().runs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_tick_finishing_within_grace_is_kept() {
        let collector = Arc::new(TestCollector::new("short").with_delay(secs(3)));
        let h = start(
            vec![JobSpec::new(collector.clone(), secs(300), secs(200))],
            secs(10),
        );

        tokio::time::sleep(secs(1)).await;
        let (health, sink) = h.stop().await;

        assert_eq!(health.job("short").unwrap().runs, 1);
        assert_eq!(sink.for_job("short").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_spec_is_never_run() {
        let collector = Arc::new(TestCollector::new("off"));
        let h = start(
            vec![JobSpec::new(collector.clone(), secs(60), secs(30)).disabled()],
            secs(1),
        );
        tokio::time::sleep(secs(120)).await;
        let (health, _) = h.stop().await;
        assert_eq!(collector.calls.load(Ordering::SeqCst), 0);
        assert!(health.job("off").is_none());
    }

    #[test]
    fn jitter_is_bounded() {
        assert_eq!(random_jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(random_jitter(secs(5)) <= secs(5));
        }
    }
}
