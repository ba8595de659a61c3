//! Counter diff engine.
//!
//! Turns cumulative counters into per-second rates using the
//! [`SnapshotStore`]. Gauges pass through untouched.
//!
//! Rules for a counter key:
//! - first sample: stored as baseline, nothing emitted
//! - value decreased (source restart, stats reset, wrap): re-baseline,
//!   nothing emitted
//! - timestamp moved backwards: re-baseline, nothing emitted
//! - same timestamp as the baseline: ignored
//! - otherwise: `(v - v_prev) / (t - t_prev)` is emitted and the baseline
//!   moves forward

use crate::model::{Observation, RawSample, SampleKind};
use crate::snapshot::{SnapshotEntry, SnapshotKey, SnapshotStore};

// ---------------------------------------------------------------------------
// Delta helpers
// ---------------------------------------------------------------------------

/// Compute f64 delta, returning `None` on counter regression (reset).
pub fn df64(curr: f64, prev: f64) -> Option<f64> {
    (curr >= prev).then_some(curr - prev)
}

/// Unit of a rate derived from a counter measured in `unit`.
pub fn rate_unit(unit: &str) -> String {
    format!("{unit}/s")
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// What happened to one raw sample.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOutcome {
    /// Rate (counter) or pass-through value (gauge).
    Emitted(Observation),
    /// First sample for the key; stored, nothing emitted.
    Baseline,
    /// Counter decreased or time went backwards; re-baselined.
    Reset,
    /// Same capture time as the stored baseline; ignored.
    Duplicate,
    /// NaN or infinite raw value; ignored, store untouched.
    Invalid,
}

impl DiffOutcome {
    pub fn into_observation(self) -> Option<Observation> {
        match self {
            DiffOutcome::Emitted(obs) => Some(obs),
            _ => None,
        }
    }
}

/// Per-call counters, logged by the scheduler at debug level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub emitted: usize,
    pub baselines: usize,
    pub resets: usize,
    pub duplicates: usize,
    pub invalid: usize,
}

/// Feeds one sample of `source` through the engine.
pub fn diff(source: &str, sample: &RawSample, store: &SnapshotStore) -> DiffOutcome {
    if !sample.raw_value.is_finite() {
        return DiffOutcome::Invalid;
    }

    if sample.kind == SampleKind::Gauge {
        return DiffOutcome::Emitted(
            Observation::new(
                sample.metric_name.as_str(),
                sample.raw_value,
                sample.unit.as_str(),
                sample.captured_at,
            )
            .with_dimensions(sample.dimensions.clone()),
        );
    }

    let key = SnapshotKey::new(source, sample.entity_key.as_str(), sample.metric_name.as_str());
    let current = SnapshotEntry {
        raw_value: sample.raw_value,
        captured_at: sample.captured_at,
    };

    let Some(prev) = store.get(&key) else {
        store.insert(key, current);
        return DiffOutcome::Baseline;
    };

    let dt_ms = (sample.captured_at - prev.captured_at).num_milliseconds();
    if dt_ms == 0 {
        return DiffOutcome::Duplicate;
    }
    if dt_ms < 0 {
        store.insert(key, current);
        return DiffOutcome::Reset;
    }

    let Some(delta) = df64(sample.raw_value, prev.raw_value) else {
        store.insert(key, current);
        return DiffOutcome::Reset;
    };

    store.insert(key, current);
    let dt = dt_ms as f64 / 1000.0;
    DiffOutcome::Emitted(
        Observation::new(
            sample.metric_name.as_str(),
            delta / dt,
            rate_unit(&sample.unit),
            sample.captured_at,
        )
        .with_dimensions(sample.dimensions.clone()),
    )
}

/// `normalize(RawSample, SnapshotStore) -> Observation?`
pub fn normalize(source: &str, sample: &RawSample, store: &SnapshotStore) -> Option<Observation> {
    diff(source, sample, store).into_observation()
}

/// Normalizes a whole tick worth of samples, preserving their order.
pub fn normalize_all(
    source: &str,
    samples: &[RawSample],
    store: &SnapshotStore,
) -> (Vec<Observation>, DiffStats) {
    let mut stats = DiffStats::default();
    let mut out = Vec::with_capacity(samples.len());
    for sample in samples {
        match diff(source, sample, store) {
            DiffOutcome::Emitted(obs) => {
                stats.emitted += 1;
                out.push(obs);
            }
            DiffOutcome::Baseline => stats.baselines += 1,
            DiffOutcome::Reset => stats.resets += 1,
            DiffOutcome::Duplicate => stats.duplicates += 1,
            DiffOutcome::Invalid => stats.invalid += 1,
        }
    }
    (out, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn counter(v: f64, t: i64) -> RawSample {
        RawSample::counter("instance", "queries_executed", v, "count", at(t))
    }

    #[test]
    fn first_sample_is_baseline() {
        let store = SnapshotStore::new();
        assert_eq!(diff("server", &counter(1000.0, 0), &store), DiffOutcome::Baseline);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn rate_on_second_sample() {
        let store = SnapshotStore::new();
        assert!(normalize("server", &counter(1000.0, 0), &store).is_none());
        let obs = normalize("server", &counter(1300.0, 60), &store).expect("rate");
        assert!((obs.value() - 5.0).abs() < 1e-9);
        assert_eq!(obs.unit(), "count/s");
        assert_eq!(obs.timestamp(), at(60));
        assert_eq!(obs.metric_name(), "queries_executed");
    }

    #[test]
    fn reset_is_silent_and_rebaselines() {
        let store = SnapshotStore::new();
        normalize("server", &counter(1000.0, 0), &store);
        normalize("server", &counter(1300.0, 60), &store);

        assert_eq!(diff("server", &counter(400.0, 120), &store), DiffOutcome::Reset);

        let obs = normalize("server", &counter(900.0, 180), &store).expect("rate after reset");
        assert!((obs.value() - 500.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn emitted_rates_follow_consecutive_deltas() {
        let values = [10.0, 20.0, 20.0, 5.0, 35.0, 95.0, 1.0, 2.0];
        let times = [0, 10, 25, 30, 40, 70, 71, 81];
        let store = SnapshotStore::new();
        let mut emitted = Vec::new();
        for (i, (&v, &t)) in values.iter().zip(times.iter()).enumerate() {
            let out = normalize("s", &counter(v, t), &store);
            if i == 0 || v < values[i - 1] {
                assert!(out.is_none(), "sample {i} must be silent");
            } else {
                let expected = (v - values[i - 1]) / (t - times[i - 1]) as f64;
                let obs = out.unwrap_or_else(|| panic!("sample {i} must emit"));
                assert!((obs.value() - expected).abs() < 1e-9);
                emitted.push(obs.value());
            }
        }
        assert_eq!(emitted.len(), 5);
        assert!(emitted.iter().all(|r| *r >= 0.0));
    }

    #[test]
    fn duplicate_timestamp_is_ignored() {
        let store = SnapshotStore::new();
        normalize("s", &counter(10.0, 0), &store);
        assert_eq!(diff("s", &counter(50.0, 0), &store), DiffOutcome::Duplicate);
        let obs = normalize("s", &counter(20.0, 10), &store).unwrap();
        assert!((obs.value() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn time_regression_rebaselines() {
        let store = SnapshotStore::new();
        normalize("s", &counter(10.0, 100), &store);
        assert_eq!(diff("s", &counter(20.0, 50), &store), DiffOutcome::Reset);
        let obs = normalize("s", &counter(30.0, 60), &store).unwrap();
        assert!((obs.value() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn gauges_pass_through_without_snapshot() {
        let store = SnapshotStore::new();
        let g = RawSample::gauge("db", "numbackends", 42.0, "connections", at(5))
            .with_dimension("database", "app");
        let obs = normalize("server", &g, &store).unwrap();
        assert_eq!(obs.value(), 42.0);
        assert_eq!(obs.unit(), "connections");
        assert_eq!(obs.dimension("database"), Some("app"));
        assert!(store.is_empty());
    }

    #[test]
    fn sources_do_not_share_baselines() {
        let store = SnapshotStore::new();
        normalize("a", &counter(10.0, 0), &store);
        assert!(normalize("b", &counter(20.0, 10), &store).is_none());
        assert!(normalize("a", &counter(20.0, 10), &store).is_some());
    }

    #[test]
    fn non_finite_values_are_dropped() {
        let store = SnapshotStore::new();
        assert_eq!(diff("s", &counter(f64::NAN, 0), &store), DiffOutcome::Invalid);
        assert!(store.is_empty());
    }

    #[test]
    fn normalize_all_counts_outcomes_and_keeps_order() {
        let store = SnapshotStore::new();
        let t0 = at(0);
        let first = vec![
            RawSample::counter("t1", "seq_scan", 1.0, "count", t0),
            RawSample::gauge("t1", "n_live_tup", 100.0, "rows", t0),
        ];
        let (obs, stats) = normalize_all("tables", &first, &store);
        assert_eq!(obs.len(), 1);
        assert_eq!(stats.baselines, 1);
        assert_eq!(stats.emitted, 1);

        let t1 = t0 + Duration::seconds(2);
        let second = vec![
            RawSample::counter("t1", "seq_scan", 5.0, "count", t1),
            RawSample::gauge("t1", "n_live_tup", 101.0, "rows", t1),
        ];
        let (obs, stats) = normalize_all("tables", &second, &store);
        assert_eq!(stats.emitted, 2);
        assert_eq!(obs[0].metric_name(), "seq_scan");
        assert!((obs[0].value() - 2.0).abs() < 1e-9);
        assert_eq!(obs[1].metric_name(), "n_live_tup");
    }
}
