//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::ErrorCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries (microseconds)
/// Buckets: ≤1ms, ≤2ms, ≤4ms ... ≤512ms, >512ms
pub const METRICS_BUCKET_BOUNDS: [u64; 10] =
    [1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000, 128_000, 256_000, 512_000];
pub const METRICS_NUM_BUCKETS: usize = 11;

const NUM_CODES: usize = ErrorCode::ALL.len();

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    METRICS_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

#[inline]
fn code_index(code: ErrorCode) -> usize {
    ErrorCode::ALL.iter().position(|c| *c == code).unwrap_or(0)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; METRICS_NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile) as u64).max(1);
    let mut cumulative = 0u64;
    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return METRICS_BUCKET_BOUNDS.get(i).copied().unwrap_or(METRICS_BUCKET_BOUNDS[9] * 2);
        }
    }
    METRICS_BUCKET_BOUNDS[9] * 2
}

pub struct Metrics {
    /// Tap-in checks answered (monotonic)
    access_checks_total: AtomicU64,
    access_granted_total: AtomicU64,
    /// Verdicts per error code, indexed like `ErrorCode::ALL`
    verdicts_by_code: [AtomicU64; NUM_CODES],
    charges_committed_total: AtomicU64,
    perdiem_charges_total: AtomicU64,
    /// Sum of committed amounts in minor units
    amount_charged_total: AtomicU64,
    overdrawn_charges_total: AtomicU64,
    stale_conflicts_total: AtomicU64,
    collaborator_failures_total: AtomicU64,
    /// Charges that failed after a balance had been computed
    charge_failures_total: AtomicU64,
    decision_latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    decision_latency_sum_us: AtomicU64,
    decision_latency_max_us: AtomicU64,
    started_at: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            access_checks_total: AtomicU64::new(0),
            access_granted_total: AtomicU64::new(0),
            verdicts_by_code: std::array::from_fn(|_| AtomicU64::new(0)),
            charges_committed_total: AtomicU64::new(0),
            perdiem_charges_total: AtomicU64::new(0),
            amount_charged_total: AtomicU64::new(0),
            overdrawn_charges_total: AtomicU64::new(0),
            stale_conflicts_total: AtomicU64::new(0),
            collaborator_failures_total: AtomicU64::new(0),
            charge_failures_total: AtomicU64::new(0),
            decision_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            decision_latency_sum_us: AtomicU64::new(0),
            decision_latency_max_us: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Record a tap-in verdict and how long it took
    #[inline]
    pub fn record_access_check(&self, granted: bool, code: ErrorCode, latency_us: u64) {
        self.access_checks_total.fetch_add(1, Ordering::Relaxed);
        if granted {
            self.access_granted_total.fetch_add(1, Ordering::Relaxed);
        }
        self.verdicts_by_code[code_index(code)].fetch_add(1, Ordering::Relaxed);
        self.decision_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.decision_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.decision_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_charge(&self, amount: i64, perdiem: bool, overdrawn: bool) {
        self.charges_committed_total.fetch_add(1, Ordering::Relaxed);
        self.amount_charged_total.fetch_add(amount.max(0) as u64, Ordering::Relaxed);
        if perdiem {
            self.perdiem_charges_total.fetch_add(1, Ordering::Relaxed);
        }
        if overdrawn {
            self.overdrawn_charges_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_stale_conflict(&self) {
        self.stale_conflicts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_collaborator_failure(&self) {
        self.collaborator_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_charge_failure(&self) {
        self.charge_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot all counters (nothing is reset)
    pub fn report(&self) -> MetricsSummary {
        let mut latency_buckets = [0u64; METRICS_NUM_BUCKETS];
        for (i, bucket) in self.decision_latency_buckets.iter().enumerate() {
            latency_buckets[i] = bucket.load(Ordering::Relaxed);
        }
        let mut verdicts = [(ErrorCode::Ok, 0u64); NUM_CODES];
        for (i, code) in ErrorCode::ALL.iter().enumerate() {
            verdicts[i] = (*code, self.verdicts_by_code[i].load(Ordering::Relaxed));
        }
        let access_checks_total = self.access_checks_total.load(Ordering::Relaxed);
        let latency_sum = self.decision_latency_sum_us.load(Ordering::Relaxed);

        MetricsSummary {
            uptime_secs: self.started_at.elapsed().as_secs(),
            access_checks_total,
            access_granted_total: self.access_granted_total.load(Ordering::Relaxed),
            verdicts,
            charges_committed_total: self.charges_committed_total.load(Ordering::Relaxed),
            perdiem_charges_total: self.perdiem_charges_total.load(Ordering::Relaxed),
            amount_charged_total: self.amount_charged_total.load(Ordering::Relaxed),
            overdrawn_charges_total: self.overdrawn_charges_total.load(Ordering::Relaxed),
            stale_conflicts_total: self.stale_conflicts_total.load(Ordering::Relaxed),
            collaborator_failures_total: self.collaborator_failures_total.load(Ordering::Relaxed),
            charge_failures_total: self.charge_failures_total.load(Ordering::Relaxed),
            decision_latency_avg_us: latency_sum.checked_div(access_checks_total).unwrap_or(0),
            decision_latency_max_us: self.decision_latency_max_us.load(Ordering::Relaxed),
            decision_latency_p99_us: percentile_from_buckets(&latency_buckets, 0.99),
            latency_buckets,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub uptime_secs: u64,
    pub access_checks_total: u64,
    pub access_granted_total: u64,
    pub verdicts: [(ErrorCode, u64); NUM_CODES],
    pub charges_committed_total: u64,
    pub perdiem_charges_total: u64,
    pub amount_charged_total: u64,
    pub overdrawn_charges_total: u64,
    pub stale_conflicts_total: u64,
    pub collaborator_failures_total: u64,
    pub charge_failures_total: u64,
    pub decision_latency_avg_us: u64,
    pub decision_latency_max_us: u64,
    pub decision_latency_p99_us: u64,
    pub latency_buckets: [u64; METRICS_NUM_BUCKETS],
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            uptime_secs = %self.uptime_secs,
            access_checks = %self.access_checks_total,
            access_granted = %self.access_granted_total,
            charges = %self.charges_committed_total,
            perdiem_charges = %self.perdiem_charges_total,
            amount_charged = %self.amount_charged_total,
            overdrawn_charges = %self.overdrawn_charges_total,
            stale_conflicts = %self.stale_conflicts_total,
            collaborator_failures = %self.collaborator_failures_total,
            charge_failures = %self.charge_failures_total,
            decision_p99_us = %self.decision_latency_p99_us,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(1_000), 0);
        assert_eq!(bucket_index(1_001), 1);
        assert_eq!(bucket_index(600_000), 10);
    }

    #[test]
    fn test_record_access_check() {
        let metrics = Metrics::new();
        metrics.record_access_check(true, ErrorCode::Ok, 500);
        metrics.record_access_check(false, ErrorCode::Overdrawn, 3_000);
        metrics.record_access_check(false, ErrorCode::Overdrawn, 1_500);

        let summary = metrics.report();
        assert_eq!(summary.access_checks_total, 3);
        assert_eq!(summary.access_granted_total, 1);
        let overdrawn = summary.verdicts.iter().find(|(c, _)| *c == ErrorCode::Overdrawn);
        assert_eq!(overdrawn, Some(&(ErrorCode::Overdrawn, 2)));
        assert_eq!(summary.decision_latency_avg_us, 1_666);
        assert_eq!(summary.decision_latency_max_us, 3_000);
    }

    #[test]
    fn test_record_charge() {
        let metrics = Metrics::new();
        metrics.record_charge(200, true, false);
        metrics.record_charge(700, false, true);
        let summary = metrics.report();
        assert_eq!(summary.charges_committed_total, 2);
        assert_eq!(summary.perdiem_charges_total, 1);
        assert_eq!(summary.overdrawn_charges_total, 1);
        assert_eq!(summary.amount_charged_total, 900);
    }

    #[test]
    fn test_percentile_empty() {
        assert_eq!(percentile_from_buckets(&[0; METRICS_NUM_BUCKETS], 0.99), 0);
    }
}
