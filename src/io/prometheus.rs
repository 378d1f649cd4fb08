//! Prometheus text exposition of access and charge metrics
//!
//! Served at /metrics by the API server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use std::fmt::Write;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_access_metrics(&mut output, site_id, &summary);
    write_charge_metrics(&mut output, site_id, &summary);
    write_failure_metrics(&mut output, site_id, &summary);

    output
}

fn write_access_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "machinetime_uptime_seconds",
        "Seconds since process start",
        MetricType::Gauge,
        site,
        summary.uptime_secs,
    );
    write_metric(
        output,
        "machinetime_access_checks_total",
        "Tap-in checks answered",
        MetricType::Counter,
        site,
        summary.access_checks_total,
    );
    write_metric(
        output,
        "machinetime_access_granted_total",
        "Tap-in checks that granted access",
        MetricType::Counter,
        site,
        summary.access_granted_total,
    );

    let _ = writeln!(output, "# HELP machinetime_verdicts_total Tap-in verdicts by error code");
    let _ = writeln!(output, "# TYPE machinetime_verdicts_total counter");
    for (code, count) in &summary.verdicts {
        let _ = writeln!(
            output,
            "machinetime_verdicts_total{{site=\"{site}\",code=\"{code}\",reason=\"{}\"}} {count}",
            code.as_str()
        );
    }

    write_histogram(
        output,
        "machinetime_decision_latency_us",
        "Tap-in decision latency in microseconds",
        site,
        &summary.latency_buckets,
        summary.decision_latency_avg_us,
    );
    write_metric(
        output,
        "machinetime_decision_latency_p99_us",
        "99th percentile tap-in decision latency",
        MetricType::Gauge,
        site,
        summary.decision_latency_p99_us,
    );
    write_metric(
        output,
        "machinetime_decision_latency_max_us",
        "Maximum tap-in decision latency",
        MetricType::Gauge,
        site,
        summary.decision_latency_max_us,
    );
}

fn write_charge_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "machinetime_charges_committed_total",
        "Charge records persisted",
        MetricType::Counter,
        site,
        summary.charges_committed_total,
    );
    write_metric(
        output,
        "machinetime_perdiem_charges_total",
        "Flat per-diem charge records persisted",
        MetricType::Counter,
        site,
        summary.perdiem_charges_total,
    );
    write_metric(
        output,
        "machinetime_amount_charged_total",
        "Sum of charged amounts in minor units",
        MetricType::Counter,
        site,
        summary.amount_charged_total,
    );
    write_metric(
        output,
        "machinetime_overdrawn_charges_total",
        "Charges that left pocket_store negative",
        MetricType::Counter,
        site,
        summary.overdrawn_charges_total,
    );
}

fn write_failure_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "machinetime_stale_conflicts_total",
        "Charges rejected because the balance version moved",
        MetricType::Counter,
        site,
        summary.stale_conflicts_total,
    );
    write_metric(
        output,
        "machinetime_collaborator_failures_total",
        "Ledger, directory or schedule calls that failed",
        MetricType::Counter,
        site,
        summary.collaborator_failures_total,
    );
    write_metric(
        output,
        "machinetime_charge_failures_total",
        "Charges surfaced as errors after a balance was computed",
        MetricType::Counter,
        site,
        summary.charge_failures_total,
    );
}
