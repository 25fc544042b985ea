//! Relocation queue observability metrics.
//!
//! Mirrors the free-function-wrapping-`metrics`-macros style used
//! elsewhere in this crate's lineage: each function records one
//! Prometheus-compatible series, named so a dashboard built against the
//! source control plane's equivalent gauges needs no renaming.

use std::time::{Duration, Instant};

use crate::error::DistributeError;
use crate::queue::QueueSnapshot;

/// Emits the periodic queue-health snapshot: active/queued/unhealthy counts,
/// the highest priority currently present, cumulative bytes written, and a
/// per-priority breakdown.
pub fn record_queue_snapshot(snapshot: &QueueSnapshot) {
    metrics::gauge!("ddrq_active_relocations").set(snapshot.active_relocations as f64);
    metrics::gauge!("ddrq_queued_relocations").set(snapshot.queued_relocations as f64);
    metrics::gauge!("ddrq_unhealthy_relocations").set(snapshot.unhealthy_relocations as f64);
    metrics::gauge!("ddrq_highest_priority").set(snapshot.highest_priority.unwrap_or(0) as f64);
    metrics::counter!("ddrq_bytes_written_total").absolute(snapshot.bytes_written);

    for (priority, count) in &snapshot.per_priority_counts {
        metrics::gauge!(
            "ddrq_relocations_by_priority",
            "priority" => priority.to_string(),
        )
        .set(*count as f64);
    }
}

/// Mirrors `raw_processing_unhealthy`: true iff any relocation currently
/// queued or in flight has a health-symptomatic priority.
pub fn record_unhealthy_observable(unhealthy: bool) {
    metrics::gauge!("ddrq_raw_processing_unhealthy").set(if unhealthy { 1.0 } else { 0.0 });
}

/// Records one source-fetch attempt's outcome and duration.
pub fn record_fetch_attempt(success: bool, duration: Duration) {
    let status = if success { "ok" } else { "error" };
    metrics::counter!("ddrq_source_fetch_total", "status" => status).increment(1);
    metrics::histogram!("ddrq_source_fetch_duration_seconds").record(duration.as_secs_f64());
}

/// Records one `move_range` call's outcome, keyed by the stable error type
/// classifier so dashboards don't fragment on free-form error text.
pub fn record_move_attempt(outcome: Result<(), &DistributeError>, duration: Duration) {
    match outcome {
        Ok(()) => {
            metrics::counter!("ddrq_move_total", "status" => "ok").increment(1);
        }
        Err(err) => {
            metrics::counter!("ddrq_move_total", "status" => "error", "error_type" => err.error_type()).increment(1);
        }
    }
    metrics::histogram!("ddrq_move_duration_seconds").record(duration.as_secs_f64());
}

/// Records one relocation's full lifetime, from launch to terminal state.
pub fn record_relocation_duration(priority: u32, duration: Duration) {
    metrics::histogram!(
        "ddrq_relocation_duration_seconds",
        "priority" => priority.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Records a rebalancer tick's outcome (`sent`, `saturated`, or `no_op`) so
/// operators can see whether the adaptive poll interval is actually
/// finding work, not just spinning.
pub fn record_rebalance_tick(loop_kind: &str, outcome: &str) {
    metrics::counter!(
        "ddrq_rebalance_ticks_total",
        "loop" => loop_kind.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);
}

/// Guard for timing an external collaborator call (source fetch, move,
/// team selection) and recording it on drop-free completion via an
/// explicit `finish` call, matching this crate's avoidance of `Drop`-based
/// side effects for anything touching shared accounting.
pub struct CallTimer {
    start: Instant,
}

impl CallTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
