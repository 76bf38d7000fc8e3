use crate::pipeline::RunState;
use tracing::trace;

// Trace-based counters; the Prometheus recorder only serves /metrics.

pub fn inc_requests(route: &'static str) {
    trace!(target = "inventory.metrics", route = route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "inventory.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

/// `state` is `None` when the run ended in an error.
pub fn run_finished(state: Option<RunState>, elapsed_ms: u128) {
    trace!(
        target = "inventory.metrics",
        outcome = state.map(|s| format!("{s:?}")).as_deref().unwrap_or("error"),
        elapsed_ms = elapsed_ms as u64,
        "run_finished"
    );
}
