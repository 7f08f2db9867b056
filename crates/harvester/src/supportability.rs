//! Supportability counter names and helpers.
//!
//! Supportability metrics track the agent's own behavior (seen/sent/dropped
//! counts per telemetry kind, span compaction bookkeeping). They are plain
//! call counters in the metric table and are always created, even at zero,
//! so a dashboard can distinguish "nothing happened" from "not reporting".

use crate::aggregate::MetricAggregator;

/// Total spans offered to the compactor, kept or not.
pub const SPANS_INSTRUMENTED: &str = "Supportability/Spans/Instrumented";
/// Spans that survived the per-span drop/keep rule.
pub const SPANS_KEPT: &str = "Supportability/Spans/Kept";
/// Spans absorbed into a retained span during compaction.
pub const SPANS_COMPACTION_DROPPED: &str = "Supportability/Spans/CompactionDropped";

/// Creates (even at zero) and bumps the seen/sent/dropped counters for one
/// event kind at harvest preparation.
pub fn record_event_counters(
    metrics: &mut MetricAggregator,
    kind: &str,
    seen: u64,
    sent: u64,
    dropped: u64,
) {
    metrics.increment_call_count(&format!("Supportability/Events/{kind}/Seen"), seen);
    metrics.increment_call_count(&format!("Supportability/Events/{kind}/Sent"), sent);
    metrics.increment_call_count(&format!("Supportability/Events/{kind}/Dropped"), dropped);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_created_even_at_zero() {
        let mut metrics = MetricAggregator::new();
        record_event_counters(&mut metrics, "Custom", 0, 0, 0);
        assert_eq!(metrics.call_count("Supportability/Events/Custom/Seen"), 0);
        assert_eq!(metrics.call_count("Supportability/Events/Custom/Sent"), 0);
        assert_eq!(metrics.call_count("Supportability/Events/Custom/Dropped"), 0);
        assert_eq!(metrics.len(), 3);
    }

    #[test]
    fn counters_accumulate() {
        let mut metrics = MetricAggregator::new();
        record_event_counters(&mut metrics, "Analytic", 25, 10, 15);
        record_event_counters(&mut metrics, "Analytic", 5, 5, 0);
        assert_eq!(metrics.call_count("Supportability/Events/Analytic/Seen"), 30);
        assert_eq!(metrics.call_count("Supportability/Events/Analytic/Dropped"), 15);
    }
}
