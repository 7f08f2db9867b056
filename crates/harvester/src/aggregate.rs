//! Live Telemetry Aggregators
//!
//! Mutable per-kind state that producers append to between harvests. A
//! [`HarvestCycle`](crate::harvest::HarvestCycle) drains these at snapshot
//! time and merges data back on partial failure, so every aggregator here
//! pairs a `take`-style drain with a merge that restores drained state
//! without double counting.
//!
//! All aggregators are single-threaded; one harvest cycle at a time holds
//! `&mut LiveTelemetry`, which is what serializes snapshotting against
//! merge-back.

use crate::collector::MetricMapper;
use crate::config::HarvestConfig;
use crate::telemetry::{
    AnalyticsEvent, CustomEvent, ErrorEvent, MetricId, MetricStats, Priority, Span, SpanEvent,
    SqlSample, TracedError, TransactionTrace,
};
use reservoir::{EventQueue, EventSegment};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Metric table accumulated since the last successful harvest.
#[derive(Debug)]
pub struct MetricAggregator {
    metrics: HashMap<MetricId, MetricStats>,
    /// Unix seconds when this table started accumulating.
    started_at: u64,
}

impl Default for MetricAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricAggregator {
    pub fn new() -> Self {
        Self {
            metrics: HashMap::new(),
            started_at: unix_seconds(),
        }
    }

    /// Records one measurement against a metric id.
    pub fn record(&mut self, id: MetricId, total: f64, exclusive: f64) {
        self.metrics.entry(id).or_default().record(total, exclusive);
    }

    /// Bumps an unscoped call counter, creating it at zero first.
    ///
    /// Supportability counters go through here so they exist in the table
    /// even when never incremented.
    pub fn increment_call_count(&mut self, name: &str, n: u64) {
        self.metrics
            .entry(MetricId::unscoped(name))
            .or_default()
            .increment_call_count(n);
    }

    pub fn get(&self, id: &MetricId) -> Option<&MetricStats> {
        self.metrics.get(id)
    }

    /// Call count for an unscoped metric, zero when absent.
    pub fn call_count(&self, name: &str) -> u64 {
        self.metrics
            .get(&MetricId::unscoped(name))
            .map_or(0, |s| s.call_count)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetricId, &MetricStats)> {
        self.metrics.iter()
    }

    /// Drains the table for a harvest snapshot; the live table restarts its
    /// accumulation window now.
    pub fn take(&mut self) -> MetricAggregator {
        let taken = MetricAggregator {
            metrics: std::mem::take(&mut self.metrics),
            started_at: self.started_at,
        };
        self.started_at = unix_seconds();
        taken
    }

    /// Folds another table into this one.
    ///
    /// With `restored` set (merge-back after a failed harvest) duplicate
    /// ids fold live stats into the restored block, so the restored
    /// snapshot's values are the base of the result; the accumulation
    /// window also rolls back to the snapshot's start.
    pub fn merge(&mut self, other: MetricAggregator, restored: bool) {
        for (id, stats) in other.metrics {
            match self.metrics.entry(id) {
                std::collections::hash_map::Entry::Occupied(mut slot) => {
                    if restored {
                        let mut base = stats;
                        base.merge(slot.get());
                        *slot.get_mut() = base;
                    } else {
                        slot.get_mut().merge(&stats);
                    }
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(stats);
                }
            }
        }
        if restored {
            self.started_at = self.started_at.min(other.started_at);
        }
    }
}

/// Error traces (bounded list) plus the sampled error-event stream.
#[derive(Debug)]
pub struct ErrorAggregator {
    traces: Vec<TracedError>,
    traces_seen: u64,
    trace_limit: usize,
    events: EventQueue<ErrorEvent>,
}

impl ErrorAggregator {
    pub fn new(trace_limit: usize, event_limit: usize) -> Self {
        Self {
            traces: Vec::new(),
            traces_seen: 0,
            trace_limit,
            events: EventQueue::new(event_limit),
        }
    }

    /// Records one noticed error as both a trace candidate and an event.
    pub fn add(&mut self, traced: TracedError, event: ErrorEvent) {
        self.add_trace(traced);
        self.events.add(event);
    }

    pub fn add_trace(&mut self, traced: TracedError) {
        self.traces_seen += 1;
        if self.traces.len() < self.trace_limit {
            self.traces.push(traced);
        }
    }

    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }

    pub fn traces_seen(&self) -> u64 {
        self.traces_seen
    }

    pub fn events(&self) -> &EventQueue<ErrorEvent> {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventQueue<ErrorEvent> {
        &mut self.events
    }

    /// Drains the trace list for a snapshot.
    pub fn take_traces(&mut self) -> (Vec<TracedError>, u64) {
        let seen = self.traces_seen;
        self.traces_seen = 0;
        (std::mem::take(&mut self.traces), seen)
    }

    /// Concatenates restored traces back, still subject to the list bound.
    /// The restored `seen` count folds in directly; live errors noticed
    /// since the snapshot were counted separately.
    pub fn merge_traces(&mut self, traces: Vec<TracedError>, seen: u64) {
        for traced in traces {
            if self.traces.len() < self.trace_limit {
                self.traces.push(traced);
            }
        }
        self.traces_seen += seen;
    }
}

/// Slowest-transaction traces pending harvest.
///
/// Keeps one slowest ordinary trace (gated by a duration watermark that
/// only resets after a run of empty harvests) plus a bounded list of
/// synthetics traces, which bypass the watermark.
#[derive(Debug)]
pub struct TraceAggregator {
    slowest: Option<TransactionTrace>,
    synthetics: Vec<TransactionTrace>,
    synthetics_limit: usize,
    /// Duration watermark for the slowest-trace slot.
    max_duration: f64,
    consecutive_empty: u32,
    reset_after: u32,
}

impl TraceAggregator {
    pub fn new(synthetics_limit: usize, reset_after: u32) -> Self {
        Self {
            slowest: None,
            synthetics: Vec::new(),
            synthetics_limit,
            max_duration: 0.0,
            consecutive_empty: 0,
            reset_after,
        }
    }

    /// Offers a finished trace. Synthetics traces queue up to their bound;
    /// ordinary traces only displace the slot when at least as slow as the
    /// current watermark (ties admit the trace so a restored snapshot can
    /// reclaim its slot).
    pub fn add(&mut self, trace: TransactionTrace) {
        if trace.synthetics {
            if self.synthetics.len() < self.synthetics_limit {
                self.synthetics.push(trace);
            }
            return;
        }
        if trace.duration >= self.max_duration {
            self.max_duration = trace.duration;
            self.slowest = Some(trace);
        }
    }

    pub fn pending(&self) -> usize {
        self.synthetics.len() + usize::from(self.slowest.is_some())
    }

    /// Drains pending traces for a snapshot and advances the empty-harvest
    /// counter: after enough consecutive empty drains the duration
    /// watermark resets so slow-trace collection can start over.
    pub fn take(&mut self) -> Vec<TransactionTrace> {
        let mut traces: Vec<TransactionTrace> = std::mem::take(&mut self.synthetics);
        if let Some(slowest) = self.slowest.take() {
            traces.push(slowest);
        }

        if traces.is_empty() {
            self.consecutive_empty += 1;
            if self.consecutive_empty >= self.reset_after {
                self.max_duration = 0.0;
                self.consecutive_empty = 0;
            }
        } else {
            self.consecutive_empty = 0;
        }
        traces
    }

    #[cfg(test)]
    pub(crate) fn watermark(&self) -> f64 {
        self.max_duration
    }
}

/// Slow-SQL samples keyed by query id.
#[derive(Debug, Default)]
pub struct SqlTraceAggregator {
    samples: HashMap<u64, SqlSample>,
}

impl SqlTraceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sample, folding into any existing sample for the query.
    pub fn record(&mut self, sample: SqlSample) {
        match self.samples.entry(sample.id) {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                slot.get_mut().aggregate(&sample);
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(sample);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn take(&mut self) -> Vec<SqlSample> {
        self.samples.drain().map(|(_, sample)| sample).collect()
    }

    /// Wholesale merge-back of restored samples.
    pub fn merge(&mut self, samples: Vec<SqlSample>) {
        for sample in samples {
            self.record(sample);
        }
    }
}

/// Reservoir of spans that survived compaction, paired with their
/// transaction priorities.
#[derive(Debug)]
pub struct SpanEventAggregator {
    queue: EventQueue<SpanEvent>,
}

impl SpanEventAggregator {
    pub fn new(limit: usize) -> Self {
        Self {
            queue: EventQueue::new(limit),
        }
    }

    pub fn add(&mut self, span: Span, priority: Priority) {
        self.queue.add(SpanEvent { span, priority });
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn seen(&self) -> u64 {
        self.queue.seen()
    }

    pub fn limit(&self) -> usize {
        self.queue.limit()
    }

    pub fn as_slice(&self) -> &[SpanEvent] {
        self.queue.as_slice()
    }

    pub fn split_for_harvest(&mut self) -> Vec<EventSegment<SpanEvent>> {
        self.queue.split_for_harvest()
    }

    pub fn merge(&mut self, events: Vec<SpanEvent>, seen: u64) {
        self.queue.merge(events, seen);
    }
}

/// Everything the agent accumulates between harvests, bundled so exactly
/// one harvest cycle at a time can snapshot and restore it.
#[derive(Debug)]
pub struct LiveTelemetry {
    pub metrics: MetricAggregator,
    pub mapper: MetricMapper,
    pub errors: ErrorAggregator,
    pub traces: TraceAggregator,
    pub analytics: EventQueue<AnalyticsEvent>,
    pub custom: EventQueue<CustomEvent>,
    pub sql: SqlTraceAggregator,
    pub spans: SpanEventAggregator,
}

impl LiveTelemetry {
    pub fn new(config: &HarvestConfig) -> Self {
        Self {
            metrics: MetricAggregator::new(),
            mapper: MetricMapper::new(),
            errors: ErrorAggregator::new(config.error_trace_limit, config.error_event_limit),
            traces: TraceAggregator::new(
                config.synthetics_trace_limit,
                config.empty_harvests_before_watermark_reset,
            ),
            analytics: EventQueue::new(config.analytics_event_limit),
            custom: EventQueue::new(config.custom_event_limit),
            sql: SqlTraceAggregator::new(),
            spans: SpanEventAggregator::new(config.span_event_limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::AttributeMap;

    fn trace(name: &str, duration: f64, synthetics: bool) -> TransactionTrace {
        TransactionTrace {
            name: name.into(),
            timestamp: 1_000,
            duration,
            segment_count: 10,
            synthetics,
            attributes: AttributeMap::new(),
        }
    }

    #[test]
    fn metric_merge_combines_duplicate_ids() {
        let mut live = MetricAggregator::new();
        live.record(MetricId::unscoped("Dispatcher"), 1.0, 1.0);

        let mut restored = MetricAggregator::new();
        restored.record(MetricId::unscoped("Dispatcher"), 3.0, 3.0);
        restored.record(MetricId::unscoped("External"), 2.0, 2.0);

        live.merge(restored, true);
        let stats = live.get(&MetricId::unscoped("Dispatcher")).unwrap();
        assert_eq!(stats.call_count, 2);
        assert_eq!(stats.total, 4.0);
        assert_eq!(live.len(), 2);
    }

    #[test]
    fn counters_exist_at_zero() {
        let mut metrics = MetricAggregator::new();
        metrics.increment_call_count("Supportability/Events/Custom/Seen", 0);
        assert!(metrics.get(&MetricId::unscoped("Supportability/Events/Custom/Seen")).is_some());
        assert_eq!(metrics.call_count("Supportability/Events/Custom/Seen"), 0);
    }

    #[test]
    fn error_trace_list_is_bounded() {
        let mut errors = ErrorAggregator::new(2, 10);
        for i in 0..5 {
            errors.add_trace(TracedError {
                timestamp: i,
                transaction_name: "tx".into(),
                error_class: "Oops".into(),
                message: "boom".into(),
                attributes: AttributeMap::new(),
            });
        }
        assert_eq!(errors.trace_count(), 2);
        assert_eq!(errors.traces_seen(), 5);
    }

    #[test]
    fn trace_aggregator_keeps_slowest() {
        let mut traces = TraceAggregator::new(20, 5);
        traces.add(trace("fast", 10.0, false));
        traces.add(trace("slow", 50.0, false));
        traces.add(trace("medium", 30.0, false));

        let taken = traces.take();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].name, "slow");
        // Watermark persists: only slower traces collect next period.
        assert_eq!(traces.watermark(), 50.0);
    }

    #[test]
    fn synthetics_bypass_watermark() {
        let mut traces = TraceAggregator::new(2, 5);
        traces.add(trace("slow", 100.0, false));
        traces.add(trace("synth-1", 1.0, true));
        traces.add(trace("synth-2", 1.0, true));
        traces.add(trace("synth-3", 1.0, true));
        assert_eq!(traces.pending(), 3); // 2 synthetics + slowest
    }

    #[test]
    fn watermark_resets_after_empty_run() {
        let mut traces = TraceAggregator::new(20, 3);
        traces.add(trace("slow", 50.0, false));
        assert_eq!(traces.take().len(), 1);

        for _ in 0..3 {
            assert!(traces.take().is_empty());
        }
        assert_eq!(traces.watermark(), 0.0);

        // A fast trace collects again after the reset.
        traces.add(trace("fast", 5.0, false));
        assert_eq!(traces.take().len(), 1);
    }

    #[test]
    fn restored_trace_reclaims_its_slot() {
        let mut traces = TraceAggregator::new(20, 5);
        traces.add(trace("slow", 50.0, false));
        let taken = traces.take();

        // Merge-back re-adds individually; the equal duration must win the
        // slot back against the persisted watermark.
        for t in taken {
            traces.add(t);
        }
        assert_eq!(traces.pending(), 1);
    }

    #[test]
    fn sql_aggregates_by_query_id() {
        let mut sql = SqlTraceAggregator::new();
        sql.record(SqlSample::new(7, "Datastore/statement/select", "SELECT a", 5.0));
        sql.record(SqlSample::new(7, "Datastore/statement/select", "SELECT a", 9.0));
        sql.record(SqlSample::new(9, "Datastore/statement/update", "UPDATE b", 2.0));
        assert_eq!(sql.len(), 2);

        let samples = sql.take();
        let slow = samples.iter().find(|s| s.id == 7).unwrap();
        assert_eq!(slow.call_count, 2);
        assert_eq!(slow.total, 14.0);
        assert!(sql.is_empty());
    }
}
