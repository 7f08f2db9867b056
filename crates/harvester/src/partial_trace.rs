//! Partial-Trace Compaction
//!
//! At transaction end, the full span call-graph flows once through a
//! [`PartialTraceCompactor`] before anything reaches the span-event
//! reservoir. An externally supplied per-span rule decides drop/keep; the
//! compactor's job is to keep the reduced graph honest afterwards:
//!
//! - **Reparenting** (standard partial traces): a surviving span whose
//!   ancestors were dropped is reattached to its nearest surviving
//!   ancestor, so arbitrary interior-node removal never disconnects the
//!   graph.
//! - **Span-link rescue**: links carried by a dropped span move to the most
//!   recently kept span, so distributed-trace linkage survives data loss.
//! - **Compaction** (compact traces): multiple exit spans to the same
//!   downstream entity collapse onto one retained span carrying the
//!   interval-union duration (overlap-corrected, never a naive sum), the
//!   most recent error, and the absorbed member ids.
//!
//! Everything here is pure data manipulation; the only failure mode is a
//! panic in the caller-supplied rule, which is the caller's to guard.

use crate::aggregate::{MetricAggregator, SpanEventAggregator};
use crate::supportability;
use crate::telemetry::{AttributeMap, Priority, Span, SpanId};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Volume-limiting policy for one transaction's trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialTraceKind {
    /// Identity: every span the rule keeps passes through untouched.
    Full,
    /// Dropped interior spans leave tombstones; survivors reparent onto
    /// their nearest surviving ancestor at finalization.
    Standard,
    /// Same-entity exit spans collapse onto one retained span with merged
    /// duration accounting.
    Compact,
}

/// Per-transaction compactor state, visible to the rule function so it can
/// register compact groups as the trace is walked.
#[derive(Debug, Default)]
pub struct CompactorState {
    /// Kept spans, insertion order. The first survivor is the
    /// transaction's entry representative for reparenting purposes.
    spans: Vec<Span>,
    /// Tombstones: dropped span id → its parent at drop time.
    dropped: HashMap<SpanId, Option<SpanId>>,
    /// Compact groups keyed by retained span id; first member is a copy of
    /// the retained exit span itself.
    compact_groups: HashMap<SpanId, Vec<Span>>,
}

impl CompactorState {
    /// Spans kept so far, in insertion order.
    pub fn kept_spans(&self) -> &[Span] {
        &self.spans
    }

    /// Registers a span as a compact-group member of an already-kept span.
    ///
    /// Rules call this when they collapse a duplicate exit call onto the
    /// retained span for the same downstream entity. Unknown retained ids
    /// are ignored: a group key must name a kept span.
    pub fn record_compact_member(&mut self, retained_id: &SpanId, span: Span) {
        if !self.compact_groups.contains_key(retained_id) {
            let Some(head) = self.spans.iter().find(|s| &s.id == retained_id) else {
                return;
            };
            let head = head.clone();
            self.compact_groups.insert(retained_id.clone(), vec![head]);
        }
        if let Some(group) = self.compact_groups.get_mut(retained_id) {
            group.push(span);
        }
    }
}

/// Reduces one finished transaction's span set under a volume-limiting
/// policy. Created per transaction; [`finalize`](Self::finalize) consumes
/// the accumulated state and leaves the instance reusable.
#[derive(Debug)]
pub struct PartialTraceCompactor {
    kind: PartialTraceKind,
    state: CompactorState,
}

impl PartialTraceCompactor {
    pub fn new(kind: PartialTraceKind) -> Self {
        Self {
            kind,
            state: CompactorState::default(),
        }
    }

    pub fn kind(&self) -> PartialTraceKind {
        self.kind
    }

    /// Runs one span through the drop/keep rule.
    ///
    /// The span's identity, parentage and links are captured *before* the
    /// rule runs — the rule may mutate or discard the span object. A
    /// dropped span (outside compact mode) leaves a tombstone for later
    /// reparenting, and any links it carried are reassigned to the most
    /// recently kept span so they are never silently lost.
    pub fn add_span<R>(
        &mut self,
        span: Span,
        is_entry: bool,
        rule: &mut R,
        metrics: &mut MetricAggregator,
    ) where
        R: FnMut(Span, bool, &mut CompactorState) -> Option<Span>,
    {
        let id = span.id.clone();
        let parent_id = span.parent_id.clone();
        let links = span.span_links.clone();

        metrics.increment_call_count(supportability::SPANS_INSTRUMENTED, 1);

        match rule(span, is_entry, &mut self.state) {
            Some(kept) => {
                metrics.increment_call_count(supportability::SPANS_KEPT, 1);
                self.state.spans.push(kept);
            }
            None if self.kind != PartialTraceKind::Compact => {
                self.state.dropped.insert(id, parent_id);
                if !links.is_empty() {
                    if let Some(last_kept) = self.state.spans.last_mut() {
                        for mut link in links {
                            link.id = last_kept.id.clone();
                            last_kept.span_links.push(link);
                        }
                    }
                }
            }
            None => {}
        }
    }

    /// Finalizes the transaction: repairs the reduced graph, hands every
    /// surviving span to the span-event reservoir with the transaction's
    /// sampling priority, and clears state for the next transaction.
    pub fn finalize(
        &mut self,
        base_segment_id: &SpanId,
        priority: Priority,
        span_events: &mut SpanEventAggregator,
        metrics: &mut MetricAggregator,
    ) {
        if self.kind == PartialTraceKind::Compact {
            self.merge_compact_groups(base_segment_id, metrics);
        } else {
            self.reparent_orphans();
        }

        for span in self.state.spans.drain(..) {
            span_events.add(span, priority);
        }
        self.state.dropped.clear();
        self.state.compact_groups.clear();
    }

    /// Rewrites each kept span's parent to its nearest surviving ancestor
    /// by walking the tombstone chain. The walk is bounded by the number
    /// of dropped spans so it terminates even on cyclic/corrupt input.
    fn reparent_orphans(&mut self) {
        let hop_limit = self.state.dropped.len();
        for span in &mut self.state.spans {
            let Some(original) = span.parent_id.clone() else {
                continue;
            };
            let mut resolved = Some(original.clone());
            let mut hops = 0;
            while let Some(current) = resolved.as_ref() {
                if hops >= hop_limit {
                    break;
                }
                match self.state.dropped.get(current) {
                    Some(parent) => {
                        resolved = parent.clone();
                        hops += 1;
                    }
                    None => break,
                }
            }
            if resolved.as_ref() != Some(&original) {
                span.parent_id = resolved;
            }
        }
    }

    /// Collapses each multi-member compact group onto its retained span:
    /// reparent to the base segment, interval-union the member durations,
    /// propagate the most recent error, and record the absorbed ids.
    fn merge_compact_groups(&mut self, base_segment_id: &SpanId, metrics: &mut MetricAggregator) {
        let groups = std::mem::take(&mut self.state.compact_groups);
        for (retained_id, mut members) in groups {
            if members.len() < 2 {
                continue;
            }
            let Some(retained) = self.state.spans.iter_mut().find(|s| s.id == retained_id) else {
                continue;
            };

            // Flatten the hierarchy under the entry point.
            retained.parent_id = Some(base_segment_id.clone());

            // Interval-union duration: a running [start, end) window over
            // the members sorted by start. Touching windows coalesce, so
            // concurrent calls to the entity are never double-counted.
            members.sort_by(|a, b| {
                a.start().partial_cmp(&b.start()).unwrap_or(Ordering::Equal)
            });
            let mut total = 0.0;
            let mut window_start = members[0].start();
            let mut window_end = members[0].end();
            for member in &members[1..] {
                if member.start() <= window_end {
                    window_end = window_end.max(member.end());
                } else {
                    total += window_end - window_start;
                    window_start = member.start();
                    window_end = member.end();
                }
            }
            total += window_end - window_start;

            // Most recent error wins; an equal timestamp defers to the
            // later member in iteration order.
            let mut best_error: Option<&Span> = None;
            for member in &members {
                if member.error_attrs.is_none() {
                    continue;
                }
                match best_error {
                    Some(current) if member.intrinsics.timestamp < current.intrinsics.timestamp => {}
                    _ => best_error = Some(member),
                }
            }
            if let Some(source) = best_error.and_then(|m| m.error_attrs.as_ref()) {
                let mut copied = AttributeMap::new();
                for (key, attr) in source.iter() {
                    if key == "expected" {
                        copied.set_exempt(key.clone(), attr.value.clone());
                    } else {
                        copied.set(key.clone(), attr.value.clone());
                    }
                }
                retained.error_attrs = Some(copied);
            }

            let other_ids: Vec<SpanId> = members
                .iter()
                .map(|m| m.id.clone())
                .filter(|id| *id != retained_id)
                .collect();
            let absorbed = other_ids.len() as u64;
            retained.intrinsics.merged_ids = Some(other_ids);
            retained.intrinsics.merged_duration = Some(total);
            metrics.increment_call_count(supportability::SPANS_COMPACTION_DROPPED, absorbed);
        }
    }
}
