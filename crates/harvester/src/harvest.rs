//! Harvest Cycle - Snapshot, Sequence, Recover
//!
//! One [`HarvestCycle`] executes exactly one harvest end-to-end:
//!
//! 1. **Snapshot** (construction): drain every live aggregator in a fixed
//!    order, record seen/sent/dropped supportability counters, drop
//!    config-disabled kinds, clamp oversized traces, split event queues
//!    into bounded payload segments.
//! 2. **Send**: deliver each kind to its collector endpoint strictly
//!    sequentially. Connectivity is probed before every step; the first
//!    hard failure halts the pipeline.
//! 3. **Recover**: on failure, merge every not-yet-delivered snapshot back
//!    into the live aggregators so nothing is lost, then surface the error
//!    once.
//!
//! There is no retry inside a cycle; the external periodic scheduler starts
//! a fresh cycle next period. Exactly one cycle can be in flight per agent
//! because both construction and [`send`](HarvestCycle::send) require
//! `&mut LiveTelemetry`.
//!
//! Payload-too-large responses are the one failure class that must *not*
//! restore data: an oversized payload would fail identically on every
//! retry, so its kind is discarded instead.

use crate::aggregate::{LiveTelemetry, MetricAggregator};
use crate::collector::{CollectorClient, CollectorError};
use crate::config::HarvestConfig;
use crate::supportability;
use crate::telemetry::{
    AnalyticsEvent, CustomEvent, ErrorEvent, SpanEvent, SqlSample, TracedError, TransactionTrace,
};
use reservoir::EventSegment;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::task::yield_now;
use tracing::{debug, warn};

/// Error types for a harvest cycle.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// The collector reported disconnected before a step ran. Nothing that
    /// was still pending is lost; it all merges back.
    #[error("collector is not connected")]
    NotConnected,
    /// A collector endpoint rejected its payload.
    #[error("{endpoint} delivery failed")]
    Endpoint {
        endpoint: &'static str,
        #[source]
        source: CollectorError,
    },
    /// Transaction trace JSON generation failed; the trace snapshot is
    /// discarded rather than merged back half-serialized.
    #[error("trace encoding failed: {0}")]
    TraceEncoding(String),
}

/// Snapshotted metric table plus its accumulation window start.
#[derive(Debug)]
struct MetricsSegment {
    metrics: MetricAggregator,
}

/// Snapshotted error trace list with the seen count it represents.
#[derive(Debug)]
struct ErrorTraceSegment {
    errors: Vec<TracedError>,
    seen: u64,
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Builds the uniform event payload `[run_id, sampler_state, events]`.
fn event_payload<T: Serialize>(
    run_id: u64,
    segment: &EventSegment<T>,
) -> Result<Value, CollectorError> {
    let events = serde_json::to_value(&segment.events)
        .map_err(|e| CollectorError::Serialization(e.to_string()))?;
    Ok(json!([
        run_id,
        { "reservoir_size": segment.limit, "events_seen": segment.seen },
        events,
    ]))
}

/// Fails the current step when the collector reports disconnected.
///
/// The yield keeps the public contract that `send` never completes
/// synchronously relative to its caller, even on the fast failure path.
async fn ensure_connected(collector: &dyn CollectorClient) -> Result<(), HarvestError> {
    if collector.is_connected() {
        Ok(())
    } else {
        yield_now().await;
        Err(HarvestError::NotConnected)
    }
}

/// Sends one event kind's segments sequentially.
///
/// Each segment is an independent delivery: a delivered segment is removed
/// from the slot immediately, so a later failure only merges back the
/// halves that were never confirmed. Payload-too-large discards the whole
/// kind. Implemented as a macro because the four event kinds differ only
/// in slot field and endpoint method.
macro_rules! send_event_segments {
    ($self:ident, $collector:ident, $field:ident, $endpoint:literal, $method:ident) => {{
        ensure_connected($collector).await?;
        loop {
            let payload = {
                let Some(segments) = $self.$field.as_ref() else {
                    debug!(endpoint = $endpoint, "nothing to send");
                    yield_now().await;
                    break;
                };
                let Some(segment) = segments.first() else {
                    $self.$field = None;
                    yield_now().await;
                    break;
                };
                match event_payload($self.run_id, segment) {
                    Ok(payload) => payload,
                    Err(error) => {
                        // Half-serialized state must not merge back.
                        warn!(endpoint = $endpoint, %error, "payload serialization failed, discarding kind");
                        $self.$field = None;
                        return Err(HarvestError::Endpoint {
                            endpoint: $endpoint,
                            source: error,
                        });
                    }
                }
            };
            match $collector.$method(payload).await {
                Ok(()) => {
                    if let Some(segments) = $self.$field.as_mut() {
                        segments.remove(0);
                    }
                }
                Err(error) if error.is_unrecoverable() => {
                    $self.$field = None;
                    return Err(HarvestError::Endpoint {
                        endpoint: $endpoint,
                        source: error,
                    });
                }
                Err(error) => {
                    return Err(HarvestError::Endpoint {
                        endpoint: $endpoint,
                        source: error,
                    });
                }
            }
        }
        Ok::<(), HarvestError>(())
    }};
}

/// One harvest invocation: owns the snapshot exclusively until the cycle
/// completes or fails.
///
/// State machine: `Constructed → Sending(step i) → {Sending(step i+1) |
/// Failed → Merging → Done} | Done`.
#[derive(Debug)]
pub struct HarvestCycle {
    run_id: u64,
    metrics: Option<MetricsSegment>,
    error_traces: Option<ErrorTraceSegment>,
    traces: Option<Vec<TransactionTrace>>,
    analytics: Option<Vec<EventSegment<AnalyticsEvent>>>,
    custom: Option<Vec<EventSegment<CustomEvent>>>,
    sql: Option<Vec<SqlSample>>,
    error_events: Option<Vec<EventSegment<ErrorEvent>>>,
    span_events: Option<Vec<EventSegment<SpanEvent>>>,
}

impl HarvestCycle {
    /// Snapshots everything pending, in the fixed kind order, and resets
    /// the live aggregators for the next period.
    ///
    /// Preparation counters land in the *fresh* live metric table — they
    /// describe this harvest and ride out with the next one.
    pub fn new(live: &mut LiveTelemetry, config: &HarvestConfig) -> Self {
        // Metrics close their accumulation window before anything below
        // records new counters.
        let metrics = Some(MetricsSegment {
            metrics: live.metrics.take(),
        });

        // Error traces.
        let (errors, errors_seen) = live.errors.take_traces();
        let errors_sent = errors.len() as u64;
        live.metrics
            .increment_call_count("Supportability/Errors/Seen", errors_seen);
        live.metrics
            .increment_call_count("Supportability/Errors/Sent", errors_sent);
        live.metrics.increment_call_count(
            "Supportability/Errors/Dropped",
            errors_seen - errors_sent,
        );
        let error_traces = if config.error_traces_enabled {
            Some(ErrorTraceSegment {
                errors,
                seen: errors_seen,
            })
        } else {
            debug!(endpoint = "error_data", "kind disabled by configuration, dropping snapshot");
            None
        };

        // Transaction traces: clamp oversized ones at snapshot time.
        let pending = live.traces.take();
        let mut kept = Vec::with_capacity(pending.len());
        for trace in pending {
            if trace.segment_count > config.trace_segment_ceiling {
                warn!(
                    name = %trace.name,
                    segments = trace.segment_count,
                    ceiling = config.trace_segment_ceiling,
                    "trace exceeds segment ceiling, discarding"
                );
            } else {
                kept.push(trace);
            }
        }
        live.metrics
            .increment_call_count("Supportability/Traces/Sent", kept.len() as u64);
        let traces = if config.traces_enabled {
            Some(kept)
        } else {
            debug!(
                endpoint = "transaction_sample_data",
                "kind disabled by configuration, dropping snapshot"
            );
            None
        };

        // Event streams, in order: analytics, custom, (sql between), error
        // events, span events.
        let analytics = {
            let seen = live.analytics.seen();
            let retained = live.analytics.len() as u64;
            supportability::record_event_counters(
                &mut live.metrics,
                "Analytic",
                seen,
                retained,
                seen - retained,
            );
            let segments = live.analytics.split_for_harvest();
            if config.analytics_events_enabled {
                Some(segments)
            } else {
                debug!(endpoint = "analytics_events", "kind disabled by configuration, dropping snapshot");
                None
            }
        };

        let custom = {
            let seen = live.custom.seen();
            let retained = live.custom.len() as u64;
            supportability::record_event_counters(
                &mut live.metrics,
                "Custom",
                seen,
                retained,
                seen - retained,
            );
            let segments = live.custom.split_for_harvest();
            if config.custom_events_enabled {
                Some(segments)
            } else {
                debug!(endpoint = "custom_events", "kind disabled by configuration, dropping snapshot");
                None
            }
        };

        let samples = live.sql.take();
        live.metrics
            .increment_call_count("Supportability/SqlTraces/Sent", samples.len() as u64);
        let sql = if config.slow_sql_enabled {
            Some(samples)
        } else {
            debug!(endpoint = "query_data", "kind disabled by configuration, dropping snapshot");
            None
        };

        let error_events = {
            let queue = live.errors.events_mut();
            let seen = queue.seen();
            let retained = queue.len() as u64;
            let segments = queue.split_for_harvest();
            supportability::record_event_counters(
                &mut live.metrics,
                "TransactionError",
                seen,
                retained,
                seen - retained,
            );
            if config.error_events_enabled {
                Some(segments)
            } else {
                debug!(endpoint = "error_events", "kind disabled by configuration, dropping snapshot");
                None
            }
        };

        let span_events = {
            let seen = live.spans.seen();
            let retained = live.spans.len() as u64;
            supportability::record_event_counters(
                &mut live.metrics,
                "Span",
                seen,
                retained,
                seen - retained,
            );
            let segments = live.spans.split_for_harvest();
            if config.span_events_enabled {
                Some(segments)
            } else {
                debug!(endpoint = "span_events", "kind disabled by configuration, dropping snapshot");
                None
            }
        };

        Self {
            run_id: config.run_id,
            metrics,
            error_traces,
            traces,
            analytics,
            custom,
            sql,
            error_events,
            span_events,
        }
    }

    /// Number of kinds still holding undelivered snapshot data.
    pub fn pending_kinds(&self) -> usize {
        usize::from(self.metrics.is_some())
            + usize::from(self.error_traces.is_some())
            + usize::from(self.traces.is_some())
            + usize::from(self.analytics.is_some())
            + usize::from(self.custom.is_some())
            + usize::from(self.sql.is_some())
            + usize::from(self.error_events.is_some())
            + usize::from(self.span_events.is_some())
    }

    /// Executes the send pipeline.
    ///
    /// Steps run strictly sequentially; the first failure halts the
    /// pipeline, merges everything undelivered back into `live`, and
    /// surfaces the error exactly once. Success means every snapshot slot
    /// was cleared (durably delivered or deliberately discarded).
    pub async fn send(
        mut self,
        collector: &dyn CollectorClient,
        live: &mut LiveTelemetry,
    ) -> Result<(), HarvestError> {
        match self.run_pipeline(collector, live).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.merge_unsent(live);
                Err(error)
            }
        }
    }

    async fn run_pipeline(
        &mut self,
        collector: &dyn CollectorClient,
        live: &mut LiveTelemetry,
    ) -> Result<(), HarvestError> {
        self.send_metrics(collector, live).await?;
        self.send_error_traces(collector).await?;
        self.send_traces(collector).await?;
        send_event_segments!(self, collector, analytics, "analytics_events", analytics_events)?;
        send_event_segments!(self, collector, custom, "custom_events", custom_events)?;
        self.send_sql(collector).await?;
        send_event_segments!(self, collector, error_events, "error_events", error_events)?;
        send_event_segments!(self, collector, span_events, "span_events", span_events)?;
        Ok(())
    }

    /// Metrics go out even when the table is empty: the payload doubles as
    /// the collector-side heartbeat for the harvest window.
    async fn send_metrics(
        &mut self,
        collector: &dyn CollectorClient,
        live: &mut LiveTelemetry,
    ) -> Result<(), HarvestError> {
        const ENDPOINT: &str = "metric_data";
        ensure_connected(collector).await?;
        let Some(segment) = self.metrics.take() else {
            yield_now().await;
            return Ok(());
        };

        let mut entries = Vec::with_capacity(segment.metrics.len());
        for (id, stats) in segment.metrics.iter() {
            let name = live.mapper.resolve(&id.name);
            let id_json = match &id.scope {
                Some(scope) => json!({ "name": name, "scope": scope }),
                None => json!({ "name": name }),
            };
            entries.push(json!([id_json, stats]));
        }
        let payload = json!([
            self.run_id,
            segment.metrics.started_at(),
            unix_seconds(),
            entries,
        ]);

        match collector.metric_data(payload).await {
            Ok(rules) => {
                live.mapper.apply(rules);
                Ok(())
            }
            Err(error) => {
                if !error.is_unrecoverable() {
                    self.metrics = Some(segment);
                }
                Err(HarvestError::Endpoint {
                    endpoint: ENDPOINT,
                    source: error,
                })
            }
        }
    }

    async fn send_error_traces(
        &mut self,
        collector: &dyn CollectorClient,
    ) -> Result<(), HarvestError> {
        const ENDPOINT: &str = "error_data";
        ensure_connected(collector).await?;
        let Some(segment) = self.error_traces.take() else {
            yield_now().await;
            return Ok(());
        };
        if segment.errors.is_empty() {
            debug!(endpoint = ENDPOINT, "nothing to send");
            yield_now().await;
            return Ok(());
        }

        let errors = match serde_json::to_value(&segment.errors) {
            Ok(errors) => errors,
            Err(error) => {
                // Half-serialized state must not merge back.
                warn!(endpoint = ENDPOINT, %error, "payload serialization failed, discarding kind");
                return Err(HarvestError::Endpoint {
                    endpoint: ENDPOINT,
                    source: CollectorError::Serialization(error.to_string()),
                });
            }
        };
        let payload = json!([self.run_id, errors]);

        match collector.error_data(payload).await {
            Ok(()) => Ok(()),
            Err(error) => {
                if !error.is_unrecoverable() {
                    self.error_traces = Some(segment);
                }
                Err(HarvestError::Endpoint {
                    endpoint: ENDPOINT,
                    source: error,
                })
            }
        }
    }

    async fn send_traces(&mut self, collector: &dyn CollectorClient) -> Result<(), HarvestError> {
        const ENDPOINT: &str = "transaction_sample_data";
        ensure_connected(collector).await?;
        let Some(traces) = self.traces.take() else {
            yield_now().await;
            return Ok(());
        };
        if traces.is_empty() {
            debug!(endpoint = ENDPOINT, "nothing to send");
            yield_now().await;
            return Ok(());
        }

        let mut encoded = Vec::with_capacity(traces.len());
        for trace in &traces {
            match trace.encode() {
                Ok(value) => encoded.push(value),
                Err(error) => {
                    // Discard rather than merge back half-serialized state.
                    warn!(endpoint = ENDPOINT, %error, "trace encoding failed, discarding kind");
                    return Err(HarvestError::TraceEncoding(error.to_string()));
                }
            }
        }
        let payload = json!([self.run_id, encoded]);

        match collector.transaction_sample_data(payload).await {
            Ok(()) => Ok(()),
            Err(error) => {
                if !error.is_unrecoverable() {
                    self.traces = Some(traces);
                }
                Err(HarvestError::Endpoint {
                    endpoint: ENDPOINT,
                    source: error,
                })
            }
        }
    }

    async fn send_sql(&mut self, collector: &dyn CollectorClient) -> Result<(), HarvestError> {
        const ENDPOINT: &str = "query_data";
        ensure_connected(collector).await?;
        let Some(samples) = self.sql.take() else {
            yield_now().await;
            return Ok(());
        };
        if samples.is_empty() {
            debug!(endpoint = ENDPOINT, "nothing to send");
            yield_now().await;
            return Ok(());
        }

        let encoded = match serde_json::to_value(&samples) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(endpoint = ENDPOINT, %error, "payload serialization failed, discarding kind");
                return Err(HarvestError::Endpoint {
                    endpoint: ENDPOINT,
                    source: CollectorError::Serialization(error.to_string()),
                });
            }
        };
        let payload = json!([self.run_id, encoded]);

        match collector.query_data(payload).await {
            Ok(()) => Ok(()),
            Err(error) => {
                if !error.is_unrecoverable() {
                    self.sql = Some(samples);
                }
                Err(HarvestError::Endpoint {
                    endpoint: ENDPOINT,
                    source: error,
                })
            }
        }
    }

    /// Merges every undelivered snapshot slot back into the live
    /// aggregators. Runs exactly once, only after the pipeline halted.
    fn merge_unsent(&mut self, live: &mut LiveTelemetry) {
        let mut restored = 0usize;

        if let Some(segment) = self.metrics.take() {
            live.metrics.merge(segment.metrics, true);
            restored += 1;
        }
        if let Some(segment) = self.error_traces.take() {
            live.errors.merge_traces(segment.errors, segment.seen);
            restored += 1;
        }
        if let Some(traces) = self.traces.take() {
            for trace in traces {
                live.traces.add(trace);
            }
            restored += 1;
        }
        if let Some(segments) = self.analytics.take() {
            for segment in segments {
                live.analytics.merge(segment.events, segment.seen);
            }
            restored += 1;
        }
        if let Some(segments) = self.custom.take() {
            for segment in segments {
                live.custom.merge(segment.events, segment.seen);
            }
            restored += 1;
        }
        if let Some(samples) = self.sql.take() {
            live.sql.merge(samples);
            restored += 1;
        }
        if let Some(segments) = self.error_events.take() {
            for segment in segments {
                live.errors.events_mut().merge(segment.events, segment.seen);
            }
            restored += 1;
        }
        if let Some(segments) = self.span_events.take() {
            for segment in segments {
                live.spans.merge(segment.events, segment.seen);
            }
            restored += 1;
        }

        if restored > 0 {
            warn!(kinds = restored, "harvest failed, merged unsent telemetry back into live aggregators");
        }
    }
}
