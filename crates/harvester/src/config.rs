use std::time::Duration;

/// Configuration for one harvest pipeline.
///
/// Per-kind `*_enabled` flags mirror the collector-side feature toggles: a
/// disabled kind is still drained at snapshot time but its data is dropped
/// silently instead of sent.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Agent run id assigned at connect time; first element of every payload.
    pub run_id: u64,
    /// Target harvest period (owned by the external scheduler; carried here
    /// for payload start/end stamps and diagnostics).
    pub period: Duration,

    pub error_traces_enabled: bool,
    pub error_events_enabled: bool,
    pub analytics_events_enabled: bool,
    pub custom_events_enabled: bool,
    pub slow_sql_enabled: bool,
    pub span_events_enabled: bool,
    pub traces_enabled: bool,

    /// Reservoir capacities per event stream.
    pub analytics_event_limit: usize,
    pub custom_event_limit: usize,
    pub error_event_limit: usize,
    pub span_event_limit: usize,
    /// Error trace list bound (plain cap, not a reservoir).
    pub error_trace_limit: usize,
    /// Synthetics trace list bound.
    pub synthetics_trace_limit: usize,

    /// Traces with more segments than this are discarded with a warning.
    pub trace_segment_ceiling: usize,
    /// Consecutive empty trace harvests before the slow-trace duration
    /// watermark resets.
    pub empty_harvests_before_watermark_reset: u32,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            run_id: 0,
            period: Duration::from_secs(60),
            error_traces_enabled: true,
            error_events_enabled: true,
            analytics_events_enabled: true,
            custom_events_enabled: true,
            slow_sql_enabled: true,
            span_events_enabled: true,
            traces_enabled: true,
            analytics_event_limit: 1200,
            custom_event_limit: 3000,
            error_event_limit: 100,
            span_event_limit: 2000,
            error_trace_limit: 20,
            synthetics_trace_limit: 20,
            trace_segment_ceiling: 3000,
            empty_harvests_before_watermark_reset: 5,
        }
    }
}
