//! Telemetry Harvest - Periodic Collection and Upload Pipeline
//!
//! The harvest pipeline that sits between an instrumented application and
//! the collector backend. Telemetry accumulates in bounded in-memory
//! aggregates between cycles; every harvest period a [`HarvestCycle`]
//! atomically snapshots the live aggregates, sends each data kind to its
//! collector endpoint in a fixed order, and merges anything unsent back so
//! a flaky network never silently loses data.
//!
//! # Key pieces
//!
//! - Bounded event reservoirs (uniform sampling under overload) from the
//!   companion `reservoir` crate
//! - [`HarvestCycle`]: snapshot → sequential send → merge-back recovery
//! - [`PartialTraceCompactor`]: per-transaction span-graph reduction with
//!   reparenting and compact duration merging
//! - [`CollectorClient`]: the transport seam, with [`NullCollector`] as
//!   the built-in no-op implementation
//!
//! # Example
//!
//! ```
//! use harvester::{HarvestConfig, HarvestCycle, LiveTelemetry, MetricId, NullCollector};
//!
//! # let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! # rt.block_on(async {
//! let config = HarvestConfig::default();
//! let mut live = LiveTelemetry::new(&config);
//! live.metrics.record(MetricId::unscoped("WebTransaction/all"), 12.0, 12.0);
//!
//! let cycle = HarvestCycle::new(&mut live, &config);
//! cycle.send(&NullCollector, &mut live).await.unwrap();
//! # });
//! ```

mod aggregate;
mod collector;
mod config;
mod harvest;
mod partial_trace;
mod supportability;
mod telemetry;

pub use reservoir::{EventQueue, EventSegment, Reservoir};

pub use aggregate::{
    ErrorAggregator, LiveTelemetry, MetricAggregator, SpanEventAggregator, SqlTraceAggregator,
    TraceAggregator,
};
pub use collector::{CollectorClient, CollectorError, MetricMapper, MetricRenameRule, NullCollector};
pub use config::HarvestConfig;
pub use harvest::{HarvestCycle, HarvestError};
pub use partial_trace::{CompactorState, PartialTraceCompactor, PartialTraceKind};
pub use telemetry::{
    AnalyticsEvent, Attribute, AttributeMap, AttributeValue, CustomEvent, ErrorEvent, MetricId,
    MetricStats, Priority, Span, SpanCategory, SpanEvent, SpanId, SpanIntrinsics, SpanLink,
    SqlSample, TracedError, TransactionTrace,
};
