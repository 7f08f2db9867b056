//! Telemetry data model shared by the aggregators, the harvest pipeline and
//! the trace compactor.
//!
//! Everything here is plain serializable data. Wire-level encoding beyond
//! JSON shape is the collector transport's concern, not ours.

use serde::ser::{SerializeMap, SerializeTuple};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;

/// Span identifier, unique within one transaction.
pub type SpanId = String;

/// Sampling priority assigned to a transaction by the adaptive sampler.
///
/// The sampler itself is a black box; only the number it produced is carried
/// through to the span-event reservoir.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Priority(pub f32);

impl Default for Priority {
    fn default() -> Self {
        Self(1.0)
    }
}

/// Attribute value types for telemetry metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// A single attribute together with its truncation-exempt flag.
///
/// Exempt attributes are skipped by downstream value truncation (e.g. the
/// `expected` flag copied onto a compacted span must survive verbatim).
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub value: AttributeValue,
    pub truncation_exempt: bool,
}

/// Mutable key→value attribute map with a per-key truncation-exempt flag.
///
/// Serializes as a plain JSON object; the exempt flag is agent-internal and
/// never leaves the process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeMap {
    entries: HashMap<String, Attribute>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a key to a value, clearing any exempt flag.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.entries.insert(
            key.into(),
            Attribute {
                value: value.into(),
                truncation_exempt: false,
            },
        );
    }

    /// Sets a key to a value marked exempt from truncation.
    pub fn set_exempt(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.entries.insert(
            key.into(),
            Attribute {
                value: value.into(),
                truncation_exempt: true,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.entries.get(key).map(|a| &a.value)
    }

    pub fn is_exempt(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|a| a.truncation_exempt)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Attribute)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for AttributeMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, attr) in &self.entries {
            map.serialize_entry(key, &attr.value)?;
        }
        map.end()
    }
}

/// Span category carried in the intrinsics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanCategory {
    Generic,
    Http,
    Datastore,
}

/// Intrinsic (agent-owned) span fields.
///
/// `merged_ids` and `merged_duration` are only present on a span that
/// absorbed same-entity siblings during compaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanIntrinsics {
    pub name: String,
    /// Start time, Unix milliseconds.
    pub timestamp: u64,
    /// Wall-clock duration in milliseconds.
    pub duration: f64,
    pub category: SpanCategory,
    #[serde(rename = "nr.ids", skip_serializing_if = "Option::is_none")]
    pub merged_ids: Option<Vec<SpanId>>,
    #[serde(rename = "nr.durations", skip_serializing_if = "Option::is_none")]
    pub merged_duration: Option<f64>,
}

/// A cross-reference from one span to another (e.g. across a distributed
/// trace boundary). Links must survive even if the span that originated
/// them is dropped, so `id` always names the span currently carrying the
/// link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanLink {
    pub id: SpanId,
    pub attributes: AttributeMap,
}

/// One node in a transaction's call graph.
///
/// Spans form a tree via `parent_id`; `None` marks the entry span. `id` is
/// unique within the transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Span {
    pub id: SpanId,
    pub parent_id: Option<SpanId>,
    pub intrinsics: SpanIntrinsics,
    pub attributes: AttributeMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_attrs: Option<AttributeMap>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub span_links: Vec<SpanLink>,
}

impl Span {
    /// Creates a generic span with empty attributes and no links.
    pub fn new(id: impl Into<SpanId>, name: impl Into<String>, timestamp: u64, duration: f64) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            intrinsics: SpanIntrinsics {
                name: name.into(),
                timestamp,
                duration,
                category: SpanCategory::Generic,
                merged_ids: None,
                merged_duration: None,
            },
            attributes: AttributeMap::new(),
            error_attrs: None,
            span_links: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<SpanId>) -> Self {
        self.parent_id = Some(parent.into());
        self
    }

    /// Start of the span's interval in milliseconds.
    pub fn start(&self) -> f64 {
        self.intrinsics.timestamp as f64
    }

    /// End of the span's half-open interval in milliseconds.
    pub fn end(&self) -> f64 {
        self.start() + self.intrinsics.duration
    }
}

/// A span queued for the span-event reservoir, paired with its
/// transaction's sampling priority.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanEvent {
    pub span: Span,
    pub priority: Priority,
}

/// Metric identity: a name plus an optional scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricId {
    pub name: String,
    pub scope: Option<String>,
}

impl MetricId {
    pub fn unscoped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: None,
        }
    }

    pub fn scoped(name: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: Some(scope.into()),
        }
    }
}

impl Serialize for MetricId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.scope.is_some() { 2 } else { 1 };
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("name", &self.name)?;
        if let Some(scope) = &self.scope {
            map.serialize_entry("scope", scope)?;
        }
        map.end()
    }
}

/// Aggregated statistics for one metric.
///
/// Serializes as the six-value array `[call_count, total, exclusive, min,
/// max, sum_of_squares]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricStats {
    pub call_count: u64,
    pub total: f64,
    pub exclusive: f64,
    pub min: f64,
    pub max: f64,
    pub sum_of_squares: f64,
}

impl MetricStats {
    /// Records one measurement.
    pub fn record(&mut self, total: f64, exclusive: f64) {
        if self.call_count == 0 {
            self.min = total;
            self.max = total;
        } else {
            self.min = self.min.min(total);
            self.max = self.max.max(total);
        }
        self.call_count += 1;
        self.total += total;
        self.exclusive += exclusive;
        self.sum_of_squares += total * total;
    }

    /// Bumps the call count without a measurement (supportability counters).
    pub fn increment_call_count(&mut self, n: u64) {
        self.call_count += n;
    }

    /// Folds another stats block into this one.
    pub fn merge(&mut self, other: &MetricStats) {
        if other.call_count == 0 {
            return;
        }
        if self.call_count == 0 {
            *self = *other;
            return;
        }
        self.call_count += other.call_count;
        self.total += other.total;
        self.exclusive += other.exclusive;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum_of_squares += other.sum_of_squares;
    }
}

impl Serialize for MetricStats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(6)?;
        tup.serialize_element(&self.call_count)?;
        tup.serialize_element(&self.total)?;
        tup.serialize_element(&self.exclusive)?;
        tup.serialize_element(&self.min)?;
        tup.serialize_element(&self.max)?;
        tup.serialize_element(&self.sum_of_squares)?;
        tup.end()
    }
}

/// One entry in the error trace list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TracedError {
    pub timestamp: u64,
    pub transaction_name: String,
    pub error_class: String,
    pub message: String,
    pub attributes: AttributeMap,
}

/// Sampled error occurrence for the error-event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEvent {
    pub error_class: String,
    pub message: String,
    pub timestamp: u64,
    pub transaction_name: String,
    pub attributes: AttributeMap,
}

/// User-recorded custom event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomEvent {
    pub event_type: String,
    pub timestamp: u64,
    pub attributes: AttributeMap,
}

/// Per-transaction analytics event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsEvent {
    pub name: String,
    pub timestamp: u64,
    pub duration: f64,
    pub attributes: AttributeMap,
}

/// Slow-SQL sample, keyed by query id. Aggregation keeps the slowest
/// observed query text alongside combined call statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlSample {
    pub id: u64,
    pub metric_name: String,
    pub query: String,
    pub call_count: u64,
    pub total: f64,
    pub min: f64,
    pub max: f64,
}

impl SqlSample {
    pub fn new(id: u64, metric_name: impl Into<String>, query: impl Into<String>, duration: f64) -> Self {
        Self {
            id,
            metric_name: metric_name.into(),
            query: query.into(),
            call_count: 1,
            total: duration,
            min: duration,
            max: duration,
        }
    }

    /// Folds another sample with the same query id into this one.
    pub fn aggregate(&mut self, other: &SqlSample) {
        if other.max > self.max {
            self.query = other.query.clone();
        }
        self.call_count += other.call_count;
        self.total += other.total;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

/// Finished transaction trace pending harvest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionTrace {
    pub name: String,
    pub timestamp: u64,
    pub duration: f64,
    pub segment_count: usize,
    pub synthetics: bool,
    pub attributes: AttributeMap,
}

impl TransactionTrace {
    /// Encodes the trace for the collector payload. Surfaced separately
    /// because trace JSON generation is the one encode step that can fail
    /// on pathological attribute data.
    pub fn encode(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_stats_record_and_merge() {
        let mut a = MetricStats::default();
        a.record(10.0, 8.0);
        a.record(2.0, 2.0);
        assert_eq!(a.call_count, 2);
        assert_eq!(a.min, 2.0);
        assert_eq!(a.max, 10.0);
        assert_eq!(a.total, 12.0);

        let mut b = MetricStats::default();
        b.record(20.0, 20.0);
        a.merge(&b);
        assert_eq!(a.call_count, 3);
        assert_eq!(a.max, 20.0);
        assert_eq!(a.min, 2.0);
    }

    #[test]
    fn merge_into_empty_copies() {
        let mut a = MetricStats::default();
        let mut b = MetricStats::default();
        b.record(5.0, 5.0);
        a.merge(&b);
        assert_eq!(a, b);
    }

    #[test]
    fn metric_stats_serialize_as_array() {
        let mut s = MetricStats::default();
        s.record(4.0, 3.0);
        let json = serde_json::to_value(s).unwrap();
        assert_eq!(json, serde_json::json!([1, 4.0, 3.0, 4.0, 4.0, 16.0]));
    }

    #[test]
    fn attribute_map_exempt_flag() {
        let mut m = AttributeMap::new();
        m.set("plain", "value");
        m.set_exempt("expected", true);
        assert!(!m.is_exempt("plain"));
        assert!(m.is_exempt("expected"));
        assert_eq!(m.get("expected"), Some(&AttributeValue::Bool(true)));
    }

    #[test]
    fn attribute_map_serializes_values_only() {
        let mut m = AttributeMap::new();
        m.set_exempt("expected", true);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json, serde_json::json!({ "expected": true }));
    }

    #[test]
    fn span_interval_bounds() {
        let span = Span::new("a", "op", 100, 50.0);
        assert_eq!(span.start(), 100.0);
        assert_eq!(span.end(), 150.0);
    }

    #[test]
    fn sql_sample_keeps_slowest_query() {
        let mut a = SqlSample::new(1, "Datastore/statement/select", "SELECT 1", 5.0);
        let b = SqlSample::new(1, "Datastore/statement/select", "SELECT 2", 9.0);
        a.aggregate(&b);
        assert_eq!(a.call_count, 2);
        assert_eq!(a.query, "SELECT 2");
        assert_eq!(a.max, 9.0);
        assert_eq!(a.min, 5.0);
        assert_eq!(a.total, 14.0);
    }
}
