//! Collector Client Interface
//!
//! The remote collector is an external collaborator: eight independent
//! endpoints that each take a JSON payload and report success or failure,
//! plus a synchronous connectivity probe. The transport behind the trait
//! (HTTP, proxying, compression) is out of scope here; the harvest pipeline
//! only cares about the error taxonomy, in particular whether a failure is
//! recoverable (merge unsent data back) or not (payload too large —
//! discard, or an oversized payload would retry forever).

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Error classes a collector call can produce.
#[derive(Debug, Error, Clone)]
pub enum CollectorError {
    /// Transport-layer error (connection reset, DNS, TLS).
    #[error("transport error: {0}")]
    Transport(String),
    /// Server-side failure (5xx class); the payload may be resent later.
    #[error("collector returned status {status}")]
    Server { status: u16 },
    /// Payload exceeded the collector's size limit (413/415 class). The
    /// data is unrecoverably oversized and must be discarded, never merged
    /// back for retry.
    #[error("payload exceeds collector size limit")]
    PayloadTooLarge,
    /// Payload could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CollectorError {
    /// True when retrying this payload can never succeed, so recovery-merge
    /// must be skipped for it.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, CollectorError::PayloadTooLarge)
    }
}

/// Metric-name rewrite rule returned by the collector on a successful
/// metric delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricRenameRule {
    pub from: String,
    pub to: String,
}

/// Shared metric-name rewrite map.
///
/// Rules arrive from the collector with each successful `metric_data` call
/// and apply to every metric emitted afterwards. This is an explicit,
/// externally-owned object with an explicit [`clear`](Self::clear) — its
/// lifetime is tied to the agent run, not to any single harvest.
#[derive(Debug, Default)]
pub struct MetricMapper {
    rules: HashMap<String, String>,
}

impl MetricMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs rules, later rules overriding earlier ones for the same name.
    pub fn apply(&mut self, rules: Vec<MetricRenameRule>) {
        for rule in rules {
            self.rules.insert(rule.from, rule.to);
        }
    }

    /// Resolves a metric name through the rewrite map.
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.rules.get(name).map_or(name, String::as_str)
    }

    /// Drops all rules (agent shutdown / reconnect).
    pub fn clear(&mut self) {
        self.rules.clear();
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Async client for the remote collector's per-kind endpoints.
///
/// Every payload's first element is the run id. Event-kind payloads carry
/// `[run_id, {reservoir_size, events_seen}, events]`; metrics additionally
/// carry the harvest window `[run_id, start_s, end_s, metrics]`.
#[async_trait]
pub trait CollectorClient: Send + Sync {
    /// Synchronous connectivity probe, checked before every pipeline step.
    fn is_connected(&self) -> bool;

    /// Sends the metric table; a successful response may carry rename rules
    /// to install in the shared [`MetricMapper`].
    async fn metric_data(&self, payload: Value) -> Result<Vec<MetricRenameRule>, CollectorError>;

    async fn error_data(&self, payload: Value) -> Result<(), CollectorError>;

    async fn transaction_sample_data(&self, payload: Value) -> Result<(), CollectorError>;

    async fn analytics_events(&self, payload: Value) -> Result<(), CollectorError>;

    async fn custom_events(&self, payload: Value) -> Result<(), CollectorError>;

    async fn query_data(&self, payload: Value) -> Result<(), CollectorError>;

    async fn error_events(&self, payload: Value) -> Result<(), CollectorError>;

    async fn span_events(&self, payload: Value) -> Result<(), CollectorError>;
}

/// Collector that accepts and discards everything (benchmarks, demos).
pub struct NullCollector;

impl NullCollector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CollectorClient for NullCollector {
    fn is_connected(&self) -> bool {
        true
    }

    async fn metric_data(&self, _payload: Value) -> Result<Vec<MetricRenameRule>, CollectorError> {
        Ok(Vec::new())
    }

    async fn error_data(&self, _payload: Value) -> Result<(), CollectorError> {
        Ok(())
    }

    async fn transaction_sample_data(&self, _payload: Value) -> Result<(), CollectorError> {
        Ok(())
    }

    async fn analytics_events(&self, _payload: Value) -> Result<(), CollectorError> {
        Ok(())
    }

    async fn custom_events(&self, _payload: Value) -> Result<(), CollectorError> {
        Ok(())
    }

    async fn query_data(&self, _payload: Value) -> Result<(), CollectorError> {
        Ok(())
    }

    async fn error_events(&self, _payload: Value) -> Result<(), CollectorError> {
        Ok(())
    }

    async fn span_events(&self, _payload: Value) -> Result<(), CollectorError> {
        Ok(())
    }
}

/// Test collector that records every payload and can be scripted to fail
/// specific endpoints.
#[cfg(test)]
pub(crate) struct RecordingCollector {
    connected: std::sync::atomic::AtomicBool,
    payloads: std::sync::Mutex<Vec<(&'static str, Value)>>,
    failures: std::sync::Mutex<HashMap<&'static str, CollectorError>>,
    rename_rules: std::sync::Mutex<Vec<MetricRenameRule>>,
}

#[cfg(test)]
impl RecordingCollector {
    pub(crate) fn new() -> Self {
        Self {
            connected: std::sync::atomic::AtomicBool::new(true),
            payloads: std::sync::Mutex::new(Vec::new()),
            failures: std::sync::Mutex::new(HashMap::new()),
            rename_rules: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn disconnect(&self) {
        self.connected
            .store(false, std::sync::atomic::Ordering::Relaxed);
    }

    pub(crate) fn fail_endpoint(&self, endpoint: &'static str, error: CollectorError) {
        self.failures.lock().unwrap().insert(endpoint, error);
    }

    pub(crate) fn respond_with_rules(&self, rules: Vec<MetricRenameRule>) {
        *self.rename_rules.lock().unwrap() = rules;
    }

    pub(crate) fn payloads_for(&self, endpoint: &str) -> Vec<Value> {
        self.payloads
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| *name == endpoint)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub(crate) fn endpoints_called(&self) -> Vec<&'static str> {
        self.payloads.lock().unwrap().iter().map(|(name, _)| *name).collect()
    }

    fn record(&self, endpoint: &'static str, payload: Value) -> Result<(), CollectorError> {
        self.payloads.lock().unwrap().push((endpoint, payload));
        if let Some(error) = self.failures.lock().unwrap().get(endpoint) {
            return Err(error.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl CollectorClient for RecordingCollector {
    fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::Relaxed)
    }

    async fn metric_data(&self, payload: Value) -> Result<Vec<MetricRenameRule>, CollectorError> {
        self.record("metric_data", payload)?;
        Ok(self.rename_rules.lock().unwrap().clone())
    }

    async fn error_data(&self, payload: Value) -> Result<(), CollectorError> {
        self.record("error_data", payload)
    }

    async fn transaction_sample_data(&self, payload: Value) -> Result<(), CollectorError> {
        self.record("transaction_sample_data", payload)
    }

    async fn analytics_events(&self, payload: Value) -> Result<(), CollectorError> {
        self.record("analytics_events", payload)
    }

    async fn custom_events(&self, payload: Value) -> Result<(), CollectorError> {
        self.record("custom_events", payload)
    }

    async fn query_data(&self, payload: Value) -> Result<(), CollectorError> {
        self.record("query_data", payload)
    }

    async fn error_events(&self, payload: Value) -> Result<(), CollectorError> {
        self.record("error_events", payload)
    }

    async fn span_events(&self, payload: Value) -> Result<(), CollectorError> {
        self.record("span_events", payload)
    }
}
