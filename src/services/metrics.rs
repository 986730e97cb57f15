//! Metric events emitted by the router and where they go.
//!
//! Sinks must never block request handling: `record` is synchronous and is
//! expected to hand the event off (to a log line, a buffer, a channel) and
//! return immediately.

use crate::models::host::HostDetails;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Hit,
    MissFilled,
    MissAbsent,
    Error,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Hit => "hit",
            MetricKind::MissFilled => "miss_filled",
            MetricKind::MissAbsent => "miss_absent",
            MetricKind::Error => "error",
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub kind: MetricKind,
    pub key: String,
    pub latency: Duration,
    pub error_class: Option<String>,
}

impl MetricEvent {
    pub fn new(kind: MetricKind, key: impl Into<String>, latency: Duration) -> Self {
        Self {
            kind,
            key: key.into(),
            latency,
            error_class: None,
        }
    }

    pub fn with_error_class(mut self, class: impl Into<String>) -> Self {
        self.error_class = Some(class.into());
        self
    }
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

/// Emits every event as a structured log line on the `metrics` target,
/// tagged with the host and the proxied locations.
pub struct LogMetricsSink {
    host: HostDetails,
    source: String,
    bucket: String,
}

impl LogMetricsSink {
    pub fn new(host: HostDetails, source: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            host,
            source: source.into(),
            bucket: bucket.into(),
        }
    }
}

impl MetricsSink for LogMetricsSink {
    fn record(&self, event: MetricEvent) {
        tracing::info!(
            target: "metrics",
            kind = event.kind.as_str(),
            key = %event.key,
            latency_ms = event.latency.as_secs_f64() * 1000.0,
            error_class = event.error_class.as_deref().unwrap_or(""),
            hostname = %self.host.hostname,
            region = %self.host.region,
            instance_id = %self.host.instance_id,
            instance_type = %self.host.instance_type,
            source = %self.source,
            bucket = %self.bucket,
            "proxy.request"
        );
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct MemoryMetricsSink {
    events: Mutex<Vec<MetricEvent>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: MetricKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn record(&self, event: MetricEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_counts_by_kind() {
        let sink = MemoryMetricsSink::new();
        sink.record(MetricEvent::new(MetricKind::Hit, "a", Duration::from_millis(1)));
        sink.record(MetricEvent::new(MetricKind::Hit, "b", Duration::from_millis(2)));
        sink.record(
            MetricEvent::new(MetricKind::Error, "c", Duration::ZERO)
                .with_error_class("upstream.transient"),
        );

        assert_eq!(sink.count(MetricKind::Hit), 2);
        assert_eq!(sink.count(MetricKind::MissFilled), 0);
        let events = sink.events();
        assert_eq!(events[2].error_class.as_deref(), Some("upstream.transient"));
    }

    #[test]
    fn log_sink_accepts_events_without_a_subscriber() {
        let sink = LogMetricsSink::new(HostDetails::default(), "https://src", "bucket");
        sink.record(MetricEvent::new(MetricKind::MissAbsent, "k", Duration::ZERO));
    }
}
