//! Per-operation span reporting.

use std::fmt;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::ErrorKind;

/// How an operation settled, as reported to its span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanOutcome {
    /// Settled with a result.
    Success,
    /// Settled with an error of this kind.
    Failed(ErrorKind),
}

impl fmt::Display for SpanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpanOutcome::Success => f.write_str("success"),
            SpanOutcome::Failed(kind) => write!(f, "{:?}", kind),
        }
    }
}

/// An open span for one operation.
pub trait RequestSpan: Send {
    /// Attaches a key/value attribute.
    fn set_attribute(&mut self, key: &'static str, value: String);
    /// Closes the span.
    fn end(self: Box<Self>, outcome: SpanOutcome);
}

/// Creates spans for operations.
pub trait RequestTracer: Send + Sync {
    /// Opens a span for operation `op_id`.
    fn start_span(&self, name: &str, op_id: u64) -> Box<dyn RequestSpan>;
}

/// Discards everything.
#[derive(Debug, Clone, Default)]
pub struct NoopTracer;

struct NoopSpan;

impl RequestSpan for NoopSpan {
    fn set_attribute(&mut self, _key: &'static str, _value: String) {}
    fn end(self: Box<Self>, _outcome: SpanOutcome) {}
}

impl RequestTracer for NoopTracer {
    fn start_span(&self, _name: &str, _op_id: u64) -> Box<dyn RequestSpan> {
        Box::new(NoopSpan)
    }
}

/// Emits spans as `tracing` events.
#[derive(Debug, Clone, Default)]
pub struct LoggingTracer;

struct LoggingSpan {
    name: String,
    op_id: u64,
    started: Instant,
    attributes: Vec<(&'static str, String)>,
}

impl RequestSpan for LoggingSpan {
    fn set_attribute(&mut self, key: &'static str, value: String) {
        self.attributes.push((key, value));
    }

    fn end(self: Box<Self>, outcome: SpanOutcome) {
        info!(
            name = %self.name,
            op_id = self.op_id,
            outcome = %outcome,
            duration_us = self.started.elapsed().as_micros() as u64,
            attributes = ?self.attributes,
            "operation span"
        );
    }
}

impl RequestTracer for LoggingTracer {
    fn start_span(&self, name: &str, op_id: u64) -> Box<dyn RequestSpan> {
        debug!(name, op_id, "operation span started");
        Box::new(LoggingSpan {
            name: name.to_string(),
            op_id,
            started: Instant::now(),
            attributes: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spans_accept_attributes() {
        for tracer in [&NoopTracer as &dyn RequestTracer, &LoggingTracer] {
            let mut span = tracer.start_span("get", 1);
            span.set_attribute("node", "10.0.0.1:8091".to_string());
            span.end(SpanOutcome::Failed(ErrorKind::Timeout));
        }
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(SpanOutcome::Success.to_string(), "success");
        assert_eq!(SpanOutcome::Failed(ErrorKind::Timeout).to_string(), "Timeout");
    }
}
