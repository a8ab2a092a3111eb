//! OpenTelemetry instruments for the work queues and node processing.
//!
//! Instruments are created from the global meter provider, so they only
//! export once `logger::init_tracing` has installed an OTLP provider. Without
//! one they record into the no-op provider.

use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};

pub const METER_NAME: &str = "nodeflow";

pub fn meter() -> Meter {
    global::meter(METER_NAME)
}

/// Per-queue counters, tagged with the queue name.
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    attributes: [KeyValue; 1],
    processed: Counter<u64>,
    dropped: Counter<u64>,
    slow: Counter<u64>,
}

impl QueueMetrics {
    pub fn new(meter: &Meter, queue: &str) -> Self {
        Self {
            attributes: [KeyValue::new("queue", queue.to_string())],
            processed: meter
                .u64_counter("queue_items_processed")
                .with_description("Items taken off a queue and processed")
                .build(),
            dropped: meter
                .u64_counter("queue_items_dropped")
                .with_description("Items refused because the queue was full")
                .build(),
            slow: meter
                .u64_counter("queue_items_slow")
                .with_description("Items that waited too long before a worker picked them up")
                .build(),
        }
    }

    pub fn processed(&self) {
        self.processed.add(1, &self.attributes);
    }

    pub fn dropped(&self) {
        self.dropped.add(1, &self.attributes);
    }

    pub fn slow(&self) {
        self.slow.add(1, &self.attributes);
    }
}

#[derive(Debug, Clone)]
pub struct NodeMetrics {
    processing_ms: Histogram<f64>,
}

impl NodeMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            processing_ms: meter
                .f64_histogram("node_processing_ms")
                .with_description("Time a node spent handling one input")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn record(&self, node_type: &str, port: u32, elapsed: Duration) {
        self.processing_ms.record(
            elapsed.as_secs_f64() * 1_000.0,
            &[KeyValue::new("node_type", node_type.to_string()), KeyValue::new("port", i64::from(port))],
        );
    }
}
