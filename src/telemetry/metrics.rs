//! Metric instruments for the relay.
//!
//! Built from the globally-registered `MeterProvider`. Without an OTLP
//! endpoint the global provider is a no-op and recording costs nothing.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("activity-relay")
}

/// Counter: subscriptions accepted.
/// Labels: `verbosity`.
pub fn subscriptions_opened() -> Counter<u64> {
    meter()
        .u64_counter("relay.subscriptions.opened")
        .with_description("Number of subscriptions opened")
        .build()
}

/// Counter: subscriptions closed.
/// Labels: `reason` (see `CloseReason::as_str`).
pub fn subscriptions_closed() -> Counter<u64> {
    meter()
        .u64_counter("relay.subscriptions.closed")
        .with_description("Number of subscriptions closed, by reason")
        .build()
}

/// Counter: activity events handed to a connection.
/// Labels: `source` ("status" | "output").
pub fn events_delivered() -> Counter<u64> {
    meter()
        .u64_counter("relay.events.delivered")
        .with_description("Number of activity events delivered")
        .build()
}

/// Counter: polls that failed with a transient store error.
pub fn poll_failures() -> Counter<u64> {
    meter()
        .u64_counter("relay.poll.failures")
        .with_description("Number of failed polls")
        .build()
}

/// Histogram: wall time of one poll.
pub fn poll_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("relay.poll.duration_ms")
        .with_description("Poll duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: reconnect attempts made by the client connector.
pub fn client_reconnects() -> Counter<u64> {
    meter()
        .u64_counter("relay.client.reconnects")
        .with_description("Number of client reconnect attempts")
        .build()
}
