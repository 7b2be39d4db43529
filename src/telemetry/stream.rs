//! Subscription span helpers.

use tracing::Span;

use crate::model::{ProjectId, Verbosity};

/// Start the span that covers one subscription from open to close.
///
/// `stream.close_reason` starts empty and is filled by [`record_close`].
pub fn start_subscription_span(project: &ProjectId, verbosity: Verbosity) -> Span {
    tracing::info_span!(
        "stream.subscription",
        "stream.project" = %project,
        "stream.verbosity" = verbosity.as_str(),
        "stream.close_reason" = tracing::field::Empty,
    )
}

/// Record why a subscription ended, on its span and as an event.
pub fn record_close(span: &Span, reason: &str) {
    span.record("stream.close_reason", reason);
    span.in_scope(|| {
        tracing::info!(reason, "subscription closed");
    });
}
