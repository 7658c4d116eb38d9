//! Lock span helpers.

use tracing::Span;

use crate::key::LockKey;

/// Start a span covering one guarded invocation.
///
/// `lock.outcome` is declared empty and filled by [`record_outcome`].
pub fn start_lock_span(job: &str, key: &LockKey) -> Span {
    tracing::info_span!(
        "lock.perform",
        "lock.job" = job,
        "lock.key" = %key,
        "lock.outcome" = tracing::field::Empty,
    )
}

/// Record how the invocation ended ("ran", "locked", "failed", ...).
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("lock.outcome", outcome);
}
