//! Metric instrument factories.
//!
//! Instruments come from the `"workq-lock"` meter on the globally registered
//! `MeterProvider`; without one they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workq-lock")
}

/// Counter: lock acquisition attempts.
/// Labels: `job`, `result` ("acquired" | "contended" | "error").
pub fn lock_acquire() -> Counter<u64> {
    meter()
        .u64_counter("workq_lock.acquire")
        .with_description("Lock acquisition attempts")
        .build()
}

/// Counter: lock releases.
/// Labels: `job`, `result` ("ok" | "error" | "deferred").
///
/// "error" means a lock record may be stuck and needs an operator.
pub fn lock_release() -> Counter<u64> {
    meter()
        .u64_counter("workq_lock.release")
        .with_description("Lock releases")
        .build()
}

/// Histogram: time between acquire and release, in milliseconds.
/// Labels: `job`.
pub fn lock_hold_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workq_lock.hold_duration_ms")
        .with_description("Time a job lock was held")
        .with_unit("ms")
        .build()
}

/// Counter: jobs handled by the worker.
/// Labels: `job`, `outcome` ("ran" | "locked" | "failed" | "stuck" | "invalid_key" |
/// "unroutable" | "error").
pub fn jobs_processed() -> Counter<u64> {
    meter()
        .u64_counter("workq_lock.jobs")
        .with_description("Jobs handled by the worker")
        .build()
}

/// Counter: queue-level operations (create, send, read, archive).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("workq_lock.queue.operations")
        .with_description("Number of queue operations")
        .build()
}
