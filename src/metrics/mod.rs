//! Prometheus metrics for the declarative reconciliation engine
//!
//! Engine-level counters (object operations, purges, readiness timeouts) are
//! recorded by the engine itself; per-owner counters by the controllers.

mod prometheus;

pub use prometheus::*;
