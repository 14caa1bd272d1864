//! BusLens bulk mutation engine
//!
//! Purge, selective delete, resend and dead-letter resubmit over a pooled
//! broker client. Operations are cancellable between batches and report
//! partial completion instead of failing.

pub mod batching;
pub mod engine;

pub use engine::BulkEngine;
