#![forbid(unsafe_code)]
//! crashbuf-exec: the `CrashBuffer` orchestrator.
//!
//! One state machine and one ordered operation queue per context, retention
//! (throttled anchor-preserving prune, stale sweep), error-span notifications
//! and counters. Store failures are absorbed by `GuardedStore`.

pub mod buffer;
pub mod context;
pub mod error;
pub mod events;
pub mod guarded;
pub mod metrics;
pub mod retention;
mod snapshot;
mod worker;

pub use buffer::CrashBuffer;
pub use context::Phase;
pub use error::{BufferError, BufferResult};
pub use events::{BufferEvent, BufferEventKind, SubscriptionId};
pub use guarded::GuardedStore;
pub use metrics::{BufferMetrics, MetricsSnapshot};
pub use retention::{prune_older_than_with_anchor, PruneOutcome, RetentionPolicy};
