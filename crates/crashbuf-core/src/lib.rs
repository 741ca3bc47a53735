#![forbid(unsafe_code)]
//! crashbuf-core: records, ids, snapshot type, clock and configuration.
//!
//! Everything here is plain data plus a couple of pure helpers. Storage lives
//! in `crashbuf-store`, orchestration and retention in `crashbuf-exec`.

pub mod clock;
pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod record;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BufferConfig, StoreConfig};
pub use error::{Error, Result};
pub use id::ContextId;
pub use record::{
    AttrsRecord, AttrsUpdate, EventPayload, EventRecord, RecordKind, Snapshot, SpanPayload,
    SpanRecord, SpanStatus,
};
