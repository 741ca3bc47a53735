//! crashbuf: rolling-window crash buffer for session replay.
//!
//! Keeps the last few seconds of replay events and trace spans per context so
//! a crash reporter can ship a replayable reconstruction of what just
//! happened. See `crashbuf_exec::CrashBuffer` for the entry point.

pub use crashbuf_core;
pub use crashbuf_exec;
pub use crashbuf_store;

pub use crashbuf_core::{
    AttrsRecord, AttrsUpdate, BufferConfig, Clock, ContextId, EventPayload, EventRecord,
    ManualClock, RecordKind, Snapshot, SpanPayload, SpanRecord, SpanStatus, SystemClock,
};
pub use crashbuf_exec::{
    BufferError, BufferEvent, BufferEventKind, CrashBuffer, MetricsSnapshot, Phase,
    SubscriptionId,
};
pub use crashbuf_store::{build_store_from_config, BufferStore, LogStore, MemoryStore, StoreError};
