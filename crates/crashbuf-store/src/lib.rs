#![forbid(unsafe_code)]
//! crashbuf-store: the `BufferStore` abstraction and its backends.
//!
//! - `MemoryStore`: range-queryable indexed store (per-context BTreeMaps).
//! - `LogStore`: append-only per-context log with an in-memory timestamp index.
//!
//! Both satisfy the same contract; `build_store_from_config` picks one from a
//! store URI. Errors are returned as `StoreError` and converted into no-op /
//! empty results by the orchestrator, never surfaced to producers.

pub mod error;
pub mod log;
pub mod memory_store;
pub mod storage;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use log::LogStore;
pub use memory_store::MemoryStore;
pub use storage::build_store_from_config;
pub use store::BufferStore;
