//! Store selection from a `StoreConfig`.
//!
//! `memory://` picks the in-memory store; `file://<path>`, a bare path or no
//! URI at all picks the log store rooted at `cfg.root`.

use std::sync::Arc;

use crashbuf_core::StoreConfig;

use crate::error::{StoreError, StoreResult};
use crate::log::LogStore;
use crate::memory_store::MemoryStore;
use crate::store::BufferStore;

/// Build the store backend named by the configured URI.
pub fn build_store_from_config(cfg: &StoreConfig) -> StoreResult<Arc<dyn BufferStore>> {
    match cfg.scheme() {
        Some("memory") | Some("mem") => Ok(Arc::new(MemoryStore::new())),
        Some("file") | None => {
            if cfg.root.trim().is_empty() {
                return Err(StoreError::Config("log store needs a root directory".into()));
            }
            let store = LogStore::open(&cfg.root, cfg.compaction_min_bytes)?;
            Ok(Arc::new(store))
        }
        Some(other) => Err(StoreError::Config(format!(
            "unsupported store scheme '{other}'"
        ))),
    }
}
