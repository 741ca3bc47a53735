//! Append-only log store.
//!
//! One log file per context under `root`, named after the blake3 hash of the
//! context id. Writes append checksummed frames; reads go through an
//! in-memory `(ts, seq)` index that is rebuilt by replaying the files on open.

mod context;
pub mod frame;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crashbuf_core::hash::hash_str;
use crashbuf_core::{AttrsRecord, ContextId, EventRecord, RecordKind, SpanRecord};

use crate::error::{StoreError, StoreResult};
use crate::store::BufferStore;
use context::ContextLog;

const LOG_EXT: &str = "log";

type Shared = Arc<Mutex<ContextLog>>;

pub struct LogStore {
    root: PathBuf,
    compaction_min_bytes: u64,
    contexts: RwLock<HashMap<ContextId, Shared>>,
}

fn lock(log: &Shared) -> MutexGuard<'_, ContextLog> {
    log.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LogStore {
    /// Open (or create) a store rooted at `root` and replay every context log.
    ///
    /// Failing to create or list the root is `Unavailable`; a single
    /// unreadable log is skipped with a warning.
    pub fn open<P: AsRef<Path>>(root: P, compaction_min_bytes: u64) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", root.display())))?;
        let dir = fs::read_dir(&root)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", root.display())))?;

        let mut contexts = HashMap::new();
        for entry in dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXT) {
                continue;
            }
            match ContextLog::replay(path) {
                Ok(log) => {
                    contexts.insert(log.context_id().clone(), Arc::new(Mutex::new(log)));
                }
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_e, "ignoring unreadable context log");
                }
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(root = %root.display(), contexts = contexts.len(), "opened log store");

        Ok(Self {
            root,
            compaction_min_bytes,
            contexts: RwLock::new(contexts),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, ctx: &ContextId) -> PathBuf {
        self.root
            .join(format!("{}.{LOG_EXT}", hash_str(ctx.as_str()).short_hex(32)))
    }

    /// Contexts that currently have a log.
    pub fn contexts(&self) -> Vec<ContextId> {
        let map = self.contexts.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<ContextId> = map.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Frames skipped as corrupt when `ctx` was replayed (0 after compaction).
    pub fn skipped_frames(&self, ctx: &ContextId) -> u64 {
        self.get(ctx).map_or(0, |log| lock(&log).skipped_frames())
    }

    /// Rewrite a context log without dead frames. Returns false when the
    /// context has no log.
    pub fn compact(&self, ctx: &ContextId) -> StoreResult<bool> {
        match self.get(ctx) {
            Some(log) => lock(&log).compact().map(|_| true),
            None => Ok(false),
        }
    }

    fn get(&self, ctx: &ContextId) -> Option<Shared> {
        let map = self.contexts.read().unwrap_or_else(PoisonError::into_inner);
        map.get(ctx).cloned()
    }

    fn get_or_create(&self, ctx: &ContextId) -> StoreResult<Shared> {
        if let Some(log) = self.get(ctx) {
            return Ok(log);
        }
        let mut map = self.contexts.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(log) = map.get(ctx) {
            return Ok(log.clone());
        }
        let log = Arc::new(Mutex::new(ContextLog::create(
            self.path_for(ctx),
            ctx.clone(),
        )?));
        map.insert(ctx.clone(), log.clone());
        Ok(log)
    }

    fn maybe_compact(&self, log: &mut ContextLog) {
        if !log.needs_compaction(self.compaction_min_bytes) {
            return;
        }
        if let Err(_e) = log.compact() {
            #[cfg(feature = "tracing")]
            tracing::warn!(context = %log.context_id(), error = %_e, "log compaction failed");
        }
    }
}

impl BufferStore for LogStore {
    fn append_event(&self, record: &EventRecord) -> StoreResult<()> {
        let log = self.get_or_create(&record.context_id)?;
        let mut log = lock(&log);
        log.append_event(record)
    }

    /// Each run of same-context spans is one write, kept or lost whole.
    fn append_spans(&self, records: &[SpanRecord]) -> StoreResult<()> {
        let mut rest = records;
        while let Some(first) = rest.first() {
            let run = rest
                .iter()
                .take_while(|r| r.context_id == first.context_id)
                .count();
            let log = self.get_or_create(&first.context_id)?;
            lock(&log).append_spans(&rest[..run])?;
            rest = &rest[run..];
        }
        Ok(())
    }

    fn range_events(
        &self,
        ctx: &ContextId,
        from_ts: u64,
        to_ts: u64,
    ) -> StoreResult<Vec<EventRecord>> {
        Ok(self
            .get(ctx)
            .map(|log| lock(&log).range_events(from_ts, to_ts))
            .unwrap_or_default())
    }

    fn range_spans(
        &self,
        ctx: &ContextId,
        from_ts: u64,
        to_ts: u64,
    ) -> StoreResult<Vec<SpanRecord>> {
        Ok(self
            .get(ctx)
            .map(|log| lock(&log).range_spans(from_ts, to_ts))
            .unwrap_or_default())
    }

    fn last_full_snapshot_at_or_before(
        &self,
        ctx: &ContextId,
        ts: u64,
    ) -> StoreResult<Option<EventRecord>> {
        Ok(self
            .get(ctx)
            .and_then(|log| lock(&log).last_full_snapshot_at_or_before(ts)))
    }

    fn delete_range(
        &self,
        ctx: &ContextId,
        kind: RecordKind,
        from_ts: u64,
        to_ts: u64,
    ) -> StoreResult<u64> {
        let Some(log) = self.get(ctx) else {
            return Ok(0);
        };
        let mut log = lock(&log);
        let removed = log.delete_range(kind, from_ts, to_ts)?;
        self.maybe_compact(&mut log);
        Ok(removed)
    }

    fn delete_all(&self, ctx: &ContextId) -> StoreResult<()> {
        let removed = {
            let mut map = self.contexts.write().unwrap_or_else(PoisonError::into_inner);
            map.remove(ctx)
        };
        let path = match removed {
            Some(log) => lock(&log).path().to_path_buf(),
            None => self.path_for(ctx),
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Write(format!("delete {}: {e}", path.display()))),
        }
    }

    fn set_attrs(&self, record: &AttrsRecord) -> StoreResult<()> {
        let log = self.get_or_create(&record.context_id)?;
        let mut log = lock(&log);
        log.set_attrs(record)?;
        self.maybe_compact(&mut log);
        Ok(())
    }

    fn get_attrs(&self, ctx: &ContextId) -> StoreResult<Option<AttrsRecord>> {
        Ok(self.get(ctx).and_then(|log| lock(&log).attrs().cloned()))
    }

    fn list_attrs(&self) -> StoreResult<Vec<AttrsRecord>> {
        let logs: Vec<Shared> = {
            let map = self.contexts.read().unwrap_or_else(PoisonError::into_inner);
            map.values().cloned().collect()
        };
        let mut out: Vec<AttrsRecord> = logs
            .iter()
            .filter_map(|log| lock(log).attrs().cloned())
            .collect();
        out.sort_by(|a, b| a.context_id.cmp(&b.context_id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn temp_root(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("crashbuf-log-tests-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn ev(ctx: &ContextId, ts: u64, full: bool) -> EventRecord {
        EventRecord {
            context_id: ctx.clone(),
            ts,
            is_full_snapshot: full,
            payload: json!({ "n": ts }),
        }
    }

    #[test]
    fn survives_reopen() {
        let root = temp_root("reopen");
        let ctx = ContextId::new("tab-1");
        {
            let store = LogStore::open(&root, 1 << 20).unwrap();
            store.append_event(&ev(&ctx, 100, true)).unwrap();
            store.append_event(&ev(&ctx, 150, false)).unwrap();
            store.touch(&ctx, 160).unwrap();
            store.delete_range(&ctx, RecordKind::Event, 0, 120).unwrap();
        }
        let store = LogStore::open(&root, 1 << 20).unwrap();
        let events = store.range_events(&ctx, 0, u64::MAX).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].ts, 150);
        assert_eq!(store.get_attrs(&ctx).unwrap().unwrap().updated_at, 160);
        assert_eq!(store.contexts(), vec![ctx]);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn corrupt_frame_is_skipped_on_replay() {
        let root = temp_root("corrupt");
        let ctx = ContextId::new("tab-2");
        {
            let store = LogStore::open(&root, 1 << 20).unwrap();
            store.append_event(&ev(&ctx, 1, true)).unwrap();
        }
        let path = LogStore::open(&root, 1 << 20).unwrap().path_for(&ctx);
        {
            let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b"0123456789abcdef {\"op\":\"event\"}\n").unwrap();
            f.write_all(b"torn half-frame").unwrap();
        }

        let store = LogStore::open(&root, 1 << 20).unwrap();
        assert_eq!(store.skipped_frames(&ctx), 2);
        store.append_event(&ev(&ctx, 2, false)).unwrap();

        let reopened = LogStore::open(&root, 1 << 20).unwrap();
        let ts: Vec<u64> = reopened
            .range_events(&ctx, 0, 10)
            .unwrap()
            .iter()
            .map(|e| e.ts)
            .collect();
        assert_eq!(ts, vec![1, 2]);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn compaction_drops_dead_frames() {
        let root = temp_root("compact");
        let ctx = ContextId::new("tab-3");
        let store = LogStore::open(&root, 0).unwrap();
        for ts in 0..50 {
            store.append_event(&ev(&ctx, ts, ts % 10 == 0)).unwrap();
        }
        let before = fs::metadata(store.path_for(&ctx)).unwrap().len();
        // Dead bytes exceed live bytes here, so the delete triggers compaction.
        assert_eq!(store.delete_range(&ctx, RecordKind::Event, 0, 40).unwrap(), 40);
        let after = fs::metadata(store.path_for(&ctx)).unwrap().len();
        assert!(after < before / 2);

        let anchor = store.last_full_snapshot_at_or_before(&ctx, 100).unwrap();
        assert_eq!(anchor.map(|e| e.ts), Some(40));
        assert_eq!(store.range_events(&ctx, 0, 100).unwrap().len(), 10);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn delete_all_removes_file() {
        let root = temp_root("delete-all");
        let ctx = ContextId::new("tab-4");
        let store = LogStore::open(&root, 1 << 20).unwrap();
        store.append_event(&ev(&ctx, 1, true)).unwrap();
        let path = store.path_for(&ctx);
        assert!(path.exists());
        store.delete_all(&ctx).unwrap();
        assert!(!path.exists());
        assert!(store.range_events(&ctx, 0, 10).unwrap().is_empty());
        store.delete_all(&ctx).unwrap();
        let _ = fs::remove_dir_all(&root);
    }
}
