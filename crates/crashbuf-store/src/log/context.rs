//! One context's append-only log plus its in-memory timestamp index.
//!
//! The index maps `(ts, seq)` to the byte range of the frame holding the
//! record, so range scans seek straight to the frames they need. Deletions
//! append a `Delete` tombstone and drop index entries; the bytes they leave
//! behind are reclaimed by `compact`.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crashbuf_core::{AttrsRecord, ContextId, EventRecord, RecordKind, SpanRecord};

use super::frame::{self, LogEntry, FORMAT_VERSION};
use crate::error::{StoreError, StoreResult};

type Key = (u64, u64);

#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: u64,
    len: u64,
    is_full_snapshot: bool,
}

pub(crate) struct ContextLog {
    context_id: ContextId,
    path: PathBuf,
    file: File,
    end: u64,
    /// Last write may have left a partial line; the next frame starts on a fresh one.
    torn: bool,
    events: BTreeMap<Key, Slot>,
    spans: BTreeMap<Key, Slot>,
    attrs: Option<(AttrsRecord, u64)>,
    next_seq: u64,
    live_bytes: u64,
    dead_bytes: u64,
    skipped_frames: u64,
}

fn open_rw(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
}

impl ContextLog {
    /// Start a new log containing only the header frame.
    pub fn create(path: PathBuf, context_id: ContextId) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::Write(format!("mkparent: {e}")))?;
        }
        let mut file = open_rw(&path).map_err(|e| StoreError::Write(format!("create: {e}")))?;
        let header = frame::encode(&LogEntry::Header {
            context_id: context_id.clone(),
            version: FORMAT_VERSION,
        })?;
        file.write_all(&header)
            .map_err(|e| StoreError::Write(format!("header: {e}")))?;

        Ok(Self {
            context_id,
            path,
            file,
            end: header.len() as u64,
            torn: false,
            events: BTreeMap::new(),
            spans: BTreeMap::new(),
            attrs: None,
            next_seq: 0,
            live_bytes: 0,
            dead_bytes: 0,
            skipped_frames: 0,
        })
    }

    /// Rebuild the index by scanning an existing log. Frames that fail their
    /// checksum are skipped and counted as dead bytes.
    pub fn replay(path: PathBuf) -> StoreResult<Self> {
        let file = open_rw(&path).map_err(|e| StoreError::Read(format!("open: {e}")))?;

        let mut entries = Vec::new();
        let mut skipped = Vec::new();
        let mut offset = 0u64;
        let mut torn = false;
        {
            let mut reader = BufReader::new(&file);
            let mut line = Vec::new();
            loop {
                line.clear();
                let n = reader
                    .read_until(b'\n', &mut line)
                    .map_err(|e| StoreError::Read(format!("scan: {e}")))?;
                if n == 0 {
                    break;
                }
                torn = line.last() != Some(&b'\n');
                match frame::decode(&line) {
                    Ok(entry) => entries.push((entry, offset, n as u64)),
                    Err(_) => skipped.push(n as u64),
                }
                offset += n as u64;
            }
        }

        let context_id = entries
            .iter()
            .find_map(|(entry, _, _)| match entry {
                LogEntry::Header { context_id, .. } => Some(context_id.clone()),
                LogEntry::Event { record } => Some(record.context_id.clone()),
                LogEntry::Span { record } => Some(record.context_id.clone()),
                LogEntry::Attrs { record } => Some(record.context_id.clone()),
                LogEntry::Delete { .. } => None,
            })
            .ok_or_else(|| {
                StoreError::Corrupt(format!("{}: no context id in log", path.display()))
            })?;

        let mut log = Self {
            context_id,
            path,
            file,
            end: offset,
            torn,
            events: BTreeMap::new(),
            spans: BTreeMap::new(),
            attrs: None,
            next_seq: 0,
            live_bytes: 0,
            dead_bytes: skipped.iter().sum(),
            skipped_frames: skipped.len() as u64,
        };
        for (entry, offset, len) in entries {
            log.apply(entry, offset, len);
        }

        #[cfg(feature = "tracing")]
        {
            if log.skipped_frames > 0 {
                tracing::warn!(
                    context = %log.context_id,
                    skipped = log.skipped_frames,
                    "skipped corrupt frames while replaying log"
                );
            }
        }

        Ok(log)
    }

    pub fn context_id(&self) -> &ContextId {
        &self.context_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn skipped_frames(&self) -> u64 {
        self.skipped_frames
    }

    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn apply(&mut self, entry: LogEntry, offset: u64, len: u64) {
        match entry {
            LogEntry::Header { .. } => {}
            LogEntry::Event { record } => {
                let key = (record.ts, self.seq());
                self.events.insert(
                    key,
                    Slot {
                        offset,
                        len,
                        is_full_snapshot: record.is_full_snapshot,
                    },
                );
                self.live_bytes += len;
            }
            LogEntry::Span { record } => {
                let key = (record.ts, self.seq());
                self.spans.insert(
                    key,
                    Slot {
                        offset,
                        len,
                        is_full_snapshot: false,
                    },
                );
                self.live_bytes += len;
            }
            LogEntry::Attrs { record } => {
                if let Some((_, old)) = self.attrs.take() {
                    self.live_bytes -= old;
                    self.dead_bytes += old;
                }
                self.attrs = Some((record, len));
                self.live_bytes += len;
            }
            LogEntry::Delete { kind, from_ts, to_ts } => {
                let freed = self.unindex(kind, from_ts, to_ts).1;
                self.live_bytes -= freed;
                self.dead_bytes += freed + len;
            }
        }
    }

    /// Remove index entries in `[from_ts, to_ts)`; returns (count, bytes).
    fn unindex(&mut self, kind: RecordKind, from_ts: u64, to_ts: u64) -> (u64, u64) {
        if from_ts >= to_ts {
            return (0, 0);
        }
        let map = match kind {
            RecordKind::Event => &mut self.events,
            RecordKind::Span => &mut self.spans,
        };
        let keys: Vec<Key> = map.range((from_ts, 0)..(to_ts, 0)).map(|(k, _)| *k).collect();
        let mut bytes = 0;
        for k in &keys {
            if let Some(slot) = map.remove(k) {
                bytes += slot.len;
            }
        }
        (keys.len() as u64, bytes)
    }

    fn write_frame(&mut self, entry: &LogEntry) -> StoreResult<(u64, u64)> {
        let mut slots = self.write_frames(std::slice::from_ref(entry))?;
        slots
            .pop()
            .ok_or_else(|| StoreError::Write("empty frame batch".into()))
    }

    /// Append frames with a single write; returns `(offset, len)` per frame.
    /// A failed write is truncated away, so either every frame lands or none.
    fn write_frames(&mut self, entries: &[LogEntry]) -> StoreResult<Vec<(u64, u64)>> {
        let mut bytes = Vec::new();
        if self.torn {
            bytes.push(b'\n');
        }
        let mut slots = Vec::with_capacity(entries.len());
        for entry in entries {
            let frame = frame::encode(entry)?;
            slots.push((self.end + bytes.len() as u64, frame.len() as u64));
            bytes.extend_from_slice(&frame);
        }

        if let Err(e) = self.file.write_all(&bytes) {
            self.rollback();
            return Err(StoreError::Write(format!("append: {e}")));
        }
        self.end += bytes.len() as u64;
        self.torn = false;
        Ok(slots)
    }

    /// Drop whatever part of a failed write reached the file.
    fn rollback(&mut self) {
        if self.file.set_len(self.end).is_ok() {
            return;
        }
        // Resync with what actually reached the file.
        if let Ok(meta) = self.file.metadata() {
            self.end = meta.len();
        }
        self.torn = true;
    }

    fn read_raw(&self, slot: &Slot) -> StoreResult<Vec<u8>> {
        let mut f = &self.file;
        f.seek(SeekFrom::Start(slot.offset))
            .map_err(|e| StoreError::Read(format!("seek: {e}")))?;
        let mut buf = vec![0u8; slot.len as usize];
        f.read_exact(&mut buf)
            .map_err(|e| StoreError::Read(format!("read: {e}")))?;
        Ok(buf)
    }

    fn read_entry(&self, slot: &Slot) -> StoreResult<LogEntry> {
        frame::decode(&self.read_raw(slot)?)
    }

    pub fn append_event(&mut self, record: &EventRecord) -> StoreResult<()> {
        let entry = LogEntry::Event {
            record: record.clone(),
        };
        let (offset, len) = self.write_frame(&entry)?;
        self.apply(entry, offset, len);
        Ok(())
    }

    /// All or nothing: the batch is written as one contiguous append.
    pub fn append_spans(&mut self, records: &[SpanRecord]) -> StoreResult<()> {
        let entries: Vec<LogEntry> = records
            .iter()
            .map(|record| LogEntry::Span {
                record: record.clone(),
            })
            .collect();
        let slots = self.write_frames(&entries)?;
        for (entry, (offset, len)) in entries.into_iter().zip(slots) {
            self.apply(entry, offset, len);
        }
        Ok(())
    }

    pub fn set_attrs(&mut self, record: &AttrsRecord) -> StoreResult<()> {
        let entry = LogEntry::Attrs {
            record: record.clone(),
        };
        let (offset, len) = self.write_frame(&entry)?;
        self.apply(entry, offset, len);
        Ok(())
    }

    pub fn attrs(&self) -> Option<&AttrsRecord> {
        self.attrs.as_ref().map(|(a, _)| a)
    }

    pub fn range_events(&self, from_ts: u64, to_ts: u64) -> Vec<EventRecord> {
        if from_ts > to_ts {
            return Vec::new();
        }
        self.events
            .range((from_ts, 0)..=(to_ts, u64::MAX))
            .filter_map(|(_, slot)| match self.read_entry(slot) {
                Ok(LogEntry::Event { record }) => Some(record),
                other => {
                    self.note_bad_slot(other.err());
                    None
                }
            })
            .collect()
    }

    pub fn range_spans(&self, from_ts: u64, to_ts: u64) -> Vec<SpanRecord> {
        if from_ts > to_ts {
            return Vec::new();
        }
        self.spans
            .range((from_ts, 0)..=(to_ts, u64::MAX))
            .filter_map(|(_, slot)| match self.read_entry(slot) {
                Ok(LogEntry::Span { record }) => Some(record),
                other => {
                    self.note_bad_slot(other.err());
                    None
                }
            })
            .collect()
    }

    /// Walks back through full-snapshot slots until one decodes.
    pub fn last_full_snapshot_at_or_before(&self, ts: u64) -> Option<EventRecord> {
        self.events
            .range(..=(ts, u64::MAX))
            .rev()
            .filter(|(_, slot)| slot.is_full_snapshot)
            .find_map(|(_, slot)| match self.read_entry(slot) {
                Ok(LogEntry::Event { record }) => Some(record),
                other => {
                    self.note_bad_slot(other.err());
                    None
                }
            })
    }

    fn note_bad_slot(&self, _err: Option<StoreError>) {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            context = %self.context_id,
            error = ?_err,
            "skipping unreadable log frame"
        );
    }

    pub fn delete_range(&mut self, kind: RecordKind, from_ts: u64, to_ts: u64) -> StoreResult<u64> {
        if from_ts >= to_ts {
            return Ok(0);
        }
        let map = match kind {
            RecordKind::Event => &self.events,
            RecordKind::Span => &self.spans,
        };
        if map.range((from_ts, 0)..(to_ts, 0)).next().is_none() {
            return Ok(0);
        }
        let entry = LogEntry::Delete {
            kind,
            from_ts,
            to_ts,
        };
        let (_, len) = self.write_frame(&entry)?;
        let (count, freed) = self.unindex(kind, from_ts, to_ts);
        self.live_bytes -= freed;
        self.dead_bytes += freed + len;
        Ok(count)
    }

    pub fn needs_compaction(&self, min_dead_bytes: u64) -> bool {
        self.dead_bytes >= min_dead_bytes && self.dead_bytes > self.live_bytes
    }

    /// Rewrite the log with only live frames. On failure the old log stays
    /// authoritative and the index is untouched.
    pub fn compact(&mut self) -> StoreResult<()> {
        let tmp = self.path.with_extension("log.tmp");
        let result = self.write_compacted(&tmp);
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        let (file, end, events, spans, attrs_len) = result?;

        if let Err(e) = fs::rename(&tmp, &self.path) {
            drop(file);
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::Write(format!("rename: {e}")));
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            context = %self.context_id,
            reclaimed = self.dead_bytes,
            "compacted context log"
        );

        self.file = file;
        self.end = end;
        self.torn = false;
        self.events = events;
        self.spans = spans;
        if let (Some((_, len)), Some(new_len)) = (self.attrs.as_mut(), attrs_len) {
            *len = new_len;
        }
        self.dead_bytes = 0;
        self.skipped_frames = 0;
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn write_compacted(
        &self,
        tmp: &Path,
    ) -> StoreResult<(File, u64, BTreeMap<Key, Slot>, BTreeMap<Key, Slot>, Option<u64>)> {
        let out = File::create(tmp).map_err(|e| StoreError::Write(format!("create: {e}")))?;
        let mut out = BufWriter::new(out);
        let mut pos = 0u64;
        let mut put = |out: &mut BufWriter<File>, bytes: &[u8]| -> StoreResult<u64> {
            out.write_all(bytes)
                .map_err(|e| StoreError::Write(format!("compact: {e}")))?;
            let at = pos;
            pos += bytes.len() as u64;
            Ok(at)
        };

        let header = frame::encode(&LogEntry::Header {
            context_id: self.context_id.clone(),
            version: FORMAT_VERSION,
        })?;
        put(&mut out, &header)?;

        let mut events = BTreeMap::new();
        for (key, slot) in &self.events {
            let offset = put(&mut out, &self.read_raw(slot)?)?;
            events.insert(*key, Slot { offset, ..*slot });
        }
        let mut spans = BTreeMap::new();
        for (key, slot) in &self.spans {
            let offset = put(&mut out, &self.read_raw(slot)?)?;
            spans.insert(*key, Slot { offset, ..*slot });
        }
        let mut attrs_len = None;
        if let Some((record, _)) = &self.attrs {
            let bytes = frame::encode(&LogEntry::Attrs {
                record: record.clone(),
            })?;
            put(&mut out, &bytes)?;
            attrs_len = Some(bytes.len() as u64);
        }

        out.flush()
            .map_err(|e| StoreError::Write(format!("flush: {e}")))?;
        drop(out);

        // Open before the rename so the handle follows the new file.
        let file = open_rw(tmp).map_err(|e| StoreError::Write(format!("reopen: {e}")))?;
        Ok((file, pos, events, spans, attrs_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crashbuf_core::SpanStatus;
    use serde_json::json;

    fn span(ctx: &ContextId, ts: u64) -> SpanRecord {
        SpanRecord {
            context_id: ctx.clone(),
            ts,
            status: SpanStatus::Ok,
            span: json!({ "n": ts }),
        }
    }

    fn span_ts(log: &ContextLog) -> Vec<u64> {
        log.range_spans(0, u64::MAX).iter().map(|s| s.ts).collect()
    }

    #[test]
    fn failed_span_batch_leaves_nothing() {
        let mut dir = std::env::temp_dir();
        dir.push(format!("crashbuf-context-log-batch-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let path = dir.join("ctx.log");
        let ctx = ContextId::new("ctx");

        let mut log = ContextLog::create(path.clone(), ctx.clone()).unwrap();
        log.append_spans(&[span(&ctx, 1)]).unwrap();

        // A read-only handle makes the next append fail.
        let writable = std::mem::replace(&mut log.file, File::open(&path).unwrap());
        assert!(log.append_spans(&[span(&ctx, 2), span(&ctx, 3)]).is_err());
        assert_eq!(span_ts(&log), vec![1]);

        log.file = writable;
        log.append_spans(&[span(&ctx, 4), span(&ctx, 5)]).unwrap();
        assert_eq!(span_ts(&log), vec![1, 4, 5]);
        drop(log);

        let replayed = ContextLog::replay(path).unwrap();
        assert_eq!(span_ts(&replayed), vec![1, 4, 5]);
        let _ = fs::remove_dir_all(&dir);
    }
}
