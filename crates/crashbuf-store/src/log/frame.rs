//! Log frame encoding.
//!
//! Layout of one frame (one line):
//! [ sum: 16 hex chars ][ ' ' ][ entry JSON ][ '\n' ]
//!
//! `sum` is the truncated blake3 of the entry JSON. A torn or edited line fails
//! the check and is skipped on replay instead of poisoning the whole log.

use serde::{Deserialize, Serialize};

use crashbuf_core::hash::hash_bytes;
use crashbuf_core::{AttrsRecord, ContextId, EventRecord, RecordKind, SpanRecord};

use crate::error::{StoreError, StoreResult};

pub const FORMAT_VERSION: u16 = 1;
pub const SUM_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogEntry {
    Header { context_id: ContextId, version: u16 },
    Event { record: EventRecord },
    Span { record: SpanRecord },
    Attrs { record: AttrsRecord },
    Delete { kind: RecordKind, from_ts: u64, to_ts: u64 },
}

pub fn encode(entry: &LogEntry) -> StoreResult<Vec<u8>> {
    let json = serde_json::to_vec(entry).map_err(|e| StoreError::Write(format!("encode: {e}")))?;
    let sum = hash_bytes(&json).short_hex(SUM_LEN);

    let mut out = Vec::with_capacity(SUM_LEN + json.len() + 2);
    out.extend_from_slice(sum.as_bytes());
    out.push(b' ');
    out.extend_from_slice(&json);
    out.push(b'\n');
    Ok(out)
}

pub fn decode(line: &[u8]) -> StoreResult<LogEntry> {
    let line = match line.last() {
        Some(b'\n') => &line[..line.len() - 1],
        _ => line,
    };
    if line.len() <= SUM_LEN + 1 || line[SUM_LEN] != b' ' {
        return Err(StoreError::Corrupt("short frame".into()));
    }
    let (sum, json) = (&line[..SUM_LEN], &line[SUM_LEN + 1..]);
    if hash_bytes(json).short_hex(SUM_LEN).as_bytes() != sum {
        return Err(StoreError::Corrupt("checksum mismatch".into()));
    }
    serde_json::from_slice(json).map_err(|e| StoreError::Corrupt(format!("decode: {e}")))
}
