//! Buffered records and the snapshot returned to crash reporters.
//!
//! Payloads are opaque JSON. The buffer only ever inspects two things:
//! `is_full_snapshot` on replay events and `status` on spans.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::ContextId;

/// Which table a range operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Event,
    Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error,
}

impl SpanStatus {
    pub fn is_error(self) -> bool {
        matches!(self, SpanStatus::Error)
    }
}

/// A replay event as delivered by the replay producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub ts: u64,
    pub is_full_snapshot: bool,
    pub raw: Value,
}

impl EventPayload {
    pub fn full(ts: u64, raw: Value) -> Self {
        Self {
            ts,
            is_full_snapshot: true,
            raw,
        }
    }

    pub fn incremental(ts: u64, raw: Value) -> Self {
        Self {
            ts,
            is_full_snapshot: false,
            raw,
        }
    }

    pub fn into_record(self, context_id: ContextId) -> EventRecord {
        EventRecord {
            context_id,
            ts: self.ts,
            is_full_snapshot: self.is_full_snapshot,
            payload: self.raw,
        }
    }
}

/// A completed span as delivered by the trace producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanPayload {
    pub ts: u64,
    #[serde(default)]
    pub status: SpanStatus,
    pub raw: Value,
}

impl SpanPayload {
    pub fn new(ts: u64, status: SpanStatus, raw: Value) -> Self {
        Self { ts, status, raw }
    }

    pub fn into_record(self, context_id: ContextId) -> SpanRecord {
        SpanRecord {
            context_id,
            ts: self.ts,
            status: self.status,
            span: self.raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub context_id: ContextId,
    pub ts: u64,
    pub is_full_snapshot: bool,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub context_id: ContextId,
    pub ts: u64,
    #[serde(default)]
    pub status: SpanStatus,
    pub span: Value,
}

/// Per-context attributes; one record per context, always overwritten.
///
/// `updated_at` doubles as the liveness heartbeat read by the stale sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrsRecord {
    pub context_id: ContextId,
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_attributes: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_attributes: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_attributes: Option<Value>,
}

impl AttrsRecord {
    /// Heartbeat-only record, created by `touch` on a context without attrs.
    pub fn empty(context_id: ContextId, updated_at: u64) -> Self {
        Self {
            context_id,
            updated_at,
            session_attributes: None,
            resource_attributes: None,
            user_attributes: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrsUpdate {
    pub session_attributes: Option<Value>,
    pub resource_attributes: Option<Value>,
    pub user_attributes: Option<Value>,
}

impl AttrsUpdate {
    pub fn into_record(self, context_id: ContextId, updated_at: u64) -> AttrsRecord {
        AttrsRecord {
            context_id,
            updated_at,
            session_attributes: self.session_attributes,
            resource_attributes: self.resource_attributes,
            user_attributes: self.user_attributes,
        }
    }
}

/// Replayable reconstruction of the trailing window of one context.
///
/// `events` is empty or starts with a full snapshot; every span is at or
/// after the first event (or after `from_ts` when there are no events).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub events: Vec<EventRecord>,
    pub spans: Vec<SpanRecord>,
    pub attrs: Option<AttrsRecord>,
    pub window_ms: u64,
    pub from_ts: u64,
    pub to_ts: u64,
}

impl Snapshot {
    pub fn empty(window_ms: u64, from_ts: u64, to_ts: u64) -> Self {
        Self {
            events: Vec::new(),
            spans: Vec::new(),
            attrs: None,
            window_ms,
            from_ts,
            to_ts,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.spans.is_empty()
    }

    pub fn starts_with_full_snapshot(&self) -> bool {
        self.events.first().map_or(true, |e| e.is_full_snapshot)
    }
}
