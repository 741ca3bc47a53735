//! Buffer notifications and their subscribers.
//!
//! Handlers run synchronously on the thread that appended the batch. A handler
//! that panics is logged and skipped; the panic never reaches the producer.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crashbuf_core::ContextId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferEventKind {
    ErrorSpanAppended,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BufferEvent {
    /// First error-status span of an `append_spans` batch.
    ErrorSpanAppended {
        context_id: ContextId,
        ts: u64,
        span: Value,
    },
}

impl BufferEvent {
    pub fn kind(&self) -> BufferEventKind {
        match self {
            BufferEvent::ErrorSpanAppended { .. } => BufferEventKind::ErrorSpanAppended,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&BufferEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Emitter {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(SubscriptionId, BufferEventKind, Handler)>>,
}

impl Emitter {
    pub(crate) fn on<F>(&self, kind: BufferEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&BufferEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, kind, Arc::new(handler)));
        id
    }

    pub(crate) fn off(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(sub, _, _)| *sub != id);
        handlers.len() != before
    }

    pub(crate) fn emit(&self, event: &BufferEvent) {
        // Handlers may subscribe or unsubscribe; call them outside the lock.
        let matching: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, kind, _)| *kind == event.kind())
            .map(|(_, _, h)| h.clone())
            .collect();

        for handler in matching {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                #[cfg(feature = "tracing")]
                tracing::warn!(kind = ?event.kind(), "buffer event handler panicked");
            }
        }
    }
}
