//! Synchronous event fan-out (spec.md §4.6).
//!
//! Every domain event is appended to the durable store first, then handed
//! to each registered handler in registration order. A handler error is
//! logged and collected, never allowed to unwind past the emitter - one
//! broken subscriber must not stop the ledger/orchestrator call that raised
//! the event, matching spec.md's "emission is best-effort fan-out, event
//! durability is not" framing.

use tracing::error;

use crate::error::PspResult;
use crate::ids::{CausationId, CorrelationId, TenantId};

use super::store::EventStore;
use super::types::{DomainEvent, EventPayload};

pub type EventHandler = Box<dyn Fn(&DomainEvent) + Send + Sync>;

pub struct EventEmitter {
    store: EventStore,
    handlers: Vec<EventHandler>,
}

impl EventEmitter {
    pub fn new(store: EventStore) -> Self {
        Self {
            store,
            handlers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, handler: EventHandler) {
        self.handlers.push(handler);
    }

    /// Append then fan out. Returns the stored event so callers can use its
    /// `event_id` as the `causation_id` of a subsequent emission.
    pub fn emit(
        &self,
        tenant_id: TenantId,
        correlation_id: CorrelationId,
        causation_id: Option<CausationId>,
        source_service: &str,
        payload: EventPayload,
    ) -> PspResult<DomainEvent> {
        let event = self
            .store
            .append(tenant_id, correlation_id, causation_id, source_service, payload)?;

        for handler in &self.handlers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&event)));
            if result.is_err() {
                error!(event_type = event.payload.type_name(), "event handler panicked");
            }
        }

        Ok(event)
    }
}

impl From<EventStore> for EventEmitter {
    fn from(store: EventStore) -> Self {
        EventEmitter::new(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::ids::new_id;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn emit_invokes_handlers() {
        let db = Db::open_in_memory().unwrap();
        let store = EventStore::new(db);
        let mut emitter = EventEmitter::new(store);

        let seen = Arc::new(Mutex::new(0u32));
        let seen_clone = seen.clone();
        emitter.subscribe(Box::new(move |_event| {
            *seen_clone.lock() += 1;
        }));

        emitter
            .emit(
                new_id(),
                new_id(),
                None,
                "test",
                EventPayload::ReconciliationStarted {
                    batch_ref: "b1".into(),
                },
            )
            .unwrap();

        assert_eq!(*seen.lock(), 1);
    }
}
