//! Append-only session event log
//!
//! Events are staged into the same `WriteSet` as the state transition they
//! describe, so an event exists if and only if its transition was committed.
//! Sequence numbers are dense per session and the event key is guarded
//! against overwrite.
//!
//! There is no standalone append: callers open an `EventBatch` under the
//! session lock and `stage` into the write that carries the transition.

use crate::common::traits::KvStore;
use crate::common::types::{now, GameEvent, GameEventType, SessionId};
use crate::errors::EngineResult;
use crate::game_store;
use crate::storage::WriteSet;
use std::sync::Arc;
use uuid::Uuid;

pub struct EventRecorder {
    store: Arc<dyn KvStore>,
}

/// Hands out consecutive sequence numbers for one session within one write
pub struct EventBatch {
    session_id: SessionId,
    next_sequence: u64,
}

impl EventBatch {
    pub fn stage(
        &mut self,
        ws: &mut WriteSet,
        event_type: GameEventType,
        payload: serde_json::Value,
    ) -> EngineResult<GameEvent> {
        let event = GameEvent {
            id: Uuid::new_v4(),
            game_session_id: self.session_id,
            sequence: self.next_sequence,
            event_type,
            payload,
            created_at: now(),
        };
        game_store::stage_event(ws, &event)?;
        self.next_sequence += 1;
        tracing::debug!(session_id = %self.session_id, sequence = event.sequence, %event_type, "event staged");
        Ok(event)
    }
}

impl EventRecorder {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Start staging events for a session. Must be called under the session lock.
    pub fn batch(&self, session_id: SessionId) -> EngineResult<EventBatch> {
        let next_sequence = game_store::count_events(self.store.as_ref(), &session_id)?;
        Ok(EventBatch {
            session_id,
            next_sequence,
        })
    }

    /// Events in sequence order
    pub fn list(&self, session_id: &SessionId) -> EngineResult<Vec<GameEvent>> {
        game_store::load_events(self.store.as_ref(), session_id)
    }
}
