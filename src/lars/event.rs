//! Run event system.
//!
//! Every boundary in a cascade run — cell start, LLM turn, tool call, ward
//! verdict, candidate selection, signal rendezvous — emits an [`Event`]
//! through the run's [`EventBus`]. The bus does two things with each event:
//!
//! 1. writes it through to the durable [`LogStore`](crate::lars::store::LogStore);
//! 2. fans it out to live subscribers over a bounded broadcast channel.
//!
//! Publishers never block on slow consumers: a subscriber that falls behind
//! its buffer observes a lag error and may resubscribe; the durable log is
//! always complete. Events are totally ordered per session via the `seq`
//! counter, assigned under the publish lock.

use crate::lars::store::{LogStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::Mutex;

/// Everything that can happen during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CascadeStart,
    CascadeComplete,
    CascadeError,
    CellStart,
    CellComplete,
    TurnStart,
    /// Carries the turn's assistant text and tool calls so a session can be
    /// frozen into a replayable snapshot from the log alone.
    TurnComplete,
    ToolCall,
    ToolResult,
    CandidateStart,
    CandidateComplete,
    CandidateSelected,
    ReforgeStepStart,
    ReforgeStepComplete,
    WardPass,
    WardFail,
    Handoff,
    SignalWait,
    SignalFire,
    SignalTimeout,
    CheckpointWaiting,
    CheckpointResponded,
    TrainingInjected,
    ImageTruncated,
    StateMutated,
}

/// Timestamped envelope emitted to the bus and the log sink.
///
/// Events are immutable once emitted and keyed by
/// `(session_id, trace_id, seq)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub session_id: String,
    /// Trace node the event belongs to.
    pub trace_id: String,
    /// Monotonic per-session sequence number; the tie-breaker when clock
    /// skew makes timestamps ambiguous.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: Value,
}

/// Per-run event publisher with durable write-through.
pub struct EventBus {
    store: Arc<dyn LogStore>,
    sender: broadcast::Sender<Event>,
    /// session_id → next seq. Held across the store append so per-session
    /// order in the sink matches the assigned sequence.
    seqs: Mutex<HashMap<String, u64>>,
}

impl EventBus {
    /// Build a bus writing through to `store` with the given subscriber
    /// buffer capacity.
    pub fn new(store: Arc<dyn LogStore>, buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            store,
            sender,
            seqs: Mutex::new(HashMap::new()),
        }
    }

    /// Emit an event: assign its sequence number, append it to the store,
    /// and fan it out to subscribers.
    ///
    /// A store failure is logged and the event is still broadcast; the
    /// caller's control flow never depends on sink health.
    pub async fn publish(
        &self,
        session_id: &str,
        trace_id: &str,
        kind: EventKind,
        payload: Value,
    ) -> Event {
        let mut seqs = self.seqs.lock().await;
        let seq_slot = seqs.entry(session_id.to_string()).or_insert(0);
        let event = Event {
            session_id: session_id.to_string(),
            trace_id: trace_id.to_string(),
            seq: *seq_slot,
            timestamp: Utc::now(),
            kind,
            payload,
        };
        *seq_slot += 1;
        if let Err(e) = self.store.append_event(&event).await {
            log::warn!("event sink append failed: {}", e);
        }
        drop(seqs);

        // No receivers is fine; the durable log is the source of truth.
        let _ = self.sender.send(event.clone());
        event
    }

    /// Subscribe to the live event stream.
    ///
    /// Subscribers that fall behind the buffer see
    /// [`broadcast::error::RecvError::Lagged`] and can resynchronise from
    /// the log store.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Replay a session's events from the durable log.
    pub async fn replay_session(&self, session_id: &str) -> Result<Vec<Event>, StoreError> {
        self.store.events_for_session(session_id).await
    }
}
