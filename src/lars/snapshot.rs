//! Snapshot replay: freeze a live run, re-execute it without an LLM.
//!
//! [`freeze`] reconstructs a session's complete interaction sequence from
//! the log store alone: the ordered cells, every turn's assistant response
//! (text plus tool calls), and every tool invocation with its arguments and
//! result. [`replay`] then re-runs the cascade with the transport and every
//! trait mocked from the snapshot, asserting:
//!
//! - identical cell execution order and names;
//! - identical tool calls and argument values (exact by default; per-tool
//!   field whitelists relax comparison for non-deterministic fields like
//!   timestamps and UUIDs);
//! - identical completion status;
//! - declared terminal state keys, when the snapshot carries expectations.
//!
//! No live LLM transport is involved — the replay transport serves recorded
//! turns in order and fails loudly if the run asks for more than were
//! recorded. Replay is deterministic for cascades without parallel fan-out;
//! candidate branches interleave their recorded turns nondeterministically.

use crate::lars::cascade::Cascade;
use crate::lars::driver::{CascadeEngine, RunOptions, RunStatus};
use crate::lars::event::EventKind;
use crate::lars::store::{LogStore, MemoryLogStore};
use crate::lars::trait_registry::{
    TraitContext, TraitError, TraitHandler, TraitMetadata, TraitOutcome,
};
use crate::lars::transport::{ChatRequest, ChatResponse, ChatTransport, ToolCall, Usage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Snapshot-related failures.
#[derive(Debug, Clone)]
pub enum SnapshotError {
    Store(String),
    MissingData(String),
    Engine(String),
    Io(String),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Store(msg) => write!(f, "snapshot store error: {}", msg),
            SnapshotError::MissingData(msg) => write!(f, "snapshot incomplete: {}", msg),
            SnapshotError::Engine(msg) => write!(f, "replay engine error: {}", msg),
            SnapshotError::Io(msg) => write!(f, "snapshot I/O error: {}", msg),
        }
    }
}

impl Error for SnapshotError {}

/// One recorded assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecording {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

/// One recorded tool invocation: the arguments the live run passed and the
/// value the tool returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Value,
    pub result: Value,
}

/// Declared assertions beyond the structural ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Expectations {
    /// Keys that must be present in the terminal state.
    #[serde(default)]
    pub state_keys: Vec<String>,
}

/// A frozen run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub cascade_id: String,
    pub session_id: String,
    pub input: Value,
    /// Cell names in execution order.
    pub cell_order: Vec<String>,
    /// Assistant turns in emission order, across all cells.
    pub turns: Vec<TurnRecording>,
    /// Tool invocations in execution order, across all cells.
    pub tool_invocations: Vec<ToolInvocation>,
    /// `"success"`, `"error"`, or `"cancelled"`.
    pub final_status: String,
    #[serde(default)]
    pub expectations: Option<Expectations>,
    /// Tool name → argument fields excluded from equality comparison
    /// (timestamps, UUIDs, and similar non-determinism inside traits).
    #[serde(default)]
    pub relaxations: BTreeMap<String, Vec<String>>,
}

impl Snapshot {
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| SnapshotError::Io(e.to_string()))?;
        fs::write(path, text).map_err(|e| SnapshotError::Io(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let text = fs::read_to_string(path).map_err(|e| SnapshotError::Io(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| SnapshotError::Io(e.to_string()))
    }
}

/// The outcome of a replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub passed: bool,
    pub divergences: Vec<String>,
    pub cells_executed: Vec<String>,
    pub status: RunStatus,
    /// How many recorded turns the mock transport served.
    pub turns_served: usize,
}

/// Freeze a session's interaction sequence out of the log store.
pub async fn freeze(
    store: &Arc<dyn LogStore>,
    session_id: &str,
    name: &str,
) -> Result<Snapshot, SnapshotError> {
    let events = store
        .events_for_session(session_id)
        .await
        .map_err(|e| SnapshotError::Store(e.to_string()))?;
    if events.is_empty() {
        return Err(SnapshotError::MissingData(format!(
            "no events recorded for session '{}'",
            session_id
        )));
    }

    let mut cascade_id = None;
    let mut input = Value::Null;
    let mut cell_order = Vec::new();
    let mut turns = Vec::new();
    let mut tool_invocations = Vec::new();
    let mut final_status = "error".to_string();
    // Arguments seen in tool_call events, awaiting their tool_result.
    let mut pending_args: HashMap<String, VecDeque<Value>> = HashMap::new();

    for event in &events {
        match event.kind {
            EventKind::CascadeStart => {
                if cascade_id.is_none() {
                    cascade_id = event
                        .payload
                        .get("cascade_id")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string());
                    input = event.payload.get("input").cloned().unwrap_or(Value::Null);
                }
            }
            EventKind::CellStart => {
                if let Some(cell) = event.payload.get("cell").and_then(Value::as_str) {
                    cell_order.push(cell.to_string());
                }
            }
            EventKind::TurnComplete => {
                let content = event
                    .payload
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let tool_calls = event
                    .payload
                    .get("tool_calls")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| SnapshotError::MissingData(e.to_string()))?
                    .unwrap_or_default();
                turns.push(TurnRecording {
                    content,
                    tool_calls,
                });
            }
            EventKind::ToolCall => {
                if let Some(tool_name) = event.payload.get("name").and_then(Value::as_str) {
                    let arguments = event
                        .payload
                        .get("arguments")
                        .cloned()
                        .unwrap_or(Value::Null);
                    pending_args
                        .entry(tool_name.to_string())
                        .or_insert_with(VecDeque::new)
                        .push_back(arguments);
                }
            }
            EventKind::ToolResult => {
                let tool_name = match event.payload.get("name").and_then(Value::as_str) {
                    Some(tool_name) => tool_name,
                    None => continue,
                };
                if event.payload.get("skipped").and_then(Value::as_bool) == Some(true) {
                    continue;
                }
                let arguments = pending_args
                    .get_mut(tool_name)
                    .and_then(|queue| queue.pop_front())
                    .unwrap_or(Value::Null);
                let result = event.payload.get("result").cloned().unwrap_or_else(|| {
                    json!({"success": event.payload.get("success"), "target": event.payload.get("target")})
                });
                tool_invocations.push(ToolInvocation {
                    name: tool_name.to_string(),
                    arguments,
                    result,
                });
            }
            EventKind::CascadeComplete => {
                final_status = event
                    .payload
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("success")
                    .to_string();
            }
            EventKind::CascadeError => {
                final_status = "error".to_string();
            }
            _ => {}
        }
    }

    let cascade_id = cascade_id.ok_or_else(|| {
        SnapshotError::MissingData("session has no cascade_start event".to_string())
    })?;
    Ok(Snapshot {
        name: name.to_string(),
        cascade_id,
        session_id: session_id.to_string(),
        input,
        cell_order,
        turns,
        tool_invocations,
        final_status,
        expectations: None,
        relaxations: BTreeMap::new(),
    })
}

/// Serves recorded turns instead of calling a provider.
struct ReplayTransport {
    turns: Mutex<VecDeque<TurnRecording>>,
    served: AtomicUsize,
}

#[async_trait]
impl ChatTransport for ReplayTransport {
    async fn chat(
        &self,
        _request: ChatRequest,
    ) -> Result<ChatResponse, Box<dyn Error + Send + Sync>> {
        let turn = self.turns.lock().unwrap().pop_front().ok_or_else(|| {
            Box::<dyn Error + Send + Sync>::from(
                "snapshot exhausted: the replay asked for more LLM turns than were recorded",
            )
        })?;
        self.served.fetch_add(1, Ordering::SeqCst);
        Ok(ChatResponse {
            content: turn.content,
            tool_calls: turn.tool_calls,
            usage: Usage::default(),
        })
    }

    fn default_model(&self) -> &str {
        "replay/mock"
    }
}

/// Serves one tool's recorded results in order, checking arguments.
struct ReplayTrait {
    name: String,
    queue: Mutex<VecDeque<ToolInvocation>>,
    relaxed_fields: Vec<String>,
    divergences: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl TraitHandler for ReplayTrait {
    fn metadata(&self) -> TraitMetadata {
        TraitMetadata::new(&self.name, "Replays a recorded tool result.")
            .with_args_schema(json!({"type": "object", "properties": {}}))
    }

    async fn execute(&self, args: Value, _ctx: &TraitContext) -> Result<TraitOutcome, TraitError> {
        let recorded = match self.queue.lock().unwrap().pop_front() {
            Some(recorded) => recorded,
            None => {
                let message = format!(
                    "tool '{}' called more times than the snapshot recorded",
                    self.name
                );
                self.divergences.lock().unwrap().push(message.clone());
                return Err(TraitError::ExecutionFailed(message));
            }
        };
        let live = canonicalize(&args, &self.relaxed_fields);
        let frozen = canonicalize(&recorded.arguments, &self.relaxed_fields);
        if live != frozen {
            self.divergences.lock().unwrap().push(format!(
                "tool '{}' arguments diverged: live {} vs recorded {}",
                self.name, live, frozen
            ));
        }
        Ok(TraitOutcome::from_value(recorded.result))
    }
}

/// Strip relaxed fields before comparing argument objects.
fn canonicalize(value: &Value, relaxed_fields: &[String]) -> Value {
    match value {
        Value::Object(fields) => {
            let mut out = serde_json::Map::new();
            for (key, item) in fields {
                if relaxed_fields.iter().any(|f| f == key) {
                    continue;
                }
                out.insert(key.clone(), item.clone());
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Replay a snapshot against the cascade document, with the transport and
/// every recorded trait mocked. `route_to` and `set_state` run for real —
/// they are deterministic engine built-ins, and replaying them exercises
/// the same routing and state paths the live run took.
pub async fn replay(cascade: Cascade, snapshot: &Snapshot) -> Result<ReplayReport, SnapshotError> {
    let divergences = Arc::new(Mutex::new(Vec::new()));
    let store: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
    let transport = Arc::new(ReplayTransport {
        turns: Mutex::new(snapshot.turns.iter().cloned().collect()),
        served: AtomicUsize::new(0),
    });

    // One mock per distinct recorded tool, fed its invocations in order.
    let mut per_tool: HashMap<String, VecDeque<ToolInvocation>> = HashMap::new();
    for invocation in &snapshot.tool_invocations {
        if invocation.name == "route_to" || invocation.name == "set_state" {
            continue;
        }
        per_tool
            .entry(invocation.name.clone())
            .or_insert_with(VecDeque::new)
            .push_back(invocation.clone());
    }

    let mut builder = CascadeEngine::builder(transport.clone(), store.clone())
        .with_cascade(cascade);
    for (name, queue) in per_tool {
        let relaxed_fields = snapshot.relaxations.get(&name).cloned().unwrap_or_default();
        builder = builder.with_trait(Arc::new(ReplayTrait {
            name,
            queue: Mutex::new(queue),
            relaxed_fields,
            divergences: divergences.clone(),
        }));
    }
    let engine = builder
        .build()
        .map_err(|e| SnapshotError::Engine(e.to_string()))?;

    let replay_session = format!("replay-{}", snapshot.session_id);
    let report = engine
        .run(
            &snapshot.cascade_id,
            snapshot.input.clone(),
            RunOptions {
                session_id: Some(replay_session.clone()),
                ..RunOptions::default()
            },
        )
        .await
        .map_err(|e| SnapshotError::Engine(e.to_string()))?;

    let mut divergences = Arc::try_unwrap(divergences)
        .map(|m| m.into_inner().unwrap())
        .unwrap_or_else(|arc| arc.lock().unwrap().clone());

    // Structural comparison from the replay's own event log.
    let events = store
        .events_for_session(&replay_session)
        .await
        .map_err(|e| SnapshotError::Store(e.to_string()))?;
    let mut cells_executed = Vec::new();
    let mut live_calls = Vec::new();
    for event in &events {
        match event.kind {
            EventKind::CellStart => {
                if let Some(cell) = event.payload.get("cell").and_then(Value::as_str) {
                    cells_executed.push(cell.to_string());
                }
            }
            EventKind::ToolCall => {
                if let (Some(tool_name), Some(arguments)) = (
                    event.payload.get("name").and_then(Value::as_str),
                    event.payload.get("arguments"),
                ) {
                    live_calls.push((tool_name.to_string(), arguments.clone()));
                }
            }
            _ => {}
        }
    }

    if cells_executed != snapshot.cell_order {
        divergences.push(format!(
            "cell order diverged: live {:?} vs recorded {:?}",
            cells_executed, snapshot.cell_order
        ));
    }

    let recorded_calls: Vec<(String, Value)> = snapshot
        .tool_invocations
        .iter()
        .map(|inv| (inv.name.clone(), inv.arguments.clone()))
        .collect();
    if live_calls.len() != recorded_calls.len() {
        divergences.push(format!(
            "tool call count diverged: live {} vs recorded {}",
            live_calls.len(),
            recorded_calls.len()
        ));
    } else {
        for (i, ((live_name, live_args), (rec_name, rec_args))) in
            live_calls.iter().zip(recorded_calls.iter()).enumerate()
        {
            if live_name != rec_name {
                divergences.push(format!(
                    "tool call {} diverged: live '{}' vs recorded '{}'",
                    i, live_name, rec_name
                ));
                continue;
            }
            let relaxed = snapshot
                .relaxations
                .get(live_name)
                .cloned()
                .unwrap_or_default();
            if canonicalize(live_args, &relaxed) != canonicalize(rec_args, &relaxed) {
                divergences.push(format!(
                    "tool call {} ('{}') arguments diverged",
                    i, live_name
                ));
            }
        }
    }

    let live_status = match report.status {
        RunStatus::Success => "success",
        RunStatus::Error => "error",
        RunStatus::Cancelled => "cancelled",
    };
    if live_status != snapshot.final_status {
        divergences.push(format!(
            "completion status diverged: live '{}' vs recorded '{}'",
            live_status, snapshot.final_status
        ));
    }

    if let Some(expectations) = &snapshot.expectations {
        for key in &expectations.state_keys {
            if !report.state.contains_key(key) {
                divergences.push(format!("expected terminal state key '{}' is absent", key));
            }
        }
    }

    Ok(ReplayReport {
        passed: divergences.is_empty(),
        divergences,
        cells_executed,
        status: report.status,
        turns_served: transport.served.load(Ordering::SeqCst),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_drops_relaxed_fields() {
        let value = json!({"query": "select 1", "request_id": "abc"});
        let relaxed = vec!["request_id".to_string()];
        assert_eq!(
            canonicalize(&value, &relaxed),
            json!({"query": "select 1"})
        );
        // Non-objects pass through.
        assert_eq!(canonicalize(&json!(3), &relaxed), json!(3));
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let snapshot = Snapshot {
            name: "routing_positive".to_string(),
            cascade_id: "classifier".to_string(),
            session_id: "s1".to_string(),
            input: json!({"text": "I love it"}),
            cell_order: vec!["classify".to_string(), "positive".to_string()],
            turns: vec![TurnRecording {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    id: "call_1".to_string(),
                    name: "route_to".to_string(),
                    arguments: json!({"target": "positive"}),
                }],
            }],
            tool_invocations: Vec::new(),
            final_status: "success".to_string(),
            expectations: None,
            relaxations: BTreeMap::new(),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing_positive.json");
        snapshot.save(&path).unwrap();
        let loaded = Snapshot::load(&path).unwrap();
        assert_eq!(loaded.cascade_id, snapshot.cascade_id);
        assert_eq!(loaded.turns.len(), 1);
        assert_eq!(loaded.turns[0].tool_calls[0].name, "route_to");
    }
}
