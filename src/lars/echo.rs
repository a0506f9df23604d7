//! The per-run accumulator threaded through every cell.
//!
//! An [`Echo`] carries everything a cascade run knows about itself: the
//! immutable input, the mutable `state` mapping, the growing message
//! `history`, per-cell `outputs`, the ordered `lineage` of executed cells,
//! and the structured `errors` list. The runner mutates the echo as it goes;
//! candidate branches take a copy via [`Echo::fork_branch`] and only the
//! winner's deltas are merged back with [`Echo::merge_winner`].
//!
//! Invariants:
//! - `outputs[name]` is written exactly once per completed cell;
//!   [`Echo::commit_output`] rejects a second write.
//! - `state` mutations are recorded in the mutation log (last write wins).
//! - `history` grows monotonically within a cell body; branch copies never
//!   write back unless selected.

use crate::lars::transport::ChatMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt;

/// The error taxonomy surfaced in a run's `errors` list and final envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RunErrorKind {
    /// The cascade document failed to parse/validate, or the input violated
    /// `inputs_schema`. No run is started.
    InputError,
    /// A tool raised or timed out. Surfaced to the agent as a tool-result;
    /// not fatal to the cell.
    TraitError,
    /// LLM transport failure that exhausted its retries.
    AgentError,
    /// A blocking ward rejected the cell's input or output.
    WardBlocked,
    /// The cell body terminated without a usable output.
    CellError,
    /// Routing named a cell outside `handoffs` or outside the cascade.
    RoutingError,
    /// The cell-iteration safety cap was hit.
    LoopBoundExceeded,
    /// A signal wait expired. Only terminal if the cascade routes on it.
    SignalTimeout,
    /// The cascade's wall-clock cap cancelled the active cell.
    CascadeTimeout,
}

impl fmt::Display for RunErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunErrorKind::InputError => "InputError",
            RunErrorKind::TraitError => "TraitError",
            RunErrorKind::AgentError => "AgentError",
            RunErrorKind::WardBlocked => "WardBlocked",
            RunErrorKind::CellError => "CellError",
            RunErrorKind::RoutingError => "RoutingError",
            RunErrorKind::LoopBoundExceeded => "LoopBoundExceeded",
            RunErrorKind::SignalTimeout => "SignalTimeout",
            RunErrorKind::CascadeTimeout => "CascadeTimeout",
        };
        write!(f, "{}", name)
    }
}

/// A structured error entry in the run's `errors` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: RunErrorKind,
    /// Cell the error is attributed to, when there is one.
    pub cell: Option<String>,
    pub message: String,
}

impl RunError {
    pub fn new(kind: RunErrorKind, cell: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            cell: cell.map(|c| c.to_string()),
            message: message.into(),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cell {
            Some(cell) => write!(f, "{} in cell '{}': {}", self.kind, cell, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl Error for RunError {}

/// Terminal status of one cell execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    Completed,
    Failed,
    AbortedByWard,
    Cancelled,
}

/// One entry in the run's ordered lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEntry {
    pub cell: String,
    pub status: CellStatus,
    /// Winning branch index when the cell ran candidates in evaluate mode.
    pub winner_index: Option<usize>,
    /// Number of reforge refinement steps actually executed.
    pub reforge_steps: usize,
    pub cost_usd: f64,
    /// True when the turn loop ran out of turns without terminal content.
    pub exhausted: bool,
    /// True when candidates ran in aggregate mode (no single winner).
    pub aggregated: bool,
    /// True when the evaluator failed to return a parseable index and the
    /// engine fell back to branch 0.
    pub evaluator_fallback: bool,
}

impl LineageEntry {
    pub fn new(cell: impl Into<String>, status: CellStatus) -> Self {
        Self {
            cell: cell.into(),
            status,
            winner_index: None,
            reforge_steps: 0,
            cost_usd: 0.0,
            exhausted: false,
            aggregated: false,
            evaluator_fallback: false,
        }
    }
}

/// One logged `state` mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMutation {
    pub key: String,
    pub value: Value,
    pub cell: Option<String>,
    pub at: DateTime<Utc>,
}

/// Attempting to commit a cell output twice, or read one that is absent.
#[derive(Debug, Clone)]
pub enum EchoError {
    DuplicateOutput(String),
    MissingOutput(String),
}

impl fmt::Display for EchoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EchoError::DuplicateOutput(cell) => {
                write!(f, "output for cell '{}' was already committed", cell)
            }
            EchoError::MissingOutput(cell) => {
                write!(f, "cell '{}' has no committed output", cell)
            }
        }
    }
}

impl Error for EchoError {}

/// The in-run state/history/lineage accumulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Echo {
    /// Stable key for the run; persistent artifacts and logs key on it.
    pub session_id: String,
    /// The cascade's initial input. Immutable for the life of the run.
    pub input: Value,
    /// Free-form mutable mapping. Writes go through [`Echo::set_state`].
    pub state: Map<String, Value>,
    /// Message history threaded into LLM calls.
    pub history: Vec<ChatMessage>,
    /// Cell name → terminal output of that cell.
    pub outputs: Map<String, Value>,
    /// Ordered record of executed cells.
    pub lineage: Vec<LineageEntry>,
    /// Structured error list.
    pub errors: Vec<RunError>,
    pub current_cell: Option<String>,
    /// Sub-cascade nesting depth; 0 for a top-level run.
    pub depth: usize,
    pub trace_id: String,
    pub parent_trace_id: Option<String>,
    /// Ordered log of state mutations.
    pub state_log: Vec<StateMutation>,
}

impl Echo {
    pub fn new(session_id: impl Into<String>, input: Value) -> Self {
        Self {
            session_id: session_id.into(),
            input,
            state: Map::new(),
            history: Vec::new(),
            outputs: Map::new(),
            lineage: Vec::new(),
            errors: Vec::new(),
            current_cell: None,
            depth: 0,
            trace_id: String::new(),
            parent_trace_id: None,
            state_log: Vec::new(),
        }
    }

    /// Record a state mutation. Last write wins; every write is logged.
    pub fn set_state(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        self.state_log.push(StateMutation {
            key: key.clone(),
            value: value.clone(),
            cell: self.current_cell.clone(),
            at: Utc::now(),
        });
        self.state.insert(key, value)
    }

    /// Commit the terminal output of a cell. Exactly once per cell.
    pub fn commit_output(&mut self, cell: &str, value: Value) -> Result<(), EchoError> {
        if self.outputs.contains_key(cell) {
            return Err(EchoError::DuplicateOutput(cell.to_string()));
        }
        self.outputs.insert(cell.to_string(), value);
        Ok(())
    }

    /// Read a completed cell's output, failing loudly when absent.
    pub fn output(&self, cell: &str) -> Result<&Value, EchoError> {
        self.outputs
            .get(cell)
            .ok_or_else(|| EchoError::MissingOutput(cell.to_string()))
    }

    pub fn push_history(&mut self, message: ChatMessage) {
        self.history.push(message);
    }

    pub fn push_error(&mut self, error: RunError) {
        self.errors.push(error);
    }

    pub fn record_lineage(&mut self, entry: LineageEntry) {
        self.lineage.push(entry);
    }

    /// Total cost across the lineage so far.
    pub fn total_cost(&self) -> f64 {
        self.lineage.iter().map(|entry| entry.cost_usd).sum()
    }

    /// Shallow copy for a candidate branch.
    ///
    /// The branch sees the parent's state, history, and outputs as they stand,
    /// but mutations it makes stay private until [`Echo::merge_winner`]
    /// reconciles the selected branch back into the parent.
    pub fn fork_branch(&self) -> Echo {
        self.clone()
    }

    /// Merge the winning branch's deltas back into this echo.
    ///
    /// The winner's history, state (plus mutation log), outputs, and errors
    /// replace or extend the parent's; eliminated branches are dropped.
    pub fn merge_winner(&mut self, winner: Echo) {
        self.history = winner.history;
        self.state = winner.state;
        self.state_log = winner.state_log;
        self.outputs = winner.outputs;
        self.errors = winner.errors;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lars::transport::{ChatMessage, Role};
    use serde_json::json;

    #[test]
    fn output_commits_exactly_once() {
        let mut echo = Echo::new("s1", json!({}));
        echo.commit_output("ingest", json!("first")).unwrap();
        let second = echo.commit_output("ingest", json!("second"));
        assert!(second.is_err());
        assert_eq!(echo.output("ingest").unwrap(), &json!("first"));
    }

    #[test]
    fn reading_missing_output_fails() {
        let echo = Echo::new("s1", json!({}));
        assert!(echo.output("never_ran").is_err());
    }

    #[test]
    fn state_writes_are_logged_and_last_write_wins() {
        let mut echo = Echo::new("s1", json!({}));
        echo.set_state("k", json!(1));
        echo.set_state("k", json!(2));
        assert_eq!(echo.state.get("k"), Some(&json!(2)));
        assert_eq!(echo.state_log.len(), 2);
        assert_eq!(echo.state_log[1].value, json!(2));
    }

    #[test]
    fn branch_mutations_stay_isolated_until_merge() {
        let mut parent = Echo::new("s1", json!({}));
        parent.set_state("shared", json!("before"));

        let mut winner = parent.fork_branch();
        let mut loser = parent.fork_branch();
        winner.set_state("shared", json!("winner"));
        winner.push_history(ChatMessage::text(Role::Assistant, "winning turn"));
        loser.set_state("shared", json!("loser"));

        // Nothing visible in the parent yet.
        assert_eq!(parent.state.get("shared"), Some(&json!("before")));

        parent.merge_winner(winner);
        assert_eq!(parent.state.get("shared"), Some(&json!("winner")));
        assert_eq!(parent.history.len(), 1);
    }
}
