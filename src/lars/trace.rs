//! Hierarchical execution tree for a cascade run.
//!
//! Every run owns a [`TraceTree`]: an append-only arena of [`TraceNode`]s
//! forming a strict tree by `parent_id`. Nodes are opened while a unit of
//! work is running and sealed exactly once when it ends; a sealed node is
//! immutable. The tree is shared across candidate branches, so all methods
//! take `&self` and synchronise internally.
//!
//! Node payloads (requests, responses, tool arguments/results) pass through
//! an optional redactor before being stored, so secrets can be scrubbed at
//! the capture boundary rather than at query time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// What kind of work a trace node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    Cascade,
    Cell,
    Turn,
    ToolCall,
    Candidate,
    ReforgeStep,
    Ward,
    SubCascade,
}

/// Lifecycle status of a trace node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Running,
    Ok,
    Error,
    Aborted,
    Cancelled,
}

/// One node in the execution tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceNode {
    pub trace_id: String,
    pub parent_id: Option<String>,
    pub kind: TraceKind,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: TraceStatus,
    pub cost_usd: f64,
    pub tokens_in: usize,
    pub tokens_out: usize,
    pub model: Option<String>,
    /// Sub-cascade nesting depth of the run this node belongs to.
    pub depth: usize,
    pub candidate_index: Option<usize>,
    pub is_winner: Option<bool>,
    pub reforge_step: Option<usize>,
    /// Request/response/tool payload, already redacted.
    pub payload: Option<Value>,
}

/// Redaction hook applied to payloads before they enter the tree.
pub type Redactor = Arc<dyn Fn(Value) -> Value + Send + Sync>;

struct TreeInner {
    nodes: Vec<TraceNode>,
    index: HashMap<String, usize>,
}

/// Append-only arena of trace nodes, shared across a run.
pub struct TraceTree {
    inner: Mutex<TreeInner>,
    redactor: Option<Redactor>,
}

impl TraceTree {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TreeInner {
                nodes: Vec::new(),
                index: HashMap::new(),
            }),
            redactor: None,
        }
    }

    /// Build a tree whose payloads pass through `redactor` before storage.
    pub fn with_redactor(redactor: Redactor) -> Self {
        Self {
            inner: Mutex::new(TreeInner {
                nodes: Vec::new(),
                index: HashMap::new(),
            }),
            redactor: Some(redactor),
        }
    }

    /// Open a new node and return its id.
    pub fn begin(
        &self,
        kind: TraceKind,
        name: impl Into<String>,
        parent_id: Option<&str>,
        depth: usize,
    ) -> String {
        let trace_id = Uuid::new_v4().to_string();
        let node = TraceNode {
            trace_id: trace_id.clone(),
            parent_id: parent_id.map(|p| p.to_string()),
            kind,
            name: name.into(),
            started_at: Utc::now(),
            ended_at: None,
            status: TraceStatus::Running,
            cost_usd: 0.0,
            tokens_in: 0,
            tokens_out: 0,
            model: None,
            depth,
            candidate_index: None,
            is_winner: None,
            reforge_step: None,
            payload: None,
        };
        let mut inner = self.inner.lock().unwrap();
        let position = inner.nodes.len();
        inner.index.insert(trace_id.clone(), position);
        inner.nodes.push(node);
        trace_id
    }

    /// Seal a node with its terminal status. A node seals at most once;
    /// a second attempt is ignored with a warning.
    pub fn end(&self, trace_id: &str, status: TraceStatus) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&i) = inner.index.get(trace_id) {
            let node = &mut inner.nodes[i];
            if node.ended_at.is_some() {
                log::warn!("trace node {} sealed twice; second end ignored", trace_id);
                return;
            }
            node.ended_at = Some(Utc::now());
            node.status = status;
        }
    }

    /// Record usage and model on an open node.
    pub fn record_usage(&self, trace_id: &str, tokens_in: usize, tokens_out: usize, cost_usd: f64, model: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&i) = inner.index.get(trace_id) {
            let node = &mut inner.nodes[i];
            if node.ended_at.is_some() {
                return;
            }
            node.tokens_in += tokens_in;
            node.tokens_out += tokens_out;
            node.cost_usd += cost_usd;
            if node.model.is_none() {
                node.model = model.map(|m| m.to_string());
            }
        }
    }

    /// Attach a payload blob to an open node, redacting first.
    pub fn annotate(&self, trace_id: &str, payload: Value) {
        let payload = match &self.redactor {
            Some(redact) => redact(payload),
            None => payload,
        };
        let mut inner = self.inner.lock().unwrap();
        if let Some(&i) = inner.index.get(trace_id) {
            let node = &mut inner.nodes[i];
            if node.ended_at.is_none() {
                node.payload = Some(payload);
            }
        }
    }

    /// Mark a candidate node's index and, after selection, whether it won.
    pub fn mark_candidate(&self, trace_id: &str, index: usize, is_winner: Option<bool>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&i) = inner.index.get(trace_id) {
            let node = &mut inner.nodes[i];
            node.candidate_index = Some(index);
            if is_winner.is_some() {
                node.is_winner = is_winner;
            }
        }
    }

    /// Mark which reforge step a node belongs to.
    pub fn mark_reforge_step(&self, trace_id: &str, step: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&i) = inner.index.get(trace_id) {
            inner.nodes[i].reforge_step = Some(step);
        }
    }

    /// Clone out a node by id.
    pub fn node(&self, trace_id: &str) -> Option<TraceNode> {
        let inner = self.inner.lock().unwrap();
        inner.index.get(trace_id).map(|&i| inner.nodes[i].clone())
    }

    /// Clone out the direct children of a node, in creation order.
    pub fn children(&self, parent_id: &str) -> Vec<TraceNode> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .iter()
            .filter(|n| n.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect()
    }

    /// Clone out every node, in creation order.
    pub fn all(&self) -> Vec<TraceNode> {
        self.inner.lock().unwrap().nodes.clone()
    }

    /// Seal every still-running node as cancelled, deepest first. Used when
    /// a cascade timeout drops the active cell mid-flight.
    pub fn cancel_open_nodes(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        for node in inner.nodes.iter_mut().rev() {
            if node.ended_at.is_none() {
                node.ended_at = Some(now);
                node.status = TraceStatus::Cancelled;
            }
        }
    }

    /// Sum of cost across all nodes of the given kind.
    pub fn cost_of_kind(&self, kind: TraceKind) -> f64 {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .iter()
            .filter(|n| n.kind == kind)
            .map(|n| n.cost_usd)
            .sum()
    }
}

impl Default for TraceTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nodes_form_a_strict_tree() {
        let tree = TraceTree::new();
        let root = tree.begin(TraceKind::Cascade, "demo", None, 0);
        let cell = tree.begin(TraceKind::Cell, "ingest", Some(&root), 0);
        let turn = tree.begin(TraceKind::Turn, "turn-1", Some(&cell), 0);

        assert_eq!(tree.children(&root).len(), 1);
        assert_eq!(tree.children(&cell)[0].trace_id, turn);
        assert_eq!(tree.node(&turn).unwrap().parent_id, Some(cell));
    }

    #[test]
    fn sealed_nodes_are_immutable() {
        let tree = TraceTree::new();
        let id = tree.begin(TraceKind::Cell, "ingest", None, 0);
        tree.record_usage(&id, 10, 5, 0.01, Some("m1"));
        tree.end(&id, TraceStatus::Ok);

        tree.record_usage(&id, 100, 100, 1.0, None);
        tree.annotate(&id, json!({"late": true}));
        tree.end(&id, TraceStatus::Error);

        let node = tree.node(&id).unwrap();
        assert_eq!(node.status, TraceStatus::Ok);
        assert_eq!(node.tokens_in, 10);
        assert!(node.payload.is_none());
    }

    #[test]
    fn redactor_runs_before_storage() {
        let tree = TraceTree::with_redactor(Arc::new(|mut value: Value| {
            if let Some(obj) = value.as_object_mut() {
                obj.remove("secret");
            }
            value
        }));
        let id = tree.begin(TraceKind::ToolCall, "shell", None, 0);
        tree.annotate(&id, json!({"secret": "hunter2", "cmd": "ls"}));
        let node = tree.node(&id).unwrap();
        assert_eq!(node.payload, Some(json!({"cmd": "ls"})));
    }
}
