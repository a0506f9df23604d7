//! The durability boundary: an append-only log store adapter.
//!
//! Everything the engine needs to survive a process restart — events, signal
//! waiter records, winning rewrites, training annotations — is written
//! through the [`LogStore`] trait. The engine does not assume a specific
//! backing store; two implementations ship with the crate:
//!
//! - [`MemoryLogStore`]: in-process, for tests and ephemeral runs.
//! - [`JsonlLogStore`]: append-only `.jsonl` files under a root directory,
//!   one events file per session plus shared files for signals, rewrites,
//!   and training annotations. Records are never rewritten; updates append a
//!   new version and reads take the latest per id.

use crate::lars::event::Event;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Errors surfaced by a log store backend.
#[derive(Debug, Clone)]
pub enum StoreError {
    Io(String),
    Serde(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(msg) => write!(f, "store I/O error: {}", msg),
            StoreError::Serde(msg) => write!(f, "store serialization error: {}", msg),
        }
    }
}

impl Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(error: std::io::Error) -> Self {
        StoreError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Serde(error.to_string())
    }
}

/// Lifecycle of a signal waiter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Waiting,
    Fired,
    Timeout,
    Cancelled,
}

/// A durable signal waiter record.
///
/// One record per waiter; firing a signal transitions every record that is
/// still `Waiting` under that name. A record that has left `Waiting` never
/// transitions again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub signal_id: String,
    pub signal_name: String,
    pub session_id: String,
    pub cascade_id: String,
    pub cell_name: String,
    pub status: SignalStatus,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
}

/// A winning mutated instruction logged for rewrite learning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinningRewrite {
    pub species_hash: String,
    pub cascade_id: String,
    pub cell_name: String,
    pub instructions: String,
    pub winner_index: usize,
    pub created_at: DateTime<Utc>,
}

/// An annotated prior execution usable as a few-shot example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingAnnotation {
    pub trace_id: String,
    pub cascade_id: String,
    pub cell_name: String,
    pub trainable: bool,
    pub verified: bool,
    pub confidence: f64,
    #[serde(default)]
    pub notes: Option<String>,
    /// The example input as seen by the cell.
    pub input: Value,
    /// The cell's terminal output.
    pub output: Value,
    pub created_at: DateTime<Utc>,
}

/// Append-only event sink and durable record store.
///
/// Concurrent writes are serialized by the store. Events are keyed by
/// `(session_id, trace_id, seq)` and immutable once appended.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append_event(&self, event: &Event) -> Result<(), StoreError>;

    /// All events for a session, in append order.
    async fn events_for_session(&self, session_id: &str) -> Result<Vec<Event>, StoreError>;

    /// All events whose payload names the given cascade, in append order.
    async fn events_for_cascade(&self, cascade_id: &str) -> Result<Vec<Event>, StoreError>;

    /// Insert or update a signal record (latest version wins).
    async fn put_signal(&self, record: &SignalRecord) -> Result<(), StoreError>;

    async fn signal(&self, signal_id: &str) -> Result<Option<SignalRecord>, StoreError>;

    /// Latest version of every signal record, optionally filtered by name.
    async fn signals(&self, name: Option<&str>) -> Result<Vec<SignalRecord>, StoreError>;

    async fn append_winning_rewrite(&self, rewrite: &WinningRewrite) -> Result<(), StoreError>;

    /// Most recent winning rewrites with the given species hash, newest first.
    async fn winning_rewrites(
        &self,
        species_hash: &str,
        limit: usize,
    ) -> Result<Vec<WinningRewrite>, StoreError>;

    async fn append_training_annotation(
        &self,
        annotation: &TrainingAnnotation,
    ) -> Result<(), StoreError>;

    /// Annotations for a `(cascade_id, cell_name)` pair, in append order.
    async fn training_annotations(
        &self,
        cascade_id: &str,
        cell_name: &str,
    ) -> Result<Vec<TrainingAnnotation>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    events: Vec<Event>,
    signals: HashMap<String, SignalRecord>,
    signal_order: Vec<String>,
    rewrites: Vec<WinningRewrite>,
    training: Vec<TrainingAnnotation>,
}

/// In-process log store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryLogStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        self.inner.lock().unwrap().events.push(event.clone());
        Ok(())
    }

    async fn events_for_session(&self, session_id: &str) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .events
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn events_for_cascade(&self, cascade_id: &str) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .events
            .iter()
            .filter(|e| e.payload.get("cascade_id").and_then(Value::as_str) == Some(cascade_id))
            .cloned()
            .collect())
    }

    async fn put_signal(&self, record: &SignalRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.signals.contains_key(&record.signal_id) {
            inner.signal_order.push(record.signal_id.clone());
        }
        inner
            .signals
            .insert(record.signal_id.clone(), record.clone());
        Ok(())
    }

    async fn signal(&self, signal_id: &str) -> Result<Option<SignalRecord>, StoreError> {
        Ok(self.inner.lock().unwrap().signals.get(signal_id).cloned())
    }

    async fn signals(&self, name: Option<&str>) -> Result<Vec<SignalRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .signal_order
            .iter()
            .filter_map(|id| inner.signals.get(id))
            .filter(|r| name.map(|n| r.signal_name == n).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn append_winning_rewrite(&self, rewrite: &WinningRewrite) -> Result<(), StoreError> {
        self.inner.lock().unwrap().rewrites.push(rewrite.clone());
        Ok(())
    }

    async fn winning_rewrites(
        &self,
        species_hash: &str,
        limit: usize,
    ) -> Result<Vec<WinningRewrite>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .rewrites
            .iter()
            .rev()
            .filter(|r| r.species_hash == species_hash)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn append_training_annotation(
        &self,
        annotation: &TrainingAnnotation,
    ) -> Result<(), StoreError> {
        self.inner.lock().unwrap().training.push(annotation.clone());
        Ok(())
    }

    async fn training_annotations(
        &self,
        cascade_id: &str,
        cell_name: &str,
    ) -> Result<Vec<TrainingAnnotation>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .training
            .iter()
            .filter(|a| a.cascade_id == cascade_id && a.cell_name == cell_name)
            .cloned()
            .collect())
    }
}

/// Append-only JSONL store rooted at a directory.
///
/// Layout:
/// - `{root}/{session_id}/events.jsonl` — one event per line.
/// - `{root}/signals.jsonl` — signal record versions; last line per
///   `signal_id` is authoritative.
/// - `{root}/rewrites.jsonl`, `{root}/training.jsonl` — plain append logs.
pub struct JsonlLogStore {
    root: PathBuf,
    /// Serialises writers within this process; cross-process callers rely on
    /// O_APPEND line atomicity for short records.
    write_lock: Mutex<()>,
}

impl JsonlLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn session_events_path(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id).join("events.jsonl")
    }

    fn append_line<T: Serialize>(&self, path: &Path, record: &T) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn read_lines<T: for<'de> Deserialize<'de>>(&self, path: &Path) -> Result<Vec<T>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("skipping malformed line in {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }

    fn latest_signals(&self) -> Result<Vec<SignalRecord>, StoreError> {
        let versions: Vec<SignalRecord> = self.read_lines(&self.root.join("signals.jsonl"))?;
        let mut latest: HashMap<String, SignalRecord> = HashMap::new();
        let mut order = Vec::new();
        for record in versions {
            if !latest.contains_key(&record.signal_id) {
                order.push(record.signal_id.clone());
            }
            latest.insert(record.signal_id.clone(), record);
        }
        Ok(order.into_iter().filter_map(|id| latest.remove(&id)).collect())
    }
}

#[async_trait]
impl LogStore for JsonlLogStore {
    async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        self.append_line(&self.session_events_path(&event.session_id), event)
    }

    async fn events_for_session(&self, session_id: &str) -> Result<Vec<Event>, StoreError> {
        self.read_lines(&self.session_events_path(session_id))
    }

    async fn events_for_cascade(&self, cascade_id: &str) -> Result<Vec<Event>, StoreError> {
        let mut all = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let events: Vec<Event> = self.read_lines(&entry.path().join("events.jsonl"))?;
            all.extend(events.into_iter().filter(|e| {
                e.payload.get("cascade_id").and_then(Value::as_str) == Some(cascade_id)
            }));
        }
        all.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
        Ok(all)
    }

    async fn put_signal(&self, record: &SignalRecord) -> Result<(), StoreError> {
        self.append_line(&self.root.join("signals.jsonl"), record)
    }

    async fn signal(&self, signal_id: &str) -> Result<Option<SignalRecord>, StoreError> {
        Ok(self
            .latest_signals()?
            .into_iter()
            .find(|r| r.signal_id == signal_id))
    }

    async fn signals(&self, name: Option<&str>) -> Result<Vec<SignalRecord>, StoreError> {
        Ok(self
            .latest_signals()?
            .into_iter()
            .filter(|r| name.map(|n| r.signal_name == n).unwrap_or(true))
            .collect())
    }

    async fn append_winning_rewrite(&self, rewrite: &WinningRewrite) -> Result<(), StoreError> {
        self.append_line(&self.root.join("rewrites.jsonl"), rewrite)
    }

    async fn winning_rewrites(
        &self,
        species_hash: &str,
        limit: usize,
    ) -> Result<Vec<WinningRewrite>, StoreError> {
        let all: Vec<WinningRewrite> = self.read_lines(&self.root.join("rewrites.jsonl"))?;
        Ok(all
            .into_iter()
            .rev()
            .filter(|r| r.species_hash == species_hash)
            .take(limit)
            .collect())
    }

    async fn append_training_annotation(
        &self,
        annotation: &TrainingAnnotation,
    ) -> Result<(), StoreError> {
        self.append_line(&self.root.join("training.jsonl"), annotation)
    }

    async fn training_annotations(
        &self,
        cascade_id: &str,
        cell_name: &str,
    ) -> Result<Vec<TrainingAnnotation>, StoreError> {
        let all: Vec<TrainingAnnotation> = self.read_lines(&self.root.join("training.jsonl"))?;
        Ok(all
            .into_iter()
            .filter(|a| a.cascade_id == cascade_id && a.cell_name == cell_name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lars::event::{Event, EventKind};
    use serde_json::json;

    fn sample_event(session: &str, seq: u64) -> Event {
        Event {
            session_id: session.to_string(),
            trace_id: "t1".to_string(),
            seq,
            timestamp: Utc::now(),
            kind: EventKind::CellStart,
            payload: json!({"cascade_id": "demo"}),
        }
    }

    #[tokio::test]
    async fn memory_store_round_trips_events() {
        let store = MemoryLogStore::new();
        store.append_event(&sample_event("s1", 0)).await.unwrap();
        store.append_event(&sample_event("s2", 0)).await.unwrap();
        store.append_event(&sample_event("s1", 1)).await.unwrap();

        let events = store.events_for_session("s1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].seq, 1);

        let by_cascade = store.events_for_cascade("demo").await.unwrap();
        assert_eq!(by_cascade.len(), 3);
    }

    #[tokio::test]
    async fn jsonl_store_latest_signal_version_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlLogStore::new(dir.path()).unwrap();

        let mut record = SignalRecord {
            signal_id: "sig-1".to_string(),
            signal_name: "data_ready".to_string(),
            session_id: "s1".to_string(),
            cascade_id: "demo".to_string(),
            cell_name: "waiter".to_string(),
            status: SignalStatus::Waiting,
            payload: None,
            created_at: Utc::now(),
            timeout_at: Utc::now(),
            cancel_reason: None,
        };
        store.put_signal(&record).await.unwrap();
        record.status = SignalStatus::Fired;
        record.payload = Some(json!({"rows": 10}));
        store.put_signal(&record).await.unwrap();

        let read = store.signal("sig-1").await.unwrap().unwrap();
        assert_eq!(read.status, SignalStatus::Fired);
        assert_eq!(read.payload, Some(json!({"rows": 10})));
        assert_eq!(store.signals(Some("data_ready")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn winning_rewrites_are_scoped_by_species_hash() {
        let store = MemoryLogStore::new();
        for (hash, text) in [("h1", "a"), ("h2", "b"), ("h1", "c")].iter() {
            store
                .append_winning_rewrite(&WinningRewrite {
                    species_hash: hash.to_string(),
                    cascade_id: "demo".to_string(),
                    cell_name: "write".to_string(),
                    instructions: text.to_string(),
                    winner_index: 0,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let h1 = store.winning_rewrites("h1", 5).await.unwrap();
        assert_eq!(h1.len(), 2);
        assert_eq!(h1[0].instructions, "c");
        assert!(h1.iter().all(|r| r.species_hash == "h1"));
    }
}
