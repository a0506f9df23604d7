//! Signals: named, durable cross-run rendezvous.
//!
//! A signal waiter is a record in the log store, not an in-memory object —
//! two cascades in different processes can rendezvous as long as they share
//! a store. Within one process, [`SignalHub`] adds a direct wake path so a
//! fire lands in well under the poll interval.
//!
//! Semantics:
//! - `fire` atomically transitions every record still `Waiting` under the
//!   name and attaches the payload; a fire with no waiters is a no-op
//!   (fire-and-forget, no buffering).
//! - A waiter that transitioned to `Timeout` never accepts a later fire.
//! - A periodic sweeper enforces timeouts for waiters whose process died;
//!   [`SignalHub::recovery_sweep`] runs the same pass at startup.
//!
//! The signal operations are exposed to agents as traits: `await_signal`,
//! `fire_signal`, `list_signals`, `cancel_signal`.

use crate::lars::config::parse_duration;
use crate::lars::event::{EventBus, EventKind};
use crate::lars::store::{LogStore, SignalRecord, SignalStatus, StoreError};
use crate::lars::trait_registry::{
    TraitContext, TraitError, TraitHandler, TraitMetadata, TraitOutcome, TraitRegistry,
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Caller identity attached to a waiter record.
#[derive(Debug, Clone)]
pub struct WaiterMeta {
    pub session_id: String,
    pub cascade_id: String,
    pub cell_name: String,
}

/// What `await_signal` resolves to.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalWaitResult {
    /// `"fired"` or `"timeout"`.
    pub status: String,
    pub payload: Option<Value>,
}

/// In-process coordinator over the durable signal records.
pub struct SignalHub {
    store: Arc<dyn LogStore>,
    bus: Arc<EventBus>,
    poll_interval: Duration,
    wakers: Mutex<HashMap<String, Arc<Notify>>>,
}

impl SignalHub {
    pub fn new(store: Arc<dyn LogStore>, bus: Arc<EventBus>, poll_interval: Duration) -> Self {
        Self {
            store,
            bus,
            poll_interval,
            wakers: Mutex::new(HashMap::new()),
        }
    }

    fn waker(&self, name: &str) -> Arc<Notify> {
        let mut wakers = self.wakers.lock().unwrap();
        wakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Register a waiter and block until it fires or times out.
    pub async fn await_signal(
        &self,
        name: &str,
        timeout: Duration,
        meta: WaiterMeta,
    ) -> Result<SignalWaitResult, StoreError> {
        let now = Utc::now();
        let record = SignalRecord {
            signal_id: Uuid::new_v4().to_string(),
            signal_name: name.to_string(),
            session_id: meta.session_id.clone(),
            cascade_id: meta.cascade_id.clone(),
            cell_name: meta.cell_name.clone(),
            status: SignalStatus::Waiting,
            payload: None,
            created_at: now,
            timeout_at: now
                + ChronoDuration::from_std(timeout).unwrap_or_else(|_| ChronoDuration::seconds(60)),
            cancel_reason: None,
        };
        self.store.put_signal(&record).await?;
        self.bus
            .publish(
                &meta.session_id,
                &record.signal_id,
                EventKind::SignalWait,
                json!({
                    "cascade_id": meta.cascade_id,
                    "cell": meta.cell_name,
                    "signal": name,
                    "signal_id": record.signal_id,
                    "timeout_at": record.timeout_at,
                }),
            )
            .await;

        let notify = self.waker(name);
        loop {
            if let Some(current) = self.store.signal(&record.signal_id).await? {
                match current.status {
                    SignalStatus::Fired => {
                        return Ok(SignalWaitResult {
                            status: "fired".to_string(),
                            payload: current.payload,
                        });
                    }
                    SignalStatus::Timeout | SignalStatus::Cancelled => {
                        return Ok(SignalWaitResult {
                            status: "timeout".to_string(),
                            payload: None,
                        });
                    }
                    SignalStatus::Waiting => {}
                }
            }
            if Utc::now() >= record.timeout_at {
                self.transition_to_timeout(&record.signal_id).await?;
                return Ok(SignalWaitResult {
                    status: "timeout".to_string(),
                    payload: None,
                });
            }
            // Sleep until a same-process fire wakes us, or one poll interval.
            let _ = tokio::time::timeout(self.poll_interval, notify.notified()).await;
        }
    }

    async fn transition_to_timeout(&self, signal_id: &str) -> Result<(), StoreError> {
        if let Some(mut current) = self.store.signal(signal_id).await? {
            if current.status == SignalStatus::Waiting {
                current.status = SignalStatus::Timeout;
                self.store.put_signal(&current).await?;
                self.bus
                    .publish(
                        &current.session_id,
                        &current.signal_id,
                        EventKind::SignalTimeout,
                        json!({
                            "cascade_id": current.cascade_id,
                            "cell": current.cell_name,
                            "signal": current.signal_name,
                            "signal_id": current.signal_id,
                        }),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Fire every current waiter of `name`. Returns the number fired; zero
    /// waiters is a no-op.
    pub async fn fire(&self, name: &str, payload: Option<Value>) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut fired = 0usize;
        for mut record in self.store.signals(Some(name)).await? {
            if record.status != SignalStatus::Waiting || record.timeout_at <= now {
                continue;
            }
            record.status = SignalStatus::Fired;
            record.payload = payload.clone();
            self.store.put_signal(&record).await?;
            self.bus
                .publish(
                    &record.session_id,
                    &record.signal_id,
                    EventKind::SignalFire,
                    json!({
                        "cascade_id": record.cascade_id,
                        "cell": record.cell_name,
                        "signal": name,
                        "signal_id": record.signal_id,
                    }),
                )
                .await;
            fired += 1;
        }
        if fired > 0 {
            self.waker(name).notify_waiters();
        }
        Ok(fired)
    }

    pub async fn list(&self, name: Option<&str>) -> Result<Vec<SignalRecord>, StoreError> {
        self.store.signals(name).await
    }

    /// Administratively cancel a waiting record. Returns whether a record
    /// transitioned.
    pub async fn cancel(&self, signal_id: &str, reason: Option<&str>) -> Result<bool, StoreError> {
        if let Some(mut record) = self.store.signal(signal_id).await? {
            if record.status == SignalStatus::Waiting {
                record.status = SignalStatus::Cancelled;
                record.cancel_reason = reason.map(|r| r.to_string());
                self.store.put_signal(&record).await?;
                self.waker(&record.signal_name).notify_waiters();
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Transition every expired `Waiting` record to `Timeout`. Returns how
    /// many were swept.
    pub async fn sweep_timeouts(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut swept = 0usize;
        for record in self.store.signals(None).await? {
            if record.status == SignalStatus::Waiting && record.timeout_at <= now {
                self.transition_to_timeout(&record.signal_id).await?;
                swept += 1;
            }
        }
        Ok(swept)
    }

    /// Startup pass over records left `Waiting` by a crashed process.
    pub async fn recovery_sweep(&self) -> Result<usize, StoreError> {
        let swept = self.sweep_timeouts().await?;
        if swept > 0 {
            log::info!("signal recovery sweep timed out {} stale waiters", swept);
        }
        Ok(swept)
    }

    /// Spawn the periodic timeout sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = hub.sweep_timeouts().await {
                    log::warn!("signal sweeper pass failed: {}", e);
                }
            }
        })
    }
}

fn meta_from_ctx(ctx: &TraitContext) -> WaiterMeta {
    WaiterMeta {
        session_id: ctx.session_id.clone(),
        cascade_id: ctx.cascade_id.clone(),
        cell_name: ctx.cell_name.clone().unwrap_or_default(),
    }
}

struct AwaitSignalTrait {
    hub: Arc<SignalHub>,
}

#[async_trait]
impl TraitHandler for AwaitSignalTrait {
    fn metadata(&self) -> TraitMetadata {
        TraitMetadata::new(
            "await_signal",
            "Wait for a named signal to fire, up to a timeout.",
        )
        .with_args_schema(json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "timeout": {"type": "string", "description": "e.g. \"60s\", \"5m\""},
                "description": {"type": "string"},
            },
            "required": ["name"],
        }))
        .with_returns("{status: \"fired\"|\"timeout\", payload?}")
    }

    async fn execute(&self, args: Value, ctx: &TraitContext) -> Result<TraitOutcome, TraitError> {
        let name = args
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| TraitError::InvalidArguments("name is required".to_string()))?;
        let timeout = args
            .get("timeout")
            .and_then(Value::as_str)
            .and_then(parse_duration)
            .unwrap_or_else(|| Duration::from_secs(60));
        let result = self
            .hub
            .await_signal(name, timeout, meta_from_ctx(ctx))
            .await
            .map_err(|e| TraitError::ExecutionFailed(e.to_string()))?;
        Ok(TraitOutcome::of(json!({
            "status": result.status,
            "payload": result.payload,
        })))
    }
}

struct FireSignalTrait {
    hub: Arc<SignalHub>,
}

#[async_trait]
impl TraitHandler for FireSignalTrait {
    fn metadata(&self) -> TraitMetadata {
        TraitMetadata::new(
            "fire_signal",
            "Fire a named signal, releasing every current waiter.",
        )
        .with_args_schema(json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "payload": {},
            },
            "required": ["name"],
        }))
        .with_returns("{fired_count: N}")
    }

    async fn execute(&self, args: Value, _ctx: &TraitContext) -> Result<TraitOutcome, TraitError> {
        let name = args
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| TraitError::InvalidArguments("name is required".to_string()))?;
        let payload = args.get("payload").cloned().filter(|p| !p.is_null());
        let fired = self
            .hub
            .fire(name, payload)
            .await
            .map_err(|e| TraitError::ExecutionFailed(e.to_string()))?;
        Ok(TraitOutcome::of(json!({"fired_count": fired})))
    }
}

struct ListSignalsTrait {
    hub: Arc<SignalHub>,
}

#[async_trait]
impl TraitHandler for ListSignalsTrait {
    fn metadata(&self) -> TraitMetadata {
        TraitMetadata::new("list_signals", "List signal records, optionally by name.")
            .with_args_schema(json!({
                "type": "object",
                "properties": {"name": {"type": "string"}},
            }))
    }

    async fn execute(&self, args: Value, _ctx: &TraitContext) -> Result<TraitOutcome, TraitError> {
        let name = args.get("name").and_then(Value::as_str);
        let records = self
            .hub
            .list(name)
            .await
            .map_err(|e| TraitError::ExecutionFailed(e.to_string()))?;
        let value =
            serde_json::to_value(records).map_err(|e| TraitError::ExecutionFailed(e.to_string()))?;
        Ok(TraitOutcome::of(value))
    }
}

struct CancelSignalTrait {
    hub: Arc<SignalHub>,
}

#[async_trait]
impl TraitHandler for CancelSignalTrait {
    fn metadata(&self) -> TraitMetadata {
        TraitMetadata::new("cancel_signal", "Administratively cancel a waiting signal.")
            .with_args_schema(json!({
                "type": "object",
                "properties": {
                    "signal_id": {"type": "string"},
                    "reason": {"type": "string"},
                },
                "required": ["signal_id"],
            }))
    }

    async fn execute(&self, args: Value, _ctx: &TraitContext) -> Result<TraitOutcome, TraitError> {
        let signal_id = args
            .get("signal_id")
            .and_then(Value::as_str)
            .ok_or_else(|| TraitError::InvalidArguments("signal_id is required".to_string()))?;
        let reason = args.get("reason").and_then(Value::as_str);
        let cancelled = self
            .hub
            .cancel(signal_id, reason)
            .await
            .map_err(|e| TraitError::ExecutionFailed(e.to_string()))?;
        Ok(TraitOutcome::of(json!({"cancelled": cancelled})))
    }
}

/// Register the four signal traits against a shared hub.
pub fn register_signal_traits(registry: &mut TraitRegistry, hub: &Arc<SignalHub>) {
    registry.register(Arc::new(AwaitSignalTrait { hub: hub.clone() }));
    registry.register(Arc::new(FireSignalTrait { hub: hub.clone() }));
    registry.register(Arc::new(ListSignalsTrait { hub: hub.clone() }));
    registry.register(Arc::new(CancelSignalTrait { hub: hub.clone() }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lars::store::MemoryLogStore;

    fn hub() -> Arc<SignalHub> {
        let store: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
        let bus = Arc::new(EventBus::new(store.clone(), 64));
        Arc::new(SignalHub::new(store, bus, Duration::from_millis(20)))
    }

    fn meta(session: &str) -> WaiterMeta {
        WaiterMeta {
            session_id: session.to_string(),
            cascade_id: "demo".to_string(),
            cell_name: "waiter".to_string(),
        }
    }

    #[tokio::test]
    async fn fire_releases_waiter_with_payload() {
        let hub = hub();
        let waiter_hub = hub.clone();
        let waiter = tokio::spawn(async move {
            waiter_hub
                .await_signal("data_ready", Duration::from_secs(60), meta("session-a"))
                .await
                .unwrap()
        });
        // Give the waiter time to register its record.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fired = hub
            .fire("data_ready", Some(json!({"rows": 10})))
            .await
            .unwrap();
        assert_eq!(fired, 1);

        let result = tokio::time::timeout(Duration::from_millis(1500), waiter)
            .await
            .expect("waiter did not settle in time")
            .unwrap();
        assert_eq!(result.status, "fired");
        assert_eq!(result.payload, Some(json!({"rows": 10})));
    }

    #[tokio::test]
    async fn wait_times_out_within_bound() {
        let hub = hub();
        let result = hub
            .await_signal("never", Duration::from_millis(80), meta("session-a"))
            .await
            .unwrap();
        assert_eq!(result.status, "timeout");
        assert!(result.payload.is_none());
    }

    #[tokio::test]
    async fn fire_with_no_waiters_is_a_noop() {
        let hub = hub();
        assert_eq!(hub.fire("nobody_home", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn timed_out_waiter_rejects_later_fire() {
        let hub = hub();
        let result = hub
            .await_signal("slow", Duration::from_millis(40), meta("session-a"))
            .await
            .unwrap();
        assert_eq!(result.status, "timeout");
        // The record is Timeout now; a later fire finds no waiters.
        assert_eq!(hub.fire("slow", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweeper_times_out_stale_waiters() {
        let hub = hub();
        let now = Utc::now();
        let record = SignalRecord {
            signal_id: "stale-1".to_string(),
            signal_name: "stale".to_string(),
            session_id: "dead-session".to_string(),
            cascade_id: "demo".to_string(),
            cell_name: "waiter".to_string(),
            status: SignalStatus::Waiting,
            payload: None,
            created_at: now - ChronoDuration::minutes(10),
            timeout_at: now - ChronoDuration::minutes(5),
            cancel_reason: None,
        };
        hub.store.put_signal(&record).await.unwrap();

        assert_eq!(hub.recovery_sweep().await.unwrap(), 1);
        let swept = hub.store.signal("stale-1").await.unwrap().unwrap();
        assert_eq!(swept.status, SignalStatus::Timeout);
    }
}
