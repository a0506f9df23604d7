//! The cascade driver: loads a library of cascades and runs them.
//!
//! [`CascadeEngine`] owns the shared machinery of a process — config, LLM
//! transport, trait registry, event bus, signal hub, log store — and a
//! library of validated cascades. Each [`CascadeEngine::run`] call executes
//! one cascade to a terminal [`RunReport`]: the structured envelope
//! (`status`, `lineage`, `state`, `outputs`, `history`, `errors`, `cost`)
//! that is returned even on failure so callers inspect rather than
//! exception-handle.
//!
//! The driver also owns:
//! - cell sequencing and routing, bounded by `max_cell_iterations`;
//! - fire-and-forget `async_cascades` child launches;
//! - synchronous sub-cascades (library cascades with an `inputs_schema` are
//!   registered as callable traits, with `context_in`/`context_out` state
//!   merges and a nesting depth cap);
//! - cascade-level candidates: N full copies of the cascade in parallel,
//!   reduced by the same evaluator/aggregator machinery as cell candidates;
//! - the optional per-run wall-clock cap, which cancels the active cell at
//!   its next suspension point.
//!
//! # Example
//!
//! ```rust,no_run
//! use lars::lars::cascade::Cascade;
//! use lars::lars::driver::{CascadeEngine, RunOptions};
//! use lars::lars::store::MemoryLogStore;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo(transport: Arc<dyn lars::lars::transport::ChatTransport>) {
//! let cascade = Cascade::from_yaml("cascade_id: demo\ncells:\n  - name: a\n    instructions: hi\n").unwrap();
//! let engine = CascadeEngine::builder(transport, Arc::new(MemoryLogStore::new()))
//!     .with_cascade(cascade)
//!     .build()
//!     .unwrap();
//! let report = engine.run("demo", json!({}), RunOptions::default()).await.unwrap();
//! println!("{:?}: {}", report.status, report.output);
//! # }
//! ```

use crate::lars::builtins::register_builtins;
use crate::lars::candidates;
use crate::lars::cascade::{AsyncTrigger, Cascade, CandidatesSpec, Cell, InputError, SelectionMode};
use crate::lars::config::EngineConfig;
use crate::lars::echo::{CellStatus, Echo, LineageEntry, RunError, RunErrorKind};
use crate::lars::event::{EventBus, EventKind};
use crate::lars::runner::{self, CellOutcome, RunCtx};
use crate::lars::signals::SignalHub;
use crate::lars::store::LogStore;
use crate::lars::trace::{TraceKind, TraceStatus, TraceTree};
use crate::lars::trait_registry::{
    TraitContext, TraitError, TraitHandler, TraitMetadata, TraitOutcome, TraitRegistry,
};
use crate::lars::transport::{ChatMessage, ChatTransport};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Terminal status of a cascade run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
    Cancelled,
}

/// The structured envelope every run resolves to, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub session_id: String,
    pub cascade_id: String,
    /// Root trace node of the run.
    pub trace_id: String,
    pub lineage: Vec<LineageEntry>,
    pub state: Map<String, Value>,
    pub outputs: Map<String, Value>,
    pub history: Vec<ChatMessage>,
    pub errors: Vec<RunError>,
    pub cost_usd: f64,
    /// The final output: the last completed cell's committed value.
    pub output: Value,
}

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stable session identity; a fresh UUID when absent.
    pub session_id: Option<String>,
    /// Identity the run is performed on behalf of.
    pub caller_id: Option<String>,
    /// Wall-clock cap for the whole run.
    pub timeout: Option<Duration>,
}

/// Builder for a [`CascadeEngine`].
pub struct CascadeEngineBuilder {
    config: EngineConfig,
    transport: Arc<dyn ChatTransport>,
    store: Arc<dyn LogStore>,
    cascades: Vec<Cascade>,
    extra_traits: Vec<Arc<dyn TraitHandler>>,
}

impl CascadeEngineBuilder {
    pub fn new(transport: Arc<dyn ChatTransport>, store: Arc<dyn LogStore>) -> Self {
        Self {
            config: EngineConfig::default(),
            transport,
            store,
            cascades: Vec::new(),
            extra_traits: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a cascade to the library. Cascades with an `inputs_schema` also
    /// become callable traits.
    pub fn with_cascade(mut self, cascade: Cascade) -> Self {
        self.cascades.push(cascade);
        self
    }

    /// Register a user trait.
    pub fn with_trait(mut self, handler: Arc<dyn TraitHandler>) -> Self {
        self.extra_traits.push(handler);
        self
    }

    /// Validate the library and assemble the engine. The registry is sealed
    /// here; traits cannot be added after construction.
    pub fn build(self) -> Result<Arc<CascadeEngine>, InputError> {
        let CascadeEngineBuilder {
            config,
            transport,
            store,
            cascades,
            extra_traits,
        } = self;

        let mut library = HashMap::new();
        for cascade in cascades {
            cascade.validate()?;
            let id = cascade.cascade_id.clone();
            if library.insert(id.clone(), cascade).is_some() {
                return Err(InputError::Invalid(format!("duplicate cascade_id '{}'", id)));
            }
        }

        let config = Arc::new(config);
        let bus = Arc::new(EventBus::new(store.clone(), config.event_buffer));
        let signals = Arc::new(SignalHub::new(
            store.clone(),
            bus.clone(),
            config.signal_poll_interval,
        ));

        let engine = Arc::new_cyclic(|weak: &Weak<CascadeEngine>| {
            let mut registry = TraitRegistry::new();
            register_builtins(&mut registry, &signals);
            for handler in extra_traits {
                registry.register(handler);
            }
            for (id, cascade) in &library {
                if let Some(inputs_schema) = &cascade.inputs_schema {
                    registry.register(Arc::new(CascadeTrait {
                        engine: weak.clone(),
                        cascade_id: id.clone(),
                        description: cascade.description.clone().unwrap_or_default(),
                        inputs_schema: inputs_schema.clone(),
                    }));
                }
            }
            CascadeEngine {
                config: config.clone(),
                transport: transport.clone(),
                store: store.clone(),
                bus: bus.clone(),
                signals: signals.clone(),
                registry: Arc::new(registry),
                library: library.clone(),
            }
        });
        Ok(engine)
    }
}

/// The engine: shared machinery plus a library of validated cascades.
pub struct CascadeEngine {
    config: Arc<EngineConfig>,
    transport: Arc<dyn ChatTransport>,
    store: Arc<dyn LogStore>,
    bus: Arc<EventBus>,
    signals: Arc<SignalHub>,
    registry: Arc<TraitRegistry>,
    library: HashMap<String, Cascade>,
}

impl CascadeEngine {
    pub fn builder(
        transport: Arc<dyn ChatTransport>,
        store: Arc<dyn LogStore>,
    ) -> CascadeEngineBuilder {
        CascadeEngineBuilder::new(transport, store)
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn signals(&self) -> &Arc<SignalHub> {
        &self.signals
    }

    pub fn registry(&self) -> &Arc<TraitRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cascade(&self, cascade_id: &str) -> Option<&Cascade> {
        self.library.get(cascade_id)
    }

    /// Run startup recovery (stale signal waiters) and spawn the periodic
    /// signal sweeper. Optional; `run` works without it.
    pub async fn start(self: &Arc<Self>) {
        if let Err(e) = self.signals.recovery_sweep().await {
            log::warn!("signal recovery sweep failed: {}", e);
        }
        let sweep_every = self.config.signal_poll_interval.max(Duration::from_millis(500));
        self.signals.spawn_sweeper(sweep_every * 4);
    }

    /// Run a cascade to completion.
    ///
    /// Returns `Err(InputError)` synchronously when the cascade is unknown
    /// or the input violates its `inputs_schema` — no run is started. Every
    /// other failure mode lands inside the returned [`RunReport`].
    pub async fn run(
        self: &Arc<Self>,
        cascade_id: &str,
        input: Value,
        options: RunOptions,
    ) -> Result<RunReport, InputError> {
        let cascade = self
            .library
            .get(cascade_id)
            .ok_or_else(|| InputError::Invalid(format!("unknown cascade '{}'", cascade_id)))?;
        cascade.check_input(&input)?;

        let session_id = options
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(spec) = cascade.candidates.clone() {
            return Ok(self
                .run_cascade_candidates(cascade_id, spec, input, session_id, options)
                .await);
        }

        let echo = Echo::new(session_id, input);
        let trace = Arc::new(TraceTree::new());
        Ok(self
            .run_cascade_boxed(
                cascade_id.to_string(),
                echo,
                options.caller_id,
                options.timeout,
                None,
                trace,
            )
            .await)
    }

    /// Boxed recursion point shared by top-level runs, sub-cascade traits,
    /// and async child launches.
    pub(crate) fn run_cascade_boxed(
        self: &Arc<Self>,
        cascade_id: String,
        echo: Echo,
        caller_id: Option<String>,
        timeout: Option<Duration>,
        parent_trace: Option<String>,
        trace: Arc<TraceTree>,
    ) -> BoxFuture<'static, RunReport> {
        let engine = self.clone();
        async move {
            engine
                .run_cascade_inner(cascade_id, echo, caller_id, timeout, parent_trace, trace)
                .await
        }
        .boxed()
    }

    async fn run_cascade_inner(
        self: Arc<Self>,
        cascade_id: String,
        mut echo: Echo,
        caller_id: Option<String>,
        timeout: Option<Duration>,
        parent_trace: Option<String>,
        trace: Arc<TraceTree>,
    ) -> RunReport {
        let cascade = match self.library.get(&cascade_id) {
            Some(cascade) => cascade.clone(),
            None => {
                let error = RunError::new(
                    RunErrorKind::InputError,
                    None,
                    format!("unknown cascade '{}'", cascade_id),
                );
                echo.push_error(error);
                return build_report(RunStatus::Error, &cascade_id, String::new(), echo);
            }
        };

        let root_kind = if echo.depth > 0 {
            TraceKind::SubCascade
        } else {
            TraceKind::Cascade
        };
        let cascade_trace = trace.begin(root_kind, &cascade_id, parent_trace.as_deref(), echo.depth);
        echo.trace_id = cascade_trace.clone();
        echo.parent_trace_id = parent_trace.clone();

        let ctx = RunCtx {
            config: self.config.clone(),
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            bus: self.bus.clone(),
            trace: trace.clone(),
            store: self.store.clone(),
            cascade_id: cascade_id.clone(),
            caller_id: caller_id.clone(),
        };
        self.bus
            .publish(
                &echo.session_id,
                &cascade_trace,
                EventKind::CascadeStart,
                json!({
                    "cascade_id": cascade_id,
                    "session_id": echo.session_id,
                    "input": echo.input,
                    "caller_id": caller_id,
                    "parent_trace_id": parent_trace,
                }),
            )
            .await;

        let index: HashMap<&str, usize> = cascade
            .cells
            .iter()
            .enumerate()
            .map(|(i, cell)| (cell.name.as_str(), i))
            .collect();
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut position = 0usize;
        let mut iterations = 0usize;
        let mut status = RunStatus::Success;

        while position < cascade.cells.len() {
            iterations += 1;
            if iterations > self.config.max_cell_iterations {
                echo.push_error(RunError::new(
                    RunErrorKind::LoopBoundExceeded,
                    None,
                    format!(
                        "exceeded {} cell iterations; aborting",
                        self.config.max_cell_iterations
                    ),
                ));
                status = RunStatus::Error;
                break;
            }
            let cell = &cascade.cells[position];
            self.fire_async_children(cell, AsyncTrigger::OnStart, &echo);

            let outcome = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        None
                    } else {
                        tokio::time::timeout(
                            remaining,
                            runner::run_cell(&ctx, cell, &mut echo, &cascade_trace),
                        )
                        .await
                        .ok()
                    }
                }
                None => Some(runner::run_cell(&ctx, cell, &mut echo, &cascade_trace).await),
            };
            let outcome = match outcome {
                Some(outcome) => outcome,
                None => {
                    echo.push_error(RunError::new(
                        RunErrorKind::CascadeTimeout,
                        Some(&cell.name),
                        "cascade wall-clock cap reached",
                    ));
                    trace.cancel_open_nodes();
                    self.bus
                        .publish(
                            &echo.session_id,
                            &cascade_trace,
                            EventKind::CascadeError,
                            json!({"cascade_id": cascade_id, "error": "cascade_timeout", "cell": cell.name}),
                        )
                        .await;
                    status = RunStatus::Cancelled;
                    break;
                }
            };

            match outcome {
                CellOutcome::Completed { route } => {
                    self.fire_async_children(cell, AsyncTrigger::OnComplete, &echo);
                    match advance(&index, position, route) {
                        Ok(next) => position = next,
                        Err(mut error) => {
                            error.cell = Some(cell.name.clone());
                            echo.push_error(error);
                            status = RunStatus::Error;
                            break;
                        }
                    }
                }
                CellOutcome::Failed(_) => {
                    let recovered = match (&cell.on_error, cell.is_deterministic()) {
                        (Some(on_error), true) => {
                            let last_error = echo
                                .errors
                                .last()
                                .map(|e| e.to_string())
                                .unwrap_or_else(|| "unknown error".to_string());
                            echo.set_state("last_error", json!(last_error));
                            let recovery = (**on_error).clone();
                            match runner::run_cell(&ctx, &recovery, &mut echo, &cascade_trace).await
                            {
                                CellOutcome::Completed { route } => Some(route),
                                _ => None,
                            }
                        }
                        _ => None,
                    };
                    match recovered {
                        Some(route) => match advance(&index, position, route) {
                            Ok(next) => position = next,
                            Err(mut error) => {
                                error.cell = Some(cell.name.clone());
                                echo.push_error(error);
                                status = RunStatus::Error;
                                break;
                            }
                        },
                        None => {
                            status = RunStatus::Error;
                            break;
                        }
                    }
                }
                CellOutcome::AbortedByWard { .. } => {
                    status = RunStatus::Error;
                    break;
                }
            }
        }

        match status {
            RunStatus::Success => {
                self.bus
                    .publish(
                        &echo.session_id,
                        &cascade_trace,
                        EventKind::CascadeComplete,
                        json!({
                            "cascade_id": cascade_id,
                            "session_id": echo.session_id,
                            "status": "success",
                            "state": Value::Object(echo.state.clone()),
                            "lineage": echo.lineage,
                            "cost_usd": echo.total_cost(),
                            "images": collect_images(&echo.outputs),
                        }),
                    )
                    .await;
                trace.end(&cascade_trace, TraceStatus::Ok);
            }
            RunStatus::Error => {
                let last_error = echo.errors.last().map(|e| e.to_string());
                self.bus
                    .publish(
                        &echo.session_id,
                        &cascade_trace,
                        EventKind::CascadeError,
                        json!({
                            "cascade_id": cascade_id,
                            "session_id": echo.session_id,
                            "error": last_error,
                        }),
                    )
                    .await;
                trace.end(&cascade_trace, TraceStatus::Error);
            }
            RunStatus::Cancelled => {
                trace.end(&cascade_trace, TraceStatus::Cancelled);
            }
        }

        build_report(status, &cascade_id, cascade_trace, echo)
    }

    /// Launch declared fire-and-forget children for the given trigger.
    /// Failures are logged and never affect the parent.
    fn fire_async_children(self: &Arc<Self>, cell: &Cell, trigger: AsyncTrigger, echo: &Echo) {
        for spec in &cell.async_cascades {
            if spec.trigger != trigger {
                continue;
            }
            if !self.library.contains_key(&spec.cascade_id) {
                log::warn!(
                    "async cascade '{}' referenced by cell '{}' is not in the library",
                    spec.cascade_id,
                    cell.name
                );
                continue;
            }
            let engine = self.clone();
            let child_id = spec.cascade_id.clone();
            let parent_trace = Some(echo.trace_id.clone());
            let input = json!({
                "parent_session_id": echo.session_id,
                "parent_cell": cell.name,
                "state": Value::Object(echo.state.clone()),
            });
            tokio::spawn(async move {
                let child_echo = Echo::new(Uuid::new_v4().to_string(), input);
                let trace = Arc::new(TraceTree::new());
                let report = engine
                    .run_cascade_boxed(child_id.clone(), child_echo, None, None, parent_trace, trace)
                    .await;
                if report.status != RunStatus::Success {
                    log::warn!(
                        "async cascade '{}' finished with {:?}: {:?}",
                        child_id,
                        report.status,
                        report.errors.last().map(|e| e.to_string()),
                    );
                }
            });
        }
    }

    /// Cascade-level candidates: run the whole cascade N ways, then select
    /// or aggregate the final outputs.
    async fn run_cascade_candidates(
        self: &Arc<Self>,
        cascade_id: &str,
        spec: CandidatesSpec,
        input: Value,
        session_id: String,
        options: RunOptions,
    ) -> RunReport {
        let mut handles = Vec::with_capacity(spec.factor);
        for i in 0..spec.factor {
            let engine = self.clone();
            let cascade_id = cascade_id.to_string();
            let input = input.clone();
            let caller_id = options.caller_id.clone();
            let timeout = options.timeout;
            let branch_session = format!("{}-c{}", session_id, i);
            handles.push(tokio::spawn(async move {
                let echo = Echo::new(branch_session, input);
                let trace = Arc::new(TraceTree::new());
                engine
                    .run_cascade_boxed(cascade_id, echo, caller_id, timeout, None, trace)
                    .await
            }));
        }
        let mut reports = Vec::with_capacity(spec.factor);
        for handle in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => log::warn!("cascade candidate task failed to join: {}", e),
            }
        }

        let successes: Vec<usize> = reports
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == RunStatus::Success)
            .map(|(i, _)| i)
            .collect();
        if successes.is_empty() {
            return match reports.into_iter().next() {
                Some(report) => report,
                None => {
                    let mut echo = Echo::new(session_id, Value::Null);
                    echo.push_error(RunError::new(
                        RunErrorKind::CellError,
                        None,
                        "all cascade candidate branches failed to join",
                    ));
                    build_report(RunStatus::Error, cascade_id, String::new(), echo)
                }
            };
        }
        if successes.len() == 1 || spec.factor == 1 {
            return reports.swap_remove(successes[0]);
        }

        let texts: Vec<String> = successes
            .iter()
            .map(|&i| value_to_text(&reports[i].output))
            .collect();
        let ctx = RunCtx {
            config: self.config.clone(),
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            bus: self.bus.clone(),
            trace: Arc::new(TraceTree::new()),
            store: self.store.clone(),
            cascade_id: cascade_id.to_string(),
            caller_id: options.caller_id.clone(),
        };

        match spec.mode {
            SelectionMode::All => {
                let outputs: Vec<Value> =
                    successes.iter().map(|&i| reports[i].output.clone()).collect();
                let mut report = reports.swap_remove(successes[0]);
                report.output = Value::Array(outputs);
                report
            }
            SelectionMode::Aggregate => {
                let (combined, _usage) = candidates::aggregate_outputs(
                    &ctx,
                    &session_id,
                    spec.aggregator_instructions.as_deref(),
                    &texts,
                    self.transport.default_model(),
                )
                .await;
                let mut report = reports.swap_remove(successes[0]);
                report.output = Value::String(combined);
                report
            }
            SelectionMode::Evaluate => {
                let eval = candidates::evaluate_outputs(
                    &ctx,
                    &session_id,
                    spec.evaluator_instructions.as_deref(),
                    &texts,
                    self.transport.default_model(),
                )
                .await;
                let winner = successes[eval.winner];
                self.bus
                    .publish(
                        &session_id,
                        &reports[winner].trace_id,
                        EventKind::CandidateSelected,
                        json!({
                            "cascade_id": cascade_id,
                            "scope": "cascade",
                            "winner_index": winner,
                            "fallback": eval.fallback,
                            "justification": eval.justification,
                        }),
                    )
                    .await;
                reports.swap_remove(winner)
            }
        }
    }
}

/// Resolve the next cell position from a routing decision.
fn advance(
    index: &HashMap<&str, usize>,
    position: usize,
    route: Option<String>,
) -> Result<usize, RunError> {
    match route {
        Some(target) => match index.get(target.as_str()) {
            Some(&next) => Ok(next),
            None => Err(RunError::new(
                RunErrorKind::RoutingError,
                None,
                format!("route target '{}' is not a cell of this cascade", target),
            )),
        },
        None => Ok(position + 1),
    }
}

fn build_report(status: RunStatus, cascade_id: &str, trace_id: String, echo: Echo) -> RunReport {
    let output = echo
        .lineage
        .iter()
        .rev()
        .find(|entry| entry.status == CellStatus::Completed)
        .and_then(|entry| echo.outputs.get(&entry.cell).cloned())
        .unwrap_or(Value::Null);
    RunReport {
        status,
        session_id: echo.session_id.clone(),
        cascade_id: cascade_id.to_string(),
        trace_id,
        cost_usd: echo.total_cost(),
        lineage: echo.lineage,
        state: echo.state,
        outputs: echo.outputs,
        history: echo.history,
        errors: echo.errors,
        output,
    }
}

fn value_to_text(value: &Value) -> String {
    match value.as_str() {
        Some(text) => text.to_string(),
        None => serde_json::to_string(value).unwrap_or_else(|_| value.to_string()),
    }
}

/// Gather persisted image paths out of committed outputs.
fn collect_images(outputs: &Map<String, Value>) -> Vec<String> {
    let mut images = Vec::new();
    for value in outputs.values() {
        if let Some(items) = value.get("images").and_then(Value::as_array) {
            images.extend(
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(|s| s.to_string())),
            );
        }
    }
    images
}

/// A library cascade exposed as a callable trait. Invoking it runs the
/// child cascade synchronously; the child's final output is the tool
/// result, and a child error is an error-shaped tool result, never an
/// exception into the parent.
struct CascadeTrait {
    engine: Weak<CascadeEngine>,
    cascade_id: String,
    description: String,
    inputs_schema: BTreeMap<String, String>,
}

#[async_trait]
impl TraitHandler for CascadeTrait {
    fn metadata(&self) -> TraitMetadata {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for (name, description) in &self.inputs_schema {
            properties.insert(
                name.clone(),
                json!({"type": "string", "description": description}),
            );
            required.push(json!(name));
        }
        let description = if self.description.is_empty() {
            format!("Run the '{}' cascade.", self.cascade_id)
        } else {
            self.description.clone()
        };
        TraitMetadata::new(&self.cascade_id, description)
            .with_args_schema(json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }))
            .with_returns("{status, output, session_id, errors}")
    }

    async fn execute(&self, args: Value, ctx: &TraitContext) -> Result<TraitOutcome, TraitError> {
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| TraitError::ExecutionFailed("engine has shut down".to_string()))?;
        if ctx.depth + 1 > engine.config.max_sub_cascade_depth {
            return Err(TraitError::ExecutionFailed(format!(
                "sub-cascade depth limit of {} exceeded",
                engine.config.max_sub_cascade_depth
            )));
        }

        // Context flags come from the calling cascade's declaration.
        let (context_in, context_out) = engine
            .library
            .get(&ctx.cascade_id)
            .and_then(|parent| {
                parent
                    .sub_cascades
                    .iter()
                    .find(|s| s.cascade_id == self.cascade_id)
            })
            .map(|s| (s.context_in, s.context_out))
            .unwrap_or((false, false));

        let mut input = match args {
            Value::Object(fields) => fields,
            other => {
                let mut fields = Map::new();
                fields.insert("input".to_string(), other);
                fields
            }
        };
        if context_in {
            for (key, value) in &ctx.state {
                input.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        let session_id = format!(
            "{}-sub-{}",
            ctx.session_id,
            &Uuid::new_v4().to_string()[..8]
        );
        let mut echo = Echo::new(session_id, Value::Object(input));
        echo.depth = ctx.depth + 1;
        let trace = Arc::new(TraceTree::new());
        let report = engine
            .run_cascade_boxed(
                self.cascade_id.clone(),
                echo,
                ctx.caller_id.clone(),
                None,
                ctx.trace_id.clone(),
                trace,
            )
            .await;

        let summary = json!({
            "status": report.status,
            "output": report.output,
            "session_id": report.session_id,
            "errors": report.errors,
        });
        let mut outcome = TraitOutcome::of(summary.clone());
        outcome.content = Some(match report.status {
            RunStatus::Success => value_to_text(&report.output),
            _ => value_to_text(&summary),
        });
        if context_out && report.status == RunStatus::Success {
            outcome.state_updates = report.state.clone();
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_follows_routes_and_falls_through() {
        let mut index = HashMap::new();
        index.insert("a", 0);
        index.insert("b", 1);
        assert_eq!(advance(&index, 0, None).unwrap(), 1);
        assert_eq!(advance(&index, 1, Some("a".to_string())).unwrap(), 0);
        let error = advance(&index, 0, Some("zz".to_string())).unwrap_err();
        assert_eq!(error.kind, RunErrorKind::RoutingError);
    }

    #[test]
    fn collect_images_walks_output_envelopes() {
        let mut outputs = Map::new();
        outputs.insert(
            "render".to_string(),
            json!({"content": "done", "images": ["/a.png", "/b.png"]}),
        );
        outputs.insert("plain".to_string(), json!("text"));
        assert_eq!(collect_images(&outputs), vec!["/a.png", "/b.png"]);
    }
}
