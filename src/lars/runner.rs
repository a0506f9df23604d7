//! The cell control loop.
//!
//! [`run_cell`] executes one cell to a terminal outcome — completed (with an
//! optional routing decision), failed, or aborted by a blocking ward. The
//! loop is identical for both cell variants; they differ only in the body:
//!
//! 1. context preparation (late-bound template rendering);
//! 2. pre-wards;
//! 3. training injection;
//! 4. the body — an LLM turn loop or a deterministic trait call, optionally
//!    wrapped by the candidates driver;
//! 5. post-wards, with retry feedback re-entering the body;
//! 6. output commit and lineage;
//! 7. the handoff decision.
//!
//! Codified behaviors (engine-wide, surfaced here):
//! - `rules.max_turns` defaults to [`DEFAULT_MAX_TURNS`];
//! - only the first `route_to` call in a turn is honored; later tool calls
//!   in that turn are skipped with a warning;
//! - post-ward retries do not re-run pre-wards;
//! - per-tool timeouts synthesize an error tool-result and the turn loop
//!   continues.

use crate::lars::agent::Agent;
use crate::lars::candidates;
use crate::lars::cascade::{Cell, ManifestContext, WardMode};
use crate::lars::config::EngineConfig;
pub use crate::lars::config::DEFAULT_MAX_TURNS;
use crate::lars::echo::{CellStatus, Echo, LineageEntry, RunError, RunErrorKind};
use crate::lars::event::{EventBus, EventKind};
use crate::lars::store::LogStore;
use crate::lars::template;
use crate::lars::trace::{TraceKind, TraceStatus, TraceTree};
use crate::lars::trait_registry::{TraitContext, TraitRegistry};
use crate::lars::transport::{
    ChatMessage, ChatTransport, ContentPart, Role, ToolCall, ToolSpec, Usage,
};
use crate::lars::ward::{self, WardPhase};
use base64::Engine as _;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Post-ward retry budget when a retry ward omits `max_attempts`.
const DEFAULT_RETRY_ATTEMPTS: usize = 2;

/// Shared handles for one cascade run, cloned into candidate branches.
#[derive(Clone)]
pub struct RunCtx {
    pub config: Arc<EngineConfig>,
    pub transport: Arc<dyn ChatTransport>,
    pub registry: Arc<TraitRegistry>,
    pub bus: Arc<EventBus>,
    pub trace: Arc<TraceTree>,
    pub store: Arc<dyn LogStore>,
    pub cascade_id: String,
    pub caller_id: Option<String>,
}

/// Terminal outcome of one cell execution.
#[derive(Debug, Clone)]
pub enum CellOutcome {
    Completed { route: Option<String> },
    Failed(RunError),
    AbortedByWard { reason: String },
}

/// What a cell body produced, before commit.
#[derive(Debug, Clone)]
pub struct BodyOutput {
    /// The value committed to `outputs[cell]`.
    pub value: Value,
    /// The raw final assistant/tool text.
    pub content: String,
    /// Routing decision from `route_to` or the tool's `_route`.
    pub route: Option<String>,
    pub usage: Usage,
    /// The turn loop ran out of turns without terminal content.
    pub exhausted: bool,
    pub winner_index: Option<usize>,
    pub aggregated: bool,
    pub evaluator_fallback: bool,
    pub reforge_steps: usize,
}

impl BodyOutput {
    pub(crate) fn plain(value: Value, content: String) -> Self {
        Self {
            value,
            content,
            route: None,
            usage: Usage::default(),
            exhausted: false,
            winner_index: None,
            aggregated: false,
            evaluator_fallback: false,
            reforge_steps: 0,
        }
    }
}

/// Execute one cell to a terminal outcome.
pub async fn run_cell(
    ctx: &RunCtx,
    cell: &Cell,
    echo: &mut Echo,
    parent_trace: &str,
) -> CellOutcome {
    echo.current_cell = Some(cell.name.clone());
    let cell_trace = ctx
        .trace
        .begin(TraceKind::Cell, &cell.name, Some(parent_trace), echo.depth);
    ctx.bus
        .publish(
            &echo.session_id,
            &cell_trace,
            EventKind::CellStart,
            json!({"cascade_id": ctx.cascade_id, "cell": cell.name}),
        )
        .await;

    let outcome = drive_cell(ctx, cell, echo, &cell_trace).await;

    match &outcome {
        CellOutcome::Completed { route } => {
            ctx.bus
                .publish(
                    &echo.session_id,
                    &cell_trace,
                    EventKind::CellComplete,
                    json!({
                        "cascade_id": ctx.cascade_id,
                        "cell": cell.name,
                        "status": "completed",
                        "route": route,
                    }),
                )
                .await;
            ctx.trace.end(&cell_trace, TraceStatus::Ok);
        }
        CellOutcome::Failed(error) => {
            ctx.bus
                .publish(
                    &echo.session_id,
                    &cell_trace,
                    EventKind::CellComplete,
                    json!({
                        "cascade_id": ctx.cascade_id,
                        "cell": cell.name,
                        "status": "failed",
                        "error": error.to_string(),
                    }),
                )
                .await;
            ctx.trace.end(&cell_trace, TraceStatus::Error);
        }
        CellOutcome::AbortedByWard { reason } => {
            ctx.bus
                .publish(
                    &echo.session_id,
                    &cell_trace,
                    EventKind::CellComplete,
                    json!({
                        "cascade_id": ctx.cascade_id,
                        "cell": cell.name,
                        "status": "aborted_by_ward",
                        "reason": reason,
                    }),
                )
                .await;
            ctx.trace.end(&cell_trace, TraceStatus::Aborted);
        }
    }
    echo.current_cell = None;
    outcome
}

async fn drive_cell(ctx: &RunCtx, cell: &Cell, echo: &mut Echo, cell_trace: &str) -> CellOutcome {
    let mut cost = Usage::default();

    // 1. Context preparation.
    let context = match template::template_context(echo, cell.context.as_ref()) {
        Ok(context) => context,
        Err(e) => return fail_cell(echo, cell, &cost, RunErrorKind::CellError, e.to_string()),
    };
    let mut instructions = match &cell.instructions {
        Some(tpl) => match template::render(tpl, &context) {
            Ok(rendered) => rendered,
            Err(e) => return fail_cell(echo, cell, &cost, RunErrorKind::CellError, e.to_string()),
        },
        None => String::new(),
    };

    // 2. Pre-wards. Retry mode is undefined before a body exists; it is
    // treated as advisory here.
    if let Some(wards) = &cell.wards {
        let subject = json!({"instructions": instructions, "input": echo.input});
        for ward_spec in &wards.pre {
            let check =
                ward::run_ward(ctx, ward_spec, WardPhase::Pre, &cell.name, &subject, echo, cell_trace)
                    .await;
            cost.absorb(&check.usage);
            if check.verdict.valid {
                continue;
            }
            match ward_spec.mode {
                WardMode::Blocking => {
                    return abort_by_ward(echo, cell, &cost, check.verdict.reason);
                }
                WardMode::Retry | WardMode::Advisory => {
                    log::warn!(
                        "advisory pre-ward failure on cell '{}': {}",
                        cell.name,
                        check.verdict.reason
                    );
                }
            }
        }
    }

    // 3. Training injection.
    if cell.use_training && cell.is_llm() {
        let spec = cell.training.clone().unwrap_or_default();
        let examples =
            crate::lars::training::fetch_examples(&ctx.store, &ctx.cascade_id, &cell.name, &spec)
                .await;
        if !examples.is_empty() {
            let formatted = crate::lars::training::format_examples(&examples, spec.format);
            instructions = format!("{}\n\n{}", formatted, instructions);
            ctx.bus
                .publish(
                    &echo.session_id,
                    cell_trace,
                    EventKind::TrainingInjected,
                    json!({
                        "cascade_id": ctx.cascade_id,
                        "cell": cell.name,
                        "count": examples.len(),
                    }),
                )
                .await;
        }
    }

    // 4/5. Body with the post-ward retry loop. Pre-wards are not re-run on
    // retry; they gated the inputs once.
    let mut attempt = 0usize;
    let mut feedback: Option<String> = None;
    let body = loop {
        attempt += 1;
        let attempt_instructions = match &feedback {
            Some(reason) => format!(
                "{}\n\nA validator rejected the previous attempt: {}\nAddress the feedback and try again.",
                instructions, reason
            ),
            None => instructions.clone(),
        };

        let body = if cell.candidates.is_some() {
            candidates::run_cell_candidates(ctx, cell, &attempt_instructions, echo, cell_trace).await
        } else if cell.is_llm() {
            run_llm_body(ctx, cell, &attempt_instructions, echo, cell_trace).await
        } else {
            run_tool_body(ctx, cell, echo, cell_trace).await
        };
        let body = match body {
            Ok(body) => body,
            Err(error) => {
                return fail_cell(echo, cell, &cost, error.kind.clone(), error.message);
            }
        };
        cost.absorb(&body.usage);

        // Post-wards: first failing blocking/retry ward short-circuits the
        // rest of the phase.
        let mut retry_reason = None;
        let mut blocked_reason = None;
        if let Some(wards) = &cell.wards {
            for ward_spec in &wards.post {
                let check = ward::run_ward(
                    ctx,
                    ward_spec,
                    WardPhase::Post,
                    &cell.name,
                    &body.value,
                    echo,
                    cell_trace,
                )
                .await;
                cost.absorb(&check.usage);
                if check.verdict.valid {
                    continue;
                }
                match ward_spec.mode {
                    WardMode::Blocking => {
                        blocked_reason = Some(check.verdict.reason);
                        break;
                    }
                    WardMode::Retry => {
                        let budget = ward_spec.max_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS);
                        if attempt < budget {
                            retry_reason = Some(check.verdict.reason);
                        } else {
                            blocked_reason = Some(format!(
                                "retry ward exhausted after {} attempts: {}",
                                attempt, check.verdict.reason
                            ));
                        }
                        break;
                    }
                    WardMode::Advisory => {
                        log::warn!(
                            "advisory post-ward failure on cell '{}': {}",
                            cell.name,
                            check.verdict.reason
                        );
                    }
                }
            }
        }
        if let Some(reason) = blocked_reason {
            return abort_by_ward(echo, cell, &cost, reason);
        }
        if let Some(reason) = retry_reason {
            feedback = Some(reason);
            continue;
        }
        break body;
    };

    // 6. Output commit. A cell revisited by routing commits again; within
    // one completion the write happens exactly once.
    let revisit = echo
        .lineage
        .iter()
        .any(|entry| entry.cell == cell.name && entry.status == CellStatus::Completed);
    if revisit {
        echo.outputs.remove(&cell.name);
    }
    if let Err(e) = echo.commit_output(&cell.name, body.value.clone()) {
        return fail_cell(echo, cell, &cost, RunErrorKind::CellError, e.to_string());
    }

    // 7. Handoff.
    let route = match resolve_route(cell, &body) {
        Ok(route) => route,
        Err(error) => {
            return fail_cell(echo, cell, &cost, error.kind.clone(), error.message);
        }
    };
    if let Some(target) = &route {
        ctx.bus
            .publish(
                &echo.session_id,
                cell_trace,
                EventKind::Handoff,
                json!({
                    "cascade_id": ctx.cascade_id,
                    "from": cell.name,
                    "target": target,
                }),
            )
            .await;
    }

    let mut entry = LineageEntry::new(&cell.name, CellStatus::Completed);
    entry.cost_usd = cost.cost_usd;
    entry.winner_index = body.winner_index;
    entry.reforge_steps = body.reforge_steps;
    entry.exhausted = body.exhausted;
    entry.aggregated = body.aggregated;
    entry.evaluator_fallback = body.evaluator_fallback;
    echo.record_lineage(entry);
    ctx.trace
        .record_usage(cell_trace, cost.prompt_tokens, cost.completion_tokens, cost.cost_usd, None);

    CellOutcome::Completed { route }
}

fn fail_cell(
    echo: &mut Echo,
    cell: &Cell,
    cost: &Usage,
    kind: RunErrorKind,
    message: impl Into<String>,
) -> CellOutcome {
    let error = RunError::new(kind, Some(&cell.name), message);
    echo.push_error(error.clone());
    let mut entry = LineageEntry::new(&cell.name, CellStatus::Failed);
    entry.cost_usd = cost.cost_usd;
    echo.record_lineage(entry);
    CellOutcome::Failed(error)
}

fn abort_by_ward(echo: &mut Echo, cell: &Cell, cost: &Usage, reason: String) -> CellOutcome {
    echo.push_error(RunError::new(
        RunErrorKind::WardBlocked,
        Some(&cell.name),
        reason.clone(),
    ));
    let mut entry = LineageEntry::new(&cell.name, CellStatus::AbortedByWard);
    entry.cost_usd = cost.cost_usd;
    echo.record_lineage(entry);
    CellOutcome::AbortedByWard { reason }
}

/// Decide the next cell, in precedence order: an explicit routing decision
/// from the body, then a sole `handoffs` entry. `None` falls through to the
/// cascade's declared order.
fn resolve_route(cell: &Cell, body: &BodyOutput) -> Result<Option<String>, RunError> {
    if let Some(discriminator) = &body.route {
        if cell.is_deterministic() {
            if let Some(routing) = &cell.routing {
                return match routing.get(discriminator) {
                    Some(target) => Ok(Some(target.clone())),
                    None => Err(RunError::new(
                        RunErrorKind::RoutingError,
                        Some(&cell.name),
                        format!("tool returned unmapped _route '{}'", discriminator),
                    )),
                };
            }
            // A _route without a routing table is informational only.
        } else {
            return Ok(Some(discriminator.clone()));
        }
    }
    if cell.handoffs.len() == 1 {
        return Ok(Some(cell.handoffs[0].clone()));
    }
    Ok(None)
}

fn trait_context_for(ctx: &RunCtx, echo: &Echo, cell_name: &str, trace_id: &str) -> TraitContext {
    TraitContext {
        session_id: echo.session_id.clone(),
        cascade_id: ctx.cascade_id.clone(),
        caller_id: ctx.caller_id.clone(),
        cell_name: Some(cell_name.to_string()),
        depth: echo.depth,
        state: echo.state.clone(),
        trace_id: Some(trace_id.to_string()),
    }
}

/// Per-call timeout. Signal waits carry their own explicit timeout, so they
/// get that budget plus the normal tool allowance rather than being cut off
/// at `tool_timeout`.
fn call_timeout(config: &EngineConfig, name: &str, args: &Value) -> std::time::Duration {
    if name == "await_signal" {
        let wait = args
            .get("timeout")
            .and_then(Value::as_str)
            .and_then(crate::lars::config::parse_duration)
            .unwrap_or_else(|| std::time::Duration::from_secs(60));
        wait + config.tool_timeout
    } else {
        config.tool_timeout
    }
}

/// The auto-injected routing tool, present when `handoffs` has more than one
/// entry.
fn route_to_spec(handoffs: &[String]) -> ToolSpec {
    ToolSpec {
        name: "route_to".to_string(),
        description: "Hand off control to the next cell. Call exactly once, when you have decided."
            .to_string(),
        parameters_schema: json!({
            "type": "object",
            "properties": {
                "target": {"type": "string", "enum": handoffs},
            },
            "required": ["target"],
        }),
    }
}

/// The LLM turn loop.
pub(crate) async fn run_llm_body(
    ctx: &RunCtx,
    cell: &Cell,
    instructions: &str,
    echo: &mut Echo,
    parent_trace: &str,
) -> Result<BodyOutput, RunError> {
    let mut usage = Usage::default();

    let trait_names: Vec<String> = match &cell.traits {
        None => Vec::new(),
        Some(selection) if selection.is_manifest() => {
            let (names, quartermaster_usage) =
                quartermaster_select(ctx, cell, instructions, echo).await;
            usage.absorb(&quartermaster_usage);
            names
        }
        Some(selection) => selection.names().to_vec(),
    };
    let mut tool_specs = ctx.registry.tool_specs(&trait_names);
    if cell.handoffs.len() > 1 {
        tool_specs.push(route_to_spec(&cell.handoffs));
    }

    let model = cell.resolved_model(ctx.transport.default_model());
    let agent = Agent::new(ctx.transport.clone(), model.clone());
    let max_turns = cell.rules.max_turns.unwrap_or(DEFAULT_MAX_TURNS);

    echo.push_history(ChatMessage::text(Role::User, instructions));

    let mut route: Option<String> = None;
    let mut last_content = String::new();
    let mut persisted_images: Vec<String> = Vec::new();
    let mut exhausted = true;

    for turn_index in 1..=max_turns {
        let turn_trace = ctx.trace.begin(
            TraceKind::Turn,
            format!("turn-{}", turn_index),
            Some(parent_trace),
            echo.depth,
        );
        ctx.bus
            .publish(
                &echo.session_id,
                &turn_trace,
                EventKind::TurnStart,
                json!({"cascade_id": ctx.cascade_id, "cell": cell.name, "turn": turn_index}),
            )
            .await;

        let turn = match agent.turn(echo.history.clone(), tool_specs.clone()).await {
            Ok(turn) => turn,
            Err(e) => {
                ctx.trace.end(&turn_trace, TraceStatus::Error);
                echo.push_error(RunError::new(
                    RunErrorKind::AgentError,
                    Some(&cell.name),
                    e.to_string(),
                ));
                return Err(RunError::new(
                    RunErrorKind::CellError,
                    Some(&cell.name),
                    format!("transport retries exhausted: {}", e),
                ));
            }
        };
        usage.absorb(&turn.usage);
        ctx.trace.record_usage(
            &turn_trace,
            turn.usage.prompt_tokens,
            turn.usage.completion_tokens,
            turn.usage.cost_usd,
            Some(&model),
        );
        ctx.bus
            .publish(
                &echo.session_id,
                &turn_trace,
                EventKind::TurnComplete,
                json!({
                    "cascade_id": ctx.cascade_id,
                    "cell": cell.name,
                    "turn": turn_index,
                    "content": turn.content,
                    "tool_calls": turn.tool_calls,
                }),
            )
            .await;

        echo.push_history(ChatMessage {
            role: Role::Assistant,
            parts: vec![ContentPart::Text(turn.content.clone())],
            tool_calls: turn.tool_calls.clone(),
        });
        last_content = turn.content.clone();

        if turn.tool_calls.is_empty() {
            ctx.trace.end(&turn_trace, TraceStatus::Ok);
            exhausted = false;
            break;
        }

        // Tool calls run sequentially in emission order.
        let mut routed_this_turn = false;
        for call in &turn.tool_calls {
            if routed_this_turn {
                log::warn!(
                    "cell '{}': tool call '{}' after route_to ignored",
                    cell.name,
                    call.name
                );
                ctx.bus
                    .publish(
                        &echo.session_id,
                        &turn_trace,
                        EventKind::ToolResult,
                        json!({
                            "cell": cell.name,
                            "name": call.name,
                            "skipped": true,
                            "reason": "tool call after route_to ignored",
                        }),
                    )
                    .await;
                continue;
            }
            if call.name == "route_to" {
                if cell.handoffs.is_empty() {
                    ctx.trace.end(&turn_trace, TraceStatus::Error);
                    return Err(RunError::new(
                        RunErrorKind::RoutingError,
                        Some(&cell.name),
                        "route_to called but the cell declares no handoffs",
                    ));
                }
                match handle_route_to(ctx, cell, call, echo, &turn_trace).await {
                    Some(target) => {
                        route = Some(target);
                        routed_this_turn = true;
                    }
                    None => {}
                }
                continue;
            }
            let images = execute_trait_call(ctx, cell, call, echo, &turn_trace).await;
            persisted_images.extend(images);
        }
        ctx.trace.end(&turn_trace, TraceStatus::Ok);

        if route.is_some() {
            exhausted = false;
            break;
        }
        if let Some(predicate) = &cell.rules.loop_until {
            match template::template_context(echo, None)
                .and_then(|context| template::eval_predicate(predicate, &context))
            {
                Ok(true) => {
                    exhausted = false;
                    break;
                }
                Ok(false) => {}
                Err(e) => log::warn!("cell '{}': loop_until failed: {}", cell.name, e),
            }
        }
    }

    let value = match &cell.output_schema {
        Some(schema) => parse_structured_output(&last_content, schema)
            .map_err(|e| RunError::new(RunErrorKind::CellError, Some(&cell.name), e))?,
        None if persisted_images.is_empty() => Value::String(last_content.clone()),
        None => json!({"content": last_content, "images": persisted_images}),
    };

    Ok(BodyOutput {
        value,
        content: last_content,
        route,
        usage,
        exhausted,
        winner_index: None,
        aggregated: false,
        evaluator_fallback: false,
        reforge_steps: 0,
    })
}

/// Validate a `route_to` call; valid targets record the routing decision,
/// invalid ones feed an error tool-result back for the agent to retry.
async fn handle_route_to(
    ctx: &RunCtx,
    cell: &Cell,
    call: &ToolCall,
    echo: &mut Echo,
    turn_trace: &str,
) -> Option<String> {
    ctx.bus
        .publish(
            &echo.session_id,
            turn_trace,
            EventKind::ToolCall,
            json!({
                "cell": cell.name,
                "name": "route_to",
                "call_id": call.id,
                "arguments": call.arguments,
            }),
        )
        .await;
    let target = call
        .arguments
        .get("target")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    if cell.handoffs.contains(&target) {
        echo.push_history(ChatMessage {
            role: Role::Tool {
                call_id: call.id.clone(),
            },
            parts: vec![ContentPart::Text(format!("routing to {}", target))],
            tool_calls: Vec::new(),
        });
        ctx.bus
            .publish(
                &echo.session_id,
                turn_trace,
                EventKind::ToolResult,
                json!({
                    "cell": cell.name,
                    "name": "route_to",
                    "success": true,
                    "target": target,
                }),
            )
            .await;
        Some(target)
    } else {
        echo.push_history(ChatMessage {
            role: Role::Tool {
                call_id: call.id.clone(),
            },
            parts: vec![ContentPart::Text(format!(
                "invalid route target '{}'; valid targets: {}",
                target,
                cell.handoffs.join(", ")
            ))],
            tool_calls: Vec::new(),
        });
        ctx.bus
            .publish(
                &echo.session_id,
                turn_trace,
                EventKind::ToolResult,
                json!({
                    "cell": cell.name,
                    "name": "route_to",
                    "success": false,
                    "target": target,
                }),
            )
            .await;
        None
    }
}

/// Execute one ordinary trait call from the turn loop, feeding the result
/// (or a synthesized error) back into history. Returns persisted image paths.
async fn execute_trait_call(
    ctx: &RunCtx,
    cell: &Cell,
    call: &ToolCall,
    echo: &mut Echo,
    turn_trace: &str,
) -> Vec<String> {
    let call_trace = ctx
        .trace
        .begin(TraceKind::ToolCall, &call.name, Some(turn_trace), echo.depth);
    ctx.bus
        .publish(
            &echo.session_id,
            &call_trace,
            EventKind::ToolCall,
            json!({
                "cell": cell.name,
                "name": call.name,
                "call_id": call.id,
                "arguments": call.arguments,
            }),
        )
        .await;

    if !ctx.registry.contains(&call.name) {
        let message = format!("unknown tool {}", call.name);
        echo.push_history(ChatMessage {
            role: Role::Tool {
                call_id: call.id.clone(),
            },
            parts: vec![ContentPart::Text(message.clone())],
            tool_calls: Vec::new(),
        });
        ctx.bus
            .publish(
                &echo.session_id,
                &call_trace,
                EventKind::ToolResult,
                json!({"cell": cell.name, "name": call.name, "success": false, "error": message}),
            )
            .await;
        ctx.trace.end(&call_trace, TraceStatus::Error);
        return Vec::new();
    }

    let trait_ctx = trait_context_for(ctx, echo, &cell.name, &call_trace);
    let timeout = call_timeout(&ctx.config, &call.name, &call.arguments);
    let result = ctx
        .registry
        .execute(&call.name, call.arguments.clone(), &trait_ctx, timeout)
        .await;

    match result {
        Ok(outcome) => {
            for (key, value) in outcome.state_updates.clone() {
                echo.set_state(key.clone(), value.clone());
                ctx.bus
                    .publish(
                        &echo.session_id,
                        &call_trace,
                        EventKind::StateMutated,
                        json!({"cell": cell.name, "key": key, "value": value}),
                    )
                    .await;
            }
            let paths = persist_images(ctx, echo, &cell.name, &outcome.images, &call_trace).await;
            let content = outcome.content_text();
            let mut parts = vec![ContentPart::Text(content.clone())];
            for path in &paths {
                parts.push(ContentPart::ImagePath(path.clone()));
            }
            echo.push_history(ChatMessage {
                role: Role::Tool {
                    call_id: call.id.clone(),
                },
                parts,
                tool_calls: Vec::new(),
            });
            ctx.trace
                .annotate(&call_trace, json!({"arguments": call.arguments, "result": outcome.value}));
            ctx.bus
                .publish(
                    &echo.session_id,
                    &call_trace,
                    EventKind::ToolResult,
                    json!({
                        "cell": cell.name,
                        "name": call.name,
                        "success": true,
                        "content": content,
                        "images": paths,
                        "result": outcome.value,
                    }),
                )
                .await;
            ctx.trace.end(&call_trace, TraceStatus::Ok);
            paths
        }
        Err(e) => {
            let message = format!("Tool '{}' failed: {}", call.name, e);
            echo.push_error(RunError::new(
                RunErrorKind::TraitError,
                Some(&cell.name),
                e.to_string(),
            ));
            echo.push_history(ChatMessage {
                role: Role::Tool {
                    call_id: call.id.clone(),
                },
                parts: vec![ContentPart::Text(message.clone())],
                tool_calls: Vec::new(),
            });
            ctx.bus
                .publish(
                    &echo.session_id,
                    &call_trace,
                    EventKind::ToolResult,
                    json!({"cell": cell.name, "name": call.name, "success": false, "error": message}),
                )
                .await;
            ctx.trace.end(&call_trace, TraceStatus::Error);
            Vec::new()
        }
    }
}

/// The deterministic tool body.
pub(crate) async fn run_tool_body(
    ctx: &RunCtx,
    cell: &Cell,
    echo: &mut Echo,
    parent_trace: &str,
) -> Result<BodyOutput, RunError> {
    let tool = cell
        .tool
        .as_ref()
        .expect("deterministic cell without tool survived validation");
    let context = template::template_context(echo, cell.context.as_ref())
        .map_err(|e| RunError::new(RunErrorKind::CellError, Some(&cell.name), e.to_string()))?;

    let mut args = Map::new();
    if let Some(inputs) = &cell.inputs {
        for (key, value) in inputs {
            let rendered = render_value(value, &context)
                .map_err(|e| RunError::new(RunErrorKind::CellError, Some(&cell.name), e))?;
            args.insert(key.clone(), rendered);
        }
    }

    let call_trace = ctx
        .trace
        .begin(TraceKind::ToolCall, tool, Some(parent_trace), echo.depth);
    ctx.bus
        .publish(
            &echo.session_id,
            &call_trace,
            EventKind::ToolCall,
            json!({"cell": cell.name, "name": tool, "arguments": Value::Object(args.clone())}),
        )
        .await;

    let trait_ctx = trait_context_for(ctx, echo, &cell.name, &call_trace);
    let timeout = call_timeout(&ctx.config, tool, &Value::Object(args.clone()));
    let result = ctx
        .registry
        .execute(tool, Value::Object(args), &trait_ctx, timeout)
        .await;

    match result {
        Ok(outcome) => {
            for (key, value) in outcome.state_updates.clone() {
                echo.set_state(key.clone(), value.clone());
                ctx.bus
                    .publish(
                        &echo.session_id,
                        &call_trace,
                        EventKind::StateMutated,
                        json!({"cell": cell.name, "key": key, "value": value}),
                    )
                    .await;
            }
            let paths = persist_images(ctx, echo, &cell.name, &outcome.images, &call_trace).await;
            let content = outcome.content_text();
            ctx.bus
                .publish(
                    &echo.session_id,
                    &call_trace,
                    EventKind::ToolResult,
                    json!({
                        "cell": cell.name,
                        "name": tool,
                        "success": true,
                        "content": content,
                        "images": paths,
                        "result": outcome.value,
                    }),
                )
                .await;
            ctx.trace.end(&call_trace, TraceStatus::Ok);

            let value = if paths.is_empty() {
                outcome.value.clone()
            } else {
                json!({"content": content, "images": paths})
            };
            let mut body = BodyOutput::plain(value, content);
            body.route = outcome.route;
            Ok(body)
        }
        Err(e) => {
            ctx.bus
                .publish(
                    &echo.session_id,
                    &call_trace,
                    EventKind::ToolResult,
                    json!({"cell": cell.name, "name": tool, "success": false, "error": e.to_string()}),
                )
                .await;
            ctx.trace.end(&call_trace, TraceStatus::Error);
            Err(RunError::new(
                RunErrorKind::CellError,
                Some(&cell.name),
                format!("tool '{}' failed: {}", tool, e),
            ))
        }
    }
}

/// Recursively render string leaves of a templated inputs value.
fn render_value(value: &Value, context: &Value) -> Result<Value, String> {
    match value {
        Value::String(text) if text.contains("{{") || text.contains("{%") => {
            template::render(text, context)
                .map(Value::String)
                .map_err(|e| e.to_string())
        }
        Value::Array(items) => {
            let mut rendered = Vec::with_capacity(items.len());
            for item in items {
                rendered.push(render_value(item, context)?);
            }
            Ok(Value::Array(rendered))
        }
        Value::Object(fields) => {
            let mut rendered = Map::new();
            for (key, item) in fields {
                rendered.insert(key.clone(), render_value(item, context)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

/// Persist tool-returned images under the session's artifact directory.
///
/// Entries are file paths (copied in) or base64 payloads (decoded). Images
/// over the configured size limit are dropped with an `image_truncated`
/// event and an entry in the run's errors.
async fn persist_images(
    ctx: &RunCtx,
    echo: &mut Echo,
    cell_name: &str,
    images: &[String],
    trace_id: &str,
) -> Vec<String> {
    if images.is_empty() {
        return Vec::new();
    }
    let dir = ctx
        .config
        .artifact_root
        .join(&echo.session_id)
        .join("images")
        .join(cell_name);
    if let Err(e) = fs::create_dir_all(&dir) {
        log::warn!("could not create image dir {}: {}", dir.display(), e);
        return Vec::new();
    }

    let mut paths = Vec::new();
    for entry in images {
        let (bytes, extension) = if Path::new(entry).exists() {
            let extension = Path::new(entry)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("png")
                .to_string();
            match fs::read(entry) {
                Ok(bytes) => (bytes, extension),
                Err(e) => {
                    log::warn!("could not read image {}: {}", entry, e);
                    continue;
                }
            }
        } else {
            let payload = entry
                .rsplit("base64,")
                .next()
                .unwrap_or(entry.as_str());
            match base64::engine::general_purpose::STANDARD.decode(payload.trim()) {
                Ok(bytes) => (bytes, "png".to_string()),
                Err(e) => {
                    log::warn!("image entry is neither a path nor base64: {}", e);
                    continue;
                }
            }
        };
        if bytes.len() > ctx.config.max_image_bytes {
            ctx.bus
                .publish(
                    &echo.session_id,
                    trace_id,
                    EventKind::ImageTruncated,
                    json!({
                        "cell": cell_name,
                        "size": bytes.len(),
                        "limit": ctx.config.max_image_bytes,
                    }),
                )
                .await;
            echo.push_error(RunError::new(
                RunErrorKind::TraitError,
                Some(cell_name),
                format!(
                    "image truncated: {} bytes exceeds the {} byte limit",
                    bytes.len(),
                    ctx.config.max_image_bytes
                ),
            ));
            continue;
        }
        let file = dir.join(format!("{}.{}", Uuid::new_v4(), extension));
        match fs::write(&file, &bytes) {
            Ok(()) => paths.push(file.to_string_lossy().to_string()),
            Err(e) => log::warn!("could not write image {}: {}", file.display(), e),
        }
    }
    paths
}

/// Manifest mode: an internal quartermaster agent picks the trait subset
/// from the full registry. Its cost is attributed to the calling cell.
async fn quartermaster_select(
    ctx: &RunCtx,
    cell: &Cell,
    instructions: &str,
    echo: &Echo,
) -> (Vec<String>, Usage) {
    let all_names: Vec<String> = ctx.registry.list().into_iter().map(|m| m.name).collect();
    let mut listing = String::new();
    for metadata in ctx.registry.list() {
        listing.push_str(&format!("- {}: {}\n", metadata.name, metadata.description));
    }
    let task_context = match cell.manifest_context {
        Some(ManifestContext::Full) => {
            let mut history = String::new();
            for message in &echo.history {
                history.push_str(&message.content_text());
                history.push('\n');
            }
            history
        }
        _ => instructions.to_string(),
    };
    let prompt = format!(
        "You are the quartermaster. From the tool registry below, choose the smallest set of tools the task needs.\n\nTools:\n{}\nTask:\n{}\n\nReply with a JSON array of tool names.",
        listing, task_context
    );
    let agent = Agent::new(
        ctx.transport.clone(),
        cell.resolved_model(ctx.transport.default_model()),
    );
    match agent
        .turn(vec![ChatMessage::text(Role::User, prompt)], Vec::new())
        .await
    {
        Ok(turn) => {
            let selected = parse_name_array(&turn.content)
                .into_iter()
                .filter(|name| ctx.registry.contains(name))
                .collect::<Vec<_>>();
            if selected.is_empty() {
                log::warn!(
                    "quartermaster returned no usable selection for cell '{}'; exposing full registry",
                    cell.name
                );
                (all_names, turn.usage)
            } else {
                (selected, turn.usage)
            }
        }
        Err(e) => {
            log::warn!("quartermaster failed for cell '{}': {}", cell.name, e);
            (all_names, Usage::default())
        }
    }
}

/// Pull a JSON array of strings out of free text.
fn parse_name_array(text: &str) -> Vec<String> {
    let start = match text.find('[') {
        Some(start) => start,
        None => return Vec::new(),
    };
    let mut depth = 0usize;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    let fragment = &text[start..start + offset + 1];
                    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(fragment) {
                        return items
                            .into_iter()
                            .filter_map(|item| item.as_str().map(|s| s.to_string()))
                            .collect();
                    }
                    return Vec::new();
                }
            }
            _ => {}
        }
    }
    Vec::new()
}

/// Parse a cell's final content against its declared output schema.
fn parse_structured_output(content: &str, schema: &Value) -> Result<Value, String> {
    let trimmed = content.trim();
    let candidate = if let Some(stripped) = trimmed.strip_prefix("```json") {
        stripped.trim_end_matches("```").trim()
    } else if let Some(stripped) = trimmed.strip_prefix("```") {
        stripped.trim_end_matches("```").trim()
    } else {
        trimmed
    };
    let fragment = match candidate.find('{') {
        Some(start) => ward::balanced_json(&candidate[start..]).unwrap_or(candidate),
        None => candidate,
    };
    let value: Value = serde_json::from_str(fragment)
        .map_err(|e| format!("output is not valid JSON: {}", e))?;
    crate::lars::trait_registry::validate_args(schema, &value)
        .map_err(|e| format!("output does not match schema: {}", e))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_precedence_prefers_explicit_decision() {
        let cell: Cell = serde_yaml::from_str(
            r#"
name: classify
instructions: hi
handoffs: [a, b]
"#,
        )
        .unwrap();
        let mut body = BodyOutput::plain(Value::Null, String::new());
        body.route = Some("b".to_string());
        assert_eq!(resolve_route(&cell, &body).unwrap(), Some("b".to_string()));
    }

    #[test]
    fn single_handoff_routes_implicitly() {
        let cell: Cell = serde_yaml::from_str(
            r#"
name: ingest
instructions: hi
handoffs: [summarize]
"#,
        )
        .unwrap();
        let body = BodyOutput::plain(Value::Null, String::new());
        assert_eq!(
            resolve_route(&cell, &body).unwrap(),
            Some("summarize".to_string())
        );
    }

    #[test]
    fn unmapped_route_discriminator_is_a_routing_error() {
        let cell: Cell = serde_yaml::from_str(
            r#"
name: fetch
tool: http
routing:
  ok: next
"#,
        )
        .unwrap();
        let mut body = BodyOutput::plain(Value::Null, String::new());
        body.route = Some("err".to_string());
        let error = resolve_route(&cell, &body).unwrap_err();
        assert_eq!(error.kind, RunErrorKind::RoutingError);
    }

    #[test]
    fn parse_name_array_extracts_names() {
        assert_eq!(
            parse_name_array("use these: [\"sql\", \"shell\"] thanks"),
            vec!["sql".to_string(), "shell".to_string()]
        );
        assert!(parse_name_array("no array here").is_empty());
    }

    #[test]
    fn structured_output_strips_fences() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"total": {"type": "integer"}},
            "required": ["total"],
        });
        let value =
            parse_structured_output("```json\n{\"total\": 250}\n```", &schema).unwrap();
        assert_eq!(value["total"], 250);

        assert!(parse_structured_output("just prose", &schema).is_err());
    }
}
