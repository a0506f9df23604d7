//! Speculative N-way execution of a cell with mutation and LLM-judged
//! selection.
//!
//! The driver fans the cell's body out into `factor` branches, each with its
//! own copy of the echo and an independent trace subtree. Branches run in
//! parallel, bounded by the engine's worker pool. Once all branches settle,
//! selection reduces them to one output:
//!
//! - `evaluate` (default): an evaluator LLM picks the winning index;
//! - `aggregate`: an aggregator LLM combines all branch outputs;
//! - `all`: no selection, the output is the list.
//!
//! Only the selected branch's echo deltas (state mutations, history, output)
//! are merged back into the parent; eliminated branches stay in the trace
//! with `is_winner: false` for later analysis.
//!
//! When `mutate` is on, each branch's instructions are perturbed first. The
//! `rewrite` mode learns: winning rewrites are logged under a species hash
//! of the cell's evaluation-affecting configuration, and future runs seed
//! the rewriter with the most recent winners for the same hash.

use crate::lars::agent::Agent;
use crate::lars::cascade::{CandidatesSpec, Cell, ModelAssignment, MutationMode, SelectionMode};
use crate::lars::echo::{Echo, RunError, RunErrorKind};
use crate::lars::event::EventKind;
use crate::lars::reforge;
use crate::lars::runner::{self, BodyOutput, RunCtx};
use crate::lars::store::WinningRewrite;
use crate::lars::trace::{TraceKind, TraceStatus};
use crate::lars::transport::{ChatMessage, Role, Usage};
use crate::lars::ward;
use chrono::Utc;
use lazy_static::lazy_static;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Version tag for the mutation pools; bump when the pools change so logged
/// rewrites can be tied to the directives that produced them.
pub const MUTATION_POOL_VERSION: &str = "1";

lazy_static! {
    /// Short directives prepended by the `augment` mutation mode.
    static ref AUGMENT_POOL: Vec<&'static str> = vec![
        "Let's approach this carefully and double-check each claim.",
        "Take a deep breath and work through this step by step.",
        "Be precise; prefer concrete specifics over generalities.",
        "Keep the answer tight. Cut anything that does not earn its place.",
        "Re-read the task once more before answering.",
    ];

    /// Strategy directives prepended by the `approach` mutation mode.
    static ref APPROACH_POOL: Vec<&'static str> = vec![
        "Think from first principles.",
        "Consider edge cases before the happy path.",
        "Argue the opposite position first, then answer.",
        "Sketch a plan, then execute it.",
        "Optimize for the reader who will act on this answer.",
    ];
}

/// A directive from the shared mutation pools, for callers (reforge) that
/// perturb prompts outside the fan-out path.
pub(crate) fn mutation_directive(index: usize) -> &'static str {
    if index % 2 == 0 {
        APPROACH_POOL[(index / 2) % APPROACH_POOL.len()]
    } else {
        AUGMENT_POOL[(index / 2) % AUGMENT_POOL.len()]
    }
}

/// Content hash of a cell's evaluation-affecting configuration. Partitions
/// winner-learning memory so a revised cell never inherits stale rewrites.
pub fn species_hash(cell: &Cell) -> String {
    let basis = json!({
        "instructions": cell.instructions,
        "candidates": cell.candidates,
        "rules": cell.rules,
        "output_schema": cell.output_schema,
        "wards": cell.wards,
    });
    let mut hasher = Sha256::new();
    hasher.update(basis.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

struct BranchRun {
    index: usize,
    outcome: Result<BodyOutput, RunError>,
    echo: Echo,
    mutated_instructions: Option<String>,
    trace_id: String,
}

/// Result of an evaluator pass over candidate outputs.
pub(crate) struct EvalResult {
    pub winner: usize,
    pub fallback: bool,
    pub usage: Usage,
    pub justification: Option<String>,
}

/// Per-branch model assignment.
fn branch_models(spec: &CandidatesSpec, default_model: &str) -> Vec<String> {
    match &spec.models {
        Some(ModelAssignment::List(models)) => models.clone(),
        Some(ModelAssignment::Weighted(weights)) => {
            let mut slots = Vec::with_capacity(spec.factor);
            for (model, weight) in weights {
                for _ in 0..weight.factor {
                    slots.push(model.clone());
                }
            }
            slots
        }
        None => vec![default_model.to_string(); spec.factor],
    }
}

/// Run a cell body `factor` ways and reduce to one [`BodyOutput`].
pub(crate) async fn run_cell_candidates(
    ctx: &RunCtx,
    cell: &Cell,
    instructions: &str,
    echo: &mut Echo,
    cell_trace: &str,
) -> Result<BodyOutput, RunError> {
    let spec = cell
        .candidates
        .clone()
        .expect("run_cell_candidates on a cell without candidates");
    let species = species_hash(cell);
    let models = branch_models(&spec, &cell.resolved_model(ctx.transport.default_model()));
    let semaphore = Arc::new(Semaphore::new(ctx.config.worker_pool.max(1)));

    let mut handles = Vec::with_capacity(spec.factor);
    for index in 0..spec.factor {
        let ctx = ctx.clone();
        let mut branch_cell = cell.clone();
        branch_cell.candidates = None;
        branch_cell.model_override = models.get(index).cloned();
        let base_instructions = instructions.to_string();
        let mut branch_echo = echo.fork_branch();
        let spec = spec.clone();
        let species = species.clone();
        let cell_trace = cell_trace.to_string();
        let semaphore = semaphore.clone();

        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("worker pool semaphore closed");
            let branch_trace = ctx.trace.begin(
                TraceKind::Candidate,
                format!("candidate-{}", index),
                Some(&cell_trace),
                branch_echo.depth,
            );
            ctx.trace.mark_candidate(&branch_trace, index, None);
            ctx.bus
                .publish(
                    &branch_echo.session_id,
                    &branch_trace,
                    EventKind::CandidateStart,
                    json!({
                        "cascade_id": ctx.cascade_id,
                        "cell": branch_cell.name,
                        "index": index,
                        "phase": "candidates",
                    }),
                )
                .await;

            let mut mutation_usage = Usage::default();
            let (branch_instructions, mutated_instructions) = if spec.mutate {
                let (text, usage) =
                    apply_mutation(&ctx, &branch_cell, &spec, &species, &base_instructions, index)
                        .await;
                mutation_usage = usage;
                (text.clone(), Some(text))
            } else {
                (base_instructions, None)
            };

            let mut outcome = if branch_cell.is_llm() {
                runner::run_llm_body(&ctx, &branch_cell, &branch_instructions, &mut branch_echo, &branch_trace)
                    .await
            } else {
                runner::run_tool_body(&ctx, &branch_cell, &mut branch_echo, &branch_trace).await
            };
            if let Ok(body) = &mut outcome {
                body.usage.absorb(&mutation_usage);
            }

            match &outcome {
                Ok(body) => {
                    ctx.trace.record_usage(
                        &branch_trace,
                        body.usage.prompt_tokens,
                        body.usage.completion_tokens,
                        body.usage.cost_usd,
                        None,
                    );
                    ctx.bus
                        .publish(
                            &branch_echo.session_id,
                            &branch_trace,
                            EventKind::CandidateComplete,
                            json!({
                                "cascade_id": ctx.cascade_id,
                                "cell": branch_cell.name,
                                "index": index,
                                "phase": "candidates",
                                "success": true,
                            }),
                        )
                        .await;
                    ctx.trace.end(&branch_trace, TraceStatus::Ok);
                }
                Err(error) => {
                    ctx.bus
                        .publish(
                            &branch_echo.session_id,
                            &branch_trace,
                            EventKind::CandidateComplete,
                            json!({
                                "cascade_id": ctx.cascade_id,
                                "cell": branch_cell.name,
                                "index": index,
                                "phase": "candidates",
                                "success": false,
                                "error": error.to_string(),
                            }),
                        )
                        .await;
                    ctx.trace.end(&branch_trace, TraceStatus::Error);
                }
            }

            BranchRun {
                index,
                outcome,
                echo: branch_echo,
                mutated_instructions,
                trace_id: branch_trace,
            }
        }));
    }

    let mut branches = Vec::with_capacity(spec.factor);
    for handle in handles {
        match handle.await {
            Ok(branch) => branches.push(branch),
            Err(e) => log::warn!("candidate branch task failed to join: {}", e),
        }
    }
    branches.sort_by_key(|b| b.index);

    let mut total_usage = Usage::default();
    for branch in &branches {
        if let Ok(body) = &branch.outcome {
            total_usage.absorb(&body.usage);
        }
    }

    let successful: Vec<usize> = branches
        .iter()
        .enumerate()
        .filter(|(_, b)| b.outcome.is_ok())
        .map(|(position, _)| position)
        .collect();
    if successful.is_empty() {
        return Err(RunError::new(
            RunErrorKind::CellError,
            Some(&cell.name),
            format!("all {} candidate branches failed", spec.factor),
        ));
    }

    match spec.mode {
        SelectionMode::All => {
            let outputs: Vec<Value> = successful
                .iter()
                .map(|&position| match &branches[position].outcome {
                    Ok(body) => body.value.clone(),
                    Err(_) => Value::Null,
                })
                .collect();
            let value = Value::Array(outputs);
            let content = serde_json::to_string(&value).unwrap_or_default();
            let mut body = BodyOutput::plain(value, content);
            body.usage = total_usage;
            Ok(body)
        }
        SelectionMode::Aggregate => {
            let texts = branch_texts(&branches, &successful);
            let (combined, usage) = aggregate_outputs(
                ctx,
                &echo.session_id,
                spec.aggregator_instructions.as_deref(),
                &texts,
                &cell.resolved_model(ctx.transport.default_model()),
            )
            .await;
            total_usage.absorb(&usage);
            let mut body = BodyOutput::plain(Value::String(combined.clone()), combined);
            body.usage = total_usage;
            body.aggregated = true;
            Ok(body)
        }
        SelectionMode::Evaluate => {
            let (winner_position, fallback, justification) = if successful.len() == 1 {
                (successful[0], false, None)
            } else {
                let texts = branch_texts(&branches, &successful);
                let eval = evaluate_outputs(
                    ctx,
                    &echo.session_id,
                    spec.evaluator_instructions.as_deref(),
                    &texts,
                    &cell.resolved_model(ctx.transport.default_model()),
                )
                .await;
                total_usage.absorb(&eval.usage);
                (successful[eval.winner], eval.fallback, eval.justification)
            };

            let winner_index = branches[winner_position].index;
            for branch in &branches {
                ctx.trace
                    .mark_candidate(&branch.trace_id, branch.index, Some(branch.index == winner_index));
            }
            ctx.bus
                .publish(
                    &echo.session_id,
                    cell_trace,
                    EventKind::CandidateSelected,
                    json!({
                        "cascade_id": ctx.cascade_id,
                        "cell": cell.name,
                        "winner_index": winner_index,
                        "fallback": fallback,
                        "justification": justification,
                    }),
                )
                .await;

            let winner = branches.swap_remove(winner_position);
            let mut winner_body = winner
                .outcome
                .expect("winner branch was selected from successful set");

            // Learning: log the winning rewrite under the species hash.
            if spec.mutate
                && spec.mutation_mode == MutationMode::Rewrite
                && !ctx.config.disable_winner_learning
            {
                if let Some(instructions) = &winner.mutated_instructions {
                    let rewrite = WinningRewrite {
                        species_hash: species.clone(),
                        cascade_id: ctx.cascade_id.clone(),
                        cell_name: cell.name.clone(),
                        instructions: instructions.clone(),
                        winner_index,
                        created_at: Utc::now(),
                    };
                    if let Err(e) = ctx.store.append_winning_rewrite(&rewrite).await {
                        log::warn!("could not log winning rewrite: {}", e);
                    }
                }
            }

            echo.merge_winner(winner.echo);
            winner_body.usage = total_usage;
            winner_body.winner_index = Some(winner_index);
            winner_body.evaluator_fallback = fallback;

            if let Some(reforge_spec) = &spec.reforge {
                if reforge_spec.steps > 0 {
                    winner_body =
                        reforge::run_reforge(ctx, cell, reforge_spec, winner_body, echo, cell_trace)
                            .await?;
                }
            }
            Ok(winner_body)
        }
    }
}

fn branch_texts(branches: &[BranchRun], successful: &[usize]) -> Vec<String> {
    successful
        .iter()
        .map(|&position| match &branches[position].outcome {
            Ok(body) => body.content.clone(),
            Err(_) => String::new(),
        })
        .collect()
}

/// Perturb one branch's instructions per the configured mutation mode.
/// Returns the mutated instructions and any LLM cost incurred.
async fn apply_mutation(
    ctx: &RunCtx,
    cell: &Cell,
    spec: &CandidatesSpec,
    species: &str,
    instructions: &str,
    index: usize,
) -> (String, Usage) {
    match spec.mutation_mode {
        MutationMode::Augment => {
            let directive = AUGMENT_POOL[index % AUGMENT_POOL.len()];
            (format!("{}\n\n{}", directive, instructions), Usage::default())
        }
        MutationMode::Approach => {
            let directive = APPROACH_POOL[index % APPROACH_POOL.len()];
            (format!("{}\n\n{}", directive, instructions), Usage::default())
        }
        MutationMode::Rewrite | MutationMode::RewriteFree => {
            let learning = spec.mutation_mode == MutationMode::Rewrite
                && !ctx.config.disable_winner_learning;
            let mut inspiration = String::new();
            if learning {
                match ctx
                    .store
                    .winning_rewrites(species, ctx.config.winner_history_limit)
                    .await
                {
                    Ok(rewrites) if !rewrites.is_empty() => {
                        inspiration.push_str("\n\nRewrites that won previous runs:\n");
                        for rewrite in rewrites {
                            inspiration.push_str(&format!("---\n{}\n", rewrite.instructions));
                        }
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("winning rewrite lookup failed: {}", e),
                }
            }
            let model = ctx
                .config
                .rewrite_model
                .clone()
                .unwrap_or_else(|| cell.resolved_model(ctx.transport.default_model()));
            let prompt = format!(
                "Rewrite the instructions below to get a better result from the model that will execute them. \
                 Keep the task and its constraints identical. Reply with only the rewritten instructions.{}\n\nInstructions:\n{}",
                inspiration, instructions
            );
            let agent = Agent::new(ctx.transport.clone(), model);
            match agent
                .turn(vec![ChatMessage::text(Role::User, prompt)], Vec::new())
                .await
            {
                Ok(turn) => {
                    let rewritten = turn.content.trim().to_string();
                    if rewritten.is_empty() {
                        (instructions.to_string(), turn.usage)
                    } else {
                        (rewritten, turn.usage)
                    }
                }
                Err(e) => {
                    log::warn!("rewrite mutation failed, using original instructions: {}", e);
                    (instructions.to_string(), Usage::default())
                }
            }
        }
    }
}

/// Ask an evaluator LLM to pick the winning output.
///
/// An unparseable reply falls back to index 0 and flags the selection.
pub(crate) async fn evaluate_outputs(
    ctx: &RunCtx,
    _session_id: &str,
    instructions: Option<&str>,
    outputs: &[String],
    model: &str,
) -> EvalResult {
    let mut prompt = String::new();
    prompt.push_str(
        instructions.unwrap_or("Judge the candidate responses below and pick the single best one."),
    );
    prompt.push_str("\n\n");
    for (i, output) in outputs.iter().enumerate() {
        prompt.push_str(&format!("### Candidate {}\n{}\n\n", i, output));
    }
    prompt.push_str(
        "Reply with a JSON object: {\"winner\": <candidate number>, \"justification\": \"...\"}",
    );

    let agent = Agent::new(ctx.transport.clone(), model);
    match agent
        .turn(vec![ChatMessage::text(Role::User, prompt)], Vec::new())
        .await
    {
        Ok(turn) => {
            let parsed = parse_winner(&turn.content, outputs.len());
            match parsed {
                Some((winner, justification)) => EvalResult {
                    winner,
                    fallback: false,
                    usage: turn.usage,
                    justification,
                },
                None => {
                    log::warn!("evaluator returned no parseable index; falling back to candidate 0");
                    EvalResult {
                        winner: 0,
                        fallback: true,
                        usage: turn.usage,
                        justification: None,
                    }
                }
            }
        }
        Err(e) => {
            log::warn!("evaluator failed ({}); falling back to candidate 0", e);
            EvalResult {
                winner: 0,
                fallback: true,
                usage: Usage::default(),
                justification: None,
            }
        }
    }
}

/// Ask an aggregator LLM to combine all outputs into one.
pub(crate) async fn aggregate_outputs(
    ctx: &RunCtx,
    _session_id: &str,
    instructions: Option<&str>,
    outputs: &[String],
    model: &str,
) -> (String, Usage) {
    let mut prompt = String::new();
    prompt.push_str(
        instructions.unwrap_or("Combine the candidate responses below into one best answer."),
    );
    prompt.push_str("\n\n");
    for (i, output) in outputs.iter().enumerate() {
        prompt.push_str(&format!("### Candidate {}\n{}\n\n", i, output));
    }

    let agent = Agent::new(ctx.transport.clone(), model);
    match agent
        .turn(vec![ChatMessage::text(Role::User, prompt)], Vec::new())
        .await
    {
        Ok(turn) => (turn.content, turn.usage),
        Err(e) => {
            log::warn!("aggregator failed ({}); concatenating candidates", e);
            (outputs.join("\n\n---\n\n"), Usage::default())
        }
    }
}

/// Extract `{"winner": n}` from evaluator text, or the first bare integer.
fn parse_winner(text: &str, count: usize) -> Option<(usize, Option<String>)> {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(fragment) = ward::balanced_json(&text[start..]) {
            if let Ok(value) = serde_json::from_str::<Value>(fragment) {
                if let Some(winner) = value.get("winner").and_then(Value::as_u64) {
                    let winner = winner as usize;
                    if winner < count {
                        let justification = value
                            .get("justification")
                            .and_then(Value::as_str)
                            .map(|s| s.to_string());
                        return Some((winner, justification));
                    }
                }
            }
        }
        search_from = start + 1;
    }
    // Fall back to the first integer in the text.
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else if !digits.is_empty() {
            break;
        }
    }
    if let Ok(winner) = digits.parse::<usize>() {
        if winner < count {
            return Some((winner, None));
        }
    }
    None
}
