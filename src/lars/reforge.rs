//! Depth-wise iterative refinement of a candidates winner.
//!
//! After candidates selects a winner, reforge runs up to `steps` serial
//! refinement rounds. Each round generates `factor_per_step` rewrites of the
//! current best output, conditioned on the honing prompt (and optionally a
//! mutation directive from the shared pools), evaluates them with the same
//! evaluator machinery as candidates, and promotes the new winner. A
//! `threshold` validator can stop refinement early once the output is good
//! enough.
//!
//! Reforge multiplies cost by roughly `factor_per_step × steps`; variants
//! within a step run in parallel, steps are serial.

use crate::lars::candidates::{self, mutation_directive};
use crate::lars::agent::Agent;
use crate::lars::cascade::{Cell, ReforgeSpec, WardMode, WardSpec};
use crate::lars::echo::{Echo, RunError};
use crate::lars::event::EventKind;
use crate::lars::runner::{BodyOutput, RunCtx};
use crate::lars::trace::{TraceKind, TraceStatus};
use crate::lars::transport::{ChatMessage, Role, Usage};
use crate::lars::ward::{self, WardPhase};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Refine a winner in place. Returns the (possibly replaced) body with
/// `reforge_steps` set to the number of steps actually executed.
pub(crate) async fn run_reforge(
    ctx: &RunCtx,
    cell: &Cell,
    spec: &ReforgeSpec,
    winner: BodyOutput,
    echo: &mut Echo,
    cell_trace: &str,
) -> Result<BodyOutput, RunError> {
    let mut current = winner;
    let mut steps_executed = 0usize;
    let model = cell.resolved_model(ctx.transport.default_model());

    for step in 1..=spec.steps {
        // Early exit once the threshold validator is satisfied.
        if let Some(validator) = &spec.threshold {
            let threshold_ward = WardSpec {
                validator: validator.clone(),
                mode: WardMode::Advisory,
                max_attempts: None,
            };
            let check = ward::run_ward(
                ctx,
                &threshold_ward,
                WardPhase::Post,
                &cell.name,
                &current.value,
                echo,
                cell_trace,
            )
            .await;
            current.usage.absorb(&check.usage);
            if check.verdict.valid {
                break;
            }
        }

        let step_trace = ctx.trace.begin(
            TraceKind::ReforgeStep,
            format!("reforge-{}", step),
            Some(cell_trace),
            echo.depth,
        );
        ctx.trace.mark_reforge_step(&step_trace, step);
        ctx.bus
            .publish(
                &echo.session_id,
                &step_trace,
                EventKind::ReforgeStepStart,
                json!({"cascade_id": ctx.cascade_id, "cell": cell.name, "step": step}),
            )
            .await;

        let variants = generate_variants(
            ctx,
            cell,
            spec,
            &current,
            step,
            &step_trace,
            &echo.session_id,
            &model,
            echo.depth,
        )
        .await;
        let mut variant_texts = Vec::new();
        for (text, usage) in &variants {
            current.usage.absorb(usage);
            variant_texts.push(text.clone());
        }
        if variant_texts.is_empty() {
            log::warn!(
                "reforge step {} on cell '{}' produced no variants; stopping",
                step,
                cell.name
            );
            ctx.trace.end(&step_trace, TraceStatus::Error);
            break;
        }

        let winner_index = if variant_texts.len() == 1 {
            0
        } else {
            let eval = candidates::evaluate_outputs(
                ctx,
                &echo.session_id,
                Some(&format!(
                    "Judge the refined variants below against this goal: {}",
                    spec.honing_prompt
                )),
                &variant_texts,
                &model,
            )
            .await;
            current.usage.absorb(&eval.usage);
            eval.winner
        };

        let refined = variant_texts[winner_index].clone();
        current.value = refined_value(&current.value, &refined);
        current.content = refined;
        steps_executed = step;

        ctx.bus
            .publish(
                &echo.session_id,
                &step_trace,
                EventKind::ReforgeStepComplete,
                json!({
                    "cascade_id": ctx.cascade_id,
                    "cell": cell.name,
                    "step": step,
                    "winner_index": winner_index,
                }),
            )
            .await;
        ctx.trace.end(&step_trace, TraceStatus::Ok);
    }

    current.reforge_steps = steps_executed;
    Ok(current)
}

/// Generate the step's variants in parallel, bounded by the worker pool.
#[allow(clippy::too_many_arguments)]
async fn generate_variants(
    ctx: &RunCtx,
    cell: &Cell,
    spec: &ReforgeSpec,
    current: &BodyOutput,
    step: usize,
    step_trace: &str,
    session_id: &str,
    model: &str,
    depth: usize,
) -> Vec<(String, Usage)> {
    let semaphore = Arc::new(Semaphore::new(ctx.config.worker_pool.max(1)));
    let mut handles = Vec::with_capacity(spec.factor_per_step);
    for index in 0..spec.factor_per_step {
        let ctx = ctx.clone();
        let cell_name = cell.name.clone();
        let honing = spec.honing_prompt.clone();
        let mutate = spec.mutate;
        let content = current.content.clone();
        let step_trace = step_trace.to_string();
        let session_id = session_id.to_string();
        let model = model.to_string();
        let semaphore = semaphore.clone();

        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("worker pool semaphore closed");
            let variant_trace = ctx.trace.begin(
                TraceKind::Candidate,
                format!("variant-{}", index),
                Some(&step_trace),
                depth,
            );
            ctx.trace.mark_candidate(&variant_trace, index, None);
            ctx.trace.mark_reforge_step(&variant_trace, step);
            ctx.bus
                .publish(
                    &session_id,
                    &variant_trace,
                    EventKind::CandidateStart,
                    json!({
                        "cascade_id": ctx.cascade_id,
                        "cell": cell_name,
                        "index": index,
                        "phase": "reforge",
                        "step": step,
                    }),
                )
                .await;

            let directive = if mutate {
                format!("{}\n\n", mutation_directive(index))
            } else {
                String::new()
            };
            let prompt = format!(
                "{}{}\n\nCurrent best output:\n{}\n\nProduce an improved version. Reply with only the improved output.",
                directive, honing, content
            );
            let agent = Agent::new(ctx.transport.clone(), model);
            let result = agent
                .turn(vec![ChatMessage::text(Role::User, prompt)], Vec::new())
                .await;

            match result {
                Ok(turn) => {
                    ctx.trace.record_usage(
                        &variant_trace,
                        turn.usage.prompt_tokens,
                        turn.usage.completion_tokens,
                        turn.usage.cost_usd,
                        None,
                    );
                    ctx.bus
                        .publish(
                            &session_id,
                            &variant_trace,
                            EventKind::CandidateComplete,
                            json!({
                                "cascade_id": ctx.cascade_id,
                                "cell": cell_name,
                                "index": index,
                                "phase": "reforge",
                                "step": step,
                                "success": true,
                            }),
                        )
                        .await;
                    ctx.trace.end(&variant_trace, TraceStatus::Ok);
                    Some((turn.content, turn.usage))
                }
                Err(e) => {
                    ctx.bus
                        .publish(
                            &session_id,
                            &variant_trace,
                            EventKind::CandidateComplete,
                            json!({
                                "cascade_id": ctx.cascade_id,
                                "cell": cell_name,
                                "index": index,
                                "phase": "reforge",
                                "step": step,
                                "success": false,
                                "error": e.to_string(),
                            }),
                        )
                        .await;
                    ctx.trace.end(&variant_trace, TraceStatus::Error);
                    None
                }
            }
        }));
    }

    let mut variants = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(Some(variant)) => variants.push(variant),
            Ok(None) => {}
            Err(e) => log::warn!("reforge variant task failed to join: {}", e),
        }
    }
    variants
}

/// Carry refined text back into the committed value shape: structured
/// outputs stay structured when the variant parses, everything else is a
/// plain string.
fn refined_value(previous: &Value, refined: &str) -> Value {
    if previous.is_object() || previous.is_array() {
        if let Ok(parsed) = serde_json::from_str::<Value>(refined.trim()) {
            if parsed.is_object() || parsed.is_array() {
                return parsed;
            }
        }
    }
    Value::String(refined.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn refined_value_preserves_structure_when_possible() {
        let previous = json!({"total": 1});
        assert_eq!(
            refined_value(&previous, "{\"total\": 2}"),
            json!({"total": 2})
        );
        assert_eq!(
            refined_value(&previous, "not json"),
            Value::String("not json".to_string())
        );
        assert_eq!(
            refined_value(&Value::String("a".to_string()), "{\"x\": 1}"),
            Value::String("{\"x\": 1}".to_string())
        );
    }
}
