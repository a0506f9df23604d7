//! Ward execution: pre/post validators with blocking, retry, and advisory
//! semantics.
//!
//! A ward wraps a validator — either a registered trait (deterministic) or an
//! inline LLM cell-lite — and interprets its verdict. The contract is a
//! `{valid: bool, reason: string}` object; a validator that fails to produce
//! that shape is treated as `valid: false, reason: "invalid validator
//! response"`. Ward execution is total: internal failures (missing trait,
//! template error, transport exhaustion) become failing verdicts rather than
//! panics, so the cell-level policy in the runner stays in charge.

use crate::lars::agent::Agent;
use crate::lars::cascade::{ValidatorSpec, WardSpec};
use crate::lars::echo::Echo;
use crate::lars::event::EventKind;
use crate::lars::runner::RunCtx;
use crate::lars::template;
use crate::lars::trace::{TraceKind, TraceStatus};
use crate::lars::trait_registry::TraitContext;
use crate::lars::transport::{ChatMessage, Role, Usage};
use serde_json::{json, Value};

/// Which side of the cell body a ward guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WardPhase {
    Pre,
    Post,
}

impl WardPhase {
    fn as_str(self) -> &'static str {
        match self {
            WardPhase::Pre => "pre",
            WardPhase::Post => "post",
        }
    }
}

/// A validator's interpreted verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct WardVerdict {
    pub valid: bool,
    pub reason: String,
}

impl WardVerdict {
    fn invalid_shape(detail: &str) -> Self {
        Self {
            valid: false,
            reason: format!("invalid validator response: {}", detail),
        }
    }
}

/// Outcome of one ward evaluation, with any LLM cost it incurred.
#[derive(Debug, Clone)]
pub struct WardCheck {
    pub verdict: WardVerdict,
    pub usage: Usage,
}

/// Extract a `{valid, reason}` verdict from a JSON value.
pub fn verdict_from_value(value: &Value) -> Option<WardVerdict> {
    let valid = value.get("valid")?.as_bool()?;
    let reason = value
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    Some(WardVerdict { valid, reason })
}

/// Extract a verdict from free text by locating the first balanced JSON
/// object that carries a `valid` field.
pub fn verdict_from_text(text: &str) -> Option<WardVerdict> {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(fragment) = balanced_json(&text[start..]) {
            if let Ok(value) = serde_json::from_str::<Value>(fragment) {
                if let Some(verdict) = verdict_from_value(&value) {
                    return Some(verdict);
                }
            }
        }
        search_from = start + 1;
    }
    None
}

/// Return the prefix of `text` forming a balanced `{...}` fragment.
pub(crate) fn balanced_json(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[..i + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Evaluate one ward against a subject value.
///
/// Emits a `ward` trace node and a `ward_pass`/`ward_fail` event; never
/// fails — internal errors become failing verdicts.
pub async fn run_ward(
    ctx: &RunCtx,
    ward: &WardSpec,
    phase: WardPhase,
    cell_name: &str,
    subject: &Value,
    echo: &Echo,
    parent_trace: &str,
) -> WardCheck {
    let ward_name = match &ward.validator {
        ValidatorSpec::TraitName(name) => name.clone(),
        ValidatorSpec::Inline(_) => format!("{}-ward", cell_name),
    };
    let trace_id = ctx
        .trace
        .begin(TraceKind::Ward, &ward_name, Some(parent_trace), echo.depth);

    let check = execute_validator(ctx, &ward.validator, subject, echo, cell_name).await;

    let (kind, status) = if check.verdict.valid {
        (EventKind::WardPass, TraceStatus::Ok)
    } else {
        (EventKind::WardFail, TraceStatus::Error)
    };
    ctx.bus
        .publish(
            &echo.session_id,
            &trace_id,
            kind,
            json!({
                "cascade_id": ctx.cascade_id,
                "cell": cell_name,
                "phase": phase.as_str(),
                "ward": ward_name,
                "mode": ward.mode,
                "valid": check.verdict.valid,
                "reason": check.verdict.reason,
            }),
        )
        .await;
    ctx.trace
        .record_usage(&trace_id, check.usage.prompt_tokens, check.usage.completion_tokens, check.usage.cost_usd, None);
    ctx.trace.end(&trace_id, status);
    check
}

async fn execute_validator(
    ctx: &RunCtx,
    validator: &ValidatorSpec,
    subject: &Value,
    echo: &Echo,
    cell_name: &str,
) -> WardCheck {
    match validator {
        ValidatorSpec::TraitName(name) => {
            let trait_ctx = TraitContext {
                session_id: echo.session_id.clone(),
                cascade_id: ctx.cascade_id.clone(),
                caller_id: ctx.caller_id.clone(),
                cell_name: Some(cell_name.to_string()),
                depth: echo.depth,
                state: echo.state.clone(),
                trace_id: None,
            };
            let result = ctx
                .registry
                .execute(name, json!({"value": subject}), &trait_ctx, ctx.config.tool_timeout)
                .await;
            let verdict = match result {
                Ok(outcome) => verdict_from_value(&outcome.value)
                    .or_else(|| verdict_from_text(&outcome.content_text()))
                    .unwrap_or_else(|| WardVerdict::invalid_shape("no valid/reason fields")),
                Err(e) => WardVerdict::invalid_shape(&e.to_string()),
            };
            WardCheck {
                verdict,
                usage: Usage::default(),
            }
        }
        ValidatorSpec::Inline(inline) => {
            let context = match template::template_context(echo, None) {
                Ok(context) => context,
                Err(e) => {
                    return WardCheck {
                        verdict: WardVerdict::invalid_shape(&e.to_string()),
                        usage: Usage::default(),
                    }
                }
            };
            let rendered = match template::render(&inline.instructions, &context) {
                Ok(rendered) => rendered,
                Err(e) => {
                    return WardCheck {
                        verdict: WardVerdict::invalid_shape(&e.to_string()),
                        usage: Usage::default(),
                    }
                }
            };
            let subject_text =
                serde_json::to_string_pretty(subject).unwrap_or_else(|_| subject.to_string());
            let prompt = format!(
                "{}\n\nContent under review:\n{}\n\nReply with a JSON object: {{\"valid\": true|false, \"reason\": \"...\"}}",
                rendered, subject_text
            );
            let model = inline
                .model
                .clone()
                .unwrap_or_else(|| ctx.transport.default_model().to_string());
            let agent = Agent::new(ctx.transport.clone(), model);
            match agent
                .turn(vec![ChatMessage::text(Role::User, prompt)], Vec::new())
                .await
            {
                Ok(turn) => {
                    let verdict = verdict_from_text(&turn.content)
                        .unwrap_or_else(|| WardVerdict::invalid_shape("no verdict object found"));
                    WardCheck {
                        verdict,
                        usage: turn.usage,
                    }
                }
                Err(e) => WardCheck {
                    verdict: WardVerdict::invalid_shape(&e.to_string()),
                    usage: Usage::default(),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn verdict_parses_from_object() {
        let verdict = verdict_from_value(&json!({"valid": false, "reason": "unsafe"})).unwrap();
        assert!(!verdict.valid);
        assert_eq!(verdict.reason, "unsafe");
    }

    #[test]
    fn verdict_parses_from_surrounding_prose() {
        let text = "After review I concluded: {\"valid\": true, \"reason\": \"fine\"} — done.";
        let verdict = verdict_from_text(text).unwrap();
        assert!(verdict.valid);
        assert_eq!(verdict.reason, "fine");
    }

    #[test]
    fn unstructured_response_has_no_verdict() {
        assert!(verdict_from_text("looks good to me!").is_none());
        assert!(verdict_from_text("{\"something\": 1}").is_none());
    }

    #[test]
    fn balanced_json_handles_nesting_and_strings() {
        let text = "{\"a\": {\"b\": \"}\"}, \"valid\": true} trailing";
        let fragment = balanced_json(text).unwrap();
        assert!(serde_json::from_str::<Value>(fragment).is_ok());
    }
}
