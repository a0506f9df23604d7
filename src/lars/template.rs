//! Late-bound template expansion for cell instructions and tool inputs.
//!
//! Cascade documents embed Jinja-style templates (`{{ input.* }}`,
//! `{{ state.* }}`, `{{ outputs.* }}`) that must close over the outputs of
//! prior cells, so rendering happens at cell preparation time, never at
//! cascade load. Undefined variables are a hard render error — a typo'd
//! reference fails the cell loudly instead of silently expanding to an empty
//! string.
//!
//! The module keeps one shared [`Environment`] behind a lazy static (compiled
//! templates are cached by content hash) and exposes:
//!
//! - [`render`] — expand a template against a context value;
//! - [`eval_predicate`] — truthiness-evaluate a `loop_until` expression;
//! - [`template_context`] — build the context exposed to a cell from its
//!   [`Echo`] and optional `context.from` clauses.
//!
//! Filters available in templates: `tojson`, `truncate(n)`, `int`,
//! `default(x)`, plus the minijinja built-ins.

use crate::lars::cascade::ContextSpec;
use crate::lars::echo::Echo;
use lazy_static::lazy_static;
use minijinja::value::Value as JinjaValue;
use minijinja::{Environment, UndefinedBehavior};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::convert::TryFrom;
use std::error::Error;
use std::fmt;
use std::sync::Mutex;

/// Errors raised while rendering templates or evaluating predicates.
#[derive(Debug, Clone)]
pub enum TemplateError {
    Render(String),
    Predicate(String),
    Context(String),
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateError::Render(msg) => write!(f, "template render failed: {}", msg),
            TemplateError::Predicate(msg) => write!(f, "predicate evaluation failed: {}", msg),
            TemplateError::Context(msg) => write!(f, "template context error: {}", msg),
        }
    }
}

impl Error for TemplateError {}

lazy_static! {
    static ref ENV: Mutex<Environment<'static>> = Mutex::new(build_environment());
}

fn build_environment() -> Environment<'static> {
    let mut env = Environment::new();
    // Fail loudly on undefined variables.
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_filter("tojson", tojson);
    env.add_filter("truncate", truncate);
    env.add_filter("int", int);
    env.add_filter("default", default);
    env
}

fn tojson(value: JinjaValue) -> Result<String, minijinja::Error> {
    serde_json::to_string(&value).map_err(|e| {
        minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string())
    })
}

fn truncate(value: JinjaValue, length: u32) -> String {
    let text = match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    };
    text.chars().take(length as usize).collect()
}

fn int(value: JinjaValue) -> Result<i64, minijinja::Error> {
    if let Some(text) = value.as_str() {
        return text.trim().parse::<i64>().map_err(|e| {
            minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string())
        });
    }
    i64::try_from(value)
}

fn default(value: JinjaValue, fallback: Option<JinjaValue>) -> JinjaValue {
    if value.is_undefined() {
        fallback.unwrap_or_else(|| JinjaValue::from(""))
    } else {
        value
    }
}

/// Expand a minijinja error to include its sources (location etc).
fn describe(error: minijinja::Error) -> String {
    let mut error = &error as &dyn Error;
    let mut message = format!("{:#}", error);
    while let Some(source) = error.source() {
        message.push_str(&format!("\n{:#}", source));
        error = source;
    }
    message
}

/// Render a template string against a JSON context.
///
/// Compiled templates are cached in the shared environment keyed by a
/// content hash, so repeated cells pay compilation once.
pub fn render(template: &str, context: &Value) -> Result<String, TemplateError> {
    let mut hasher = Sha256::new();
    hasher.update(template.as_bytes());
    let key = format!("{:x}", hasher.finalize());

    let mut env = ENV
        .lock()
        .map_err(|e| TemplateError::Render(format!("template environment poisoned: {}", e)))?;

    if env.get_template(&key).is_err() {
        env.add_template_owned(key.clone(), template.to_string())
            .map_err(|e| TemplateError::Render(describe(e)))?;
    }
    let compiled = env
        .get_template(&key)
        .map_err(|e| TemplateError::Render(describe(e)))?;
    compiled
        .render(context)
        .map_err(|e| TemplateError::Render(describe(e)))
}

/// Evaluate a `loop_until` predicate for truthiness against a JSON context.
pub fn eval_predicate(expr: &str, context: &Value) -> Result<bool, TemplateError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    let compiled = env
        .compile_expression(expr)
        .map_err(|e| TemplateError::Predicate(describe(e)))?;
    let result = compiled
        .eval(context)
        .map_err(|e| TemplateError::Predicate(describe(e)))?;
    Ok(result.is_true())
}

/// Build the template context a cell sees: `input`, `state`, and `outputs`.
///
/// Without a `context` override the cell sees every committed output. With
/// `context.from` clauses, `outputs` is narrowed to the named cells (which
/// must have completed — referencing an incomplete cell is an error), and
/// each clause may select specific fields of an object output.
pub fn template_context(
    echo: &Echo,
    context: Option<&ContextSpec>,
) -> Result<Value, TemplateError> {
    let outputs = match context {
        None => Value::Object(echo.outputs.clone()),
        Some(spec) if spec.from.is_empty() => Value::Object(echo.outputs.clone()),
        Some(spec) => {
            let mut narrowed = Map::new();
            for clause in &spec.from {
                let output = echo.output(&clause.cell).map_err(|e| {
                    TemplateError::Context(format!("context.from: {}", e))
                })?;
                let value = match (&clause.fields, output) {
                    (Some(fields), Value::Object(obj)) => {
                        let mut picked = Map::new();
                        for field in fields {
                            if let Some(v) = obj.get(field) {
                                picked.insert(field.clone(), v.clone());
                            }
                        }
                        Value::Object(picked)
                    }
                    _ => output.clone(),
                };
                narrowed.insert(clause.cell.clone(), value);
            }
            Value::Object(narrowed)
        }
    };
    Ok(json!({
        "input": echo.input,
        "state": Value::Object(echo.state.clone()),
        "outputs": outputs,
    }))
}
