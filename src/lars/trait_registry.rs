//! Trait abstraction layer: the tools an agent cell can call.
//!
//! A *trait* is a named callable with introspection metadata (a JSON-Schema
//! for its arguments, a description, a declared return shape). Traits come
//! from three sources:
//!
//! 1. built-ins registered at engine startup (`set_state`, `route_to`, the
//!    signal operations);
//! 2. discovered cascades that declare an `inputs_schema` — each becomes a
//!    callable that synchronously runs the child cascade;
//! 3. user-registered callables.
//!
//! The [`TraitRegistry`] is constructed once, populated before the first
//! run, and then shared immutably — lookups after startup are lock-free.
//!
//! # Tool-result convention
//!
//! Every trait returns either a plain JSON value or the richer envelope
//! `{content, images, _route, _state, ...}`. [`TraitOutcome::from_value`]
//! lifts either shape into a [`TraitOutcome`]; the runner then persists
//! images, applies state updates, and honours routing. "No content" is not
//! an error — the tool-result text defaults to the JSON of the value.

use crate::lars::transport::ToolSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Context arguments the runner can inject into a trait invocation when the
/// trait's metadata declares them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inject {
    EchoState,
    SessionId,
    CallerId,
    CellName,
}

/// Introspection metadata attached to every registered trait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraitMetadata {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub args_schema: Value,
    /// Free-text description of the return shape, if declared.
    #[serde(default)]
    pub returns: Option<String>,
    /// Which runner-injected context arguments the trait wants.
    #[serde(default)]
    pub injects: Vec<Inject>,
}

impl TraitMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            args_schema: serde_json::json!({"type": "object", "properties": {}}),
            returns: None,
            injects: Vec::new(),
        }
    }

    pub fn with_args_schema(mut self, schema: Value) -> Self {
        self.args_schema = schema;
        self
    }

    pub fn with_returns(mut self, returns: impl Into<String>) -> Self {
        self.returns = Some(returns.into());
        self
    }

    pub fn with_injects(mut self, injects: Vec<Inject>) -> Self {
        self.injects = injects;
        self
    }

    /// Convert to the provider-facing tool schema.
    pub fn to_tool_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters_schema: self.args_schema.clone(),
        }
    }
}

/// Error types for trait operations.
#[derive(Debug, Clone)]
pub enum TraitError {
    /// Requested trait is not registered.
    NotFound(String),
    /// The provided JSON arguments failed schema validation.
    InvalidArguments(String),
    /// Trait execution completed with an application level failure.
    ExecutionFailed(String),
    /// The per-call timeout elapsed.
    Timeout(String),
}

impl fmt::Display for TraitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraitError::NotFound(name) => write!(f, "unknown trait: {}", name),
            TraitError::InvalidArguments(msg) => write!(f, "invalid arguments: {}", msg),
            TraitError::ExecutionFailed(msg) => write!(f, "trait execution failed: {}", msg),
            TraitError::Timeout(name) => write!(f, "trait '{}' timed out", name),
        }
    }
}

impl Error for TraitError {}

/// Read-only view of the run handed to a trait invocation.
#[derive(Debug, Clone)]
pub struct TraitContext {
    pub session_id: String,
    pub cascade_id: String,
    /// Identity of the caller when the run was started on someone's behalf.
    pub caller_id: Option<String>,
    /// Cell issuing the call, when there is one.
    pub cell_name: Option<String>,
    /// Sub-cascade nesting depth of the calling run.
    pub depth: usize,
    /// Snapshot of the echo's `state` at call time.
    pub state: Map<String, Value>,
    /// Trace node of the tool call itself, for child linkage.
    pub trace_id: Option<String>,
}

impl TraitContext {
    pub fn new(session_id: impl Into<String>, cascade_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            cascade_id: cascade_id.into(),
            caller_id: None,
            cell_name: None,
            depth: 0,
            state: Map::new(),
            trace_id: None,
        }
    }
}

/// The result of a trait execution, lifted from the open-sum envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraitOutcome {
    /// The raw returned value.
    pub value: Value,
    /// Tool-result message text. When absent, the JSON of `value` is used.
    pub content: Option<String>,
    /// Image references: file paths or base64 payloads.
    pub images: Vec<String>,
    /// Routing discriminator (`_route`).
    pub route: Option<String>,
    /// State mutations to apply to the caller's echo (`_state`). Only the
    /// `set_state` built-in populates this.
    pub state_updates: Map<String, Value>,
    /// Any further envelope fields, preserved verbatim.
    pub extra: Map<String, Value>,
}

impl TraitOutcome {
    /// Wrap a plain value with no envelope fields.
    pub fn of(value: Value) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    /// Lift a returned value: envelope objects are destructured, anything
    /// else is a plain value.
    pub fn from_value(value: Value) -> Self {
        let obj = match value.as_object() {
            Some(obj)
                if obj.contains_key("content")
                    || obj.contains_key("images")
                    || obj.contains_key("_route")
                    || obj.contains_key("_state") =>
            {
                obj.clone()
            }
            _ => return Self::of(value),
        };
        let mut outcome = Self::of(value.clone());
        let mut extra = Map::new();
        for (key, field) in obj {
            match key.as_str() {
                "content" => outcome.content = field.as_str().map(|s| s.to_string()),
                "images" => {
                    if let Value::Array(items) = field {
                        outcome.images = items
                            .into_iter()
                            .filter_map(|item| item.as_str().map(|s| s.to_string()))
                            .collect();
                    }
                }
                "_route" => outcome.route = field.as_str().map(|s| s.to_string()),
                "_state" => {
                    if let Value::Object(updates) = field {
                        outcome.state_updates = updates;
                    }
                }
                _ => {
                    extra.insert(key, field);
                }
            }
        }
        outcome.extra = extra;
        outcome
    }

    /// The text presented to the agent as the tool-result message.
    pub fn content_text(&self) -> String {
        match &self.content {
            Some(content) => content.clone(),
            None => serde_json::to_string(&self.value).unwrap_or_else(|_| "null".to_string()),
        }
    }
}

/// A callable tool registered by name.
#[async_trait]
pub trait TraitHandler: Send + Sync {
    fn metadata(&self) -> TraitMetadata;

    async fn execute(&self, args: Value, ctx: &TraitContext) -> Result<TraitOutcome, TraitError>;
}

/// Adapter exposing a plain function as a trait.
///
/// Useful for user-registered callables and tests:
///
/// ```rust
/// use lars::lars::trait_registry::{FnTrait, TraitMetadata};
/// use serde_json::json;
///
/// let word_count = FnTrait::new(
///     TraitMetadata::new("word_count", "Count words in a string."),
///     |args| {
///         let text = args["text"].as_str().unwrap_or("");
///         Ok(json!({"count": text.split_whitespace().count()}))
///     },
/// );
/// ```
pub struct FnTrait<F> {
    metadata: TraitMetadata,
    func: F,
}

impl<F> FnTrait<F>
where
    F: Fn(Value) -> Result<Value, String> + Send + Sync,
{
    pub fn new(metadata: TraitMetadata, func: F) -> Self {
        Self { metadata, func }
    }
}

#[async_trait]
impl<F> TraitHandler for FnTrait<F>
where
    F: Fn(Value) -> Result<Value, String> + Send + Sync,
{
    fn metadata(&self) -> TraitMetadata {
        self.metadata.clone()
    }

    async fn execute(&self, args: Value, _ctx: &TraitContext) -> Result<TraitOutcome, TraitError> {
        let value = (self.func)(args).map_err(TraitError::ExecutionFailed)?;
        Ok(TraitOutcome::from_value(value))
    }
}

/// Minimal structural validation of arguments against a trait's schema.
///
/// Checks `required` membership and the `type` of declared properties; deeper
/// schema features are the trait's own concern.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), TraitError> {
    let schema = match schema.as_object() {
        Some(schema) => schema,
        None => return Ok(()),
    };
    let args_obj = match args.as_object() {
        Some(obj) => obj,
        None => {
            if schema.get("type").and_then(Value::as_str) == Some("object") {
                return Err(TraitError::InvalidArguments(
                    "expected an arguments object".to_string(),
                ));
            }
            return Ok(());
        }
    };
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required {
            if let Some(name) = field.as_str() {
                if !args_obj.contains_key(name) {
                    return Err(TraitError::InvalidArguments(format!(
                        "missing required argument '{}'",
                        name
                    )));
                }
            }
        }
    }
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, prop) in properties {
            let declared = prop.get("type").and_then(Value::as_str);
            let value = match args_obj.get(name) {
                Some(value) => value,
                None => continue,
            };
            let ok = match declared {
                Some("string") => value.is_string(),
                Some("number") => value.is_number(),
                Some("integer") => value.is_i64() || value.is_u64(),
                Some("boolean") => value.is_boolean(),
                Some("array") => value.is_array(),
                Some("object") => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(TraitError::InvalidArguments(format!(
                    "argument '{}' should be of type {}",
                    name,
                    declared.unwrap_or("unknown")
                )));
            }
        }
    }
    Ok(())
}

/// Process-wide mapping of trait name → handler.
pub struct TraitRegistry {
    traits: HashMap<String, Arc<dyn TraitHandler>>,
}

impl TraitRegistry {
    pub fn new() -> Self {
        Self {
            traits: HashMap::new(),
        }
    }

    /// Insert or replace a handler under its metadata name.
    pub fn register(&mut self, handler: Arc<dyn TraitHandler>) {
        let name = handler.metadata().name;
        if self.traits.contains_key(&name) {
            log::warn!("trait '{}' re-registered; previous handler replaced", name);
        }
        self.traits.insert(name, handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.traits.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn TraitHandler>> {
        self.traits.get(name)
    }

    /// Metadata for every registered trait, sorted by name for stable
    /// presentation to quartermaster agents.
    pub fn list(&self) -> Vec<TraitMetadata> {
        let mut all: Vec<TraitMetadata> = self.traits.values().map(|t| t.metadata()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Provider tool schemas for the named subset, skipping unknown names
    /// with a warning.
    pub fn tool_specs(&self, names: &[String]) -> Vec<ToolSpec> {
        let mut specs = Vec::new();
        for name in names {
            match self.traits.get(name) {
                Some(handler) => specs.push(handler.metadata().to_tool_spec()),
                None => log::warn!("cell references unknown trait '{}'", name),
            }
        }
        specs
    }

    /// Execute a named trait: validate arguments, run under the timeout,
    /// lift the result into a [`TraitOutcome`].
    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        ctx: &TraitContext,
        timeout: Duration,
    ) -> Result<TraitOutcome, TraitError> {
        let handler = self
            .traits
            .get(name)
            .ok_or_else(|| TraitError::NotFound(name.to_string()))?;
        validate_args(&handler.metadata().args_schema, &args)?;
        match tokio::time::timeout(timeout, handler.execute(args, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(TraitError::Timeout(name.to_string())),
        }
    }
}

impl Default for TraitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_trait() -> FnTrait<impl Fn(Value) -> Result<Value, String> + Send + Sync> {
        FnTrait::new(
            TraitMetadata::new("echo", "Returns its arguments.").with_args_schema(json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"],
            })),
            |args| Ok(json!({"content": args["text"]})),
        )
    }

    #[tokio::test]
    async fn registry_executes_registered_trait() {
        let mut registry = TraitRegistry::new();
        registry.register(Arc::new(echo_trait()));

        let ctx = TraitContext::new("s1", "demo");
        let outcome = registry
            .execute("echo", json!({"text": "hi"}), &ctx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome.content_text(), "hi");
    }

    #[tokio::test]
    async fn unknown_trait_is_not_found() {
        let registry = TraitRegistry::new();
        let ctx = TraitContext::new("s1", "demo");
        let err = registry
            .execute("nope", json!({}), &ctx, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TraitError::NotFound(_)));
    }

    #[tokio::test]
    async fn schema_validation_rejects_bad_args() {
        let mut registry = TraitRegistry::new();
        registry.register(Arc::new(echo_trait()));
        let ctx = TraitContext::new("s1", "demo");

        let missing = registry
            .execute("echo", json!({}), &ctx, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(missing, TraitError::InvalidArguments(_)));

        let wrong_type = registry
            .execute("echo", json!({"text": 7}), &ctx, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(wrong_type, TraitError::InvalidArguments(_)));
    }

    #[test]
    fn envelope_fields_are_lifted() {
        let outcome = TraitOutcome::from_value(json!({
            "content": "done",
            "images": ["/tmp/a.png"],
            "_route": "positive",
            "rows": 10,
        }));
        assert_eq!(outcome.content.as_deref(), Some("done"));
        assert_eq!(outcome.images, vec!["/tmp/a.png".to_string()]);
        assert_eq!(outcome.route.as_deref(), Some("positive"));
        assert_eq!(outcome.extra.get("rows"), Some(&json!(10)));
    }

    #[test]
    fn plain_values_pass_through() {
        let outcome = TraitOutcome::from_value(json!({"answer": 42}));
        assert!(outcome.content.is_none());
        assert!(outcome.route.is_none());
        assert_eq!(outcome.content_text(), "{\"answer\":42}");
    }
}
