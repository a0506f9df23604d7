//! Built-in traits registered at engine startup.
//!
//! `set_state` is the only sanctioned write path into an echo's `state`: it
//! returns its mutation in the outcome's `_state` envelope and the runner
//! applies and logs it, which keeps trait execution pure and candidate
//! branches isolated. `route_to` exists mostly for its metadata — the runner
//! intercepts and validates routing calls itself — but executes sensibly if
//! invoked directly. The signal traits are registered from
//! [`signals`](crate::lars::signals).

use crate::lars::signals::{register_signal_traits, SignalHub};
use crate::lars::trait_registry::{
    TraitContext, TraitError, TraitHandler, TraitMetadata, TraitOutcome, TraitRegistry,
};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

struct SetStateTrait;

#[async_trait]
impl TraitHandler for SetStateTrait {
    fn metadata(&self) -> TraitMetadata {
        TraitMetadata::new(
            "set_state",
            "Set a key in the run's shared state. Later reads via {{ state.<key> }} see the new value.",
        )
        .with_args_schema(json!({
            "type": "object",
            "properties": {
                "key": {"type": "string"},
                "value": {},
            },
            "required": ["key"],
        }))
        .with_returns("{content: \"ok\"}")
    }

    async fn execute(&self, args: Value, _ctx: &TraitContext) -> Result<TraitOutcome, TraitError> {
        let key = args
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| TraitError::InvalidArguments("key is required".to_string()))?;
        let value = args.get("value").cloned().unwrap_or(Value::Null);

        let mut updates = Map::new();
        updates.insert(key.to_string(), value.clone());
        let mut outcome = TraitOutcome::of(json!({"key": key, "value": value}));
        outcome.content = Some(format!("state.{} set", key));
        outcome.state_updates = updates;
        Ok(outcome)
    }
}

struct RouteToTrait;

#[async_trait]
impl TraitHandler for RouteToTrait {
    fn metadata(&self) -> TraitMetadata {
        TraitMetadata::new(
            "route_to",
            "Hand off control to the next cell. Call exactly once, when you have decided.",
        )
        .with_args_schema(json!({
            "type": "object",
            "properties": {"target": {"type": "string"}},
            "required": ["target"],
        }))
    }

    async fn execute(&self, args: Value, _ctx: &TraitContext) -> Result<TraitOutcome, TraitError> {
        let target = args
            .get("target")
            .and_then(Value::as_str)
            .ok_or_else(|| TraitError::InvalidArguments("target is required".to_string()))?;
        let mut outcome = TraitOutcome::of(json!({"target": target}));
        outcome.content = Some(format!("routing to {}", target));
        outcome.route = Some(target.to_string());
        Ok(outcome)
    }
}

/// Register every built-in trait: state, routing, and the signal operations.
pub fn register_builtins(registry: &mut TraitRegistry, hub: &Arc<SignalHub>) {
    registry.register(Arc::new(SetStateTrait));
    registry.register(Arc::new(RouteToTrait));
    register_signal_traits(registry, hub);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_state_returns_its_mutation_in_the_envelope() {
        let handler = SetStateTrait;
        let ctx = TraitContext::new("s1", "demo");
        let outcome = handler
            .execute(json!({"key": "region", "value": "emea"}), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.state_updates.get("region"), Some(&json!("emea")));
        assert_eq!(outcome.content_text(), "state.region set");
    }

    #[tokio::test]
    async fn route_to_carries_the_target() {
        let handler = RouteToTrait;
        let ctx = TraitContext::new("s1", "demo");
        let outcome = handler
            .execute(json!({"target": "positive"}), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.route.as_deref(), Some("positive"));
    }

    #[tokio::test]
    async fn missing_key_is_invalid() {
        let handler = SetStateTrait;
        let ctx = TraitContext::new("s1", "demo");
        let err = handler.execute(json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, TraitError::InvalidArguments(_)));
    }
}
