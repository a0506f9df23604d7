use async_trait::async_trait;
use lars::lars::cascade::Cascade;
use lars::lars::echo::RunErrorKind;
use lars::lars::event::EventKind;
use lars::lars::store::{LogStore, MemoryLogStore};
use lars::lars::transport::{ChatRequest, ChatResponse, ChatTransport, ContentPart, Role, ToolCall, Usage};
use lars::{CascadeEngine, RunOptions, RunStatus};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

struct ScriptedTransport {
    responses: Mutex<VecDeque<ChatResponse>>,
}

impl ScriptedTransport {
    fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
        }
    }

    fn text(content: &str) -> ChatResponse {
        ChatResponse {
            content: content.to_string(),
            tool_calls: Vec::new(),
            usage: Usage::default(),
        }
    }

    fn tool_call(name: &str, arguments: serde_json::Value) -> ChatResponse {
        ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: format!("call_{}", name),
                name: name.to_string(),
                arguments,
            }],
            usage: Usage::default(),
        }
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn chat(
        &self,
        _request: ChatRequest,
    ) -> Result<ChatResponse, Box<dyn std::error::Error + Send + Sync>> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Box::<dyn std::error::Error + Send + Sync>::from("script exhausted"))
    }

    fn default_model(&self) -> &str {
        "mock/scripted"
    }
}

const CLASSIFIER: &str = r#"
cascade_id: classifier
cells:
  - name: classify
    instructions: "Classify the sentiment of: {{ input.text }}"
    handoffs: [positive, negative, neutral]
  - name: positive
    instructions: "Write a cheerful reply."
  - name: negative
    instructions: "Write an apologetic reply."
  - name: neutral
    instructions: "Write a neutral reply."
"#;

#[tokio::test]
async fn agent_routes_via_route_to() {
    let cascade = Cascade::from_yaml(CLASSIFIER).unwrap();
    let transport = Arc::new(ScriptedTransport::new(vec![
        ScriptedTransport::tool_call("route_to", json!({"target": "positive"})),
        ScriptedTransport::text("So glad you love it!"),
    ]));
    let store = Arc::new(MemoryLogStore::new());
    let engine = CascadeEngine::builder(transport, store.clone())
        .with_cascade(cascade)
        .build()
        .unwrap();

    let report = engine
        .run(
            "classifier",
            json!({"text": "I love it"}),
            RunOptions {
                session_id: Some("route-1".to_string()),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    let cells: Vec<&str> = report.lineage.iter().map(|e| e.cell.as_str()).collect();
    assert_eq!(cells, vec!["classify", "positive"]);

    let events = store.events_for_session("route-1").await.unwrap();
    let handoff = events
        .iter()
        .find(|e| e.kind == EventKind::Handoff)
        .expect("a handoff event");
    assert_eq!(handoff.payload["target"], "positive");
    assert_eq!(handoff.payload["from"], "classify");
}

#[tokio::test]
async fn invalid_route_target_feeds_back_and_agent_retries() {
    let cascade = Cascade::from_yaml(CLASSIFIER).unwrap();
    let transport = Arc::new(ScriptedTransport::new(vec![
        ScriptedTransport::tool_call("route_to", json!({"target": "bogus"})),
        ScriptedTransport::tool_call("route_to", json!({"target": "neutral"})),
        ScriptedTransport::text("Noted."),
    ]));
    let engine = CascadeEngine::builder(transport, Arc::new(MemoryLogStore::new()))
        .with_cascade(cascade)
        .build()
        .unwrap();

    let report = engine
        .run("classifier", json!({"text": "meh"}), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    let cells: Vec<&str> = report.lineage.iter().map(|e| e.cell.as_str()).collect();
    assert_eq!(cells, vec!["classify", "neutral"]);

    // The rejection reached the agent as a tool-result message.
    let rejection = report.history.iter().any(|m| {
        matches!(m.role, Role::Tool { .. })
            && m.parts.iter().any(|p| {
                matches!(p, ContentPart::Text(text) if text.contains("invalid route target 'bogus'"))
            })
    });
    assert!(rejection);
}

#[tokio::test]
async fn route_to_without_handoffs_is_a_routing_error() {
    let doc = r#"
cascade_id: solo
cells:
  - name: only
    instructions: "do the thing"
"#;
    let cascade = Cascade::from_yaml(doc).unwrap();
    let transport = Arc::new(ScriptedTransport::new(vec![ScriptedTransport::tool_call(
        "route_to",
        json!({"target": "anywhere"}),
    )]));
    let engine = CascadeEngine::builder(transport, Arc::new(MemoryLogStore::new()))
        .with_cascade(cascade)
        .build()
        .unwrap();

    let report = engine
        .run("solo", json!({}), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Error);
    assert!(report
        .errors
        .iter()
        .any(|e| e.kind == RunErrorKind::RoutingError));
    assert!(!report.outputs.contains_key("only"));
}

#[tokio::test]
async fn only_the_first_route_to_in_a_turn_is_honored() {
    let cascade = Cascade::from_yaml(CLASSIFIER).unwrap();
    let mut multi = ScriptedTransport::tool_call("route_to", json!({"target": "negative"}));
    multi.tool_calls.push(ToolCall {
        id: "call_second".to_string(),
        name: "route_to".to_string(),
        arguments: json!({"target": "positive"}),
    });
    let transport = Arc::new(ScriptedTransport::new(vec![
        multi,
        ScriptedTransport::text("Sorry about that."),
    ]));
    let engine = CascadeEngine::builder(transport, Arc::new(MemoryLogStore::new()))
        .with_cascade(cascade)
        .build()
        .unwrap();

    let report = engine
        .run("classifier", json!({"text": "broken"}), RunOptions::default())
        .await
        .unwrap();

    let cells: Vec<&str> = report.lineage.iter().map(|e| e.cell.as_str()).collect();
    assert_eq!(cells, vec!["classify", "negative"]);
}

#[tokio::test]
async fn deterministic_routing_follows_the_route_discriminator() {
    let doc = r#"
cascade_id: fetcher
cells:
  - name: fetch
    tool: probe
    routing:
      ok: celebrate
      err: apologize
  - name: celebrate
    instructions: "It worked."
  - name: apologize
    instructions: "It did not work."
"#;
    let cascade = Cascade::from_yaml(doc).unwrap();
    let probe = lars::lars::trait_registry::FnTrait::new(
        lars::lars::trait_registry::TraitMetadata::new("probe", "Probe a thing."),
        |_args| Ok(json!({"content": "probe failed", "_route": "err"})),
    );
    let transport = Arc::new(ScriptedTransport::new(vec![ScriptedTransport::text(
        "We hit an issue and are on it.",
    )]));
    let engine = CascadeEngine::builder(transport, Arc::new(MemoryLogStore::new()))
        .with_cascade(cascade)
        .with_trait(Arc::new(probe))
        .build()
        .unwrap();

    let report = engine
        .run("fetcher", json!({}), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    let cells: Vec<&str> = report.lineage.iter().map(|e| e.cell.as_str()).collect();
    assert_eq!(cells, vec!["fetch", "apologize"]);
}
