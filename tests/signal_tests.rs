use async_trait::async_trait;
use lars::lars::cascade::Cascade;
use lars::lars::config::EngineConfig;
use lars::lars::store::MemoryLogStore;
use lars::lars::transport::{ChatRequest, ChatResponse, ChatTransport, ContentPart, Role, ToolCall, Usage};
use lars::{CascadeEngine, RunOptions, RunStatus};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

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

const WAITER: &str = r#"
cascade_id: consumer
cells:
  - name: wait_for_data
    instructions: "Wait for the upstream data to land, then confirm."
    traits: [await_signal]
"#;

const FIRER: &str = r#"
cascade_id: producer
cells:
  - name: announce
    tool: fire_signal
    inputs:
      name: data_ready
      payload:
        rows: 10
"#;

fn tool_result_text(report: &lars::RunReport) -> String {
    report
        .history
        .iter()
        .filter(|m| matches!(m.role, Role::Tool { .. }))
        .flat_map(|m| m.parts.iter())
        .filter_map(|p| match p {
            ContentPart::Text(text) => Some(text.clone()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[tokio::test]
async fn two_cascades_rendezvous_on_a_signal() {
    let waiter = Cascade::from_yaml(WAITER).unwrap();
    let firer = Cascade::from_yaml(FIRER).unwrap();
    let transport = Arc::new(ScriptedTransport::new(vec![
        ScriptedTransport::tool_call(
            "await_signal",
            json!({"name": "data_ready", "timeout": "60s"}),
        ),
        ScriptedTransport::text("Data arrived; proceeding."),
    ]));
    let config = EngineConfig {
        signal_poll_interval: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let engine = CascadeEngine::builder(transport, Arc::new(MemoryLogStore::new()))
        .with_config(config)
        .with_cascade(waiter)
        .with_cascade(firer)
        .build()
        .unwrap();

    let started = Instant::now();
    let waiting_engine = engine.clone();
    let waiting = tokio::spawn(async move {
        waiting_engine
            .run(
                "consumer",
                json!({}),
                RunOptions {
                    session_id: Some("consumer-1".to_string()),
                    ..RunOptions::default()
                },
            )
            .await
            .unwrap()
    });

    // Let the waiter register, then fire from the second cascade.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let fire_report = engine
        .run("producer", json!({}), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(fire_report.status, RunStatus::Success);
    assert_eq!(
        fire_report.outputs.get("announce").unwrap(),
        &json!({"fired_count": 1})
    );

    let wait_report = tokio::time::timeout(Duration::from_millis(1500), waiting)
        .await
        .expect("waiter did not settle within 1.5s")
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert_eq!(wait_report.status, RunStatus::Success);

    let tool_text = tool_result_text(&wait_report);
    assert!(tool_text.contains("\"status\":\"fired\""));
    assert!(tool_text.contains("\"rows\":10"));
}

#[tokio::test]
async fn signal_wait_times_out_as_a_normal_tool_result() {
    let waiter = Cascade::from_yaml(WAITER).unwrap();
    let transport = Arc::new(ScriptedTransport::new(vec![
        ScriptedTransport::tool_call(
            "await_signal",
            json!({"name": "data_ready", "timeout": "100ms"}),
        ),
        ScriptedTransport::text("Nothing came; moving on."),
    ]));
    let config = EngineConfig {
        signal_poll_interval: Duration::from_millis(25),
        ..EngineConfig::default()
    };
    let engine = CascadeEngine::builder(transport, Arc::new(MemoryLogStore::new()))
        .with_config(config)
        .with_cascade(waiter)
        .build()
        .unwrap();

    let report = engine
        .run("consumer", json!({}), RunOptions::default())
        .await
        .unwrap();

    // A timeout is not an error; the agent sees it and decides.
    assert_eq!(report.status, RunStatus::Success);
    let tool_text = tool_result_text(&report);
    assert!(tool_text.contains("\"status\":\"timeout\""));
}
