use async_trait::async_trait;
use lars::lars::cascade::Cascade;
use lars::lars::config::EngineConfig;
use lars::lars::echo::{CellStatus, RunErrorKind};
use lars::lars::store::MemoryLogStore;
use lars::lars::trait_registry::{FnTrait, TraitMetadata};
use lars::lars::transport::{ChatRequest, ChatResponse, ChatTransport, Usage};
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
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                cost_usd: 0.001,
            },
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

const TWO_CELLS: &str = r#"
cascade_id: quarterly
cells:
  - name: ingest
    instructions: "Read {{ input.data }} and extract the figures."
    handoffs: [summarize]
  - name: summarize
    instructions: "Summarize what ingest found: {{ outputs.ingest }}"
"#;

#[tokio::test]
async fn two_cell_happy_path() {
    let _ = env_logger::builder().is_test(true).try_init();
    let cascade = Cascade::from_yaml(TWO_CELLS).unwrap();
    let transport = Arc::new(ScriptedTransport::new(vec![
        ScriptedTransport::text("Q1 revenue 100k, Q2 revenue 150k."),
        ScriptedTransport::text("Revenue grew 50% quarter over quarter."),
    ]));
    let store = Arc::new(MemoryLogStore::new());
    let engine = CascadeEngine::builder(transport, store.clone())
        .with_cascade(cascade)
        .build()
        .unwrap();

    let report = engine
        .run(
            "quarterly",
            json!({"data": "Q1=100k, Q2=150k"}),
            RunOptions {
                session_id: Some("happy-1".to_string()),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    let cells: Vec<&str> = report.lineage.iter().map(|e| e.cell.as_str()).collect();
    assert_eq!(cells, vec!["ingest", "summarize"]);
    assert!(report
        .lineage
        .iter()
        .all(|e| e.status == CellStatus::Completed));

    let summary = report.outputs.get("summarize").unwrap().as_str().unwrap();
    assert!(!summary.is_empty());
    assert_eq!(report.output, json!(summary));

    // Exactly-once outputs: every completed cell has a committed output.
    assert!(report.outputs.contains_key("ingest"));
    assert_eq!(report.outputs.len(), 2);
    assert!(report.errors.is_empty());
    assert!(report.cost_usd > 0.0);
}

#[tokio::test]
async fn deterministic_cell_runs_a_trait_with_templated_inputs() {
    let doc = r#"
cascade_id: counter
cells:
  - name: count
    tool: word_count
    inputs:
      text: "{{ input.data }}"
"#;
    let cascade = Cascade::from_yaml(doc).unwrap();
    let word_count = FnTrait::new(
        TraitMetadata::new("word_count", "Count words in a string.").with_args_schema(json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"],
        })),
        |args| {
            let text = args["text"].as_str().unwrap_or("");
            Ok(json!({"count": text.split_whitespace().count()}))
        },
    );
    let engine = CascadeEngine::builder(
        Arc::new(ScriptedTransport::new(Vec::new())),
        Arc::new(MemoryLogStore::new()),
    )
    .with_cascade(cascade)
    .with_trait(Arc::new(word_count))
    .build()
    .unwrap();

    let report = engine
        .run("counter", json!({"data": "one two three"}), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.outputs.get("count").unwrap(), &json!({"count": 3}));
}

#[tokio::test]
async fn routing_cycles_hit_the_loop_bound() {
    let doc = r#"
cascade_id: pingpong
cells:
  - name: ping
    instructions: "ping"
    handoffs: [pong]
  - name: pong
    instructions: "pong"
    handoffs: [ping]
"#;
    let cascade = Cascade::from_yaml(doc).unwrap();
    // Enough scripted turns to out-last the bound.
    let responses: Vec<ChatResponse> = (0..64).map(|_| ScriptedTransport::text("ok")).collect();
    let config = EngineConfig {
        max_cell_iterations: 5,
        ..EngineConfig::default()
    };
    let engine = CascadeEngine::builder(
        Arc::new(ScriptedTransport::new(responses)),
        Arc::new(MemoryLogStore::new()),
    )
    .with_config(config)
    .with_cascade(cascade)
    .build()
    .unwrap();

    let report = engine
        .run("pingpong", json!({}), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Error);
    assert_eq!(
        report.errors.last().unwrap().kind,
        RunErrorKind::LoopBoundExceeded
    );
    // The bound caps how many cells ran. The first run through "ping" commits
    // an output; subsequent revisits fail the duplicate commit but the bound
    // is what terminates the run.
    assert!(report.lineage.len() <= 5);
}

#[tokio::test]
async fn unknown_cascade_is_a_synchronous_input_error() {
    let engine = CascadeEngine::builder(
        Arc::new(ScriptedTransport::new(Vec::new())),
        Arc::new(MemoryLogStore::new()),
    )
    .build()
    .unwrap();
    assert!(engine
        .run("nope", json!({}), RunOptions::default())
        .await
        .is_err());
}
