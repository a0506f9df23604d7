use async_trait::async_trait;
use lars::lars::cascade::Cascade;
use lars::lars::echo::{CellStatus, RunErrorKind};
use lars::lars::event::EventKind;
use lars::lars::store::{LogStore, MemoryLogStore};
use lars::lars::trait_registry::{FnTrait, TraitMetadata};
use lars::lars::transport::{ChatRequest, ChatResponse, ChatTransport, Usage};
use lars::{CascadeEngine, RunOptions, RunStatus};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
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

#[tokio::test]
async fn blocking_pre_ward_aborts_the_cell() {
    let doc = r#"
cascade_id: reporting
cells:
  - name: generate_report
    instructions: "Write the report for {{ input.topic }}."
    wards:
      pre:
        - validator: content_safety
          mode: blocking
"#;
    let cascade = Cascade::from_yaml(doc).unwrap();
    let content_safety = FnTrait::new(
        TraitMetadata::new("content_safety", "Reject unsafe content."),
        |_args| Ok(json!({"valid": false, "reason": "unsafe"})),
    );
    let store = Arc::new(MemoryLogStore::new());
    let engine = CascadeEngine::builder(
        Arc::new(ScriptedTransport::new(Vec::new())),
        store.clone(),
    )
    .with_cascade(cascade)
    .with_trait(Arc::new(content_safety))
    .build()
    .unwrap();

    let report = engine
        .run(
            "reporting",
            json!({"topic": "something"}),
            RunOptions {
                session_id: Some("ward-1".to_string()),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Error);
    assert_eq!(report.errors[0].kind, RunErrorKind::WardBlocked);
    assert!(report.errors[0].message.contains("unsafe"));
    assert!(!report.outputs.contains_key("generate_report"));
    assert_eq!(report.lineage[0].status, CellStatus::AbortedByWard);

    let events = store.events_for_session("ward-1").await.unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::WardFail));
}

#[tokio::test]
async fn retry_ward_feeds_reason_back_into_the_body() {
    let doc = r#"
cascade_id: drafting
cells:
  - name: draft
    instructions: "Write a draft."
    wards:
      post:
        - validator: mentions_totals
          mode: retry
          max_attempts: 2
"#;
    let cascade = Cascade::from_yaml(doc).unwrap();
    let mentions_totals = FnTrait::new(
        TraitMetadata::new("mentions_totals", "Require a totals section."),
        |args| {
            let text = args["value"].as_str().unwrap_or("");
            if text.contains("Totals:") {
                Ok(json!({"valid": true, "reason": ""}))
            } else {
                Ok(json!({"valid": false, "reason": "missing a Totals section"}))
            }
        },
    );
    let transport = Arc::new(ScriptedTransport::new(vec![
        ScriptedTransport::text("A fine draft with no numbers."),
        ScriptedTransport::text("A fine draft. Totals: 250k."),
    ]));
    let store = Arc::new(MemoryLogStore::new());
    let engine = CascadeEngine::builder(transport, store.clone())
        .with_cascade(cascade)
        .with_trait(Arc::new(mentions_totals))
        .build()
        .unwrap();

    let report = engine
        .run(
            "drafting",
            json!({}),
            RunOptions {
                session_id: Some("ward-retry".to_string()),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(
        report.outputs.get("draft").unwrap(),
        &json!("A fine draft. Totals: 250k.")
    );
    // The retry prompt carried the validator's reason.
    let feedback_seen = report.history.iter().any(|m| {
        m.content_text()
            .contains("A validator rejected the previous attempt: missing a Totals section")
    });
    assert!(feedback_seen);

    let events = store.events_for_session("ward-retry").await.unwrap();
    assert_eq!(
        events.iter().filter(|e| e.kind == EventKind::WardFail).count(),
        1
    );
    assert_eq!(
        events.iter().filter(|e| e.kind == EventKind::WardPass).count(),
        1
    );
}

#[tokio::test]
async fn retry_exhaustion_escalates_to_an_abort() {
    let doc = r#"
cascade_id: drafting
cells:
  - name: draft
    instructions: "Write a draft."
    wards:
      post:
        - validator: never_satisfied
          mode: retry
          max_attempts: 2
"#;
    let cascade = Cascade::from_yaml(doc).unwrap();
    let never_satisfied = FnTrait::new(
        TraitMetadata::new("never_satisfied", "Always rejects."),
        |_args| Ok(json!({"valid": false, "reason": "still not right"})),
    );
    let transport = Arc::new(ScriptedTransport::new(vec![
        ScriptedTransport::text("attempt one"),
        ScriptedTransport::text("attempt two"),
    ]));
    let engine = CascadeEngine::builder(transport, Arc::new(MemoryLogStore::new()))
        .with_cascade(cascade)
        .with_trait(Arc::new(never_satisfied))
        .build()
        .unwrap();

    let report = engine
        .run("drafting", json!({}), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Error);
    assert_eq!(report.errors[0].kind, RunErrorKind::WardBlocked);
    assert!(report.errors[0].message.contains("retry ward exhausted"));
    assert!(!report.outputs.contains_key("draft"));
}

#[tokio::test]
async fn advisory_ward_records_a_warning_and_continues() {
    let doc = r#"
cascade_id: drafting
cells:
  - name: draft
    instructions: "Write a draft."
    wards:
      post:
        - validator: style_nit
          mode: advisory
"#;
    let cascade = Cascade::from_yaml(doc).unwrap();
    let style_nit = FnTrait::new(
        TraitMetadata::new("style_nit", "Nitpick style."),
        |_args| Ok(json!({"valid": false, "reason": "too wordy"})),
    );
    let transport = Arc::new(ScriptedTransport::new(vec![ScriptedTransport::text(
        "A slightly wordy draft.",
    )]));
    let store = Arc::new(MemoryLogStore::new());
    let engine = CascadeEngine::builder(transport, store.clone())
        .with_cascade(cascade)
        .with_trait(Arc::new(style_nit))
        .build()
        .unwrap();

    let report = engine
        .run(
            "drafting",
            json!({}),
            RunOptions {
                session_id: Some("ward-advisory".to_string()),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert!(report.outputs.contains_key("draft"));
    let events = store.events_for_session("ward-advisory").await.unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::WardFail));
}

#[tokio::test]
async fn unstructured_validator_response_counts_as_invalid() {
    let doc = r#"
cascade_id: drafting
cells:
  - name: draft
    instructions: "Write a draft."
    wards:
      post:
        - validator: mumbler
          mode: blocking
"#;
    let cascade = Cascade::from_yaml(doc).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let mumbler = FnTrait::new(
        TraitMetadata::new("mumbler", "Returns prose instead of a verdict."),
        move |_args| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(json!("looks good to me"))
        },
    );
    let transport = Arc::new(ScriptedTransport::new(vec![ScriptedTransport::text(
        "a draft",
    )]));
    let engine = CascadeEngine::builder(transport, Arc::new(MemoryLogStore::new()))
        .with_cascade(cascade)
        .with_trait(Arc::new(mumbler))
        .build()
        .unwrap();

    let report = engine
        .run("drafting", json!({}), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.status, RunStatus::Error);
    assert!(report.errors[0]
        .message
        .contains("invalid validator response"));
}
