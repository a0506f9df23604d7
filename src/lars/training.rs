//! Few-shot training injection.
//!
//! When a cell sets `use_training: true`, the runner queries the log store
//! for annotated prior executions of the same `(cascade_id, cell_name)` pair,
//! filters them by `trainable` and a confidence floor, selects up to `limit`
//! of them per the configured strategy, and prepends the formatted examples
//! to the cell's rendered instructions.

use crate::lars::cascade::{TrainingFormat, TrainingSpec, TrainingStrategy};
use crate::lars::store::{LogStore, TrainingAnnotation};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Fetch and select training examples for a cell.
pub async fn fetch_examples(
    store: &Arc<dyn LogStore>,
    cascade_id: &str,
    cell_name: &str,
    spec: &TrainingSpec,
) -> Vec<TrainingAnnotation> {
    let mut examples = match store.training_annotations(cascade_id, cell_name).await {
        Ok(examples) => examples,
        Err(e) => {
            log::warn!("training store query failed for {}/{}: {}", cascade_id, cell_name, e);
            return Vec::new();
        }
    };
    examples.retain(|a| a.trainable && a.confidence >= spec.min_confidence);

    match spec.strategy {
        TrainingStrategy::Recent => {
            examples.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
        TrainingStrategy::HighConfidence => {
            examples.sort_by(|a, b| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        TrainingStrategy::Random => {
            // Deterministic sample: order by a hash of the trace id so runs
            // are reproducible without a PRNG dependency.
            examples.sort_by_key(|a| {
                let mut hasher = Sha256::new();
                hasher.update(a.trace_id.as_bytes());
                format!("{:x}", hasher.finalize())
            });
        }
        TrainingStrategy::Semantic => {
            // No vector index in the engine; fall back to recency.
            log::debug!("training strategy 'semantic' degrades to 'recent'");
            examples.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
    }
    examples.truncate(spec.limit);
    examples
}

fn value_text(value: &Value) -> String {
    match value.as_str() {
        Some(text) => text.to_string(),
        None => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
    }
}

/// Render selected examples into instruction text.
pub fn format_examples(examples: &[TrainingAnnotation], format: TrainingFormat) -> String {
    if examples.is_empty() {
        return String::new();
    }
    match format {
        TrainingFormat::Xml => {
            let mut out = String::from("<examples>\n");
            for example in examples {
                out.push_str(&format!(
                    "  <example verified=\"{}\" confidence=\"{:.2}\">\n    <input>{}</input>\n    <output>{}</output>\n  </example>\n",
                    example.verified,
                    example.confidence,
                    value_text(&example.input),
                    value_text(&example.output),
                ));
            }
            out.push_str("</examples>");
            out
        }
        TrainingFormat::Markdown => {
            let mut out = String::from("## Prior examples\n");
            for (i, example) in examples.iter().enumerate() {
                out.push_str(&format!(
                    "\n### Example {}\n**Input:**\n{}\n\n**Output:**\n{}\n",
                    i + 1,
                    value_text(&example.input),
                    value_text(&example.output),
                ));
            }
            out
        }
        TrainingFormat::FewShot => {
            let mut out = String::new();
            for example in examples {
                out.push_str(&format!(
                    "Input: {}\nOutput: {}\n\n",
                    value_text(&example.input),
                    value_text(&example.output),
                ));
            }
            out.trim_end().to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lars::store::MemoryLogStore;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn annotation(trace: &str, confidence: f64, age_minutes: i64) -> TrainingAnnotation {
        TrainingAnnotation {
            trace_id: trace.to_string(),
            cascade_id: "demo".to_string(),
            cell_name: "classify".to_string(),
            trainable: true,
            verified: true,
            confidence,
            notes: None,
            input: json!("some input"),
            output: json!("some output"),
            created_at: Utc::now() - Duration::minutes(age_minutes),
        }
    }

    #[tokio::test]
    async fn filters_by_confidence_and_limits() {
        let store: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
        for (trace, confidence, age) in
            [("t1", 0.9, 30), ("t2", 0.2, 20), ("t3", 0.8, 10), ("t4", 0.7, 5)].iter()
        {
            store
                .append_training_annotation(&annotation(trace, *confidence, *age))
                .await
                .unwrap();
        }
        let spec = TrainingSpec {
            limit: 2,
            min_confidence: 0.5,
            strategy: TrainingStrategy::Recent,
            format: TrainingFormat::Xml,
        };
        let examples = fetch_examples(&store, "demo", "classify", &spec).await;
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].trace_id, "t4");
        assert_eq!(examples[1].trace_id, "t3");
    }

    #[tokio::test]
    async fn high_confidence_strategy_sorts_by_confidence() {
        let store: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
        for (trace, confidence) in [("t1", 0.6), ("t2", 0.95), ("t3", 0.7)].iter() {
            store
                .append_training_annotation(&annotation(trace, *confidence, 1))
                .await
                .unwrap();
        }
        let spec = TrainingSpec {
            limit: 1,
            min_confidence: 0.0,
            strategy: TrainingStrategy::HighConfidence,
            format: TrainingFormat::Xml,
        };
        let examples = fetch_examples(&store, "demo", "classify", &spec).await;
        assert_eq!(examples[0].trace_id, "t2");
    }

    #[test]
    fn formats_render_input_and_output() {
        let examples = vec![annotation("t1", 0.9, 1)];
        let xml = format_examples(&examples, TrainingFormat::Xml);
        assert!(xml.starts_with("<examples>"));
        assert!(xml.contains("<input>some input</input>"));

        let md = format_examples(&examples, TrainingFormat::Markdown);
        assert!(md.contains("### Example 1"));

        let shot = format_examples(&examples, TrainingFormat::FewShot);
        assert!(shot.starts_with("Input: some input"));
    }

    #[test]
    fn empty_examples_render_nothing() {
        assert_eq!(format_examples(&[], TrainingFormat::Markdown), "");
    }
}
