//! The cascade document model.
//!
//! A cascade is the top-level program: an ordered list of cells plus
//! metadata, written as YAML or JSON with identical semantics. This module
//! owns loading, schema validation, and round-trip serialization; execution
//! lives in [`driver`](crate::lars::driver) and [`runner`](crate::lars::runner).
//!
//! Cells come in two variants, distinguished by which field is present:
//!
//! - *LLM cell*: has `instructions` (a Jinja template) and optionally
//!   `traits`, `handoffs`, `rules`, `candidates`, `wards`, …
//! - *Deterministic cell*: has `tool` plus a templated `inputs` mapping and
//!   an optional `routing` table over the tool's `_route` discriminator.
//!
//! Unknown document fields are rejected — forward-compat keys must be
//! declared, not silently ignored.
//!
//! # Example
//!
//! ```rust
//! use lars::lars::cascade::Cascade;
//!
//! let cascade = Cascade::from_yaml(r#"
//! cascade_id: greeter
//! cells:
//!   - name: classify
//!     instructions: "Classify the sentiment of {{ input.text }}"
//!     handoffs: [positive, negative]
//!   - name: positive
//!     instructions: "Write a cheerful reply."
//!   - name: negative
//!     instructions: "Write an apologetic reply."
//! "#).unwrap();
//! assert_eq!(cascade.cells.len(), 3);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::error::Error;
use std::fmt;

/// Cascade loading/validation failures. No run is started when one of these
/// is raised.
#[derive(Debug, Clone)]
pub enum InputError {
    /// The document failed to parse as YAML or JSON.
    Parse(String),
    /// The document parsed but violates the cascade schema.
    Invalid(String),
    /// The run input violates the cascade's `inputs_schema`.
    Input(String),
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputError::Parse(msg) => write!(f, "cascade parse error: {}", msg),
            InputError::Invalid(msg) => write!(f, "invalid cascade: {}", msg),
            InputError::Input(msg) => write!(f, "invalid input: {}", msg),
        }
    }
}

impl Error for InputError {}

/// Which traits an LLM cell exposes to its agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraitSelection {
    /// Explicit list of trait names.
    Named(Vec<String>),
    /// The literal `"manifest"`: a quartermaster agent picks the subset from
    /// the full registry before the main agent runs.
    Literal(String),
}

impl TraitSelection {
    pub fn is_manifest(&self) -> bool {
        matches!(self, TraitSelection::Literal(s) if s == "manifest")
    }

    /// The explicit names, when this is a named selection.
    pub fn names(&self) -> &[String] {
        match self {
            TraitSelection::Named(names) => names,
            TraitSelection::Literal(_) => &[],
        }
    }
}

/// What the quartermaster sees in manifest mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestContext {
    /// Only the current cell's rendered instructions.
    Current,
    /// The whole conversation history.
    Full,
}

/// Turn-loop limits for an LLM cell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rules {
    /// Maximum LLM turns; defaults to the engine's
    /// [`DEFAULT_MAX_TURNS`](crate::lars::config::DEFAULT_MAX_TURNS).
    #[serde(default)]
    pub max_turns: Option<usize>,
    /// Jinja predicate over `state`/`outputs`; when it evaluates true the
    /// turn loop exits.
    #[serde(default)]
    pub loop_until: Option<String>,
}

/// Ward failure semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WardMode {
    /// A failed verdict aborts the cell.
    Blocking,
    /// A failed verdict re-enters the cell body with feedback, up to
    /// `max_attempts`; exhaustion escalates to blocking.
    Retry,
    /// A failed verdict records a warning and continues.
    Advisory,
}

impl Default for WardMode {
    fn default() -> Self {
        WardMode::Blocking
    }
}

/// An inline LLM validator: a cell-lite with instructions and a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InlineValidator {
    pub instructions: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub rules: Rules,
}

/// A ward's validator: a registered trait name, or an inline LLM cell-lite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValidatorSpec {
    TraitName(String),
    Inline(InlineValidator),
}

/// A pre- or post-cell validator attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WardSpec {
    pub validator: ValidatorSpec,
    #[serde(default)]
    pub mode: WardMode,
    /// Retry budget; only meaningful with `mode: retry`.
    #[serde(default)]
    pub max_attempts: Option<usize>,
}

/// Pre/post ward lists for a cell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WardsSpec {
    #[serde(default)]
    pub pre: Vec<WardSpec>,
    #[serde(default)]
    pub post: Vec<WardSpec>,
}

/// How branch outputs are reduced to the cell's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// An evaluator LLM picks one winning branch.
    Evaluate,
    /// An aggregator LLM combines all branches into one output.
    Aggregate,
    /// No selection; the cell's output is the list of branch outputs.
    All,
}

impl Default for SelectionMode {
    fn default() -> Self {
        SelectionMode::Evaluate
    }
}

/// Instruction mutation applied per candidate branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationMode {
    /// An LLM rewrites the prompt, seeded with prior winning rewrites.
    Rewrite,
    /// An LLM rewrites the prompt without winner-learning.
    RewriteFree,
    /// Prepend a short directive from the built-in pool.
    Augment,
    /// Prepend a strategy directive from the built-in pool.
    Approach,
}

impl Default for MutationMode {
    fn default() -> Self {
        MutationMode::Rewrite
    }
}

/// Per-model branch allocation in weighted model assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelFactor {
    pub factor: usize,
}

/// How candidate branches are assigned models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelAssignment {
    /// One model per branch, pairwise; length must equal `factor`.
    List(Vec<String>),
    /// `{model: {factor: k}}` slots; factors must sum to `factor`.
    Weighted(BTreeMap<String, ModelFactor>),
}

/// Depth-wise refinement applied to a candidates winner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReforgeSpec {
    /// Number of serial refinement steps; 0 is a no-op.
    pub steps: usize,
    /// What "better" means for this cell; shown to the refining LLM.
    pub honing_prompt: String,
    /// Variants generated per step, evaluated in parallel.
    pub factor_per_step: usize,
    /// Apply a mutation from the candidates pools to each variant prompt.
    #[serde(default)]
    pub mutate: bool,
    /// Early-exit validator: when it returns valid, refinement stops.
    #[serde(default)]
    pub threshold: Option<ValidatorSpec>,
}

/// Speculative N-way execution of a cell (or a whole cascade).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CandidatesSpec {
    /// Number of parallel branches. Must be at least 1.
    pub factor: usize,
    #[serde(default)]
    pub mode: SelectionMode,
    /// Mutate each branch's instructions before execution.
    #[serde(default)]
    pub mutate: bool,
    #[serde(default)]
    pub mutation_mode: MutationMode,
    #[serde(default)]
    pub evaluator_instructions: Option<String>,
    #[serde(default)]
    pub aggregator_instructions: Option<String>,
    #[serde(default)]
    pub models: Option<ModelAssignment>,
    #[serde(default)]
    pub reforge: Option<ReforgeSpec>,
}

/// One `context.from` clause selecting a prior cell's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextFrom {
    pub cell: String,
    /// Restrict an object output to these fields.
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    /// Include the cell's persisted images.
    #[serde(default)]
    pub images: bool,
}

/// Explicit override of what prior-cell context a cell sees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextSpec {
    #[serde(default)]
    pub from: Vec<ContextFrom>,
}

/// When a fire-and-forget child cascade launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncTrigger {
    OnStart,
    OnComplete,
}

/// A fire-and-forget child cascade attached to a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AsyncCascadeSpec {
    pub cascade_id: String,
    pub trigger: AsyncTrigger,
}

/// A declared synchronous child cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubCascadeSpec {
    pub cascade_id: String,
    /// Merge the parent's `state` into the child's `input`.
    #[serde(default)]
    pub context_in: bool,
    /// Merge the child's final `state` back into the parent's `state`.
    #[serde(default)]
    pub context_out: bool,
}

/// Strategy used to select training examples for a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStrategy {
    Recent,
    HighConfidence,
    Random,
    /// Embedding-based retrieval is out of scope; degrades to `recent`.
    Semantic,
}

impl Default for TrainingStrategy {
    fn default() -> Self {
        TrainingStrategy::Recent
    }
}

/// How retrieved examples are formatted into the instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingFormat {
    Xml,
    Markdown,
    FewShot,
}

impl Default for TrainingFormat {
    fn default() -> Self {
        TrainingFormat::Xml
    }
}

/// Few-shot retrieval settings for a cell with `use_training: true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingSpec {
    #[serde(default = "default_training_limit")]
    pub limit: usize,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub strategy: TrainingStrategy,
    #[serde(default)]
    pub format: TrainingFormat,
}

fn default_training_limit() -> usize {
    3
}

fn default_min_confidence() -> f64 {
    0.5
}

impl Default for TrainingSpec {
    fn default() -> Self {
        Self {
            limit: default_training_limit(),
            min_confidence: default_min_confidence(),
            strategy: TrainingStrategy::default(),
            format: TrainingFormat::default(),
        }
    }
}

/// A unit of work inside a cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Cell {
    /// Unique within the cascade.
    pub name: String,

    // LLM variant.
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub traits: Option<TraitSelection>,
    #[serde(default)]
    pub manifest_context: Option<ManifestContext>,
    #[serde(default)]
    pub handoffs: Vec<String>,
    #[serde(default)]
    pub rules: Rules,
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub use_training: bool,
    #[serde(default)]
    pub training: Option<TrainingSpec>,
    #[serde(default)]
    pub model_override: Option<String>,

    // Deterministic variant.
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub inputs: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub routing: Option<BTreeMap<String, String>>,
    /// LLM fallback cell run when a deterministic cell fails.
    #[serde(default)]
    pub on_error: Option<Box<Cell>>,

    // Shared.
    #[serde(default)]
    pub candidates: Option<CandidatesSpec>,
    #[serde(default)]
    pub wards: Option<WardsSpec>,
    #[serde(default)]
    pub context: Option<ContextSpec>,
    #[serde(default)]
    pub async_cascades: Vec<AsyncCascadeSpec>,
}

impl Cell {
    pub fn is_llm(&self) -> bool {
        self.instructions.is_some()
    }

    pub fn is_deterministic(&self) -> bool {
        self.tool.is_some()
    }

    /// The model an LLM cell runs with, falling back to the given default.
    pub fn resolved_model(&self, fallback: &str) -> String {
        self.model_override
            .as_ref()
            .or(self.model.as_ref())
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }
}

/// A loaded cascade program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Cascade {
    /// Unique within a repository of cascades.
    pub cascade_id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Input-name → human description. Declares the public interface and,
    /// when present, makes the cascade callable as a trait.
    #[serde(default)]
    pub inputs_schema: Option<BTreeMap<String, String>>,
    pub cells: Vec<Cell>,
    /// Run the whole cascade N ways, then select/aggregate.
    #[serde(default)]
    pub candidates: Option<CandidatesSpec>,
    #[serde(default)]
    pub sub_cascades: Vec<SubCascadeSpec>,
    /// Cron/sensor/webhook/manual descriptors consumed by an external
    /// scheduler; opaque to the engine.
    #[serde(default)]
    pub triggers: Vec<Value>,
}

impl Cascade {
    /// Parse a YAML document (JSON also parses, YAML being a superset) and
    /// validate it.
    pub fn from_yaml(text: &str) -> Result<Self, InputError> {
        let cascade: Cascade =
            serde_yaml::from_str(text).map_err(|e| InputError::Parse(e.to_string()))?;
        cascade.validate()?;
        Ok(cascade)
    }

    /// Parse a JSON document and validate it.
    pub fn from_json(text: &str) -> Result<Self, InputError> {
        let cascade: Cascade =
            serde_json::from_str(text).map_err(|e| InputError::Parse(e.to_string()))?;
        cascade.validate()?;
        Ok(cascade)
    }

    pub fn to_yaml_string(&self) -> Result<String, InputError> {
        serde_yaml::to_string(self).map_err(|e| InputError::Parse(e.to_string()))
    }

    pub fn to_json_string(&self) -> Result<String, InputError> {
        serde_json::to_string_pretty(self).map_err(|e| InputError::Parse(e.to_string()))
    }

    /// Look up a cell by name.
    pub fn cell(&self, name: &str) -> Option<&Cell> {
        self.cells.iter().find(|c| c.name == name)
    }

    /// Check the run input against `inputs_schema`: every declared input
    /// must be present (the descriptions are documentation, not types).
    pub fn check_input(&self, input: &Value) -> Result<(), InputError> {
        let schema = match &self.inputs_schema {
            Some(schema) => schema,
            None => return Ok(()),
        };
        let obj = input.as_object().ok_or_else(|| {
            InputError::Input("cascade input must be an object".to_string())
        })?;
        for name in schema.keys() {
            if !obj.contains_key(name) {
                return Err(InputError::Input(format!("missing input '{}'", name)));
            }
        }
        Ok(())
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), InputError> {
        if self.cascade_id.is_empty() {
            return Err(InputError::Invalid("cascade_id must not be empty".to_string()));
        }
        if self.cells.is_empty() {
            return Err(InputError::Invalid("a cascade needs at least one cell".to_string()));
        }

        let mut names = HashSet::new();
        for cell in &self.cells {
            if !names.insert(cell.name.as_str()) {
                return Err(InputError::Invalid(format!(
                    "duplicate cell name '{}'",
                    cell.name
                )));
            }
        }

        for cell in &self.cells {
            validate_cell(cell, &names)?;
        }
        if let Some(candidates) = &self.candidates {
            validate_candidates(candidates, "cascade")?;
        }
        Ok(())
    }
}

fn validate_cell(cell: &Cell, names: &HashSet<&str>) -> Result<(), InputError> {
    match (cell.instructions.is_some(), cell.tool.is_some()) {
        (true, true) => {
            return Err(InputError::Invalid(format!(
                "cell '{}' declares both instructions and tool",
                cell.name
            )));
        }
        (false, false) => {
            return Err(InputError::Invalid(format!(
                "cell '{}' declares neither instructions nor tool",
                cell.name
            )));
        }
        _ => {}
    }

    if cell.is_deterministic() {
        if cell.traits.is_some() {
            return Err(InputError::Invalid(format!(
                "deterministic cell '{}' cannot declare traits",
                cell.name
            )));
        }
    } else {
        if cell.inputs.is_some() || cell.routing.is_some() || cell.on_error.is_some() {
            return Err(InputError::Invalid(format!(
                "agent cell '{}' cannot declare tool-cell fields (inputs/routing/on_error)",
                cell.name
            )));
        }
    }

    if let Some(TraitSelection::Literal(keyword)) = &cell.traits {
        if keyword != "manifest" {
            return Err(InputError::Invalid(format!(
                "cell '{}': traits must be a list or the literal \"manifest\"",
                cell.name
            )));
        }
    }

    for target in &cell.handoffs {
        if !names.contains(target.as_str()) {
            return Err(InputError::Invalid(format!(
                "cell '{}' hands off to unknown cell '{}'",
                cell.name, target
            )));
        }
    }
    if let Some(routing) = &cell.routing {
        for target in routing.values() {
            if !names.contains(target.as_str()) {
                return Err(InputError::Invalid(format!(
                    "cell '{}' routes to unknown cell '{}'",
                    cell.name, target
                )));
            }
        }
    }

    if let Some(on_error) = &cell.on_error {
        if !on_error.is_llm() {
            return Err(InputError::Invalid(format!(
                "cell '{}': on_error must be an agent cell",
                cell.name
            )));
        }
    }

    if let Some(candidates) = &cell.candidates {
        validate_candidates(candidates, &cell.name)?;
    }
    Ok(())
}

fn validate_candidates(candidates: &CandidatesSpec, owner: &str) -> Result<(), InputError> {
    if candidates.factor == 0 {
        return Err(InputError::Invalid(format!(
            "'{}': candidates.factor must be at least 1",
            owner
        )));
    }
    match &candidates.models {
        Some(ModelAssignment::List(models)) => {
            if models.len() != candidates.factor {
                return Err(InputError::Invalid(format!(
                    "'{}': candidates.models lists {} models for factor {}",
                    owner,
                    models.len(),
                    candidates.factor
                )));
            }
        }
        Some(ModelAssignment::Weighted(weights)) => {
            let total: usize = weights.values().map(|w| w.factor).sum();
            if total != candidates.factor {
                return Err(InputError::Invalid(format!(
                    "'{}': candidates model factors sum to {} but factor is {}",
                    owner, total, candidates.factor
                )));
            }
        }
        None => {}
    }
    if let Some(reforge) = &candidates.reforge {
        if reforge.steps > 0 && reforge.factor_per_step == 0 {
            return Err(InputError::Invalid(format!(
                "'{}': reforge.factor_per_step must be at least 1",
                owner
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_CELLS: &str = r#"
cascade_id: demo
description: Two-cell happy path.
cells:
  - name: ingest
    instructions: "Read {{ input.data }} and extract the figures."
    handoffs: [summarize]
  - name: summarize
    instructions: "Summarize {{ outputs.ingest }}."
"#;

    #[test]
    fn loads_yaml_and_json_identically() {
        let from_yaml = Cascade::from_yaml(TWO_CELLS).unwrap();
        let json = from_yaml.to_json_string().unwrap();
        let from_json = Cascade::from_json(&json).unwrap();
        assert_eq!(from_yaml, from_json);
    }

    #[test]
    fn serialization_round_trips() {
        let original = Cascade::from_yaml(TWO_CELLS).unwrap();
        let reloaded = Cascade::from_yaml(&original.to_yaml_string().unwrap()).unwrap();
        assert_eq!(original, reloaded);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let doc = r#"
cascade_id: demo
surprise: true
cells:
  - name: a
    instructions: hi
"#;
        assert!(matches!(Cascade::from_yaml(doc), Err(InputError::Parse(_))));
    }

    #[test]
    fn cell_must_pick_exactly_one_variant() {
        let both = r#"
cascade_id: demo
cells:
  - name: a
    instructions: hi
    tool: sql
"#;
        assert!(Cascade::from_yaml(both).is_err());

        let neither = r#"
cascade_id: demo
cells:
  - name: a
"#;
        assert!(Cascade::from_yaml(neither).is_err());
    }

    #[test]
    fn zero_factor_candidates_rejected_at_load() {
        let doc = r#"
cascade_id: demo
cells:
  - name: write
    instructions: hi
    candidates:
      factor: 0
"#;
        assert!(Cascade::from_yaml(doc).is_err());
    }

    #[test]
    fn handoff_targets_must_exist() {
        let doc = r#"
cascade_id: demo
cells:
  - name: a
    instructions: hi
    handoffs: [nowhere]
"#;
        assert!(Cascade::from_yaml(doc).is_err());
    }

    #[test]
    fn manifest_keyword_is_the_only_literal() {
        let manifest = r#"
cascade_id: demo
cells:
  - name: a
    instructions: hi
    traits: manifest
"#;
        let cascade = Cascade::from_yaml(manifest).unwrap();
        assert!(cascade.cells[0].traits.as_ref().unwrap().is_manifest());

        let typo = manifest.replace("manifest", "manifesto");
        assert!(Cascade::from_yaml(&typo).is_err());
    }

    #[test]
    fn weighted_models_must_sum_to_factor() {
        let doc = r#"
cascade_id: demo
cells:
  - name: write
    instructions: hi
    candidates:
      factor: 3
      models:
        model-a: {factor: 2}
        model-b: {factor: 2}
"#;
        assert!(Cascade::from_yaml(doc).is_err());
    }

    #[test]
    fn input_schema_checks_presence() {
        let doc = r#"
cascade_id: demo
inputs_schema:
  text: "The text to classify."
cells:
  - name: a
    instructions: "{{ input.text }}"
"#;
        let cascade = Cascade::from_yaml(doc).unwrap();
        assert!(cascade.check_input(&serde_json::json!({"text": "hi"})).is_ok());
        assert!(cascade.check_input(&serde_json::json!({})).is_err());
    }
}
