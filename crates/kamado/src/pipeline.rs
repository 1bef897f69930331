//! # Pipelines
//!
//! A pipeline is an ordered list of stages, each one a Run. A stage reads
//! either its own source or the joined output of the stage before it. When it
//! reads the previous output, a [`ColumnMapping`] renames fields so the
//! stage's template finds the names it expects.
//!
//! A pipeline definition is validated as a whole before any stage starts;
//! every problem found is reported at once.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::OrchestratorConfig;
use crate::error::PipelineError;
use crate::format::{InputFormatter, TemplateRegistry};
use crate::partition::BatchBounds;
use crate::record::{Record, SourceDescriptor};
use crate::report::RunReport;

/// Field holding a text model's answer in joined output.
pub const RESPONSE_FIELD: &str = "response";

/// Field renames applied to the previous stage's joined records.
///
/// Keys are the names the next stage expects, values the names in the joined
/// output. A source field that does not exist is filled from `response`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnMapping(BTreeMap<String, String>);

impl ColumnMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `source` as `target`.
    pub fn with(mut self, target: impl Into<String>, source: impl Into<String>) -> Self {
        self.0.insert(target.into(), source.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rename the mapped fields of `record`.
    ///
    /// All renames read the record as it was before any of them, so two
    /// fields can swap names.
    pub fn apply(&self, record: &mut Record) {
        let mut moved: Vec<(&str, Value)> = Vec::with_capacity(self.0.len());
        let mut sources: Vec<&str> = vec![];
        for (target, source) in &self.0 {
            match record.get(source) {
                Some(value) => {
                    moved.push((target.as_str(), value.clone()));
                    sources.push(source.as_str());
                }
                None => {
                    if let Some(response) = record.get(RESPONSE_FIELD) {
                        moved.push((target.as_str(), response.clone()));
                    }
                }
            }
        }

        for source in sources {
            record.remove(source);
        }
        for (target, value) in moved {
            record.insert(target.to_string(), value);
        }
    }
}

/// One Run of a pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub stage_name: String,
    pub model_id: String,
    #[serde(default)]
    pub template_id: Option<String>,
    /// Own source. Exclusive with `use_previous_output`.
    #[serde(default)]
    pub source: Option<SourceDescriptor>,
    /// Read the joined output of the stage before.
    #[serde(default)]
    pub use_previous_output: bool,
    #[serde(default)]
    pub column_mappings: ColumnMapping,
    pub bounds: BatchBounds,
    pub ceiling: usize,
}

/// A named sequence of stages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline_name: String,
    pub stages: Vec<StageConfig>,
}

impl PipelineConfig {
    /// Parse a pipeline definition from JSON.
    pub fn from_json(raw: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(raw).map_err(|e| PipelineError::Invalid(vec![e.to_string()]))
    }

    /// Check the stage graph and every stage's model and template.
    ///
    /// # Parameters
    ///
    /// * `templates` - Registry the stages' template ids must resolve in
    /// * `config` - Orchestrator settings the stages will run with
    ///
    /// # Returns
    ///
    /// [`PipelineError::Invalid`] listing every problem found.
    pub fn validate(&self, templates: &TemplateRegistry, config: &OrchestratorConfig) -> Result<(), PipelineError> {
        let mut errors = vec![];
        if self.pipeline_name.trim().is_empty() {
            errors.push("pipeline_name must not be empty".to_string());
        }
        if self.stages.is_empty() {
            errors.push("pipeline has no stages".to_string());
        }

        let mut names = HashSet::new();
        for (idx, stage) in self.stages.iter().enumerate() {
            let name = if stage.stage_name.trim().is_empty() {
                errors.push(format!("stage {}: missing stage_name", idx + 1));
                format!("stage {}", idx + 1)
            } else {
                stage.stage_name.clone()
            };
            if !names.insert(name.clone()) {
                errors.push(format!("stage '{name}': duplicate stage_name"));
            }

            match (idx, stage.source.is_some(), stage.use_previous_output) {
                (0, _, true) => errors.push(format!("stage '{name}': first stage cannot use the previous output")),
                (0, false, false) => errors.push(format!("stage '{name}': first stage needs a source")),
                (_, true, true) => errors.push(format!(
                    "stage '{name}': cannot have both a source and use_previous_output"
                )),
                (_, false, false) => errors.push(format!(
                    "stage '{name}': needs either a source or use_previous_output"
                )),
                _ => {}
            }
            if !stage.column_mappings.is_empty() && !stage.use_previous_output {
                errors.push(format!("stage '{name}': column_mappings need use_previous_output"));
            }

            if stage.ceiling == 0 {
                errors.push(format!("stage '{name}': concurrency ceiling must be positive"));
            }
            if let Err(e) = BatchBounds::new(stage.bounds.min(), stage.bounds.max()) {
                errors.push(format!("stage '{name}': {e}"));
            }
            if let Err(e) = InputFormatter::new(&stage.model_id, stage.template_id.as_deref(), templates, config) {
                errors.push(format!("stage '{name}': {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Invalid(errors))
        }
    }
}

/// The report of one finished stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage_name: String,
    pub report: RunReport,
}

/// Reports of every stage that ran, in order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub pipeline_name: String,
    pub stages: Vec<StageOutcome>,
}

impl PipelineReport {
    /// Joined output of the last stage.
    pub fn final_output(&self) -> Option<&str> {
        self.stages.last()?.report.joined_location.as_deref()
    }
}
