//! # Input Formatter
//!
//! Renders the records of a [`BatchUnit`] into the line-delimited request
//! file a backend consumes, and parses that backend's output lines back.
//!
//! ## Request Shapes
//!
//! Every provider has its own line schema. A provider is one implementation of
//! [`RequestShape`]; adding a backend means adding an implementation and a
//! match arm in [`shape_for_model`]. Nothing else in the crate knows about
//! provider schemas.
//!
//! - [`AnthropicMessages`] - text generation, requires a prompt template
//! - [`TitanEmbedding`] - embeddings, reads the input-text field directly
//!
//! ## Correlation
//!
//! Every request line carries the record's correlation id as `recordId`. The
//! output joiner pairs output lines back to records by that id when the backend
//! echoes it, and by line position otherwise.

mod anthropic;
mod template;
mod titan;

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

pub use anthropic::AnthropicMessages;
pub use template::{PromptTemplate, TemplateRegistry};
pub use titan::TitanEmbedding;

use crate::config::OrchestratorConfig;
use crate::error::FormatError;
use crate::partition::BatchUnit;
use crate::record::record_id;

/// What a model produces per record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    /// Free text from a templated prompt.
    Text,
    /// A vector from raw input text.
    Embedding,
}

/// The parsed content of one output line.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponsePayload {
    Text(String),
    Embedding(Vec<f64>),
    /// The backend reported a per-record error instead of output.
    Error(Value),
}

/// One decoded output line.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedLine {
    /// Correlation id echoed by the backend, if any.
    pub record_id: Option<String>,
    pub payload: ResponsePayload,
}

/// A provider's request/response line schema.
pub trait RequestShape: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn kind(&self) -> ModelKind;

    /// Build one request line.
    fn request(&self, record_id: &str, input_text: &str) -> Value;

    /// Decode one output line.
    fn parse_response(&self, line: &Value) -> Result<ParsedLine, String>;
}

pub(crate) fn line_record_id(line: &Value) -> Option<String> {
    match line.get("recordId")? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Resolve the request shape for a model id.
pub fn shape_for_model(model_id: &str, max_tokens: u32) -> Result<Arc<dyn RequestShape>, FormatError> {
    if model_id.contains("anthropic") {
        Ok(Arc::new(AnthropicMessages { max_tokens }))
    } else if model_id.contains("amazon.titan-embed-text-v2") {
        Ok(Arc::new(TitanEmbedding))
    } else {
        Err(FormatError::UnsupportedModel(model_id.to_string()))
    }
}

/// Renders Batch Units for one model/template pair.
#[derive(Clone)]
pub struct InputFormatter {
    shape: Arc<dyn RequestShape>,
    template: Option<PromptTemplate>,
    record_id_field: String,
    input_text_field: String,
}

impl InputFormatter {
    /// Build a formatter, validating the model/template combination.
    ///
    /// Text models need a registered template. Embedding models ignore any
    /// template and read `input_text_field` instead.
    pub fn new(
        model_id: &str,
        template_id: Option<&str>,
        templates: &TemplateRegistry,
        config: &OrchestratorConfig,
    ) -> Result<Self, FormatError> {
        let shape = shape_for_model(model_id, config.max_tokens)?;
        debug!(model = model_id, shape = shape.name(), "resolved request shape");

        let template = match shape.kind() {
            ModelKind::Text => {
                let id = template_id.ok_or_else(|| FormatError::TemplateRequired(model_id.to_string()))?;
                let template = templates
                    .get(id)
                    .cloned()
                    .ok_or_else(|| FormatError::UnknownTemplate(id.to_string()))?;
                Some(template)
            }
            ModelKind::Embedding => {
                if let Some(id) = template_id {
                    debug!(template = id, model = model_id, "ignoring template for embedding model");
                }
                None
            }
        };

        Ok(Self {
            shape,
            template,
            record_id_field: config.record_id_field.clone(),
            input_text_field: config.input_text_field.clone(),
        })
    }

    /// The request shape resolved for the model.
    pub fn shape(&self) -> Arc<dyn RequestShape> {
        self.shape.clone()
    }

    /// Whether the model generates text or embeddings.
    pub fn kind(&self) -> ModelKind {
        self.shape.kind()
    }

    /// Record field holding the correlation id.
    pub fn record_id_field(&self) -> &str {
        &self.record_id_field
    }

    /// Render every record of `unit` as one request line each.
    ///
    /// Records must already carry a correlation id. Errors report the record's
    /// offset in the source, not in the unit.
    pub fn render_unit(&self, unit: &BatchUnit) -> Result<Vec<u8>, FormatError> {
        let mut out = String::new();
        for (offset, record) in unit.records.iter().enumerate() {
            let record_index = unit.start + offset;
            let id = record_id(record, &self.record_id_field).ok_or_else(|| {
                FormatError::MissingTemplateField {
                    record_index,
                    field: self.record_id_field.clone(),
                }
            })?;

            let text = match &self.template {
                Some(template) => template.render(record, record_index)?,
                None => match record.get(&self.input_text_field) {
                    Some(Value::String(s)) => s.clone(),
                    None | Some(Value::Null) => {
                        return Err(FormatError::MissingTemplateField {
                            record_index,
                            field: self.input_text_field.clone(),
                        });
                    }
                    Some(other) => other.to_string(),
                },
            };

            let line = self.shape.request(&id, &text);
            out.push_str(&line.to_string());
            out.push('\n');
        }
        Ok(out.into_bytes())
    }

    /// Decode one raw output line.
    pub fn parse_line(&self, raw: &str) -> Result<ParsedLine, String> {
        let value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        self.shape.parse_response(&value)
    }
}
