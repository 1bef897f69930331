//! Input records and source datasets.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::error::{OrchestratorError, Result};

/// One input row: a flat JSON object.
pub type Record = Map<String, Value>;

/// Encoding of a source dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceFormat {
    /// One JSON object per line.
    JsonLines,
    /// A single JSON array of objects.
    JsonArray,
    /// Comma separated values with a header row. Cells are read as strings;
    /// empty cells become `null`.
    Csv,
}

impl SourceFormat {
    /// Guess the format from a location's extension.
    pub fn infer(location: &str) -> Option<Self> {
        let ext = location.rsplit('.').next()?.to_ascii_lowercase();
        match ext.as_str() {
            "jsonl" | "ndjson" => Some(Self::JsonLines),
            "json" => Some(Self::JsonArray),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }
}

/// Where a Run's records come from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub location: String,
    pub format: Option<SourceFormat>,
}

impl SourceDescriptor {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            format: None,
        }
    }

    pub fn with_format(mut self, format: SourceFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Explicit format, or the one implied by the extension.
    pub fn resolved_format(&self) -> Result<SourceFormat> {
        self.format
            .or_else(|| SourceFormat::infer(&self.location))
            .ok_or_else(|| OrchestratorError::Source {
                location: self.location.clone(),
                reason: "cannot infer source format".to_string(),
            })
    }

    /// Read and decode every record, in source order.
    pub async fn load(&self, store: &dyn BlobStore) -> Result<Vec<Record>> {
        let format = self.resolved_format()?;
        let bytes = store.read(&self.location).await?;
        decode_records(&self.location, &bytes, format)
    }
}

pub(crate) fn decode_records(location: &str, bytes: &[u8], format: SourceFormat) -> Result<Vec<Record>> {
    let invalid = |reason: String| OrchestratorError::Source {
        location: location.to_string(),
        reason,
    };
    let text = std::str::from_utf8(bytes).map_err(|e| invalid(e.to_string()))?;

    match format {
        SourceFormat::JsonLines => text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| match serde_json::from_str::<Value>(line) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(_) => Err(invalid(format!("line {} is not an object", idx + 1))),
                Err(e) => Err(invalid(format!("line {}: {e}", idx + 1))),
            })
            .collect(),
        SourceFormat::JsonArray => {
            let value: Value = serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?;
            let Value::Array(items) = value else {
                return Err(invalid("document is not an array".to_string()));
            };
            items
                .into_iter()
                .enumerate()
                .map(|(idx, item)| match item {
                    Value::Object(map) => Ok(map),
                    _ => Err(invalid(format!("element {idx} is not an object"))),
                })
                .collect()
        }
        SourceFormat::Csv => {
            let mut reader = csv::ReaderBuilder::new().from_reader(text.as_bytes());
            let headers = reader.headers().map_err(|e| invalid(e.to_string()))?.clone();
            reader
                .records()
                .enumerate()
                .map(|(idx, row)| -> Result<Record> {
                    let row = row.map_err(|e| invalid(format!("row {}: {e}", idx + 1)))?;
                    Ok(headers
                        .iter()
                        .zip(row.iter())
                        .map(|(column, cell)| (column.to_string(), csv_cell(cell)))
                        .collect())
                })
                .collect()
        }
    }
}

fn csv_cell(cell: &str) -> Value {
    if cell.is_empty() {
        Value::Null
    } else {
        Value::String(cell.to_string())
    }
}

/// Encode records as JSON Lines.
pub fn encode_json_lines<'a>(records: impl IntoIterator<Item = &'a Record>) -> Vec<u8> {
    let mut out = String::new();
    for record in records {
        // a Map<String, Value> always serializes
        out.push_str(&Value::Object(record.clone()).to_string());
        out.push('\n');
    }
    out.into_bytes()
}

/// Give every record without one a fresh correlation id.
///
/// Existing ids are kept untouched, including non-string ones, which are
/// rendered to strings when a request line is built.
pub fn assign_record_ids(records: &mut [Record], field: &str) -> usize {
    let mut assigned = 0;
    for record in records.iter_mut() {
        let missing = matches!(record.get(field), None | Some(Value::Null));
        if missing {
            record.insert(field.to_string(), Value::String(Uuid::new_v4().to_string()));
            assigned += 1;
        }
    }
    assigned
}

/// The correlation id of a record, if it has one.
pub fn record_id(record: &Record, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
