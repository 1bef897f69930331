use serde_json::{Value, json};

use super::{ModelKind, ParsedLine, RequestShape, ResponsePayload};

/// Request shape for the Titan v2 text embedding model.
#[derive(Clone, Debug, Default)]
pub struct TitanEmbedding;

impl RequestShape for TitanEmbedding {
    fn name(&self) -> &'static str {
        "titan-embedding"
    }

    fn kind(&self) -> ModelKind {
        ModelKind::Embedding
    }

    fn request(&self, record_id: &str, input_text: &str) -> Value {
        json!({
            "recordId": record_id,
            "modelInput": { "inputText": input_text }
        })
    }

    fn parse_response(&self, line: &Value) -> Result<ParsedLine, String> {
        let record_id = super::line_record_id(line);
        if let Some(error) = line.get("error").filter(|e| !e.is_null()) {
            return Ok(ParsedLine {
                record_id,
                payload: ResponsePayload::Error(error.clone()),
            });
        }

        let vector = line
            .pointer("/modelOutput/embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| "missing modelOutput.embedding".to_string())?
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| "non-numeric embedding value".to_string()))
            .collect::<Result<Vec<f64>, String>>()?;

        Ok(ParsedLine {
            record_id,
            payload: ResponsePayload::Embedding(vector),
        })
    }
}
