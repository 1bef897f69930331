use serde_json::{Value, json};

use super::{ModelKind, ParsedLine, RequestShape, ResponsePayload};

const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

/// Request shape for Anthropic models behind the Messages API.
///
/// Each line carries a single user turn with one text block.
#[derive(Clone, Debug)]
pub struct AnthropicMessages {
    pub max_tokens: u32,
}

impl Default for AnthropicMessages {
    fn default() -> Self {
        Self { max_tokens: 1024 }
    }
}

impl RequestShape for AnthropicMessages {
    fn name(&self) -> &'static str {
        "anthropic-messages"
    }

    fn kind(&self) -> ModelKind {
        ModelKind::Text
    }

    fn request(&self, record_id: &str, input_text: &str) -> Value {
        json!({
            "recordId": record_id,
            "modelInput": {
                "anthropic_version": ANTHROPIC_VERSION,
                "max_tokens": self.max_tokens,
                "messages": [
                    {
                        "role": "user",
                        "content": [
                            { "type": "text", "text": input_text }
                        ]
                    }
                ]
            }
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

        let text = line
            .pointer("/modelOutput/content")
            .and_then(Value::as_array)
            .and_then(|blocks| blocks.last())
            .and_then(|block| block.get("text"))
            .and_then(Value::as_str)
            .ok_or_else(|| "missing modelOutput.content text".to_string())?;

        Ok(ParsedLine {
            record_id,
            payload: ResponsePayload::Text(text.to_string()),
        })
    }
}
