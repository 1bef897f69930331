use std::collections::HashMap;

use serde_json::Value;

use crate::error::FormatError;
use crate::record::Record;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A prompt with `{field}` placeholders filled from record fields.
///
/// `{{` and `}}` render as literal braces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptTemplate {
    id: String,
    segments: Vec<Segment>,
}

impl PromptTemplate {
    pub fn parse(id: impl Into<String>, text: &str) -> Result<Self, FormatError> {
        let id = id.into();
        let malformed = |reason: &str| FormatError::MalformedTemplate {
            id: id.clone(),
            reason: reason.to_string(),
        };

        let mut segments = vec![];
        let mut literal = String::new();
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => return Err(malformed("unclosed placeholder")),
                            Some(ch) => name.push(ch),
                        }
                    }
                    let name = name.trim().to_string();
                    if name.is_empty() {
                        return Err(malformed("empty placeholder"));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(name));
                }
                '}' => return Err(malformed("unmatched '}'")),
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { id, segments })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Placeholder names in order of first appearance.
    pub fn fields(&self) -> Vec<&str> {
        let mut seen = vec![];
        for segment in &self.segments {
            if let Segment::Field(name) = segment {
                if !seen.contains(&name.as_str()) {
                    seen.push(name.as_str());
                }
            }
        }
        seen
    }

    /// Fill the template from `record`.
    ///
    /// `record_index` is only used to locate the failing record in errors.
    pub fn render(&self, record: &Record, record_index: usize) -> Result<String, FormatError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => match record.get(name) {
                    None | Some(Value::Null) => {
                        return Err(FormatError::MissingTemplateField {
                            record_index,
                            field: name.clone(),
                        });
                    }
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                },
            }
        }
        Ok(out)
    }
}

/// Prompt templates addressable by id.
#[derive(Clone, Debug, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, PromptTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and register a template, replacing any previous one with the same id.
    pub fn register(&mut self, id: &str, text: &str) -> Result<(), FormatError> {
        let template = PromptTemplate::parse(id, text)?;
        self.templates.insert(id.to_string(), template);
        Ok(())
    }

    pub fn with_template(mut self, id: &str, text: &str) -> Result<Self, FormatError> {
        self.register(id, text)?;
        Ok(self)
    }

    pub fn get(&self, id: &str) -> Option<&PromptTemplate> {
        self.templates.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.templates.contains_key(id)
    }
}
