//! Contract for the external generation collaborator.
//!
//! Every stage reaches the model through [`Generator::generate`]. Structured
//! responses are returned as raw text; callers treat them as untrusted and
//! decode them themselves.

use async_trait::async_trait;

use crate::error::GenerationFailure;
use crate::roles::AgentRole;

/// One ordered piece of prompt content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptPart {
    Text(String),
    InlineMedia { mime_type: String, data: Vec<u8> },
}

impl PromptPart {
    pub fn text(text: impl Into<String>) -> Self {
        PromptPart::Text(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PromptPart::Text(text) => Some(text),
            PromptPart::InlineMedia { .. } => None,
        }
    }
}

/// Requested response shape. Absence of a schema means free text only.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputMode {
    FreeText,
    Structured(serde_json::Value),
}

impl OutputMode {
    pub fn schema(&self) -> Option<&serde_json::Value> {
        match self {
            OutputMode::FreeText => None,
            OutputMode::Structured(schema) => Some(schema),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Role issuing the request; informational for collaborators and stubs.
    pub role: AgentRole,
    pub instructions: String,
    pub parts: Vec<PromptPart>,
    pub output: OutputMode,
}

impl GenerationRequest {
    /// Concatenated text parts, useful for logging and test assertions.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(PromptPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn media_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|part| matches!(part, PromptPart::InlineMedia { .. }))
            .count()
    }
}

/// Opaque text / structured-output generation service.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Model identifier; a configuration-level constant.
    fn model_id(&self) -> &str;

    async fn generate(&self, request: GenerationRequest) -> Result<String, GenerationFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_text_skips_media() {
        let request = GenerationRequest {
            role: AgentRole::Librarian,
            instructions: String::new(),
            parts: vec![
                PromptPart::text("first"),
                PromptPart::InlineMedia {
                    mime_type: "image/png".into(),
                    data: vec![0, 1],
                },
                PromptPart::text("second"),
            ],
            output: OutputMode::FreeText,
        };
        assert_eq!(request.text(), "first\nsecond");
        assert_eq!(request.media_count(), 1);
        assert!(request.output.schema().is_none());
    }
}
