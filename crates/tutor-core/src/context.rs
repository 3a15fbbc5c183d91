//! Per-request problem context and grounding text assembly.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PreconditionFailure;

/// Upper bound on the grounding text handed to any agent, in characters.
pub const DEFAULT_MAX_GROUNDING_CHARS: usize = 800_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextbookSource {
    pub source_label: String,
    pub full_text: String,
}

impl TextbookSource {
    pub fn new(source_label: impl Into<String>, full_text: impl Into<String>) -> Self {
        Self {
            source_label: source_label.into(),
            full_text: full_text.into(),
        }
    }
}

/// Image attached to a problem, held by value for the whole request.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub payload: Vec<u8>,
    pub mime_type: String,
}

impl ImageAttachment {
    pub fn new(payload: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            payload,
            mime_type: mime_type.into(),
        }
    }
}

impl std::fmt::Debug for ImageAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageAttachment")
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.payload.len())
            .finish()
    }
}

/// Immutable bundle describing one solving request.
#[derive(Debug, Clone, Default)]
pub struct ProblemContext {
    pub problem_text: String,
    pub images: Vec<ImageAttachment>,
    pub textbook_sources: Vec<TextbookSource>,
}

impl ProblemContext {
    pub fn new(problem_text: impl Into<String>) -> Self {
        Self {
            problem_text: problem_text.into(),
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source: TextbookSource) -> Self {
        self.textbook_sources.push(source);
        self
    }

    pub fn with_image(mut self, image: ImageAttachment) -> Self {
        self.images.push(image);
        self
    }

    pub fn has_problem_text(&self) -> bool {
        !self.problem_text.trim().is_empty()
    }

    /// Checks that must hold before any agent is invoked.
    pub fn validate(&self) -> Result<(), PreconditionFailure> {
        if self.textbook_sources.is_empty() {
            return Err(PreconditionFailure::NoTextbookSource);
        }
        if !self.has_problem_text() && self.images.is_empty() {
            return Err(PreconditionFailure::NoProblemContent);
        }
        Ok(())
    }
}

/// Labelled, length-capped textbook text supplied to the agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grounding {
    pub text: String,
    /// Characters in the untruncated concatenation.
    pub total_chars: usize,
    pub truncated: bool,
}

/// Concatenate sources as labelled blocks and keep at most `max_chars` characters.
///
/// Sources appended past the cap are silently invisible to downstream agents;
/// a warning is logged whenever truncation happens.
pub fn assemble_grounding(sources: &[TextbookSource], max_chars: usize) -> Grounding {
    let mut text = sources
        .iter()
        .map(|source| format!("--- SOURCE: {} ---\n{}", source.source_label, source.full_text))
        .collect::<Vec<_>>()
        .join("\n\n");

    let total_chars = text.chars().count();
    let truncated = total_chars > max_chars;
    if truncated {
        if let Some((cut, _)) = text.char_indices().nth(max_chars) {
            text.truncate(cut);
        }
        warn!(
            max_chars,
            dropped_chars = total_chars - max_chars,
            sources = sources.len(),
            "grounding text truncated; trailing sources are invisible to agents"
        );
    }

    Grounding {
        text,
        total_chars,
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources() -> Vec<TextbookSource> {
        vec![
            TextbookSource::new("Ch3", "F=ma"),
            TextbookSource::new("Ch4", "p=mv"),
        ]
    }

    #[test]
    fn labels_and_order_are_preserved() {
        let grounding = assemble_grounding(&sources(), DEFAULT_MAX_GROUNDING_CHARS);
        assert_eq!(
            grounding.text,
            "--- SOURCE: Ch3 ---\nF=ma\n\n--- SOURCE: Ch4 ---\np=mv"
        );
        assert!(!grounding.truncated);
    }

    #[test]
    fn truncates_to_exact_character_count() {
        let full = assemble_grounding(&sources(), usize::MAX);
        let grounding = assemble_grounding(&sources(), 10);
        assert!(grounding.truncated);
        assert_eq!(grounding.text.chars().count(), 10);
        assert_eq!(grounding.total_chars, full.text.chars().count());
        assert!(full.text.starts_with(&grounding.text));
    }

    #[test]
    fn exact_fit_is_not_truncated() {
        let full = assemble_grounding(&sources(), usize::MAX);
        let len = full.text.chars().count();
        let grounding = assemble_grounding(&sources(), len);
        assert!(!grounding.truncated);
        assert_eq!(grounding.text, full.text);
    }

    #[test]
    fn truncation_respects_multibyte_boundaries() {
        let sources = vec![TextbookSource::new("π", "ΔE = mcΔθ")];
        let grounding = assemble_grounding(&sources, 19);
        assert_eq!(grounding.text.chars().count(), 19);
        assert!(grounding.text.ends_with('Δ'));
    }

    #[test]
    fn preconditions() {
        let ctx = ProblemContext::new("find the force");
        assert_eq!(ctx.validate(), Err(PreconditionFailure::NoTextbookSource));

        let ctx = ProblemContext::new("   ").with_source(TextbookSource::new("a", "b"));
        assert_eq!(ctx.validate(), Err(PreconditionFailure::NoProblemContent));

        let ctx = ctx.with_image(ImageAttachment::new(vec![1, 2, 3], "image/png"));
        assert_eq!(ctx.validate(), Ok(()));
    }
}
