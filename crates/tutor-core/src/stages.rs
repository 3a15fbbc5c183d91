//! Stage descriptors for the Librarian, Solver and Examiner.
//!
//! The three agents share one invocation shape: instructions plus ordered
//! prompt parts plus an optional schema. A [`StageDescriptor`] captures the
//! per-role differences so the coordinator runs every stage the same way.

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::context::ImageAttachment;
use crate::invoker::{GenerationRequest, OutputMode, PromptPart};
use crate::prompts::{
    EXAMINER_INSTRUCTIONS, IMAGE_ONLY_PROBLEM, LIBRARIAN_INSTRUCTIONS, SOLVER_INSTRUCTIONS,
};
use crate::roles::AgentRole;
use crate::solution::{Step, flatten_steps};

pub const EMPTY_MEMO_SENTINEL: &str = "No relevant knowledge points found.";
pub const EMPTY_VERDICT_SENTINEL: &str = "Solution verified against syllabus requirements.";
pub const FALLBACK_STEP_TITLE: &str = "Solution Process";

/// What a stage does when the collaborator's output is unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Empty text is replaced by the sentinel.
    Sentinel(&'static str),
    /// Undecodable structured output becomes one step wrapping the raw text.
    SingleStep { title: &'static str },
}

#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub role: AgentRole,
    pub instructions: &'static str,
    pub output: OutputMode,
    pub fallback: FallbackPolicy,
}

impl StageDescriptor {
    pub fn librarian() -> Self {
        Self {
            role: AgentRole::Librarian,
            instructions: LIBRARIAN_INSTRUCTIONS,
            output: OutputMode::FreeText,
            fallback: FallbackPolicy::Sentinel(EMPTY_MEMO_SENTINEL),
        }
    }

    pub fn solver() -> Self {
        Self {
            role: AgentRole::Solver,
            instructions: SOLVER_INSTRUCTIONS,
            output: OutputMode::Structured(solver_schema()),
            fallback: FallbackPolicy::SingleStep {
                title: FALLBACK_STEP_TITLE,
            },
        }
    }

    pub fn examiner() -> Self {
        Self {
            role: AgentRole::Examiner,
            instructions: EXAMINER_INSTRUCTIONS,
            output: OutputMode::FreeText,
            fallback: FallbackPolicy::Sentinel(EMPTY_VERDICT_SENTINEL),
        }
    }

    /// Descriptors in fixed execution order.
    pub fn pipeline() -> [StageDescriptor; 3] {
        [Self::librarian(), Self::solver(), Self::examiner()]
    }

    pub fn request(&self, inputs: &StageInputs<'_>) -> GenerationRequest {
        GenerationRequest {
            role: self.role,
            instructions: self.instructions.to_string(),
            parts: self.build_parts(inputs),
            output: self.output.clone(),
        }
    }

    fn build_parts(&self, inputs: &StageInputs<'_>) -> Vec<PromptPart> {
        let problem = if inputs.problem_text.trim().is_empty() {
            IMAGE_ONLY_PROBLEM
        } else {
            inputs.problem_text
        };

        let mut parts = vec![PromptPart::Text(format!("PROBLEM:\n{problem}"))];
        match self.role {
            AgentRole::Librarian => {
                parts.push(PromptPart::Text(format!(
                    "TEXTBOOK SOURCES:\n{}",
                    inputs.grounding.unwrap_or_default()
                )));
            }
            AgentRole::Solver => {
                parts.push(PromptPart::Text(format!(
                    "LIBRARIAN RESEARCH MEMO:\n{}",
                    inputs.memo.unwrap_or_default()
                )));
            }
            AgentRole::Examiner => {
                parts.push(PromptPart::Text(format!(
                    "SOLVER STEPS:\n{}",
                    flatten_steps(inputs.steps.unwrap_or_default())
                )));
                parts.push(PromptPart::Text(format!(
                    "LIBRARIAN RESEARCH MEMO:\n{}",
                    inputs.memo.unwrap_or_default()
                )));
            }
        }

        parts.extend(inputs.images.iter().map(|image| PromptPart::InlineMedia {
            mime_type: image.mime_type.clone(),
            data: image.payload.clone(),
        }));
        parts
    }

    /// Apply the stage's post-processing and fallback to a raw response.
    pub fn interpret(&self, raw: String) -> StageResult {
        match self.fallback {
            FallbackPolicy::Sentinel(sentinel) => {
                if raw.trim().is_empty() {
                    warn!(role = %self.role, "empty response; substituting sentinel");
                    StageResult {
                        output: StageOutput::Text(sentinel.to_string()),
                        fell_back: true,
                    }
                } else {
                    StageResult {
                        output: StageOutput::Text(raw),
                        fell_back: false,
                    }
                }
            }
            FallbackPolicy::SingleStep { title } => match decode_steps(raw, title) {
                StepsDecode::Validated(steps) => {
                    debug!(role = %self.role, steps = steps.len(), "decoded structured steps");
                    StageResult {
                        output: StageOutput::Steps(steps),
                        fell_back: false,
                    }
                }
                StepsDecode::Fallback(step) => {
                    warn!(role = %self.role, "structured output did not match schema; wrapping raw text");
                    StageResult {
                        output: StageOutput::Steps(vec![step]),
                        fell_back: true,
                    }
                }
            },
        }
    }
}

/// Inputs available to a stage; each role reads the subset it needs.
#[derive(Debug, Clone, Copy)]
pub struct StageInputs<'a> {
    pub problem_text: &'a str,
    pub images: &'a [ImageAttachment],
    pub grounding: Option<&'a str>,
    pub memo: Option<&'a str>,
    pub steps: Option<&'a [Step]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutput {
    Text(String),
    Steps(Vec<Step>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub output: StageOutput,
    /// True when the agent-local fallback replaced the raw response.
    pub fell_back: bool,
}

/// Outcome of decoding untrusted Solver output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepsDecode {
    Validated(Vec<Step>),
    Fallback(Step),
}

#[derive(Debug, Deserialize)]
struct RawStep {
    title: String,
    content: String,
    agent: String,
}

/// Schema requested from the collaborator for Solver output.
pub fn solver_schema() -> serde_json::Value {
    json!({
        "type": "ARRAY",
        "items": {
            "type": "OBJECT",
            "properties": {
                "title": { "type": "STRING" },
                "content": { "type": "STRING" },
                "agent": { "type": "STRING", "enum": ["Solver"] }
            },
            "required": ["title", "content", "agent"]
        }
    })
}

/// Decode a JSON array of `{title, content, agent: "Solver"}`; anything else
/// falls back to a single step carrying the raw text.
pub fn decode_steps(raw: String, fallback_title: &str) -> StepsDecode {
    let parsed = serde_json::from_str::<Vec<RawStep>>(strip_code_fence(&raw));
    match parsed {
        Ok(steps) if steps.iter().all(|step| step.agent == AgentRole::Solver.as_str()) => {
            StepsDecode::Validated(
                steps
                    .into_iter()
                    .map(|step| Step::new(step.title, step.content, AgentRole::Solver))
                    .collect(),
            )
        }
        _ => StepsDecode::Fallback(Step::new(fallback_title, raw, AgentRole::Solver)),
    }
}

pub(crate) fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.strip_suffix("```").unwrap_or(rest);
    // Drop an optional language tag on the opening fence line.
    match body.split_once('\n') {
        Some((tag, inner)) if !tag.trim_start().starts_with(['[', '{']) => inner.trim(),
        _ => body.trim(),
    }
}
