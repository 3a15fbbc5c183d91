//! GCSE tutor core: a Librarian → Solver → Examiner pipeline over an opaque
//! text-generation collaborator.
//!
//! The Librarian extracts curriculum knowledge from the supplied textbook
//! sources, the Solver turns it into ordered solution steps, and the Examiner
//! reviews both. [`Coordinator`] runs the stages in that fixed order and
//! composes the final [`Solution`]. [`GraphExtractor`] separately turns
//! textbook sources into a curriculum [`KnowledgeGraph`].

mod config;
mod context;
mod error;
mod events;
mod gemini;
mod graph;
mod invoker;
mod logging;
mod memo;
mod metrics;
mod pipeline;
mod prompts;
mod roles;
mod security;
mod solution;
mod stages;
mod telemetry;
mod trace;

pub use config::{Config, ConfigLoader, LoggingConfig, ModelConfig, PipelineConfig};
pub use context::{
    DEFAULT_MAX_GROUNDING_CHARS, Grounding, ImageAttachment, ProblemContext, TextbookSource,
    assemble_grounding,
};
pub use error::{FailureKind, GenerationFailure, PreconditionFailure, TutorError};
pub use events::{AgentStatus, EventCollector, RequestId, StageEvent, StatusKind};
pub use gemini::{DEFAULT_GEMINI_BASE_URL, DEFAULT_GEMINI_MODEL, GeminiGenerator};
pub use graph::{
    Entity, GraphExtractor, KnowledgeGraph, PEDAGOGICAL_RELATIONS, Relationship, decode_graph,
    graph_schema,
};
pub use invoker::{GenerationRequest, Generator, OutputMode, PromptPart};
pub use logging::{SolutionLogInput, log_solution};
pub use memo::{CharBudget, MemoPolicy, PassThrough};
pub use metrics::{StageOutcome, init_metrics_from_env, record_stage_metrics};
pub use pipeline::{
    Coordinator, CoordinatorConfig, PipelineState, SolveReport, StageRecord,
};
pub use roles::AgentRole;
pub use security::{SecretValue, require_env};
pub use solution::{MEMO_STEP_TITLE, NO_ANSWER_SENTINEL, Solution, Step, flatten_steps};
pub use stages::{
    EMPTY_MEMO_SENTINEL, EMPTY_VERDICT_SENTINEL, FALLBACK_STEP_TITLE, FallbackPolicy,
    StageDescriptor, StageInputs, StageOutput, StageResult, StepsDecode, decode_steps,
    solver_schema,
};
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use trace::{TraceCollector, TraceEvent, TraceStep, TraceSummary, persist_trace};

pub use tokio_util::sync::CancellationToken;
