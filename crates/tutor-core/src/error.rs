use std::{fmt, path::PathBuf};

use thiserror::Error;

use crate::roles::AgentRole;

/// Core error type for the tutor pipeline.
#[derive(Debug, Error)]
pub enum TutorError {
    #[error("precondition failed: {0}")]
    Precondition(#[from] PreconditionFailure),
    #[error("{stage} stage failed: {source}")]
    Generation {
        stage: AgentRole,
        #[source]
        source: GenerationFailure,
    },
    #[error("request cancelled{}", cancelled_suffix(.stage))]
    Cancelled { stage: Option<AgentRole> },
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {}: {source}", .path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TutorError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }

    pub fn generation(stage: AgentRole, source: GenerationFailure) -> Self {
        Self::Generation { stage, source }
    }

    /// Stage that was in flight when the request terminated, if any.
    pub fn failed_stage(&self) -> Option<AgentRole> {
        match self {
            TutorError::Generation { stage, .. } => Some(*stage),
            TutorError::Cancelled { stage } => *stage,
            _ => None,
        }
    }
}

fn cancelled_suffix(stage: &Option<AgentRole>) -> String {
    stage
        .map(|role| format!(" before {role} completed"))
        .unwrap_or_default()
}

/// Request rejected before any agent was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PreconditionFailure {
    #[error("at least one textbook source is required")]
    NoTextbookSource,
    #[error("problem text or at least one image is required")]
    NoProblemContent,
}

/// Broad classification of a failed collaborator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transport,
    Auth,
    Quota,
    /// The service refused the request itself (bad model id, rejected schema).
    Request,
    Server,
    Malformed,
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transport => "transport",
            FailureKind::Auth => "auth",
            FailureKind::Quota => "quota",
            FailureKind::Request => "rejected request",
            FailureKind::Server => "server",
            FailureKind::Malformed => "malformed response",
            FailureKind::Timeout => "timeout",
        }
    }
}

/// Failure of the generation collaborator itself. Never retried by the core.
#[derive(Debug, Clone)]
pub struct GenerationFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl GenerationFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, message)
    }

    pub fn timeout(after_ms: u64) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("no response within {after_ms} ms"),
        )
    }
}

impl fmt::Display for GenerationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for GenerationFailure {}
