//! Agent roles taking part in a solving request.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role assigned to one stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentRole {
    /// Extracts curriculum knowledge from the textbook sources
    Librarian,
    /// Produces the ordered solution steps
    Solver,
    /// Reviews the memo and steps against the syllabus
    Examiner,
}

impl AgentRole {
    /// Fixed execution order. No role is skipped or reordered.
    pub const PIPELINE_ORDER: [AgentRole; 3] =
        [AgentRole::Librarian, AgentRole::Solver, AgentRole::Examiner];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Librarian => "Librarian",
            AgentRole::Solver => "Solver",
            AgentRole::Examiner => "Examiner",
        }
    }

    /// Position of the role within [`AgentRole::PIPELINE_ORDER`].
    pub fn position(&self) -> usize {
        match self {
            AgentRole::Librarian => 0,
            AgentRole::Solver => 1,
            AgentRole::Examiner => 2,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
