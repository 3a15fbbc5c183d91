//! Steps and the terminal `Solution` record.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::roles::AgentRole;

/// Used when the combined step sequence is empty.
pub const NO_ANSWER_SENTINEL: &str = "Could not generate answer.";

/// Title of the synthetic step carrying the Librarian memo.
pub const MEMO_STEP_TITLE: &str = "Research memo";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub title: String,
    pub content: String,
    pub agent: AgentRole,
}

impl Step {
    pub fn new(title: impl Into<String>, content: impl Into<String>, agent: AgentRole) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            agent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Solution {
    pub final_answer: String,
    pub steps: Vec<Step>,
    pub curriculum_check: String,
}

impl Solution {
    /// Compose the final record: memo first, then the solver steps in order.
    pub fn assemble(memo: String, solver_steps: Vec<Step>, curriculum_check: String) -> Self {
        let mut steps = Vec::with_capacity(solver_steps.len() + 1);
        steps.push(Step::new(MEMO_STEP_TITLE, memo, AgentRole::Librarian));
        steps.extend(solver_steps);
        Self::from_steps(steps, curriculum_check)
    }

    /// `final_answer` is always the content of the last step, or the sentinel.
    pub fn from_steps(steps: Vec<Step>, curriculum_check: String) -> Self {
        let final_answer = steps
            .last()
            .map(|step| step.content.clone())
            .unwrap_or_else(|| NO_ANSWER_SENTINEL.to_string());
        Self {
            final_answer,
            steps,
            curriculum_check,
        }
    }

    /// Steps produced by the Solver, without the leading memo.
    pub fn solver_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps
            .iter()
            .filter(|step| step.agent == AgentRole::Solver)
    }

    pub fn render_markdown(&self) -> String {
        let mut output = String::from("## Solution\n\n");
        for (idx, step) in self.steps.iter().enumerate() {
            let _ = writeln!(
                output,
                "### {}. {} ({})\n\n{}\n",
                idx + 1,
                step.title,
                step.agent,
                step.content.trim_end()
            );
        }
        let _ = writeln!(output, "**Final answer:** {}\n", self.final_answer.trim());
        let _ = writeln!(output, "## Examiner check\n\n{}", self.curriculum_check.trim());
        output
    }
}

/// Flatten steps into `title: content` lines for review.
pub fn flatten_steps(steps: &[Step]) -> String {
    steps
        .iter()
        .map(|step| format!("{}: {}", step.title, step.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memo_leads_and_last_step_is_answer() {
        let solution = Solution::assemble(
            "F = ma".into(),
            vec![
                Step::new("Identify", "m = 2, a = 3", AgentRole::Solver),
                Step::new("Answer", "F = 6 N", AgentRole::Solver),
            ],
            "ok".into(),
        );
        assert_eq!(solution.steps.len(), 3);
        assert_eq!(solution.steps[0].agent, AgentRole::Librarian);
        assert_eq!(solution.steps[0].title, MEMO_STEP_TITLE);
        assert_eq!(solution.final_answer, "F = 6 N");
        assert_eq!(solution.solver_steps().count(), 2);
    }

    #[test]
    fn memo_is_answer_when_solver_produced_nothing() {
        let solution = Solution::assemble("memo".into(), vec![], "ok".into());
        assert_eq!(solution.final_answer, "memo");
    }

    #[test]
    fn empty_sequence_uses_sentinel() {
        let solution = Solution::from_steps(vec![], "check".into());
        assert_eq!(solution.final_answer, NO_ANSWER_SENTINEL);
    }

    #[test]
    fn flatten_preserves_order() {
        let steps = vec![
            Step::new("One", "a", AgentRole::Solver),
            Step::new("Two", "b", AgentRole::Solver),
        ];
        assert_eq!(flatten_steps(&steps), "One: a\nTwo: b");
    }

    #[test]
    fn serializes_camel_case() {
        let solution = Solution::from_steps(vec![], "check".into());
        let value = serde_json::to_value(&solution).unwrap();
        assert!(value.get("finalAnswer").is_some());
        assert!(value.get("curriculumCheck").is_some());
    }
}
