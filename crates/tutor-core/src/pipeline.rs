//! Pipeline coordinator: runs Librarian, Solver and Examiner in strict order
//! and composes the final [`Solution`].

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::context::{
    DEFAULT_MAX_GROUNDING_CHARS, ImageAttachment, ProblemContext, TextbookSource,
    assemble_grounding,
};
use crate::error::{GenerationFailure, TutorError};
use crate::events::EventCollector;
use crate::invoker::Generator;
use crate::memo::{MemoPolicy, PassThrough};
use crate::metrics::{StageOutcome, record_stage_metrics};
use crate::roles::AgentRole;
use crate::solution::{Solution, Step};
use crate::stages::{
    EMPTY_MEMO_SENTINEL, EMPTY_VERDICT_SENTINEL, StageDescriptor, StageInputs, StageOutput,
    StageResult,
};

/// Lifecycle of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    NotStarted,
    RunningLibrarian,
    RunningSolver,
    RunningExaminer,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn running(role: AgentRole) -> Self {
        match role {
            AgentRole::Librarian => PipelineState::RunningLibrarian,
            AgentRole::Solver => PipelineState::RunningSolver,
            AgentRole::Examiner => PipelineState::RunningExaminer,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Cap on the assembled grounding text, in characters.
    pub max_grounding_chars: usize,
    /// Per-stage limit; expiry is reported as a generation failure.
    pub stage_timeout: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_grounding_chars: DEFAULT_MAX_GROUNDING_CHARS,
            stage_timeout: None,
        }
    }
}

/// Per-stage summary kept alongside the solution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub role: AgentRole,
    pub duration_ms: u64,
    pub fell_back: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SolveReport {
    pub request_id: String,
    pub solution: Solution,
    pub stages: Vec<StageRecord>,
    pub grounding_truncated: bool,
}

enum StageFailure {
    Generation(GenerationFailure),
    Cancelled,
}

/// Sequences the three agents for one request at a time. Shareable across
/// concurrent requests; per-request data never leaves the `solve` call.
pub struct Coordinator {
    generator: Arc<dyn Generator>,
    config: CoordinatorConfig,
    memo_policy: Arc<dyn MemoPolicy>,
    events: Option<EventCollector>,
    stages: [StageDescriptor; 3],
}

impl Coordinator {
    pub fn new(generator: Arc<dyn Generator>, config: CoordinatorConfig) -> Self {
        Self {
            generator,
            config,
            memo_policy: Arc::new(PassThrough),
            events: None,
            stages: StageDescriptor::pipeline(),
        }
    }

    pub fn with_events(mut self, events: EventCollector) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_memo_policy(mut self, policy: Arc<dyn MemoPolicy>) -> Self {
        self.memo_policy = policy;
        self
    }

    pub fn model_id(&self) -> &str {
        self.generator.model_id()
    }

    /// Caller entry point: `solve(problemText, textbookSources, images)`.
    pub async fn solve_parts(
        &self,
        problem_text: impl Into<String>,
        textbook_sources: Vec<TextbookSource>,
        images: Vec<ImageAttachment>,
    ) -> Result<Solution, TutorError> {
        let context = ProblemContext {
            problem_text: problem_text.into(),
            images,
            textbook_sources,
        };
        self.solve(&context).await
    }

    pub async fn solve(&self, context: &ProblemContext) -> Result<Solution, TutorError> {
        self.solve_with_report(context, &CancellationToken::new())
            .await
            .map(|report| report.solution)
    }

    /// Run the pipeline, honouring `cancel` before and during each stage.
    /// No partial result is surfaced on failure or cancellation.
    pub async fn solve_with_report(
        &self,
        context: &ProblemContext,
        cancel: &CancellationToken,
    ) -> Result<SolveReport, TutorError> {
        context.validate().inspect_err(|failure| {
            warn!(%failure, "rejecting request before any agent call");
        })?;

        let request_id = Uuid::new_v4().to_string();
        let grounding = assemble_grounding(&context.textbook_sources, self.config.max_grounding_chars);
        info!(
            %request_id,
            sources = context.textbook_sources.len(),
            images = context.images.len(),
            grounding_chars = grounding.text.chars().count(),
            "starting solve request"
        );

        let mut state = PipelineState::NotStarted;
        let mut records = Vec::with_capacity(self.stages.len());
        let mut memo: Option<String> = None;
        let mut steps: Option<Vec<Step>> = None;
        let mut verdict: Option<String> = None;

        for stage in &self.stages {
            let inputs = StageInputs {
                problem_text: &context.problem_text,
                images: &context.images,
                grounding: Some(&grounding.text),
                memo: memo.as_deref(),
                steps: steps.as_deref(),
            };

            let (result, record) = match self
                .run_stage(&request_id, stage, &inputs, cancel, &mut state)
                .await
            {
                Ok(ok) => ok,
                Err(err) => {
                    state = PipelineState::Failed;
                    debug!(%request_id, ?state, "pipeline terminated");
                    return Err(err);
                }
            };
            records.push(record);

            let fell_back = result.fell_back;
            match result.output {
                StageOutput::Steps(list) => steps = Some(list),
                StageOutput::Text(text) if stage.role == AgentRole::Librarian => {
                    memo = Some(self.prepare_memo(text, fell_back));
                }
                StageOutput::Text(text) => verdict = Some(text),
            }
        }

        state = PipelineState::Completed;
        let solution = Solution::assemble(
            memo.unwrap_or_else(|| EMPTY_MEMO_SENTINEL.to_string()),
            steps.unwrap_or_default(),
            verdict.unwrap_or_else(|| EMPTY_VERDICT_SENTINEL.to_string()),
        );
        info!(%request_id, ?state, steps = solution.steps.len(), "solve request completed");

        Ok(SolveReport {
            request_id,
            solution,
            stages: records,
            grounding_truncated: grounding.truncated,
        })
    }

    #[instrument(name = "pipeline.stage", skip_all, fields(role = %stage.role, %request_id))]
    async fn run_stage(
        &self,
        request_id: &str,
        stage: &StageDescriptor,
        inputs: &StageInputs<'_>,
        cancel: &CancellationToken,
        state: &mut PipelineState,
    ) -> Result<(StageResult, StageRecord), TutorError> {
        let role = stage.role;
        if cancel.is_cancelled() {
            info!("cancelled before stage was issued");
            return Err(TutorError::Cancelled { stage: Some(role) });
        }

        *state = PipelineState::running(role);
        debug!(?state, "entering stage");

        let request = stage.request(inputs);
        self.emit(|events| events.emit_started(request_id, role));
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StageFailure::Cancelled),
            result = self.call_with_timeout(self.generator.generate(request)) => {
                result.map_err(StageFailure::Generation)
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(raw) => {
                let result = stage.interpret(raw);
                let fell_back = result.fell_back;
                self.emit(|events| events.emit_completed(request_id, role, duration_ms, fell_back));
                record_stage_metrics(
                    role.as_str(),
                    if fell_back {
                        StageOutcome::Fallback
                    } else {
                        StageOutcome::Completed
                    },
                    duration_ms,
                );
                info!(duration_ms, fell_back, "stage completed");
                Ok((
                    result,
                    StageRecord {
                        role,
                        duration_ms,
                        fell_back,
                    },
                ))
            }
            Err(StageFailure::Generation(failure)) => {
                warn!(error = %failure, duration_ms, "stage failed");
                self.emit(|events| {
                    events.emit_failed(request_id, role, duration_ms, failure.to_string())
                });
                record_stage_metrics(role.as_str(), StageOutcome::Failed, duration_ms);
                Err(TutorError::generation(role, failure))
            }
            Err(StageFailure::Cancelled) => {
                info!(duration_ms, "stage cancelled while in flight");
                self.emit(|events| {
                    events.emit_failed(request_id, role, duration_ms, "cancelled".to_string())
                });
                record_stage_metrics(role.as_str(), StageOutcome::Cancelled, duration_ms);
                Err(TutorError::Cancelled { stage: Some(role) })
            }
        }
    }

    /// Apply the memo policy to a real memo. The sentinel is never cut, and a
    /// memo the policy empties is replaced by the sentinel.
    fn prepare_memo(&self, memo: String, fell_back: bool) -> String {
        if fell_back {
            return memo;
        }
        let prepared = self.memo_policy.prepare(memo);
        if prepared.trim().is_empty() {
            warn!("memo policy left an empty memo; substituting sentinel");
            return EMPTY_MEMO_SENTINEL.to_string();
        }
        prepared
    }

    async fn call_with_timeout<F>(&self, call: F) -> Result<String, GenerationFailure>
    where
        F: Future<Output = Result<String, GenerationFailure>>,
    {
        match self.config.stage_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or_else(|_| Err(GenerationFailure::timeout(limit.as_millis() as u64))),
            None => call.await,
        }
    }

    fn emit(&self, f: impl FnOnce(&EventCollector)) {
        if let Some(events) = &self.events {
            f(events);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::GenerationRequest;
    use crate::memo::CharBudget;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Generator for Echo {
        fn model_id(&self) -> &str {
            "echo"
        }

        async fn generate(&self, request: GenerationRequest) -> Result<String, GenerationFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(match request.role {
                AgentRole::Solver => {
                    r#"[{"title":"Answer","content":"42","agent":"Solver"}]"#.to_string()
                }
                role => format!("{role} output"),
            })
        }
    }

    fn context() -> ProblemContext {
        ProblemContext::new("what is six times seven")
            .with_source(TextbookSource::new("Ch1", "multiplication"))
    }

    #[tokio::test]
    async fn report_records_every_stage() {
        let coordinator = Coordinator::new(Arc::new(Echo::default()), CoordinatorConfig::default());
        let report = coordinator
            .solve_with_report(&context(), &CancellationToken::new())
            .await
            .unwrap();

        let roles: Vec<_> = report.stages.iter().map(|record| record.role).collect();
        assert_eq!(roles, AgentRole::PIPELINE_ORDER.to_vec());
        assert_eq!(report.solution.final_answer, "42");
        assert_eq!(report.solution.curriculum_check, "Examiner output");
        assert!(!report.grounding_truncated);
    }

    #[tokio::test]
    async fn pre_cancelled_token_prevents_any_stage() {
        let echo = Arc::new(Echo::default());
        let coordinator = Coordinator::new(echo.clone(), CoordinatorConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = coordinator
            .solve_with_report(&context(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TutorError::Cancelled {
                stage: Some(AgentRole::Librarian)
            }
        ));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn memo_budget_never_cuts_the_sentinel() {
        let coordinator = Coordinator::new(Arc::new(Echo::default()), CoordinatorConfig::default())
            .with_memo_policy(Arc::new(CharBudget(3)));
        assert_eq!(
            coordinator.prepare_memo(EMPTY_MEMO_SENTINEL.to_string(), true),
            EMPTY_MEMO_SENTINEL
        );
        assert_eq!(coordinator.prepare_memo("F=ma and more".into(), false), "F=m");

        let emptied = Coordinator::new(Arc::new(Echo::default()), CoordinatorConfig::default())
            .with_memo_policy(Arc::new(CharBudget(0)));
        assert_eq!(
            emptied.prepare_memo("F=ma".into(), false),
            EMPTY_MEMO_SENTINEL
        );
    }

    #[test]
    fn running_states_follow_roles() {
        assert_eq!(
            PipelineState::running(AgentRole::Examiner),
            PipelineState::RunningExaminer
        );
        assert!(PipelineState::Failed.is_terminal());
        assert!(!PipelineState::RunningSolver.is_terminal());
    }
}
