use std::fmt::Write as _;
use std::fs::{File, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::events::StageEvent;
use crate::roles::AgentRole;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub role: AgentRole,
    pub message: String,
    pub timestamp_ms: u64,
}

impl From<&StageEvent> for TraceEvent {
    fn from(event: &StageEvent) -> Self {
        let message = match event {
            StageEvent::Started { .. } => "started".to_string(),
            StageEvent::Completed {
                duration_ms,
                fell_back: false,
                ..
            } => format!("completed in {duration_ms} ms"),
            StageEvent::Completed { duration_ms, .. } => {
                format!("completed with fallback in {duration_ms} ms")
            }
            StageEvent::Failed {
                duration_ms, reason, ..
            } => format!("failed after {duration_ms} ms: {reason}"),
        };
        Self {
            role: event.role(),
            message,
            timestamp_ms: event.timestamp(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceCollector {
    events: Vec<TraceEvent>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: &StageEvent) {
        self.events.push(TraceEvent::from(event));
    }

    /// Take every event already queued on `receiver` without waiting.
    pub fn drain(&mut self, receiver: &mut UnboundedReceiver<StageEvent>) {
        while let Ok(event) = receiver.try_recv() {
            self.record(&event);
        }
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary::from_events(&self.events)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub index: usize,
    pub role: AgentRole,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub steps: Vec<TraceStep>,
}

impl TraceSummary {
    pub fn from_events(events: &[TraceEvent]) -> Self {
        let steps = events
            .iter()
            .enumerate()
            .map(|(idx, event)| TraceStep {
                index: idx + 1,
                role: event.role,
                message: event.message.clone(),
            })
            .collect();
        Self { steps }
    }

    pub fn render_markdown(&self) -> String {
        if self.steps.is_empty() {
            return "No stage events recorded.".to_string();
        }
        let mut output = String::from("### Pipeline trace\n");
        for step in &self.steps {
            let _ = writeln!(output, "{}. {} -> {}", step.index, step.role, step.message);
        }
        output
    }

    pub fn render_mermaid(&self) -> String {
        if self.steps.is_empty() {
            return "flowchart TD\n  %% no stage events captured".to_string();
        }

        let mut output = String::from("flowchart TD\n");
        for step in &self.steps {
            let label = sanitize_mermaid(&format!("{}: {}", step.role, step.message));
            let _ = writeln!(output, "  step{}[\"{label}\"]", step.index);
        }
        for idx in 1..self.steps.len() {
            let _ = writeln!(output, "  step{idx} --> step{}", idx + 1);
        }
        output
    }
}

fn sanitize_mermaid(text: &str) -> String {
    text.replace('"', "'")
        .replace('[', "(")
        .replace(']', ")")
        .replace('\n', "<br/>")
}

pub fn persist_trace<P: AsRef<Path>>(
    dir: P,
    request_id: &str,
    events: &[TraceEvent],
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    create_dir_all(dir)
        .with_context(|| format!("failed to create trace directory {}", dir.display()))?;
    let path = dir.join(format!("{request_id}.json"));
    let payload = serde_json::to_vec_pretty(events)?;
    let mut file = File::create(&path)
        .with_context(|| format!("failed to create trace file {}", path.display()))?;
    file.write_all(&payload)
        .with_context(|| format!("failed to write trace file {}", path.display()))?;
    Ok(path)
}
