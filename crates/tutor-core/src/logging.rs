//! Append-only JSONL log of completed solutions with secret redaction.

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::{OpenOptions, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::pipeline::{SolveReport, StageRecord};

const LOG_DIR_ENV: &str = "TUTOR_LOG_DIR";
const DEFAULT_LOG_DIR: &str = "data/logs";

static REDACTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "api_key",
            Regex::new(r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid api_key regex"),
        ),
        (
            "bearer",
            Regex::new(r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)").expect("invalid bearer regex"),
        ),
        (
            "google_key",
            Regex::new(r"(AIza[0-9A-Za-z\-_]{35})").expect("invalid google_key regex"),
        ),
    ]
});

#[derive(Debug, Clone)]
pub struct SolutionLogInput {
    pub request_id: String,
    pub model: String,
    pub problem_text: String,
    pub source_labels: Vec<String>,
    pub image_count: usize,
    pub final_answer: String,
    pub curriculum_check: String,
    pub step_count: usize,
    pub stages: Vec<StageRecord>,
}

impl SolutionLogInput {
    pub fn from_report(
        report: &SolveReport,
        model: impl Into<String>,
        problem_text: impl Into<String>,
        source_labels: Vec<String>,
        image_count: usize,
    ) -> Self {
        Self {
            request_id: report.request_id.clone(),
            model: model.into(),
            problem_text: problem_text.into(),
            source_labels,
            image_count,
            final_answer: report.solution.final_answer.clone(),
            curriculum_check: report.solution.curriculum_check.clone(),
            step_count: report.solution.steps.len(),
            stages: report.stages.clone(),
        }
    }
}

#[derive(Serialize)]
struct SolutionLogRecord {
    timestamp: String,
    request_id: String,
    model: String,
    problem_text: String,
    source_labels: Vec<String>,
    image_count: usize,
    final_answer: String,
    curriculum_check: String,
    step_count: usize,
    stages: Vec<StageRecord>,
    redactions: Vec<&'static str>,
}

fn log_base_dir() -> PathBuf {
    std::env::var(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR))
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let line = serde_json::to_string(value)?;
    writeln!(writer, "{}", line)
        .with_context(|| format!("failed to append log entry to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

fn sanitize_text(input: &str, redactions: &mut BTreeSet<&'static str>) -> String {
    let mut output = input.to_string();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        if !regex.is_match(&output) {
            continue;
        }
        output = regex
            .replace_all(&output, |caps: &Captures| {
                if caps.len() > 2 {
                    format!("{}[REDACTED]", &caps[1])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .to_string();
        redactions.insert(*name);
    }
    output
}

/// Append a record for a completed solve to `<dir>/YYYY/MM/solutions.jsonl`.
///
/// `dir` overrides `TUTOR_LOG_DIR`, which in turn overrides `data/logs`.
pub fn log_solution(input: SolutionLogInput, dir: Option<&Path>) -> Result<PathBuf> {
    let timestamp = Utc::now();
    let mut redactions = BTreeSet::new();

    let record = SolutionLogRecord {
        timestamp: timestamp.to_rfc3339(),
        request_id: input.request_id.clone(),
        model: input.model,
        problem_text: sanitize_text(&input.problem_text, &mut redactions),
        source_labels: input.source_labels,
        image_count: input.image_count,
        final_answer: sanitize_text(&input.final_answer, &mut redactions),
        curriculum_check: sanitize_text(&input.curriculum_check, &mut redactions),
        step_count: input.step_count,
        stages: input.stages,
        redactions: redactions.into_iter().collect(),
    };

    let base_dir = dir.map(Path::to_path_buf).unwrap_or_else(log_base_dir);
    let path = base_dir
        .join(format!("{:04}", timestamp.year()))
        .join(format!("{:02}", timestamp.month()))
        .join("solutions.jsonl");
    append_json_line(&path, &record)?;

    if !record.redactions.is_empty() {
        warn!(
            request_id = %input.request_id,
            fields = ?record.redactions,
            "redacted potential secrets from solution log"
        );
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::AgentRole;
    use serde_json::Value;
    use tempfile::TempDir;

    fn input() -> SolutionLogInput {
        SolutionLogInput {
            request_id: "req-1".to_string(),
            model: "gemini-2.5-flash".to_string(),
            problem_text: "my api_key=abcd1234 please solve".to_string(),
            source_labels: vec!["Ch3".to_string()],
            image_count: 0,
            final_answer: "6 N".to_string(),
            curriculum_check: "Bearer XYZ123".to_string(),
            step_count: 2,
            stages: vec![StageRecord {
                role: AgentRole::Librarian,
                duration_ms: 3,
                fell_back: false,
            }],
        }
    }

    #[test]
    fn sanitize_keeps_prefix() {
        let mut redactions = BTreeSet::new();
        let text = sanitize_text("api_key = secret99", &mut redactions);
        assert_eq!(text, "api_key = [REDACTED]");
        assert!(redactions.contains("api_key"));

        let key = format!("AIza{}", "a".repeat(35));
        let text = sanitize_text(&format!("key {key}"), &mut redactions);
        assert_eq!(text, "key [REDACTED]");
    }

    #[test]
    fn writes_sanitized_record() -> Result<()> {
        let temp = TempDir::new().expect("temp dir");
        let path = log_solution(input(), Some(temp.path()))?;
        assert!(path.ends_with("solutions.jsonl"));

        let line = std::fs::read_to_string(&path)?;
        let record: Value = serde_json::from_str(line.trim())?;
        assert_eq!(record["request_id"], "req-1");
        assert!(record["problem_text"].as_str().unwrap().contains("[REDACTED]"));
        assert!(!record["curriculum_check"].as_str().unwrap().contains("XYZ123"));
        assert_eq!(record["redactions"].as_array().unwrap().len(), 2);
        assert_eq!(record["stages"][0]["role"], "Librarian");

        log_solution(input(), Some(temp.path()))?;
        let contents = std::fs::read_to_string(&path)?;
        assert_eq!(contents.lines().count(), 2);
        Ok(())
    }
}
