use anyhow::Result;
use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

struct StageMetrics {
    runs: Counter<u64>,
    duration_ms: Histogram<f64>,
    fallbacks: Counter<u64>,
}

static METRICS: OnceCell<StageMetrics> = OnceCell::new();

fn handles() -> &'static StageMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("tutor.pipeline");
        StageMetrics {
            runs: meter
                .u64_counter("tutor_stage_runs_total")
                .with_description("Stage executions by role and outcome")
                .init(),
            duration_ms: meter
                .f64_histogram("tutor_stage_duration_ms")
                .with_description("Generation call latency per stage in milliseconds")
                .init(),
            fallbacks: meter
                .u64_counter("tutor_stage_fallbacks_total")
                .with_description("Stages resolved through their local fallback")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) -> Result<()> {
    if std::env::var("TUTOR_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "TUTOR_OTEL_METRICS_ENDPOINT detected for {service_name}. Configure an OTLP meter provider in your deployment to export stage metrics."
        );
    }
    Ok(())
}

/// Outcome label recorded with each stage metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    Fallback,
    Failed,
    Cancelled,
}

impl StageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageOutcome::Completed => "completed",
            StageOutcome::Fallback => "fallback",
            StageOutcome::Failed => "failed",
            StageOutcome::Cancelled => "cancelled",
        }
    }
}

/// Record OTEL metrics for one stage (no-op if no provider installed).
pub fn record_stage_metrics(role: &str, outcome: StageOutcome, duration_ms: u64) {
    let metrics = handles();
    let attrs = [
        KeyValue::new("role", role.to_string()),
        KeyValue::new("outcome", outcome.as_str()),
    ];

    metrics.runs.add(1, &attrs);
    metrics.duration_ms.record(duration_ms as f64, &attrs);

    if outcome == StageOutcome::Fallback {
        metrics.fallbacks.add(1, &attrs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_provider_is_noop() {
        record_stage_metrics("Solver", StageOutcome::Fallback, 12);
        record_stage_metrics("Solver", StageOutcome::Failed, 3);
    }
}
