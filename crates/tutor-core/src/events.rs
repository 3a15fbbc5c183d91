//! Stage lifecycle notifications.
//!
//! The coordinator emits an event immediately before each generation call and
//! immediately after it resolves. Observing them is optional: `solve` works
//! the same with no collector attached.

use crate::roles::AgentRole;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

pub type RequestId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageEvent {
    /// Generation call for the stage is about to be issued
    Started {
        request_id: RequestId,
        timestamp: u64,
        role: AgentRole,
    },
    /// Stage resolved, possibly through its local fallback
    Completed {
        request_id: RequestId,
        timestamp: u64,
        role: AgentRole,
        duration_ms: u64,
        fell_back: bool,
    },
    /// Stage terminated the request
    Failed {
        request_id: RequestId,
        timestamp: u64,
        role: AgentRole,
        duration_ms: u64,
        reason: String,
    },
}

impl StageEvent {
    pub fn role(&self) -> AgentRole {
        match self {
            StageEvent::Started { role, .. }
            | StageEvent::Completed { role, .. }
            | StageEvent::Failed { role, .. } => *role,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            StageEvent::Started { request_id, .. }
            | StageEvent::Completed { request_id, .. }
            | StageEvent::Failed { request_id, .. } => request_id,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            StageEvent::Started { timestamp, .. }
            | StageEvent::Completed { timestamp, .. }
            | StageEvent::Failed { timestamp, .. } => *timestamp,
        }
    }
}

/// Sends stage events to whoever holds the receiving end.
#[derive(Clone)]
pub struct EventCollector {
    sender: mpsc::UnboundedSender<StageEvent>,
}

impl EventCollector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StageEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn emit_started(&self, request_id: &str, role: AgentRole) {
        self.send(StageEvent::Started {
            request_id: request_id.to_string(),
            timestamp: current_timestamp(),
            role,
        });
    }

    pub fn emit_completed(&self, request_id: &str, role: AgentRole, duration_ms: u64, fell_back: bool) {
        self.send(StageEvent::Completed {
            request_id: request_id.to_string(),
            timestamp: current_timestamp(),
            role,
            duration_ms,
            fell_back,
        });
    }

    pub fn emit_failed(&self, request_id: &str, role: AgentRole, duration_ms: u64, reason: String) {
        self.send(StageEvent::Failed {
            request_id: request_id.to_string(),
            timestamp: current_timestamp(),
            role,
            duration_ms,
            reason,
        });
    }

    fn send(&self, event: StageEvent) {
        // A dropped receiver only means nobody is watching.
        if let Err(e) = self.sender.send(event) {
            tracing::debug!(error = %e, "stage event receiver dropped");
        }
    }
}

/// Current Unix timestamp in milliseconds
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Idle,
    Working,
    Completed,
    Error,
}

/// Caller-owned status of one agent, driven by [`StageEvent`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub role: AgentRole,
    pub status: StatusKind,
    pub message: String,
}

impl AgentStatus {
    pub fn idle(role: AgentRole) -> Self {
        Self {
            role,
            status: StatusKind::Idle,
            message: String::new(),
        }
    }

    /// One fresh idle status per role, in pipeline order.
    pub fn board() -> Vec<AgentStatus> {
        AgentRole::PIPELINE_ORDER
            .iter()
            .map(|role| AgentStatus::idle(*role))
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, StatusKind::Completed | StatusKind::Error)
    }

    /// Apply an event for this role. Events for other roles, and any event
    /// after a terminal state, are ignored.
    pub fn apply(&mut self, event: &StageEvent) {
        if event.role() != self.role || self.is_terminal() {
            return;
        }
        match event {
            StageEvent::Started { .. } => {
                self.status = StatusKind::Working;
                self.message = format!("{} working", self.role);
            }
            StageEvent::Completed { fell_back, .. } => {
                self.status = StatusKind::Completed;
                self.message = if *fell_back {
                    "completed with fallback output".to_string()
                } else {
                    "completed".to_string()
                };
            }
            StageEvent::Failed { reason, .. } => {
                self.status = StatusKind::Error;
                self.message = reason.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collector_delivers_events_in_order() {
        let (collector, mut receiver) = EventCollector::new();
        collector.emit_started("req", AgentRole::Librarian);
        collector.emit_completed("req", AgentRole::Librarian, 5, false);

        let first = receiver.recv().await.unwrap();
        assert!(matches!(first, StageEvent::Started { role: AgentRole::Librarian, .. }));
        let second = receiver.recv().await.unwrap();
        assert_eq!(second.request_id(), "req");
        assert!(matches!(second, StageEvent::Completed { duration_ms: 5, .. }));
    }

    #[test]
    fn emitting_without_receiver_is_harmless() {
        let (collector, receiver) = EventCollector::new();
        drop(receiver);
        collector.emit_started("req", AgentRole::Solver);
    }

    #[test]
    fn status_lifecycle_is_terminal() {
        let mut status = AgentStatus::idle(AgentRole::Solver);
        status.apply(&StageEvent::Started {
            request_id: "r".into(),
            timestamp: 0,
            role: AgentRole::Solver,
        });
        assert_eq!(status.status, StatusKind::Working);

        status.apply(&StageEvent::Failed {
            request_id: "r".into(),
            timestamp: 1,
            role: AgentRole::Solver,
            duration_ms: 1,
            reason: "quota".into(),
        });
        assert_eq!(status.status, StatusKind::Error);
        assert_eq!(status.message, "quota");

        status.apply(&StageEvent::Completed {
            request_id: "r".into(),
            timestamp: 2,
            role: AgentRole::Solver,
            duration_ms: 1,
            fell_back: false,
        });
        assert_eq!(status.status, StatusKind::Error);
    }

    #[test]
    fn status_ignores_other_roles() {
        let mut status = AgentStatus::idle(AgentRole::Examiner);
        status.apply(&StageEvent::Started {
            request_id: "r".into(),
            timestamp: 0,
            role: AgentRole::Librarian,
        });
        assert_eq!(status.status, StatusKind::Idle);
        assert_eq!(AgentStatus::board().len(), 3);
    }
}
