//! Event types for the Orchid engine event bus.
//!
//! `EngineEvent` is the unified event type broadcast during workflow
//! execution. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::SkipReason;

/// Events emitted during workflow orchestration.
///
/// Used by the event bus to communicate workflow lifecycle, step progress,
/// and engine health to subscribers (logging, monitoring, callers).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A workflow run has started executing.
    WorkflowStarted {
        workflow_id: Uuid,
        workflow_name: String,
        mode: String,
        step_count: usize,
    },

    /// A step has started executing.
    StepStarted {
        workflow_id: Uuid,
        step_id: String,
        step_name: String,
        step_type: String,
    },

    /// A step completed successfully.
    StepCompleted {
        workflow_id: Uuid,
        step_id: String,
        step_name: String,
        duration_ms: u64,
    },

    /// A step failed.
    StepFailed {
        workflow_id: Uuid,
        step_id: String,
        step_name: String,
        error: String,
        will_retry: bool,
    },

    /// A step was skipped without executing.
    StepSkipped {
        workflow_id: Uuid,
        step_id: String,
        reason: SkipReason,
    },

    /// A workflow run finished with every step accounted for.
    WorkflowCompleted {
        workflow_id: Uuid,
        duration_ms: u64,
        steps_completed: usize,
    },

    /// A workflow run finished with unrecovered failures.
    WorkflowFailed {
        workflow_id: Uuid,
        error: String,
    },

    /// Periodic health-monitor heartbeat.
    Heartbeat {
        active_workflows: usize,
        tracked_workflows: usize,
        total_thunks: usize,
    },

    /// Engine discovery announcement published at startup.
    EngineAnnounce {
        engine_version: String,
        capabilities: serde_json::Value,
    },

    /// Shutdown initiated; no new workflows will be accepted.
    ShutdownRequested { reason: String },
}

impl EngineEvent {
    /// Returns the workflow_id from variants scoped to a single run, or
    /// None for engine-scoped events.
    pub fn workflow_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::WorkflowStarted { workflow_id, .. }
            | EngineEvent::StepStarted { workflow_id, .. }
            | EngineEvent::StepCompleted { workflow_id, .. }
            | EngineEvent::StepFailed { workflow_id, .. }
            | EngineEvent::StepSkipped { workflow_id, .. }
            | EngineEvent::WorkflowCompleted { workflow_id, .. }
            | EngineEvent::WorkflowFailed { workflow_id, .. } => Some(*workflow_id),

            EngineEvent::Heartbeat { .. }
            | EngineEvent::EngineAnnounce { .. }
            | EngineEvent::ShutdownRequested { .. } => None,
        }
    }
}
