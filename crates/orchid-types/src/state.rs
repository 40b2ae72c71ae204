//! Workflow run state and snapshot types.
//!
//! `WorkflowState` is the live, mutable record of a single workflow run.
//! `WorkflowStateSnapshot` is its point-in-time export, used for
//! checkpoint/restore across process boundaries. The completed and failed
//! step sets are kept disjoint at all times; the mutation helpers here are
//! the only way engine code touches them.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::WorkflowStatus;

/// Maximum tolerated forward clock skew when restoring a snapshot.
pub const CLOCK_SKEW_TOLERANCE_SECS: i64 = 30;

// ---------------------------------------------------------------------------
// Workflow state
// ---------------------------------------------------------------------------

/// Live state of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub status: WorkflowStatus,
    /// Step IDs that completed. Always disjoint from `failed_step_ids`.
    #[serde(default)]
    pub completed_step_ids: HashSet<String>,
    /// Step IDs that failed after recovery was exhausted.
    #[serde(default)]
    pub failed_step_ids: HashSet<String>,
    /// Count of steps that reached a terminal outcome in this run.
    #[serde(default)]
    pub current_step_index: usize,
    /// Free-form context: execution status, caller metadata, last error.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self {
            status: WorkflowStatus::Pending,
            completed_step_ids: HashSet::new(),
            failed_step_ids: HashSet::new(),
            current_step_index: 0,
            context: HashMap::new(),
        }
    }

    /// Record a completed step, evicting it from the failed set so the two
    /// sets stay disjoint (a retried step moves atomically).
    pub fn record_completed(&mut self, step_id: &str) {
        self.failed_step_ids.remove(step_id);
        self.completed_step_ids.insert(step_id.to_string());
        self.current_step_index += 1;
    }

    /// Record a failed step, evicting it from the completed set.
    pub fn record_failed(&mut self, step_id: &str) {
        self.completed_step_ids.remove(step_id);
        self.failed_step_ids.insert(step_id.to_string());
        self.current_step_index += 1;
    }

    /// Count a skipped step toward the terminal-outcome index without
    /// touching the completed or failed sets.
    pub fn record_skipped(&mut self) {
        self.current_step_index += 1;
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time export of a workflow run, suitable for persistence and
/// later restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStateSnapshot {
    pub workflow_id: Uuid,
    /// When the snapshot was taken. Restore rejects timestamps further than
    /// `CLOCK_SKEW_TOLERANCE_SECS` in the future.
    pub created_at: DateTime<Utc>,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub completed_step_ids: HashSet<String>,
    #[serde(default)]
    pub failed_step_ids: HashSet<String>,
    #[serde(default)]
    pub current_step_index: usize,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl WorkflowStateSnapshot {
    /// Capture the given state as of now.
    pub fn capture(workflow_id: Uuid, state: &WorkflowState) -> Self {
        Self {
            workflow_id,
            created_at: Utc::now(),
            status: state.status,
            completed_step_ids: state.completed_step_ids.clone(),
            failed_step_ids: state.failed_step_ids.clone(),
            current_step_index: state.current_step_index,
            context: state.context.clone(),
        }
    }

    /// Rebuild the live state this snapshot captured.
    pub fn into_state(self) -> WorkflowState {
        WorkflowState {
            status: self.status,
            completed_step_ids: self.completed_step_ids,
            failed_step_ids: self.failed_step_ids,
            current_step_index: self.current_step_index,
            context: self.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Step outcomes
// ---------------------------------------------------------------------------

/// Terminal result of one step within a run, accumulated in run order.
/// Condition functions receive the slice of previous outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub status: StepStatus,
    /// Why the step was skipped, when it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Executor output for completed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Final error message for failed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Number of dispatch attempts made (0 for skipped steps).
    pub attempts: u32,
}

impl StepOutcome {
    pub fn completed(
        step_id: &str,
        output: serde_json::Value,
        duration_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Completed,
            skip_reason: None,
            output: Some(output),
            error: None,
            duration_ms,
            attempts,
        }
    }

    pub fn failed(step_id: &str, error: String, duration_ms: u64, attempts: u32) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Failed,
            skip_reason: None,
            output: None,
            error: Some(error),
            duration_ms,
            attempts,
        }
    }

    pub fn skipped(step_id: &str, reason: SkipReason) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Skipped,
            skip_reason: Some(reason),
            output: None,
            error: None,
            duration_ms: 0,
            attempts: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, StepStatus::Completed)
    }
}

/// Terminal status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

/// Why a step was skipped rather than executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The step was submitted with `enabled: false`.
    Disabled,
    /// Its condition function evaluated to false.
    ConditionFalse,
    /// A dependency (possibly transitive) failed.
    DependencyFailed,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_state_is_pending_and_empty() {
        let state = WorkflowState::new();
        assert_eq!(state.status, WorkflowStatus::Pending);
        assert!(state.completed_step_ids.is_empty());
        assert!(state.failed_step_ids.is_empty());
        assert_eq!(state.current_step_index, 0);
    }

    #[test]
    fn test_record_completed_evicts_failed() {
        let mut state = WorkflowState::new();
        state.record_failed("a");
        assert!(state.failed_step_ids.contains("a"));

        // Retry succeeded: "a" moves to completed, sets stay disjoint.
        state.record_completed("a");
        assert!(state.completed_step_ids.contains("a"));
        assert!(!state.failed_step_ids.contains("a"));
        assert_eq!(state.current_step_index, 2);
    }

    #[test]
    fn test_record_failed_evicts_completed() {
        let mut state = WorkflowState::new();
        state.record_completed("a");
        state.record_failed("a");
        assert!(!state.completed_step_ids.contains("a"));
        assert!(state.failed_step_ids.contains("a"));
    }

    #[test]
    fn test_record_skipped_advances_index_only() {
        let mut state = WorkflowState::new();
        state.record_completed("a");
        state.record_skipped();
        assert_eq!(state.current_step_index, 2);
        assert_eq!(state.completed_step_ids.len(), 1);
        assert!(state.failed_step_ids.is_empty());
    }

    #[test]
    fn test_snapshot_capture_and_into_state() {
        let mut state = WorkflowState::new();
        state.status = WorkflowStatus::Running;
        state.record_completed("a");
        state.context.insert("origin".to_string(), json!("api"));

        let snapshot = WorkflowStateSnapshot::capture(Uuid::now_v7(), &state);
        assert_eq!(snapshot.status, WorkflowStatus::Running);
        assert!(snapshot.completed_step_ids.contains("a"));

        let restored = snapshot.into_state();
        assert_eq!(restored.current_step_index, 1);
        assert_eq!(restored.context.get("origin"), Some(&json!("api")));
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let state = WorkflowState::new();
        let snapshot = WorkflowStateSnapshot::capture(Uuid::now_v7(), &state);
        let json_str = serde_json::to_string(&snapshot).unwrap();
        let parsed: WorkflowStateSnapshot = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.workflow_id, snapshot.workflow_id);
        assert_eq!(parsed.created_at, snapshot.created_at);
    }

    #[test]
    fn test_outcome_constructors() {
        let done = StepOutcome::completed("a", json!({"ok": true}), 12, 1);
        assert!(done.is_completed());
        assert_eq!(done.attempts, 1);

        let failed = StepOutcome::failed("b", "boom".to_string(), 5, 3);
        assert_eq!(failed.status, StepStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));

        let skipped = StepOutcome::skipped("c", SkipReason::ConditionFalse);
        assert_eq!(skipped.skip_reason, Some(SkipReason::ConditionFalse));
        assert_eq!(skipped.attempts, 0);
    }

    #[test]
    fn test_skip_reason_serde() {
        let json_str = serde_json::to_string(&SkipReason::DependencyFailed).unwrap();
        assert_eq!(json_str, "\"dependency_failed\"");
    }
}
