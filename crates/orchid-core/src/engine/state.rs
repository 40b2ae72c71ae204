//! Workflow state tracking, snapshot, and restore.
//!
//! The store owns one `WorkflowState` per workflow id in a `DashMap`. All
//! reads return cloned values -- never hold a `DashMap` guard across await.
//! Restore is the only operation that accepts external data, so it carries
//! the integrity checks: a snapshot from a skewed clock or with overlapping
//! step sets is rejected before it can replace a live entry.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use orchid_types::error::OrchestrationError;
use orchid_types::state::{WorkflowState, WorkflowStateSnapshot, CLOCK_SKEW_TOLERANCE_SECS};
use orchid_types::workflow::WorkflowStatus;
use serde_json::json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The snapshot timestamp is ahead of this process's clock beyond the
    /// skew tolerance.
    #[error("snapshot for workflow '{workflow_id}' was created in the future ({created_at})")]
    TimestampInFuture {
        workflow_id: Uuid,
        created_at: chrono::DateTime<Utc>,
    },

    /// The snapshot marks at least one step as both completed and failed.
    #[error("snapshot marks steps as both completed and failed: {step_ids}")]
    OverlappingSets { step_ids: String },
}

impl From<StateError> for OrchestrationError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::TimestampInFuture { .. } => {
                OrchestrationError::InvalidState(err.to_string())
            }
            StateError::OverlappingSets { .. } => OrchestrationError::Validation(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Concurrent store of per-workflow run state.
pub struct StateStore {
    states: DashMap<Uuid, WorkflowState>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    /// Create a Pending record for the workflow if none exists. Returns a
    /// clone of the current state either way.
    pub fn ensure(&self, workflow_id: Uuid) -> WorkflowState {
        self.states.entry(workflow_id).or_default().value().clone()
    }

    /// Clone of the tracked state, or `None` if the workflow is unknown.
    pub fn get(&self, workflow_id: Uuid) -> Option<WorkflowState> {
        self.states.get(&workflow_id).map(|entry| entry.value().clone())
    }

    pub fn set_status(&self, workflow_id: Uuid, status: WorkflowStatus) {
        if let Some(mut entry) = self.states.get_mut(&workflow_id) {
            entry.value_mut().status = status;
        }
    }

    /// Record a completed step. The id moves out of the failed set if a
    /// previous attempt put it there.
    pub fn record_step_completed(&self, workflow_id: Uuid, step_id: &str) {
        if let Some(mut entry) = self.states.get_mut(&workflow_id) {
            entry.value_mut().record_completed(step_id);
        }
    }

    /// Record a failed step. The id moves out of the completed set if a
    /// previous run put it there.
    pub fn record_step_failed(&self, workflow_id: Uuid, step_id: &str) {
        if let Some(mut entry) = self.states.get_mut(&workflow_id) {
            entry.value_mut().record_failed(step_id);
        }
    }

    /// Count a skipped step toward the workflow's terminal-outcome index.
    pub fn record_step_skipped(&self, workflow_id: Uuid) {
        if let Some(mut entry) = self.states.get_mut(&workflow_id) {
            entry.value_mut().record_skipped();
        }
    }

    /// Merge key-value pairs into the workflow's context map.
    pub fn merge_context(
        &self,
        workflow_id: Uuid,
        entries: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) {
        if let Some(mut entry) = self.states.get_mut(&workflow_id) {
            entry.value_mut().context.extend(entries);
        }
    }

    pub fn set_context_value(&self, workflow_id: Uuid, key: &str, value: serde_json::Value) {
        self.merge_context(workflow_id, [(key.to_string(), value)]);
    }

    // -----------------------------------------------------------------------
    // Snapshot / restore / export
    // -----------------------------------------------------------------------

    /// Capture a point-in-time snapshot of the workflow's state.
    ///
    /// The `deep_copy` flag is accepted for callers that distinguish shared
    /// from isolated snapshots; every snapshot owns its data, so both
    /// settings return a copy that later store mutations cannot reach.
    pub fn snapshot(&self, workflow_id: Uuid, _deep_copy: bool) -> Option<WorkflowStateSnapshot> {
        self.states
            .get(&workflow_id)
            .map(|entry| WorkflowStateSnapshot::capture(workflow_id, entry.value()))
    }

    /// Replace the workflow's state with a previously captured snapshot.
    ///
    /// Checks, in order: the snapshot timestamp is not in the future beyond
    /// the skew tolerance, and the completed and failed sets are disjoint.
    /// Only then is the entry swapped, so a rejected snapshot leaves the
    /// tracked state untouched.
    pub fn restore(&self, snapshot: WorkflowStateSnapshot) -> Result<(), StateError> {
        let horizon = Utc::now() + Duration::seconds(CLOCK_SKEW_TOLERANCE_SECS);
        if snapshot.created_at > horizon {
            return Err(StateError::TimestampInFuture {
                workflow_id: snapshot.workflow_id,
                created_at: snapshot.created_at,
            });
        }

        let mut overlap: Vec<&String> = snapshot
            .completed_step_ids
            .intersection(&snapshot.failed_step_ids)
            .collect();
        if !overlap.is_empty() {
            overlap.sort();
            let step_ids = overlap
                .iter()
                .map(|id| format!("'{id}'"))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(StateError::OverlappingSets { step_ids });
        }

        let workflow_id = snapshot.workflow_id;
        self.states.insert(workflow_id, snapshot.into_state());

        tracing::info!(workflow_id = %workflow_id, "workflow state restored from snapshot");
        Ok(())
    }

    /// Serialize the workflow's state to JSON with UUIDs as strings and
    /// step sets as sorted arrays.
    pub fn export(&self, workflow_id: Uuid, _deep_copy: bool) -> Option<serde_json::Value> {
        let entry = self.states.get(&workflow_id)?;
        let state = entry.value();

        let mut completed: Vec<&String> = state.completed_step_ids.iter().collect();
        completed.sort();
        let mut failed: Vec<&String> = state.failed_step_ids.iter().collect();
        failed.sort();

        Some(json!({
            "workflow_id": workflow_id.to_string(),
            "status": state.status.as_str(),
            "completed_step_ids": completed,
            "failed_step_ids": failed,
            "current_step_index": state.current_step_index,
            "context": state.context,
        }))
    }

    // -----------------------------------------------------------------------
    // Shutdown support
    // -----------------------------------------------------------------------

    /// Mark every non-terminal workflow Cancelled. Returns how many were
    /// marked.
    pub fn mark_all_cancelled(&self) -> usize {
        let mut marked = 0;
        for mut entry in self.states.iter_mut() {
            let state = entry.value_mut();
            if !state.status.is_terminal() {
                state.status = WorkflowStatus::Cancelled;
                marked += 1;
            }
        }
        marked
    }

    pub fn tracked_count(&self) -> usize {
        self.states.len()
    }

    pub fn workflow_ids(&self) -> Vec<Uuid> {
        self.states.iter().map(|entry| *entry.key()).collect()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("tracked", &self.states.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ensure_creates_pending_state() {
        let store = StateStore::new();
        let workflow_id = Uuid::now_v7();

        let state = store.ensure(workflow_id);
        assert_eq!(state.status, WorkflowStatus::Pending);
        assert_eq!(store.tracked_count(), 1);

        // Second ensure returns the same record, not a fresh one.
        store.record_step_completed(workflow_id, "a");
        let again = store.ensure(workflow_id);
        assert!(again.completed_step_ids.contains("a"));
    }

    #[test]
    fn test_get_unknown_returns_none() {
        let store = StateStore::new();
        assert!(store.get(Uuid::now_v7()).is_none());
    }

    #[test]
    fn test_record_keeps_sets_disjoint() {
        let store = StateStore::new();
        let workflow_id = Uuid::now_v7();
        store.ensure(workflow_id);

        store.record_step_failed(workflow_id, "a");
        store.record_step_completed(workflow_id, "a");

        let state = store.get(workflow_id).unwrap();
        assert!(state.completed_step_ids.contains("a"));
        assert!(state.failed_step_ids.is_empty());
        assert_eq!(state.current_step_index, 2);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_mutation() {
        let store = StateStore::new();
        let workflow_id = Uuid::now_v7();
        store.ensure(workflow_id);
        store.record_step_completed(workflow_id, "a");
        store.set_context_value(workflow_id, "origin", json!("api"));

        let snapshot = store.snapshot(workflow_id, true).unwrap();
        let shallow = store.snapshot(workflow_id, false).unwrap();

        // Mutate the live state after both snapshots.
        store.record_step_completed(workflow_id, "b");
        store.set_context_value(workflow_id, "origin", json!("changed"));

        for snap in [&snapshot, &shallow] {
            assert_eq!(snap.completed_step_ids.len(), 1);
            assert_eq!(snap.context.get("origin"), Some(&json!("api")));
        }
    }

    #[test]
    fn test_snapshot_unknown_returns_none() {
        let store = StateStore::new();
        assert!(store.snapshot(Uuid::now_v7(), true).is_none());
    }

    #[test]
    fn test_restore_replaces_entry() {
        let store = StateStore::new();
        let workflow_id = Uuid::now_v7();
        store.ensure(workflow_id);
        store.record_step_completed(workflow_id, "a");

        let snapshot = store.snapshot(workflow_id, true).unwrap();

        // Diverge the live state, then roll back.
        store.record_step_failed(workflow_id, "b");
        store.restore(snapshot).unwrap();

        let state = store.get(workflow_id).unwrap();
        assert!(state.completed_step_ids.contains("a"));
        assert!(state.failed_step_ids.is_empty());
    }

    #[test]
    fn test_restore_into_empty_store() {
        let store = StateStore::new();
        let workflow_id = Uuid::now_v7();

        let mut state = WorkflowState::new();
        state.record_completed("a");
        let snapshot = WorkflowStateSnapshot::capture(workflow_id, &state);

        store.restore(snapshot).unwrap();
        assert!(store.get(workflow_id).unwrap().completed_step_ids.contains("a"));
    }

    #[test]
    fn test_restore_rejects_future_timestamp() {
        let store = StateStore::new();
        let workflow_id = Uuid::now_v7();

        let mut snapshot = WorkflowStateSnapshot::capture(workflow_id, &WorkflowState::new());
        snapshot.created_at = Utc::now() + Duration::seconds(120);

        let err = store.restore(snapshot).unwrap_err();
        assert!(err.to_string().contains("future"), "got: {err}");

        let orchestration: OrchestrationError = err.into();
        assert!(matches!(orchestration, OrchestrationError::InvalidState(_)));

        // The rejected snapshot never landed.
        assert!(store.get(workflow_id).is_none());
    }

    #[test]
    fn test_restore_tolerates_small_skew() {
        let store = StateStore::new();
        let workflow_id = Uuid::now_v7();

        let mut snapshot = WorkflowStateSnapshot::capture(workflow_id, &WorkflowState::new());
        snapshot.created_at = Utc::now() + Duration::seconds(10);

        assert!(store.restore(snapshot).is_ok());
    }

    #[test]
    fn test_restore_rejects_overlapping_sets() {
        let store = StateStore::new();
        let workflow_id = Uuid::now_v7();

        let mut snapshot = WorkflowStateSnapshot::capture(workflow_id, &WorkflowState::new());
        snapshot.completed_step_ids.insert("a".to_string());
        snapshot.completed_step_ids.insert("b".to_string());
        snapshot.failed_step_ids.insert("a".to_string());

        let err = store.restore(snapshot).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("both completed and failed"), "got: {msg}");
        assert!(msg.contains("'a'"));

        let orchestration: OrchestrationError = err.into();
        assert!(orchestration.is_validation());
    }

    #[test]
    fn test_export_shape() {
        let store = StateStore::new();
        let workflow_id = Uuid::now_v7();
        store.ensure(workflow_id);
        store.record_step_completed(workflow_id, "b");
        store.record_step_completed(workflow_id, "a");
        store.record_step_failed(workflow_id, "c");
        store.set_context_value(workflow_id, "execution_status", json!("running"));

        let exported = store.export(workflow_id, false).unwrap();
        assert_eq!(exported["workflow_id"], json!(workflow_id.to_string()));
        assert_eq!(exported["completed_step_ids"], json!(["a", "b"]));
        assert_eq!(exported["failed_step_ids"], json!(["c"]));
        assert_eq!(exported["current_step_index"], json!(3));
        assert_eq!(exported["context"]["execution_status"], json!("running"));
    }

    #[test]
    fn test_export_unknown_returns_none() {
        let store = StateStore::new();
        assert!(store.export(Uuid::now_v7(), false).is_none());
    }

    #[test]
    fn test_mark_all_cancelled_skips_terminal() {
        let store = StateStore::new();
        let running = Uuid::now_v7();
        let completed = Uuid::now_v7();
        let pending = Uuid::now_v7();

        store.ensure(running);
        store.set_status(running, WorkflowStatus::Running);
        store.ensure(completed);
        store.set_status(completed, WorkflowStatus::Completed);
        store.ensure(pending);

        let marked = store.mark_all_cancelled();
        assert_eq!(marked, 2);
        assert_eq!(store.get(running).unwrap().status, WorkflowStatus::Cancelled);
        assert_eq!(store.get(pending).unwrap().status, WorkflowStatus::Cancelled);
        assert_eq!(
            store.get(completed).unwrap().status,
            WorkflowStatus::Completed
        );
    }
}
