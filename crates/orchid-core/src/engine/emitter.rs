//! Thunk emission and the per-workflow emission registry.
//!
//! The emitter is the single source of thunk ids and timestamps. Each
//! workflow gets an append-only `Vec<Thunk>` in a `DashMap`; emitted thunks
//! are never mutated or removed until engine shutdown clears the registry.
//! A thunk may only depend on thunks already emitted for the same workflow.

use std::collections::HashSet;

use chrono::Utc;
use dashmap::DashMap;
use orchid_types::error::OrchestrationError;
use orchid_types::thunk::{Thunk, ThunkPriority};
use uuid::Uuid;

use super::graph::{ensure_acyclic, GraphError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    /// A dependency references a thunk never emitted for this workflow.
    #[error("unknown thunk dependency: thunk '{thunk_id}' was not emitted for workflow '{workflow_id}'")]
    UnknownDependency { workflow_id: Uuid, thunk_id: Uuid },

    /// Adding the thunk would break the dependency graph.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl From<EmitError> for OrchestrationError {
    fn from(err: EmitError) -> Self {
        OrchestrationError::Validation(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Emission request
// ---------------------------------------------------------------------------

/// Everything the caller decides about a thunk; the emitter supplies the id
/// and timestamp.
#[derive(Debug, Clone)]
pub struct EmitRequest {
    pub thunk_type: String,
    pub target_node_type: String,
    pub operation_data: serde_json::Value,
    /// Ids of thunks this one depends on, all previously emitted for the
    /// same workflow.
    pub dependencies: Vec<Uuid>,
    pub priority: ThunkPriority,
    pub timeout_ms: u64,
    /// Zero-based attempt number; retries emit a fresh thunk with this
    /// incremented.
    pub retry_count: u32,
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

/// Emits thunks and tracks every emission per workflow.
pub struct ThunkEmitter {
    thunks: DashMap<Uuid, Vec<Thunk>>,
}

impl ThunkEmitter {
    pub fn new() -> Self {
        Self {
            thunks: DashMap::new(),
        }
    }

    /// Emit a thunk for `workflow_id`.
    ///
    /// Validates that every dependency id was already emitted for this
    /// workflow and that the combined dependency graph stays acyclic, then
    /// appends the new thunk to the registry and returns it.
    pub fn emit(&self, workflow_id: Uuid, request: EmitRequest) -> Result<Thunk, EmitError> {
        let mut entry = self.thunks.entry(workflow_id).or_default();
        let emitted = entry.value_mut();

        let known: HashSet<Uuid> = emitted.iter().map(|t| t.thunk_id).collect();
        for dep in &request.dependencies {
            if !known.contains(dep) {
                return Err(EmitError::UnknownDependency {
                    workflow_id,
                    thunk_id: *dep,
                });
            }
        }

        let thunk_id = Uuid::now_v7();

        // Combined graph must stay acyclic.
        let mut nodes: Vec<(Uuid, Vec<Uuid>)> = emitted
            .iter()
            .map(|t| (t.thunk_id, t.dependencies.clone()))
            .collect();
        nodes.push((thunk_id, request.dependencies.clone()));
        ensure_acyclic(&nodes)?;

        let thunk = Thunk {
            thunk_id,
            thunk_type: request.thunk_type,
            target_node_type: request.target_node_type,
            operation_data: request.operation_data,
            dependencies: request.dependencies,
            priority: request.priority,
            timeout_ms: request.timeout_ms,
            retry_count: request.retry_count,
            created_at: Utc::now(),
        };
        emitted.push(thunk.clone());

        tracing::debug!(
            workflow_id = %workflow_id,
            thunk_id = %thunk.thunk_id,
            target = %thunk.target_node_type,
            retry_count = thunk.retry_count,
            "thunk emitted"
        );

        Ok(thunk)
    }

    /// All thunks emitted for a workflow, in emission order (cloned).
    pub fn emitted_for(&self, workflow_id: Uuid) -> Vec<Thunk> {
        self.thunks
            .get(&workflow_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Number of thunks emitted for a workflow.
    pub fn count_for(&self, workflow_id: Uuid) -> usize {
        self.thunks
            .get(&workflow_id)
            .map(|entry| entry.value().len())
            .unwrap_or(0)
    }

    /// Total thunks emitted across all workflows.
    pub fn total_emitted(&self) -> usize {
        self.thunks.iter().map(|entry| entry.value().len()).sum()
    }

    /// Drop every tracked emission. Engine shutdown only.
    pub fn clear(&self) {
        self.thunks.clear();
    }
}

impl Default for ThunkEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ThunkEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThunkEmitter")
            .field("workflows", &self.thunks.len())
            .field("total_emitted", &self.total_emitted())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
