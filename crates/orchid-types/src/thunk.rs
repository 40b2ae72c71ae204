//! Thunk types.
//!
//! A thunk is the fine-grained unit of work the engine emits for a step and
//! hands to the downstream executor. Thunks are append-only: once emitted
//! they are never mutated, and a retried step emits a fresh thunk with an
//! incremented `retry_count` rather than reusing the old one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Thunk
// ---------------------------------------------------------------------------

/// A deferred unit of work emitted for a single step attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thunk {
    /// Time-ordered v7 UUID assigned at emission.
    pub thunk_id: Uuid,
    /// Kind of operation (e.g. "execute_step").
    pub thunk_type: String,
    /// Downstream node type this thunk is routed to (`effect_node`,
    /// `compute_node`, `reduce_node`, `orchestrator_node`).
    pub target_node_type: String,
    /// Opaque operation payload for the executor.
    pub operation_data: serde_json::Value,
    /// Thunk IDs this thunk depends on. Must already be emitted for the
    /// same workflow.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    /// Scheduling priority hint for the executor.
    #[serde(default)]
    pub priority: ThunkPriority,
    /// Execution budget in milliseconds.
    pub timeout_ms: u64,
    /// Zero-based attempt number. The first emission for a step carries 0.
    #[serde(default)]
    pub retry_count: u32,
    /// Emission timestamp.
    pub created_at: DateTime<Utc>,
}

/// Scheduling priority hint attached to a thunk.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ThunkPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl ThunkPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

// ---------------------------------------------------------------------------
// Failure severity
// ---------------------------------------------------------------------------

/// Severity an executor assigns to a dispatch failure. Critical failures
/// combined with `fail_fast` halt the workflow without retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSeverity {
    #[default]
    Recoverable,
    Critical,
}

impl FailureSeverity {
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
