//! Workflow domain types for Orchid.
//!
//! Defines the shapes a caller hands to the engine: the immutable
//! `WorkflowDefinition` supplied once by the definition loader, the per-run
//! `Step` submission with its dependency edges, and the
//! `OrchestratorInput`/`OrchestratorOutput` pair that frames a single
//! `process()` call.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrchestrationError;

// ---------------------------------------------------------------------------
// Workflow Definition (immutable, loaded before processing)
// ---------------------------------------------------------------------------

/// The immutable workflow definition, supplied by the external definition
/// loader before `process()` is first called. The engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Human-readable workflow name.
    pub name: String,
    /// Version string (e.g. "1.0.0").
    pub version: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Execution mode used when the caller does not specify one.
    #[serde(default)]
    pub default_mode: ExecutionMode,
    /// Workflow-level timeout budget in milliseconds.
    #[serde(default = "default_workflow_timeout_ms")]
    pub timeout_ms: u64,
    /// Coordination rules governing concurrency and failure recovery.
    #[serde(default)]
    pub coordination: CoordinationRules,
    /// Node types this workflow may target.
    #[serde(default)]
    pub nodes: Vec<NodeDeclaration>,
}

fn default_workflow_timeout_ms() -> u64 {
    1_800_000 // 30 minutes
}

/// A node type declared by the workflow (informational; the engine routes
/// thunks by step type, not by declaration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDeclaration {
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Coordination rules attached to a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationRules {
    /// Whether parallel and batch modes are permitted for this workflow.
    #[serde(default = "default_true")]
    pub parallel_execution_allowed: bool,
    /// What to do when a step fails.
    #[serde(default)]
    pub failure_recovery_strategy: FailureRecoveryStrategy,
    /// When true, a critical-severity step failure halts the workflow
    /// immediately and is never retried.
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for CoordinationRules {
    fn default() -> Self {
        Self {
            parallel_execution_allowed: true,
            failure_recovery_strategy: FailureRecoveryStrategy::default(),
            fail_fast: false,
        }
    }
}

/// Strategy for recovering from a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureRecoveryStrategy {
    /// Re-dispatch the step up to `max_attempts` total attempts, then
    /// record the failure ("retry then propagate").
    Retry {
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
    },
    /// Record the failure and halt the remaining steps immediately.
    Abort,
    /// Record the failure and keep executing the remaining steps.
    Continue,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for FailureRecoveryStrategy {
    fn default() -> Self {
        Self::Retry { max_attempts: 3 }
    }
}

// ---------------------------------------------------------------------------
// Step (submitted per execution request)
// ---------------------------------------------------------------------------

/// A single unit of a workflow submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Caller-defined step ID (e.g. "gather-data"). Unique within a submission.
    pub step_id: String,
    /// Human-readable step name.
    pub step_name: String,
    /// The kind of work this step performs.
    pub step_type: StepType,
    /// Step IDs this step depends on (graph edges).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Disabled steps are skipped: neither completed nor failed.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Step-level timeout in milliseconds (engine default applies when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Name of a registered condition function gating execution.
    /// Absent means `always_true`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Opaque operation payload forwarded into emitted thunks.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// The kind of work a step performs, determining which node type its
/// thunks target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Effect,
    Compute,
    Reduce,
    Orchestrate,
}

impl StepType {
    /// The downstream node type thunks of this step are routed to.
    pub fn target_node_type(&self) -> &'static str {
        match self {
            Self::Effect => "effect_node",
            Self::Compute => "compute_node",
            Self::Reduce => "reduce_node",
            Self::Orchestrate => "orchestrator_node",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Effect => "effect",
            Self::Compute => "compute",
            Self::Reduce => "reduce",
            Self::Orchestrate => "orchestrate",
        }
    }
}

// ---------------------------------------------------------------------------
// Execution mode
// ---------------------------------------------------------------------------

/// How independent steps are scheduled relative to one another.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Strictly one step at a time in resolved topological order.
    #[default]
    Sequential,
    /// Steps with no unresolved dependency run concurrently, bounded by
    /// `max_parallel_steps`.
    Parallel,
    /// Steps are partitioned into dependency-respecting batches dispatched
    /// over a fixed worker pool.
    Batch,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Batch => "batch",
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "batch" => Ok(Self::Batch),
            other => Err(OrchestrationError::Validation(format!(
                "unknown execution mode '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow status
// ---------------------------------------------------------------------------

/// Overall status of a workflow: `Pending -> Running -> {Completed, Failed,
/// Cancelled}`. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator input / output
// ---------------------------------------------------------------------------

/// One execution request handed to `process()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorInput {
    /// Workflow identity. The nil UUID is rejected.
    pub workflow_id: Uuid,
    /// The steps to execute.
    pub steps: Vec<Step>,
    /// How to schedule independent steps.
    pub mode: ExecutionMode,
    /// Per-run bound on simultaneously executing steps (parallel mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_steps: Option<usize>,
    /// Caller metadata merged into the workflow state context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OrchestratorInput {
    /// Convenience constructor for the common case of no per-run overrides.
    pub fn new(workflow_id: Uuid, steps: Vec<Step>, mode: ExecutionMode) -> Self {
        Self {
            workflow_id,
            steps,
            mode,
            max_parallel_steps: None,
            metadata: HashMap::new(),
        }
    }
}

/// The structured result of a `process()` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorOutput {
    pub workflow_id: Uuid,
    /// Final workflow status (terminal).
    pub execution_status: WorkflowStatus,
    /// Step IDs that completed, in completion order.
    pub completed_steps: Vec<String>,
    /// Step IDs that failed after recovery was exhausted.
    pub failed_steps: Vec<String>,
    /// Step IDs skipped (disabled, condition false, or dependency failed).
    pub skipped_steps: Vec<String>,
    /// Thunk IDs emitted during this run, in emission order.
    pub actions_emitted: Vec<Uuid>,
    /// Per-run counters (`completed_count`, `failed_count`, `skipped_count`).
    pub metrics: serde_json::Value,
    /// Wall-clock duration of the run in milliseconds.
    pub processing_time_ms: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
