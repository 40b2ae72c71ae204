//! Failure recovery policy evaluation.
//!
//! Decides what happens after a step attempt fails. Stateless: the decision
//! is a pure function of the workflow's coordination rules, the failure's
//! severity, and how many attempts the step has made. How a `Halt` decision
//! plays out depends on the execution mode -- sequential stops scheduling
//! the remaining steps, parallel and batch prune the failed step's
//! dependent path while independent paths keep running.

use orchid_types::thunk::FailureSeverity;
use orchid_types::workflow::{CoordinationRules, FailureRecoveryStrategy};

// ---------------------------------------------------------------------------
// RecoveryDecision
// ---------------------------------------------------------------------------

/// The scheduler's next move after a failed step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Dispatch another attempt as a fresh thunk with `retry_count + 1`.
    Retry,
    /// Record the failure; the mode driver stops scheduling from here.
    Halt,
    /// Record the failure and keep executing the remaining steps.
    Continue,
}

impl RecoveryDecision {
    pub fn will_retry(&self) -> bool {
        matches!(self, Self::Retry)
    }
}

// ---------------------------------------------------------------------------
// RecoveryPolicy
// ---------------------------------------------------------------------------

/// Stateless recovery policy evaluator.
///
/// No internal state; all logic is in associated functions that take
/// configuration as parameters.
pub struct RecoveryPolicy;

impl RecoveryPolicy {
    /// Decide what happens after a failed attempt.
    ///
    /// `attempt` is 1-based: the first execution is attempt 1. Rules, in
    /// precedence order:
    /// - A critical failure with `fail_fast` set halts immediately and is
    ///   never retried.
    /// - `Retry { max_attempts }` retries while `attempt < max_attempts`,
    ///   then halts ("retry then propagate").
    /// - `Abort` halts on the first failure.
    /// - `Continue` records the failure and proceeds.
    pub fn decide(
        rules: &CoordinationRules,
        severity: FailureSeverity,
        attempt: u32,
    ) -> RecoveryDecision {
        if rules.fail_fast && severity.is_critical() {
            return RecoveryDecision::Halt;
        }

        match rules.failure_recovery_strategy {
            FailureRecoveryStrategy::Retry { max_attempts } => {
                if attempt < max_attempts {
                    RecoveryDecision::Retry
                } else {
                    RecoveryDecision::Halt
                }
            }
            FailureRecoveryStrategy::Abort => RecoveryDecision::Halt,
            FailureRecoveryStrategy::Continue => RecoveryDecision::Continue,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
