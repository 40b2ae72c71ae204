//! Condition function registry for gating step execution.
//!
//! A condition is a pure, synchronous predicate over the step about to run
//! and the outcomes recorded so far in the run. Steps name conditions by
//! string; unnamed steps use the `always_true` built-in. The registry is
//! backed by `DashMap`, and evaluation clones the `Arc` immediately so no
//! guard is held while the predicate runs.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use orchid_types::error::OrchestrationError;
use orchid_types::state::StepOutcome;
use orchid_types::workflow::Step;

/// Condition evaluated when a step does not name one.
pub const DEFAULT_CONDITION: &str = "always_true";

/// A registered condition predicate.
///
/// Receives the step under consideration and the outcomes of previously
/// finished steps, in run order. Must not block or mutate shared state.
pub type ConditionFn = Arc<dyn Fn(&Step, &[StepOutcome]) -> bool + Send + Sync>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    /// A condition with this name already exists (built-ins included).
    #[error("condition '{0}' is already registered")]
    DuplicateName(String),

    /// A step referenced a condition nobody registered.
    #[error("unknown condition '{0}'")]
    UnknownCondition(String),
}

impl From<ConditionError> for OrchestrationError {
    fn from(err: ConditionError) -> Self {
        OrchestrationError::Validation(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Named condition functions, pre-seeded with the built-ins.
///
/// Built-ins:
/// - `always_true` -- unconditional execution (the default).
/// - `always_false` -- never execute (the step is skipped).
/// - `has_previous_results` -- at least one prior outcome produced output.
/// - `previous_step_success` -- the most recent outcome completed.
pub struct ConditionRegistry {
    conditions: DashMap<String, ConditionFn>,
}

impl ConditionRegistry {
    pub fn new() -> Self {
        let registry = Self {
            conditions: DashMap::new(),
        };
        registry.install_builtin(DEFAULT_CONDITION, Arc::new(|_, _| true));
        registry.install_builtin("always_false", Arc::new(|_, _| false));
        registry.install_builtin(
            "has_previous_results",
            Arc::new(|_, previous: &[StepOutcome]| {
                previous.iter().any(|outcome| outcome.output.is_some())
            }),
        );
        registry.install_builtin(
            "previous_step_success",
            Arc::new(|_, previous: &[StepOutcome]| {
                previous.last().is_some_and(StepOutcome::is_completed)
            }),
        );
        registry
    }

    fn install_builtin(&self, name: &str, condition: ConditionFn) {
        self.conditions.insert(name.to_string(), condition);
    }

    /// Register a caller-supplied condition.
    ///
    /// Names are first-come-first-served; registering over an existing name
    /// (built-ins included) is rejected rather than silently overwriting.
    pub fn register(&self, name: &str, condition: ConditionFn) -> Result<(), ConditionError> {
        match self.conditions.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ConditionError::DuplicateName(name.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(condition);
                Ok(())
            }
        }
    }

    /// Evaluate the named condition against a step and the prior outcomes.
    pub fn evaluate(
        &self,
        name: &str,
        step: &Step,
        previous: &[StepOutcome],
    ) -> Result<bool, ConditionError> {
        let condition = self
            .conditions
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ConditionError::UnknownCondition(name.to_string()))?;
        Ok(condition(step, previous))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.conditions.contains_key(name)
    }

    /// All registered condition names, sorted for stable introspection.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.conditions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for ConditionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConditionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionRegistry")
            .field("count", &self.conditions.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use orchid_types::state::SkipReason;
    use orchid_types::workflow::StepType;
    use serde_json::json;

    fn sample_step(id: &str) -> Step {
        Step {
            step_id: id.to_string(),
            step_name: id.to_string(),
            step_type: StepType::Compute,
            depends_on: vec![],
            enabled: true,
            timeout_ms: None,
            condition: None,
            payload: json!(null),
        }
    }

    #[test]
    fn test_builtins_present() {
        let registry = ConditionRegistry::new();
        for name in [
            "always_true",
            "always_false",
            "has_previous_results",
            "previous_step_success",
        ] {
            assert!(registry.contains(name), "missing built-in '{name}'");
        }
    }

    #[test]
    fn test_always_true_and_false() {
        let registry = ConditionRegistry::new();
        let step = sample_step("a");
        assert!(registry.evaluate("always_true", &step, &[]).unwrap());
        assert!(!registry.evaluate("always_false", &step, &[]).unwrap());
    }

    #[test]
    fn test_has_previous_results() {
        let registry = ConditionRegistry::new();
        let step = sample_step("b");

        assert!(!registry.evaluate("has_previous_results", &step, &[]).unwrap());

        // A skipped outcome carries no output, so it does not count.
        let skipped = vec![StepOutcome::skipped("a", SkipReason::Disabled)];
        assert!(!registry.evaluate("has_previous_results", &step, &skipped).unwrap());

        let with_output = vec![StepOutcome::completed("a", json!({"rows": 3}), 10, 1)];
        assert!(registry
            .evaluate("has_previous_results", &step, &with_output)
            .unwrap());
    }

    #[test]
    fn test_previous_step_success() {
        let registry = ConditionRegistry::new();
        let step = sample_step("c");

        assert!(!registry.evaluate("previous_step_success", &step, &[]).unwrap());

        let after_success = vec![StepOutcome::completed("a", json!(null), 1, 1)];
        assert!(registry
            .evaluate("previous_step_success", &step, &after_success)
            .unwrap());

        let after_failure = vec![
            StepOutcome::completed("a", json!(null), 1, 1),
            StepOutcome::failed("b", "boom".to_string(), 1, 1),
        ];
        assert!(!registry
            .evaluate("previous_step_success", &step, &after_failure)
            .unwrap());
    }

    #[test]
    fn test_register_custom_condition() {
        let registry = ConditionRegistry::new();
        registry
            .register(
                "payload_has_source",
                Arc::new(|step: &Step, _| step.payload.get("source").is_some()),
            )
            .unwrap();

        let mut step = sample_step("a");
        step.payload = json!({"source": "api"});
        assert!(registry.evaluate("payload_has_source", &step, &[]).unwrap());

        step.payload = json!({});
        assert!(!registry.evaluate("payload_has_source", &step, &[]).unwrap());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ConditionRegistry::new();
        registry.register("mine", Arc::new(|_, _| true)).unwrap();

        let err = registry.register("mine", Arc::new(|_, _| false)).unwrap_err();
        assert!(err.to_string().contains("already registered"));

        // The original predicate survives.
        assert!(registry.evaluate("mine", &sample_step("a"), &[]).unwrap());
    }

    #[test]
    fn test_builtin_cannot_be_overwritten() {
        let registry = ConditionRegistry::new();
        let err = registry
            .register("always_true", Arc::new(|_, _| false))
            .unwrap_err();
        assert!(matches!(err, ConditionError::DuplicateName(_)));
    }

    #[test]
    fn test_unknown_condition_errors() {
        let registry = ConditionRegistry::new();
        let err = registry
            .evaluate("no_such_condition", &sample_step("a"), &[])
            .unwrap_err();
        assert!(err.to_string().contains("unknown condition"));

        let orchestration: OrchestrationError = err.into();
        assert!(orchestration.is_validation());
    }

    #[test]
    fn test_names_sorted() {
        let registry = ConditionRegistry::new();
        registry.register("aaa_first", Arc::new(|_, _| true)).unwrap();
        let names = registry.names();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"aaa_first".to_string()));
    }
}
