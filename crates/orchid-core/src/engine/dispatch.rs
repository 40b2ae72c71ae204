//! The executor seam and the batch worker router.
//!
//! `ThunkExecutor` is the single integration point callers implement: the
//! engine emits thunks and hands them over one at a time, the executor
//! performs the underlying operation. `WorkerRouter` assigns batch-mode
//! steps to a fixed pool of workers, either cycling indices (round-robin)
//! or picking the least busy worker (least-loaded).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use orchid_types::error::OrchestrationError;
use orchid_types::thunk::{FailureSeverity, Thunk};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RouterStrategy;

// ---------------------------------------------------------------------------
// Dispatch errors
// ---------------------------------------------------------------------------

/// Failure reported by a `ThunkExecutor`.
///
/// Carries the executor's severity judgement: recoverable failures go
/// through failure recovery (retry and so on), critical failures combined
/// with `fail_fast` halt the workflow without retry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("thunk dispatch failed: {message}")]
pub struct DispatchError {
    pub message: String,
    pub severity: FailureSeverity,
}

impl DispatchError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: FailureSeverity::Recoverable,
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: FailureSeverity::Critical,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity.is_critical()
    }
}

impl From<DispatchError> for OrchestrationError {
    fn from(err: DispatchError) -> Self {
        OrchestrationError::OperationFailed(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Executor trait
// ---------------------------------------------------------------------------

/// Trait for downstream thunk executors.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods,
/// consistent with the project's Rust 2024 edition approach. The engine is
/// generic over this trait; implementations route on
/// `thunk.target_node_type` and interpret `thunk.operation_data`.
pub trait ThunkExecutor: Send + Sync {
    /// Execute a single thunk, returning its output value.
    fn execute(
        &self,
        thunk: &Thunk,
    ) -> impl std::future::Future<Output = Result<Value, DispatchError>> + Send;
}

// ---------------------------------------------------------------------------
// Worker router
// ---------------------------------------------------------------------------

/// Assigns batch-mode work to a fixed pool of worker slots.
///
/// `assign` picks a worker and counts the assignment; `release` returns the
/// slot once the work finishes. All counters are atomics, so the router is
/// shared freely across tasks.
pub struct WorkerRouter {
    strategy: RouterStrategy,
    workers: Vec<WorkerSlot>,
    next: AtomicUsize,
}

#[derive(Debug, Default)]
struct WorkerSlot {
    dispatched: AtomicU64,
    in_flight: AtomicU64,
}

impl WorkerRouter {
    /// Create a router over `worker_count` slots (clamped to at least 1).
    pub fn new(worker_count: usize, strategy: RouterStrategy) -> Self {
        let count = worker_count.max(1);
        Self {
            strategy,
            workers: (0..count).map(|_| WorkerSlot::default()).collect(),
            next: AtomicUsize::new(0),
        }
    }

    /// Pick a worker index for the next unit of work.
    pub fn assign(&self) -> usize {
        let index = match self.strategy {
            RouterStrategy::RoundRobin => {
                self.next.fetch_add(1, Ordering::SeqCst) % self.workers.len()
            }
            RouterStrategy::LeastLoaded => self.least_loaded_index(),
        };
        self.workers[index].dispatched.fetch_add(1, Ordering::SeqCst);
        self.workers[index].in_flight.fetch_add(1, Ordering::SeqCst);
        index
    }

    /// Ties resolve to the lowest index.
    fn least_loaded_index(&self) -> usize {
        let mut best = 0;
        let mut best_load = u64::MAX;
        for (index, worker) in self.workers.iter().enumerate() {
            let load = worker.in_flight.load(Ordering::SeqCst);
            if load < best_load {
                best = index;
                best_load = load;
            }
        }
        best
    }

    /// Mark one unit of the worker's assigned work finished.
    pub fn release(&self, worker: usize) {
        if let Some(slot) = self.workers.get(worker) {
            let _ = slot
                .in_flight
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn strategy(&self) -> RouterStrategy {
        self.strategy
    }

    pub fn metrics(&self) -> RouterMetrics {
        RouterMetrics {
            strategy: self.strategy.as_str().to_string(),
            workers: self
                .workers
                .iter()
                .enumerate()
                .map(|(worker, slot)| WorkerMetrics {
                    worker,
                    dispatched: slot.dispatched.load(Ordering::SeqCst),
                    in_flight: slot.in_flight.load(Ordering::SeqCst),
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for WorkerRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRouter")
            .field("strategy", &self.strategy)
            .field("workers", &self.workers.len())
            .finish()
    }
}

/// Point-in-time router counters, embedded in the engine metrics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterMetrics {
    pub strategy: String,
    pub workers: Vec<WorkerMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub worker: usize,
    pub dispatched: u64,
    pub in_flight: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_cycles_indices() {
        let router = WorkerRouter::new(3, RouterStrategy::RoundRobin);
        let picks: Vec<usize> = (0..6).map(|_| router.assign()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_least_loaded_prefers_idle_worker() {
        let router = WorkerRouter::new(3, RouterStrategy::LeastLoaded);

        // Without releases the router spreads across all workers.
        let a = router.assign();
        let b = router.assign();
        let c = router.assign();
        let mut spread = vec![a, b, c];
        spread.sort();
        assert_eq!(spread, vec![0, 1, 2]);

        // Freeing worker 1 makes it the unique least-loaded choice.
        router.release(1);
        assert_eq!(router.assign(), 1);
    }

    #[test]
    fn test_least_loaded_tie_picks_lowest_index() {
        let router = WorkerRouter::new(4, RouterStrategy::LeastLoaded);
        assert_eq!(router.assign(), 0);
    }

    #[test]
    fn test_release_saturates_at_zero() {
        let router = WorkerRouter::new(2, RouterStrategy::RoundRobin);
        router.release(0);
        router.release(0);
        let metrics = router.metrics();
        assert_eq!(metrics.workers[0].in_flight, 0);
    }

    #[test]
    fn test_release_out_of_range_is_ignored() {
        let router = WorkerRouter::new(1, RouterStrategy::RoundRobin);
        router.release(99);
    }

    #[test]
    fn test_zero_workers_clamped_to_one() {
        let router = WorkerRouter::new(0, RouterStrategy::RoundRobin);
        assert_eq!(router.worker_count(), 1);
        assert_eq!(router.assign(), 0);
    }

    #[test]
    fn test_metrics_counts() {
        let router = WorkerRouter::new(2, RouterStrategy::RoundRobin);
        router.assign(); // worker 0
        router.assign(); // worker 1
        router.assign(); // worker 0
        router.release(0);

        let metrics = router.metrics();
        assert_eq!(metrics.strategy, "round_robin");
        assert_eq!(metrics.workers[0].dispatched, 2);
        assert_eq!(metrics.workers[0].in_flight, 1);
        assert_eq!(metrics.workers[1].dispatched, 1);
        assert_eq!(metrics.workers[1].in_flight, 1);
    }

    #[test]
    fn test_dispatch_error_severity() {
        let recoverable = DispatchError::recoverable("connection reset");
        assert!(!recoverable.is_critical());

        let critical = DispatchError::critical("corrupted payload");
        assert!(critical.is_critical());
        assert!(critical.to_string().contains("corrupted payload"));
    }

    #[test]
    fn test_dispatch_error_converts_to_operation_failed() {
        let err: OrchestrationError = DispatchError::recoverable("boom").into();
        assert!(err.is_operation_failure());
        assert!(matches!(err, OrchestrationError::OperationFailed(_)));
    }
}
