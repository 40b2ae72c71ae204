//! Orchestration engine core: graph resolution, thunk emission, and the
//! mode-aware scheduler.
//!
//! Module map:
//! - `graph` -- stable topological ordering, cycle detection, batch
//!   partitioning
//! - `conditions` -- named predicate registry gating step execution
//! - `emitter` -- per-workflow thunk ledger with dependency validation
//! - `state` -- concurrent per-workflow run state, snapshot/restore/export
//! - `dispatch` -- the `ThunkExecutor` seam and the batch worker router
//! - `retry` -- failure recovery policy evaluation
//! - `metrics` -- per-mode counters and the metrics snapshot
//! - `scheduler` -- `Orchestrator`: sequential/parallel/batch drivers
//! - `lifecycle` -- `LifecycleManager`: startup, health monitor, graceful
//!   shutdown

pub mod conditions;
pub mod dispatch;
pub mod emitter;
pub mod graph;
pub mod lifecycle;
pub mod metrics;
pub mod retry;
pub mod scheduler;
pub mod state;

pub use dispatch::ThunkExecutor;
pub use lifecycle::LifecycleManager;
pub use scheduler::Orchestrator;
