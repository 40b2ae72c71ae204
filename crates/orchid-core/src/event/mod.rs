//! Event distribution for the engine.
//!
//! `EventBus` fans `EngineEvent` messages out to subscribers over a
//! `tokio::sync::broadcast` channel; `WorkflowEvents` is the per-run view
//! of the same stream.

pub mod bus;

pub use bus::{EventBus, WorkflowEvents};
