//! Shared domain types for the Orchid orchestration engine.
//!
//! This crate contains the types that cross the engine boundary: workflow
//! definitions and step submissions, thunks, workflow state and snapshots,
//! engine events, and the orchestration error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod error;
pub mod event;
pub mod state;
pub mod thunk;
pub mod workflow;
