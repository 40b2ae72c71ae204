//! Workflow orchestration engine for Orchid.
//!
//! Takes declarative workflow submissions (steps with dependency edges),
//! resolves them into a stable execution order, emits thunks to a
//! caller-supplied executor, and tracks per-run state through to a terminal
//! status. This crate depends only on `orchid-types` for domain types --
//! the executor seam (`engine::dispatch::ThunkExecutor`) is the only
//! integration point callers implement.

pub mod config;
pub mod engine;
pub mod event;
