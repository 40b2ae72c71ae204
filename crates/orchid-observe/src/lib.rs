//! Observability setup for the Orchid engine.
//!
//! Hosts tracing subscriber initialization so embedding binaries configure
//! logging one way. Engine crates only emit `tracing` events; nothing in
//! `orchid-core` installs a subscriber.

pub mod tracing_setup;
