//! Per-mode orchestration metrics.
//!
//! Running totals for workflows processed in each execution mode, with an
//! incrementally maintained average processing time. Counters are monotonic
//! for the lifetime of the process -- nothing resets them mid-run.

use std::collections::BTreeMap;

use dashmap::DashMap;
use orchid_types::workflow::ExecutionMode;
use serde::{Deserialize, Serialize};

use crate::engine::dispatch::RouterMetrics;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// Running totals for a single execution mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeMetrics {
    pub total_workflows: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub average_processing_time_ms: f64,
}

/// Serializable view over everything the collector tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Per-mode totals keyed by mode name (`sequential`, `parallel`, `batch`).
    pub modes: BTreeMap<String, ModeMetrics>,
    /// Worker-pool statistics from the batch router.
    pub router: RouterMetrics,
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Concurrent per-mode metrics aggregation.
///
/// Each recorded run updates its mode's entry under a single `DashMap`
/// guard; the update is CPU-only so the guard is never held across an
/// await point.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    modes: DashMap<ExecutionMode, ModeMetrics>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            modes: DashMap::new(),
        }
    }

    /// Record one finished workflow run.
    ///
    /// The average is maintained incrementally (`avg += (d - avg) / n`) so
    /// no per-run history is kept.
    pub fn record(&self, mode: ExecutionMode, success: bool, duration_ms: u64) {
        let mut entry = self.modes.entry(mode).or_default();
        entry.total_workflows += 1;
        if success {
            entry.success_count += 1;
        } else {
            entry.failure_count += 1;
        }
        let n = entry.total_workflows as f64;
        entry.average_processing_time_ms +=
            (duration_ms as f64 - entry.average_processing_time_ms) / n;
    }

    /// Totals for one mode, if any run has been recorded for it.
    pub fn mode_metrics(&self, mode: ExecutionMode) -> Option<ModeMetrics> {
        self.modes.get(&mode).map(|entry| entry.value().clone())
    }

    /// Capture the current totals alongside the router's worker statistics.
    pub fn snapshot(&self, router: RouterMetrics) -> MetricsSnapshot {
        let modes = self
            .modes
            .iter()
            .map(|entry| (entry.key().as_str().to_string(), entry.value().clone()))
            .collect();
        MetricsSnapshot { modes, router }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
