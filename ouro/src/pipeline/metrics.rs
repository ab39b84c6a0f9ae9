//! Per-tool execution metrics.
//!
//! Counts every pipeline outcome, including pre-execution rejections, with a
//! per-error-code breakdown and a rolling average of execution time.
//! Snapshots feed the monitoring surface.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::error::{ToolErrorCode, ToolOutcome};

#[derive(Default)]
struct ToolStats {
    total: u64,
    successes: u64,
    failures: u64,
    total_execution_ms: u128,
    errors_by_code: BTreeMap<ToolErrorCode, u64>,
}

/// Snapshot of one tool's counters.
#[derive(Clone, Debug)]
pub struct ToolStatsSnapshot {
    pub tool_name: String,
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_execution_ms: f64,
    pub errors_by_code: BTreeMap<ToolErrorCode, u64>,
}

/// Aggregate across all tools.
#[derive(Clone, Debug, Default)]
pub struct GlobalStatsSnapshot {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_execution_ms: f64,
}

/// Tracks tool call outcomes. Increment-only; snapshots are cheap copies.
#[derive(Default)]
pub struct ToolMetrics {
    per_tool: DashMap<String, Mutex<ToolStats>>,
}

impl ToolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tool: &str, outcome: &ToolOutcome) {
        let entry = self
            .per_tool
            .entry(tool.to_string())
            .or_insert_with(|| Mutex::new(ToolStats::default()));
        let mut stats = entry.lock().unwrap_or_else(|e| e.into_inner());
        stats.total += 1;
        stats.total_execution_ms += u128::from(outcome.execution_ms);
        if outcome.ok {
            stats.successes += 1;
        } else {
            stats.failures += 1;
            if let Some(code) = outcome.error_code() {
                *stats.errors_by_code.entry(code).or_insert(0) += 1;
            }
        }
    }

    pub fn snapshot(&self, tool: &str) -> Option<ToolStatsSnapshot> {
        let entry = self.per_tool.get(tool)?;
        let stats = entry.lock().unwrap_or_else(|e| e.into_inner());
        Some(snapshot_of(tool, &stats))
    }

    pub fn snapshots(&self) -> Vec<ToolStatsSnapshot> {
        self.per_tool
            .iter()
            .map(|entry| {
                let stats = entry.value().lock().unwrap_or_else(|e| e.into_inner());
                snapshot_of(entry.key(), &stats)
            })
            .collect()
    }

    pub fn global_snapshot(&self) -> GlobalStatsSnapshot {
        let mut out = GlobalStatsSnapshot::default();
        let mut total_ms: u128 = 0;
        for entry in self.per_tool.iter() {
            let stats = entry.value().lock().unwrap_or_else(|e| e.into_inner());
            out.total += stats.total;
            out.successes += stats.successes;
            out.failures += stats.failures;
            total_ms += stats.total_execution_ms;
        }
        if out.total > 0 {
            out.avg_execution_ms = total_ms as f64 / out.total as f64;
        }
        out
    }
}

fn snapshot_of(tool: &str, stats: &ToolStats) -> ToolStatsSnapshot {
    ToolStatsSnapshot {
        tool_name: tool.to_string(),
        total: stats.total,
        successes: stats.successes,
        failures: stats.failures,
        avg_execution_ms: if stats.total > 0 {
            stats.total_execution_ms as f64 / stats.total as f64
        } else {
            0.0
        },
        errors_by_code: stats.errors_by_code.clone(),
    }
}
