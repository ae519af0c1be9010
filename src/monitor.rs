// Execution Monitor (§4.7): a rolling window of gate outcomes per leader,
// giving operational visibility into *why* trades were skipped even though
// PnL accounting itself is out of scope.
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub window_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { window_size: 200 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Executed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone)]
struct OutcomeEntry {
    outcome: GateOutcome,
    reason: Option<String>,
}

pub struct ExecutionMonitor {
    config: MonitorConfig,
    history: VecDeque<OutcomeEntry>,
}

impl ExecutionMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self { config, history: VecDeque::new() }
    }

    pub fn record(&mut self, outcome: GateOutcome, reason: Option<String>) {
        if self.history.len() >= self.config.window_size {
            self.history.pop_front();
        }
        self.history.push_back(OutcomeEntry { outcome, reason });
    }

    pub fn metrics(&self) -> ExecutionMetrics {
        let total = self.history.len();
        if total == 0 {
            return ExecutionMetrics::default();
        }

        let executed = self.history.iter().filter(|e| e.outcome == GateOutcome::Executed).count();
        let skipped = self.history.iter().filter(|e| e.outcome == GateOutcome::Skipped).count();
        let failed = self.history.iter().filter(|e| e.outcome == GateOutcome::Failed).count();

        let mut skip_reason_counts: Vec<(String, usize)> = Vec::new();
        for entry in &self.history {
            if entry.outcome != GateOutcome::Skipped {
                continue;
            }
            let reason = entry.reason.clone().unwrap_or_else(|| "unknown".to_string());
            match skip_reason_counts.iter_mut().find(|(r, _)| r == &reason) {
                Some((_, count)) => *count += 1,
                None => skip_reason_counts.push((reason, 1)),
            }
        }
        skip_reason_counts.sort_by(|a, b| b.1.cmp(&a.1));

        ExecutionMetrics {
            trade_count: total,
            execution_rate: executed as f64 / total as f64 * 100.0,
            skip_rate: skipped as f64 / total as f64 * 100.0,
            failure_rate: failed as f64 / total as f64 * 100.0,
            top_skip_reasons: skip_reason_counts.into_iter().take(5).collect(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ExecutionMetrics {
    pub trade_count: usize,
    pub execution_rate: f64,
    pub skip_rate: f64,
    pub failure_rate: f64,
    pub top_skip_reasons: Vec<(String, usize)>,
}

/// Records stuck in `executing` past their lease, surfaced rather than
/// auto-reset (spec.md §4.2, §8 scenario S6).
pub async fn stuck_records(store: &crate::store::TradeStore) -> Result<Vec<crate::model::TradeRecord>, String> {
    store.stuck_executing(chrono::Utc::now()).await.map_err(|e| e.to_string())
}

/// Records flagged for human review because filled/intended fell outside
/// the [0.80, 1.20] tolerance band (spec.md §4.5).
pub async fn needs_manual_review(store: &crate::store::TradeStore) -> Result<Vec<crate::model::TradeRecord>, String> {
    store.needs_manual_review().await.map_err(|e| e.to_string())
}
