//! Token-usage accounting for VLM calls.
//!
//! Every vision call produces one [`TokenUsage`] record; the
//! [`TokenUsageAggregator`] is the single cross-task shared mutable object
//! in the pipeline. Appends are serialised behind a mutex so worker-pool
//! tasks can `track` concurrently, and readers always observe a
//! monotonically growing list. `on_token_usage` callbacks receive a
//! [`TokenUsageReport`] *snapshot*, grouping records by component so a
//! progress UI can show "sampler: 3k, page processor: 118k" without holding
//! the lock.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Whether a call was answered by the primary model or the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    Primary,
    Fallback,
}

/// Token accounting for a single vision call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Pipeline component that made the call, e.g. `"vlm-page-processor"`.
    pub component: String,
    /// Call phase within the component, e.g. `"page-analysis-retry"`.
    pub phase: String,
    /// Which model answered.
    pub model: ModelRole,
    /// Concrete model identifier reported by the vision primitive.
    pub model_name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Per-component sums in a [`TokenUsageReport`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentUsage {
    pub component: String,
    pub calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Grand totals across every component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Snapshot of all usage so far, grouped by component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageReport {
    pub components: Vec<ComponentUsage>,
    pub total: UsageTotals,
}

/// Thread-safe collector of [`TokenUsage`] records.
///
/// Passed by argument, never module-level. Cloning shares the underlying
/// record list.
#[derive(Debug, Clone, Default)]
pub struct TokenUsageAggregator {
    records: Arc<Mutex<Vec<TokenUsage>>>,
}

impl TokenUsageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record. Safe to call from concurrent worker-pool tasks.
    pub fn track(&self, usage: TokenUsage) {
        self.records
            .lock()
            .expect("usage aggregator lock poisoned")
            .push(usage);
    }

    /// Number of records tracked so far.
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .expect("usage aggregator lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone out the raw record list.
    pub fn records(&self) -> Vec<TokenUsage> {
        self.records
            .lock()
            .expect("usage aggregator lock poisoned")
            .clone()
    }

    /// Build a grouped snapshot report.
    ///
    /// Components appear in first-seen order.
    pub fn report(&self) -> TokenUsageReport {
        let records = self.records();
        let mut components: Vec<ComponentUsage> = Vec::new();
        let mut total = UsageTotals::default();

        for record in &records {
            total.input_tokens += record.input_tokens;
            total.output_tokens += record.output_tokens;
            total.total_tokens += record.total_tokens;

            match components
                .iter_mut()
                .find(|c| c.component == record.component)
            {
                Some(entry) => {
                    entry.calls += 1;
                    entry.input_tokens += record.input_tokens;
                    entry.output_tokens += record.output_tokens;
                    entry.total_tokens += record.total_tokens;
                }
                None => components.push(ComponentUsage {
                    component: record.component.clone(),
                    calls: 1,
                    input_tokens: record.input_tokens,
                    output_tokens: record.output_tokens,
                    total_tokens: record.total_tokens,
                }),
            }
        }

        TokenUsageReport { components, total }
    }
}
