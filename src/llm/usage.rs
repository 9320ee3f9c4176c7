//! Token and cost accounting per model.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

/// Accumulated usage for one model (or one call).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageCounter {
    pub prompt_tokens: u64,
    pub cached_tokens: u64,
    pub completion_tokens: u64,
    /// Cost in USD
    pub cost: f64,
    pub calls: u64,
}

impl UsageCounter {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            ..Self::default()
        }
    }

    pub fn with_cached(mut self, cached_tokens: u64) -> Self {
        self.cached_tokens = cached_tokens;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fold one call's usage into this counter.
    fn absorb(&mut self, delta: &UsageCounter) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(delta.prompt_tokens);
        self.cached_tokens = self.cached_tokens.saturating_add(delta.cached_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(delta.completion_tokens);
        self.cost += delta.cost;
        self.calls += 1;
    }
}

impl std::fmt::Display for UsageCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tokens = (prompt {}, cached {}, completion {}), Cost={:.6}, Calls={}",
            self.prompt_tokens, self.cached_tokens, self.completion_tokens, self.cost, self.calls
        )
    }
}

/// Process-wide usage, keyed by model id.
///
/// Shared through an `Arc` held by the task context; counters are created
/// on first use.
#[derive(Debug, Default)]
pub struct UsageLedger {
    counters: Mutex<HashMap<String, UsageCounter>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, UsageCounter>> {
        // A panic while holding the lock cannot leave a counter half-updated.
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record one successful call.
    pub fn record(&self, model: &str, delta: &UsageCounter) {
        let mut counters = self.lock();
        let counter = counters.entry(model.to_string()).or_default();
        counter.absorb(delta);
        tracing::debug!(model = %model, usage = %counter, "Recorded usage");
    }

    /// Snapshot of one model's counter.
    pub fn get(&self, model: &str) -> Option<UsageCounter> {
        self.lock().get(model).cloned()
    }

    pub fn reset(&self, model: &str) {
        if let Some(counter) = self.lock().get_mut(model) {
            counter.reset();
        }
    }

    pub fn reset_all(&self) {
        self.lock().values_mut().for_each(UsageCounter::reset);
    }

    /// One line per model, sorted by model id.
    pub fn summary(&self) -> String {
        let counters = self.lock();
        let mut models: Vec<_> = counters.iter().collect();
        models.sort_by(|a, b| a.0.cmp(b.0));
        models
            .into_iter()
            .map(|(model, counter)| format!("{}: {}", model, counter))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Total tokens and total cost across all models.
    pub fn totals(&self) -> (u64, f64) {
        self.lock()
            .values()
            .fold((0, 0.0), |(tokens, cost), c| (tokens + c.total_tokens(), cost + c.cost))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_usage_accumulates_per_model() {
        let ledger = UsageLedger::new();
        ledger.record("m", &UsageCounter::new(100, 50));
        ledger.record("m", &UsageCounter::new(20, 10));

        let c = ledger.get("m").unwrap();
        assert_eq!(c.prompt_tokens, 120);
        assert_eq!(c.completion_tokens, 60);
        assert_eq!(c.calls, 2);
        assert_eq!(c.total_tokens(), 180);
    }

    #[test]
    fn test_reset_and_totals() {
        let ledger = UsageLedger::new();
        ledger.record("a", &UsageCounter::new(10, 5).with_cost(0.5));
        ledger.record("b", &UsageCounter::new(1, 1).with_cached(1).with_cost(0.25));

        assert_eq!(ledger.totals(), (17, 0.75));

        ledger.reset("a");
        assert_eq!(ledger.get("a").unwrap(), UsageCounter::default());
        assert_eq!(ledger.totals(), (2, 0.25));

        ledger.reset_all();
        assert_eq!(ledger.totals(), (0, 0.0));
        assert!(ledger.get("missing").is_none());
    }

    #[test]
    fn test_summary_lines() {
        let ledger = UsageLedger::new();
        ledger.record("z-model", &UsageCounter::new(3, 4));
        ledger.record("a-model", &UsageCounter::new(1, 2).with_cached(1));
        let summary = ledger.summary();
        let lines: Vec<_> = summary.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("a-model: Tokens = (prompt 1, cached 1, completion 2)"));
        assert!(lines[1].ends_with("Calls=1"));
    }

    #[test]
    fn test_concurrent_records() {
        let ledger = Arc::new(UsageLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        ledger.record("m", &UsageCounter::new(1, 1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ledger.get("m").unwrap().calls, 800);
    }
}
