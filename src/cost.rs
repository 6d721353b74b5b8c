//! Cost accountant: per-`(backend, model)` atomic token/cost counters,
//! resettable; plus a bounded recent-request log for latency metrics.
//!
//! Generalizes the teacher's `traffic.rs` (`TrafficLog`/`TrafficEntry` ring
//! buffer, including the non-blocking `try_lock`-drop-on-contention idiom)
//! into two pieces: an unbounded-lifetime [`CostLedger`] keyed by
//! provider/model (the spec requires process-lifetime resettable totals,
//! not a bounded window), and a renamed, trimmed [`RecentRequestLog`] that
//! keeps only what `/metrics` needs for a recent-activity window.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

/// USD cost per million tokens for a known `(backend, model)` pair.
#[derive(Debug, Clone, Copy)]
pub struct Price {
    pub input_usd_per_mtok: f64,
    pub output_usd_per_mtok: f64,
}

/// A small built-in price table. Unknown `(backend, model)` pairs still
/// accumulate token counts in [`CostLedger`], just at $0.00 — per spec
/// §4.10.
pub fn lookup_price(model: &str) -> Option<Price> {
    let table: &[(&str, Price)] = &[
        ("gpt-4o", Price { input_usd_per_mtok: 2.50, output_usd_per_mtok: 10.00 }),
        ("gpt-4o-mini", Price { input_usd_per_mtok: 0.15, output_usd_per_mtok: 0.60 }),
        ("gpt-4.1", Price { input_usd_per_mtok: 2.00, output_usd_per_mtok: 8.00 }),
        ("gpt-4.1-mini", Price { input_usd_per_mtok: 0.40, output_usd_per_mtok: 1.60 }),
        ("o1", Price { input_usd_per_mtok: 15.00, output_usd_per_mtok: 60.00 }),
        ("o1-mini", Price { input_usd_per_mtok: 1.10, output_usd_per_mtok: 4.40 }),
    ];
    table.iter().find(|(name, _)| *name == model).map(|(_, p)| *p)
}

#[derive(Default)]
struct Counters {
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    count: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostRecord {
    pub backend: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_usd: f64,
    pub output_usd: f64,
    pub count: u64,
}

/// Process-lifetime, resettable cost ledger. One entry per `(backend,
/// model)`; concurrent updates are atomic (no per-key lock needed).
#[derive(Default)]
pub struct CostLedger {
    entries: DashMap<(String, String), Counters>,
}

impl CostLedger {
    pub fn record(&self, backend: &str, model: &str, input_tokens: u32, output_tokens: u32) {
        let key = (backend.to_string(), model.to_string());
        let counters = self.entries.entry(key).or_default();
        counters.input_tokens.fetch_add(input_tokens as u64, Ordering::Relaxed);
        counters.output_tokens.fetch_add(output_tokens as u64, Ordering::Relaxed);
        counters.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<CostRecord> {
        self.entries
            .iter()
            .map(|entry| {
                let (backend, model) = entry.key().clone();
                let c = entry.value();
                let input_tokens = c.input_tokens.load(Ordering::Relaxed);
                let output_tokens = c.output_tokens.load(Ordering::Relaxed);
                let price = lookup_price(&model);
                let (input_usd, output_usd) = match price {
                    Some(p) => (
                        input_tokens as f64 / 1_000_000.0 * p.input_usd_per_mtok,
                        output_tokens as f64 / 1_000_000.0 * p.output_usd_per_mtok,
                    ),
                    None => (0.0, 0.0),
                };
                CostRecord {
                    backend,
                    model,
                    input_tokens,
                    output_tokens,
                    input_usd,
                    output_usd,
                    count: c.count.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    /// Zero every counter without removing entries (so `/costs` keeps
    /// reporting known `(backend, model)` pairs at zero after a reset).
    pub fn reset(&self) {
        for entry in self.entries.iter() {
            let c = entry.value();
            c.input_tokens.store(0, Ordering::Relaxed);
            c.output_tokens.store(0, Ordering::Relaxed);
            c.count.store(0, Ordering::Relaxed);
        }
    }
}

/// Fixed-capacity ring-buffer of recent requests, for `/metrics` latency
/// aggregation. Uses the teacher's non-blocking `try_lock`-and-drop push so
/// logging never delays the request path.
pub struct RecentRequestLog {
    capacity: usize,
    entries: Mutex<VecDeque<RequestLogEntry>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub tier: String,
    pub backend: String,
    pub model: String,
    pub latency_ms: u64,
    pub success: bool,
    pub error_kind: Option<String>,
}

impl RequestLogEntry {
    pub fn new(tier: String, backend: String, model: String, latency_ms: u64, success: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            tier,
            backend,
            model,
            latency_ms,
            success,
            error_kind: None,
        }
    }

    pub fn with_error_kind(mut self, kind: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self
    }
}

impl RecentRequestLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub fn push(&self, entry: RequestLogEntry) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    pub async fn recent(&self, limit: usize) -> Vec<RequestLogEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub async fn stats(&self) -> RequestLogStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total as f64
        };
        let error_count = entries.iter().filter(|e| !e.success).count();

        let mut tier_counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for entry in entries.iter() {
            *tier_counts.entry(entry.tier.clone()).or_default() += 1;
        }

        RequestLogStats { total_requests: total, error_count, avg_latency_ms, tier_counts }
    }
}

#[derive(Debug, Serialize)]
pub struct RequestLogStats {
    pub total_requests: usize,
    pub error_count: usize,
    pub avg_latency_ms: f64,
    pub tier_counts: std::collections::HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_snapshots_tokens() {
        let ledger = CostLedger::default();
        ledger.record("openai", "gpt-4o-mini", 1000, 500);
        let snap = ledger.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].input_tokens, 1000);
        assert_eq!(snap[0].output_tokens, 500);
        assert_eq!(snap[0].count, 1);
        assert!(snap[0].input_usd > 0.0);
    }

    #[test]
    fn unknown_model_contributes_tokens_but_not_cost() {
        let ledger = CostLedger::default();
        ledger.record("openai", "totally-unknown-model", 100, 100);
        let snap = ledger.snapshot();
        assert_eq!(snap[0].input_tokens, 100);
        assert_eq!(snap[0].input_usd, 0.0);
        assert_eq!(snap[0].output_usd, 0.0);
    }

    #[test]
    fn reset_zeroes_counters_but_keeps_entry() {
        let ledger = CostLedger::default();
        ledger.record("openai", "gpt-4o", 100, 100);
        ledger.reset();
        let snap = ledger.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].input_tokens, 0);
        assert_eq!(snap[0].count, 0);
    }

    #[test]
    fn accumulates_across_multiple_records() {
        let ledger = CostLedger::default();
        ledger.record("openai", "gpt-4o", 100, 50);
        ledger.record("openai", "gpt-4o", 100, 50);
        let snap = ledger.snapshot();
        assert_eq!(snap[0].input_tokens, 200);
        assert_eq!(snap[0].count, 2);
    }

    #[tokio::test]
    async fn recent_request_log_evicts_oldest_beyond_capacity() {
        let log = RecentRequestLog::new(2);
        log.push(RequestLogEntry::new("sonnet".into(), "openai".into(), "gpt-4o".into(), 1, true));
        log.push(RequestLogEntry::new("sonnet".into(), "openai".into(), "gpt-4o".into(), 2, true));
        log.push(RequestLogEntry::new("haiku".into(), "openai".into(), "gpt-4o-mini".into(), 3, true));

        let all = log.recent(10).await;
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|e| e.latency_ms == 3));
        assert!(!all.iter().any(|e| e.latency_ms == 1));
    }
}
