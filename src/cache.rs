//! Response cache: SHA-256 fingerprint over `(backend, model, canonicalized
//! request body)`, LRU+TTL via `moka`, single-flight coalescing of
//! concurrent identical misses.
//!
//! No teacher analog exists for this module — grounded in the moka/mini-moka
//! crate choice attested by `grafbase-nexus` and `dimetron-agentgateway`'s
//! `Cargo.toml` files. The full async `moka::future::Cache` (rather than
//! `mini-moka`) is used because single-flight coalescing needs `get_with`'s
//! shared-future semantics.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::CacheConfig;

#[derive(Clone)]
pub struct CacheEntry {
    pub body: Arc<Value>,
    pub content_type: &'static str,
}

pub struct ResponseCache {
    inner: Option<moka::future::Cache<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(cfg: &CacheConfig) -> Self {
        let inner = cfg.enabled.then(|| {
            moka::future::Cache::builder()
                .max_capacity(cfg.max_size)
                .time_to_live(Duration::from_secs(cfg.ttl_secs))
                .build()
        });
        Self { inner }
    }

    pub fn enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Compute the cache fingerprint for a routed, non-streaming request.
    ///
    /// Canonicalizes the JSON body by sorting object keys and dropping
    /// `stream` (always false here, but harmless to strip explicitly) before
    /// hashing, so semantically-identical bodies with different key order
    /// hash identically. Tool definitions are hashed verbatim — DESIGN.md
    /// Open Question (b).
    pub fn fingerprint(backend: &str, model: &str, body: &Value) -> String {
        let mut canonical = body.clone();
        if let Value::Object(map) = &mut canonical {
            map.remove("stream");
        }
        let canonical_string = canonicalize(&canonical);

        let mut hasher = Sha256::new();
        hasher.update(backend.as_bytes());
        hasher.update([0u8]);
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_string.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Fetch-or-compute with single-flight coalescing: concurrent callers
    /// with the same fingerprint share one `init` future.
    pub async fn get_or_insert_with<F, Fut>(&self, fingerprint: &str, init: F) -> anyhow::Result<CacheEntry>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<CacheEntry>>,
    {
        let Some(cache) = &self.inner else {
            return init().await;
        };

        // moka's get_with only accepts an infallible future; fallible inits
        // are modeled by caching a sentinel and never letting failures persist.
        let entry = cache
            .get_with(fingerprint.to_string(), async {
                match init().await {
                    Ok(entry) => entry,
                    Err(_) => CacheEntry { body: Arc::new(Value::Null), content_type: "application/json" },
                }
            })
            .await;

        if entry.body.is_null() {
            cache.invalidate(fingerprint).await;
            anyhow::bail!("upstream call failed during cache population");
        }
        Ok(entry)
    }
}

fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> =
                keys.into_iter().map(|k| format!("{}:{}", k, canonicalize(&map[k]))).collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_stable_across_key_order() {
        let a = json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]});
        let b = json!({"messages": [{"role": "user", "content": "hi"}], "model": "gpt-4o"});
        assert_eq!(
            ResponseCache::fingerprint("openai", "gpt-4o", &a),
            ResponseCache::fingerprint("openai", "gpt-4o", &b)
        );
    }

    #[test]
    fn fingerprint_ignores_stream_field() {
        let a = json!({"model": "gpt-4o", "stream": true});
        let b = json!({"model": "gpt-4o", "stream": false});
        assert_eq!(
            ResponseCache::fingerprint("openai", "gpt-4o", &a),
            ResponseCache::fingerprint("openai", "gpt-4o", &b)
        );
    }

    #[test]
    fn fingerprint_differs_across_backend() {
        let a = json!({"model": "gpt-4o"});
        assert_ne!(
            ResponseCache::fingerprint("openai", "gpt-4o", &a),
            ResponseCache::fingerprint("azure", "gpt-4o", &a)
        );
    }

    #[tokio::test]
    async fn disabled_cache_always_calls_init() {
        let cache = ResponseCache::new(&CacheConfig { enabled: false, max_size: 10, ttl_secs: 10 });
        let calls = std::sync::atomic::AtomicU32::new(0);
        for _ in 0..3 {
            let _ = cache
                .get_or_insert_with("fp", || async {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(CacheEntry { body: Arc::new(json!({"ok": true})), content_type: "application/json" })
                })
                .await;
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn enabled_cache_reuses_entry_on_second_call() {
        let cache = ResponseCache::new(&CacheConfig { enabled: true, max_size: 10, ttl_secs: 60 });
        let calls = std::sync::atomic::AtomicU32::new(0);
        for _ in 0..3 {
            let _ = cache
                .get_or_insert_with("fp", || async {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(CacheEntry { body: Arc::new(json!({"ok": true})), content_type: "application/json" })
                })
                .await;
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
