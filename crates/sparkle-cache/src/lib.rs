//! Response cache: exact hash lookup with an approximate similarity
//! fallback, TTL expiry, LRU eviction, per-variant partitioning.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use sha2::{Digest, Sha256};
use sparkle_core::config::CacheConfig;
use sparkle_store::{CacheRow, Store, StoreError};
use tracing::{debug, instrument};

/// A cache hit handed back to the engine.
#[derive(Debug, Clone, Serialize)]
pub struct CachedResponse {
    pub message: String,
    pub action: String,
    pub data: Option<serde_json::Value>,
    pub model: Option<String>,
    pub tokens: i64,
    pub cost_usd: f64,
    pub response_time_ms: i64,
    /// 1.0 for an exact hash hit; the Jaccard score for similarity hits.
    pub similarity: f64,
}

/// What the engine writes on a cache miss.
#[derive(Debug, Clone)]
pub struct CachePut<'a> {
    pub user_message: &'a str,
    pub variant: &'a str,
    pub response_message: &'a str,
    pub response_action: &'a str,
    pub response_data: Option<&'a serde_json::Value>,
    pub model: Option<&'a str>,
    pub tokens: i64,
    pub cost_usd: f64,
    pub response_time_ms: i64,
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: i64,
    pub hits: u64,
    pub similarity_hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub estimated_saved_usd: f64,
}

/// Store-backed response cache with in-process counters.
pub struct ResponseCache {
    config: CacheConfig,
    store: Arc<Store>,
    hits: AtomicU64,
    similarity_hits: AtomicU64,
    misses: AtomicU64,
    saved_usd: Mutex<f64>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig, store: Arc<Store>) -> Self {
        Self {
            config,
            store,
            hits: AtomicU64::new(0),
            similarity_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            saved_usd: Mutex::new(0.0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Exact lookup first; on miss, Jaccard similarity over stemmed token
    /// sets against recent same-variant entries.
    #[instrument(skip(self, user_message))]
    pub fn lookup(
        &self,
        user_message: &str,
        variant: &str,
    ) -> Result<Option<CachedResponse>, StoreError> {
        if !self.config.enabled {
            return Ok(None);
        }

        let key = cache_key(user_message, variant);
        if let Some(row) = self.store.get_cache_entry(&key)? {
            self.store.touch_cache_entry(&key)?;
            self.record_hit(&row, false);
            return Ok(Some(to_response(row, 1.0)));
        }

        let query_tokens = stemmed_tokens(user_message);
        if query_tokens.is_empty() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let candidates = self
            .store
            .recent_cache_entries(variant, self.config.similarity_scan_limit)?;
        let mut best: Option<(f64, CacheRow)> = None;
        for row in candidates {
            let score = jaccard(&query_tokens, &stemmed_tokens(&row.user_message));
            if score >= self.config.similarity_threshold
                && best.as_ref().map_or(true, |(b, _)| score > *b)
            {
                best = Some((score, row));
            }
        }

        if let Some((score, row)) = best {
            self.store.touch_cache_entry(&row.message_hash)?;
            self.record_hit(&row, true);
            debug!(similarity = score, "approximate cache hit");
            return Ok(Some(to_response(row, score)));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    /// Write a fresh entry; evicts the LRU tail when the cache is full.
    #[instrument(skip(self, put), fields(variant = put.variant))]
    pub fn put(&self, put: &CachePut<'_>) -> Result<(), StoreError> {
        if !self.config.enabled {
            return Ok(());
        }

        let count = self.store.cache_count()?;
        if count as usize >= self.config.max_entries {
            let evict = ((self.config.max_entries as f64 * self.config.evict_fraction).ceil()
                as usize)
                .max(1);
            let removed = self.store.evict_lru_cache(evict)?;
            debug!(removed, "LRU eviction");
        }

        let now = chrono::Utc::now();
        let row = CacheRow {
            message_hash: cache_key(put.user_message, put.variant),
            user_message: put.user_message.to_string(),
            variant: put.variant.to_string(),
            response_message: put.response_message.to_string(),
            response_action: put.response_action.to_string(),
            response_data: put
                .response_data
                .map(|v| v.to_string()),
            model: put.model.map(String::from),
            tokens: put.tokens,
            cost_usd: put.cost_usd,
            response_time_ms: put.response_time_ms,
            expires_at: (now + chrono::Duration::seconds(self.config.ttl_secs)).to_rfc3339(),
            hit_count: 0,
            created_at: now.to_rfc3339(),
            last_accessed: now.to_rfc3339(),
        };
        self.store.upsert_cache_entry(&row)
    }

    /// Drop expired rows. Driven by the gateway's periodic sweeper task.
    pub fn sweep(&self) -> Result<usize, StoreError> {
        self.store.delete_expired_cache()
    }

    pub fn clear(&self, variant: Option<&str>) -> Result<usize, StoreError> {
        self.store.clear_cache(variant)
    }

    pub fn stats(&self) -> Result<CacheStats, StoreError> {
        let hits = self.hits.load(Ordering::Relaxed);
        let similarity_hits = self.similarity_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + similarity_hits + misses;
        Ok(CacheStats {
            enabled: self.config.enabled,
            entries: self.store.cache_count()?,
            hits,
            similarity_hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                (hits + similarity_hits) as f64 / total as f64
            },
            estimated_saved_usd: *self.saved_usd.lock().unwrap(),
        })
    }

    fn record_hit(&self, row: &CacheRow, similarity: bool) {
        if similarity {
            self.similarity_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        *self.saved_usd.lock().unwrap() += row.cost_usd;
    }
}

fn to_response(row: CacheRow, similarity: f64) -> CachedResponse {
    CachedResponse {
        message: row.response_message,
        action: row.response_action,
        data: row
            .response_data
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok()),
        model: row.model,
        tokens: row.tokens,
        cost_usd: row.cost_usd,
        response_time_ms: row.response_time_ms,
        similarity,
    }
}

/// Lowercase, trim, collapse internal whitespace.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// SHA-256 of `normalize(message) \x1e variant`, hex-encoded.
pub fn cache_key(user_message: &str, variant: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(user_message).as_bytes());
    hasher.update([0x1e]);
    hasher.update(variant.as_bytes());
    hex::encode(hasher.finalize())
}

/// Tokenize and lightly stem: lowercase words with common English suffixes
/// stripped (plural s/es, ed, ing, ly).
fn stemmed_tokens(text: &str) -> HashSet<String> {
    normalize(text)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(stem)
        .collect()
}

fn stem(word: &str) -> String {
    let w = word;
    for suffix in ["ing", "ed", "es", "ly", "s"] {
        if let Some(stripped) = w.strip_suffix(suffix) {
            if stripped.len() >= 3 {
                return stripped.to_string();
            }
        }
    }
    w.to_string()
}

/// Jaccard similarity between two token sets.
fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ResponseCache {
        ResponseCache::new(
            CacheConfig::default(),
            Arc::new(Store::open_in_memory().unwrap()),
        )
    }

    fn put(cache: &ResponseCache, message: &str, variant: &str) {
        cache
            .put(&CachePut {
                user_message: message,
                variant,
                response_message: "Happy to help with that!",
                response_action: "collect_info",
                response_data: None,
                model: Some("fast"),
                tokens: 40,
                cost_usd: 0.0002,
                response_time_ms: 150,
            })
            .unwrap();
    }

    #[test]
    fn exact_hit_after_normalization() {
        let c = cache();
        put(&c, "I need a Deep Clean  next monday", "baseline");
        let hit = c
            .lookup("i need a deep clean next MONDAY", "baseline")
            .unwrap()
            .unwrap();
        assert_eq!(hit.similarity, 1.0);
        assert_eq!(hit.action, "collect_info");
    }

    #[test]
    fn variants_are_partitioned() {
        let c = cache();
        put(&c, "book a cleaning", "baseline");
        assert!(c.lookup("book a cleaning", "professional").unwrap().is_none());
    }

    #[test]
    fn similarity_boundary_085_hits_0849_misses() {
        let c = cache();
        // 20 distinct tokens cached; a query sharing 17 of them plus 0 new
        // tokens gives J = 17/20 = 0.85 exactly.
        let words: Vec<String> = (0..20).map(|i| format!("tok{i}word")).collect();
        let cached = words.join(" ");
        put(&c, &cached, "baseline");

        let query_hit = words[..17].join(" ");
        let hit = c.lookup(&query_hit, "baseline").unwrap();
        assert!(hit.is_some(), "J = 0.85 must hit");
        assert!((hit.unwrap().similarity - 0.85).abs() < 1e-9);

        let query_miss = words[..16].join(" ");
        // J = 16/20 = 0.80 < 0.85.
        assert!(c.lookup(&query_miss, "baseline").unwrap().is_none());
    }

    #[test]
    fn stemming_bridges_inflections() {
        let c = cache();
        put(&c, "need deep cleaning for bedrooms", "baseline");
        let hit = c.lookup("need deep clean for bedroom", "baseline").unwrap();
        assert!(hit.is_some());
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let c = cache();
        put(&c, "hello there", "baseline");
        let _ = c.lookup("hello there", "baseline").unwrap();
        let _ = c.lookup("completely unrelated query text", "baseline").unwrap();
        let stats = c.stats().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
        assert!(stats.estimated_saved_usd > 0.0);
    }

    #[test]
    fn disabled_cache_is_inert() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let c = ResponseCache::new(config, Arc::new(Store::open_in_memory().unwrap()));
        put(&c, "hello", "baseline");
        assert!(c.lookup("hello", "baseline").unwrap().is_none());
    }
}
