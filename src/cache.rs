//! Response Cache
//!
//! Fingerprint-keyed cache of completed answers. A repeat of a question that
//! just succeeded is served from memory without touching any node.
//! Failures are never cached.

use crate::classifier::Tier;
use crate::upstream::Usage;
use moka::future::Cache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const FIELD_SEPARATOR: [u8; 1] = [0x1f];

/// Deterministic request key
///
/// `SHA256(context_id.trim() ␟ normalize(question) ␟ tier)`. Normalization
/// trims, lower-cases and collapses every whitespace run to a single space.
/// The context id is opaque: callers that want history to matter must fold
/// it into the id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(context_id: &str, question: &str, tier: Tier) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(context_id.trim().as_bytes());
        hasher.update(FIELD_SEPARATOR);
        hasher.update(Self::normalize(question).as_bytes());
        hasher.update(FIELD_SEPARATOR);
        hasher.update(tier.as_str().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    fn normalize(question: &str) -> String {
        question
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 hex chars, for logs
    pub fn short(&self) -> &str {
        &self.0[..16]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            max_entries: 1_000,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
}

/// Fully assembled answer of a successful computation
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAnswer {
    pub answer: String,
    pub usage: Usage,
    pub cost_usd: f64,
    pub node: String,
}

/// TTL response cache
#[derive(Clone)]
pub struct ResponseCache {
    cache: Cache<Fingerprint, CachedAnswer>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.ttl)
            .build();

        Self {
            cache,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            enabled: config.enabled,
        }
    }

    pub async fn get(&self, key: &Fingerprint) -> Option<CachedAnswer> {
        if !self.enabled {
            return None;
        }

        if let Some(answer) = self.cache.get(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache HIT: {}", key.short());
            Some(answer)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Cache MISS: {}", key.short());
            None
        }
    }

    pub async fn set(&self, key: &Fingerprint, answer: CachedAnswer) {
        if !self.enabled {
            return;
        }

        self.cache.insert(key.clone(), answer).await;
        debug!("Cache SET: {}", key.short());
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            entries: self.cache.entry_count(),
            hits,
            misses,
            hit_rate_percent: if total > 0 {
                (hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer() -> CachedAnswer {
        CachedAnswer {
            answer: "42".to_string(),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 2,
            },
            cost_usd: 0.001,
            node: "alpha".to_string(),
        }
    }

    #[tokio::test]
    async fn test_cache_hit_miss() {
        let cache = ResponseCache::new(&CacheConfig::default());
        let key = Fingerprint::compute("ctx", "what is the answer?", Tier::Simple);

        assert!(cache.get(&key).await.is_none());

        cache.set(&key, answer()).await;

        let hit = cache.get(&key).await;
        assert_eq!(hit.map(|a| a.answer), Some("42".to_string()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_never_hits() {
        let cache = ResponseCache::new(&CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        let key = Fingerprint::compute("ctx", "q", Tier::Simple);

        cache.set(&key, answer()).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[test]
    fn test_fingerprint_normalization() {
        let a = Fingerprint::compute("ctx", "Hello   World", Tier::Simple);
        let b = Fingerprint::compute(" ctx ", "  hello\n\tworld ", Tier::Simple);

        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_varies_with_inputs() {
        let base = Fingerprint::compute("ctx", "hello", Tier::Simple);

        assert_ne!(base, Fingerprint::compute("other", "hello", Tier::Simple));
        assert_ne!(base, Fingerprint::compute("ctx", "hello!", Tier::Simple));
        assert_ne!(base, Fingerprint::compute("ctx", "hello", Tier::Long));
    }

    #[test]
    fn test_fingerprint_fields_do_not_bleed() {
        let a = Fingerprint::compute("ab", "c", Tier::Simple);
        let b = Fingerprint::compute("a", "bc", Tier::Simple);
        assert_ne!(a, b);
    }
}
