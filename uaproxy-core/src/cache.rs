//! Destination classification cache
//!
//! Remembers `host:port` destinations whose traffic should be relayed
//! without sniffing: ones that turned out not to speak HTTP, and ones a
//! rule or the User-Agent whitelist asked to exempt. Entries expire after a
//! TTL so a destination that later starts serving HTTP gets sniffed again.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uaproxy_config::CacheConfig;

use prometheus::{IntCounter, IntGauge, Registry};

/// Metrics for the destination cache
struct CacheMetrics {
    hits: IntCounter,
    misses: IntCounter,
    evictions: IntCounter,
    size: IntGauge,
}

impl CacheMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let hits = IntCounter::new(
            "uaproxy_cache_hits_total",
            "Connections relayed raw because the destination was cached",
        )?;
        let misses = IntCounter::new(
            "uaproxy_cache_misses_total",
            "Connections whose destination had to be sniffed",
        )?;
        let evictions = IntCounter::new(
            "uaproxy_cache_evictions_total",
            "Cache entries removed by expiry or capacity",
        )?;
        let size = IntGauge::new("uaproxy_cache_size", "Current number of cached destinations")?;

        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(misses.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(size.clone()))?;

        Ok(Self {
            hits,
            misses,
            evictions,
            size,
        })
    }
}

pub struct DestinationCache {
    /// Destination → expiry time
    entries: DashMap<String, Instant>,
    capacity: usize,
    ttl: Duration,
    metrics: Option<CacheMetrics>,
}

impl DestinationCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity),
            capacity: capacity.max(1),
            ttl,
            metrics: None,
        }
    }

    pub fn with_metrics(
        capacity: usize,
        ttl: Duration,
        registry: &Registry,
    ) -> Result<Self, prometheus::Error> {
        Ok(Self {
            metrics: Some(CacheMetrics::new(registry)?),
            ..Self::new(capacity, ttl)
        })
    }

    pub fn from_config(
        config: &CacheConfig,
        registry: Option<&Registry>,
    ) -> Result<Self, prometheus::Error> {
        let ttl = Duration::from_secs(config.ttl);
        match registry {
            Some(registry) => Self::with_metrics(config.capacity, ttl, registry),
            None => Ok(Self::new(config.capacity, ttl)),
        }
    }

    /// True when `key` is cached and not expired. An expired entry is
    /// removed on the spot.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let hit = match self.entries.get(key) {
            Some(expiry) => *expiry > now,
            None => false,
        };

        if !hit && self.entries.remove_if(key, |_, expiry| *expiry <= now).is_some() {
            debug!(key, "Evicting expired cache entry");
            self.evicted(1);
        }

        if let Some(ref metrics) = self.metrics {
            if hit {
                metrics.hits.inc();
            } else {
                metrics.misses.inc();
            }
        }
        hit
    }

    /// Caches `key` for one TTL, refreshing an existing entry.
    pub fn add(&self, key: &str) {
        let expiry = Instant::now() + self.ttl;
        if let Some(mut existing) = self.entries.get_mut(key) {
            *existing = expiry;
            return;
        }

        if self.entries.len() >= self.capacity {
            self.cleanup();
        }
        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }

        if self.entries.insert(key.to_string(), expiry).is_none() {
            debug!(key, "Destination cached");
            if let Some(ref metrics) = self.metrics {
                metrics.size.inc();
            }
        }
    }

    /// Drops every expired entry.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, expiry| *expiry > now);
        let evicted = before.saturating_sub(self.entries.len());

        if evicted > 0 {
            info!(evicted, "Destination cache cleanup complete");
            self.evicted(evicted);
        }
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| *entry.value())
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest
            && self.entries.remove(&key).is_some()
        {
            debug!(key, "Cache full, evicting oldest destination");
            self.evicted(1);
        }
    }

    fn evicted(&self, count: usize) {
        if let Some(ref metrics) = self.metrics {
            metrics.evictions.inc_by(count as u64);
            metrics.size.sub(count as i64);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            capacity: self.capacity,
            ttl: self.ttl,
        }
    }

    /// Start background cleanup task
    ///
    /// Returns a JoinHandle that will run cleanup every interval
    pub fn start_cleanup_task(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.cleanup();
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub ttl: Duration,
}
