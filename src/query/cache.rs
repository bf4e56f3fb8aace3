//! Compiled plan caching
//!
//! Compilation is deterministic, so a plan compiled once can be reused for
//! every later execution of the same statement text. Uses moka for
//! thread-safe concurrent caching with TTL-based expiration.

use moka::sync::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::plan::ExecutionPlan;

/// Plan cache with TTL and statistics
pub struct PlanCache {
    cache: Cache<String, Arc<ExecutionPlan>>,
    hits: AtomicU64,
    misses: AtomicU64,
    ttl: Duration,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::with_config(1000, Duration::from_secs(300))
    }

    pub fn with_config(max_entries: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            ttl,
        }
    }

    pub fn get(&self, sql: &str) -> Option<Arc<ExecutionPlan>> {
        let key = normalize_sql(sql);
        if let Some(plan) = self.cache.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(plan)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn put(&self, sql: &str, plan: Arc<ExecutionPlan>) {
        self.cache.insert(normalize_sql(sql), plan);
    }

    /// Cached plan for `sql`, compiling and storing it on a miss.
    /// Compilation errors are returned and not cached.
    pub fn get_or_compile<E, F>(&self, sql: &str, compile: F) -> Result<Arc<ExecutionPlan>, E>
    where
        F: FnOnce(&str) -> Result<ExecutionPlan, E>,
    {
        if let Some(plan) = self.get(sql) {
            return Ok(plan);
        }
        let plan = Arc::new(compile(sql)?);
        self.put(sql, plan.clone());
        Ok(plan)
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            entry_count: self.cache.entry_count(),
            ttl_secs: self.ttl.as_secs(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PlanCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanCache")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
    /// Number of entries in cache
    pub entry_count: u64,
    /// TTL in seconds
    pub ttl_secs: u64,
}

/// Collapse whitespace runs outside quoted text; case is preserved
fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for c in sql.trim().chars() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c.is_whitespace() => pending_space = true,
            None => {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                if matches!(c, '\'' | '"' | '`') {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }
    out
}
