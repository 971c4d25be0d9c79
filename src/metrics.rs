use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A simple counter that can be incremented atomically
#[derive(Debug)]
pub struct Counter {
    value: AtomicUsize,
}

impl Counter {
    /// Create a new counter with an initial value
    pub fn new(initial_value: usize) -> Self {
        Self {
            value: AtomicUsize::new(initial_value),
        }
    }

    /// Increment the counter by a specific amount
    pub fn increment(&self, amount: usize) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    /// Get the current value of the counter
    pub fn value(&self) -> usize {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Counters kept by a content cache
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub hits: Counter,
    pub misses: Counter,
    /// Requests that waited on another caller's population
    pub joins: Counter,
    pub evictions: Counter,
    pub invalidations: Counter,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.value(),
            misses: self.misses.value(),
            joins: self.joins.value(),
            evictions: self.evictions.value(),
            invalidations: self.invalidations.value(),
        }
    }
}

/// Plain values read from [`CacheMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub joins: usize,
    pub evictions: usize,
    pub invalidations: usize,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} joins={} evictions={} invalidations={}",
            self.hits, self.misses, self.joins, self.evictions, self.invalidations
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counter_concurrent() {
        let counter = Arc::new(Counter::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.increment(1);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.value(), 8000);
    }

    #[test]
    fn test_snapshot_format() {
        let metrics = CacheMetrics::new();
        metrics.hits.increment(3);
        metrics.misses.increment(1);

        let stats = metrics.snapshot();
        assert_eq!(stats.hits, 3);
        assert_eq!(
            stats.to_string(),
            "hits=3 misses=1 joins=0 evictions=0 invalidations=0"
        );
    }
}
