//! When to evict finished work from the shared caches.

/// Sizes of the shared caches at the moment a cleanup is considered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requirements with at least one task.
    pub requirements: usize,
    /// Specifications with a registered producer.
    pub specifications: usize,
    pub completed_steps: u64,
}

/// Decides whether the caches should be flushed. Flushing only drops entries
/// nothing but the cache refers to, so a policy can never break a build, it
/// only trades memory for repeated work.
pub trait CacheCleanupPolicy: Send + Sync {
    fn should_flush(&self, stats: &CacheStats) -> bool;
}

/// Flushes once the caches together hold more than `max_entries` entries.
#[derive(Debug, Clone, Copy)]
pub struct EntryCountPolicy {
    pub max_entries: usize,
}

impl Default for EntryCountPolicy {
    fn default() -> Self {
        Self { max_entries: 100_000 }
    }
}

impl CacheCleanupPolicy for EntryCountPolicy {
    fn should_flush(&self, stats: &CacheStats) -> bool {
        stats.requirements + stats.specifications > self.max_entries
    }
}

/// Never flushes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCleanup;

impl CacheCleanupPolicy for NoCleanup {
    fn should_flush(&self, _: &CacheStats) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_count_threshold() {
        let policy = EntryCountPolicy { max_entries: 10 };
        let mut stats = CacheStats {
            requirements: 6,
            specifications: 4,
            completed_steps: 0,
        };
        assert!(!policy.should_flush(&stats));
        stats.specifications = 5;
        assert!(policy.should_flush(&stats));
        assert!(!NoCleanup.should_flush(&stats));
    }
}
