//! Memory accounting for buffering operators
//!
//! One tracker per execution. Every operator that holds rows (shard
//! buffers, materialized sort, group accumulators, the distinct key set)
//! reserves bytes here before keeping them and releases them when they are
//! handed upward or dropped.

use tracing::warn;

use crate::error::{QueryError, Result};

pub const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug)]
pub struct MemoryTracker {
    limit: u64,
    used: u64,
    peak: u64,
}

impl MemoryTracker {
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            limit: limit_bytes,
            used: 0,
            peak: 0,
        }
    }

    pub fn with_limit_mb(limit_mb: u64) -> Self {
        Self::new(limit_mb.saturating_mul(BYTES_PER_MB))
    }

    /// Reserve `bytes` on behalf of `context`.
    ///
    /// On failure nothing is reserved.
    pub fn reserve(&mut self, bytes: u64, context: &str) -> Result<()> {
        let wanted = self.used.saturating_add(bytes);
        if wanted > self.limit {
            warn!(
                context,
                requested = bytes,
                used = self.used,
                limit = self.limit,
                "memory limit exceeded"
            );
            return Err(QueryError::MemoryLimitExceeded {
                context: context.to_string(),
                requested: bytes,
                used: self.used,
                limit: self.limit,
            });
        }
        self.used = wanted;
        self.peak = self.peak.max(wanted);
        Ok(())
    }

    pub fn release(&mut self, bytes: u64) {
        debug_assert!(bytes <= self.used, "released more memory than reserved");
        self.used = self.used.saturating_sub(bytes);
    }

    /// Drop every outstanding reservation. Returns what was still held.
    pub fn release_all(&mut self) -> u64 {
        std::mem::take(&mut self.used)
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn peak(&self) -> u64 {
        self.peak
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let mut tracker = MemoryTracker::new(100);
        tracker.reserve(60, "sort").unwrap();
        tracker.reserve(40, "distinct").unwrap();
        assert_eq!(tracker.used(), 100);

        tracker.release(60);
        assert_eq!(tracker.used(), 40);
        assert_eq!(tracker.peak(), 100);
    }

    #[test]
    fn test_failed_reserve_leaves_usage_unchanged() {
        let mut tracker = MemoryTracker::new(100);
        tracker.reserve(90, "sort").unwrap();

        let err = tracker.reserve(20, "sort").unwrap_err();
        assert!(matches!(
            err,
            QueryError::MemoryLimitExceeded { requested: 20, used: 90, limit: 100, .. }
        ));
        assert_eq!(tracker.used(), 90);
        assert_eq!(tracker.release_all(), 90);
        assert_eq!(tracker.used(), 0);
    }

    #[test]
    fn test_limit_in_megabytes() {
        assert_eq!(MemoryTracker::with_limit_mb(1).limit(), 1024 * 1024);
    }
}
