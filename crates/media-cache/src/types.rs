//! Cache configuration and statistics

use crate::error::{MediaCacheError, Result};
use serde::{Deserialize, Serialize};

/// Default memory budget for decoded assets (256 MiB)
pub const DEFAULT_BUDGET_BYTES: u64 = 256 * 1024 * 1024;

/// Configuration for a [`MediaCache`](crate::MediaCache)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound on the summed footprint of stored assets
    pub budget_bytes: u64,
}

impl CacheConfig {
    pub fn with_budget(budget_bytes: u64) -> Self {
        Self { budget_bytes }
    }

    pub fn validate(&self) -> Result<()> {
        if self.budget_bytes == 0 {
            return Err(MediaCacheError::Config(
                "cache budget must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: DEFAULT_BUDGET_BYTES,
        }
    }
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Fetches currently in flight
    pub in_flight: usize,
    /// Fetches that actually ran
    pub fetches_started: u64,
    /// Requests that joined an in-flight fetch instead of starting one
    pub fetches_coalesced: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.budget_bytes, 256 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_budget_is_rejected() {
        let err = CacheConfig::with_budget(0).validate().unwrap_err();
        assert!(matches!(err, MediaCacheError::Config(_)));
    }

    #[test]
    fn test_cache_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[test]
    fn test_cache_stats_serialization() {
        let stats = CacheStats {
            entries: 3,
            total_bytes: 12_000,
            budget_bytes: 50_000,
            hits: 10,
            misses: 4,
            evictions: 1,
            in_flight: 2,
            fetches_started: 4,
            fetches_coalesced: 6,
        };

        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"fetches_coalesced\":6"));
        assert!(json.contains("\"budget_bytes\":50000"));
    }
}
