//! Cache engine configuration.
//!
//! All options are immutable after the engine is built; the builder validates
//! the combination before construction.

use serde::{Deserialize, Serialize};

use crate::cache::error::CacheError;

/// Configuration of the per-node coherence engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Blocking-operation timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum size of a single line's payload in bytes.
    pub max_item_size: usize,
    /// Skip a write (and the version bump) when the payload is byte-equal to
    /// the line's current data.
    pub compare_before_write: bool,
    /// Pool and reuse line records.
    pub reuse_lines: bool,
    /// Pool and reuse sharer sets.
    pub reuse_sharer_sets: bool,
    /// Record rollback snapshots so transactions can be aborted.
    pub rollback_supported: bool,
    /// Serve reads of invalidated lines from their last known data when the
    /// owner-clock mechanism proves it safe.
    pub dirty_reads: bool,
    /// Weighted capacity of the shared (non-owned) line table.
    pub max_capacity: u64,
    /// Synchronous mode. Not implemented; building with this set fails.
    pub synchronous: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 200_000,
            max_item_size: 1024,
            compare_before_write: true,
            reuse_lines: true,
            reuse_sharer_sets: false,
            rollback_supported: true,
            dirty_reads: true,
            max_capacity: 100_000,
            synchronous: false,
        }
    }
}

impl CacheConfig {
    /// Validates the configuration. Called by the builder before the engine
    /// is constructed.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.synchronous {
            return Err(CacheError::InvalidConfiguration(
                "synchronous mode has not been implemented yet".to_string(),
            ));
        }
        if self.max_item_size == 0 {
            return Err(CacheError::InvalidConfiguration(
                "max_item_size must be positive".to_string(),
            ));
        }
        if self.max_capacity == 0 {
            return Err(CacheError::InvalidConfiguration(
                "max_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_synchronous_mode_rejected() {
        let config = CacheConfig {
            synchronous: true,
            ..CacheConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CacheError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = CacheConfig {
            max_capacity: 0,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
