//! Cache configuration.
//!
//! A plain struct with a `Default` impl and a `validate()` returning
//! `CResult<()>`.

use crate::error::{CResult, Error};

/// `max_patches_size_ratio` when commits wait for a durable flush: patches
/// are allowed to accumulate further since a full flush is already paid for
/// by every commit.
const MAX_PATCHES_SIZE_RATIO_DURABILITY: u64 = 4;
/// `max_patches_size_ratio` otherwise: patches are capped more tightly so a
/// block doesn't grow an unbounded patch chain between lazy flushes.
const MAX_PATCHES_SIZE_RATIO_MIN: u64 = 8;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Memory budget in bytes. The page-replacement unload threshold is
    /// `max_size / block_size`.
    pub max_size: u64,

    /// If true, write transaction commits block until their data is
    /// durably flushed.
    pub wait_for_flush: bool,

    /// Periodic flush cadence.
    pub flush_timer_ms: u64,

    /// Soft dirty-byte budget; crossing it encourages (does not force) a
    /// flush pass.
    pub flush_dirty_size: u64,

    /// Hard dirty-byte budget; crossing it throttles new write
    /// transactions in `begin_transaction`.
    pub max_dirty_size: u64,

    /// Number of transactions queued waiting on a flush that triggers one
    /// eagerly rather than waiting for the timer.
    pub flush_waiting_threshold: usize,

    /// Parallel flush limit.
    pub max_concurrent_flushes: usize,

    /// Serializer I/O priority weight for reads.
    pub io_priority_reads: u32,

    /// Serializer I/O priority weight for writes.
    pub io_priority_writes: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 64 * 1024 * 1024,
            wait_for_flush: false,
            flush_timer_ms: 200,
            flush_dirty_size: 1024 * 1024,
            max_dirty_size: 8 * 1024 * 1024,
            flush_waiting_threshold: 8,
            max_concurrent_flushes: 1,
            io_priority_reads: 100,
            io_priority_writes: 100,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> CResult<()> {
        if self.max_size == 0 {
            return Err(Error::InvalidInput("max_size must be greater than 0".into()));
        }
        if self.max_dirty_size < self.flush_dirty_size {
            return Err(Error::InvalidInput(
                "max_dirty_size must be >= flush_dirty_size".into(),
            ));
        }
        if self.max_concurrent_flushes == 0 {
            return Err(Error::InvalidInput(
                "max_concurrent_flushes must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Unload threshold in blocks, given the serializer's block size.
    pub fn unload_threshold_blocks(&self, block_size: u64) -> u64 {
        self.max_size / block_size
    }

    /// Per-block patch budget in bytes, given the serializer's block size.
    /// `block_size / max_patches_size_ratio`.
    pub fn max_patch_budget_bytes(&self, block_size: u64) -> u64 {
        let ratio = if self.wait_for_flush {
            MAX_PATCHES_SIZE_RATIO_DURABILITY
        } else {
            MAX_PATCHES_SIZE_RATIO_MIN
        };
        block_size / ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_max_size_is_rejected() {
        let cfg = CacheConfig { max_size: 0, ..CacheConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn durability_mode_allows_more_patches() {
        let durable = CacheConfig { wait_for_flush: true, ..CacheConfig::default() };
        let lazy = CacheConfig { wait_for_flush: false, ..CacheConfig::default() };
        assert!(durable.max_patch_budget_bytes(4096) > lazy.max_patch_budget_bytes(4096));
    }
}
