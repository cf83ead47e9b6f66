//! Client SDK configuration.
//!
//! Loaded once at client construction and immutable afterwards; a second
//! client in the same process shares the same values by cloning.

use std::path::PathBuf;

/// Hard ceiling on one write RPC's payload.
pub const MAX_RPC_BYTE_SIZE: usize = 2 << 20;

#[derive(Clone, Debug)]
pub struct SdkConfig {
    /// Bounded retry envelope: transport faults and range redirections share
    /// this budget.
    pub retry_times: u32,
    /// Unit delay of the retry backoff, in milliseconds.
    pub retry_period_ms: u64,
    /// Dimensionless base of the power-law retry backoff.
    pub retry_backoff_base: u32,
    /// Minimum gap between meta refreshes for the same range.
    pub update_meta_interval_ms: i64,
    /// Request synchronous log flush on the server for writes.
    pub write_sync: bool,
    /// Row-count flush trigger for both directions.
    pub batch_size: usize,
    /// Mutation batch timer.
    pub write_send_interval_ms: u64,
    /// Reader batch timer.
    pub read_send_interval_ms: u64,
    /// Flow-control limit on pending row-mutation slots.
    pub max_mutation_pending_num: i64,
    /// Flow-control limit on pending readers.
    pub max_reader_pending_num: i64,
    /// Block (true) or fail fast with `Busy` (false) when a limit is hit.
    pub async_blocking_enabled: bool,
    /// Default per-task deadline.
    pub timeout_ms: i64,
    /// Bytes per scan RPC.
    pub scan_buffer_limit: u64,
    /// Concurrent meta scans permitted.
    pub update_meta_concurrency: u32,
    /// Bytes per meta scan RPC.
    pub update_meta_buffer_limit: u64,
    pub cookie_enabled: bool,
    pub cookie_dir: PathBuf,
    pub cookie_update_interval_ms: u64,
    /// Client timeout hint forwarded in read requests.
    pub pending_timeout_ms: i64,
    /// Pagination cap for listings.
    pub show_max_num: u32,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            retry_times: 10,
            retry_period_ms: 500,
            retry_backoff_base: 2,
            update_meta_interval_ms: 800,
            write_sync: false,
            batch_size: 100,
            write_send_interval_ms: 10,
            read_send_interval_ms: 5,
            max_mutation_pending_num: 10_000,
            max_reader_pending_num: 10_000,
            async_blocking_enabled: true,
            timeout_ms: 60_000,
            scan_buffer_limit: 1 << 20,
            update_meta_concurrency: 3,
            update_meta_buffer_limit: 256 << 10,
            cookie_enabled: false,
            cookie_dir: PathBuf::from("/tmp/trellis-cookie"),
            cookie_update_interval_ms: 600_000,
            pending_timeout_ms: 60_000,
            show_max_num: 1024,
        }
    }
}

impl SdkConfig {
    /// Power-law backoff for the given retry attempt:
    /// `retry_backoff_base^attempt * retry_period_ms`, capped at 30s.
    pub fn retry_backoff_ms(&self, attempt: u32) -> u64 {
        u64::from(self.retry_backoff_base.max(1))
            .saturating_pow(attempt.min(6))
            .saturating_mul(self.retry_period_ms)
            .min(30_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_follows_the_power_law() {
        let config = SdkConfig {
            retry_period_ms: 100,
            retry_backoff_base: 3,
            ..Default::default()
        };
        assert_eq!(config.retry_backoff_ms(0), 100);
        assert_eq!(config.retry_backoff_ms(1), 300);
        assert_eq!(config.retry_backoff_ms(2), 900);
        // Large attempts saturate at the cap.
        assert_eq!(config.retry_backoff_ms(10), 30_000);
    }
}
