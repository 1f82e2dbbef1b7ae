//! Consensus-wide constants shared across validation.

/// The maximum allowed size for a serialized transaction, in bytes (network rule).
pub const MAX_TX_SIZE: u32 = 1_000_000;
/// The maximum allowed number of signature check operations in a transaction (network rule).
pub const MAX_TX_SIGOPS: u32 = 20_000;
/// Allowed number of signature check operations per million bytes of block.
pub const MAX_BLOCK_SIGOPS_PER_MB: u32 = 20_000;
/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// Blocks this deep below the tip are never pruned.
pub const MIN_BLOCKS_TO_KEEP: i32 = 288;
/// Threshold below which nLockTime is interpreted as a block height.
pub const LOCKTIME_THRESHOLD: i64 = 500_000_000;
/// How far into the future a header timestamp may run past adjusted time.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Number of headers over which median-time-past is computed.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Interpret sequence numbers as relative lock-times (BIP68).
pub const LOCKTIME_VERIFY_SEQUENCE: u32 = 1 << 0;
/// Use median-time-past instead of block time as the lock-time cutoff.
pub const LOCKTIME_MEDIAN_TIME_PAST: u32 = 1 << 1;
/// Lock-time flags applied by non-consensus (mempool) code.
pub const STANDARD_LOCKTIME_VERIFY_FLAGS: u32 =
    LOCKTIME_VERIFY_SEQUENCE | LOCKTIME_MEDIAN_TIME_PAST;

/// Sequence value that disables all lock-time semantics for an input.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// The maximum number of blocks connected per batch while the reorg driver
/// holds the chain state, so other work can interleave between batches.
pub const MAX_BLOCKS_PER_ACTIVATION_BATCH: usize = 32;

/// Maximum allowed signature check operations for a block of the given
/// serialized size, scaling per started megabyte.
pub fn max_block_sigops(block_size: u64) -> u32 {
    let mb = block_size.saturating_sub(1) / 1_000_000 + 1;
    (mb as u32).saturating_mul(MAX_BLOCK_SIGOPS_PER_MB)
}

#[cfg(test)]
mod tests {
    use super::max_block_sigops;

    #[test]
    fn block_sigops_scale_per_started_megabyte() {
        assert_eq!(max_block_sigops(1), 20_000);
        assert_eq!(max_block_sigops(1_000_000), 20_000);
        assert_eq!(max_block_sigops(1_000_001), 40_000);
        assert_eq!(max_block_sigops(8_000_000), 160_000);
    }
}
