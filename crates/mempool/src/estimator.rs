//! Confirmation-time fee estimation fed by parentless mempool entries.

use std::collections::{BTreeMap, HashMap, VecDeque};

use emberd_consensus::Hash256;

const MAX_CONFIRM_TARGET: i32 = 25;
const SAMPLES_PER_BUCKET: usize = 256;

/// Tracks the feerates of transactions from mempool entry to confirmation
/// and answers "what feerate confirms within N blocks".
#[derive(Default)]
pub struct FeeEstimator {
    pending: HashMap<Hash256, PendingTx>,
    buckets: BTreeMap<i32, VecDeque<i64>>,
}

struct PendingTx {
    feerate_per_kb: i64,
    entry_height: i32,
}

impl FeeEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an admitted transaction. Only entries with no mempool
    /// parents are meaningful samples; the caller filters.
    pub fn process_tx(&mut self, txid: Hash256, feerate_per_kb: i64, entry_height: i32) {
        self.pending.insert(
            txid,
            PendingTx {
                feerate_per_kb,
                entry_height,
            },
        );
    }

    /// Forgets a transaction that left the pool unconfirmed.
    pub fn remove_tx(&mut self, txid: &Hash256) {
        self.pending.remove(txid);
    }

    /// Records confirmations from a connected block.
    pub fn process_block(&mut self, height: i32, mined: &[Hash256]) {
        for txid in mined {
            let Some(pending) = self.pending.remove(txid) else {
                continue;
            };
            let blocks = (height - pending.entry_height).max(1);
            if blocks > MAX_CONFIRM_TARGET {
                continue;
            }
            let bucket = self.buckets.entry(blocks).or_default();
            bucket.push_back(pending.feerate_per_kb);
            while bucket.len() > SAMPLES_PER_BUCKET {
                bucket.pop_front();
            }
        }
    }

    /// Median feerate of samples that confirmed within `target` blocks.
    pub fn estimate_fee_per_kb(&self, target: i32) -> Option<i64> {
        let mut samples: Vec<i64> = self
            .buckets
            .range(..=target)
            .flat_map(|(_, bucket)| bucket.iter().copied())
            .collect();
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        Some(samples[samples.len() / 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_track_confirmation_speed() {
        let mut estimator = FeeEstimator::new();
        for index in 0..10u8 {
            let mut fast = [0u8; 32];
            fast[0] = index;
            estimator.process_tx(fast, 10_000, 100);
            let mut slow = [1u8; 32];
            slow[1] = index;
            estimator.process_tx(slow, 1_000, 100);
        }
        let fast_ids: Vec<Hash256> = (0..10u8)
            .map(|index| {
                let mut txid = [0u8; 32];
                txid[0] = index;
                txid
            })
            .collect();
        let slow_ids: Vec<Hash256> = (0..10u8)
            .map(|index| {
                let mut txid = [1u8; 32];
                txid[1] = index;
                txid
            })
            .collect();
        estimator.process_block(101, &fast_ids);
        estimator.process_block(110, &slow_ids);

        assert_eq!(estimator.estimate_fee_per_kb(1), Some(10_000));
        let broad = estimator.estimate_fee_per_kb(25).expect("estimate");
        assert!(broad <= 10_000);
    }

    #[test]
    fn evicted_transactions_leave_no_samples() {
        let mut estimator = FeeEstimator::new();
        estimator.process_tx([9u8; 32], 5_000, 100);
        estimator.remove_tx(&[9u8; 32]);
        estimator.process_block(101, &[[9u8; 32]]);
        assert_eq!(estimator.estimate_fee_per_kb(25), None);
    }
}
