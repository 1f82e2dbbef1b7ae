//! Relative lock-time (sequence lock) evaluation.

use emberd_consensus::constants::LOCKTIME_VERIFY_SEQUENCE;
use emberd_primitives::transaction::{
    Transaction, SEQUENCE_LOCKTIME_DISABLE_FLAG, SEQUENCE_LOCKTIME_GRANULARITY,
    SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
};

pub use emberd_mempool::entry::LockPoints;

use crate::blockindex::{BlockIndex, NodeId};
use crate::chain::ActiveChain;

/// The height- and time-valued locks a transaction's inputs impose, as the
/// pair of last invalid values: the transaction may be included in a block
/// only when both the block height and the parent's median-time-past are
/// strictly greater. `(-1, -1)` means unconstrained.
///
/// `prev_heights[i]` is the height the i-th input's coin was created at;
/// `parent` is the parent of the hypothetical including block. Sequence
/// numbers only constrain version-2 transactions, and only when the caller
/// passes the sequence-verify flag.
pub fn calculate_sequence_locks(
    tx: &Transaction,
    flags: u32,
    prev_heights: &[i32],
    index: &BlockIndex,
    parent: Option<NodeId>,
) -> (i32, i64) {
    assert_eq!(prev_heights.len(), tx.vin.len());

    let mut min_height = -1i32;
    let mut min_time = -1i64;

    let enforce = tx.version as u32 >= 2 && (flags & LOCKTIME_VERIFY_SEQUENCE) != 0;
    if !enforce {
        return (min_height, min_time);
    }

    for (input, coin_height) in tx.vin.iter().zip(prev_heights.iter()) {
        if input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            continue;
        }
        let locked_value = i64::from(input.sequence & SEQUENCE_LOCKTIME_MASK);
        if input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
            // Time-based: measured from the median-time-past of the block
            // before the one that created the coin. Subtract one to convert
            // the first valid time into the last invalid one.
            let measure_from = (coin_height - 1).max(0);
            let coin_time = parent
                .and_then(|parent_id| index.ancestor(parent_id, measure_from))
                .map(|ancestor_id| index.median_time_past(ancestor_id))
                .unwrap_or(0);
            min_time = min_time.max(
                coin_time + (locked_value << SEQUENCE_LOCKTIME_GRANULARITY) - 1,
            );
        } else {
            min_height = min_height.max(coin_height + locked_value as i32 - 1);
        }
    }

    (min_height, min_time)
}

/// Whether the lock pair admits inclusion in a block at `block_height` whose
/// parent has `parent_mtp`.
pub fn evaluate_sequence_locks(block_height: i32, parent_mtp: i64, locks: (i32, i64)) -> bool {
    locks.0 < block_height && locks.1 < parent_mtp
}

/// A cached lock-point summary stays meaningful only while the most recent
/// input block is still on the active chain.
pub fn lock_points_valid(index: &BlockIndex, chain: &ActiveChain, lock_points: &LockPoints) -> bool {
    match lock_points.max_input_block {
        Some(hash) => match index.lookup(&hash) {
            Some(id) => chain.contains(index, id),
            None => false,
        },
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_consensus::constants::STANDARD_LOCKTIME_VERIFY_FLAGS;
    use emberd_consensus::Hash256;
    use emberd_primitives::block::BlockHeader;
    use emberd_primitives::outpoint::OutPoint;
    use emberd_primitives::transaction::{TxIn, TxOut};

    fn header(prev: Hash256, time: u32, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time,
            bits: 0x207f_ffff,
            nonce,
        }
    }

    fn chain_of(length: u32, spacing: u32) -> (BlockIndex, Vec<NodeId>) {
        let mut index = BlockIndex::new();
        let mut prev = [0u8; 32];
        let mut ids = Vec::new();
        for height in 0..length {
            let h = header(prev, 1_000_000 + height * spacing, height);
            prev = h.hash();
            ids.push(index.insert_header(&h).expect("insert"));
        }
        (index, ids)
    }

    fn tx_with_sequence(sequence: u32, version: i32) -> Transaction {
        Transaction {
            version,
            vin: vec![TxIn {
                prevout: OutPoint::new([1u8; 32], 0),
                script_sig: Vec::new(),
                sequence,
            }],
            vout: vec![TxOut {
                value: 1,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn version_one_transactions_are_unconstrained() {
        let (index, ids) = chain_of(10, 600);
        let tx = tx_with_sequence(5, 1);
        let locks = calculate_sequence_locks(
            &tx,
            STANDARD_LOCKTIME_VERIFY_FLAGS,
            &[3],
            &index,
            Some(ids[9]),
        );
        assert_eq!(locks, (-1, -1));
    }

    #[test]
    fn flag_gates_enforcement() {
        let (index, ids) = chain_of(10, 600);
        let tx = tx_with_sequence(5, 2);
        let locks = calculate_sequence_locks(&tx, 0, &[3], &index, Some(ids[9]));
        assert_eq!(locks, (-1, -1));
    }

    #[test]
    fn height_lock_counts_from_coin_height() {
        let (index, ids) = chain_of(10, 600);
        // Coin at height 3, relative lock of 5 blocks: first valid height is
        // 8, so the last invalid one is 7.
        let tx = tx_with_sequence(5, 2);
        let locks = calculate_sequence_locks(
            &tx,
            STANDARD_LOCKTIME_VERIFY_FLAGS,
            &[3],
            &index,
            Some(ids[9]),
        );
        assert_eq!(locks.0, 7);
        assert_eq!(locks.1, -1);
        assert!(!evaluate_sequence_locks(7, i64::MAX, locks));
        assert!(evaluate_sequence_locks(8, i64::MAX, locks));
    }

    #[test]
    fn disable_flag_skips_input() {
        let (index, ids) = chain_of(10, 600);
        let tx = tx_with_sequence(SEQUENCE_LOCKTIME_DISABLE_FLAG | 5, 2);
        let locks = calculate_sequence_locks(
            &tx,
            STANDARD_LOCKTIME_VERIFY_FLAGS,
            &[3],
            &index,
            Some(ids[9]),
        );
        assert_eq!(locks, (-1, -1));
    }

    #[test]
    fn time_lock_counts_from_prior_median_time() {
        let (index, ids) = chain_of(20, 600);
        // One time unit = 512 seconds.
        let tx = tx_with_sequence(SEQUENCE_LOCKTIME_TYPE_FLAG | 2, 2);
        let locks = calculate_sequence_locks(
            &tx,
            STANDARD_LOCKTIME_VERIFY_FLAGS,
            &[10],
            &index,
            Some(ids[19]),
        );
        let base = index.median_time_past(ids[9]);
        assert_eq!(locks.0, -1);
        assert_eq!(locks.1, base + 2 * 512 - 1);
        assert!(!evaluate_sequence_locks(100, base + 2 * 512 - 1, locks));
        assert!(evaluate_sequence_locks(100, base + 2 * 512, locks));
    }

    #[test]
    fn lock_points_expire_with_their_input_block() {
        let (index, ids) = chain_of(6, 600);
        let mut chain = ActiveChain::new();
        chain.set_tip(&index, Some(ids[5]));

        let on_chain = LockPoints {
            height: 4,
            time: 0,
            max_input_block: Some(index.node(ids[4]).hash),
        };
        assert!(lock_points_valid(&index, &chain, &on_chain));

        let unknown = LockPoints {
            height: 4,
            time: 0,
            max_input_block: Some([0xcdu8; 32]),
        };
        assert!(!lock_points_valid(&index, &chain, &unknown));

        let free = LockPoints::default();
        assert!(lock_points_valid(&index, &chain, &free));
    }
}
