//! Context-free and contextual validation of transactions, headers, and
//! blocks.

use std::collections::HashSet;

use emberd_consensus::constants::{
    max_block_sigops, LOCKTIME_THRESHOLD, MAX_FUTURE_BLOCK_TIME, MAX_TX_SIGOPS, MAX_TX_SIZE,
    SEQUENCE_FINAL,
};
use emberd_consensus::money::MAX_MONEY;
use emberd_consensus::params::ConsensusParams;
use emberd_consensus::Hash256;
use emberd_pow::difficulty::{get_next_work_required, HeaderInfo};
use emberd_pow::validation::check_proof_of_work;
use emberd_primitives::block::{Block, BlockHeader};
use emberd_primitives::hash::sha256d_pair;
use emberd_primitives::transaction::Transaction;
use emberd_script::standard::{count_sigops, height_commitment_script};

use crate::blockindex::{BlockIndex, NodeId};
use crate::error::{RejectCode, ValidationFailure};

/// Context-free transaction checks, identical for loose and in-block
/// transactions. The duplicate-input scan is skippable inside block
/// validation, where merkle mutation detection covers duplication.
pub fn check_transaction(
    tx: &Transaction,
    check_duplicate_inputs: bool,
) -> Result<(), ValidationFailure> {
    if tx.vin.is_empty() {
        return Err(ValidationFailure::dos(10, RejectCode::Invalid, "bad-txns-vin-empty"));
    }
    if tx.vout.is_empty() {
        return Err(ValidationFailure::dos(10, RejectCode::Invalid, "bad-txns-vout-empty"));
    }
    if tx.serialized_size() as u32 > MAX_TX_SIZE {
        return Err(ValidationFailure::dos(100, RejectCode::Invalid, "bad-txns-oversize"));
    }

    let mut value_out = 0i64;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(ValidationFailure::dos(
                100,
                RejectCode::Invalid,
                "bad-txns-vout-negative",
            ));
        }
        if output.value > MAX_MONEY {
            return Err(ValidationFailure::dos(
                100,
                RejectCode::Invalid,
                "bad-txns-vout-toolarge",
            ));
        }
        value_out += output.value;
        if value_out > MAX_MONEY {
            return Err(ValidationFailure::dos(
                100,
                RejectCode::Invalid,
                "bad-txns-txouttotal-toolarge",
            ));
        }
    }

    if tx_legacy_sigops(tx) > MAX_TX_SIGOPS {
        return Err(ValidationFailure::dos(
            100,
            RejectCode::Invalid,
            "bad-txns-too-many-sigops",
        ));
    }

    if check_duplicate_inputs {
        let mut seen = HashSet::with_capacity(tx.vin.len());
        for input in &tx.vin {
            if !seen.insert((input.prevout.txid, input.prevout.index)) {
                return Err(ValidationFailure::dos(
                    100,
                    RejectCode::Invalid,
                    "bad-txns-inputs-duplicate",
                ));
            }
        }
    }

    if tx.is_coinbase() {
        let script_len = tx.vin[0].script_sig.len();
        if !(2..=100).contains(&script_len) {
            return Err(ValidationFailure::dos(100, RejectCode::Invalid, "bad-cb-length"));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(ValidationFailure::dos(
            10,
            RejectCode::Invalid,
            "bad-txns-prevout-null",
        ));
    }

    Ok(())
}

/// Lock-time finality: final when every sequence opts out or the lock time
/// is below the cutoff (a height when small, a timestamp when large).
pub fn is_final_tx(tx: &Transaction, height: i32, cutoff_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let lock_time = i64::from(tx.lock_time);
    let cutoff = if lock_time < LOCKTIME_THRESHOLD {
        i64::from(height)
    } else {
        cutoff_time
    };
    if lock_time < cutoff {
        return true;
    }
    tx.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// Chain-dependent transaction checks at the given height.
pub fn contextual_check_transaction(
    tx: &Transaction,
    height: i32,
    cutoff_time: i64,
    params: &ConsensusParams,
) -> Result<(), ValidationFailure> {
    if !is_final_tx(tx, height, cutoff_time) {
        return Err(ValidationFailure::dos(10, RejectCode::Invalid, "bad-txns-nonfinal"));
    }

    // Between the hard fork and its sunset, outputs carrying the
    // anti-replay opt-out commitment are forbidden.
    if height >= params.uahf_height && height < params.antireplay_sunset_height {
        for output in &tx.vout {
            if script_carries_commitment(&output.script_pubkey, &params.antireplay_commitment) {
                return Err(ValidationFailure::dos(
                    10,
                    RejectCode::Invalid,
                    "bad-txn-replay",
                ));
            }
        }
    }

    Ok(())
}

fn script_carries_commitment(script: &[u8], commitment: &[u8]) -> bool {
    if commitment.is_empty() || script.len() < commitment.len() + 1 {
        return false;
    }
    script.first() == Some(&0x6a)
        && script
            .windows(commitment.len())
            .any(|window| window == commitment)
}

/// Merkle root over txids, detecting the mutation where duplicating the
/// final transaction(s) leaves the root unchanged.
pub fn merkle_root(txids: &[Hash256]) -> (Hash256, bool) {
    if txids.is_empty() {
        return ([0u8; 32], false);
    }
    let mut layer = txids.to_vec();
    let mut mutated = false;
    while layer.len() > 1 {
        let size = layer.len();
        let mut next = Vec::with_capacity(size.div_ceil(2));
        let mut cursor = 0usize;
        while cursor < size {
            let right = if cursor + 1 < size { cursor + 1 } else { cursor };
            if right == cursor + 1 && right + 1 == size && layer[cursor] == layer[right] {
                mutated = true;
            }
            next.push(sha256d_pair(&layer[cursor], &layer[right]));
            cursor += 2;
        }
        layer = next;
    }
    (layer[0], mutated)
}

/// Legacy signature-operation count of a transaction.
pub fn tx_legacy_sigops(tx: &Transaction) -> u32 {
    let input_ops: u32 = tx
        .vin
        .iter()
        .map(|input| count_sigops(&input.script_sig, false))
        .sum();
    let output_ops: u32 = tx
        .vout
        .iter()
        .map(|output| count_sigops(&output.script_pubkey, false))
        .sum();
    input_ops.saturating_add(output_ops)
}

/// Context-free block checks: proof of work, merkle integrity, shape, size,
/// and aggregate sigops. Returns the txids so callers need not rehash.
pub fn check_block(
    block: &Block,
    params: &ConsensusParams,
    check_pow: bool,
) -> Result<Vec<Hash256>, ValidationFailure> {
    if check_pow {
        check_proof_of_work(&block.header.hash(), block.header.bits, params)
            .map_err(|_| ValidationFailure::dos(50, RejectCode::Invalid, "high-hash"))?;
    }

    if block.transactions.is_empty() {
        return Err(ValidationFailure::dos(100, RejectCode::Invalid, "bad-blk-length"));
    }
    if block.serialized_size() as u64 > params.max_block_size {
        return Err(ValidationFailure::dos(100, RejectCode::Invalid, "bad-blk-length"));
    }

    let txids: Vec<Hash256> = block.transactions.iter().map(Transaction::txid).collect();
    let (root, mutated) = merkle_root(&txids);
    if mutated {
        return Err(ValidationFailure::dos(100, RejectCode::Invalid, "bad-txns-duplicate"));
    }
    if root != block.header.merkle_root {
        return Err(ValidationFailure::dos(100, RejectCode::Invalid, "bad-txnmrklroot"));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ValidationFailure::dos(100, RejectCode::Invalid, "bad-cb-missing"));
    }
    for tx in &block.transactions[1..] {
        if tx.is_coinbase() {
            return Err(ValidationFailure::dos(100, RejectCode::Invalid, "bad-cb-multiple"));
        }
    }

    let mut sigops = 0u32;
    for tx in &block.transactions {
        check_transaction(tx, false)?;
        sigops = sigops.saturating_add(tx_legacy_sigops(tx));
    }
    if sigops > max_block_sigops(block.serialized_size() as u64) {
        return Err(ValidationFailure::dos(100, RejectCode::Invalid, "bad-blk-sigops"));
    }

    Ok(txids)
}

/// Header checks that need the parent chain: difficulty, timestamps,
/// version floors, and the checkpoint horizon.
pub fn contextual_check_header(
    header: &BlockHeader,
    parent: NodeId,
    index: &BlockIndex,
    adjusted_time: i64,
    params: &ConsensusParams,
) -> Result<(), ValidationFailure> {
    let height = index.node(parent).height + 1;

    let expected_bits = next_work_required(index, parent, i64::from(header.time), params)?;
    if header.bits != expected_bits {
        return Err(ValidationFailure::dos(100, RejectCode::Invalid, "bad-diffbits"));
    }

    let past = index.median_time_past(parent);
    if i64::from(header.time) <= past {
        return Err(ValidationFailure::invalid(RejectCode::Invalid, "time-too-old"));
    }
    if i64::from(header.time) > adjusted_time + MAX_FUTURE_BLOCK_TIME {
        return Err(ValidationFailure::invalid(RejectCode::Invalid, "time-too-new"));
    }

    // Version floors for soft forks whose heights have passed.
    if (header.version < 2 && height >= params.bip34_height)
        || (header.version < 3 && height >= params.bip66_height)
        || (header.version < 4 && height >= params.bip65_height)
    {
        return Err(ValidationFailure::dos(100, RejectCode::Obsolete, "bad-version"));
    }

    // The hash at a checkpoint height is fixed, and no fork may attach
    // below the last checkpoint.
    if let Some(checkpoint) = params
        .checkpoints
        .iter()
        .find(|checkpoint| checkpoint.height == height)
    {
        if header.hash() != checkpoint.hash {
            return Err(ValidationFailure::dos(100, RejectCode::Invalid, "checkpoint-mismatch"));
        }
    }
    if let Some(checkpoint) = params.checkpoints.last() {
        if height < checkpoint.height {
            return Err(ValidationFailure::dos(
                100,
                RejectCode::Invalid,
                "bad-fork-prior-to-checkpoint",
            ));
        }
    }

    Ok(())
}

/// Expected compact bits for a child of `parent`, gathering the retarget
/// window from the index.
pub fn next_work_required(
    index: &BlockIndex,
    parent: NodeId,
    next_block_time: i64,
    params: &ConsensusParams,
) -> Result<u32, ValidationFailure> {
    let window = params.difficulty_adjustment_interval().max(1) as usize + 1;
    let mut headers = Vec::with_capacity(window);
    let mut current = Some(parent);
    while let Some(id) = current {
        if headers.len() == window {
            break;
        }
        let node = index.node(id);
        headers.push(HeaderInfo {
            height: node.height,
            time: i64::from(node.header.time),
            bits: node.header.bits,
        });
        current = node.parent;
    }
    headers.reverse();
    get_next_work_required(&headers, Some(next_block_time), params)
        .map_err(|_| ValidationFailure::dos(100, RejectCode::Invalid, "bad-diffbits"))
}

/// Block checks that need the parent chain: per-transaction finality under
/// the active lock-time rules and the coinbase height commitment.
pub fn contextual_check_block(
    block: &Block,
    parent: Option<NodeId>,
    index: &BlockIndex,
    params: &ConsensusParams,
) -> Result<(), ValidationFailure> {
    let height = parent.map(|id| index.node(id).height + 1).unwrap_or(0);

    // Once relative locks activate, finality is measured against
    // median-time-past instead of the block timestamp.
    let cutoff_time = if height >= params.csv_height {
        parent.map(|id| index.median_time_past(id)).unwrap_or(0)
    } else {
        i64::from(block.header.time)
    };

    for tx in &block.transactions {
        contextual_check_transaction(tx, height, cutoff_time, params)?;
    }

    if height >= params.bip34_height {
        let commitment = height_commitment_script(i64::from(height));
        if !block.transactions[0].vin[0].script_sig.starts_with(&commitment) {
            return Err(ValidationFailure::dos(100, RejectCode::Invalid, "bad-cb-height"));
        }
    }

    Ok(())
}
