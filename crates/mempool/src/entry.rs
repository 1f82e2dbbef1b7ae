//! Mempool entry and the cached relative-lock summary.

use emberd_consensus::Hash256;
use emberd_primitives::outpoint::OutPoint;
use emberd_primitives::transaction::Transaction;

const MAX_PRIORITY: f64 = 1e16;

/// Cached summary of a transaction's relative-lock constraints. The pair
/// `(height, time)` is what evaluation compares against the next block;
/// `max_input_block` is the most recent block an input depends on, and the
/// cache is only valid while that block stays on the active chain.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LockPoints {
    pub height: i32,
    pub time: i64,
    pub max_input_block: Option<Hash256>,
}

pub struct MempoolEntry {
    pub txid: Hash256,
    pub tx: Transaction,
    pub raw: Vec<u8>,
    /// Arrival time, unix seconds.
    pub time: u64,
    /// Active-chain height when the entry was admitted.
    pub height: i32,
    pub fee: i64,
    pub fee_delta: i64,
    pub value_in: i64,
    pub modified_size: usize,
    pub priority: f64,
    pub priority_delta: f64,
    pub sigops: u32,
    pub spends_coinbase: bool,
    pub lock_points: LockPoints,
    pub spent_outpoints: Vec<OutPoint>,
    pub parents: Vec<Hash256>,
    /// True when the entry had no in-mempool parents at admission; only such
    /// entries feed the fee estimator.
    pub was_clear_at_entry: bool,
}

impl MempoolEntry {
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    pub fn modified_fee(&self) -> i64 {
        self.fee.saturating_add(self.fee_delta)
    }

    /// Fee rate in base units per 1000 bytes, using the modified fee.
    pub fn feerate_per_kb(&self) -> i64 {
        let size = self.size().max(1) as i64;
        self.modified_fee().saturating_mul(1000) / size
    }

    pub fn starting_priority(&self) -> f64 {
        self.priority
    }

    /// Priority grows as inputs age; the delta since entry is approximated
    /// from the total input value.
    pub fn current_priority(&self, current_height: i32) -> f64 {
        if self.modified_size == 0 {
            return self.priority + self.priority_delta;
        }
        let aged = current_height.saturating_sub(self.height).max(0) as f64;
        let value_in = self.value_in.max(0) as f64;
        let increase = aged * value_in / (self.modified_size as f64);
        (self.priority + increase + self.priority_delta).min(MAX_PRIORITY)
    }
}

/// Size with the scriptSig bytes that pure signature data occupies removed,
/// so large-input transactions are not penalized in priority.
pub fn modified_size(tx: &Transaction, tx_size: usize) -> usize {
    let mut size = tx_size;
    for input in &tx.vin {
        let offset = 41usize.saturating_add(110usize.min(input.script_sig.len()));
        if size > offset {
            size -= offset;
        }
    }
    size
}
