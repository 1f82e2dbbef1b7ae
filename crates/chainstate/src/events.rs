//! Outbound notifications: a typed bus injected at construction. Every
//! method has a no-op default so consumers subscribe only to what they need.

use emberd_consensus::Hash256;
use emberd_primitives::block::Block;
use emberd_primitives::transaction::Transaction;

use crate::error::ValidationFailure;

/// Where a transaction landed when a `sync_transaction` event fired.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxPosition {
    InBlock(usize),
    NotInBlock,
}

pub trait ChainNotifier: Send + Sync {
    /// The active tip changed. Fired at most once per activation pass, after
    /// all in-memory effects of the pass.
    fn updated_block_tip(
        &self,
        _new_tip: &Hash256,
        _fork_point: Option<&Hash256>,
        _initial_download: bool,
    ) {
    }

    /// A block completed context-free and contextual checks (or failed them).
    fn block_checked(&self, _block_hash: &Hash256, _result: &Result<(), ValidationFailure>) {}

    /// A block with valid proof-of-work extending the best header arrived.
    fn new_pow_valid_block(&self, _block_hash: &Hash256, _block: &Block) {}

    /// A transaction was (dis)connected. During a reorg all disconnect-side
    /// events fire before any connect-side event.
    fn sync_transaction(&self, _tx: &Transaction, _block_hash: Option<&Hash256>, _position: TxPosition) {
    }

    /// The best chain changed; the locator samples it back to genesis.
    fn set_best_chain(&self, _locator: &[Hash256]) {}
}

/// Discards every notification.
pub struct NullNotifier;

impl ChainNotifier for NullNotifier {}
