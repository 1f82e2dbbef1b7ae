//! Shared scaffolding: a regtest chain state over the in-memory store with
//! a trivially-minable difficulty.
#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use emberd_chainstate::events::{ChainNotifier, TxPosition};
use emberd_chainstate::state::{ChainState, ChainStateConfig};
use emberd_chainstate::validate::merkle_root;
use emberd_consensus::params::{chain_params, ChainParams, Network};
use emberd_consensus::{block_subsidy, Hash256};
use emberd_pow::validation::check_proof_of_work;
use emberd_primitives::block::{Block, BlockHeader, CURRENT_BLOCK_VERSION};
use emberd_primitives::outpoint::OutPoint;
use emberd_primitives::transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};
use emberd_storage::memory::MemoryStore;
use tempfile::TempDir;

pub const REGTEST_BITS: u32 = 0x207f_ffff;
pub const GENESIS_TIME: u32 = 1_700_000_000;
pub const SPACING: u32 = 600;

/// Collects tip-update and per-transaction events for ordering assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<Event>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Tip(Hash256),
    Tx {
        txid: Hash256,
        block: Option<Hash256>,
        position: Option<usize>,
    },
}

impl ChainNotifier for RecordingNotifier {
    fn updated_block_tip(&self, new_tip: &Hash256, _fork: Option<&Hash256>, _ibd: bool) {
        self.events.lock().unwrap().push(Event::Tip(*new_tip));
    }

    fn sync_transaction(&self, tx: &Transaction, block: Option<&Hash256>, position: TxPosition) {
        self.events.lock().unwrap().push(Event::Tx {
            txid: tx.txid(),
            block: block.copied(),
            position: match position {
                TxPosition::InBlock(index) => Some(index),
                TxPosition::NotInBlock => None,
            },
        });
    }
}

pub struct TestChain {
    pub state: ChainState<MemoryStore>,
    pub params: ChainParams,
    pub notifier: Arc<RecordingNotifier>,
    pub store: Arc<MemoryStore>,
    pub dir: TempDir,
    pub genesis_hash: Hash256,
}

pub fn regtest_params() -> ChainParams {
    chain_params(Network::Regtest)
}

pub fn test_config() -> ChainStateConfig {
    ChainStateConfig {
        require_standard: false,
        min_relay_fee_per_kb: 0,
        ..ChainStateConfig::default()
    }
}

impl TestChain {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ChainStateConfig) -> Self {
        let mut params = regtest_params();
        let genesis = genesis_block();
        params.consensus.hash_genesis_block = genesis.hash();

        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = ChainState::new(
            Arc::clone(&store),
            params.clone(),
            config,
            dir.path(),
            Arc::clone(&notifier) as Arc<dyn ChainNotifier>,
            Arc::new(AtomicBool::new(false)),
        )
        .expect("chain state");

        let genesis_hash = genesis.hash();
        state
            .process_new_block(&genesis, i64::from(GENESIS_TIME))
            .expect("genesis accepted");

        Self {
            state,
            params,
            notifier,
            store,
            dir,
            genesis_hash,
        }
    }

    /// Re-opens a chain state over the same store and block directory, as a
    /// restart would.
    pub fn reload(&self, config: ChainStateConfig) -> ChainState<MemoryStore> {
        ChainState::new(
            Arc::clone(&self.store),
            self.params.clone(),
            config,
            self.dir.path(),
            Arc::clone(&self.notifier) as Arc<dyn ChainNotifier>,
            Arc::new(AtomicBool::new(false)),
        )
        .expect("reload chain state")
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.state.tip_hash().expect("tip")
    }

    pub fn tip_time(&self) -> u32 {
        let tip = self.state.tip().expect("tip");
        self.state.index().node(tip).header.time
    }

    pub fn tip_height(&self) -> i32 {
        self.state.tip_height()
    }

    /// Mines and submits one block on the current tip.
    pub fn mine_block(
        &mut self,
        txs: Vec<Transaction>,
        coinbase_script: Vec<u8>,
    ) -> Result<Block, emberd_chainstate::ChainstateError> {
        let height = self.tip_height() + 1;
        let block = build_block(
            &self.params,
            self.tip_hash(),
            height,
            self.tip_time() + SPACING,
            txs,
            coinbase_script,
        );
        self.submit(&block)?;
        Ok(block)
    }

    /// Mines `count` blocks whose coinbases are unspendable, keeping the
    /// coins view free of clutter.
    pub fn mine_buffer_blocks(&mut self, count: usize) {
        for _ in 0..count {
            self.mine_block(Vec::new(), vec![0x6a]).expect("buffer block");
        }
    }

    pub fn submit(&mut self, block: &Block) -> Result<bool, emberd_chainstate::ChainstateError> {
        self.state
            .process_new_block(block, i64::from(block.header.time))
    }

    /// Builds (and mines) a block on an arbitrary parent without submitting.
    pub fn build_on(
        &self,
        parent_hash: Hash256,
        height: i32,
        time: u32,
        txs: Vec<Transaction>,
        coinbase_script: Vec<u8>,
    ) -> Block {
        build_block(&self.params, parent_hash, height, time, txs, coinbase_script)
    }
}

pub fn genesis_block() -> Block {
    let params = regtest_params();
    build_block(&params, [0u8; 32], 0, GENESIS_TIME, Vec::new(), vec![0x6a])
}

/// Assembles a valid block: coinbase claiming the exact subsidy to the
/// given script, correct merkle root, and a nonce satisfying the target.
pub fn build_block(
    params: &ChainParams,
    parent_hash: Hash256,
    height: i32,
    time: u32,
    txs: Vec<Transaction>,
    coinbase_script: Vec<u8>,
) -> Block {
    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: block_subsidy(height, &params.consensus),
            script_pubkey: coinbase_script,
        }],
        lock_time: 0,
    };

    let mut transactions = vec![coinbase];
    transactions.extend(txs);
    let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    let (root, _) = merkle_root(&txids);

    let mut header = BlockHeader {
        version: CURRENT_BLOCK_VERSION,
        prev_block: parent_hash,
        merkle_root: root,
        time,
        bits: REGTEST_BITS,
        nonce: 0,
    };
    mine(&mut header, &params.consensus);
    Block {
        header,
        transactions,
    }
}

/// Searches nonces until the header satisfies its target.
pub fn mine(header: &mut BlockHeader, params: &emberd_consensus::ConsensusParams) {
    loop {
        if check_proof_of_work(&header.hash(), header.bits, params).is_ok() {
            return;
        }
        header.nonce = header.nonce.wrapping_add(1);
    }
}

/// A transaction moving `value` from `prevout` to an anyone-can-spend
/// output, leaving `fee` behind.
pub fn spend(prevout: OutPoint, value: i64, fee: i64, tag: u8) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout,
            script_sig: Vec::new(),
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: value - fee,
            // <tag> OP_DROP OP_1: anyone can spend, distinct per tag.
            script_pubkey: vec![0x01, tag, 0x75, 0x51],
        }],
        lock_time: 0,
    }
}
