//! The chain state: one value owning the block index, the active chain, the
//! tip coins cache, the flat files, the embedded mempool, and the machinery
//! that moves the tip — connect/disconnect, the best-chain selector, and the
//! flush/prune controller.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use emberd_consensus::constants::{
    COINBASE_MATURITY, MAX_BLOCKS_PER_ACTIVATION_BATCH, MAX_TX_SIGOPS, MIN_BLOCKS_TO_KEEP,
    STANDARD_LOCKTIME_VERIFY_FLAGS,
};
use emberd_consensus::constants::max_block_sigops;
use emberd_consensus::{block_subsidy, ChainParams, Hash256};
use emberd_mempool::estimator::FeeEstimator;
use emberd_mempool::policy::FreeRelayLimiter;
use emberd_mempool::{Mempool, MempoolPolicy, RemovalReason};
use emberd_primitives::block::{Block, BlockHeader};
use emberd_primitives::encoding::{Decodable, Decoder};
use emberd_primitives::hash::sha256d;
use emberd_primitives::outpoint::OutPoint;
use emberd_primitives::transaction::Transaction;
use emberd_script::interpreter::{
    ScriptFlags, SCRIPT_ENABLE_SIGHASH_FORKID, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY,
    SCRIPT_VERIFY_CHECKSEQUENCEVERIFY, SCRIPT_VERIFY_DERSIG, SCRIPT_VERIFY_LOW_S,
    SCRIPT_VERIFY_NONE, SCRIPT_VERIFY_NULLFAIL, SCRIPT_VERIFY_P2SH, SCRIPT_VERIFY_STRICTENC,
};
use emberd_script::standard::{is_unspendable, p2sh_sigop_count};
use emberd_storage::{Column, KeyValueStore, WriteBatch};
use primitive_types::U256;

use crate::blockindex::{BlockIndex, NodeId, Validity, STATUS_HAVE_DATA, STATUS_HAVE_UNDO};
use crate::chain::ActiveChain;
use crate::checkqueue::{CheckQueue, ScriptCheck};
use crate::coins::{Coin, CoinsBackend, CoinsCache, CoinsDb};
use crate::error::{abort_node, ChainstateError, RejectCode, ValidationFailure};
use crate::events::{ChainNotifier, TxPosition};
use crate::filemeta::{FileInfoSet, META_PRUNED_FLAG_KEY, META_TXINDEX_FLAG_KEY};
use crate::flatfiles::{
    FileLocation, FlatFileStore, BLOCKFILE_CHUNK_SIZE, MAX_BLOCKFILE_SIZE, UNDOFILE_CHUNK_SIZE,
};
use crate::locks::{calculate_sequence_locks, evaluate_sequence_locks};
use crate::undo::{BlockUndo, TxUndo};
use crate::validate::{
    check_block, contextual_check_block, contextual_check_header, tx_legacy_sigops,
};

const DATABASE_WRITE_INTERVAL_SECS: u64 = 60 * 60;
const DATABASE_FLUSH_INTERVAL_SECS: u64 = 24 * 60 * 60;
const SCRIPT_CACHE_MAX_ENTRIES: usize = 100_000;
const UNDO_CHECKSUM_LEN: usize = 32;

#[derive(Clone, Debug)]
pub struct ChainStateConfig {
    /// Byte budget of the tip coins cache before a flush is forced.
    pub coins_cache_budget: usize,
    /// Script verification worker threads; zero verifies on the caller.
    pub script_check_threads: usize,
    pub mempool_max_bytes: usize,
    pub mempool_expiry_secs: u64,
    /// Maintain the transaction index.
    pub txindex: bool,
    /// Automatic pruning target in bytes; `None` keeps everything.
    pub prune_target_bytes: Option<u64>,
    pub require_standard: bool,
    pub min_relay_fee_per_kb: i64,
    /// Cap on individual block files; small values are useful in tests.
    pub max_block_file_size: u64,
}

impl Default for ChainStateConfig {
    fn default() -> Self {
        Self {
            coins_cache_budget: 64 * 1024 * 1024,
            script_check_threads: 0,
            mempool_max_bytes: 32 * 1024 * 1024,
            mempool_expiry_secs: 14 * 24 * 60 * 60,
            txindex: false,
            prune_target_bytes: None,
            require_standard: true,
            min_relay_fee_per_kb: 1_000,
            max_block_file_size: MAX_BLOCKFILE_SIZE,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushMode {
    None,
    IfNeeded,
    Periodic,
    Always,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectResult {
    Clean,
    /// The coins view stayed coherent but individual coins mismatched.
    Unclean,
    Failed,
}

/// Signals tip changes to threads blocked on `wait_for_tip_change`.
pub struct TipSignal {
    revision: Mutex<u64>,
    changed: Condvar,
}

impl TipSignal {
    fn new() -> Self {
        Self {
            revision: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    fn notify(&self) {
        let mut revision = self.revision.lock().expect("tip signal lock");
        *revision += 1;
        self.changed.notify_all();
    }

    pub fn revision(&self) -> u64 {
        *self.revision.lock().expect("tip signal lock")
    }

    /// Blocks until the revision moves past `seen` or the timeout elapses,
    /// returning the current revision.
    pub fn wait_for_tip_change(&self, seen: u64, timeout: Duration) -> u64 {
        let mut revision = self.revision.lock().expect("tip signal lock");
        let deadline = std::time::Instant::now() + timeout;
        while *revision <= seen {
            let now = std::time::Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(revision, deadline - now)
                .expect("tip signal lock");
            revision = guard;
        }
        *revision
    }
}

/// Caches txid+flags pairs whose input scripts already verified, so the
/// consensus re-check of mempool acceptance does not redo signature work.
pub(crate) struct ScriptCache {
    entries: HashSet<Hash256>,
}

impl ScriptCache {
    fn new() -> Self {
        Self {
            entries: HashSet::new(),
        }
    }

    pub(crate) fn key(txid: &Hash256, flags: ScriptFlags) -> Hash256 {
        let mut data = [0u8; 36];
        data[..32].copy_from_slice(txid);
        data[32..].copy_from_slice(&flags.to_le_bytes());
        sha256d(&data)
    }

    pub(crate) fn contains(&self, key: &Hash256) -> bool {
        self.entries.contains(key)
    }

    pub(crate) fn insert(&mut self, key: Hash256) {
        if self.entries.len() >= SCRIPT_CACHE_MAX_ENTRIES {
            self.entries.clear();
        }
        self.entries.insert(key);
    }
}

pub struct ChainState<S> {
    pub(crate) params: ChainParams,
    pub(crate) config: ChainStateConfig,
    pub(crate) store: Arc<S>,
    pub(crate) index: BlockIndex,
    pub(crate) chain: ActiveChain,
    pub(crate) coins: CoinsCache<CoinsDb<Arc<S>>>,
    pub(crate) block_files: FlatFileStore,
    pub(crate) undo_files: FlatFileStore,
    pub(crate) file_info: FileInfoSet,
    pub(crate) mempool: Mutex<Mempool>,
    pub(crate) estimator: Mutex<FeeEstimator>,
    pub(crate) free_relay: Mutex<FreeRelayLimiter>,
    pub(crate) script_cache: Mutex<ScriptCache>,
    pub(crate) mempool_policy: MempoolPolicy,
    check_queue: CheckQueue,
    pub(crate) notifier: Arc<dyn ChainNotifier>,
    pub(crate) shutdown: Arc<AtomicBool>,
    tip_signal: TipSignal,
    blocks_dir: PathBuf,
    precious_baseline: Option<U256>,
    files_to_prune: HashSet<u32>,
    last_write: u64,
    last_flush: u64,
}

struct ConnectOutcome {
    undo: BlockUndo,
    txids: Vec<Hash256>,
}

impl<S: KeyValueStore> ChainState<S> {
    pub fn new(
        store: Arc<S>,
        params: ChainParams,
        config: ChainStateConfig,
        blocks_dir: impl Into<PathBuf>,
        notifier: Arc<dyn ChainNotifier>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, ChainstateError> {
        let blocks_dir = blocks_dir.into();
        let file_info = FileInfoSet::load(&*store)?;
        let last_file = file_info.last_block_file();
        let block_len = file_info.info(last_file).map(|info| info.size).unwrap_or(0);
        let max_file_size = config.max_block_file_size;
        let block_files = FlatFileStore::open(
            &blocks_dir,
            "blk",
            params.magic,
            max_file_size,
            BLOCKFILE_CHUNK_SIZE.min(max_file_size),
            last_file,
            block_len,
        )?;
        let undo_files = FlatFileStore::open(
            &blocks_dir,
            "rev",
            params.magic,
            max_file_size,
            UNDOFILE_CHUNK_SIZE.min(max_file_size),
            0,
            0,
        )?;

        let index = BlockIndex::load_from_db(&*store)?;
        let coins = CoinsCache::new(CoinsDb::new(Arc::clone(&store)));
        let mempool = Mempool::new(config.mempool_max_bytes, config.mempool_expiry_secs);
        let mempool_policy =
            MempoolPolicy::standard(config.min_relay_fee_per_kb, config.require_standard);
        let check_queue = CheckQueue::new(config.script_check_threads);
        let now = unix_time();

        let mut state = Self {
            params,
            config,
            store,
            index,
            chain: ActiveChain::new(),
            coins,
            block_files,
            undo_files,
            file_info,
            mempool: Mutex::new(mempool),
            estimator: Mutex::new(FeeEstimator::new()),
            free_relay: Mutex::new(FreeRelayLimiter::default()),
            script_cache: Mutex::new(ScriptCache::new()),
            mempool_policy,
            check_queue,
            notifier,
            shutdown,
            tip_signal: TipSignal::new(),
            blocks_dir,
            precious_baseline: None,
            files_to_prune: HashSet::new(),
            last_write: now,
            last_flush: now,
        };

        // The active chain continues from the coins database's best block;
        // the two are consistent after any completed flush.
        if let Some(best) = state.coins.best_block()? {
            let tip = state
                .index
                .lookup(&best)
                .ok_or(ChainstateError::Abort("coins best block missing from index"))?;
            state.chain.set_tip(&state.index, Some(tip));
        }
        state.refill_candidates();
        if state.config.txindex {
            state
                .store
                .put(Column::Meta, META_TXINDEX_FLAG_KEY, &[1])?;
        }
        emberd_log::log_info!(
            "chain state loaded: {} headers, tip height {}",
            state.index.len(),
            state.chain.height()
        );
        Ok(state)
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn tip(&self) -> Option<NodeId> {
        self.chain.tip()
    }

    pub fn tip_hash(&self) -> Option<Hash256> {
        self.chain.tip().map(|id| self.index.node(id).hash)
    }

    pub fn tip_height(&self) -> i32 {
        self.chain.height()
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn chain(&self) -> &ActiveChain {
        &self.chain
    }

    pub fn coins(&self) -> &CoinsCache<CoinsDb<Arc<S>>> {
        &self.coins
    }

    pub fn mempool(&self) -> &Mutex<Mempool> {
        &self.mempool
    }

    pub fn tip_signal(&self) -> &TipSignal {
        &self.tip_signal
    }

    pub fn best_header(&self) -> Option<NodeId> {
        self.index.best_header()
    }

    fn tip_work(&self) -> U256 {
        self.chain
            .tip()
            .map(|id| self.index.node(id).chain_work)
            .unwrap_or_default()
    }

    /// Still syncing: the best chain carries less than the known minimum
    /// work or the tip is more than a day old.
    pub fn is_initial_block_download(&self) -> bool {
        let Some(tip) = self.chain.tip() else {
            return true;
        };
        let node = self.index.node(tip);
        let minimum = U256::from_big_endian(&self.params.consensus.minimum_chain_work);
        if node.chain_work < minimum {
            return true;
        }
        i64::from(node.header.time) < unix_time() as i64 - 24 * 60 * 60
    }

    // ---- header and block arrival -------------------------------------

    /// Validates and indexes a batch of headers in order.
    pub fn process_new_block_headers(
        &mut self,
        headers: &[BlockHeader],
        adjusted_time: i64,
    ) -> Result<Option<NodeId>, ChainstateError> {
        let mut last = None;
        for header in headers {
            last = Some(self.accept_block_header(header, adjusted_time)?);
        }
        Ok(last)
    }

    fn accept_block_header(
        &mut self,
        header: &BlockHeader,
        adjusted_time: i64,
    ) -> Result<NodeId, ChainstateError> {
        let hash = header.hash();
        if let Some(existing) = self.index.lookup(&hash) {
            if self.index.node(existing).failed() {
                return Err(ValidationFailure::invalid(
                    RejectCode::Duplicate,
                    "duplicate-invalid",
                )
                .into());
            }
            return Ok(existing);
        }

        emberd_pow::validation::check_proof_of_work(&hash, header.bits, &self.params.consensus)
            .map_err(|_| ValidationFailure::dos(50, RejectCode::Invalid, "high-hash"))?;

        let is_genesis = header.prev_block == [0u8; 32] && self.index.is_empty();
        if !is_genesis {
            let parent = self.index.lookup(&header.prev_block).ok_or_else(|| {
                ValidationFailure::dos(10, RejectCode::Invalid, "prev-blk-not-found")
            })?;
            if self.index.node(parent).failed() {
                return Err(
                    ValidationFailure::dos(100, RejectCode::Invalid, "bad-prevblk").into(),
                );
            }
            contextual_check_header(
                header,
                parent,
                &self.index,
                adjusted_time,
                &self.params.consensus,
            )?;
        }

        Ok(self.index.insert_header(header)?)
    }

    /// Full block arrival: context-free checks, header acceptance,
    /// contextual checks, storage, index linkage, then best-chain
    /// activation. Returns whether the block was new.
    pub fn process_new_block(
        &mut self,
        block: &Block,
        adjusted_time: i64,
    ) -> Result<bool, ChainstateError> {
        let hash = block.hash();
        let accepted = self.accept_block(block, adjusted_time);
        match &accepted {
            Ok(_) => self.notifier.block_checked(&hash, &Ok(())),
            Err(ChainstateError::Invalid(failure)) => {
                self.notifier.block_checked(&hash, &Err(failure.clone()));
            }
            Err(_) => {}
        }
        let new = accepted?;
        self.activate_best_chain()?;
        Ok(new)
    }

    fn accept_block(
        &mut self,
        block: &Block,
        adjusted_time: i64,
    ) -> Result<bool, ChainstateError> {
        check_block(block, &self.params.consensus, true)?;
        let node = self.accept_block_header(&block.header, adjusted_time)?;
        if self.index.node(node).have_data() {
            return Ok(false);
        }

        let parent = self.index.node(node).parent;
        if let Err(failure) =
            contextual_check_block(block, parent, &self.index, &self.params.consensus)
        {
            if !failure.corruption_possible {
                self.index.mark_failed(node);
            }
            return Err(failure.into());
        }

        let extends_best = match self.index.best_header() {
            Some(best) => self.index.is_ancestor(node, best) || best == node,
            None => true,
        };
        if extends_best {
            self.notifier
                .new_pow_valid_block(&self.index.node(node).hash, block);
        }

        let location = self.write_block(block, node)?;
        let connectable =
            self.index
                .receive_block_data(node, block.transactions.len() as u32, location);
        let tip_work = self.tip_work();
        for id in connectable {
            let candidate = self.index.node(id);
            if !candidate.failed() && candidate.chain_work >= tip_work {
                self.index.insert_candidate(id);
            }
        }
        Ok(true)
    }

    fn write_block(
        &mut self,
        block: &Block,
        node: NodeId,
    ) -> Result<FileLocation, ChainstateError> {
        let bytes = block.consensus_encode_to_vec();
        let location = self.block_files.append(&bytes).map_err(|err| {
            emberd_log::log_error!("failed to write block: {err}");
            abort_node(&self.shutdown, "block file write failed")
        })?;
        let height = self.index.node(node).height;
        self.file_info
            .info_mut(location.file_id)
            .add_block(height, block.header.time, 8 + bytes.len() as u64);
        Ok(location)
    }

    pub fn read_block(&self, node: NodeId) -> Result<Block, ChainstateError> {
        let meta = self.index.node(node);
        let location = meta.block_file.ok_or_else(|| {
            ChainstateError::Invalid(ValidationFailure::corruption("block data not available"))
        })?;
        let bytes = self.block_files.read(location)?;
        let block = decode_block(&bytes)?;
        if block.hash() != meta.hash {
            return Err(
                ValidationFailure::corruption("block file hash mismatch").into(),
            );
        }
        Ok(block)
    }

    fn read_undo(&self, node: NodeId) -> Result<BlockUndo, ChainstateError> {
        let meta = self.index.node(node);
        let location = meta.undo_file.ok_or_else(|| {
            ChainstateError::Invalid(ValidationFailure::corruption("undo data not available"))
        })?;
        let payload = self.undo_files.read(location)?;
        if payload.len() < UNDO_CHECKSUM_LEN {
            return Err(ValidationFailure::corruption("undo record truncated").into());
        }
        let (undo_bytes, checksum) = payload.split_at(payload.len() - UNDO_CHECKSUM_LEN);
        let parent_hash = meta
            .parent
            .map(|parent| self.index.node(parent).hash)
            .unwrap_or([0u8; 32]);
        let mut data = Vec::with_capacity(32 + undo_bytes.len());
        data.extend_from_slice(&parent_hash);
        data.extend_from_slice(undo_bytes);
        if sha256d(&data).as_slice() != checksum {
            return Err(ValidationFailure::corruption("undo checksum mismatch").into());
        }
        BlockUndo::decode(undo_bytes)
            .map_err(|_| ValidationFailure::corruption("undo record corrupt").into())
    }

    fn write_undo(&mut self, node: NodeId, undo: &BlockUndo) -> Result<(), ChainstateError> {
        let (file_id, parent_hash) = {
            let meta = self.index.node(node);
            if meta.have_undo() {
                return Ok(());
            }
            let file_id = meta
                .block_file
                .map(|location| location.file_id)
                .unwrap_or_else(|| self.block_files.current_position().0);
            let parent_hash = meta
                .parent
                .map(|parent| self.index.node(parent).hash)
                .unwrap_or([0u8; 32]);
            (file_id, parent_hash)
        };

        let undo_bytes = undo.encode();
        let mut payload = Vec::with_capacity(undo_bytes.len() + UNDO_CHECKSUM_LEN);
        payload.extend_from_slice(&undo_bytes);
        let mut data = Vec::with_capacity(32 + undo_bytes.len());
        data.extend_from_slice(&parent_hash);
        data.extend_from_slice(&undo_bytes);
        payload.extend_from_slice(&sha256d(&data));

        let offset = self
            .file_info
            .info(file_id)
            .map(|info| info.undo_size)
            .unwrap_or(0);
        let location = self
            .undo_files
            .append_at(file_id, offset, &payload)
            .map_err(|err| {
                emberd_log::log_error!("failed to write undo: {err}");
                abort_node(&self.shutdown, "undo file write failed")
            })?;
        self.file_info.info_mut(file_id).undo_size = offset + 8 + payload.len() as u64;

        let node_mut = self.index.node_mut(node);
        node_mut.undo_file = Some(location);
        node_mut.status |= STATUS_HAVE_UNDO;
        Ok(())
    }

    // ---- connect / disconnect -----------------------------------------

    /// Script flags and lock-time flags active for a block at `height`.
    pub(crate) fn flags_for_height(&self, height: i32) -> (ScriptFlags, u32) {
        let params = &self.params.consensus;
        let mut script_flags = SCRIPT_VERIFY_NONE;
        let mut lock_flags = 0u32;
        if height >= params.p2sh_height {
            script_flags |= SCRIPT_VERIFY_P2SH;
        }
        if height >= params.bip66_height {
            script_flags |= SCRIPT_VERIFY_DERSIG;
        }
        if height >= params.bip65_height {
            script_flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
        }
        if height >= params.csv_height {
            script_flags |= SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;
            lock_flags |= STANDARD_LOCKTIME_VERIFY_FLAGS;
        }
        if height >= params.uahf_height {
            script_flags |= SCRIPT_VERIFY_STRICTENC | SCRIPT_ENABLE_SIGHASH_FORKID;
        }
        if height >= params.low_s_height {
            script_flags |= SCRIPT_VERIFY_LOW_S | SCRIPT_VERIFY_NULLFAIL;
        }
        (script_flags, lock_flags)
    }

    /// Whether scripts of `node` may be assumed valid: it must be an
    /// ancestor of the configured assume-valid block and the best header
    /// chain must carry at least the minimum work.
    fn assume_valid_scripts(&self, node: NodeId) -> bool {
        let Some(assume_valid) = self.params.consensus.assume_valid else {
            return false;
        };
        let Some(valid_node) = self.index.lookup(&assume_valid) else {
            return false;
        };
        let Some(best_header) = self.index.best_header() else {
            return false;
        };
        let minimum = U256::from_big_endian(&self.params.consensus.minimum_chain_work);
        if self.index.node(best_header).chain_work < minimum {
            return false;
        }
        self.index.is_ancestor(node, valid_node)
    }

    /// Connects `node` on top of the current tip: full contextual per-input
    /// validation against a scratch view, parallel script verification,
    /// undo generation, then atomically folds the scratch into the tip
    /// cache and advances the chain. Returns the mempool conflicts the new
    /// block evicted.
    fn connect_tip(&mut self, node: NodeId) -> Result<Vec<Transaction>, ChainstateError> {
        let block = self.read_block(node)?;
        let check_scripts = !self.assume_valid_scripts(node);
        let hash = self.index.node(node).hash;

        let result = {
            let params = &self.params;
            let index = &self.index;
            let coins = &self.coins;
            let check_queue = &self.check_queue;
            let mut view = CoinsCache::new(coins);
            match connect_block(params, index, node, &block, &mut view, check_queue, check_scripts)
            {
                Ok(outcome) => {
                    view.set_best_block(hash);
                    Ok((view.into_modifications(), outcome))
                }
                Err(err) => Err(err),
            }
        };

        let (modifications, outcome) = match result {
            Ok(ok) => ok,
            Err(ChainstateError::Invalid(failure)) => {
                emberd_log::log_warn!(
                    "invalid block {}: {failure}",
                    hex_prefix(&hash)
                );
                if !failure.corruption_possible {
                    self.index.mark_failed(node);
                }
                return Err(failure.into());
            }
            Err(err) => return Err(err),
        };

        self.coins.apply_modifications(modifications)?;
        self.write_undo(node, &outcome.undo)?;
        {
            let node_mut = self.index.node_mut(node);
            if node_mut.validity < Validity::Scripts {
                node_mut.validity = Validity::Scripts;
            }
        }
        self.chain.set_tip(&self.index, Some(node));
        self.write_tx_index(node, &block, &outcome.txids)?;

        let height = self.index.node(node).height;
        let conflicts = {
            let mut pool = self.mempool.lock().expect("mempool lock");
            pool.remove_for_block(&block.transactions)
        };
        self.estimator
            .lock()
            .expect("estimator lock")
            .process_block(height, &outcome.txids);

        emberd_log::log_debug!(
            "connected block {} at height {height} ({} txs)",
            hex_prefix(&hash),
            block.transactions.len()
        );
        Ok(conflicts)
    }

    fn write_tx_index(
        &mut self,
        node: NodeId,
        block: &Block,
        txids: &[Hash256],
    ) -> Result<(), ChainstateError> {
        if !self.config.txindex {
            return Ok(());
        }
        let Some(location) = self.index.node(node).block_file else {
            return Ok(());
        };
        let offsets = block.tx_offsets();
        let mut batch = WriteBatch::new();
        batch.reserve(txids.len());
        for (txid, offset) in txids.iter().zip(offsets.iter()) {
            let mut value = [0u8; 20];
            value[..16].copy_from_slice(&location.encode());
            value[16..].copy_from_slice(&offset.to_le_bytes());
            batch.put(Column::TxIndex, *txid, value);
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Looks a transaction up through the transaction index.
    pub fn get_transaction(&self, txid: &Hash256) -> Result<Option<Transaction>, ChainstateError> {
        if !self.config.txindex {
            return Ok(None);
        }
        let Some(bytes) = self.store.get(Column::TxIndex, txid)? else {
            return Ok(None);
        };
        if bytes.len() != 20 {
            return Err(ValidationFailure::corruption("corrupt tx index entry").into());
        }
        let location = FileLocation::decode(&bytes[..16])
            .ok_or_else(|| ChainstateError::Invalid(ValidationFailure::corruption("corrupt tx index entry")))?;
        let offset = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]) as usize;
        let block_bytes = self.block_files.read(location)?;
        if offset >= block_bytes.len() {
            return Err(ValidationFailure::corruption("tx index offset out of range").into());
        }
        let mut decoder = Decoder::new(&block_bytes[offset..]);
        let tx = Transaction::consensus_decode(&mut decoder)
            .map_err(|_| ChainstateError::Invalid(ValidationFailure::corruption("corrupt indexed transaction")))?;
        Ok(Some(tx))
    }

    /// Disconnects the tip, restoring coins from undo data. Returns the
    /// non-coinbase transactions of the removed block for resurrection.
    fn disconnect_tip(&mut self) -> Result<Vec<Transaction>, ChainstateError> {
        let node = self.chain.tip().expect("disconnect without a tip");
        let block = self.read_block(node)?;
        let undo = self.read_undo(node)?;
        let parent = self.index.node(node).parent;
        let parent_hash = parent.map(|id| self.index.node(id).hash);

        let (modifications, result) = {
            let index = &self.index;
            let coins = &self.coins;
            let mut view = CoinsCache::new(coins);
            let result = disconnect_block(index, node, &block, &undo, &mut view)?;
            if result != DisconnectResult::Failed {
                view.set_best_block(parent_hash.unwrap_or([0u8; 32]));
            }
            (view.into_modifications(), result)
        };

        if result == DisconnectResult::Failed {
            return Err(abort_node(&self.shutdown, "block disconnect failed"));
        }
        if result == DisconnectResult::Unclean {
            emberd_log::log_warn!(
                "unclean disconnect of block {}",
                hex_prefix(&self.index.node(node).hash)
            );
        }

        self.coins.apply_modifications(modifications)?;
        self.chain.set_tip(&self.index, parent);
        emberd_log::log_debug!(
            "disconnected block {} to height {}",
            hex_prefix(&self.index.node(node).hash),
            self.chain.height()
        );
        Ok(block.transactions.iter().skip(1).cloned().collect())
    }

    // ---- best-chain selection and activation --------------------------

    /// Highest-work connectable candidate: walks the candidate set from the
    /// top, descending each candidate's ancestry; branches with failed or
    /// data-less ancestors are pruned from the set (data-less descendants
    /// move to the unlinked map) and the search restarts.
    fn find_most_work_chain(&mut self) -> Option<NodeId> {
        loop {
            let best = self.index.best_candidate()?;
            let mut test = best;
            let mut viable = true;
            loop {
                if self.chain.contains(&self.index, test) {
                    break;
                }
                let node = self.index.node(test);
                let failed = node.failed();
                let missing_data = !node.have_data();
                if failed || missing_data {
                    let mut walk = best;
                    loop {
                        if failed {
                            if walk == test {
                                self.index.remove_candidate(walk);
                            } else {
                                self.index.mark_failed_child(walk);
                            }
                        } else {
                            self.index.remove_candidate(walk);
                            self.index.push_unlinked(walk);
                        }
                        if walk == test {
                            break;
                        }
                        walk = self.index.node(walk).parent.expect("walk passes test");
                    }
                    viable = false;
                    break;
                }
                match self.index.node(test).parent {
                    Some(parent) => test = parent,
                    None => break,
                }
            }
            if viable {
                return Some(best);
            }
        }
    }

    /// Drives the active chain to the best available candidate, batching
    /// connections and publishing notifications in disconnect-then-connect
    /// order. Consensus-invalid candidates are marked and the search
    /// restarts; system errors abort.
    pub fn activate_best_chain(&mut self) -> Result<(), ChainstateError> {
        let start_tip = self.chain.tip();
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let Some(most_work) = self.find_most_work_chain() else {
                break;
            };
            if Some(most_work) == self.chain.tip() {
                break;
            }
            self.activate_step(most_work)?;
        }

        if self.chain.tip() != start_tip {
            if let Some(tip) = self.chain.tip() {
                let tip_hash = self.index.node(tip).hash;
                let fork_hash = start_tip
                    .and_then(|old| self.chain.find_fork(&self.index, old))
                    .map(|fork| self.index.node(fork).hash);
                self.index.prune_candidates(self.tip_work(), self.chain.tip());
                self.notifier.updated_block_tip(
                    &tip_hash,
                    fork_hash.as_ref(),
                    self.is_initial_block_download(),
                );
                let locator = self.block_locator();
                self.notifier.set_best_chain(&locator);
                self.tip_signal.notify();
            }
        }
        Ok(())
    }

    fn activate_step(&mut self, most_work: NodeId) -> Result<(), ChainstateError> {
        let fork = self.chain.find_fork(&self.index, most_work);
        let had_reorg = self.chain.tip() != fork && self.chain.tip().is_some();

        let mut disconnected: Vec<Transaction> = Vec::new();
        while self.chain.tip().is_some() && self.chain.tip() != fork {
            disconnected.extend(self.disconnect_tip()?);
        }

        let path = ActiveChain::path_from_fork(&self.index, fork, most_work);
        let mut connected: Vec<(Hash256, Vec<Transaction>)> = Vec::new();
        let mut conflict_evicted: Vec<Transaction> = Vec::new();
        for node in path.into_iter().take(MAX_BLOCKS_PER_ACTIVATION_BATCH) {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let block_hash = self.index.node(node).hash;
            match self.connect_tip(node) {
                Ok(conflicts) => {
                    conflict_evicted.extend(conflicts);
                    let block = self.read_block(node)?;
                    connected.push((block_hash, block.transactions));
                }
                Err(ChainstateError::Invalid(failure)) => {
                    if failure.corruption_possible {
                        // The node is unmarked so the block can be retried
                        // after a refetch; retrying in a loop here would spin.
                        return Err(ChainstateError::Invalid(failure));
                    }
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        // Resurrect transactions the reorg orphaned; everything that fails
        // re-admission is dropped here, with the reorg reason.
        let mined: HashSet<Hash256> = connected
            .iter()
            .flat_map(|(_, txs)| txs.iter().map(Transaction::txid))
            .collect();
        let mut not_in_block: Vec<Transaction> = Vec::new();
        let now = unix_time();
        for tx in disconnected {
            let txid = tx.txid();
            if !mined.contains(&txid) {
                let accept = crate::mempool_accept::accept_to_mempool(
                    self,
                    tx.clone(),
                    emberd_mempool::AcceptPolicy {
                        limit_free: false,
                        absurd_fee: None,
                        bypass_limits: true,
                    },
                    now as i64,
                );
                if accept.is_err() {
                    emberd_log::log_debug!(
                        "dropping reorged transaction {}",
                        hex_prefix(&txid)
                    );
                }
            }
            not_in_block.push(tx);
        }
        if had_reorg {
            not_in_block.extend(self.remove_stale_mempool_entries());
        }
        not_in_block.extend(conflict_evicted);

        // Disconnect-side events strictly precede connect-side events.
        for tx in &not_in_block {
            self.notifier
                .sync_transaction(tx, None, TxPosition::NotInBlock);
        }
        for (block_hash, txs) in &connected {
            for (position, tx) in txs.iter().enumerate() {
                self.notifier
                    .sync_transaction(tx, Some(block_hash), TxPosition::InBlock(position));
            }
        }

        self.flush(FlushMode::IfNeeded)?;
        Ok(())
    }

    /// Evicts mempool entries whose lock points or finality no longer hold
    /// on the reorganized chain.
    fn remove_stale_mempool_entries(&mut self) -> Vec<Transaction> {
        let next_height = self.chain.height() + 1;
        let cutoff_time = self
            .chain
            .tip()
            .map(|tip| self.index.median_time_past(tip))
            .unwrap_or(0);
        let mut stale: Vec<Hash256> = Vec::new();
        {
            let pool = self.mempool.lock().expect("mempool lock");
            for entry in pool.entries() {
                let lock_ok =
                    crate::locks::lock_points_valid(&self.index, &self.chain, &entry.lock_points)
                        && evaluate_sequence_locks(
                            next_height,
                            cutoff_time,
                            (entry.lock_points.height, entry.lock_points.time),
                        );
                let final_ok =
                    crate::validate::is_final_tx(&entry.tx, next_height, cutoff_time);
                let mature_ok = !entry.spends_coinbase
                    || entry.tx.vin.iter().all(|input| {
                        match self.coins.coin(&input.prevout) {
                            Ok(Some(coin)) => {
                                !coin.is_coinbase
                                    || next_height - coin.height as i32 >= COINBASE_MATURITY
                            }
                            _ => true,
                        }
                    });
                if !lock_ok || !final_ok || !mature_ok {
                    stale.push(entry.txid);
                }
            }
        }
        let mut removed_txs = Vec::new();
        let mut pool = self.mempool.lock().expect("mempool lock");
        for txid in stale {
            for entry in pool.remove_with_descendants(&txid, RemovalReason::Reorg) {
                removed_txs.push(entry.tx);
            }
        }
        removed_txs
    }

    fn refill_candidates(&mut self) {
        let tip_work = self.tip_work();
        let tip = self.chain.tip();
        for id in self.index.node_ids().collect::<Vec<_>>() {
            let node = self.index.node(id);
            let eligible = node.is_valid_at_least(Validity::Transactions)
                && node.chain_tx_count != 0
                && (node.chain_work >= tip_work || Some(id) == tip);
            if eligible {
                self.index.insert_candidate(id);
            }
        }
    }

    // ---- manual overrides ---------------------------------------------

    /// Marks a block invalid by operator decision and reorganizes away from
    /// it.
    pub fn invalidate_block(&mut self, hash: &Hash256) -> Result<(), ChainstateError> {
        let Some(target) = self.index.lookup(hash) else {
            return Err(ValidationFailure::invalid(RejectCode::Invalid, "block-not-found").into());
        };
        self.index.mark_failed(target);

        let mut disconnected: Vec<Transaction> = Vec::new();
        while self.chain.contains(&self.index, target) {
            let tip = self.chain.tip().expect("chain contains target");
            if tip != target {
                self.index.mark_failed_child(tip);
            }
            disconnected.extend(self.disconnect_tip()?);
        }

        self.refill_candidates();
        let now = unix_time();
        for tx in disconnected {
            let _ = crate::mempool_accept::accept_to_mempool(
                self,
                tx.clone(),
                emberd_mempool::AcceptPolicy {
                    limit_free: false,
                    absurd_fee: None,
                    bypass_limits: true,
                },
                now as i64,
            );
            self.notifier
                .sync_transaction(&tx, None, TxPosition::NotInBlock);
        }
        self.activate_best_chain()
    }

    /// Clears failure flags from a block, its descendants, and its
    /// ancestors, letting it compete for the best chain again.
    pub fn reconsider_block(&mut self, hash: &Hash256) -> Result<(), ChainstateError> {
        let Some(target) = self.index.lookup(hash) else {
            return Err(ValidationFailure::invalid(RejectCode::Invalid, "block-not-found").into());
        };

        for id in self.index.node_ids().collect::<Vec<_>>() {
            let related = id == target
                || self.index.is_ancestor(target, id)
                || self.index.is_ancestor(id, target);
            if related && self.index.node(id).failed() {
                let node = self.index.node_mut(id);
                node.status &= !crate::blockindex::STATUS_FAILED_MASK;
            }
        }
        self.refill_candidates();
        self.activate_best_chain()
    }

    /// Prefers this block among equal-work tips by granting it a fresh,
    /// most-negative sequence id.
    pub fn precious_block(&mut self, hash: &Hash256) -> Result<(), ChainstateError> {
        let Some(target) = self.index.lookup(hash) else {
            return Err(ValidationFailure::invalid(RejectCode::Invalid, "block-not-found").into());
        };
        if self.chain.contains(&self.index, target) {
            return Ok(());
        }
        let target_work = self.index.node(target).chain_work;
        // Anything below an earlier precious baseline cannot win a tie
        // anyway, so repeated calls with ever-weaker blocks are no-ops.
        if let Some(baseline) = self.precious_baseline {
            if target_work < baseline {
                return Ok(());
            }
        }
        if target_work <= self.tip_work() {
            self.precious_baseline = Some(self.tip_work());
        }
        self.index.set_precious(target);
        let node = self.index.node(target);
        if node.is_valid_at_least(Validity::Transactions) && node.chain_tx_count != 0 {
            self.index.insert_candidate(target);
        }
        self.activate_best_chain()
    }

    // ---- flush and prune ----------------------------------------------

    /// Writes state to disk per the requested mode. A full flush finalizes
    /// the active flat files, batches dirty index and file records, unlinks
    /// pruned files, then flushes the coins cache; the coins database best
    /// block therefore always matches a fully-persisted chain.
    pub fn flush(&mut self, mode: FlushMode) -> Result<(), ChainstateError> {
        if matches!(mode, FlushMode::None) {
            return Ok(());
        }
        let now = unix_time();
        let cache_needs_flush = self.coins.dynamic_usage() > self.config.coins_cache_budget;
        let periodic_write_due = now >= self.last_write + DATABASE_WRITE_INTERVAL_SECS;
        let full_flush_due = cache_needs_flush
            || now >= self.last_flush + DATABASE_FLUSH_INTERVAL_SECS
            || !self.files_to_prune.is_empty();

        let do_full = match mode {
            FlushMode::Always => true,
            FlushMode::IfNeeded => cache_needs_flush || !self.files_to_prune.is_empty(),
            FlushMode::Periodic => full_flush_due,
            FlushMode::None => false,
        };
        let do_write = do_full || (matches!(mode, FlushMode::Periodic) && periodic_write_due);
        if !do_write {
            return Ok(());
        }

        // (a) finalize the active files so their contents are durable
        // before the index references them.
        let (current_file, current_len) = self.block_files.current_position();
        self.block_files
            .finalize(current_file, current_len)
            .map_err(|_| abort_node(&self.shutdown, "block file finalize failed"))?;
        let undo_len = self
            .file_info
            .info(current_file)
            .map(|info| info.undo_size)
            .unwrap_or(0);
        self.undo_files
            .finalize(current_file, undo_len)
            .map_err(|_| abort_node(&self.shutdown, "undo file finalize failed"))?;

        // (b) one batched write of file infos, dirty index nodes, and the
        // last-file pointer.
        let mut batch = WriteBatch::new();
        self.file_info.flush(&mut batch);
        self.index.flush_to_db(&mut batch);
        if !self.files_to_prune.is_empty() {
            batch.put(Column::Meta, META_PRUNED_FLAG_KEY, &[1]);
        }
        self.store
            .write_batch(&batch)
            .map_err(|_| abort_node(&self.shutdown, "index database write failed"))?;
        self.last_write = now;

        // (c) unlink files selected for pruning.
        for file_id in std::mem::take(&mut self.files_to_prune) {
            let _ = self.block_files.remove_file(file_id);
            let _ = self.undo_files.remove_file(file_id);
            emberd_log::log_info!("pruned block file {file_id}");
        }

        // (d) flush the coins cache.
        if do_full {
            let mut batch = WriteBatch::new();
            self.coins.flush(&mut batch)?;
            self.store
                .write_batch(&batch)
                .map_err(|_| abort_node(&self.shutdown, "coins database write failed"))?;
            self.last_flush = now;
        }
        Ok(())
    }

    /// Manual pruning: releases block files entirely below `height` (and
    /// below the keep window).
    pub fn prune_block_files_manual(&mut self, height: i32) -> Result<(), ChainstateError> {
        let keep_from = self.chain.height() - MIN_BLOCKS_TO_KEEP;
        self.select_files_to_prune(height.min(keep_from));
        self.flush(FlushMode::Always)
    }

    /// Automatic pruning toward the configured size target.
    pub fn prune_to_target(&mut self) -> Result<(), ChainstateError> {
        let Some(target) = self.config.prune_target_bytes else {
            return Ok(());
        };
        let total: u64 = (0..self.file_info.file_count() as u32)
            .filter_map(|file_id| self.file_info.info(file_id))
            .map(|info| info.size + info.undo_size)
            .sum();
        if total <= target {
            return Ok(());
        }
        let keep_from = self.chain.height() - MIN_BLOCKS_TO_KEEP;
        self.select_files_to_prune(keep_from);
        Ok(())
    }

    fn select_files_to_prune(&mut self, below_height: i32) {
        let current = self.block_files.current_position().0;
        for file_id in self.file_info.files_below_height(below_height, current) {
            for node in self.index.nodes_in_file(file_id) {
                self.index.remove_unlinked(node);
                let node_mut = self.index.node_mut(node);
                node_mut.status &= !(STATUS_HAVE_DATA | STATUS_HAVE_UNDO);
                node_mut.block_file = None;
                node_mut.undo_file = None;
            }
            *self.file_info.info_mut(file_id) = Default::default();
            self.files_to_prune.insert(file_id);
            emberd_log::log_info!("selected block file {file_id} for pruning");
        }
    }

    // ---- auditing ------------------------------------------------------

    /// Walks back `depth` blocks from the tip re-validating stored data.
    /// Level 1 re-runs context-free block checks, level 2 verifies undo
    /// records, level 3 additionally replays disconnects against a scratch
    /// view.
    pub fn verify_db(&self, level: u32, depth: i32) -> Result<(), ChainstateError> {
        let mut remaining = depth;
        let mut current = self.chain.tip();
        let mut view = CoinsCache::new(&self.coins);
        while let Some(node) = current {
            if remaining <= 0 || self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let meta = self.index.node(node);
            if !meta.have_data() {
                break;
            }
            let block = self.read_block(node)?;
            if level >= 1 {
                check_block(&block, &self.params.consensus, true)?;
            }
            if level >= 2 && meta.have_undo() {
                let undo = self.read_undo(node)?;
                if level >= 3 {
                    let result = disconnect_block(&self.index, node, &block, &undo, &mut view)?;
                    if result == DisconnectResult::Failed {
                        return Err(
                            ValidationFailure::corruption("disconnect replay failed").into()
                        );
                    }
                    let parent_hash = meta
                        .parent
                        .map(|parent| self.index.node(parent).hash)
                        .unwrap_or([0u8; 32]);
                    view.set_best_block(parent_hash);
                }
            }
            current = meta.parent;
            remaining -= 1;
        }
        Ok(())
    }

    /// Disconnects active blocks that never reached full script validation,
    /// so they are fetched and validated again under the current rules.
    pub fn rewind_block_index(&mut self) -> Result<(), ChainstateError> {
        while let Some(tip) = self.chain.tip() {
            if self.index.node(tip).is_valid_at_least(Validity::Scripts) {
                break;
            }
            let dropped = self.disconnect_tip()?;
            for tx in &dropped {
                self.notifier
                    .sync_transaction(tx, None, TxPosition::NotInBlock);
            }
        }
        self.refill_candidates();
        self.activate_best_chain()
    }

    /// Writes the current pool to `mempool.dat`.
    pub fn dump_mempool(&self, path: &std::path::Path) -> std::io::Result<()> {
        let pool = self.mempool.lock().expect("mempool lock");
        emberd_mempool::persist::dump_to_path(&pool, path)
    }

    /// Best-effort reload of a persisted pool: every transaction passes the
    /// full admission pipeline again. Returns (accepted, failed).
    pub fn load_mempool(
        &mut self,
        path: &std::path::Path,
        adjusted_time: i64,
    ) -> std::io::Result<(usize, usize)> {
        let (file, mut failed) = emberd_mempool::persist::load_from_path(path)?;
        // Restore prioritisations first so admission folds them in.
        {
            let mut pool = self.mempool.lock().expect("mempool lock");
            for (txid, priority_delta, fee_delta) in file.priority_deltas {
                pool.prioritise_transaction(txid, priority_delta, fee_delta);
            }
        }
        let mut accepted = 0usize;
        for record in file.txs {
            let Ok(tx) = emberd_primitives::encoding::decode::<Transaction>(&record.raw) else {
                failed += 1;
                continue;
            };
            match crate::mempool_accept::accept_to_mempool(
                self,
                tx,
                emberd_mempool::AcceptPolicy {
                    limit_free: false,
                    absurd_fee: None,
                    bypass_limits: false,
                },
                adjusted_time,
            ) {
                Ok(_) => accepted += 1,
                Err(_) => failed += 1,
            }
        }
        emberd_log::log_info!("loaded mempool: {accepted} accepted, {failed} failed");
        Ok((accepted, failed))
    }

    /// Exponentially-spaced sample of active-chain hashes back to genesis.
    pub fn block_locator(&self) -> Vec<Hash256> {
        let mut locator = Vec::new();
        let mut step = 1i32;
        let mut height = self.chain.height();
        while height > 0 {
            if let Some(id) = self.chain.at(height) {
                locator.push(self.index.node(id).hash);
            }
            if locator.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        if let Some(genesis) = self.chain.at(0) {
            locator.push(self.index.node(genesis).hash);
        }
        locator
    }

    /// Computes BIP68 lock points for a loose transaction against the next
    /// block, reading input heights through `view`.
    pub(crate) fn check_sequence_locks<B: CoinsBackend>(
        &self,
        tx: &Transaction,
        view: &B,
    ) -> Result<Option<crate::locks::LockPoints>, ChainstateError> {
        let Some(tip) = self.chain.tip() else {
            return Ok(Some(crate::locks::LockPoints::default()));
        };
        let next_height = self.chain.height() + 1;

        let mut prev_heights = Vec::with_capacity(tx.vin.len());
        for input in &tx.vin {
            let Some(coin) = view.coin(&input.prevout)? else {
                return Ok(None);
            };
            let height = if coin.height == emberd_mempool::MEMPOOL_HEIGHT {
                next_height
            } else {
                coin.height as i32
            };
            prev_heights.push(height);
        }

        let locks = calculate_sequence_locks(
            tx,
            STANDARD_LOCKTIME_VERIFY_FLAGS,
            &prev_heights,
            &self.index,
            Some(tip),
        );
        let parent_mtp = self.index.median_time_past(tip);
        if !evaluate_sequence_locks(next_height, parent_mtp, locks) {
            return Ok(None);
        }

        let max_input_height = prev_heights
            .iter()
            .copied()
            .filter(|height| *height < next_height)
            .max();
        let max_input_block = max_input_height
            .and_then(|height| self.chain.at(height))
            .map(|id| self.index.node(id).hash);
        Ok(Some(crate::locks::LockPoints {
            height: locks.0,
            time: locks.1,
            max_input_block,
        }))
    }
}

/// Applies a block to `view` with full contextual validation, producing the
/// undo record. The view is a scratch layer; on failure the caller discards
/// it, so partial mutation is harmless.
fn connect_block<B: CoinsBackend>(
    params: &ChainParams,
    index: &BlockIndex,
    node: NodeId,
    block: &Block,
    view: &mut CoinsCache<B>,
    check_queue: &CheckQueue,
    check_scripts: bool,
) -> Result<ConnectOutcome, ChainstateError> {
    let consensus = &params.consensus;
    let meta = index.node(node);
    let height = meta.height;
    let txids: Vec<Hash256> = block.transactions.iter().map(Transaction::txid).collect();

    match meta.parent {
        Some(parent) => {
            let expected = index.node(parent).hash;
            assert_eq!(
                view.best_block()?,
                Some(expected),
                "connect against wrong view"
            );
        }
        None => {
            // Genesis: its coinbase is unspendable by convention; connecting
            // only establishes the best block.
            return Ok(ConnectOutcome {
                undo: BlockUndo::default(),
                txids,
            });
        }
    }

    let parent_mtp = meta
        .parent
        .map(|parent| index.median_time_past(parent))
        .unwrap_or(0);

    let mut script_flags = SCRIPT_VERIFY_NONE;
    let mut lock_flags = 0u32;
    {
        // Same schedule as ChainState::flags_for_height, inlined here so the
        // function stays free of the full state.
        if height >= consensus.p2sh_height {
            script_flags |= SCRIPT_VERIFY_P2SH;
        }
        if height >= consensus.bip66_height {
            script_flags |= SCRIPT_VERIFY_DERSIG;
        }
        if height >= consensus.bip65_height {
            script_flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
        }
        if height >= consensus.csv_height {
            script_flags |= SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;
            lock_flags |= STANDARD_LOCKTIME_VERIFY_FLAGS;
        }
        if height >= consensus.uahf_height {
            script_flags |= SCRIPT_VERIFY_STRICTENC | SCRIPT_ENABLE_SIGHASH_FORKID;
        }
        if height >= consensus.low_s_height {
            script_flags |= SCRIPT_VERIFY_LOW_S | SCRIPT_VERIFY_NULLFAIL;
        }
    }

    // Duplicate-coinbase protection: outputs of earlier transactions with
    // the same id must be gone, except in the two historical blocks that
    // are allowed to overwrite.
    let bip30_exempt = consensus
        .bip30_exceptions
        .iter()
        .any(|exception| exception.height == height && exception.hash == meta.hash);
    let enforce_bip30 = !bip30_exempt && height < consensus.bip34_height;
    if enforce_bip30 {
        for (tx, txid) in block.transactions.iter().zip(txids.iter()) {
            for output_index in 0..tx.vout.len() as u32 {
                if view.have_coin(&OutPoint::new(*txid, output_index))? {
                    return Err(ValidationFailure::dos(
                        100,
                        RejectCode::Invalid,
                        "bad-txns-BIP30",
                    )
                    .into());
                }
            }
        }
    }

    let mut control = check_queue.control();
    let mut undo = BlockUndo::default();
    let mut fees = 0i64;
    let mut block_sigops = 0u32;
    let sigops_limit = max_block_sigops(block.serialized_size() as u64);

    for (tx_index, tx) in block.transactions.iter().enumerate() {
        let txid = txids[tx_index];
        let is_coinbase = tx_index == 0;
        let mut tx_sigops = tx_legacy_sigops(tx);

        if !is_coinbase {
            let mut tx_undo = TxUndo::default();
            let mut value_in = 0i64;
            let mut prev_heights = Vec::with_capacity(tx.vin.len());
            let mut checks = Vec::with_capacity(tx.vin.len());
            let tx_arc = Arc::new(tx.clone());

            for (input_index, input) in tx.vin.iter().enumerate() {
                let coin = view.spend_coin(&input.prevout)?.ok_or_else(|| {
                    ValidationFailure::dos(100, RejectCode::Invalid, "bad-txns-inputs-missingorspent")
                        .with_debug(format!(
                            "input {input_index} of {}",
                            hex_prefix(&txid)
                        ))
                })?;

                if coin.is_coinbase && height - (coin.height as i32) < COINBASE_MATURITY {
                    return Err(ValidationFailure::dos(
                        100,
                        RejectCode::Invalid,
                        "bad-txns-premature-spend-of-coinbase",
                    )
                    .into());
                }

                value_in = value_in
                    .checked_add(coin.value)
                    .ok_or_else(|| {
                        ValidationFailure::dos(100, RejectCode::Invalid, "bad-txns-inputvalues-outofrange")
                    })?;
                prev_heights.push(coin.height as i32);

                if (script_flags & SCRIPT_VERIFY_P2SH) != 0 {
                    tx_sigops = tx_sigops
                        .saturating_add(p2sh_sigop_count(&coin.script_pubkey, &input.script_sig));
                }

                if check_scripts {
                    checks.push(ScriptCheck {
                        tx: Arc::clone(&tx_arc),
                        input_index,
                        script_pubkey: coin.script_pubkey.clone(),
                        amount: coin.value,
                        flags: script_flags,
                    });
                }
                tx_undo.spent.push(coin);
            }

            let locks =
                calculate_sequence_locks(tx, lock_flags, &prev_heights, index, meta.parent);
            if !evaluate_sequence_locks(height, parent_mtp, locks) {
                return Err(ValidationFailure::dos(
                    100,
                    RejectCode::Invalid,
                    "bad-txns-nonfinal",
                )
                .with_debug("non-BIP68-final")
                .into());
            }

            let value_out: i64 = tx.vout.iter().map(|output| output.value).sum();
            if value_in < value_out {
                return Err(ValidationFailure::dos(
                    100,
                    RejectCode::Invalid,
                    "bad-txns-in-belowout",
                )
                .into());
            }
            fees = fees.checked_add(value_in - value_out).ok_or_else(|| {
                ValidationFailure::dos(100, RejectCode::Invalid, "bad-txns-fee-outofrange")
            })?;

            control.add(checks);
            undo.txs.push(tx_undo);
        }

        if tx_sigops > MAX_TX_SIGOPS {
            return Err(
                ValidationFailure::dos(100, RejectCode::Invalid, "bad-txns-too-many-sigops").into(),
            );
        }
        block_sigops = block_sigops.saturating_add(tx_sigops);
        if block_sigops > sigops_limit {
            return Err(ValidationFailure::dos(100, RejectCode::Invalid, "bad-blk-sigops").into());
        }

        for (output_index, output) in tx.vout.iter().enumerate() {
            if is_unspendable(&output.script_pubkey) {
                continue;
            }
            view.add_coin(
                OutPoint::new(txid, output_index as u32),
                Coin {
                    value: output.value,
                    script_pubkey: output.script_pubkey.clone(),
                    height: height as u32,
                    is_coinbase,
                },
                !enforce_bip30,
            )?;
        }
    }

    let coinbase_value: i64 = block.transactions[0]
        .vout
        .iter()
        .map(|output| output.value)
        .sum();
    let allowed = block_subsidy(height, consensus)
        .checked_add(fees)
        .ok_or_else(|| {
            ValidationFailure::dos(100, RejectCode::Invalid, "bad-txns-fee-outofrange")
        })?;
    if coinbase_value > allowed {
        return Err(ValidationFailure::dos(100, RejectCode::Invalid, "bad-cb-amount")
            .with_debug(format!("claimed {coinbase_value}, allowed {allowed}"))
            .into());
    }

    if !control.wait() {
        return Err(ValidationFailure::dos(
            100,
            RejectCode::Invalid,
            "mandatory-script-verify-flag-failed",
        )
        .into());
    }

    Ok(ConnectOutcome { undo, txids })
}

/// Inverts a block against `view` using its undo record. Mismatches are
/// reported and degrade the result to `Unclean` without stopping, so a
/// coherent view remains for further work; structural impossibilities
/// return `Failed`.
fn disconnect_block<B: CoinsBackend>(
    index: &BlockIndex,
    node: NodeId,
    block: &Block,
    undo: &BlockUndo,
    view: &mut CoinsCache<B>,
) -> Result<DisconnectResult, ChainstateError> {
    let meta = index.node(node);
    assert_eq!(
        view.best_block()?,
        Some(meta.hash),
        "disconnect against wrong view"
    );

    if undo.txs.len() + 1 != block.transactions.len() {
        emberd_log::log_error!("undo record has wrong transaction count");
        return Ok(DisconnectResult::Failed);
    }

    let mut clean = true;
    for (tx_index, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();

        // Remove the outputs this transaction created.
        for (output_index, output) in tx.vout.iter().enumerate() {
            if is_unspendable(&output.script_pubkey) {
                continue;
            }
            let outpoint = OutPoint::new(txid, output_index as u32);
            match view.spend_coin(&outpoint)? {
                Some(coin) => {
                    if coin.value != output.value || coin.script_pubkey != output.script_pubkey {
                        emberd_log::log_warn!(
                            "disconnect: output mismatch at {}:{output_index}",
                            hex_prefix(&txid)
                        );
                        clean = false;
                    }
                }
                None => {
                    emberd_log::log_warn!(
                        "disconnect: missing output {}:{output_index}",
                        hex_prefix(&txid)
                    );
                    clean = false;
                }
            }
        }

        // Restore the coins it spent.
        if tx_index > 0 {
            let tx_undo = &undo.txs[tx_index - 1];
            if tx_undo.spent.len() != tx.vin.len() {
                emberd_log::log_error!("undo record has wrong input count");
                return Ok(DisconnectResult::Failed);
            }
            for (input, spent) in tx.vin.iter().zip(tx_undo.spent.iter()).rev() {
                let mut coin = spent.clone();
                if coin.height == 0 && !coin.is_coinbase {
                    // Metadata-less legacy record: recover the height and
                    // coinbase flag from a sibling output still unspent.
                    for sibling_index in 0..128u32 {
                        if let Some(sibling) =
                            view.coin(&OutPoint::new(input.prevout.txid, sibling_index))?
                        {
                            coin.height = sibling.height;
                            coin.is_coinbase = sibling.is_coinbase;
                            break;
                        }
                    }
                }
                if view.have_coin(&input.prevout)? {
                    clean = false;
                }
                view.add_coin(input.prevout.clone(), coin, true)?;
            }
        }
    }

    Ok(if clean {
        DisconnectResult::Clean
    } else {
        DisconnectResult::Unclean
    })
}

fn decode_block(bytes: &[u8]) -> Result<Block, ChainstateError> {
    let mut decoder = Decoder::new(bytes);
    let block = Block::consensus_decode(&mut decoder)
        .map_err(|_| ChainstateError::Invalid(ValidationFailure::corruption("block decode failed")))?;
    if !decoder.is_empty() {
        return Err(ValidationFailure::corruption("trailing bytes after block").into());
    }
    Ok(block)
}

pub(crate) fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

pub(crate) fn hex_prefix(hash: &Hash256) -> String {
    let mut out = String::with_capacity(16);
    for byte in hash.iter().rev().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
