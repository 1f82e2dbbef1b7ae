//! Pool state and indexes.

use std::collections::{HashMap, HashSet, VecDeque};

use emberd_consensus::Hash256;
use emberd_primitives::outpoint::OutPoint;
use emberd_primitives::transaction::Transaction;

use crate::entry::MempoolEntry;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MempoolErrorKind {
    AlreadyInMempool,
    ConflictingInput,
    InsufficientFee,
    MissingInput,
    MempoolFull,
    NonStandard,
    InvalidTransaction,
    InvalidScript,
    TooLongChain,
    HighFee,
    AlreadyKnown,
    Internal,
}

#[derive(Debug)]
pub struct MempoolError {
    pub kind: MempoolErrorKind,
    pub message: String,
    pub missing_inputs: Vec<OutPoint>,
}

impl MempoolError {
    pub fn new(kind: MempoolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            missing_inputs: Vec::new(),
        }
    }

    pub fn missing_inputs(missing_inputs: Vec<OutPoint>) -> Self {
        Self {
            kind: MempoolErrorKind::MissingInput,
            message: "missing inputs".to_string(),
            missing_inputs,
        }
    }
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MempoolError {}

/// Why an entry left the pool, forwarded to the removal listener.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RemovalReason {
    Expiry,
    SizeLimit,
    Reorg,
    Block,
    Conflict,
    Replaced,
}

pub type RemovalListener = Box<dyn FnMut(&Transaction, RemovalReason) + Send>;

#[derive(Clone, Copy, Debug, Default)]
pub struct Prioritisation {
    pub priority_delta: f64,
    pub fee_delta: i64,
}

#[derive(Clone, Debug)]
struct OrphanTx {
    txid: Hash256,
    raw: Vec<u8>,
    received: u64,
    missing_parents: Vec<Hash256>,
}

#[derive(Clone, Debug)]
pub struct MempoolPrevout {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

/// Half-life of the dynamic minimum feerate decay.
const ROLLING_FEE_HALFLIFE_SECS: u64 = 60 * 60 * 12;
/// Added on top of the feerate of evicted packages.
const MEMPOOL_FULL_FEE_INCREMENT_PER_KB: i64 = 1_000;
/// Rates below this fraction of the increment round down to zero.
const ROLLING_FEE_FLOOR: f64 = MEMPOOL_FULL_FEE_INCREMENT_PER_KB as f64 / 2.0;

const DEFAULT_MAX_ORPHANS: usize = 100;
const DEFAULT_MAX_ORPHAN_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_ORPHAN_TTL_SECS: u64 = 20 * 60;

pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    spent: HashMap<OutPoint, Hash256>,
    children: HashMap<Hash256, Vec<Hash256>>,
    prioritisations: HashMap<Hash256, Prioritisation>,
    orphans: HashMap<Hash256, OrphanTx>,
    orphans_by_parent: HashMap<Hash256, Vec<Hash256>>,
    orphan_bytes: usize,
    total_bytes: usize,
    max_bytes: usize,
    expiry_secs: u64,
    rolling_minimum_feerate: f64,
    last_rolling_fee_update: u64,
    block_since_last_rolling_fee_bump: bool,
    removal_listener: Option<RemovalListener>,
    revision: u64,
}

impl Mempool {
    pub fn new(max_bytes: usize, expiry_secs: u64) -> Self {
        Self {
            entries: HashMap::new(),
            spent: HashMap::new(),
            children: HashMap::new(),
            prioritisations: HashMap::new(),
            orphans: HashMap::new(),
            orphans_by_parent: HashMap::new(),
            orphan_bytes: 0,
            total_bytes: 0,
            max_bytes,
            expiry_secs,
            rolling_minimum_feerate: 0.0,
            last_rolling_fee_update: 0,
            block_since_last_rolling_fee_bump: false,
            removal_listener: None,
            revision: 0,
        }
    }

    pub fn set_removal_listener(&mut self, listener: RemovalListener) {
        self.removal_listener = Some(listener);
    }

    pub fn take_removal_listener(&mut self) -> Option<RemovalListener> {
        self.removal_listener.take()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn txids(&self) -> Vec<Hash256> {
        let mut out: Vec<_> = self.entries.keys().copied().collect();
        out.sort();
        out
    }

    pub fn entries(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    /// Output of an in-pool transaction, for the coins overlay.
    pub fn prevout(&self, outpoint: &OutPoint) -> Option<MempoolPrevout> {
        let entry = self.entries.get(&outpoint.txid)?;
        let index = usize::try_from(outpoint.index).ok()?;
        let txout = entry.tx.vout.get(index)?;
        Some(MempoolPrevout {
            value: txout.value,
            script_pubkey: txout.script_pubkey.clone(),
        })
    }

    pub fn prioritise_transaction(&mut self, txid: Hash256, priority_delta: f64, fee_delta: i64) {
        let delta = self.prioritisations.entry(txid).or_default();
        delta.priority_delta += priority_delta;
        delta.fee_delta = delta.fee_delta.saturating_add(fee_delta);
        if let Some(entry) = self.entries.get_mut(&txid) {
            entry.priority_delta += priority_delta;
            entry.fee_delta = entry.fee_delta.saturating_add(fee_delta);
        }
        self.revision = self.revision.saturating_add(1);
    }

    pub fn prioritisation(&self, txid: &Hash256) -> Option<Prioritisation> {
        self.prioritisations.get(txid).copied()
    }

    pub fn prioritisations(&self) -> impl Iterator<Item = (&Hash256, &Prioritisation)> {
        self.prioritisations.iter()
    }

    /// Inserts a fully-built entry. The caller has already validated the
    /// transaction; this only defends the pool's own invariants.
    pub fn insert(&mut self, mut entry: MempoolEntry) -> Result<(), MempoolError> {
        if self.entries.contains_key(&entry.txid) {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyInMempool,
                "transaction already in mempool",
            ));
        }
        for outpoint in &entry.spent_outpoints {
            if self.spent.contains_key(outpoint) {
                return Err(MempoolError::new(
                    MempoolErrorKind::ConflictingInput,
                    "input already spent in mempool",
                ));
            }
        }
        if let Some(delta) = self.prioritisations.get(&entry.txid) {
            entry.priority_delta += delta.priority_delta;
            entry.fee_delta = entry.fee_delta.saturating_add(delta.fee_delta);
        }

        let txid = entry.txid;
        for outpoint in &entry.spent_outpoints {
            self.spent.insert(outpoint.clone(), txid);
        }
        for parent in &entry.parents {
            let children = self.children.entry(*parent).or_default();
            if !children.contains(&txid) {
                children.push(txid);
            }
        }
        self.total_bytes = self.total_bytes.saturating_add(entry.raw.len());
        self.entries.insert(txid, entry);
        self.revision = self.revision.saturating_add(1);
        Ok(())
    }

    fn remove(&mut self, txid: &Hash256, reason: RemovalReason) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.raw.len());
        for outpoint in &entry.spent_outpoints {
            if self.spent.get(outpoint) == Some(txid) {
                self.spent.remove(outpoint);
            }
        }
        for parent in &entry.parents {
            let drop_parent_link = match self.children.get_mut(parent) {
                Some(children) => {
                    children.retain(|child| child != txid);
                    children.is_empty()
                }
                None => false,
            };
            if drop_parent_link {
                self.children.remove(parent);
            }
        }
        if let Some(children) = self.children.remove(txid) {
            for child in children {
                if let Some(child_entry) = self.entries.get_mut(&child) {
                    child_entry.parents.retain(|parent| parent != txid);
                }
            }
        }
        if let Some(listener) = self.removal_listener.as_mut() {
            listener(&entry.tx, reason);
        }
        self.revision = self.revision.saturating_add(1);
        Some(entry)
    }

    /// Removes a transaction and everything that descends from it, children
    /// before parents so the spent index stays coherent throughout.
    pub fn remove_with_descendants(
        &mut self,
        txid: &Hash256,
        reason: RemovalReason,
    ) -> Vec<MempoolEntry> {
        let mut order: Vec<Hash256> = Vec::new();
        let mut visited: HashSet<Hash256> = HashSet::new();

        fn visit(
            pool: &Mempool,
            txid: Hash256,
            visited: &mut HashSet<Hash256>,
            order: &mut Vec<Hash256>,
        ) {
            if !visited.insert(txid) {
                return;
            }
            if let Some(children) = pool.children.get(&txid) {
                for child in children {
                    visit(pool, *child, visited, order);
                }
            }
            order.push(txid);
        }

        visit(self, *txid, &mut visited, &mut order);

        let mut removed = Vec::new();
        for txid in order {
            if let Some(entry) = self.remove(&txid, reason) {
                removed.push(entry);
            }
        }
        removed
    }

    /// Updates the pool for a newly connected block: mined transactions
    /// leave with reason `Block`, transactions spending the same coins as a
    /// mined transaction leave (with their descendants) as `Conflict`.
    /// Returns the conflict transactions for notification.
    pub fn remove_for_block(&mut self, block_txs: &[Transaction]) -> Vec<Transaction> {
        let mut conflicts = Vec::new();
        for tx in block_txs {
            let txid = tx.txid();
            if self.entries.contains_key(&txid) {
                self.remove(&txid, RemovalReason::Block);
                continue;
            }
            for input in &tx.vin {
                if input.prevout.is_null() {
                    continue;
                }
                if let Some(conflict) = self.spent.get(&input.prevout).copied() {
                    let removed = self.remove_with_descendants(&conflict, RemovalReason::Conflict);
                    conflicts.extend(removed.into_iter().map(|entry| entry.tx));
                }
            }
        }
        self.block_since_last_rolling_fee_bump = true;
        conflicts
    }

    /// Drops entries older than the configured expiry, with descendants.
    pub fn expire(&mut self, now: u64) -> Vec<Hash256> {
        if self.expiry_secs == 0 {
            return Vec::new();
        }
        let cutoff = now.saturating_sub(self.expiry_secs);
        let stale: Vec<Hash256> = self
            .entries
            .values()
            .filter(|entry| entry.time <= cutoff)
            .map(|entry| entry.txid)
            .collect();
        let mut expired = Vec::new();
        for txid in stale {
            for entry in self.remove_with_descendants(&txid, RemovalReason::Expiry) {
                expired.push(entry.txid);
            }
        }
        expired
    }

    /// Evicts lowest-feerate packages until the pool fits its byte budget,
    /// raising the dynamic minimum feerate past the best evicted package.
    /// Returns evicted txids and the outpoints their entries spent.
    pub fn trim_to_size(&mut self, now: u64) -> (Vec<Hash256>, Vec<OutPoint>) {
        if self.max_bytes == 0 || self.total_bytes <= self.max_bytes {
            return (Vec::new(), Vec::new());
        }

        let mut candidates: Vec<(Hash256, i64, usize, u64)> = self
            .entries
            .values()
            .map(|entry| (entry.txid, entry.modified_fee(), entry.size().max(1), entry.time))
            .collect();
        // Lowest feerate first; cross-multiplied to avoid division, ties by
        // age then txid.
        candidates.sort_by(|a, b| {
            let left = i128::from(a.1) * (b.2 as i128);
            let right = i128::from(b.1) * (a.2 as i128);
            left.cmp(&right)
                .then_with(|| a.3.cmp(&b.3))
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut evicted = Vec::new();
        let mut evicted_outpoints = Vec::new();
        let mut max_evicted_feerate = 0i64;
        for (txid, _, _, _) in candidates {
            if self.total_bytes <= self.max_bytes {
                break;
            }
            let removed = self.remove_with_descendants(&txid, RemovalReason::SizeLimit);
            for entry in removed {
                max_evicted_feerate = max_evicted_feerate.max(entry.feerate_per_kb());
                evicted_outpoints.extend(entry.spent_outpoints.iter().cloned());
                evicted.push(entry.txid);
            }
        }

        if !evicted.is_empty() {
            let bumped =
                (max_evicted_feerate.saturating_add(MEMPOOL_FULL_FEE_INCREMENT_PER_KB)) as f64;
            if bumped > self.rolling_minimum_feerate {
                self.rolling_minimum_feerate = bumped;
                self.last_rolling_fee_update = now;
                self.block_since_last_rolling_fee_bump = false;
            }
            emberd_log::log_debug!(
                "mempool trimmed {} entries, min feerate now {}/kB",
                evicted.len(),
                self.rolling_minimum_feerate as i64
            );
        }
        (evicted, evicted_outpoints)
    }

    /// Dynamic minimum feerate, decaying by half every half-life since the
    /// last eviction bump once a block has been seen.
    pub fn min_feerate_per_kb(&mut self, now: u64) -> i64 {
        if self.rolling_minimum_feerate == 0.0 || !self.block_since_last_rolling_fee_bump {
            return self.rolling_minimum_feerate as i64;
        }
        let elapsed = now.saturating_sub(self.last_rolling_fee_update);
        if elapsed > 10 {
            let halvings = elapsed as f64 / ROLLING_FEE_HALFLIFE_SECS as f64;
            self.rolling_minimum_feerate /= 2f64.powf(halvings);
            self.last_rolling_fee_update = now;
            if self.rolling_minimum_feerate < ROLLING_FEE_FLOOR {
                self.rolling_minimum_feerate = 0.0;
                return 0;
            }
        }
        self.rolling_minimum_feerate as i64
    }

    /// Transitive in-pool ancestors of a prospective entry, bounded by count
    /// and total size.
    pub fn calculate_ancestors(
        &self,
        parents: &[Hash256],
        limit_count: usize,
        limit_size: usize,
    ) -> Result<HashSet<Hash256>, MempoolError> {
        let mut ancestors: HashSet<Hash256> = HashSet::new();
        let mut queue: VecDeque<Hash256> = parents.iter().copied().collect();
        let mut total_size = 0usize;
        while let Some(txid) = queue.pop_front() {
            let Some(entry) = self.entries.get(&txid) else {
                continue;
            };
            if !ancestors.insert(txid) {
                continue;
            }
            total_size += entry.size();
            if ancestors.len() > limit_count {
                return Err(MempoolError::new(
                    MempoolErrorKind::TooLongChain,
                    "too many in-mempool ancestors",
                ));
            }
            if total_size > limit_size {
                return Err(MempoolError::new(
                    MempoolErrorKind::TooLongChain,
                    "in-mempool ancestors exceed size limit",
                ));
            }
            for parent in &entry.parents {
                queue.push_back(*parent);
            }
        }
        Ok(ancestors)
    }

    /// Internal consistency walk: every input either resolves through
    /// `confirmed` (the coins view) or to another pool entry, the spent
    /// index matches the entries, and the parent graph has no cycles.
    pub fn check(&self, confirmed: impl Fn(&OutPoint) -> bool) {
        let mut seen_spends: HashMap<&OutPoint, Hash256> = HashMap::new();
        for entry in self.entries.values() {
            for input in &entry.tx.vin {
                let in_pool = self.entries.contains_key(&input.prevout.txid);
                assert!(
                    in_pool || confirmed(&input.prevout),
                    "mempool input does not resolve"
                );
                if in_pool {
                    assert!(
                        entry.parents.contains(&input.prevout.txid),
                        "missing parent link"
                    );
                }
                let previous = seen_spends.insert(&input.prevout, entry.txid);
                assert!(previous.is_none(), "double spend inside mempool");
                assert_eq!(self.spent.get(&input.prevout), Some(&entry.txid));
            }
        }
        // Cycle detection over parent links.
        let mut visiting: HashSet<Hash256> = HashSet::new();
        let mut done: HashSet<Hash256> = HashSet::new();
        for txid in self.entries.keys() {
            self.walk_parents(*txid, &mut visiting, &mut done);
        }
    }

    fn walk_parents(
        &self,
        txid: Hash256,
        visiting: &mut HashSet<Hash256>,
        done: &mut HashSet<Hash256>,
    ) {
        if done.contains(&txid) {
            return;
        }
        assert!(visiting.insert(txid), "cycle among mempool parents");
        if let Some(entry) = self.entries.get(&txid) {
            for parent in &entry.parents {
                self.walk_parents(*parent, visiting, done);
            }
        }
        visiting.remove(&txid);
        done.insert(txid);
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn has_orphan(&self, txid: &Hash256) -> bool {
        self.orphans.contains_key(txid)
    }

    /// Parks a transaction whose inputs are not yet known. Capped by count,
    /// bytes, and age; oldest evicted first.
    pub fn store_orphan(&mut self, txid: Hash256, raw: Vec<u8>, missing_inputs: &[OutPoint], now: u64) {
        let mut missing_parents: Vec<Hash256> = missing_inputs
            .iter()
            .filter(|outpoint| !outpoint.is_null())
            .map(|outpoint| outpoint.txid)
            .collect();
        missing_parents.sort();
        missing_parents.dedup();
        if missing_parents.is_empty() || raw.len() > DEFAULT_MAX_ORPHAN_BYTES {
            return;
        }

        self.prune_orphans(now);
        if self.orphans.contains_key(&txid) {
            self.remove_orphan(&txid);
        }
        while self.orphans.len() >= DEFAULT_MAX_ORPHANS
            || self.orphan_bytes.saturating_add(raw.len()) > DEFAULT_MAX_ORPHAN_BYTES
        {
            let oldest = self
                .orphans
                .values()
                .min_by_key(|orphan| orphan.received)
                .map(|orphan| orphan.txid);
            match oldest {
                Some(oldest) => {
                    self.remove_orphan(&oldest);
                }
                None => break,
            }
        }

        self.orphan_bytes = self.orphan_bytes.saturating_add(raw.len());
        for parent in &missing_parents {
            let children = self.orphans_by_parent.entry(*parent).or_default();
            if !children.contains(&txid) {
                children.push(txid);
            }
        }
        self.orphans.insert(
            txid,
            OrphanTx {
                txid,
                raw,
                received: now,
                missing_parents,
            },
        );
    }

    /// Pops orphans waiting on `parent_txid` for re-admission.
    pub fn take_orphans_for_parent(&mut self, parent_txid: &Hash256) -> Vec<(Hash256, Vec<u8>)> {
        let Some(txids) = self.orphans_by_parent.remove(parent_txid) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for txid in txids {
            if let Some(orphan) = self.remove_orphan(&txid) {
                out.push((orphan.txid, orphan.raw));
            }
        }
        out
    }

    fn prune_orphans(&mut self, now: u64) {
        let cutoff = now.saturating_sub(DEFAULT_ORPHAN_TTL_SECS);
        let stale: Vec<Hash256> = self
            .orphans
            .values()
            .filter(|orphan| orphan.received <= cutoff)
            .map(|orphan| orphan.txid)
            .collect();
        for txid in stale {
            self.remove_orphan(&txid);
        }
    }

    fn remove_orphan(&mut self, txid: &Hash256) -> Option<OrphanTx> {
        let orphan = self.orphans.remove(txid)?;
        self.orphan_bytes = self.orphan_bytes.saturating_sub(orphan.raw.len());
        let mut empty_parents = Vec::new();
        for parent in &orphan.missing_parents {
            if let Some(children) = self.orphans_by_parent.get_mut(parent) {
                children.retain(|child| child != txid);
                if children.is_empty() {
                    empty_parents.push(*parent);
                }
            }
        }
        for parent in empty_parents {
            self.orphans_by_parent.remove(&parent);
        }
        Some(orphan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LockPoints;
    use emberd_primitives::transaction::{TxIn, TxOut, SEQUENCE_FINAL};
    use std::sync::{Arc, Mutex};

    fn make_tx(vin: Vec<TxIn>, vout: Vec<TxOut>) -> Transaction {
        Transaction {
            version: 1,
            vin,
            vout,
            lock_time: 0,
        }
    }

    fn entry_for(tx: Transaction, fee: i64, parents: Vec<Hash256>, time: u64) -> MempoolEntry {
        let txid = tx.txid();
        let raw = tx.consensus_encode_to_vec();
        let spent_outpoints = tx.vin.iter().map(|input| input.prevout.clone()).collect();
        let size = raw.len();
        MempoolEntry {
            txid,
            tx,
            raw,
            time,
            height: 100,
            fee,
            fee_delta: 0,
            value_in: fee,
            modified_size: size,
            priority: 0.0,
            priority_delta: 0.0,
            sigops: 0,
            spends_coinbase: false,
            lock_points: LockPoints::default(),
            spent_outpoints,
            parents,
            was_clear_at_entry: true,
        }
    }

    fn chain_pair() -> (MempoolEntry, MempoolEntry) {
        let parent_tx = make_tx(
            vec![TxIn {
                prevout: OutPoint::new([0xaau8; 32], 0),
                script_sig: Vec::new(),
                sequence: SEQUENCE_FINAL,
            }],
            vec![TxOut {
                value: 40_000,
                script_pubkey: vec![0x51],
            }],
        );
        let parent_txid = parent_tx.txid();
        let child_tx = make_tx(
            vec![TxIn {
                prevout: OutPoint::new(parent_txid, 0),
                script_sig: Vec::new(),
                sequence: SEQUENCE_FINAL,
            }],
            vec![TxOut {
                value: 30_000,
                script_pubkey: vec![0x52],
            }],
        );
        (
            entry_for(parent_tx, 1_000, Vec::new(), 10),
            entry_for(child_tx, 1_000, vec![parent_txid], 11),
        )
    }

    #[test]
    fn conflicting_insert_is_rejected() {
        let (parent, _) = chain_pair();
        let outpoint = parent.spent_outpoints[0].clone();
        let mut pool = Mempool::new(1_000_000, 0);
        pool.insert(parent).expect("insert");

        let rival = entry_for(
            make_tx(
                vec![TxIn {
                    prevout: outpoint,
                    script_sig: vec![0x01],
                    sequence: SEQUENCE_FINAL,
                }],
                vec![TxOut {
                    value: 39_000,
                    script_pubkey: vec![0x53],
                }],
            ),
            2_000,
            Vec::new(),
            12,
        );
        let err = pool.insert(rival).unwrap_err();
        assert_eq!(err.kind, MempoolErrorKind::ConflictingInput);
    }

    #[test]
    fn removal_for_block_detaches_children() {
        let (parent, child) = chain_pair();
        let parent_tx = parent.tx.clone();
        let child_txid = child.txid;
        let mut pool = Mempool::new(1_000_000, 0);
        pool.insert(parent).expect("insert parent");
        pool.insert(child).expect("insert child");

        let conflicts = pool.remove_for_block(std::slice::from_ref(&parent_tx));
        assert!(conflicts.is_empty());
        assert!(!pool.contains(&parent_tx.txid()));
        let child_entry = pool.get(&child_txid).expect("child stays");
        assert!(child_entry.parents.is_empty());
    }

    #[test]
    fn conflicting_block_spend_evicts_descendants() {
        let (parent, child) = chain_pair();
        let spent = parent.spent_outpoints[0].clone();
        let parent_txid = parent.txid;
        let child_txid = child.txid;
        let mut pool = Mempool::new(1_000_000, 0);
        pool.insert(parent).expect("insert parent");
        pool.insert(child).expect("insert child");

        let removals = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&removals);
        pool.set_removal_listener(Box::new(move |tx, reason| {
            sink.lock().unwrap().push((tx.txid(), reason));
        }));

        // A block mines a different tx spending the parent's input.
        let rival = make_tx(
            vec![TxIn {
                prevout: spent,
                script_sig: vec![0x02],
                sequence: SEQUENCE_FINAL,
            }],
            vec![TxOut {
                value: 39_000,
                script_pubkey: vec![0x54],
            }],
        );
        let conflicts = pool.remove_for_block(std::slice::from_ref(&rival));
        let conflict_ids: HashSet<Hash256> = conflicts.iter().map(|tx| tx.txid()).collect();
        assert!(conflict_ids.contains(&parent_txid));
        assert!(conflict_ids.contains(&child_txid));
        assert_eq!(pool.size(), 0);

        let removals = removals.lock().unwrap();
        assert!(removals
            .iter()
            .all(|(_, reason)| *reason == RemovalReason::Conflict));
    }

    #[test]
    fn trim_evicts_lowest_feerate_and_bumps_min_fee() {
        let mut pool = Mempool::new(1, 0);
        let (parent, _) = chain_pair();
        pool.insert(parent).expect("insert");
        assert!(pool.bytes() > pool.max_bytes());

        let (evicted, _) = pool.trim_to_size(1_000);
        assert_eq!(evicted.len(), 1);
        assert_eq!(pool.size(), 0);
        assert!(pool.min_feerate_per_kb(1_000) > 0);
    }

    #[test]
    fn min_feerate_decays_after_blocks() {
        let mut pool = Mempool::new(1, 0);
        let (parent, _) = chain_pair();
        pool.insert(parent).expect("insert");
        pool.trim_to_size(1_000);
        let initial = pool.min_feerate_per_kb(1_000);
        assert!(initial > 0);

        pool.remove_for_block(&[]);
        let after_half_life = pool.min_feerate_per_kb(1_000 + ROLLING_FEE_HALFLIFE_SECS);
        assert!(after_half_life <= initial / 2 + 1);
        let after_ages = pool.min_feerate_per_kb(1_000 + ROLLING_FEE_HALFLIFE_SECS * 40);
        assert_eq!(after_ages, 0);
    }

    #[test]
    fn expiry_removes_descendants_too() {
        let (parent, child) = chain_pair();
        let mut pool = Mempool::new(1_000_000, 100);
        pool.insert(parent).expect("insert parent");
        pool.insert(child).expect("insert child");

        // Parent arrived at t=10; at t=200 it expires and takes the child.
        let expired = pool.expire(200);
        assert_eq!(expired.len(), 2);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn ancestor_limits_are_enforced() {
        let (parent, child) = chain_pair();
        let parent_txid = parent.txid;
        let mut pool = Mempool::new(1_000_000, 0);
        pool.insert(parent).expect("insert parent");
        pool.insert(child).expect("insert child");

        let ancestors = pool
            .calculate_ancestors(&[parent_txid], 25, 101_000)
            .expect("ancestors");
        assert_eq!(ancestors.len(), 1);

        let err = pool.calculate_ancestors(&[parent_txid], 0, 101_000).unwrap_err();
        assert_eq!(err.kind, MempoolErrorKind::TooLongChain);
    }

    #[test]
    fn consistency_check_passes_for_linked_entries() {
        let (parent, child) = chain_pair();
        let confirmed = parent.spent_outpoints[0].clone();
        let mut pool = Mempool::new(1_000_000, 0);
        pool.insert(parent).expect("insert parent");
        pool.insert(child).expect("insert child");
        pool.check(|outpoint| *outpoint == confirmed);
    }

    #[test]
    fn orphans_round_trip_by_parent() {
        let mut pool = Mempool::new(1_000_000, 0);
        let missing = OutPoint::new([0x77u8; 32], 1);
        let raw = vec![1, 2, 3];
        pool.store_orphan([0x01u8; 32], raw.clone(), std::slice::from_ref(&missing), 50);
        assert_eq!(pool.orphan_count(), 1);
        assert!(pool.has_orphan(&[0x01u8; 32]));

        let popped = pool.take_orphans_for_parent(&missing.txid);
        assert_eq!(popped, vec![([0x01u8; 32], raw)]);
        assert_eq!(pool.orphan_count(), 0);
    }
}
