//! The layered coins views: committed database, write-back caches, and the
//! mempool overlay. Layers share one operation set and compose by value.

use std::collections::{hash_map::Entry, HashMap};

use emberd_consensus::Hash256;
use emberd_mempool::{Mempool, MEMPOOL_HEIGHT};
use emberd_primitives::encoding::{DecodeError, Decoder, Encoder};
use emberd_primitives::outpoint::OutPoint;
use emberd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ChainstateError;

pub const OUTPOINT_KEY_LEN: usize = 36;

const META_COINS_BEST_BLOCK: &[u8] = b"coins:best_block";

/// One unspent transaction output with the metadata validation needs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub is_coinbase: bool,
}

impl Coin {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_u8(u8::from(self.is_coinbase));
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let is_coinbase = decoder.read_u8()? != 0;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            value,
            script_pubkey,
            height,
            is_coinbase,
        })
    }
}

pub fn outpoint_key(outpoint: &OutPoint) -> [u8; OUTPOINT_KEY_LEN] {
    let mut key = [0u8; OUTPOINT_KEY_LEN];
    key[..32].copy_from_slice(&outpoint.txid);
    key[32..].copy_from_slice(&outpoint.index.to_le_bytes());
    key
}

/// Uniform read operations every coins layer provides.
pub trait CoinsBackend {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainstateError>;

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, ChainstateError> {
        Ok(self.coin(outpoint)?.is_some())
    }

    fn best_block(&self) -> Result<Option<Hash256>, ChainstateError>;
}

impl<T: CoinsBackend + ?Sized> CoinsBackend for &T {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainstateError> {
        (**self).coin(outpoint)
    }

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, ChainstateError> {
        (**self).have_coin(outpoint)
    }

    fn best_block(&self) -> Result<Option<Hash256>, ChainstateError> {
        (**self).best_block()
    }
}

/// The committed coins set.
pub struct CoinsDb<S> {
    store: S,
}

impl<S> CoinsDb<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> CoinsBackend for CoinsDb<S> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainstateError> {
        let key = outpoint_key(outpoint);
        match self.store.get(Column::Coins, &key)? {
            Some(bytes) => Ok(Some(Coin::decode(&bytes).map_err(|_| {
                ChainstateError::Store(emberd_storage::StoreError::Backend(
                    "corrupt coin record".to_string(),
                ))
            })?)),
            None => Ok(None),
        }
    }

    fn best_block(&self) -> Result<Option<Hash256>, ChainstateError> {
        match self.store.get(Column::Meta, META_COINS_BEST_BLOCK)? {
            Some(bytes) if bytes.len() == 32 => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                Ok(Some(hash))
            }
            Some(_) => Err(ChainstateError::Store(
                emberd_storage::StoreError::Backend("corrupt best-block record".to_string()),
            )),
            None => Ok(None),
        }
    }
}

/// A cached coin. `dirty` means the entry differs from the layer below;
/// `fresh` means the layer below has never seen this coin, so spending it
/// before a flush erases it without any downstream write.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub coin: Option<Coin>,
    pub dirty: bool,
    pub fresh: bool,
}

/// Everything a drained cache hands to its parent layer.
pub struct CoinsModifications {
    pub entries: Vec<(OutPoint, CacheEntry)>,
    pub best_block: Option<Hash256>,
}

/// Write-back cache over another coins layer. The tip cache sits over the
/// database; per-validation scratch caches sit over the tip cache by
/// reference and are either discarded or drained into it.
pub struct CoinsCache<B> {
    base: B,
    entries: HashMap<OutPoint, CacheEntry>,
    best_block: Option<Hash256>,
}

impl<B: CoinsBackend> CoinsCache<B> {
    pub fn new(base: B) -> Self {
        Self {
            base,
            entries: HashMap::new(),
            best_block: None,
        }
    }

    pub fn base(&self) -> &B {
        &self.base
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Rough heap footprint of the cached entries, driving flush decisions.
    pub fn dynamic_usage(&self) -> usize {
        self.entries
            .values()
            .map(|entry| {
                96 + entry
                    .coin
                    .as_ref()
                    .map(|coin| coin.script_pubkey.len())
                    .unwrap_or(0)
            })
            .sum()
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = Some(hash);
    }

    /// Creates a coin. Overwriting an unspent coin is a contract violation
    /// unless `overwrite` is set (permitted only for the historical
    /// duplicate-coinbase blocks).
    pub fn add_coin(
        &mut self,
        outpoint: OutPoint,
        coin: Coin,
        overwrite: bool,
    ) -> Result<(), ChainstateError> {
        match self.entries.entry(outpoint) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.coin.is_some() && !overwrite {
                    debug_assert!(false, "overwriting unspent coin");
                    return Err(ChainstateError::Store(
                        emberd_storage::StoreError::Backend(
                            "attempted overwrite of unspent coin".to_string(),
                        ),
                    ));
                }
                // A fresh spent entry stays fresh: the layer below has still
                // never seen the coin.
                entry.coin = Some(coin);
                entry.dirty = true;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry {
                    coin: Some(coin),
                    dirty: true,
                    fresh: !overwrite,
                });
            }
        }
        Ok(())
    }

    /// Removes and returns a coin. Fresh entries vanish without marking
    /// anything dirty; known-below entries leave a dirty tombstone.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainstateError> {
        if let Some(entry) = self.entries.get_mut(outpoint) {
            let coin = entry.coin.take();
            if coin.is_none() {
                return Ok(None);
            }
            if entry.fresh {
                self.entries.remove(outpoint);
            } else {
                entry.dirty = true;
            }
            return Ok(coin);
        }

        match self.base.coin(outpoint)? {
            Some(coin) => {
                self.entries.insert(
                    outpoint.clone(),
                    CacheEntry {
                        coin: None,
                        dirty: true,
                        fresh: false,
                    },
                );
                Ok(Some(coin))
            }
            None => Ok(None),
        }
    }

    /// Removes an outpoint from the cache without touching lower layers,
    /// used when mempool eviction invalidates overlay reads.
    pub fn uncache(&mut self, outpoint: &OutPoint) {
        if let Some(entry) = self.entries.get(outpoint) {
            if !entry.dirty && !entry.fresh {
                self.entries.remove(outpoint);
            }
        }
    }

    /// Drains this cache for application to the parent layer.
    pub fn into_modifications(self) -> CoinsModifications {
        CoinsModifications {
            entries: self.entries.into_iter().collect(),
            best_block: self.best_block,
        }
    }

    /// Applies a child cache's drained state, preserving the dirty/fresh
    /// semantics: a fresh-and-spent child entry is a no-op, a child spend of
    /// a coin this layer created erases the entry entirely.
    pub fn apply_modifications(
        &mut self,
        modifications: CoinsModifications,
    ) -> Result<(), ChainstateError> {
        for (outpoint, child) in modifications.entries {
            if !child.dirty {
                continue;
            }
            match self.entries.entry(outpoint) {
                Entry::Vacant(vacant) => {
                    if !(child.fresh && child.coin.is_none()) {
                        vacant.insert(CacheEntry {
                            coin: child.coin,
                            dirty: true,
                            fresh: child.fresh,
                        });
                    }
                }
                Entry::Occupied(mut occupied) => {
                    if child.fresh && occupied.get().coin.is_some() {
                        return Err(ChainstateError::Store(
                            emberd_storage::StoreError::Backend(
                                "fresh child entry shadows existing coin".to_string(),
                            ),
                        ));
                    }
                    if occupied.get().fresh && child.coin.is_none() {
                        occupied.remove();
                    } else {
                        let entry = occupied.get_mut();
                        entry.coin = child.coin;
                        entry.dirty = true;
                    }
                }
            }
        }
        if let Some(best_block) = modifications.best_block {
            self.best_block = Some(best_block);
        }
        Ok(())
    }
}

impl<S: KeyValueStore> CoinsCache<CoinsDb<S>> {
    /// Writes every dirty entry and the best-block pointer into `batch` and
    /// clears the cache. The batch commits atomically at the storage layer.
    pub fn flush(&mut self, batch: &mut WriteBatch) -> Result<(), ChainstateError> {
        batch.reserve(self.entries.len() + 1);
        for (outpoint, entry) in self.entries.drain() {
            if !entry.dirty {
                continue;
            }
            let key = outpoint_key(&outpoint);
            match entry.coin {
                Some(coin) => batch.put(Column::Coins, key, coin.encode()),
                None => {
                    if !entry.fresh {
                        batch.delete(Column::Coins, key);
                    }
                }
            }
        }
        if let Some(best_block) = self.best_block {
            batch.put(Column::Meta, META_COINS_BEST_BLOCK, best_block);
        }
        Ok(())
    }
}

impl<B: CoinsBackend> CoinsBackend for CoinsCache<B> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainstateError> {
        if let Some(entry) = self.entries.get(outpoint) {
            return Ok(entry.coin.clone());
        }
        self.base.coin(outpoint)
    }

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, ChainstateError> {
        if let Some(entry) = self.entries.get(outpoint) {
            return Ok(entry.coin.is_some());
        }
        self.base.have_coin(outpoint)
    }

    fn best_block(&self) -> Result<Option<Hash256>, ChainstateError> {
        match self.best_block {
            Some(hash) => Ok(Some(hash)),
            None => self.base.best_block(),
        }
    }
}

/// Overlays unconfirmed outputs from the mempool at the sentinel height.
pub struct MempoolCoins<'a, B> {
    base: B,
    mempool: &'a Mempool,
}

impl<'a, B> MempoolCoins<'a, B> {
    pub fn new(base: B, mempool: &'a Mempool) -> Self {
        Self { base, mempool }
    }
}

impl<B: CoinsBackend> CoinsBackend for MempoolCoins<'_, B> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainstateError> {
        if let Some(coin) = self.base.coin(outpoint)? {
            return Ok(Some(coin));
        }
        Ok(self.mempool.prevout(outpoint).map(|prevout| Coin {
            value: prevout.value,
            script_pubkey: prevout.script_pubkey,
            height: MEMPOOL_HEIGHT,
            is_coinbase: false,
        }))
    }

    fn best_block(&self) -> Result<Option<Hash256>, ChainstateError> {
        self.base.best_block()
    }
}
