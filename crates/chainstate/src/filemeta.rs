//! Per-file metadata for the block/undo flat files, persisted in the index
//! database and cached in memory with a dirty set.

use std::collections::HashSet;

use emberd_primitives::encoding::{Decoder, Encoder};
use emberd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub const META_LAST_BLOCK_FILE_KEY: &[u8] = b"files:last_block_file";
pub const META_PRUNED_FLAG_KEY: &[u8] = b"files:pruned";
pub const META_TXINDEX_FLAG_KEY: &[u8] = b"files:txindex";
pub const META_REINDEX_FLAG_KEY: &[u8] = b"files:reindexing";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockFileInfo {
    pub blocks: u32,
    pub size: u64,
    pub undo_size: u64,
    pub height_first: i32,
    pub height_last: i32,
    pub time_first: u32,
    pub time_last: u32,
}

impl BlockFileInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.blocks);
        encoder.write_u64_le(self.size);
        encoder.write_u64_le(self.undo_size);
        encoder.write_i32_le(self.height_first);
        encoder.write_i32_le(self.height_last);
        encoder.write_u32_le(self.time_first);
        encoder.write_u32_le(self.time_last);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut decoder = Decoder::new(bytes);
        let blocks = decoder.read_u32_le().ok()?;
        let size = decoder.read_u64_le().ok()?;
        let undo_size = decoder.read_u64_le().ok()?;
        let height_first = decoder.read_i32_le().ok()?;
        let height_last = decoder.read_i32_le().ok()?;
        let time_first = decoder.read_u32_le().ok()?;
        let time_last = decoder.read_u32_le().ok()?;
        if !decoder.is_empty() {
            return None;
        }
        Some(Self {
            blocks,
            size,
            undo_size,
            height_first,
            height_last,
            time_first,
            time_last,
        })
    }

    /// Folds a newly stored block into this file's ranges.
    pub fn add_block(&mut self, height: i32, time: u32, record_size: u64) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if self.blocks == 0 || time < self.time_first {
            self.time_first = time;
        }
        self.height_last = self.height_last.max(height);
        self.time_last = self.time_last.max(time);
        self.blocks += 1;
        self.size += record_size;
    }
}

pub fn file_info_key(file_id: u32) -> [u8; 4] {
    file_id.to_le_bytes()
}

/// In-memory view of every file's info plus which entries need persisting.
#[derive(Default)]
pub struct FileInfoSet {
    infos: Vec<BlockFileInfo>,
    dirty: HashSet<u32>,
    last_block_file: u32,
}

impl FileInfoSet {
    pub fn load<S: KeyValueStore>(store: &S) -> Result<Self, StoreError> {
        let mut set = Self::default();
        if let Some(bytes) = store.get(Column::Meta, META_LAST_BLOCK_FILE_KEY)? {
            if bytes.len() == 4 {
                set.last_block_file = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
        }
        for (key, value) in store.scan_prefix(Column::FileInfo, &[])? {
            if key.len() != 4 {
                continue;
            }
            let file_id = u32::from_le_bytes([key[0], key[1], key[2], key[3]]);
            let info = BlockFileInfo::decode(&value)
                .ok_or_else(|| StoreError::Backend("corrupt file info record".to_string()))?;
            set.ensure(file_id);
            set.infos[file_id as usize] = info;
        }
        Ok(set)
    }

    fn ensure(&mut self, file_id: u32) {
        while self.infos.len() <= file_id as usize {
            self.infos.push(BlockFileInfo::default());
        }
    }

    pub fn info(&self, file_id: u32) -> Option<&BlockFileInfo> {
        self.infos.get(file_id as usize)
    }

    pub fn info_mut(&mut self, file_id: u32) -> &mut BlockFileInfo {
        self.ensure(file_id);
        self.dirty.insert(file_id);
        self.last_block_file = self.last_block_file.max(file_id);
        &mut self.infos[file_id as usize]
    }

    pub fn last_block_file(&self) -> u32 {
        self.last_block_file
    }

    pub fn file_count(&self) -> usize {
        self.infos.len()
    }

    /// Files wholly below `height` (complete block files only).
    pub fn files_below_height(&self, height: i32, current_file: u32) -> Vec<u32> {
        self.infos
            .iter()
            .enumerate()
            .filter(|(file_id, info)| {
                *file_id as u32 != current_file && info.blocks > 0 && info.height_last < height
            })
            .map(|(file_id, _)| file_id as u32)
            .collect()
    }

    /// Writes dirty entries plus the last-file pointer into `batch` and
    /// clears the dirty set.
    pub fn flush(&mut self, batch: &mut WriteBatch) {
        for file_id in self.dirty.drain() {
            if let Some(info) = self.infos.get(file_id as usize) {
                batch.put(Column::FileInfo, file_info_key(file_id), info.encode());
            }
        }
        batch.put(
            Column::Meta,
            META_LAST_BLOCK_FILE_KEY,
            self.last_block_file.to_le_bytes(),
        );
    }
}
