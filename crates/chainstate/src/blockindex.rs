//! In-memory forest of every header ever seen, with validity tracking, the
//! best-tip candidate set, and the unlinked map for blocks whose ancestors
//! still lack data. Nodes are arena-allocated and addressed by index; they
//! are never removed at runtime.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use emberd_consensus::constants::MEDIAN_TIME_SPAN;
use emberd_consensus::Hash256;
use emberd_pow::difficulty::block_proof;
use emberd_primitives::block::BlockHeader;
use emberd_primitives::encoding::{Decodable, Decoder, Encodable, Encoder};
use emberd_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;

use crate::error::{RejectCode, ValidationFailure};
use crate::flatfiles::FileLocation;

pub type NodeId = usize;

/// How far validation has gotten on a node, in increasing order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Validity {
    /// Header checked for proof of work.
    Header = 1,
    /// Parent found, height and work computed.
    Tree = 2,
    /// Block data received and context-free checks passed.
    Transactions = 3,
    /// Contextual checks against the chain passed.
    Chain = 4,
    /// Scripts verified; fully valid.
    Scripts = 5,
}

impl Validity {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Validity::Header),
            2 => Some(Validity::Tree),
            3 => Some(Validity::Transactions),
            4 => Some(Validity::Chain),
            5 => Some(Validity::Scripts),
            _ => None,
        }
    }
}

pub const STATUS_HAVE_DATA: u8 = 1 << 0;
pub const STATUS_HAVE_UNDO: u8 = 1 << 1;
pub const STATUS_FAILED_VALID: u8 = 1 << 2;
pub const STATUS_FAILED_CHILD: u8 = 1 << 3;
pub const STATUS_FAILED_MASK: u8 = STATUS_FAILED_VALID | STATUS_FAILED_CHILD;

#[derive(Clone, Debug)]
pub struct BlockNode {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub parent: Option<NodeId>,
    pub skip: Option<NodeId>,
    pub height: i32,
    pub chain_work: U256,
    /// Transactions in this block; zero until data arrives.
    pub tx_count: u32,
    /// Transactions on the chain up to and including this block; zero until
    /// every ancestor has had its data.
    pub chain_tx_count: u64,
    pub validity: Validity,
    pub status: u8,
    pub block_file: Option<FileLocation>,
    pub undo_file: Option<FileLocation>,
    /// Arrival-order tie-breaker between equal-work tips. Positive and
    /// increasing as data arrives, zero for nodes loaded from disk, negative
    /// and decreasing for blocks marked precious.
    pub sequence_id: i64,
}

impl BlockNode {
    pub fn have_data(&self) -> bool {
        (self.status & STATUS_HAVE_DATA) != 0
    }

    pub fn have_undo(&self) -> bool {
        (self.status & STATUS_HAVE_UNDO) != 0
    }

    pub fn failed(&self) -> bool {
        (self.status & STATUS_FAILED_MASK) != 0
    }

    pub fn is_valid_at_least(&self, level: Validity) -> bool {
        !self.failed() && self.validity >= level
    }
}

/// Candidate-set key ordered so the best candidate compares greatest: most
/// work first, then earliest sequence id, then lowest node id.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CandidateKey {
    pub chain_work: U256,
    pub sequence_id: i64,
    pub node: NodeId,
}

impl Ord for CandidateKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.chain_work
            .cmp(&other.chain_work)
            .then_with(|| other.sequence_id.cmp(&self.sequence_id))
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for CandidateKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct BlockIndex {
    nodes: Vec<BlockNode>,
    by_hash: HashMap<Hash256, NodeId>,
    candidates: BTreeSet<CandidateKey>,
    /// Parent to children whose data arrived before an ancestor's did.
    unlinked: HashMap<NodeId, Vec<NodeId>>,
    dirty: HashSet<NodeId>,
    next_sequence_id: i64,
    next_precious_id: i64,
    best_header: Option<NodeId>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self {
            next_sequence_id: 1,
            next_precious_id: -1,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &BlockNode {
        &self.nodes[id]
    }

    /// Mutable node access; the node is marked for persistence.
    pub fn node_mut(&mut self, id: NodeId) -> &mut BlockNode {
        self.dirty.insert(id);
        &mut self.nodes[id]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        0..self.nodes.len()
    }

    pub fn best_header(&self) -> Option<NodeId> {
        self.best_header
    }

    pub fn candidates(&self) -> &BTreeSet<CandidateKey> {
        &self.candidates
    }

    pub fn best_candidate(&self) -> Option<NodeId> {
        self.candidates.iter().next_back().map(|key| key.node)
    }

    pub fn candidate_key(&self, id: NodeId) -> CandidateKey {
        let node = &self.nodes[id];
        CandidateKey {
            chain_work: node.chain_work,
            sequence_id: node.sequence_id,
            node: id,
        }
    }

    pub fn remove_candidate(&mut self, id: NodeId) {
        let key = self.candidate_key(id);
        self.candidates.remove(&key);
    }

    pub fn insert_candidate(&mut self, id: NodeId) {
        let key = self.candidate_key(id);
        self.candidates.insert(key);
    }

    /// Drops candidates that can no longer beat the current tip.
    pub fn prune_candidates(&mut self, tip_work: U256, tip: Option<NodeId>) {
        let keep: Vec<CandidateKey> = self
            .candidates
            .iter()
            .copied()
            .filter(|key| key.chain_work >= tip_work || Some(key.node) == tip)
            .collect();
        self.candidates = keep.into_iter().collect();
    }

    /// Inserts a header, returning the existing node when already present.
    /// The parent must already be in the index (the genesis has none).
    pub fn insert_header(&mut self, header: &BlockHeader) -> Result<NodeId, ValidationFailure> {
        let hash = header.hash();
        if let Some(existing) = self.by_hash.get(&hash) {
            return Ok(*existing);
        }

        let is_genesis = header.prev_block == [0u8; 32] && self.nodes.is_empty();
        let parent = if is_genesis {
            None
        } else {
            Some(self.by_hash.get(&header.prev_block).copied().ok_or_else(|| {
                ValidationFailure::dos(10, RejectCode::Invalid, "prev-blk-not-found")
            })?)
        };

        let proof = block_proof(header.bits).map_err(|_| {
            ValidationFailure::dos(50, RejectCode::Invalid, "bad-diffbits")
        })?;
        let (height, chain_work) = match parent {
            Some(parent_id) => {
                let parent_node = &self.nodes[parent_id];
                (
                    parent_node.height + 1,
                    parent_node.chain_work.overflowing_add(proof).0,
                )
            }
            None => (0, proof),
        };

        let id = self.nodes.len();
        let skip = parent.and_then(|parent_id| self.ancestor(parent_id, skip_height(height)));
        self.nodes.push(BlockNode {
            hash,
            header: header.clone(),
            parent,
            skip,
            height,
            chain_work,
            tx_count: 0,
            chain_tx_count: 0,
            validity: Validity::Tree,
            status: 0,
            block_file: None,
            undo_file: None,
            sequence_id: 0,
        });
        self.by_hash.insert(hash, id);
        self.dirty.insert(id);

        let best_work = self.best_header.map(|best| self.nodes[best].chain_work);
        if !self.nodes[id].failed() && best_work.map_or(true, |work| chain_work > work) {
            self.best_header = Some(id);
        }
        Ok(id)
    }

    /// Ancestor of `id` at `height`, via the skip list in O(log n).
    pub fn ancestor(&self, id: NodeId, height: i32) -> Option<NodeId> {
        let mut current = id;
        let mut current_height = self.nodes[current].height;
        if height > current_height || height < 0 {
            return None;
        }
        while current_height > height {
            let node = &self.nodes[current];
            let walk_skip = node.skip.filter(|skip| {
                let skip_h = self.nodes[*skip].height;
                skip_h >= height
            });
            match walk_skip {
                Some(skip) => current = skip,
                None => current = node.parent?,
            }
            current_height = self.nodes[current].height;
        }
        Some(current)
    }

    pub fn is_ancestor(&self, ancestor: NodeId, descendant: NodeId) -> bool {
        self.ancestor(descendant, self.nodes[ancestor].height) == Some(ancestor)
    }

    /// Median of the last eleven header timestamps ending at `id`.
    pub fn median_time_past(&self, id: NodeId) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut current = Some(id);
        while let Some(node_id) = current {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let node = &self.nodes[node_id];
            times.push(i64::from(node.header.time));
            current = node.parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Records that a block's data arrived: sets `HAVE_DATA`, the counts and
    /// file location, assigns the arrival sequence id, and walks the
    /// unlinked map forward propagating `chain_tx_count`. Returns every node
    /// that newly became connectable, for candidate-set insertion by the
    /// caller (which knows the current tip's work).
    pub fn receive_block_data(
        &mut self,
        id: NodeId,
        tx_count: u32,
        location: FileLocation,
    ) -> Vec<NodeId> {
        {
            let sequence_id = self.next_sequence_id;
            let node = self.node_mut(id);
            if !node.have_data() {
                node.status |= STATUS_HAVE_DATA;
                node.tx_count = tx_count;
                node.block_file = Some(location);
                node.sequence_id = sequence_id;
            }
            if node.validity < Validity::Transactions {
                node.validity = Validity::Transactions;
            }
        }
        self.next_sequence_id += 1;

        let parent_ready = match self.nodes[id].parent {
            Some(parent) => self.nodes[parent].chain_tx_count != 0,
            None => true,
        };
        if !parent_ready {
            let parent = self.nodes[id].parent.expect("non-genesis");
            let waiting = self.unlinked.entry(parent).or_default();
            if !waiting.contains(&id) {
                waiting.push(id);
            }
            return Vec::new();
        }

        // Breadth-first over descendants that were waiting on this subtree.
        let mut connectable = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            let parent_chain_tx = match self.nodes[current].parent {
                Some(parent) => self.nodes[parent].chain_tx_count,
                None => 0,
            };
            {
                let tx_count = self.nodes[current].tx_count;
                let node = self.node_mut(current);
                node.chain_tx_count = parent_chain_tx + u64::from(tx_count);
            }
            connectable.push(current);
            if let Some(children) = self.unlinked.remove(&current) {
                for child in children {
                    queue.push_back(child);
                }
            }
        }
        connectable
    }

    /// Marks a node consensus-invalid and removes it from the candidates.
    pub fn mark_failed(&mut self, id: NodeId) {
        self.remove_candidate(id);
        self.node_mut(id).status |= STATUS_FAILED_VALID;
    }

    /// Marks a node as descending from an invalid block.
    pub fn mark_failed_child(&mut self, id: NodeId) {
        self.remove_candidate(id);
        self.node_mut(id).status |= STATUS_FAILED_CHILD;
    }

    /// Moves a node between `descendant` and the failed ancestor back into
    /// the unlinked map so it is reconsidered if data arrives again.
    pub fn push_unlinked(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id].parent {
            let waiting = self.unlinked.entry(parent).or_default();
            if !waiting.contains(&id) {
                waiting.push(id);
            }
        }
    }

    pub fn remove_unlinked(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id].parent {
            if let Some(waiting) = self.unlinked.get_mut(&parent) {
                waiting.retain(|child| *child != id);
                if waiting.is_empty() {
                    self.unlinked.remove(&parent);
                }
            }
        }
    }

    /// Assigns a fresh, most-preferred precious sequence id.
    pub fn set_precious(&mut self, id: NodeId) {
        self.remove_candidate(id);
        let sequence_id = self.next_precious_id;
        self.next_precious_id -= 1;
        self.node_mut(id).sequence_id = sequence_id;
    }

    pub fn nodes_in_file(&self, file_id: u32) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| {
                node.block_file
                    .map(|location| location.file_id == file_id)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id)
            .collect()
    }

    pub fn mark_dirty(&mut self, id: NodeId) {
        self.dirty.insert(id);
    }

    /// Writes dirty nodes into `batch` and clears the dirty set.
    pub fn flush_to_db(&mut self, batch: &mut WriteBatch) {
        for id in self.dirty.drain() {
            let node = &self.nodes[id];
            batch.put(Column::BlockIndex, node.hash, encode_disk_node(node));
        }
    }

    /// Rebuilds the forest from the index database: links parents, restores
    /// chain work, `chain_tx_count`, the unlinked map, and the best header.
    /// Candidates are filled in by the caller once the tip is known.
    pub fn load_from_db<S: KeyValueStore>(store: &S) -> Result<Self, StoreError> {
        let mut records: Vec<(Hash256, DiskNode)> = Vec::new();
        for (key, value) in store.scan_prefix(Column::BlockIndex, &[])? {
            if key.len() != 32 {
                continue;
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&key);
            let record = decode_disk_node(&value)
                .ok_or_else(|| StoreError::Backend("corrupt block index record".to_string()))?;
            records.push((hash, record));
        }
        records.sort_by_key(|(_, record)| record.height);

        let mut index = Self::new();
        for (hash, record) in records {
            let parent = if record.height == 0 {
                None
            } else {
                match index.by_hash.get(&record.header.prev_block) {
                    Some(parent) => Some(*parent),
                    // An orphaned record without its parent chain is skipped;
                    // the block will be refetched.
                    None => continue,
                }
            };
            let proof = match block_proof(record.header.bits) {
                Ok(proof) => proof,
                Err(_) => continue,
            };
            let chain_work = match parent {
                Some(parent_id) => index.nodes[parent_id].chain_work.overflowing_add(proof).0,
                None => proof,
            };
            let chain_tx_count = if record.tx_count > 0 {
                let parent_chain_tx = parent
                    .map(|parent_id| index.nodes[parent_id].chain_tx_count)
                    .unwrap_or(0);
                let parent_ready = parent.is_none()
                    || parent
                        .map(|parent_id| index.nodes[parent_id].chain_tx_count != 0)
                        .unwrap_or(false);
                if parent_ready {
                    parent_chain_tx + u64::from(record.tx_count)
                } else {
                    0
                }
            } else {
                0
            };

            let id = index.nodes.len();
            let skip = parent.and_then(|parent_id| {
                index.ancestor(parent_id, skip_height(record.height))
            });
            index.nodes.push(BlockNode {
                hash,
                header: record.header,
                parent,
                skip,
                height: record.height,
                chain_work,
                tx_count: record.tx_count,
                chain_tx_count,
                validity: record.validity,
                status: record.status,
                block_file: record.block_file,
                undo_file: record.undo_file,
                sequence_id: 0,
            });
            index.by_hash.insert(hash, id);

            if chain_tx_count == 0 && (index.nodes[id].have_data() || record.tx_count > 0) {
                if let Some(parent) = parent {
                    index.unlinked.entry(parent).or_default().push(id);
                }
            }
            let better = match index.best_header {
                Some(best) => chain_work > index.nodes[best].chain_work,
                None => true,
            };
            if better && !index.nodes[id].failed() {
                index.best_header = Some(id);
            }
        }
        Ok(index)
    }
}

fn invert_lowest_one(value: i32) -> i32 {
    value & (value - 1)
}

/// Height the skip pointer of a node at `height` points to; alternates
/// between clearing one and two low bits so ancestor walks take O(log n).
pub fn skip_height(height: i32) -> i32 {
    if height < 2 {
        return 0;
    }
    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

struct DiskNode {
    header: BlockHeader,
    height: i32,
    validity: Validity,
    status: u8,
    tx_count: u32,
    block_file: Option<FileLocation>,
    undo_file: Option<FileLocation>,
}

fn encode_disk_node(node: &BlockNode) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(80 + 4 + 1 + 1 + 4 + 32);
    node.header.consensus_encode(&mut encoder);
    encoder.write_i32_le(node.height);
    encoder.write_u8(node.validity as u8);
    encoder.write_u8(node.status);
    encoder.write_u32_le(node.tx_count);
    encoder.write_bytes(&node.block_file.map(|loc| loc.encode()).unwrap_or([0u8; 16]));
    encoder.write_bytes(&node.undo_file.map(|loc| loc.encode()).unwrap_or([0u8; 16]));
    encoder.into_inner()
}

fn decode_disk_node(bytes: &[u8]) -> Option<DiskNode> {
    let mut decoder = Decoder::new(bytes);
    let header = BlockHeader::consensus_decode(&mut decoder).ok()?;
    let height = decoder.read_i32_le().ok()?;
    let validity = Validity::from_u8(decoder.read_u8().ok()?)?;
    let status = decoder.read_u8().ok()?;
    let tx_count = decoder.read_u32_le().ok()?;
    let block_file = FileLocation::decode(&decoder.read_fixed::<16>().ok()?)
        .filter(|location| location.len != 0);
    let undo_file = FileLocation::decode(&decoder.read_fixed::<16>().ok()?)
        .filter(|location| location.len != 0);
    if !decoder.is_empty() {
        return None;
    }
    Some(DiskNode {
        header,
        height,
        validity,
        status,
        tx_count,
        block_file,
        undo_file,
    })
}
