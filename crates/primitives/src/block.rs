//! Block header and block types.

use emberd_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

pub const CURRENT_BLOCK_VERSION: i32 = 4;
/// Serialized header length.
pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.consensus_encode(&mut encoder);
        sha256d(&encoder.into_inner())
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let prev_block = decoder.read_hash()?;
        let merkle_root = decoder.read_hash()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        Ok(Self {
            version,
            prev_block,
            merkle_root,
            time,
            bits,
            nonce,
        })
    }
}

#[derive(Clone, Debug)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn consensus_encode_to_vec(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.serialized_size());
        self.consensus_encode(&mut encoder);
        encoder.into_inner()
    }

    pub fn serialized_size(&self) -> usize {
        HEADER_SIZE
            + crate::encoding::compact_size_len(self.transactions.len() as u64)
            + self
                .transactions
                .iter()
                .map(Transaction::serialized_size)
                .sum::<usize>()
    }

    /// Byte offset of each transaction within the serialized block, used by
    /// the optional transaction index.
    pub fn tx_offsets(&self) -> Vec<u32> {
        let mut offsets = Vec::with_capacity(self.transactions.len());
        let mut cursor =
            HEADER_SIZE + crate::encoding::compact_size_len(self.transactions.len() as u64);
        for tx in &self.transactions {
            offsets.push(cursor as u32);
            cursor += tx.serialized_size();
        }
        offsets
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        encoder.write_compact_size(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode(encoder);
        }
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(decoder)?;
        let count = decoder.read_compact_size()?;
        let mut transactions = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            transactions.push(Transaction::consensus_decode(decoder)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode, encode};
    use crate::outpoint::OutPoint;
    use crate::transaction::{TxIn, TxOut, SEQUENCE_FINAL};

    fn sample_block() -> Block {
        let coinbase = Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, 0x00],
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![TxOut {
                value: 50_0000_0000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        Block {
            header: BlockHeader {
                version: CURRENT_BLOCK_VERSION,
                prev_block: [9u8; 32],
                merkle_root: [0u8; 32],
                time: 1_700_000_000,
                bits: 0x207f_ffff,
                nonce: 42,
            },
            transactions: vec![coinbase],
        }
    }

    #[test]
    fn header_serializes_to_eighty_bytes() {
        let block = sample_block();
        assert_eq!(encode(&block.header).len(), HEADER_SIZE);
    }

    #[test]
    fn block_round_trips() {
        let block = sample_block();
        let bytes = encode(&block);
        assert_eq!(bytes.len(), block.serialized_size());
        let back: Block = decode(&bytes).expect("decode");
        assert_eq!(back.hash(), block.hash());
        assert_eq!(back.transactions.len(), 1);
    }

    #[test]
    fn tx_offsets_point_at_serialized_transactions() {
        let block = sample_block();
        let bytes = encode(&block);
        let offsets = block.tx_offsets();
        assert_eq!(offsets.len(), 1);
        let offset = offsets[0] as usize;
        let tx_bytes = encode(&block.transactions[0]);
        assert_eq!(&bytes[offset..offset + tx_bytes.len()], &tx_bytes[..]);
    }
}
