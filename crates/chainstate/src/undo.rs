//! Per-block undo records: the spent coins needed to invert a connection.

use emberd_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::coins::Coin;

/// Spent-coin records written before version 1 lack the creation height and
/// coinbase flag; disconnect recovers them from a sibling output when it can.
const COIN_UNDO_VERSION: u8 = 1;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxUndo {
    /// One entry per input, in input order.
    pub spent: Vec<Coin>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockUndo {
    /// One entry per non-coinbase transaction, in block order.
    pub txs: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.txs.len() as u32);
        for tx_undo in &self.txs {
            encoder.write_u32_le(tx_undo.spent.len() as u32);
            for coin in &tx_undo.spent {
                encoder.write_u8(COIN_UNDO_VERSION);
                encoder.write_i64_le(coin.value);
                encoder.write_var_bytes(&coin.script_pubkey);
                encoder.write_u32_le(coin.height);
                encoder.write_u8(u8::from(coin.is_coinbase));
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx_count = decoder.read_u32_le()? as usize;
        let mut txs = Vec::with_capacity(tx_count.min(4096));
        for _ in 0..tx_count {
            let spent_count = decoder.read_u32_le()? as usize;
            let mut spent = Vec::with_capacity(spent_count.min(4096));
            for _ in 0..spent_count {
                let version = decoder.read_u8()?;
                if version > COIN_UNDO_VERSION {
                    return Err(DecodeError::InvalidData("unknown spent-coin version"));
                }
                let value = decoder.read_i64_le()?;
                let script_pubkey = decoder.read_var_bytes()?;
                let (height, is_coinbase) = if version >= 1 {
                    (decoder.read_u32_le()?, decoder.read_u8()? != 0)
                } else {
                    (0, false)
                };
                spent.push(Coin {
                    value,
                    script_pubkey,
                    height,
                    is_coinbase,
                });
            }
            txs.push(TxUndo { spent });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { txs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coin(value: i64, height: u32, is_coinbase: bool) -> Coin {
        Coin {
            value,
            script_pubkey: vec![0x76, 0xa9],
            height,
            is_coinbase,
        }
    }

    #[test]
    fn undo_round_trips() {
        let undo = BlockUndo {
            txs: vec![
                TxUndo {
                    spent: vec![coin(50_0000_0000, 1, true)],
                },
                TxUndo {
                    spent: vec![coin(10_000, 90, false), coin(20_000, 95, false)],
                },
            ],
        };
        let bytes = undo.encode();
        assert_eq!(BlockUndo::decode(&bytes).expect("decode"), undo);
    }

    #[test]
    fn empty_undo_round_trips() {
        let undo = BlockUndo::default();
        assert_eq!(BlockUndo::decode(&undo.encode()).expect("decode"), undo);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = BlockUndo::default().encode();
        bytes.push(0);
        assert!(BlockUndo::decode(&bytes).is_err());
    }

    #[test]
    fn legacy_records_decode_without_metadata() {
        // Version-0 record: no height or coinbase flag.
        let mut encoder = Encoder::new();
        encoder.write_u32_le(1);
        encoder.write_u32_le(1);
        encoder.write_u8(0);
        encoder.write_i64_le(7_000);
        encoder.write_var_bytes(&[0x51]);
        let undo = BlockUndo::decode(&encoder.into_inner()).expect("decode");
        assert_eq!(undo.txs[0].spent[0].height, 0);
        assert!(!undo.txs[0].spent[0].is_coinbase);
    }
}
