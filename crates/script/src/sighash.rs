//! Signature hashing for transaction inputs.
//!
//! Two schemes exist side by side: the legacy scheme used before the
//! hard fork, and the fork-id scheme that commits to the input amount and
//! carries the fork-id bit in the sighash type, making pre-fork signatures
//! invalid on the forked chain.

use emberd_consensus::Hash256;
use emberd_primitives::encoding::{Encodable, Encoder};
use emberd_primitives::hash::sha256d;
use emberd_primitives::transaction::Transaction;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_FORKID: u32 = 0x40;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SighashType(pub u32);

impl SighashType {
    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn has_fork_id(self) -> bool {
        (self.0 & SIGHASH_FORKID) != 0
    }

    pub fn has_anyone_can_pay(self) -> bool {
        (self.0 & SIGHASH_ANYONECANPAY) != 0
    }

    pub fn is_defined_base(self) -> bool {
        matches!(self.base_type(), SIGHASH_ALL | SIGHASH_NONE | SIGHASH_SINGLE)
    }
}

#[derive(Debug)]
pub enum SighashError {
    InputIndexOutOfRange,
}

impl std::fmt::Display for SighashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SighashError::InputIndexOutOfRange => write!(f, "input index out of range"),
        }
    }
}

impl std::error::Error for SighashError {}

/// Digest a signature for `input_index` commits to. Picks the fork-id
/// scheme when the sighash type carries the fork-id bit.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    amount: i64,
    sighash_type: SighashType,
) -> Result<Hash256, SighashError> {
    if input_index >= tx.vin.len() {
        return Err(SighashError::InputIndexOutOfRange);
    }
    if sighash_type.has_fork_id() {
        Ok(fork_id_signature_hash(
            tx,
            input_index,
            script_code,
            amount,
            sighash_type,
        ))
    } else {
        Ok(legacy_signature_hash(
            tx,
            input_index,
            script_code,
            sighash_type,
        ))
    }
}

fn fork_id_signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    amount: i64,
    sighash_type: SighashType,
) -> Hash256 {
    let zero = [0u8; 32];

    let hash_prevouts = if sighash_type.has_anyone_can_pay() {
        zero
    } else {
        let mut encoder = Encoder::new();
        for input in &tx.vin {
            input.prevout.consensus_encode(&mut encoder);
        }
        sha256d(&encoder.into_inner())
    };

    let single_or_none = matches!(
        sighash_type.base_type(),
        SIGHASH_SINGLE | SIGHASH_NONE
    );
    let hash_sequence = if sighash_type.has_anyone_can_pay() || single_or_none {
        zero
    } else {
        let mut encoder = Encoder::new();
        for input in &tx.vin {
            encoder.write_u32_le(input.sequence);
        }
        sha256d(&encoder.into_inner())
    };

    let hash_outputs = match sighash_type.base_type() {
        SIGHASH_SINGLE => {
            if input_index < tx.vout.len() {
                let mut encoder = Encoder::new();
                tx.vout[input_index].consensus_encode(&mut encoder);
                sha256d(&encoder.into_inner())
            } else {
                zero
            }
        }
        SIGHASH_NONE => zero,
        _ => {
            let mut encoder = Encoder::new();
            for output in &tx.vout {
                output.consensus_encode(&mut encoder);
            }
            sha256d(&encoder.into_inner())
        }
    };

    let input = &tx.vin[input_index];
    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);
    encoder.write_hash(&hash_prevouts);
    encoder.write_hash(&hash_sequence);
    input.prevout.consensus_encode(&mut encoder);
    encoder.write_var_bytes(script_code);
    encoder.write_i64_le(amount);
    encoder.write_u32_le(input.sequence);
    encoder.write_hash(&hash_outputs);
    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);
    sha256d(&encoder.into_inner())
}

fn legacy_signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: SighashType,
) -> Hash256 {
    // SIGHASH_SINGLE with no matching output hashes the constant 1; the
    // resulting signature can never be valid, which is the safe behavior.
    if sighash_type.base_type() == SIGHASH_SINGLE && input_index >= tx.vout.len() {
        let mut one = [0u8; 32];
        one[0] = 1;
        return one;
    }

    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);

    if sighash_type.has_anyone_can_pay() {
        encoder.write_compact_size(1);
        let input = &tx.vin[input_index];
        input.prevout.consensus_encode(&mut encoder);
        encoder.write_var_bytes(script_code);
        encoder.write_u32_le(input.sequence);
    } else {
        encoder.write_compact_size(tx.vin.len() as u64);
        for (index, input) in tx.vin.iter().enumerate() {
            input.prevout.consensus_encode(&mut encoder);
            if index == input_index {
                encoder.write_var_bytes(script_code);
            } else {
                encoder.write_compact_size(0);
            }
            let sequence = if index != input_index && single_or_none(sighash_type) {
                0
            } else {
                input.sequence
            };
            encoder.write_u32_le(sequence);
        }
    }

    match sighash_type.base_type() {
        SIGHASH_NONE => {
            encoder.write_compact_size(0);
        }
        SIGHASH_SINGLE => {
            encoder.write_compact_size(input_index as u64 + 1);
            for _ in 0..input_index {
                // Blanked outputs: value -1, empty script.
                encoder.write_i64_le(-1);
                encoder.write_compact_size(0);
            }
            tx.vout[input_index].consensus_encode(&mut encoder);
        }
        _ => {
            encoder.write_compact_size(tx.vout.len() as u64);
            for output in &tx.vout {
                output.consensus_encode(&mut encoder);
            }
        }
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);
    sha256d(&encoder.into_inner())
}

fn single_or_none(sighash_type: SighashType) -> bool {
    matches!(sighash_type.base_type(), SIGHASH_SINGLE | SIGHASH_NONE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_primitives::outpoint::OutPoint;
    use emberd_primitives::transaction::{TxIn, TxOut, SEQUENCE_FINAL};

    fn two_in_two_out() -> Transaction {
        Transaction {
            version: 2,
            vin: vec![
                TxIn {
                    prevout: OutPoint::new([1u8; 32], 0),
                    script_sig: Vec::new(),
                    sequence: SEQUENCE_FINAL,
                },
                TxIn {
                    prevout: OutPoint::new([2u8; 32], 1),
                    script_sig: Vec::new(),
                    sequence: SEQUENCE_FINAL,
                },
            ],
            vout: vec![
                TxOut {
                    value: 10_000,
                    script_pubkey: vec![0x51],
                },
                TxOut {
                    value: 20_000,
                    script_pubkey: vec![0x52],
                },
            ],
            lock_time: 0,
        }
    }

    #[test]
    fn fork_id_hash_commits_to_amount() {
        let tx = two_in_two_out();
        let script = vec![0x76, 0xa9];
        let with_amount = signature_hash(
            &tx,
            0,
            &script,
            10_000,
            SighashType(SIGHASH_ALL | SIGHASH_FORKID),
        )
        .expect("hash");
        let other_amount = signature_hash(
            &tx,
            0,
            &script,
            10_001,
            SighashType(SIGHASH_ALL | SIGHASH_FORKID),
        )
        .expect("hash");
        assert_ne!(with_amount, other_amount);
    }

    #[test]
    fn legacy_hash_ignores_amount() {
        let tx = two_in_two_out();
        let script = vec![0x76, 0xa9];
        let first =
            signature_hash(&tx, 0, &script, 10_000, SighashType(SIGHASH_ALL)).expect("hash");
        let second =
            signature_hash(&tx, 0, &script, 99_999, SighashType(SIGHASH_ALL)).expect("hash");
        assert_eq!(first, second);
    }

    #[test]
    fn fork_id_and_legacy_disagree() {
        let tx = two_in_two_out();
        let script = vec![0x51];
        let legacy =
            signature_hash(&tx, 0, &script, 10_000, SighashType(SIGHASH_ALL)).expect("hash");
        let forked = signature_hash(
            &tx,
            0,
            &script,
            10_000,
            SighashType(SIGHASH_ALL | SIGHASH_FORKID),
        )
        .expect("hash");
        assert_ne!(legacy, forked);
    }

    #[test]
    fn single_without_matching_output_hashes_one() {
        let mut tx = two_in_two_out();
        tx.vout.truncate(1);
        let hash =
            signature_hash(&tx, 1, &[0x51], 0, SighashType(SIGHASH_SINGLE)).expect("hash");
        let mut one = [0u8; 32];
        one[0] = 1;
        assert_eq!(hash, one);
    }

    #[test]
    fn out_of_range_input_is_an_error() {
        let tx = two_in_two_out();
        assert!(signature_hash(&tx, 5, &[0x51], 0, SighashType(SIGHASH_ALL)).is_err());
    }
}
