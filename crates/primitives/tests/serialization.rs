use emberd_primitives::encoding::{decode, encode, DecodeError};
use emberd_primitives::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_tx(rng: &mut StdRng) -> Transaction {
    let vin = (0..rng.gen_range(1..4))
        .map(|_| TxIn {
            prevout: OutPoint::new(rng.gen(), rng.gen_range(0..16)),
            script_sig: (0..rng.gen_range(0..64)).map(|_| rng.gen()).collect(),
            sequence: rng.gen(),
        })
        .collect();
    let vout = (0..rng.gen_range(1..4))
        .map(|_| TxOut {
            value: rng.gen_range(0..21_000_000i64 * 100_000_000),
            script_pubkey: (0..rng.gen_range(0..64)).map(|_| rng.gen()).collect(),
        })
        .collect();
    Transaction {
        version: rng.gen_range(1..3),
        vin,
        vout,
        lock_time: rng.gen(),
    }
}

#[test]
fn arbitrary_transactions_round_trip() {
    let mut rng = StdRng::seed_from_u64(0x7a11);
    for _ in 0..256 {
        let tx = random_tx(&mut rng);
        let bytes = encode(&tx);
        assert_eq!(bytes.len(), tx.serialized_size());
        let back: Transaction = decode(&bytes).expect("round trip");
        assert_eq!(back, tx);
    }
}

#[test]
fn arbitrary_blocks_round_trip() {
    let mut rng = StdRng::seed_from_u64(0xb10c);
    for _ in 0..64 {
        let transactions = (0..rng.gen_range(1..8)).map(|_| random_tx(&mut rng)).collect();
        let block = Block {
            header: BlockHeader {
                version: 4,
                prev_block: rng.gen(),
                merkle_root: rng.gen(),
                time: rng.gen(),
                bits: 0x207f_ffff,
                nonce: rng.gen(),
            },
            transactions,
        };
        let bytes = encode(&block);
        assert_eq!(bytes.len(), block.serialized_size());
        let back: Block = decode(&bytes).expect("round trip");
        assert_eq!(back.hash(), block.hash());
    }
}

#[test]
fn truncated_block_fails_cleanly() {
    let block = Block {
        header: BlockHeader {
            version: 4,
            prev_block: [1u8; 32],
            merkle_root: [2u8; 32],
            time: 1_700_000_000,
            bits: 0x207f_ffff,
            nonce: 7,
        },
        transactions: vec![Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x00, 0x00],
                sequence: 0xffff_ffff,
            }],
            vout: vec![TxOut {
                value: 0,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }],
    };
    let bytes = encode(&block);
    for cut in [1usize, 40, 81, bytes.len() - 1] {
        let err = decode::<Block>(&bytes[..cut]).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::UnexpectedEof | DecodeError::TrailingBytes
        ));
    }
}
