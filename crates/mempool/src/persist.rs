//! `mempool.dat`: pool contents persisted across restarts. Loading is
//! best-effort; transactions must pass admission again, so a stale or
//! partially corrupt file costs entries, not correctness.

use std::io;
use std::path::Path;

use emberd_consensus::Hash256;
use emberd_primitives::encoding::{Decoder, Encoder};

use crate::pool::Mempool;

const MEMPOOL_DAT_VERSION: u8 = 1;

/// One persisted pool entry, pending re-admission.
#[derive(Clone, Debug, PartialEq)]
pub struct PersistedTx {
    pub raw: Vec<u8>,
    pub time: u64,
    pub fee_delta: i64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MempoolFile {
    pub txs: Vec<PersistedTx>,
    pub priority_deltas: Vec<(Hash256, f64, i64)>,
}

pub fn dump_to_path(pool: &Mempool, path: &Path) -> io::Result<()> {
    let mut encoder = Encoder::new();
    encoder.write_u8(MEMPOOL_DAT_VERSION);
    let entries: Vec<_> = pool.entries().collect();
    encoder.write_u64_le(entries.len() as u64);
    for entry in entries {
        encoder.write_var_bytes(&entry.raw);
        encoder.write_u64_le(entry.time);
        encoder.write_i64_le(entry.fee_delta);
    }
    let deltas: Vec<_> = pool.prioritisations().collect();
    encoder.write_u64_le(deltas.len() as u64);
    for (txid, delta) in deltas {
        encoder.write_hash(txid);
        encoder.write_u64_le(delta.priority_delta.to_bits());
        encoder.write_i64_le(delta.fee_delta);
    }

    let tmp = path.with_extension("new");
    std::fs::write(&tmp, encoder.into_inner())?;
    std::fs::rename(&tmp, path)
}

/// Reads a mempool file. Per-entry decode failures are counted and skipped;
/// only a missing or unversioned file is an error.
pub fn load_from_path(path: &Path) -> io::Result<(MempoolFile, usize)> {
    let bytes = std::fs::read(path)?;
    let mut decoder = Decoder::new(&bytes);
    let version = decoder
        .read_u8()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    if version != MEMPOOL_DAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported mempool file version {version}"),
        ));
    }

    let mut file = MempoolFile::default();
    let mut failures = 0usize;

    let count = match decoder.read_u64_le() {
        Ok(count) => count,
        Err(_) => return Ok((file, 1)),
    };
    for _ in 0..count {
        let raw = match decoder.read_var_bytes() {
            Ok(raw) => raw,
            Err(_) => {
                failures += 1;
                break;
            }
        };
        let (time, fee_delta) = match (decoder.read_u64_le(), decoder.read_i64_le()) {
            (Ok(time), Ok(fee_delta)) => (time, fee_delta),
            _ => {
                failures += 1;
                break;
            }
        };
        file.txs.push(PersistedTx {
            raw,
            time,
            fee_delta,
        });
    }

    if let Ok(delta_count) = decoder.read_u64_le() {
        for _ in 0..delta_count {
            match (
                decoder.read_hash(),
                decoder.read_u64_le(),
                decoder.read_i64_le(),
            ) {
                (Ok(txid), Ok(priority_bits), Ok(fee_delta)) => {
                    file.priority_deltas
                        .push((txid, f64::from_bits(priority_bits), fee_delta));
                }
                _ => {
                    failures += 1;
                    break;
                }
            }
        }
    }

    Ok((file, failures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{LockPoints, MempoolEntry};
    use emberd_primitives::outpoint::OutPoint;
    use emberd_primitives::transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};

    fn pool_with_one_tx() -> Mempool {
        let tx = Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([3u8; 32], 1),
                script_sig: vec![0x00],
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![TxOut {
                value: 9_000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        let txid = tx.txid();
        let raw = tx.consensus_encode_to_vec();
        let spent = tx.vin.iter().map(|input| input.prevout.clone()).collect();
        let size = raw.len();
        let mut pool = Mempool::new(1_000_000, 0);
        pool.insert(MempoolEntry {
            txid,
            tx,
            raw,
            time: 77,
            height: 5,
            fee: 500,
            fee_delta: 0,
            value_in: 9_500,
            modified_size: size,
            priority: 0.0,
            priority_delta: 0.0,
            sigops: 1,
            spends_coinbase: false,
            lock_points: LockPoints::default(),
            spent_outpoints: spent,
            parents: Vec::new(),
            was_clear_at_entry: true,
        })
        .expect("insert");
        pool.prioritise_transaction([0xeeu8; 32], 1.5, 250);
        pool
    }

    #[test]
    fn dump_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mempool.dat");
        let pool = pool_with_one_tx();
        dump_to_path(&pool, &path).expect("dump");

        let (file, failures) = load_from_path(&path).expect("load");
        assert_eq!(failures, 0);
        assert_eq!(file.txs.len(), 1);
        assert_eq!(file.txs[0].time, 77);
        assert_eq!(file.priority_deltas.len(), 1);
        assert!(file
            .priority_deltas
            .iter()
            .any(|(txid, priority, fee)| *txid == [0xeeu8; 32] && *priority == 1.5 && *fee == 250));
    }

    #[test]
    fn truncated_file_loads_best_effort() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mempool.dat");
        let pool = pool_with_one_tx();
        dump_to_path(&pool, &path).expect("dump");

        let bytes = std::fs::read(&path).expect("read");
        std::fs::write(&path, &bytes[..bytes.len() / 2]).expect("truncate");
        let (file, failures) = load_from_path(&path).expect("load");
        assert!(failures > 0 || file.txs.len() <= 1);
    }

    #[test]
    fn wrong_version_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mempool.dat");
        std::fs::write(&path, [9u8]).expect("write");
        assert!(load_from_path(&path).is_err());
    }
}
