#![cfg(feature = "fjall")]

use emberd_storage::fjall::FjallStore;
use emberd_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_backend_round_trips_batches() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FjallStore::open(dir.path()).expect("open");

    let mut batch = WriteBatch::new();
    batch.put(Column::Coins, b"outpoint".as_slice(), b"coin".as_slice());
    batch.put(Column::Meta, b"best_block".as_slice(), [0xabu8; 32]);
    store.write_batch(&batch).expect("commit");

    assert_eq!(
        store.get(Column::Coins, b"outpoint").expect("get"),
        Some(b"coin".to_vec())
    );
    assert_eq!(
        store.get(Column::Meta, b"best_block").expect("get"),
        Some(vec![0xabu8; 32])
    );
    assert_eq!(store.get(Column::BlockIndex, b"outpoint").expect("get"), None);

    let mut batch = WriteBatch::new();
    batch.delete(Column::Coins, b"outpoint".as_slice());
    store.write_batch(&batch).expect("commit");
    assert_eq!(store.get(Column::Coins, b"outpoint").expect("get"), None);
}
