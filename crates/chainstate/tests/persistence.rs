//! Durability: flushing, restarting from disk, pruning, the transaction
//! index, and database verification.

mod common;

use common::{spend, test_config, TestChain};
use emberd_chainstate::coins::CoinsBackend;
use emberd_chainstate::state::FlushMode;
use emberd_consensus::constants::{COINBASE_MATURITY, MIN_BLOCKS_TO_KEEP};
use emberd_consensus::money::COIN;
use emberd_primitives::outpoint::OutPoint;

#[test]
fn flushed_state_survives_restart() {
    let mut chain = TestChain::new();
    let fund = chain
        .mine_block(Vec::new(), vec![0x01, 0xa1, 0x75, 0x51])
        .expect("fund");
    let c1 = OutPoint::new(fund.transactions[0].txid(), 0);
    chain.mine_buffer_blocks(COINBASE_MATURITY as usize);
    let t1 = spend(c1.clone(), 50 * COIN, 1_000, 0xa2);
    let t1_out = OutPoint::new(t1.txid(), 0);
    chain.mine_block(vec![t1], vec![0x6a]).expect("spend block");

    let tip_hash = chain.tip_hash();
    let tip_height = chain.tip_height();
    chain.state.flush(FlushMode::Always).expect("flush");

    let reloaded = chain.reload(test_config());
    assert_eq!(reloaded.tip_hash(), Some(tip_hash));
    assert_eq!(reloaded.tip_height(), tip_height);
    assert_eq!(reloaded.coins().best_block().expect("best"), Some(tip_hash));
    assert!(!reloaded.coins().have_coin(&c1).expect("have"));
    let coin = reloaded
        .coins()
        .coin(&t1_out)
        .expect("coin")
        .expect("present");
    assert_eq!(coin.value, 50 * COIN - 1_000);

    // The reloaded index can keep extending the chain.
    let tip = reloaded.tip().expect("tip");
    assert!(reloaded.index().node(tip).have_undo());
    assert_eq!(reloaded.index().best_candidate(), Some(tip));
}

#[test]
fn chain_extends_after_restart() {
    let mut chain = TestChain::new();
    chain.mine_buffer_blocks(5);
    chain.state.flush(FlushMode::Always).expect("flush");
    let old_tip = chain.tip_hash();

    let mut reloaded = chain.reload(test_config());
    let height = reloaded.tip_height() + 1;
    let block = chain.build_on(
        old_tip,
        height,
        chain.tip_time() + common::SPACING,
        Vec::new(),
        vec![0x6a],
    );
    reloaded
        .process_new_block(&block, i64::from(block.header.time))
        .expect("extend after restart");
    assert_eq!(reloaded.tip_hash(), Some(block.hash()));
}

#[test]
fn pruning_releases_old_files_but_keeps_the_tip() {
    let mut config = test_config();
    // Tiny files so the chain spans many of them.
    config.max_block_file_size = 2_048;
    let mut chain = TestChain::with_config(config.clone());
    chain.mine_buffer_blocks((MIN_BLOCKS_TO_KEEP + 60) as usize);

    let keep_from = chain.tip_height() - MIN_BLOCKS_TO_KEEP;
    chain
        .state
        .prune_block_files_manual(chain.tip_height())
        .expect("prune");

    // Early blocks lost their data, recent blocks kept it.
    let index = chain.state.index();
    let early = chain.state.chain().at(1).expect("early block");
    assert!(!index.node(early).have_data());
    assert!(!index.node(early).have_undo());
    assert!(chain.state.read_block(early).is_err());
    let recent = chain.state.chain().at(keep_from + 10).expect("recent block");
    assert!(index.node(recent).have_data());
    assert!(chain.state.read_block(recent).is_ok());

    // Mining continues after pruning.
    chain.mine_buffer_blocks(2);
    // At least one early file is gone from disk.
    assert!(!chain.dir.path().join("blk00000.dat").exists());
}

#[test]
fn tx_index_resolves_transactions() {
    let mut config = test_config();
    config.txindex = true;
    let mut chain = TestChain::with_config(config);
    let fund = chain
        .mine_block(Vec::new(), vec![0x01, 0xb1, 0x75, 0x51])
        .expect("fund");
    let c1 = OutPoint::new(fund.transactions[0].txid(), 0);
    chain.mine_buffer_blocks(COINBASE_MATURITY as usize);
    let t1 = spend(c1, 50 * COIN, 1_000, 0xb2);
    let t1_txid = t1.txid();
    chain.mine_block(vec![t1.clone()], vec![0x6a]).expect("block");

    let indexed = chain
        .state
        .get_transaction(&t1_txid)
        .expect("lookup")
        .expect("present");
    assert_eq!(indexed, t1);
    assert_eq!(
        chain.state.get_transaction(&[0xeeu8; 32]).expect("lookup"),
        None
    );
}

#[test]
fn verify_db_replays_recent_blocks() {
    let mut chain = TestChain::new();
    let fund = chain
        .mine_block(Vec::new(), vec![0x01, 0xc1, 0x75, 0x51])
        .expect("fund");
    let c1 = OutPoint::new(fund.transactions[0].txid(), 0);
    chain.mine_buffer_blocks(COINBASE_MATURITY as usize);
    chain
        .mine_block(vec![spend(c1, 50 * COIN, 1_000, 0xc2)], vec![0x6a])
        .expect("spend block");

    chain.state.verify_db(3, 20).expect("verification passes");
}

#[test]
fn mempool_file_round_trips_through_chainstate() {
    let (mut chain, path) = {
        let chain = TestChain::new();
        let path = chain.dir.path().join("mempool.dat");
        (chain, path)
    };
    let fund = chain
        .mine_block(Vec::new(), vec![0x01, 0xd1, 0x75, 0x51])
        .expect("fund");
    let c1 = OutPoint::new(fund.transactions[0].txid(), 0);
    chain.mine_buffer_blocks(COINBASE_MATURITY as usize);

    let t1 = spend(c1, 50 * COIN, 1_000, 0xd2);
    let t1_txid = t1.txid();
    emberd_chainstate::mempool_accept::accept_to_mempool(
        &mut chain.state,
        t1,
        emberd_mempool::AcceptPolicy::default(),
        0,
    )
    .expect("accept");

    chain.state.dump_mempool(&path).expect("dump");
    {
        let mut pool = chain.state.mempool().lock().unwrap();
        let removed = pool.remove_with_descendants(&t1_txid, emberd_mempool::RemovalReason::Replaced);
        assert_eq!(removed.len(), 1);
    }

    let (accepted, failed) = chain.state.load_mempool(&path, 0).expect("load");
    assert_eq!((accepted, failed), (1, 0));
    assert!(chain.state.mempool().lock().unwrap().contains(&t1_txid));
}
