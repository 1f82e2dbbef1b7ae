//! Linear-chain activation: genesis, connecting spends, and inverting them.

mod common;

use common::{spend, TestChain};
use emberd_chainstate::coins::CoinsBackend;
use emberd_consensus::constants::COINBASE_MATURITY;
use emberd_consensus::money::COIN;
use emberd_primitives::outpoint::OutPoint;

#[test]
fn genesis_only_sets_tip_without_coins() {
    let chain = TestChain::new();
    assert_eq!(chain.tip_height(), 0);
    assert_eq!(chain.tip_hash(), chain.genesis_hash);
    // The genesis coinbase is unspendable: no coin entries exist.
    assert_eq!(
        chain.state.coins().best_block().expect("best block"),
        Some(chain.genesis_hash)
    );
    assert_eq!(chain.state.coins().entry_count(), 0);
}

#[test]
fn coinbase_spend_chain_and_disconnect_restores_coins() {
    let mut chain = TestChain::new();
    // Buffer out of the coinbase-maturity window with unspendable coinbases.
    chain.mine_buffer_blocks(COINBASE_MATURITY as usize);

    // B1: a spendable coinbase C1.
    let b1 = chain.mine_block(Vec::new(), vec![0x01, 0xaa, 0x75, 0x51]).expect("b1");
    let c1 = OutPoint::new(b1.transactions[0].txid(), 0);
    let b1_height = chain.tip_height();
    let c1_value = b1.transactions[0].vout[0].value;
    assert_eq!(c1_value, 50 * COIN);
    assert!(chain.state.coins().have_coin(&c1).expect("have"));

    // Mature C1.
    chain.mine_buffer_blocks(COINBASE_MATURITY as usize);

    // B2: T2 spends C1.
    let t2 = spend(c1.clone(), c1_value, 10_000, 0xbb);
    let t2_out = OutPoint::new(t2.txid(), 0);
    let b2 = chain.mine_block(vec![t2], vec![0x6a]).expect("b2");
    let b2_hash = b2.hash();

    // B3 on top.
    chain.mine_block(Vec::new(), vec![0x6a]).expect("b3");

    // The coins view now holds exactly T2's output.
    assert!(!chain.state.coins().have_coin(&c1).expect("have"));
    let t2_coin = chain
        .state
        .coins()
        .coin(&t2_out)
        .expect("coin")
        .expect("present");
    assert_eq!(t2_coin.value, c1_value - 10_000);
    assert_eq!(t2_coin.height as i32, chain.tip_height() - 1);
    assert!(!t2_coin.is_coinbase);

    // Disconnect B3 and B2 by invalidating B2: C1 is unspent again and
    // T2's output is gone.
    chain.state.invalidate_block(&b2_hash).expect("invalidate");
    assert_eq!(chain.tip_height(), b1_height + COINBASE_MATURITY);
    assert!(chain.state.coins().have_coin(&c1).expect("have"));
    assert!(!chain.state.coins().have_coin(&t2_out).expect("have"));
    let c1_coin = chain
        .state
        .coins()
        .coin(&c1)
        .expect("coin")
        .expect("present");
    assert_eq!(c1_coin.value, c1_value);
    assert!(c1_coin.is_coinbase);
    assert_eq!(c1_coin.height as i32, b1_height);

    // T2 was resurrected into the mempool by the disconnect.
    let pool = chain.state.mempool().lock().unwrap();
    assert!(pool.contains(&t2_out.txid));

    // The coins best block tracks the new tip.
    assert_eq!(
        chain.state.coins().best_block().expect("best"),
        chain.state.tip_hash()
    );
}

#[test]
fn chain_work_accumulates_and_candidates_track_tip() {
    let mut chain = TestChain::new();
    chain.mine_buffer_blocks(5);
    let index = chain.state.index();
    let tip = chain.state.tip().expect("tip");
    let genesis = index.lookup(&chain.genesis_hash).expect("genesis");
    assert!(index.node(tip).chain_work > index.node(genesis).chain_work);
    assert_eq!(index.node(tip).height, 5);
    // nChainTx counts every transaction up the chain (one coinbase each).
    assert_eq!(index.node(tip).chain_tx_count, 6);
    assert_eq!(index.best_candidate(), Some(tip));
}

#[test]
fn immature_coinbase_spend_fails_connection() {
    let mut chain = TestChain::new();
    let b1 = chain.mine_block(Vec::new(), vec![0x01, 0xcc, 0x75, 0x51]).expect("b1");
    let c1 = OutPoint::new(b1.transactions[0].txid(), 0);
    let tip_before = chain.tip_hash();

    // Spending a 1-confirmation coinbase passes the context-free checks but
    // fails connection; the activation pass marks the block and keeps the
    // old tip.
    let premature = spend(c1, 50 * COIN, 0, 0xdd);
    let bad = chain.mine_block(vec![premature], vec![0x6a]).expect("accepted for storage");
    assert_eq!(chain.tip_hash(), tip_before);
    let node = chain.state.index().lookup(&bad.hash()).expect("indexed");
    assert!(chain.state.index().node(node).failed());
}

#[test]
fn missing_input_block_fails_connection() {
    let mut chain = TestChain::new();
    let bogus = spend(OutPoint::new([0x77u8; 32], 0), 50 * COIN, 0, 0xee);
    let tip_before = chain.tip_hash();
    let bad = chain.mine_block(vec![bogus], vec![0x6a]).expect("accepted for storage");
    assert_eq!(chain.tip_hash(), tip_before);
    let node = chain.state.index().lookup(&bad.hash()).expect("indexed");
    assert!(chain.state.index().node(node).failed());
    // The failed block left the candidate set; the tip is best again.
    assert_eq!(chain.state.index().best_candidate(), chain.state.tip());
}
