//! Reorganization: switching to a heavier branch, transaction resurrection,
//! notification ordering, and returning to the original branch.

mod common;

use common::{spend, Event, TestChain, SPACING};
use emberd_chainstate::coins::CoinsBackend;
use emberd_consensus::constants::COINBASE_MATURITY;
use emberd_consensus::money::COIN;
use emberd_primitives::outpoint::OutPoint;

#[test]
fn heavier_branch_wins_and_resurrects_transactions() {
    let mut chain = TestChain::new();

    // A spendable coin confirmed well before the fork point.
    let fund = chain.mine_block(Vec::new(), vec![0x01, 0x41, 0x75, 0x51]).expect("fund");
    let c1 = OutPoint::new(fund.transactions[0].txid(), 0);
    chain.mine_buffer_blocks(COINBASE_MATURITY as usize);

    let fork_hash = chain.tip_hash();
    let fork_height = chain.tip_height();
    let fork_time = chain.tip_time();

    // Branch A: A1 carries a spend of C1, A2 extends it.
    let ta = spend(c1.clone(), 50 * COIN, 5_000, 0x42);
    let ta_txid = ta.txid();
    let _a1 = chain.mine_block(vec![ta], vec![0x6a]).expect("a1");
    let a2 = chain.mine_block(Vec::new(), vec![0x6a]).expect("a2");
    assert_eq!(chain.tip_hash(), a2.hash());
    assert!(!chain.state.coins().have_coin(&c1).expect("have"));

    // Branch B: three blocks from the fork point, not including TA.
    let b1 = chain.build_on(
        fork_hash,
        fork_height + 1,
        fork_time + SPACING + 7,
        Vec::new(),
        vec![0x6a],
    );
    let b2 = chain.build_on(
        b1.hash(),
        fork_height + 2,
        fork_time + 2 * SPACING + 7,
        Vec::new(),
        vec![0x6a],
    );
    let b3 = chain.build_on(
        b2.hash(),
        fork_height + 3,
        fork_time + 3 * SPACING + 7,
        Vec::new(),
        vec![0x6a],
    );

    // One and two blocks do not displace the equally/heavier branch A.
    chain.submit(&b1).expect("b1");
    assert_eq!(chain.tip_hash(), a2.hash());
    chain.submit(&b2).expect("b2");
    assert_eq!(chain.tip_hash(), a2.hash());

    chain.notifier.events.lock().unwrap().clear();
    chain.submit(&b3).expect("b3");
    assert_eq!(chain.tip_hash(), b3.hash());
    assert_eq!(chain.tip_height(), fork_height + 3);

    // TA is back in the mempool and its effects are unwound.
    assert!(chain.state.mempool().lock().unwrap().contains(&ta_txid));
    assert!(chain.state.coins().have_coin(&c1).expect("have"));
    assert_eq!(
        chain.state.coins().best_block().expect("best"),
        Some(b3.hash())
    );

    // Ordering: every disconnect-side event precedes every connect-side
    // event, and the tip notification comes after all of them.
    let events = chain.notifier.events.lock().unwrap().clone();
    let first_connect = events
        .iter()
        .position(|event| matches!(event, Event::Tx { block: Some(_), .. }))
        .expect("connect events");
    let last_disconnect = events
        .iter()
        .rposition(|event| matches!(event, Event::Tx { block: None, .. }))
        .expect("disconnect events");
    assert!(last_disconnect < first_connect);
    assert!(events
        .iter()
        .any(|event| matches!(event, Event::Tx { txid, block: None, .. } if *txid == ta_txid)));
    assert_eq!(events.last(), Some(&Event::Tip(b3.hash())));

    // Connect-side events carry block hashes in connection order.
    let connect_blocks: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::Tx { block: Some(hash), .. } => Some(*hash),
            _ => None,
        })
        .collect();
    assert_eq!(connect_blocks, vec![b1.hash(), b2.hash(), b3.hash()]);
}

#[test]
fn reorg_round_trip_restores_original_state() {
    let mut chain = TestChain::new();
    let fund = chain.mine_block(Vec::new(), vec![0x01, 0x51, 0x75, 0x51]).expect("fund");
    let c1 = OutPoint::new(fund.transactions[0].txid(), 0);
    chain.mine_buffer_blocks(COINBASE_MATURITY as usize);

    let fork_hash = chain.tip_hash();
    let fork_height = chain.tip_height();
    let fork_time = chain.tip_time();

    let ta = spend(c1.clone(), 50 * COIN, 5_000, 0x52);
    let ta_out = OutPoint::new(ta.txid(), 0);
    let _a1 = chain.mine_block(vec![ta], vec![0x6a]).expect("a1");
    let a2 = chain.mine_block(Vec::new(), vec![0x6a]).expect("a2");

    let b1 = chain.build_on(
        fork_hash,
        fork_height + 1,
        fork_time + SPACING + 9,
        Vec::new(),
        vec![0x6a],
    );
    let b2 = chain.build_on(
        b1.hash(),
        fork_height + 2,
        fork_time + 2 * SPACING + 9,
        Vec::new(),
        vec![0x6a],
    );
    let b3 = chain.build_on(
        b2.hash(),
        fork_height + 3,
        fork_time + 3 * SPACING + 9,
        Vec::new(),
        vec![0x6a],
    );
    chain.submit(&b1).expect("b1");
    chain.submit(&b2).expect("b2");
    chain.submit(&b3).expect("b3");
    assert_eq!(chain.tip_hash(), b3.hash());
    assert!(chain.state.coins().have_coin(&c1).expect("have"));
    assert!(!chain.state.coins().have_coin(&ta_out).expect("have"));

    // Operator rejects the B branch: the chain returns to A and the
    // resurrected TA is mined back out of the mempool.
    chain.state.invalidate_block(&b1.hash()).expect("invalidate");
    assert_eq!(chain.tip_hash(), a2.hash());
    assert!(!chain.state.coins().have_coin(&c1).expect("have"));
    assert!(chain.state.coins().have_coin(&ta_out).expect("have"));
    assert!(!chain.state.mempool().lock().unwrap().contains(&ta_out.txid));

    // Reconsidering B restores the heavier branch and the mempool entry.
    chain.state.reconsider_block(&b1.hash()).expect("reconsider");
    assert_eq!(chain.tip_hash(), b3.hash());
    assert!(chain.state.coins().have_coin(&c1).expect("have"));
    assert!(!chain.state.coins().have_coin(&ta_out).expect("have"));
    assert!(chain.state.mempool().lock().unwrap().contains(&ta_out.txid));
    assert_eq!(
        chain.state.coins().best_block().expect("best"),
        Some(b3.hash())
    );
}

#[test]
fn precious_block_prefers_equal_work_tip() {
    let mut chain = TestChain::new();
    chain.mine_buffer_blocks(3);
    let fork_hash = chain.tip_hash();
    let fork_height = chain.tip_height();
    let fork_time = chain.tip_time();

    // A1 arrives first and wins; P1 has equal work and loses the tie.
    let a1 = chain.mine_block(Vec::new(), vec![0x6a]).expect("a1");
    let p1 = chain.build_on(
        fork_hash,
        fork_height + 1,
        fork_time + SPACING + 3,
        Vec::new(),
        vec![0x6a],
    );
    chain.submit(&p1).expect("p1");
    assert_eq!(chain.tip_hash(), a1.hash());

    // Marking P1 precious flips the tie-break.
    chain.state.precious_block(&p1.hash()).expect("precious");
    assert_eq!(chain.tip_hash(), p1.hash());

    // And A1 stays available: precious is only a preference.
    chain.state.precious_block(&a1.hash()).expect("precious");
    assert_eq!(chain.tip_hash(), a1.hash());
}
