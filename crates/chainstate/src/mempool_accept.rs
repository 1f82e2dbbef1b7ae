//! Mempool admission: the policy pipeline a loose transaction passes before
//! entering the pool.

use std::collections::HashMap;

use emberd_consensus::constants::COINBASE_MATURITY;
use emberd_consensus::money::MAX_MONEY;
use emberd_consensus::Hash256;
use emberd_mempool::entry::{modified_size, MempoolEntry};
use emberd_mempool::policy::allow_free;
use emberd_mempool::{AcceptPolicy, MempoolError, MempoolErrorKind, MEMPOOL_HEIGHT};
use emberd_primitives::outpoint::OutPoint;
use emberd_primitives::transaction::Transaction;
use emberd_script::interpreter::{verify_script, ScriptFlags};
use emberd_script::standard::{
    classify_script_pubkey, count_sigops, is_dust, is_standard_null_data, parse_push_only_stack,
    ScriptType,
};
use emberd_storage::KeyValueStore;

use crate::coins::{Coin, CoinsBackend, MempoolCoins};
use crate::locks::LockPoints;
use crate::state::{unix_time, ChainState, ScriptCache};
use crate::validate::{check_transaction, contextual_check_transaction, tx_legacy_sigops};

#[derive(Debug)]
pub struct AcceptOutcome {
    pub txid: Hash256,
}

struct PrevInfo {
    coin: Coin,
}

/// Runs the full admission pipeline and inserts on success. Missing inputs
/// surface as a distinguished outcome (the caller may park the transaction
/// as an orphan), not as invalidity.
pub fn accept_to_mempool<S: KeyValueStore>(
    chainstate: &mut ChainState<S>,
    tx: Transaction,
    policy: AcceptPolicy,
    adjusted_time: i64,
) -> Result<AcceptOutcome, MempoolError> {
    let txid = tx.txid();
    let now = unix_time();
    let relay_policy = chainstate.mempool_policy.clone();
    let require_standard = relay_policy.require_standard;

    // Context-free shape.
    if tx.is_coinbase() {
        return Err(MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            "coinbase",
        ));
    }
    check_transaction(&tx, true)
        .map_err(|failure| MempoolError::new(MempoolErrorKind::InvalidTransaction, failure.reason))?;

    // Standard shape.
    let raw = tx.consensus_encode_to_vec();
    if require_standard {
        check_standard_shape(&tx, raw.len(), &relay_policy)?;
    }

    // Finality for the next block.
    let next_height = chainstate.tip_height() + 1;
    let tip_mtp = chainstate
        .tip()
        .map(|tip| chainstate.index().median_time_past(tip))
        .unwrap_or(0);
    let cutoff_time = tip_mtp.max(adjusted_time);
    contextual_check_transaction(&tx, next_height, cutoff_time, &chainstate.params().consensus)
        .map_err(|failure| MempoolError::new(MempoolErrorKind::NonStandard, failure.reason))?;

    // Duplicates: in the pool, or already confirmed.
    {
        let pool = chainstate.mempool.lock().expect("mempool lock");
        if pool.contains(&txid) {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyInMempool,
                "txn-already-in-mempool",
            ));
        }
        for output_index in 0..tx.vout.len() as u32 {
            let confirmed = chainstate
                .coins
                .have_coin(&OutPoint::new(txid, output_index))
                .map_err(internal)?;
            if confirmed {
                return Err(MempoolError::new(
                    MempoolErrorKind::AlreadyKnown,
                    "txn-already-known",
                ));
            }
        }

        // Conflicts: no replacement, first spender wins.
        for input in &tx.vin {
            if pool.spender(&input.prevout).is_some() {
                return Err(MempoolError::new(
                    MempoolErrorKind::ConflictingInput,
                    "txn-mempool-conflict",
                ));
            }
        }
    }

    // Resolve inputs through the mempool overlay.
    let (previnfos, lock_points) = {
        let pool = chainstate.mempool.lock().expect("mempool lock");
        let view = MempoolCoins::new(&chainstate.coins, &pool);
        let mut previnfos: HashMap<OutPoint, PrevInfo> = HashMap::new();
        let mut missing: Vec<OutPoint> = Vec::new();
        for input in &tx.vin {
            match view.coin(&input.prevout).map_err(internal)? {
                Some(coin) => {
                    previnfos.insert(input.prevout.clone(), PrevInfo { coin });
                }
                None => missing.push(input.prevout.clone()),
            }
        }
        if !missing.is_empty() {
            missing.sort();
            return Err(MempoolError::missing_inputs(missing));
        }

        // Relative locks against the next block.
        let lock_points = chainstate
            .check_sequence_locks(&tx, &view)
            .map_err(internal)?
            .ok_or_else(|| {
                MempoolError::new(MempoolErrorKind::NonStandard, "non-BIP68-final")
            })?;
        (previnfos, lock_points)
    };

    // Input-level policy and money accounting.
    let mut value_in = 0i64;
    let mut spends_coinbase = false;
    let mut parents: Vec<Hash256> = Vec::new();
    for input in &tx.vin {
        let info = &previnfos[&input.prevout];
        if info.coin.height == MEMPOOL_HEIGHT {
            parents.push(input.prevout.txid);
        }
        if info.coin.is_coinbase {
            spends_coinbase = true;
            if next_height - (info.coin.height as i32) < COINBASE_MATURITY {
                return Err(MempoolError::new(
                    MempoolErrorKind::InvalidTransaction,
                    "bad-txns-premature-spend-of-coinbase",
                ));
            }
        }
        value_in = value_in.checked_add(info.coin.value).ok_or_else(|| {
            MempoolError::new(MempoolErrorKind::InvalidTransaction, "bad-txns-inputvalues-outofrange")
        })?;
    }
    if value_in > MAX_MONEY {
        return Err(MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            "bad-txns-inputvalues-outofrange",
        ));
    }
    parents.sort();
    parents.dedup();

    if require_standard {
        check_standard_inputs(&tx, &previnfos, &relay_policy)?;
    }

    // Fee, modified fee, and signature-operation accounting.
    let value_out: i64 = tx.vout.iter().map(|output| output.value).sum();
    if value_in < value_out {
        return Err(MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            "bad-txns-in-belowout",
        ));
    }
    let fee = value_in - value_out;
    let fee_delta = {
        let pool = chainstate.mempool.lock().expect("mempool lock");
        pool.prioritisation(&txid)
            .map(|delta| delta.fee_delta)
            .unwrap_or(0)
    };
    let modified_fee = fee.saturating_add(fee_delta);

    let mut sigops = tx_legacy_sigops(&tx);
    for input in &tx.vin {
        let info = &previnfos[&input.prevout];
        sigops = sigops.saturating_add(emberd_script::standard::p2sh_sigop_count(
            &info.coin.script_pubkey,
            &input.script_sig,
        ));
    }
    if require_standard && sigops > relay_policy.max_standard_tx_sigops {
        return Err(MempoolError::new(
            MempoolErrorKind::NonStandard,
            "bad-txns-too-many-sigops",
        ));
    }

    let size = raw.len();
    let priority = starting_priority(&tx, &previnfos, chainstate.tip_height(), size);

    // Dynamic minimum feerate, bootstrapped from the eviction threshold.
    if !policy.bypass_limits {
        let min_feerate = {
            let mut pool = chainstate.mempool.lock().expect("mempool lock");
            pool.min_feerate_per_kb(now)
        };
        let floor = emberd_script::standard::min_relay_fee_for_size(min_feerate, size);
        if min_feerate > 0 && modified_fee < floor {
            return Err(MempoolError::new(
                MempoolErrorKind::InsufficientFee,
                "mempool-min-fee-not-met",
            ));
        }
    }

    // Relay priority gate and the free-transaction rate limiter.
    if policy.limit_free {
        let min_relay_fee = relay_policy.min_relay_fee_for_size(size);
        if modified_fee < min_relay_fee && !allow_free(priority) {
            return Err(MempoolError::new(
                MempoolErrorKind::InsufficientFee,
                "insufficient-priority",
            ));
        }
        if modified_fee < min_relay_fee {
            let mut limiter = chainstate.free_relay.lock().expect("free relay lock");
            if !limiter.consume(
                size,
                relay_policy.limit_free_relay_kb_per_minute,
                now,
            ) {
                return Err(MempoolError::new(
                    MempoolErrorKind::InsufficientFee,
                    "rate-limited-free-transaction",
                ));
            }
        }
    }

    // Absurd-fee guard, off unless the caller supplies a cap.
    if let Some(cap) = policy.absurd_fee {
        if fee > cap {
            return Err(MempoolError::new(MempoolErrorKind::HighFee, "absurdly-high-fee"));
        }
    }

    // Ancestor package limits.
    {
        let pool = chainstate.mempool.lock().expect("mempool lock");
        pool.calculate_ancestors(
            &parents,
            relay_policy.limit_ancestor_count,
            relay_policy.limit_ancestor_size,
        )?;
    }

    // Script verification with standard flags, then a consensus-flag
    // re-check through the script cache; the second pass would only differ
    // on a policy/consensus divergence, which is a bug worth trapping.
    let (consensus_flags, _) = chainstate.flags_for_height(next_height);
    let standard_flags = if require_standard {
        emberd_script::interpreter::STANDARD_SCRIPT_VERIFY_FLAGS
            | (consensus_flags & emberd_script::interpreter::SCRIPT_ENABLE_SIGHASH_FORKID)
    } else {
        consensus_flags
    };
    check_inputs(&tx, &previnfos, standard_flags)
        .map_err(|err| MempoolError::new(MempoolErrorKind::InvalidScript, err))?;

    let cache_key = ScriptCache::key(&txid, consensus_flags);
    let cached = {
        let cache = chainstate.script_cache.lock().expect("script cache lock");
        cache.contains(&cache_key)
    };
    if !cached {
        check_inputs(&tx, &previnfos, consensus_flags).map_err(|err| {
            MempoolError::new(
                MempoolErrorKind::InvalidScript,
                format!("BUG: passed standard flags but failed consensus flags: {err}"),
            )
        })?;
        let mut cache = chainstate.script_cache.lock().expect("script cache lock");
        cache.insert(cache_key);
    }

    // Insert, register for fee estimation, then enforce pool limits.
    let entry_modified_size = modified_size(&tx, raw.len());
    let entry = MempoolEntry {
        txid,
        tx,
        raw,
        time: now,
        height: chainstate.tip_height(),
        fee,
        fee_delta: 0,
        value_in,
        modified_size: entry_modified_size,
        priority,
        priority_delta: 0.0,
        sigops,
        spends_coinbase,
        lock_points: LockPoints {
            height: lock_points.height,
            time: lock_points.time,
            max_input_block: lock_points.max_input_block,
        },
        spent_outpoints: entry_spent_outpoints(&previnfos),
        parents: parents.clone(),
        was_clear_at_entry: parents.is_empty(),
    };
    let feerate = entry.feerate_per_kb();
    {
        let mut pool = chainstate.mempool.lock().expect("mempool lock");
        pool.insert(entry)?;
    }

    if parents.is_empty() && !chainstate.is_initial_block_download() {
        chainstate
            .estimator
            .lock()
            .expect("estimator lock")
            .process_tx(txid, feerate, chainstate.tip_height());
    }

    if !policy.bypass_limits {
        let (evicted, evicted_outpoints) = {
            let mut pool = chainstate.mempool.lock().expect("mempool lock");
            let mut expired = pool.expire(now);
            let (trimmed, outpoints) = pool.trim_to_size(now);
            expired.extend(trimmed.iter().copied());
            (expired, outpoints)
        };
        for outpoint in &evicted_outpoints {
            chainstate.coins.uncache(outpoint);
        }
        if !evicted.is_empty() {
            let mut estimator = chainstate.estimator.lock().expect("estimator lock");
            for evicted_txid in &evicted {
                estimator.remove_tx(evicted_txid);
            }
        }
        if evicted.contains(&txid) {
            return Err(MempoolError::new(
                MempoolErrorKind::InsufficientFee,
                "mempool-full",
            ));
        }
    }

    emberd_log::log_debug!(
        "accepted transaction {} (fee {fee}, size {size})",
        crate::state::hex_prefix(&txid)
    );
    Ok(AcceptOutcome { txid })
}

/// Retries orphans whose missing parent just arrived, breadth-first over
/// the newly accepted transactions.
pub fn process_orphans_after_accept<S: KeyValueStore>(
    chainstate: &mut ChainState<S>,
    parent_txid: Hash256,
    adjusted_time: i64,
) -> Vec<Hash256> {
    let mut queue = vec![parent_txid];
    let mut accepted = Vec::new();
    while let Some(parent) = queue.pop() {
        let orphans = {
            let mut pool = chainstate.mempool.lock().expect("mempool lock");
            pool.take_orphans_for_parent(&parent)
        };
        for (orphan_txid, raw) in orphans {
            let Ok(tx) = emberd_primitives::encoding::decode::<Transaction>(&raw) else {
                continue;
            };
            match accept_to_mempool(
                chainstate,
                tx,
                AcceptPolicy {
                    limit_free: true,
                    absurd_fee: None,
                    bypass_limits: false,
                },
                adjusted_time,
            ) {
                Ok(outcome) => {
                    accepted.push(outcome.txid);
                    queue.push(outcome.txid);
                }
                Err(err) if err.kind == MempoolErrorKind::MissingInput => {
                    let mut pool = chainstate.mempool.lock().expect("mempool lock");
                    pool.store_orphan(orphan_txid, raw, &err.missing_inputs, unix_time());
                }
                Err(_) => {}
            }
        }
    }
    accepted
}

fn internal(err: crate::error::ChainstateError) -> MempoolError {
    MempoolError::new(MempoolErrorKind::Internal, err.to_string())
}

fn entry_spent_outpoints(previnfos: &HashMap<OutPoint, PrevInfo>) -> Vec<OutPoint> {
    let mut outpoints: Vec<OutPoint> = previnfos.keys().cloned().collect();
    outpoints.sort();
    outpoints
}

fn check_standard_shape(
    tx: &Transaction,
    size: usize,
    policy: &emberd_mempool::MempoolPolicy,
) -> Result<(), MempoolError> {
    if !(1..=2).contains(&tx.version) {
        return Err(MempoolError::new(MempoolErrorKind::NonStandard, "version"));
    }
    if size > policy.max_standard_tx_size {
        return Err(MempoolError::new(MempoolErrorKind::NonStandard, "tx-size"));
    }
    for input in &tx.vin {
        if input.script_sig.len() > policy.max_scriptsig_size {
            return Err(MempoolError::new(
                MempoolErrorKind::NonStandard,
                "scriptsig-size",
            ));
        }
        if parse_push_only_stack(&input.script_sig).is_none() {
            return Err(MempoolError::new(
                MempoolErrorKind::NonStandard,
                "scriptsig-not-pushonly",
            ));
        }
    }

    let mut null_data_outputs = 0usize;
    for output in &tx.vout {
        match classify_script_pubkey(&output.script_pubkey) {
            ScriptType::P2Pk | ScriptType::P2Pkh | ScriptType::P2Sh => {
                if is_dust(output.value, &output.script_pubkey, policy.min_relay_fee_per_kb) {
                    return Err(MempoolError::new(MempoolErrorKind::NonStandard, "dust"));
                }
            }
            ScriptType::NullData => {
                if !is_standard_null_data(&output.script_pubkey, policy.max_null_data_bytes) {
                    return Err(MempoolError::new(
                        MempoolErrorKind::NonStandard,
                        "oversize-op-return",
                    ));
                }
                null_data_outputs += 1;
            }
            ScriptType::Unknown => {
                return Err(MempoolError::new(
                    MempoolErrorKind::NonStandard,
                    "scriptpubkey",
                ));
            }
        }
    }
    if null_data_outputs > 1 {
        return Err(MempoolError::new(
            MempoolErrorKind::NonStandard,
            "multi-op-return",
        ));
    }
    Ok(())
}

fn check_standard_inputs(
    tx: &Transaction,
    previnfos: &HashMap<OutPoint, PrevInfo>,
    policy: &emberd_mempool::MempoolPolicy,
) -> Result<(), MempoolError> {
    for input in &tx.vin {
        let info = &previnfos[&input.prevout];
        let stack = parse_push_only_stack(&input.script_sig)
            .ok_or_else(|| MempoolError::new(MempoolErrorKind::NonStandard, "scriptsig"))?;
        match classify_script_pubkey(&info.coin.script_pubkey) {
            ScriptType::P2Pkh => {
                if stack.len() != 2 {
                    return Err(MempoolError::new(
                        MempoolErrorKind::NonStandard,
                        "scriptsig-args",
                    ));
                }
            }
            ScriptType::P2Pk => {
                if stack.len() != 1 {
                    return Err(MempoolError::new(
                        MempoolErrorKind::NonStandard,
                        "scriptsig-args",
                    ));
                }
            }
            ScriptType::P2Sh => {
                let redeem = stack
                    .last()
                    .filter(|item| !item.is_empty())
                    .ok_or_else(|| MempoolError::new(MempoolErrorKind::NonStandard, "p2sh-redeem"))?;
                if redeem.len() > 520 {
                    return Err(MempoolError::new(
                        MempoolErrorKind::NonStandard,
                        "p2sh-redeem-size",
                    ));
                }
                if count_sigops(redeem, true) > policy.max_p2sh_sigops {
                    return Err(MempoolError::new(
                        MempoolErrorKind::NonStandard,
                        "p2sh-sigops",
                    ));
                }
            }
            ScriptType::NullData | ScriptType::Unknown => {
                return Err(MempoolError::new(
                    MempoolErrorKind::NonStandard,
                    "nonstandard-input",
                ));
            }
        }
    }
    Ok(())
}

fn check_inputs(
    tx: &Transaction,
    previnfos: &HashMap<OutPoint, PrevInfo>,
    flags: ScriptFlags,
) -> Result<(), String> {
    for (input_index, input) in tx.vin.iter().enumerate() {
        let info = &previnfos[&input.prevout];
        verify_script(
            &input.script_sig,
            &info.coin.script_pubkey,
            tx,
            input_index,
            info.coin.value,
            flags,
        )
        .map_err(|err| format!("input {input_index}: {err}"))?;
    }
    Ok(())
}

fn starting_priority(
    tx: &Transaction,
    previnfos: &HashMap<OutPoint, PrevInfo>,
    tip_height: i32,
    size: usize,
) -> f64 {
    let modified = modified_size(tx, size);
    if modified == 0 {
        return 0.0;
    }
    let mut aggregate = 0.0f64;
    for input in &tx.vin {
        let info = &previnfos[&input.prevout];
        let coin_height = info.coin.height as i32;
        if info.coin.height == MEMPOOL_HEIGHT || coin_height >= tip_height {
            continue;
        }
        let age = (tip_height - coin_height) as f64;
        aggregate += info.coin.value.max(0) as f64 * age;
    }
    aggregate / modified as f64
}
