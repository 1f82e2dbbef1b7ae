//! Script interpreter: the verification predicate invoked by the
//! block-connect and mempool-admission paths.

use emberd_primitives::hash::{hash160, sha256, sha256d};
use emberd_primitives::transaction::Transaction;
use secp256k1::{ecdsa::Signature, Message, PublicKey};

use crate::secp::secp256k1_verify;
use crate::sighash::{signature_hash, SighashType};
use crate::standard::{is_p2sh, is_push_only};

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
pub const SCRIPT_VERIFY_DERSIG: ScriptFlags = 1 << 2;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 3;
pub const SCRIPT_VERIFY_NULLDUMMY: ScriptFlags = 1 << 4;
pub const SCRIPT_VERIFY_SIGPUSHONLY: ScriptFlags = 1 << 5;
pub const SCRIPT_VERIFY_MINIMALDATA: ScriptFlags = 1 << 6;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS: ScriptFlags = 1 << 7;
pub const SCRIPT_VERIFY_CLEANSTACK: ScriptFlags = 1 << 8;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: ScriptFlags = 1 << 9;
pub const SCRIPT_VERIFY_CHECKSEQUENCEVERIFY: ScriptFlags = 1 << 10;
pub const SCRIPT_VERIFY_NULLFAIL: ScriptFlags = 1 << 14;
pub const SCRIPT_ENABLE_SIGHASH_FORKID: ScriptFlags = 1 << 16;

pub const MANDATORY_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH;
pub const STANDARD_SCRIPT_VERIFY_FLAGS: ScriptFlags = MANDATORY_SCRIPT_VERIFY_FLAGS
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_VERIFY_DERSIG
    | SCRIPT_VERIFY_LOW_S
    | SCRIPT_VERIFY_NULLDUMMY
    | SCRIPT_VERIFY_MINIMALDATA
    | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | SCRIPT_VERIFY_CLEANSTACK
    | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
    | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY
    | SCRIPT_VERIFY_NULLFAIL
    | SCRIPT_ENABLE_SIGHASH_FORKID;

const MAX_SCRIPT_SIZE: usize = 10_000;
const MAX_STACK_SIZE: usize = 1_000;
const MAX_OPS_PER_SCRIPT: usize = 201;
const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
const MAX_PUBKEYS_PER_MULTISIG: i64 = 20;

const LOCKTIME_THRESHOLD: i64 = 500_000_000;
const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_1NEGATE: u8 = 0x4f;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_NOP: u8 = 0x61;
const OP_IF: u8 = 0x63;
const OP_NOTIF: u8 = 0x64;
const OP_ELSE: u8 = 0x67;
const OP_ENDIF: u8 = 0x68;
const OP_VERIFY: u8 = 0x69;
const OP_RETURN: u8 = 0x6a;
const OP_DROP: u8 = 0x75;
const OP_DUP: u8 = 0x76;
const OP_SWAP: u8 = 0x7c;
const OP_SIZE: u8 = 0x82;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_NOT: u8 = 0x91;
const OP_RIPEMD160: u8 = 0xa6;
const OP_SHA256: u8 = 0xa8;
const OP_HASH160: u8 = 0xa9;
const OP_HASH256: u8 = 0xaa;
const OP_CODESEPARATOR: u8 = 0xab;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
const OP_NOP1: u8 = 0xb0;
const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;
const OP_NOP10: u8 = 0xb9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    ScriptSize,
    StackUnderflow,
    StackOverflow,
    OpCount,
    PushSize,
    EvalFalse,
    Verify,
    EqualVerify,
    OpReturn,
    BadOpcode,
    UnbalancedConditional,
    SigEncoding,
    PubkeyEncoding,
    SigHashType,
    SigNullFail,
    NullDummy,
    SigPushOnly,
    MinimalData,
    PubkeyCount,
    SigCount,
    NegativeLockTime,
    UnsatisfiedLockTime,
    DiscourageUpgradableNops,
    CleanStack,
    IllegalForkId,
    MustUseForkId,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            ScriptError::ScriptSize => "script too large",
            ScriptError::StackUnderflow => "script stack underflow",
            ScriptError::StackOverflow => "script stack overflow",
            ScriptError::OpCount => "operation limit exceeded",
            ScriptError::PushSize => "push exceeds element size limit",
            ScriptError::EvalFalse => "script evaluated to false",
            ScriptError::Verify => "verify failed",
            ScriptError::EqualVerify => "equalverify failed",
            ScriptError::OpReturn => "op_return encountered",
            ScriptError::BadOpcode => "invalid opcode",
            ScriptError::UnbalancedConditional => "unbalanced conditional",
            ScriptError::SigEncoding => "invalid signature encoding",
            ScriptError::PubkeyEncoding => "invalid public key encoding",
            ScriptError::SigHashType => "invalid sighash type",
            ScriptError::SigNullFail => "failed signature must be empty",
            ScriptError::NullDummy => "multisig dummy must be empty",
            ScriptError::SigPushOnly => "scriptSig is not push-only",
            ScriptError::MinimalData => "non-minimal push",
            ScriptError::PubkeyCount => "pubkey count out of range",
            ScriptError::SigCount => "signature count out of range",
            ScriptError::NegativeLockTime => "negative locktime operand",
            ScriptError::UnsatisfiedLockTime => "locktime requirement not satisfied",
            ScriptError::DiscourageUpgradableNops => "upgradable nop discouraged",
            ScriptError::CleanStack => "stack not clean after evaluation",
            ScriptError::IllegalForkId => "fork-id bit set without fork-id rules",
            ScriptError::MustUseForkId => "fork-id bit required",
        };
        write!(f, "{message}")
    }
}

impl std::error::Error for ScriptError {}

/// Verifies that `script_sig` satisfies `script_pubkey` for the given input
/// of `tx`, spending `amount`, under `flags`.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    tx: &Transaction,
    input_index: usize,
    amount: i64,
    flags: ScriptFlags,
) -> Result<(), ScriptError> {
    if (flags & SCRIPT_VERIFY_SIGPUSHONLY) != 0 && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let checker = SignatureChecker {
        tx,
        input_index,
        amount,
        flags,
    };

    let mut stack: Vec<Vec<u8>> = Vec::new();
    eval_script(script_sig, &mut stack, &checker)?;
    let stack_copy = stack.clone();
    eval_script(script_pubkey, &mut stack, &checker)?;

    if stack.last().map(|top| cast_to_bool(top)) != Some(true) {
        return Err(ScriptError::EvalFalse);
    }

    if (flags & SCRIPT_VERIFY_P2SH) != 0 && is_p2sh(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        let mut stack = stack_copy;
        let redeem_script = stack.pop().ok_or(ScriptError::StackUnderflow)?;
        eval_script(&redeem_script, &mut stack, &checker)?;
        if stack.last().map(|top| cast_to_bool(top)) != Some(true) {
            return Err(ScriptError::EvalFalse);
        }
        if (flags & SCRIPT_VERIFY_CLEANSTACK) != 0 && stack.len() != 1 {
            return Err(ScriptError::CleanStack);
        }
        return Ok(());
    }

    if (flags & SCRIPT_VERIFY_CLEANSTACK) != 0 && stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }

    Ok(())
}

struct SignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
    amount: i64,
    flags: ScriptFlags,
}

impl SignatureChecker<'_> {
    fn check_sig_encoding(&self, sig_bytes: &[u8]) -> Result<(), ScriptError> {
        if sig_bytes.is_empty() {
            return Ok(());
        }
        if (self.flags & (SCRIPT_VERIFY_DERSIG | SCRIPT_VERIFY_STRICTENC | SCRIPT_VERIFY_LOW_S))
            != 0
            && !is_valid_der_signature(&sig_bytes[..sig_bytes.len() - 1])
        {
            return Err(ScriptError::SigEncoding);
        }
        if (self.flags & SCRIPT_VERIFY_STRICTENC) != 0 {
            let sighash_type = SighashType(*sig_bytes.last().expect("non-empty") as u32);
            if !sighash_type.is_defined_base() {
                return Err(ScriptError::SigHashType);
            }
            let fork_id_enabled = (self.flags & SCRIPT_ENABLE_SIGHASH_FORKID) != 0;
            if sighash_type.has_fork_id() && !fork_id_enabled {
                return Err(ScriptError::IllegalForkId);
            }
            if !sighash_type.has_fork_id() && fork_id_enabled {
                return Err(ScriptError::MustUseForkId);
            }
        }
        Ok(())
    }

    /// Returns whether the signature verifies; encoding violations error out.
    fn check_sig(
        &self,
        sig_bytes: &[u8],
        pubkey_bytes: &[u8],
        script_code: &[u8],
    ) -> Result<bool, ScriptError> {
        if sig_bytes.is_empty() {
            return Ok(false);
        }
        self.check_sig_encoding(sig_bytes)?;
        if (self.flags & SCRIPT_VERIFY_STRICTENC) != 0 && !is_compressed_or_uncompressed(pubkey_bytes)
        {
            return Err(ScriptError::PubkeyEncoding);
        }

        let sighash_type = SighashType(*sig_bytes.last().expect("non-empty") as u32);
        let der = &sig_bytes[..sig_bytes.len() - 1];
        let Ok(sig) = Signature::from_der(der) else {
            return Ok(false);
        };

        if (self.flags & SCRIPT_VERIFY_LOW_S) != 0 {
            let mut normalized = sig;
            normalized.normalize_s();
            if normalized != sig {
                return Err(ScriptError::SigEncoding);
            }
        }

        let Ok(pubkey) = PublicKey::from_slice(pubkey_bytes) else {
            return Ok(false);
        };

        let sighash = match signature_hash(
            self.tx,
            self.input_index,
            script_code,
            self.amount,
            sighash_type,
        ) {
            Ok(hash) => hash,
            Err(_) => return Ok(false),
        };

        let mut sig = sig;
        sig.normalize_s();
        let Ok(message) = Message::from_digest_slice(&sighash) else {
            return Ok(false);
        };
        Ok(secp256k1_verify()
            .verify_ecdsa(&message, &sig, &pubkey)
            .is_ok())
    }

    fn check_lock_time(&self, lock_time: i64) -> Result<(), ScriptError> {
        let tx_lock_time = self.tx.lock_time as i64;
        let same_kind = (tx_lock_time < LOCKTIME_THRESHOLD && lock_time < LOCKTIME_THRESHOLD)
            || (tx_lock_time >= LOCKTIME_THRESHOLD && lock_time >= LOCKTIME_THRESHOLD);
        if !same_kind {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        if lock_time > tx_lock_time {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        if self.tx.vin[self.input_index].sequence == u32::MAX {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        Ok(())
    }

    fn check_sequence(&self, sequence: i64) -> Result<(), ScriptError> {
        let tx_sequence = self.tx.vin[self.input_index].sequence as i64;
        if self.tx.version < 2 {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        if (tx_sequence & i64::from(SEQUENCE_LOCKTIME_DISABLE_FLAG)) != 0 {
            return Err(ScriptError::UnsatisfiedLockTime);
        }

        let mask = i64::from(SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK);
        let masked_sequence = sequence & mask;
        let masked_tx_sequence = tx_sequence & mask;
        let type_flag = i64::from(SEQUENCE_LOCKTIME_TYPE_FLAG);
        let same_kind = (masked_tx_sequence < type_flag && masked_sequence < type_flag)
            || (masked_tx_sequence >= type_flag && masked_sequence >= type_flag);
        if !same_kind || masked_sequence > masked_tx_sequence {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        Ok(())
    }
}

fn eval_script(
    script: &[u8],
    stack: &mut Vec<Vec<u8>>,
    checker: &SignatureChecker<'_>,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }

    let flags = checker.flags;
    let mut cursor = 0usize;
    let mut script_code_start = 0usize;
    let mut op_count = 0usize;
    let mut exec_stack: Vec<bool> = Vec::new();

    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        let exec = exec_stack.iter().all(|branch| *branch);

        if opcode > 0x60 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }

        if opcode <= OP_PUSHDATA4 {
            let len = match opcode {
                OP_0 => 0,
                0x01..=0x4b => opcode as usize,
                OP_PUSHDATA1 => read_u8(script, &mut cursor)? as usize,
                OP_PUSHDATA2 => read_u16(script, &mut cursor)? as usize,
                _ => read_u32(script, &mut cursor)? as usize,
            };
            if len > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(ScriptError::PushSize);
            }
            let data = read_bytes(script, &mut cursor, len)?;
            if exec {
                if (flags & SCRIPT_VERIFY_MINIMALDATA) != 0 && !check_minimal_push(&data, opcode) {
                    return Err(ScriptError::MinimalData);
                }
                stack.push(data);
            }
        } else {
            match opcode {
                OP_1NEGATE => {
                    if exec {
                        stack.push(script_num_to_vec(-1));
                    }
                }
                OP_1..=OP_16 => {
                    if exec {
                        stack.push(script_num_to_vec(i64::from(opcode - OP_1 + 1)));
                    }
                }
                OP_NOP => {}
                OP_IF | OP_NOTIF => {
                    if exec {
                        let value = cast_to_bool(&pop(stack)?);
                        let branch = if opcode == OP_NOTIF { !value } else { value };
                        exec_stack.push(branch);
                    } else {
                        exec_stack.push(false);
                    }
                }
                OP_ELSE => {
                    let current = exec_stack
                        .pop()
                        .ok_or(ScriptError::UnbalancedConditional)?;
                    exec_stack.push(!current);
                }
                OP_ENDIF => {
                    if exec_stack.pop().is_none() {
                        return Err(ScriptError::UnbalancedConditional);
                    }
                }
                OP_VERIFY => {
                    if exec {
                        let value = pop(stack)?;
                        if !cast_to_bool(&value) {
                            return Err(ScriptError::Verify);
                        }
                    }
                }
                OP_RETURN => {
                    if exec {
                        return Err(ScriptError::OpReturn);
                    }
                }
                OP_DROP => {
                    if exec {
                        pop(stack)?;
                    }
                }
                OP_DUP => {
                    if exec {
                        let top = stack.last().ok_or(ScriptError::StackUnderflow)?.clone();
                        stack.push(top);
                    }
                }
                OP_SWAP => {
                    if exec {
                        let len = stack.len();
                        if len < 2 {
                            return Err(ScriptError::StackUnderflow);
                        }
                        stack.swap(len - 1, len - 2);
                    }
                }
                OP_SIZE => {
                    if exec {
                        let len = stack.last().ok_or(ScriptError::StackUnderflow)?.len();
                        stack.push(script_num_to_vec(len as i64));
                    }
                }
                OP_EQUAL | OP_EQUALVERIFY => {
                    if exec {
                        let right = pop(stack)?;
                        let left = pop(stack)?;
                        let equal = left == right;
                        if opcode == OP_EQUALVERIFY {
                            if !equal {
                                return Err(ScriptError::EqualVerify);
                            }
                        } else {
                            stack.push(bool_to_vec(equal));
                        }
                    }
                }
                OP_NOT => {
                    if exec {
                        let value = cast_to_bool(&pop(stack)?);
                        stack.push(bool_to_vec(!value));
                    }
                }
                OP_RIPEMD160 => {
                    if exec {
                        use ripemd::{Digest, Ripemd160};
                        let data = pop(stack)?;
                        stack.push(Ripemd160::digest(&data).to_vec());
                    }
                }
                OP_SHA256 => {
                    if exec {
                        let data = pop(stack)?;
                        stack.push(sha256(&data).to_vec());
                    }
                }
                OP_HASH160 => {
                    if exec {
                        let data = pop(stack)?;
                        stack.push(hash160(&data).to_vec());
                    }
                }
                OP_HASH256 => {
                    if exec {
                        let data = pop(stack)?;
                        stack.push(sha256d(&data).to_vec());
                    }
                }
                OP_CODESEPARATOR => {
                    if exec {
                        script_code_start = cursor;
                    }
                }
                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    if exec {
                        let pubkey = pop(stack)?;
                        let sig = pop(stack)?;
                        let script_code = &script[script_code_start..];
                        let valid = checker.check_sig(&sig, &pubkey, script_code)?;
                        if !valid && (flags & SCRIPT_VERIFY_NULLFAIL) != 0 && !sig.is_empty() {
                            return Err(ScriptError::SigNullFail);
                        }
                        if opcode == OP_CHECKSIGVERIFY {
                            if !valid {
                                return Err(ScriptError::Verify);
                            }
                        } else {
                            stack.push(bool_to_vec(valid));
                        }
                    }
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    if exec {
                        let key_count = pop_number(stack)?;
                        if !(0..=MAX_PUBKEYS_PER_MULTISIG).contains(&key_count) {
                            return Err(ScriptError::PubkeyCount);
                        }
                        op_count += key_count as usize;
                        if op_count > MAX_OPS_PER_SCRIPT {
                            return Err(ScriptError::OpCount);
                        }
                        let mut pubkeys = Vec::with_capacity(key_count as usize);
                        for _ in 0..key_count {
                            pubkeys.push(pop(stack)?);
                        }
                        let sig_count = pop_number(stack)?;
                        if !(0..=key_count).contains(&sig_count) {
                            return Err(ScriptError::SigCount);
                        }
                        let mut sigs = Vec::with_capacity(sig_count as usize);
                        for _ in 0..sig_count {
                            sigs.push(pop(stack)?);
                        }
                        // Off-by-one in the original protocol: one extra
                        // element is consumed and must be empty under
                        // NULLDUMMY.
                        let dummy = pop(stack)?;
                        if (flags & SCRIPT_VERIFY_NULLDUMMY) != 0 && !dummy.is_empty() {
                            return Err(ScriptError::NullDummy);
                        }

                        let script_code = &script[script_code_start..];
                        let mut sig_index = 0usize;
                        let mut key_index = 0usize;
                        while sig_index < sigs.len()
                            && sigs.len() - sig_index <= pubkeys.len() - key_index
                        {
                            let valid = checker.check_sig(
                                &sigs[sig_index],
                                &pubkeys[key_index],
                                script_code,
                            )?;
                            if valid {
                                sig_index += 1;
                            }
                            key_index += 1;
                        }
                        let success = sig_index == sigs.len();
                        if !success && (flags & SCRIPT_VERIFY_NULLFAIL) != 0 {
                            if sigs.iter().any(|sig| !sig.is_empty()) {
                                return Err(ScriptError::SigNullFail);
                            }
                        }
                        if opcode == OP_CHECKMULTISIGVERIFY {
                            if !success {
                                return Err(ScriptError::Verify);
                            }
                        } else {
                            stack.push(bool_to_vec(success));
                        }
                    }
                }
                OP_CHECKLOCKTIMEVERIFY => {
                    if (flags & SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY) == 0 {
                        if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 && exec {
                            return Err(ScriptError::DiscourageUpgradableNops);
                        }
                    } else if exec {
                        let top = stack.last().ok_or(ScriptError::StackUnderflow)?;
                        let lock_time = script_num(top, 5)?;
                        if lock_time < 0 {
                            return Err(ScriptError::NegativeLockTime);
                        }
                        checker.check_lock_time(lock_time)?;
                    }
                }
                OP_CHECKSEQUENCEVERIFY => {
                    if (flags & SCRIPT_VERIFY_CHECKSEQUENCEVERIFY) == 0 {
                        if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 && exec {
                            return Err(ScriptError::DiscourageUpgradableNops);
                        }
                    } else if exec {
                        let top = stack.last().ok_or(ScriptError::StackUnderflow)?;
                        let sequence = script_num(top, 5)?;
                        if sequence < 0 {
                            return Err(ScriptError::NegativeLockTime);
                        }
                        if (sequence & i64::from(SEQUENCE_LOCKTIME_DISABLE_FLAG)) == 0 {
                            checker.check_sequence(sequence)?;
                        }
                    }
                }
                OP_NOP1 | 0xb3..=OP_NOP10 => {
                    if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 && exec {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                }
                _ => {
                    if exec {
                        return Err(ScriptError::BadOpcode);
                    }
                }
            }
        }

        if stack.len() + exec_stack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackOverflow);
        }
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }

    Ok(())
}

fn pop(stack: &mut Vec<Vec<u8>>) -> Result<Vec<u8>, ScriptError> {
    stack.pop().ok_or(ScriptError::StackUnderflow)
}

fn pop_number(stack: &mut Vec<Vec<u8>>) -> Result<i64, ScriptError> {
    let data = pop(stack)?;
    script_num(&data, 4)
}

fn read_u8(script: &[u8], cursor: &mut usize) -> Result<u8, ScriptError> {
    let byte = *script.get(*cursor).ok_or(ScriptError::BadOpcode)?;
    *cursor += 1;
    Ok(byte)
}

fn read_u16(script: &[u8], cursor: &mut usize) -> Result<u16, ScriptError> {
    let lo = read_u8(script, cursor)?;
    let hi = read_u8(script, cursor)?;
    Ok(u16::from_le_bytes([lo, hi]))
}

fn read_u32(script: &[u8], cursor: &mut usize) -> Result<u32, ScriptError> {
    let b0 = read_u8(script, cursor)?;
    let b1 = read_u8(script, cursor)?;
    let b2 = read_u8(script, cursor)?;
    let b3 = read_u8(script, cursor)?;
    Ok(u32::from_le_bytes([b0, b1, b2, b3]))
}

fn read_bytes(script: &[u8], cursor: &mut usize, len: usize) -> Result<Vec<u8>, ScriptError> {
    if cursor.saturating_add(len) > script.len() {
        return Err(ScriptError::BadOpcode);
    }
    let data = script[*cursor..*cursor + len].to_vec();
    *cursor += len;
    Ok(data)
}

fn cast_to_bool(data: &[u8]) -> bool {
    for (index, byte) in data.iter().enumerate() {
        if *byte != 0 {
            // Negative zero counts as false.
            return !(index == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

fn bool_to_vec(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

fn script_num_to_vec(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut result = Vec::new();
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let last = result.last_mut().expect("non-zero value");
    if (*last & 0x80) != 0 {
        result.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        *last |= 0x80;
    }
    result
}

fn script_num(data: &[u8], max_len: usize) -> Result<i64, ScriptError> {
    if data.len() > max_len {
        return Err(ScriptError::MinimalData);
    }
    if data.is_empty() {
        return Ok(0);
    }
    let mut value: i64 = 0;
    for (index, byte) in data.iter().enumerate() {
        let byte = if index == data.len() - 1 {
            *byte & 0x7f
        } else {
            *byte
        };
        value |= i64::from(byte) << (8 * index);
    }
    if (data.last().expect("non-empty") & 0x80) != 0 {
        value = -value;
    }
    Ok(value)
}

fn check_minimal_push(data: &[u8], opcode: u8) -> bool {
    if data.is_empty() {
        return opcode == OP_0;
    }
    if data.len() == 1 && (1..=16).contains(&data[0]) {
        return false;
    }
    if data.len() == 1 && data[0] == 0x81 {
        return false;
    }
    match data.len() {
        0..=75 => opcode as usize == data.len(),
        76..=255 => opcode == OP_PUSHDATA1,
        256..=65_535 => opcode == OP_PUSHDATA2,
        _ => opcode == OP_PUSHDATA4,
    }
}

/// Lax DER shape check matching the strict-encoding rule.
fn is_valid_der_signature(der: &[u8]) -> bool {
    if der.len() < 8 || der.len() > 72 {
        return false;
    }
    if der[0] != 0x30 || der[1] as usize != der.len() - 2 {
        return false;
    }
    if der[2] != 0x02 {
        return false;
    }
    let r_len = der[3] as usize;
    if r_len == 0 || 5 + r_len >= der.len() {
        return false;
    }
    if der[4 + r_len] != 0x02 {
        return false;
    }
    let s_len = der[5 + r_len] as usize;
    if s_len == 0 || 6 + r_len + s_len != der.len() {
        return false;
    }
    // Neither integer may be negative or non-minimally padded.
    if (der[4] & 0x80) != 0 || (r_len > 1 && der[4] == 0 && (der[5] & 0x80) == 0) {
        return false;
    }
    let s_start = 6 + r_len;
    if (der[s_start] & 0x80) != 0
        || (s_len > 1 && der[s_start] == 0 && (der[s_start + 1] & 0x80) == 0)
    {
        return false;
    }
    true
}

fn is_compressed_or_uncompressed(pubkey: &[u8]) -> bool {
    match pubkey.first() {
        Some(0x02) | Some(0x03) => pubkey.len() == 33,
        Some(0x04) => pubkey.len() == 65,
        _ => false,
    }
}
