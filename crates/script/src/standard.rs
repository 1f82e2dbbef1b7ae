//! Standard script classification and the script-shape utilities shared by
//! policy code: push parsing, sigop counting, dust, and the coinbase height
//! commitment.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    P2Pk,
    P2Pkh,
    P2Sh,
    NullData,
    Unknown,
}

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_1NEGATE: u8 = 0x4f;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_RETURN: u8 = 0x6a;
const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_HASH160: u8 = 0xa9;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

/// Scripts larger than this cannot be spent.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    if is_p2pkh(script) {
        ScriptType::P2Pkh
    } else if is_p2sh(script) {
        ScriptType::P2Sh
    } else if is_p2pk(script) {
        ScriptType::P2Pk
    } else if script.first().copied() == Some(OP_RETURN) {
        ScriptType::NullData
    } else {
        ScriptType::Unknown
    }
}

fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

fn is_p2pk(script: &[u8]) -> bool {
    let key_len = match script.first().copied() {
        Some(len @ 33) => len,
        Some(len @ 65) => len,
        _ => return false,
    };
    script.len() == key_len as usize + 2 && script[script.len() - 1] == OP_CHECKSIG
}

/// An output that can provably never be spent: data carriers and scripts
/// beyond the evaluation size limit.
pub fn is_unspendable(script_pubkey: &[u8]) -> bool {
    script_pubkey.first().copied() == Some(OP_RETURN) || script_pubkey.len() > MAX_SCRIPT_SIZE
}

pub fn is_push_only(script: &[u8]) -> bool {
    parse_push_only_stack(script).is_some()
}

/// Parses a push-only script into the stack it would leave behind. Returns
/// `None` on any non-push opcode or truncated push.
pub fn parse_push_only_stack(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut cursor = 0usize;
    let mut stack = Vec::new();
    while cursor < script.len() {
        let opcode = *script.get(cursor)?;
        cursor += 1;
        match opcode {
            OP_0 => stack.push(Vec::new()),
            0x01..=0x4b => {
                let len = opcode as usize;
                stack.push(read_push(script, &mut cursor, len)?);
            }
            OP_PUSHDATA1 => {
                let len = *script.get(cursor)? as usize;
                cursor += 1;
                stack.push(read_push(script, &mut cursor, len)?);
            }
            OP_PUSHDATA2 => {
                let lo = *script.get(cursor)? as usize;
                let hi = *script.get(cursor + 1)? as usize;
                cursor += 2;
                stack.push(read_push(script, &mut cursor, (hi << 8) | lo)?);
            }
            OP_PUSHDATA4 => {
                let b0 = *script.get(cursor)? as usize;
                let b1 = *script.get(cursor + 1)? as usize;
                let b2 = *script.get(cursor + 2)? as usize;
                let b3 = *script.get(cursor + 3)? as usize;
                cursor += 4;
                stack.push(read_push(
                    script,
                    &mut cursor,
                    (b3 << 24) | (b2 << 16) | (b1 << 8) | b0,
                )?);
            }
            OP_1NEGATE => stack.push(vec![0x81]),
            OP_1..=OP_16 => stack.push(vec![opcode - OP_1 + 1]),
            _ => return None,
        }
    }
    Some(stack)
}

fn read_push(script: &[u8], cursor: &mut usize, len: usize) -> Option<Vec<u8>> {
    if cursor.saturating_add(len) > script.len() {
        return None;
    }
    let data = script[*cursor..*cursor + len].to_vec();
    *cursor += len;
    Some(data)
}

/// Legacy sigop count. With `accurate`, CHECKMULTISIG preceded by OP_N
/// counts N instead of the worst-case 20.
pub fn count_sigops(script: &[u8], accurate: bool) -> u32 {
    let mut cursor = 0usize;
    let mut last_opcode = 0xffu8;
    let mut count = 0u32;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        match opcode {
            0x01..=0x4b => cursor = cursor.saturating_add(opcode as usize),
            OP_PUSHDATA1 => {
                let len = match script.get(cursor) {
                    Some(len) => *len as usize,
                    None => break,
                };
                cursor = cursor.saturating_add(1 + len);
            }
            OP_PUSHDATA2 => {
                let len = match (script.get(cursor), script.get(cursor + 1)) {
                    (Some(lo), Some(hi)) => ((*hi as usize) << 8) | *lo as usize,
                    _ => break,
                };
                cursor = cursor.saturating_add(2 + len);
            }
            OP_PUSHDATA4 => {
                let len = match (
                    script.get(cursor),
                    script.get(cursor + 1),
                    script.get(cursor + 2),
                    script.get(cursor + 3),
                ) {
                    (Some(b0), Some(b1), Some(b2), Some(b3)) => {
                        ((*b3 as usize) << 24)
                            | ((*b2 as usize) << 16)
                            | ((*b1 as usize) << 8)
                            | *b0 as usize
                    }
                    _ => break,
                };
                cursor = cursor.saturating_add(4 + len);
            }
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count = count.saturating_add(1),
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                let add = if accurate && (OP_1..=OP_16).contains(&last_opcode) {
                    u32::from(last_opcode - OP_1 + 1)
                } else {
                    20
                };
                count = count.saturating_add(add);
            }
            _ => {}
        }
        last_opcode = opcode;
    }
    count
}

/// Accurate sigop count of the redeem script a P2SH input would execute.
/// Zero when the scriptSig is not push-only or pushes nothing last.
pub fn p2sh_sigop_count(script_pubkey: &[u8], script_sig: &[u8]) -> u32 {
    if !is_p2sh(script_pubkey) {
        return 0;
    }
    let Some(stack) = parse_push_only_stack(script_sig) else {
        return 0;
    };
    match stack.last() {
        Some(redeem) if !redeem.is_empty() => count_sigops(redeem, true),
        _ => 0,
    }
}

/// Minimum relay fee for `size` bytes at the given per-kB rate, never zero
/// for a non-zero rate.
pub fn min_relay_fee_for_size(min_fee_per_kb: i64, size: usize) -> i64 {
    if min_fee_per_kb <= 0 {
        return 0;
    }
    let size = i64::try_from(size).unwrap_or(i64::MAX);
    let fee = min_fee_per_kb.saturating_mul(size) / 1000;
    if fee == 0 {
        min_fee_per_kb
    } else {
        fee
    }
}

/// An output is dust when spending it would cost more than a third of its
/// value at the relay feerate.
pub fn is_dust(value: i64, script_pubkey: &[u8], min_fee_per_kb: i64) -> bool {
    if min_fee_per_kb <= 0 || is_unspendable(script_pubkey) {
        return false;
    }
    if value < 0 {
        return true;
    }
    let out_size = 8 + compact_size_len(script_pubkey.len()) + script_pubkey.len();
    // 148 bytes is the size of a typical spending input.
    let spend_size = out_size + 148;
    let fee = min_relay_fee_for_size(min_fee_per_kb, spend_size);
    value < fee.saturating_mul(3)
}

/// OP_RETURN output with at most one push of `max_bytes` data.
pub fn is_standard_null_data(script_pubkey: &[u8], max_bytes: usize) -> bool {
    if script_pubkey.first().copied() != Some(OP_RETURN) {
        return false;
    }
    if script_pubkey.len() == 1 {
        return true;
    }
    match parse_push_only_stack(&script_pubkey[1..]) {
        Some(stack) => stack.len() == 1 && stack[0].len() <= max_bytes,
        None => false,
    }
}

/// Script prefix committing to a block height in the coinbase scriptSig.
pub fn height_commitment_script(height: i64) -> Vec<u8> {
    if height == 0 {
        return vec![OP_0];
    }
    if height == -1 {
        return vec![OP_1NEGATE];
    }
    if (1..=16).contains(&height) {
        return vec![OP_1 + (height as u8 - 1)];
    }

    let mut abs = height.unsigned_abs();
    let mut data = Vec::new();
    while abs > 0 {
        data.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if let Some(last) = data.last_mut() {
        if (*last & 0x80) != 0 {
            data.push(if height < 0 { 0x80 } else { 0x00 });
        } else if height < 0 {
            *last |= 0x80;
        }
    }
    let mut script = Vec::with_capacity(data.len() + 1);
    script.push(data.len() as u8);
    script.extend_from_slice(&data);
    script
}

fn compact_size_len(value: usize) -> usize {
    if value < 0xfd {
        1
    } else if value <= 0xffff {
        3
    } else if value <= 0xffff_ffff {
        5
    } else {
        9
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2pkh(tag: u8) -> Vec<u8> {
        let mut script = vec![OP_DUP, OP_HASH160, 0x14];
        script.extend_from_slice(&[tag; 20]);
        script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        script
    }

    #[test]
    fn classification_covers_templates() {
        assert_eq!(classify_script_pubkey(&p2pkh(7)), ScriptType::P2Pkh);

        let mut p2sh = vec![OP_HASH160, 0x14];
        p2sh.extend_from_slice(&[9u8; 20]);
        p2sh.push(OP_EQUAL);
        assert_eq!(classify_script_pubkey(&p2sh), ScriptType::P2Sh);

        let mut p2pk = vec![33u8];
        p2pk.extend_from_slice(&[2u8; 33]);
        p2pk.push(OP_CHECKSIG);
        assert_eq!(classify_script_pubkey(&p2pk), ScriptType::P2Pk);

        assert_eq!(classify_script_pubkey(&[OP_RETURN]), ScriptType::NullData);
        assert_eq!(classify_script_pubkey(&[0x51]), ScriptType::Unknown);
    }

    #[test]
    fn push_only_parsing_rejects_operations() {
        assert!(is_push_only(&[0x02, 0xaa, 0xbb, 0x51]));
        assert!(!is_push_only(&[OP_DUP]));
        assert!(!is_push_only(&[0x04, 0xaa]));
        let stack = parse_push_only_stack(&[OP_0, 0x01, 0x07, 0x53]).expect("stack");
        assert_eq!(stack, vec![vec![], vec![0x07], vec![3]]);
    }

    #[test]
    fn sigop_counting_matches_multisig_rules() {
        assert_eq!(count_sigops(&[OP_CHECKSIG], false), 1);
        assert_eq!(count_sigops(&[OP_CHECKMULTISIG], false), 20);
        // 2-of-3 multisig counted accurately.
        let script = vec![0x52, 0x53, OP_CHECKMULTISIG];
        assert_eq!(count_sigops(&script, true), 3);
        assert_eq!(count_sigops(&script, false), 20);
    }

    #[test]
    fn p2sh_sigops_read_the_redeem_script() {
        let mut script_pubkey = vec![OP_HASH160, 0x14];
        script_pubkey.extend_from_slice(&[1u8; 20]);
        script_pubkey.push(OP_EQUAL);

        let redeem = vec![0x51, 0x51, OP_CHECKMULTISIG];
        let mut script_sig = vec![redeem.len() as u8];
        script_sig.extend_from_slice(&redeem);
        assert_eq!(p2sh_sigop_count(&script_pubkey, &script_sig), 1);
        assert_eq!(p2sh_sigop_count(&p2pkh(1), &script_sig), 0);
    }

    #[test]
    fn dust_threshold_scales_with_feerate() {
        let script = p2pkh(3);
        assert!(is_dust(100, &script, 1000));
        assert!(!is_dust(100_000, &script, 1000));
        assert!(!is_dust(0, &[OP_RETURN], 1000));
        assert!(!is_dust(1, &script, 0));
    }

    #[test]
    fn null_data_standardness_bounds_payload() {
        let mut script = vec![OP_RETURN, 0x04];
        script.extend_from_slice(&[0xaa; 4]);
        assert!(is_standard_null_data(&script, 80));
        assert!(!is_standard_null_data(&script, 3));
        assert!(is_standard_null_data(&[OP_RETURN], 80));
        assert!(!is_standard_null_data(&[0x51], 80));
    }

    #[test]
    fn height_commitment_uses_minimal_numbers() {
        assert_eq!(height_commitment_script(0), vec![OP_0]);
        assert_eq!(height_commitment_script(1), vec![OP_1]);
        assert_eq!(height_commitment_script(16), vec![0x60]);
        assert_eq!(height_commitment_script(17), vec![0x01, 17]);
        assert_eq!(height_commitment_script(128), vec![0x02, 0x80, 0x00]);
        assert_eq!(height_commitment_script(227_931), vec![0x03, 0x5b, 0x7a, 0x03]);
    }
}
