//! Difficulty and compact target utilities.

use std::cmp::Ordering;

use emberd_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

/// Header fields the retarget algorithm needs from the preceding chain.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: i32,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

/// Expected hash operations proved by a header with the given compact bits:
/// ~target / (target + 1) + 1, accumulated into chain work.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

pub fn cmp_be(a: &Hash256, b: &Hash256) -> Ordering {
    let left = U256::from_little_endian(a);
    let right = U256::from_little_endian(b);
    left.cmp(&right)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    EmptyChain,
    NonContiguous,
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::EmptyChain => write!(f, "no headers available"),
            DifficultyError::NonContiguous => write!(f, "header list must be contiguous by height"),
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// Compact bits the next block must carry, given the contiguous header window
/// ending at the current tip. The window only needs to reach back to the
/// start of the current retarget epoch. `next_block_time` feeds the
/// min-difficulty escape hatch on networks that allow it.
pub fn get_next_work_required(
    chain: &[HeaderInfo],
    next_block_time: Option<i64>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let pow_limit_bits = target_to_compact(&params.pow_limit);
    let last = match chain.last() {
        Some(last) => last,
        None => return Ok(pow_limit_bits),
    };
    ensure_contiguous(chain)?;

    if params.pow_no_retargeting {
        return Ok(last.bits);
    }

    let interval = params.difficulty_adjustment_interval();
    let next_height = i64::from(last.height) + 1;

    if next_height % interval != 0 {
        if params.pow_allow_min_difficulty_blocks {
            // A block whose timestamp lags more than twice the spacing may
            // use the minimum difficulty; otherwise carry the last
            // non-minimum difficulty forward.
            if let Some(next_time) = next_block_time {
                if next_time > last.time + params.pow_target_spacing * 2 {
                    return Ok(pow_limit_bits);
                }
            }
            for header in chain.iter().rev() {
                let at_interval = i64::from(header.height) % interval == 0;
                if at_interval || header.bits != pow_limit_bits {
                    return Ok(header.bits);
                }
            }
            return Ok(pow_limit_bits);
        }
        return Ok(last.bits);
    }

    // Retarget boundary: scale by the actual timespan of the finished epoch,
    // clamped to [timespan / 4, timespan * 4].
    let epoch_first_height = i64::from(last.height) - (interval - 1);
    let base_height = i64::from(chain[0].height);
    let first_index = epoch_first_height - base_height;
    if first_index < 0 {
        return Err(DifficultyError::EmptyChain);
    }
    let first = &chain[first_index as usize];

    let mut actual_timespan = last.time - first.time;
    if actual_timespan < params.pow_target_timespan / 4 {
        actual_timespan = params.pow_target_timespan / 4;
    }
    if actual_timespan > params.pow_target_timespan * 4 {
        actual_timespan = params.pow_target_timespan * 4;
    }

    let mut next = compact_to_u256(last.bits)?;
    next = next / U256::from(params.pow_target_timespan as u64)
        * U256::from(actual_timespan as u64);

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if next > pow_limit {
        next = pow_limit;
    }

    Ok(u256_to_compact(next))
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain[0].height;
    for (idx, header) in chain.iter().enumerate() {
        if i64::from(header.height) != i64::from(base) + idx as i64 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_consensus::params::{chain_params, Network};

    #[test]
    fn compact_codec_round_trips_known_vectors() {
        for bits in [0x1d00_ffffu32, 0x1b04_04cb, 0x1709_6a4a, 0x207f_ffff] {
            let target = compact_to_u256(bits).expect("target");
            assert_eq!(u256_to_compact(target), bits);
        }
    }

    #[test]
    fn compact_rejects_negative_and_overflow() {
        assert_eq!(compact_to_u256(0x0180_0000), Err(CompactError::Negative));
        assert_eq!(compact_to_u256(0xff00_ffff), Err(CompactError::Overflow));
    }

    #[test]
    fn block_proof_increases_with_difficulty() {
        let easy = block_proof(0x207f_ffff).expect("easy");
        let hard = block_proof(0x1d00_ffff).expect("hard");
        assert!(hard > easy);
    }

    fn perfect_epoch(
        params: &ConsensusParams,
        last_height: i32,
        spacing: i64,
        bits: u32,
    ) -> Vec<HeaderInfo> {
        let interval = params.difficulty_adjustment_interval() as i32;
        let first_height = last_height - interval + 1;
        (first_height..=last_height)
            .map(|height| HeaderInfo {
                height,
                time: 1_000_000_000 + i64::from(height) * spacing,
                bits,
            })
            .collect()
    }

    #[test]
    fn no_adjustment_off_boundary() {
        let params = chain_params(Network::Mainnet).consensus;
        let chain = vec![HeaderInfo {
            height: 100,
            time: 1_000_000_000,
            bits: 0x1d00_aaaa,
        }];
        let bits = get_next_work_required(&chain, None, &params).expect("bits");
        assert_eq!(bits, 0x1d00_aaaa);
    }

    #[test]
    fn perfect_timing_keeps_difficulty_within_rounding() {
        let params = chain_params(Network::Mainnet).consensus;
        let chain = perfect_epoch(&params, 2015, params.pow_target_spacing, 0x1c05_a3f4);
        let bits = get_next_work_required(&chain, None, &params).expect("bits");
        let before = compact_to_u256(0x1c05_a3f4).expect("target");
        let after = compact_to_u256(bits).expect("target");
        // The measured timespan covers interval - 1 gaps, so perfect spacing
        // shifts the target by less than 0.1%.
        assert!(after <= before);
        assert!(after >= before / U256::from(1000u64) * U256::from(999u64));
    }

    #[test]
    fn slow_epoch_raises_target_with_clamp() {
        let params = chain_params(Network::Mainnet).consensus;
        // Blocks arriving 8x slower than target: clamp at 4x.
        let chain = perfect_epoch(&params, 2015, params.pow_target_spacing * 8, 0x1c05_a3f4);
        let bits = get_next_work_required(&chain, None, &params).expect("bits");
        let before = compact_to_u256(0x1c05_a3f4).expect("target");
        let after = compact_to_u256(bits).expect("target");
        let limit = U256::from_little_endian(&params.pow_limit);
        assert!(after > before);
        assert!(after <= limit);
    }

    #[test]
    fn min_difficulty_rule_applies_after_gap() {
        let params = chain_params(Network::Testnet).consensus;
        let chain = vec![HeaderInfo {
            height: 100,
            time: 1_000_000_000,
            bits: 0x1d00_aaaa,
        }];
        let gap_time = 1_000_000_000 + params.pow_target_spacing * 2 + 1;
        let bits = get_next_work_required(&chain, Some(gap_time), &params).expect("bits");
        assert_eq!(bits, target_to_compact(&params.pow_limit));
    }

    #[test]
    fn regtest_never_retargets() {
        let params = chain_params(Network::Regtest).consensus;
        let chain = vec![HeaderInfo {
            height: 2015,
            time: 1_000_000_000,
            bits: 0x207f_ffff,
        }];
        let bits = get_next_work_required(&chain, None, &params).expect("bits");
        assert_eq!(bits, 0x207f_ffff);
    }
}
