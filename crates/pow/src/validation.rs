//! Header proof-of-work predicate.

use emberd_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    InvalidBits(&'static str),
    HashMismatch,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashMismatch => write!(f, "pow hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Checks that `hash` satisfies the target encoded by `bits` and that the
/// target itself lies within the consensus range.
pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if target > pow_limit {
        return Err(PowError::InvalidBits("pow target above limit"));
    }

    let hash_value = U256::from_little_endian(hash);
    if hash_value > target {
        return Err(PowError::HashMismatch);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::difficulty::target_to_compact;
    use emberd_consensus::params::{chain_params, Network};

    #[test]
    fn zero_hash_meets_any_target() {
        let params = chain_params(Network::Regtest).consensus;
        let bits = target_to_compact(&params.pow_limit);
        assert!(check_proof_of_work(&[0u8; 32], bits, &params).is_ok());
    }

    #[test]
    fn high_hash_is_rejected() {
        let params = chain_params(Network::Mainnet).consensus;
        let hash = [0xffu8; 32];
        let bits = target_to_compact(&params.pow_limit);
        assert_eq!(
            check_proof_of_work(&hash, bits, &params),
            Err(PowError::HashMismatch)
        );
    }

    #[test]
    fn target_above_limit_is_rejected() {
        let params = chain_params(Network::Mainnet).consensus;
        // Easier than the mainnet limit.
        assert_eq!(
            check_proof_of_work(&[0u8; 32], 0x207f_ffff, &params),
            Err(PowError::InvalidBits("pow target above limit"))
        );
    }

    #[test]
    fn zero_bits_rejected() {
        let params = chain_params(Network::Mainnet).consensus;
        assert_eq!(
            check_proof_of_work(&[0u8; 32], 0, &params),
            Err(PowError::InvalidBits("pow target is zero"))
        );
    }
}
