//! Consensus parameter definitions.

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    /// Maximum serialized block size accepted by this ruleset.
    pub max_block_size: u64,
    pub subsidy_halving_interval: i32,
    /// Height from which BIP34 (coinbase height commitment) is enforced.
    pub bip34_height: i32,
    /// Height from which OP_CHECKLOCKTIMEVERIFY (BIP65) is enforced.
    pub bip65_height: i32,
    /// Height from which strict DER signatures (BIP66) are enforced.
    pub bip66_height: i32,
    /// Height from which pay-to-script-hash evaluation is enforced.
    pub p2sh_height: i32,
    /// Height from which BIP68/112/113 (CSV) are enforced.
    pub csv_height: i32,
    /// Height of the UAHF hard fork: fork-id signature hashing plus strict
    /// encoding become mandatory, and anti-replay opt-out outputs are
    /// rejected until the sunset height.
    pub uahf_height: i32,
    pub antireplay_sunset_height: i32,
    /// Commitment data identifying an anti-replay opt-out output.
    pub antireplay_commitment: Vec<u8>,
    /// Height from which LOW_S and NULLFAIL signature rules are enforced.
    pub low_s_height: i32,
    /// Outpoints exempt from the duplicate-coinbase (BIP30) check, keyed by
    /// the height and hash of the block allowed to overwrite them.
    pub bip30_exceptions: Vec<Checkpoint>,
    pub pow_limit: Hash256,
    pub pow_target_timespan: i64,
    pub pow_target_spacing: i64,
    /// Testnet rule: a block whose timestamp is more than twice the target
    /// spacing past its parent may use the minimum difficulty.
    pub pow_allow_min_difficulty_blocks: bool,
    pub pow_no_retargeting: bool,
    pub checkpoints: Vec<Checkpoint>,
    /// Block hash assumed to have valid scripts; ancestors of it skip script
    /// verification once the best header chain carries enough work.
    pub assume_valid: Option<Hash256>,
    /// Minimum accumulated work (big-endian) before assume-valid applies.
    pub minimum_chain_work: Hash256,
}

impl ConsensusParams {
    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub consensus: ConsensusParams,
    /// Network magic prefixed to every flat-file record.
    pub magic: [u8; 4],
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => mainnet(),
        Network::Testnet => testnet(),
        Network::Regtest => regtest(),
    }
}

const ANTIREPLAY_COMMITMENT: &[u8] = b"Ember: settlement without replay";

fn pow_limit_mainnet() -> Hash256 {
    // Compact 0x1d00ffff, little-endian byte order.
    let mut limit = [0u8; 32];
    limit[26] = 0xff;
    limit[27] = 0xff;
    limit
}

fn pow_limit_regtest() -> Hash256 {
    let mut limit = [0xffu8; 32];
    limit[31] = 0x7f;
    limit
}

fn mainnet() -> ChainParams {
    ChainParams {
        consensus: ConsensusParams {
            network: Network::Mainnet,
            hash_genesis_block: [0u8; 32],
            max_block_size: 8_000_000,
            subsidy_halving_interval: 210_000,
            bip34_height: 227_931,
            bip65_height: 388_381,
            bip66_height: 363_725,
            p2sh_height: 173_805,
            csv_height: 419_328,
            uahf_height: 478_559,
            antireplay_sunset_height: 530_000,
            antireplay_commitment: ANTIREPLAY_COMMITMENT.to_vec(),
            low_s_height: 504_031,
            bip30_exceptions: vec![
                Checkpoint {
                    height: 91_842,
                    hash: hash_from_tag(0xe1),
                },
                Checkpoint {
                    height: 91_880,
                    hash: hash_from_tag(0xe2),
                },
            ],
            pow_limit: pow_limit_mainnet(),
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_target_spacing: 10 * 60,
            pow_allow_min_difficulty_blocks: false,
            pow_no_retargeting: false,
            checkpoints: Vec::new(),
            assume_valid: None,
            minimum_chain_work: [0u8; 32],
        },
        magic: [0xe8, 0xb2, 0xd5, 0xf9],
    }
}

fn testnet() -> ChainParams {
    let mut params = mainnet();
    params.consensus.network = Network::Testnet;
    params.consensus.bip34_height = 21_111;
    params.consensus.bip65_height = 581_885;
    params.consensus.bip66_height = 330_776;
    params.consensus.p2sh_height = 0;
    params.consensus.csv_height = 770_112;
    params.consensus.uahf_height = 1_155_875;
    params.consensus.antireplay_sunset_height = 1_250_000;
    params.consensus.low_s_height = 1_188_697;
    params.consensus.bip30_exceptions = Vec::new();
    params.consensus.pow_allow_min_difficulty_blocks = true;
    params.magic = [0xf4, 0x1c, 0x39, 0x07];
    params
}

fn regtest() -> ChainParams {
    ChainParams {
        consensus: ConsensusParams {
            network: Network::Regtest,
            hash_genesis_block: [0u8; 32],
            max_block_size: 8_000_000,
            subsidy_halving_interval: 150,
            bip34_height: 100_000_000,
            bip65_height: 1_351,
            bip66_height: 1_251,
            p2sh_height: 0,
            csv_height: 576,
            uahf_height: 0,
            antireplay_sunset_height: 0,
            antireplay_commitment: ANTIREPLAY_COMMITMENT.to_vec(),
            low_s_height: 0,
            bip30_exceptions: Vec::new(),
            pow_limit: pow_limit_regtest(),
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_target_spacing: 10 * 60,
            pow_allow_min_difficulty_blocks: true,
            pow_no_retargeting: true,
            checkpoints: Vec::new(),
            assume_valid: None,
            minimum_chain_work: [0u8; 32],
        },
        magic: [0xfa, 0xbf, 0xb5, 0xda],
    }
}

fn hash_from_tag(tag: u8) -> Hash256 {
    let mut hash = [0u8; 32];
    hash[0] = tag;
    hash
}
