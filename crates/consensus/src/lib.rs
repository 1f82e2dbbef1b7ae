//! Consensus constants, chain parameters, and the subsidy schedule.

pub mod constants;
pub mod money;
pub mod params;
pub mod subsidy;

pub use params::{chain_params, ChainParams, Checkpoint, ConsensusParams, Network};
pub use subsidy::block_subsidy;

pub type Hash256 = [u8; 32];
