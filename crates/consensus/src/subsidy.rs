//! Block subsidy schedule.

use crate::money::{Amount, COIN};
use crate::params::ConsensusParams;

/// Subsidy paid to the miner of a block at the given height, before fees.
/// Halves every `subsidy_halving_interval` blocks and reaches zero after 64
/// halvings, when the right shift drops the last base unit.
pub fn block_subsidy(height: i32, params: &ConsensusParams) -> Amount {
    let halvings = height / params.subsidy_halving_interval;
    if halvings >= 64 {
        return 0;
    }
    (50 * COIN) >> halvings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{chain_params, Network};

    #[test]
    fn subsidy_halves_on_schedule() {
        let params = chain_params(Network::Mainnet).consensus;
        assert_eq!(block_subsidy(0, &params), 50 * COIN);
        assert_eq!(block_subsidy(209_999, &params), 50 * COIN);
        assert_eq!(block_subsidy(210_000, &params), 25 * COIN);
        assert_eq!(block_subsidy(420_000, &params), 12 * COIN + 50 * COIN / 100);
        assert_eq!(block_subsidy(64 * 210_000, &params), 0);
    }

    #[test]
    fn total_emission_stays_below_money_limit() {
        let params = chain_params(Network::Mainnet).consensus;
        let mut total: i64 = 0;
        let mut height = 0;
        loop {
            let subsidy = block_subsidy(height, &params);
            if subsidy == 0 {
                break;
            }
            total += subsidy * params.subsidy_halving_interval as i64;
            height += params.subsidy_halving_interval;
        }
        assert!(total <= crate::money::MAX_MONEY);
    }
}
