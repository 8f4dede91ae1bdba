//! Recompensa de bloco e cronograma de halving

use crate::params::NetworkParams;
use shared::Amount;

/// Recompensa base na altura dada
///
/// Corta pela metade a cada `halving_interval` blocos, com piso em
/// `min_reward`.
#[must_use]
pub fn block_reward(height: u64, params: &NetworkParams) -> Amount {
    let halvings = if params.halving_interval == 0 {
        0
    } else {
        height / params.halving_interval
    };

    let mut reward = params.initial_reward_amount();
    for _ in 0..halvings {
        reward = reward.halved();
        if reward <= Amount::from_u64(params.min_reward) {
            return Amount::from_u64(params.min_reward);
        }
    }
    reward
}

/// Recompensa efetiva respeitando a oferta máxima
///
/// A recompensa nunca leva a oferta circulante além de `max_supply`;
/// ao atingir o teto a emissão cessa.
#[must_use]
pub fn capped_reward(height: u64, current_supply: &Amount, params: &NetworkParams) -> Amount {
    let base = block_reward(height, params);
    let max_supply = params.max_supply_amount();

    match max_supply.checked_sub(current_supply) {
        Ok(remaining) => {
            if base <= remaining {
                base
            } else {
                remaining
            }
        }
        Err(_) => Amount::zero(),
    }
}
