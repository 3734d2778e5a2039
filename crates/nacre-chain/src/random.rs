//! Random output sampling for ring construction.

use crate::chain::ChainState;
use crate::utxo::UtxoRead;
use nacre_primitives::{Amount, Height, PublicKey, Timestamp, UnlockMoment};
use rand_distr::{Distribution, LogNormal};
use std::collections::HashSet;
use tracing::debug;

/// A candidate ring member handed out to wallets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RandomOutput {
    pub amount: Amount,
    pub global_index: u32,
    pub public_key: PublicKey,
    pub unlock_time: UnlockMoment,
    pub height: Height,
}

/// Attempts per requested output before sampling gives up.
const ATTEMPTS_PER_OUTPUT: usize = 20;
/// Log-normal parameters skewing samples toward recent outputs.
const LOGNORMAL_MU: f64 = 1.9;
const LOGNORMAL_SIGMA: f64 = 1.0;

impl ChainState {
    /// Sample up to `outs_count` unlocked, unspent outputs of `amount`
    /// with global index usable at `height` / `time`. Small buckets are
    /// returned whole; larger ones are sampled from a log-normal
    /// distribution over the index range.
    pub fn get_random_outputs(
        &self,
        amount: Amount,
        outs_count: usize,
        height: Height,
        time: Timestamp,
    ) -> Vec<RandomOutput> {
        let total_count = self.next_global_index_for_amount(amount);
        let mut result = Vec::with_capacity(outs_count);

        let try_add = |global_index: u32, result: &mut Vec<RandomOutput>| {
            let record = self
                .read_amount_output(amount, global_index)
                .expect("store integrity: dense bucket has a hole");
            if record.spent || record.height > height {
                return;
            }
            if !self
                .currency()
                .is_transaction_spend_time_unlocked(record.unlock_time, height, time)
            {
                return;
            }
            result.push(RandomOutput {
                amount,
                global_index,
                public_key: record.public_key,
                unlock_time: record.unlock_time,
                height: record.height,
            });
        };

        if total_count as usize <= outs_count {
            for global_index in 0..total_count {
                try_add(global_index, &mut result);
            }
            return result;
        }

        let mut rng = rand::thread_rng();
        let distribution = LogNormal::new(LOGNORMAL_MU, LOGNORMAL_SIGMA)
            .expect("log-normal parameters are fixed and valid");
        let mut tried_or_added: HashSet<u32> = HashSet::new();
        let mut attempts = 0usize;
        while result.len() < outs_count && attempts < outs_count * ATTEMPTS_PER_OUTPUT {
            attempts += 1;
            let sample = distribution.sample(&mut rng);
            let scaled = (f64::from(total_count) * (1.0 - 10f64.powf(-sample / 10.0))).floor();
            if !(0.0..f64::from(total_count)).contains(&scaled) {
                continue;
            }
            let global_index = scaled as u32;
            if !tried_or_added.insert(global_index) {
                continue;
            }
            try_add(global_index, &mut result);
        }
        debug!(
            amount,
            requested = outs_count,
            found = result.len(),
            attempts,
            "sampled random outputs"
        );
        result
    }
}
