//! Per-epoch participation effectiveness.
//!
//! Every known address carries a score in [0, 1] that ramps toward 1 while
//! the address keeps producing successful receipts and decays toward 0 when
//! it goes silent. The decay constant is much shorter than the ramp
//! constant, so reputation is slow to earn and quick to lose. Scores are
//! keyed by address, not node name, so identity rotation does not reset an
//! equivalent key.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::crypto::keys::Address;

/// Seconds per day, for converting epoch duration into ramp/decay days.
const SECONDS_PER_DAY: f64 = 86_400.0;

/// Ramp and decay time constants, in days.
#[derive(Clone, Copy, Debug)]
pub struct EffectivenessParams {
    pub ramp_days: f64,
    pub decay_days: f64,
}

impl Default for EffectivenessParams {
    fn default() -> Self {
        EffectivenessParams {
            ramp_days: 40.0,
            decay_days: 7.0,
        }
    }
}

/// One ramp step: `e' = 1 − (1 − e)·exp(−Δd / R)`, clamped to [0, 1].
pub fn ramp(effectiveness: f64, delta_days: f64, ramp_days: f64) -> f64 {
    let next = 1.0 - (1.0 - effectiveness) * (-delta_days / ramp_days).exp();
    next.clamp(0.0, 1.0)
}

/// One decay step: `e' = e·exp(−Δd / D)`, clamped to [0, 1].
pub fn decay(effectiveness: f64, delta_days: f64, decay_days: f64) -> f64 {
    (effectiveness * (-delta_days / decay_days).exp()).clamp(0.0, 1.0)
}

/// Tracks the local effectiveness estimate for every known address.
#[derive(Clone, Debug, Default)]
pub struct EffectivenessTracker {
    scores: HashMap<Address, f64>,
    params: EffectivenessParams,
}

impl EffectivenessTracker {
    pub fn new(params: EffectivenessParams) -> Self {
        EffectivenessTracker {
            scores: HashMap::new(),
            params,
        }
    }

    pub fn score(&self, address: &Address) -> f64 {
        self.scores.get(address).copied().unwrap_or(0.0)
    }

    /// Advance one epoch: ramp every address in `active` (produced a
    /// successful receipt this epoch), decay every other known address.
    /// Returns the full updated map, sorted by address.
    pub fn advance_epoch(
        &mut self,
        known: impl IntoIterator<Item = Address>,
        active: &HashSet<Address>,
        epoch_duration_secs: f64,
    ) -> BTreeMap<Address, f64> {
        let delta_days = epoch_duration_secs / SECONDS_PER_DAY;
        let mut all: HashSet<Address> = self.scores.keys().copied().collect();
        all.extend(known);
        all.extend(active.iter().copied());

        let mut updates = BTreeMap::new();
        for address in all {
            let current = self.score(&address);
            let next = if active.contains(&address) {
                ramp(current, delta_days, self.params.ramp_days)
            } else {
                decay(current, delta_days, self.params.decay_days)
            };
            self.scores.insert(address, next);
            updates.insert(address, next);
        }
        updates
    }

    /// Overwrite local scores with the updates carried in a committed
    /// block, keeping followers in step with the leader's view.
    pub fn apply_committed(&mut self, updates: &BTreeMap<Address, f64>) {
        for (address, score) in updates {
            self.scores.insert(*address, score.clamp(0.0, 1.0));
        }
    }

    pub fn snapshot(&self) -> BTreeMap<Address, f64> {
        self.scores.iter().map(|(a, e)| (*a, *e)).collect()
    }
}
