//! Announce-list tier handling

use rand::seq::SliceRandom;

/// Shuffle the trackers of every tier; the tier order is kept
pub fn shuffle_tiers(tiers: &mut [Vec<String>]) {
    let mut rng = rand::thread_rng();
    for tier in tiers.iter_mut() {
        tier.shuffle(&mut rng);
    }
}

/// Move `tracker` to the front of its tier
///
/// Returns false when the tracker is in no tier.
pub fn promote(tiers: &mut [Vec<String>], tracker: &str) -> bool {
    for tier in tiers.iter_mut() {
        if let Some(pos) = tier.iter().position(|t| t == tracker) {
            let url = tier.remove(pos);
            tier.insert(0, url);
            return true;
        }
    }
    false
}

/// Every tracker URL, tier by tier
pub fn all_trackers(tiers: &[Vec<String>]) -> Vec<String> {
    tiers.iter().flatten().cloned().collect()
}
