//! Reward calculators: pure functions over one execution's episode (spec
//! §4.4). They don't touch the model; [`crate::learner`] consumes their
//! output to mutate it.

use crate::model::{ModelKind, TERMINAL_STATE};

/// Per-step distance observed at each episode index, as recorded by the
/// agent while it was building the episode.
pub type DistanceTrace = Vec<u64>;

/// Computes the per-transition reward sequence for one episode under the
/// distance model. `distances[i]` is `episode[i].d`; the result has one
/// more entry than `distances` — the trailing entry is the terminal
/// reward.
pub fn distance_rewards(distances: &DistanceTrace, min_d: Option<u64>, max_distance: f64) -> Vec<f64> {
    let n = distances.len();
    let mut rewards = Vec::with_capacity(n + 1);
    for i in 0..n {
        let d = distances[i];
        if d == 0 {
            rewards.push(max_distance);
            continue;
        }
        if is_local_minimum(distances, i) {
            let d = d as f64;
            rewards.push((1000.0 / d).powi(2) * max_distance);
        } else {
            rewards.push(0.0);
        }
    }
    let terminal = match min_d {
        Some(0) => max_distance,
        Some(d) if d > 0 => -max_distance,
        _ => 0.0,
    };
    rewards.push(terminal);
    rewards
}

/// Same transition shape as [`distance_rewards`], but under the binary
/// reachability model: `1` where the target was hit, `0` elsewhere.
pub fn reachability_rewards(distances: &DistanceTrace, min_d: Option<u64>) -> Vec<f64> {
    let mut rewards: Vec<f64> = distances
        .iter()
        .map(|&d| if d == 0 { 1.0 } else { 0.0 })
        .collect();
    rewards.push(if min_d == Some(0) { 1.0 } else { 0.0 });
    rewards
}

pub fn rewards_for(
    kind: ModelKind,
    distances: &DistanceTrace,
    min_d: Option<u64>,
    max_distance: f64,
) -> Vec<f64> {
    match kind {
        ModelKind::Distance => distance_rewards(distances, min_d, max_distance),
        ModelKind::Reachability => reachability_rewards(distances, min_d),
    }
}

/// `i` is a local minimum of `distances` when its neighbors (out-of-range
/// treated as `+inf`) are both `>=` it.
fn is_local_minimum(distances: &[u64], i: usize) -> bool {
    let d = distances[i];
    let prev = if i == 0 { u64::MAX } else { distances[i - 1] };
    let next = distances.get(i + 1).copied().unwrap_or(u64::MAX);
    prev >= d && d <= next
}

/// Whether `next_state` is the terminal sentinel the learners special-case.
pub fn is_terminal(next_state: (u64, u64, u32)) -> bool {
    next_state == TERMINAL_STATE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_reward_sign_follows_min_distance() {
        let d = vec![5, 3, 1];
        let hit = distance_rewards(&d, Some(0), 1000.0);
        assert_eq!(*hit.last().unwrap(), 1000.0);
        let miss = distance_rewards(&d, Some(2), 1000.0);
        assert_eq!(*miss.last().unwrap(), -1000.0);
        let unknown = distance_rewards(&d, None, 1000.0);
        assert_eq!(*unknown.last().unwrap(), 0.0);
    }

    #[test]
    fn per_step_zero_distance_gets_max_reward() {
        let d = vec![0, 4];
        let r = distance_rewards(&d, Some(0), 1000.0);
        assert_eq!(r[0], 1000.0);
    }

    #[test]
    fn per_step_local_minimum_gets_boosted_reward() {
        // distances: 5, 2, 4 -> index 1 is a local minimum
        let d = vec![5, 2, 4];
        let r = distance_rewards(&d, Some(1), 1000.0);
        assert_eq!(r[1], (1000.0 / 2.0_f64).powi(2) * 1000.0);
        assert_eq!(r[0], 0.0); // not a local minimum: prev (+inf) >= 5, but 5 <= 2 is false
        assert_eq!(r[2], 0.0); // next (+inf) >= 4 but 2 >= 4 is false
    }

    #[test]
    fn reachability_rewards_are_binary() {
        let d = vec![0, 3, 5];
        let r = reachability_rewards(&d, Some(0));
        assert!(r.iter().all(|&x| x == 0.0 || x == 1.0));
        assert_eq!(r[0], 1.0);
        assert_eq!(r[1], 0.0);
        assert_eq!(*r.last().unwrap(), 1.0);
    }
}
