//! The two Q-learner variants (spec §4.5): max-Q and average-Q updates,
//! plus the NaN/unreachable fallback rule and the `punish_state` operation
//! used when a nested condition turns out unsat.
//!
//! Episodes are trained end-to-start so each update observes an
//! already-updated successor (spec §4.5, "Training direction").

use crate::model::{RLModel, Sa, StateKey, TERMINAL_STATE};
use crate::reward::is_terminal;

/// A fixed penalty subtracted from the current Q-value when punishing a
/// max-Q-model state the solver just proved unreachable beyond a nested
/// constraint. Not specified numerically by the design; kept as a
/// named constant so callers/tests can reason about it explicitly
/// (see DESIGN.md, "punishment penalty").
pub const DEFAULT_PUNISHMENT_PENALTY: f64 = 1.0;

#[derive(Debug, Clone, Copy)]
pub enum Learner {
    MaxQ { alpha: f64, gamma: f64 },
    AvgQ { alpha: f64, gamma: f64 },
}

impl Learner {
    pub fn max_q(alpha: f64, gamma: f64) -> Self {
        Learner::MaxQ { alpha, gamma }
    }

    pub fn avg_q(alpha: f64, gamma: f64) -> Self {
        Learner::AvgQ { alpha, gamma }
    }

    fn successors(model: &RLModel, next_state: StateKey) -> (f64, f64) {
        let q1 = model.q_lookup((next_state.0, next_state.1, next_state.2, 1));
        let q0 = model.q_lookup((next_state.0, next_state.1, next_state.2, 0));
        (q0, q1)
    }

    /// One Q-learning update for `sa`, transitioning to `next_state` with
    /// reward `r`. If the standard update would be NaN, or `sa` was
    /// already marked unreachable, falls back to seeding `Q(sa)` directly
    /// from the bootstrapped target (spec §4.5 fallback rule) rather than
    /// blending it with the stale current value.
    pub fn learn(&self, model: &mut RLModel, sa: Sa, next_state: StateKey, r: f64) {
        let current = model.q_lookup(sa);
        let was_unreachable = model.is_unreachable(sa);

        let (standard, fallback) = if is_terminal(next_state) {
            let alpha = self.alpha();
            (current + alpha * (r - current), r)
        } else {
            let (q0, q1) = Self::successors(model, next_state);
            match *self {
                Learner::MaxQ { alpha, gamma } => {
                    let m = q0.max(q1);
                    (current + alpha * (r + gamma * m - current), r + gamma * m)
                }
                Learner::AvgQ { alpha, gamma } => {
                    let avg = (q0 + q1) / 2.0;
                    (current + alpha * (gamma * avg - current), gamma * avg)
                }
            }
        };

        if standard.is_nan() || was_unreachable {
            if fallback.is_finite() {
                model.q_update(sa, fallback);
            }
            // else: leave Q(sa) unchanged, per spec.
        } else {
            model.q_update(sa, standard);
        }
    }

    fn alpha(&self) -> f64 {
        match *self {
            Learner::MaxQ { alpha, .. } | Learner::AvgQ { alpha, .. } => alpha,
        }
    }

    /// Forces a learn-step to the terminal sentinel with a reward derived
    /// from the current Q-value, used when a nested branch turns out
    /// unsat: the state the agent *hoped* to reach must be actively
    /// devalued so the policy stops chasing it.
    pub fn punish_state(&self, model: &mut RLModel, sa: Sa, penalty: f64) {
        let current = model.q_lookup(sa);
        let reward = match *self {
            Learner::MaxQ { .. } => current - penalty,
            Learner::AvgQ { .. } => current / 2.0,
        };
        self.learn(model, sa, TERMINAL_STATE, reward);
    }

    /// Trains every `(sa, reward)` transition in one episode, end to
    /// start. `rewards` must have exactly `episode.len() + 1` entries: one
    /// per-step reward per `sa`, plus the trailing terminal reward (spec
    /// §4.4). The transition out of the *last* state in the episode uses
    /// both its own per-step reward and the terminal reward summed, since
    /// each carries distinct information (local progress vs. run outcome)
    /// that the terminal-sentinel learn step is the only place to apply.
    pub fn train_episode(&self, model: &mut RLModel, episode: &[Sa], rewards: &[f64]) {
        let n = episode.len();
        if n == 0 {
            return;
        }
        assert_eq!(rewards.len(), n + 1, "rewards must be episode.len() + 1");
        for i in (0..n).rev() {
            let sa = episode[i];
            let is_last = i + 1 == n;
            let next_state = if is_last {
                TERMINAL_STATE
            } else {
                let (p, c, b, _) = episode[i + 1];
                (p, c, b)
            };
            let reward = if is_last {
                rewards[i] + rewards[n]
            } else {
                rewards[i]
            };
            self.learn(model, sa, next_state, reward);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelKind;

    #[test]
    fn max_q_terminal_update_moves_toward_reward() {
        let mut model = RLModel::new(ModelKind::Distance, None);
        let learner = Learner::max_q(0.5, 1.0);
        let sa = (1, 1, 0, 0);
        learner.learn(&mut model, sa, TERMINAL_STATE, 10.0);
        assert_eq!(model.q_lookup(sa), 5.0); // 0 + 0.5*(10-0)
    }

    #[test]
    fn max_q_non_terminal_uses_max_of_successors() {
        let mut model = RLModel::new(ModelKind::Distance, None);
        model.q_update((2, 2, 0, 0), 4.0);
        model.q_update((2, 2, 0, 1), 6.0);
        let learner = Learner::max_q(0.5, 1.0);
        let sa = (1, 1, 0, 0);
        learner.learn(&mut model, sa, (2, 2, 0), 1.0);
        // current=0, r=1, gamma*m=6 -> 0 + 0.5*(1+6-0) = 3.5
        assert_eq!(model.q_lookup(sa), 3.5);
    }

    #[test]
    fn avg_q_non_terminal_ignores_reward_term() {
        let mut model = RLModel::new(ModelKind::Reachability, None);
        model.q_update((2, 2, 0, 0), 0.2);
        model.q_update((2, 2, 0, 1), 0.8);
        let learner = Learner::avg_q(0.5, 1.0);
        let sa = (1, 1, 0, 0);
        learner.learn(&mut model, sa, (2, 2, 0), 999.0);
        // avg = 0.5, current=0 -> 0 + 0.5*(1*0.5 - 0) = 0.25
        assert_eq!(model.q_lookup(sa), 0.25);
    }

    #[test]
    fn learn_no_nan_for_finite_inputs() {
        let mut model = RLModel::new(ModelKind::Distance, None);
        let learner = Learner::max_q(0.5, 0.9);
        let sa = (1, 1, 0, 0);
        learner.learn(&mut model, sa, TERMINAL_STATE, 7.0);
        assert!(model.q_lookup(sa).is_finite());
    }

    #[test]
    fn unreachable_sa_uses_fallback_not_blended_update() {
        let mut model = RLModel::new(ModelKind::Distance, None);
        let sa = (1, 1, 0, 1);
        model.q_update(sa, 100.0); // stale high value
        model.add_unreachable_sa(sa);
        let learner = Learner::max_q(0.5, 1.0);
        learner.learn(&mut model, sa, TERMINAL_STATE, 2.0);
        // fallback = r = 2.0, not a blend with the stale 100.0
        assert_eq!(model.q_lookup(sa), 2.0);
    }

    #[test]
    fn punish_state_max_q_subtracts_penalty() {
        let mut model = RLModel::new(ModelKind::Distance, None);
        let sa = (1, 1, 0, 1);
        model.q_update(sa, 10.0);
        let learner = Learner::max_q(1.0, 1.0); // alpha=1 makes terminal update exact
        learner.punish_state(&mut model, sa, 3.0);
        assert_eq!(model.q_lookup(sa), 7.0);
    }

    #[test]
    fn punish_state_avg_q_halves_value() {
        let mut model = RLModel::new(ModelKind::Reachability, None);
        let sa = (1, 1, 0, 1);
        model.q_update(sa, 0.8);
        let learner = Learner::avg_q(1.0, 1.0);
        learner.punish_state(&mut model, sa, 0.0);
        assert_eq!(model.q_lookup(sa), 0.4);
    }

    #[test]
    fn train_episode_processes_end_to_start() {
        let mut model = RLModel::new(ModelKind::Distance, None);
        let learner = Learner::max_q(1.0, 1.0);
        let episode = vec![(1, 1, 0, 0), (2, 2, 0, 1)];
        let rewards = vec![0.0, 0.0, 5.0]; // terminal reward only
        learner.train_episode(&mut model, &episode, &rewards);
        // last sa gets terminal update first: Q=0+1*(0+5-0)=5
        assert_eq!(model.q_lookup(episode[1]), 5.0);
        // first sa bootstraps off the now-updated successor state (2,2,0):
        // max(Q(2,2,0,0)=0, Q(2,2,0,1)=5) = 5 -> Q=0+1*(0+1*5-0)=5
        assert_eq!(model.q_lookup(episode[0]), 5.0);
    }
}
