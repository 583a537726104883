//! Per-execution state tracking and the branch-interest policy (spec §4.6).
//!
//! `spec.md` reconciles two distinct `Agent` hierarchies found in the
//! original source into one canonical, bucketed design; this module
//! implements that canonical design directly rather than either original
//! variant. Per the design notes (spec §9), the class hierarchy becomes a
//! plain enum of concrete variants (`Agent`) dispatching through a small
//! capability set: `handle_new_state`, `is_interesting_branch`,
//! `handle_unsat_condition`, `handle_nested_unsat_condition`,
//! `compute_branch_score`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use libafl_bolts::rands::{Rand, StdRand};
use serde::{Deserialize, Serialize};

use crate::error::MazerunnerError;
use crate::learner::{Learner, DEFAULT_PUNISHMENT_PENALTY};
use crate::model::{ModelKind, RLModel, Sa, StateKey};
use crate::reward::rewards_for;
use crate::solver::SolvingStatus;

/// An `sa`'s third component saturates here; states at the cap are no
/// longer distinguished (spec §3, "state inheritance") and are excluded
/// from the episode (spec §8 property 1).
pub const MAX_BUCKET_SIZE: u32 = 7;

/// `no_progress_count > CONVERGING_THRESHOLD` marks an exploit agent
/// converged (spec glossary).
pub const CONVERGING_THRESHOLD: u32 = 10;

/// Quantizes a per-episode visit count into a bucket, clamped at
/// [`MAX_BUCKET_SIZE`]. Monotonically non-decreasing in `count` (spec §8
/// property 1).
pub fn bucket_lookup(count: u64) -> u32 {
    match count {
        0 => 0,
        1 => 1,
        2 => 2,
        3 => 3,
        4..=7 => 4,
        8..=15 => 5,
        16..=31 => 6,
        _ => MAX_BUCKET_SIZE,
    }
}

/// One snapshot of where execution is, what action was just taken, and how
/// far from the target it is estimated to be (spec §3).
#[derive(Debug, Clone)]
pub struct ProgramState {
    pub state: StateKey,
    pub action: u8,
    pub d: Option<u64>,
    edge_counter: HashMap<(u64, u64, u64), u64>,
}

impl ProgramState {
    pub fn new(max_distance: u64) -> Self {
        ProgramState {
            state: (0, 0, 0),
            action: 0,
            d: Some(max_distance),
            edge_counter: HashMap::new(),
        }
    }

    /// Advances to a new `(pc, callstack)`, bumping the per-episode visit
    /// counter for the edge `(prev_pc, pc, callstack)` and rebucketing.
    pub fn update(&mut self, pc: u64, callstack: u64, action: u8, distance: Option<u64>) {
        let edge = (self.state.0, pc, callstack);
        let count = self.edge_counter.entry(edge).or_insert(0);
        *count += 1;
        let bucket = bucket_lookup(*count);
        self.state = (pc, callstack, bucket);
        self.action = action;
        self.d = distance;
    }

    pub fn sa(&self) -> Sa {
        (self.state.0, self.state.1, self.state.2, self.action)
    }

    pub fn reversed_sa(&self) -> Sa {
        let reversed_action = if self.action == 0 { 1 } else { 0 };
        (self.state.0, self.state.1, self.state.2, reversed_action)
    }
}

/// A finite sequence of `sa` keys for one concrete execution, plus the
/// per-step distances needed to compute rewards over it.
#[derive(Debug, Default, Clone)]
pub struct Episode {
    entries: Vec<Sa>,
    distances: Vec<u64>,
}

impl Episode {
    pub fn new() -> Self {
        Episode::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.distances.clear();
    }

    /// Appends `state` iff its bucket hasn't saturated and it isn't a
    /// consecutive duplicate of the last entry (spec §3, §8 properties
    /// 1-2).
    pub fn append_if_eligible(&mut self, state: &ProgramState) {
        let Some(d) = state.d else { return };
        if state.state.2 >= MAX_BUCKET_SIZE {
            return;
        }
        let sa = state.sa();
        if self.entries.last() == Some(&sa) {
            return;
        }
        self.entries.push(sa);
        self.distances.push(d);
    }

    pub fn entries(&self) -> &[Sa] {
        &self.entries
    }

    pub fn distances(&self) -> &[u64] {
        &self.distances
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, sa: Sa) -> bool {
        self.entries.contains(&sa)
    }
}

/// State and persisted episode of one saved/replayed trace.
#[derive(Debug, Serialize, Deserialize)]
pub struct Trace {
    pub entries: Vec<Sa>,
    pub distances: Vec<u64>,
    pub min_distance: Option<u64>,
}

/// Fields and operations shared by every agent variant.
pub struct AgentCore {
    pub curr_state: ProgramState,
    pub episode: Episode,
    pub min_distance: u64,
    pub max_distance: u64,
    pub model: Rc<RefCell<RLModel>>,
    pub learner: Learner,
    pub model_kind: ModelKind,
    rand: StdRand,
}

impl AgentCore {
    pub fn new(
        model: Rc<RefCell<RLModel>>,
        learner: Learner,
        model_kind: ModelKind,
        max_distance: u64,
        seed: u64,
    ) -> Self {
        AgentCore {
            curr_state: ProgramState::new(max_distance),
            episode: Episode::new(),
            min_distance: max_distance,
            max_distance,
            model,
            learner,
            model_kind,
            rand: StdRand::with_seed(seed),
        }
    }

    pub fn reset(&mut self) {
        self.curr_state = ProgramState::new(self.max_distance);
        self.episode.clear();
        self.min_distance = self.max_distance;
    }

    fn update_curr_state(&mut self, pc: u64, callstack: u64, action: u8, distance: Option<u64>) {
        if let Some(d) = distance {
            if d < self.min_distance {
                self.min_distance = d;
            }
        }
        self.curr_state.update(pc, callstack, action, distance);
    }

    fn append_episode(&mut self) {
        self.episode.append_if_eligible(&self.curr_state);
    }

    /// A curiosity-and-Q-distance-derived score for the branch currently
    /// under consideration, used only to annotate generated testcase
    /// names (spec §4.2: `,<score>:<reversed_sa>`); never-visited states
    /// rank highest ("curiosity"), otherwise ranked by the model's
    /// comparable distance for the reversed action.
    fn branch_score(&self, reversed_sa: Sa) -> f64 {
        let model = self.model.borrow();
        if !model.is_visited(reversed_sa) {
            return f64::INFINITY;
        }
        let (p, c, b, a) = reversed_sa;
        model.get_distance((p, c, b), a, true)
    }

    /// Draws a uniform sample in `[0, 1)` via `Rand::below` over a fixed
    /// denominator and compares it against `prob`.
    fn chance(&mut self, prob: f64) -> bool {
        const PRECISION: usize = 1_000_000;
        let roll = self.rand.below(NonZeroUsize::new(PRECISION).unwrap());
        (roll as f64 / PRECISION as f64) < prob
    }

    fn train_on_episode(&mut self) {
        if self.episode.is_empty() {
            return;
        }
        let rewards = rewards_for(
            self.model_kind,
            &self.episode.distances().to_vec(),
            Some(self.min_distance),
            self.max_distance as f64,
        );
        let mut model = self.model.borrow_mut();
        self.learner
            .train_episode(&mut model, self.episode.entries(), &rewards);
    }
}

pub struct ExploreAgent {
    pub core: AgentCore,
}

impl ExploreAgent {
    pub fn handle_new_state(&mut self, pc: u64, callstack: u64, action: u8, distance: Option<u64>) {
        self.core.update_curr_state(pc, callstack, action, distance);
        let curr_sa = self.core.curr_state.sa();
        self.core.model.borrow_mut().remove_target_sa(curr_sa);
        self.core.append_episode();
    }

    pub fn is_interesting_branch(&mut self) -> bool {
        if self.core.curr_state.d.is_none() {
            return false;
        }
        let reversed_sa = self.core.curr_state.reversed_sa();
        let interesting = {
            let model = self.core.model.borrow();
            !model.is_unreachable(reversed_sa)
                && !model.is_target(reversed_sa)
                && !model.is_visited(reversed_sa)
        };
        if interesting {
            self.core.model.borrow_mut().add_target_sa(reversed_sa);
        }
        interesting
    }

    pub fn handle_unsat_condition(&mut self, reversed_sa: Sa, status: SolvingStatus) {
        if status == SolvingStatus::UnsolvedUninterestingSat {
            return;
        }
        self.core.model.borrow_mut().add_unreachable_sa(reversed_sa);
    }

    pub fn handle_nested_unsat_condition(&mut self, reversed_sa: Sa) {
        let mut model = self.core.model.borrow_mut();
        self.core
            .learner
            .punish_state(&mut model, reversed_sa, DEFAULT_PUNISHMENT_PENALTY);
    }

    pub fn compute_branch_score(&self) -> f64 {
        self.core.branch_score(self.core.curr_state.reversed_sa())
    }

    /// Trains the model on this run's episode once the execution has
    /// finished (spec §4.6: explore trains once per execution, at
    /// teardown, unlike exploit's per-flip-loop training).
    pub fn train_on_episode(&mut self) {
        self.core.train_on_episode();
    }
}

pub struct ExploitAgent {
    pub core: AgentCore,
    pub epsilon: f64,
    /// `(reversed_sa, episode length at selection time)`; `None` while no
    /// flip is currently being pursued.
    pub target: Option<(Sa, usize)>,
    pub all_targets: Vec<Sa>,
    pub last_targets: Vec<Sa>,
    pub no_progress_count: u32,
}

impl ExploitAgent {
    pub fn handle_new_state(&mut self, pc: u64, callstack: u64, action: u8, distance: Option<u64>) {
        self.core.update_curr_state(pc, callstack, action, distance);
        self.core.append_episode();
        let curr_sa = self.core.curr_state.sa();
        if let Some((target_sa, trace_len)) = self.target {
            if curr_sa == target_sa && self.core.episode.len() == trace_len {
                self.target = None;
            }
        }
    }

    pub fn is_interesting_branch(&mut self) -> bool {
        if self.core.curr_state.d.is_none() {
            return false;
        }
        if self.target.is_some() {
            return false;
        }
        let reversed_sa = self.core.curr_state.reversed_sa();
        let curr_sa = self.core.curr_state.sa();
        let eligible = {
            let model = self.core.model.borrow();
            !model.is_unreachable(reversed_sa) && model.is_visited(curr_sa)
        };
        if !eligible {
            return false;
        }
        let interesting = self.epsilon_greedy_policy(reversed_sa);
        if interesting {
            self.all_targets.push(reversed_sa);
            self.target = Some((reversed_sa, self.core.episode.len()));
        }
        interesting
    }

    /// Whether the agent should ask the solver to visit the flipped
    /// branch: curiosity (scaled down the more a state has been visited)
    /// or, failing that, disagreement with the greedy policy.
    fn epsilon_greedy_policy(&mut self, reversed_sa: Sa) -> bool {
        let (visited, visit_count) = {
            let model = self.core.model.borrow();
            (model.is_visited(reversed_sa), model.visit_count(reversed_sa))
        };
        if !visited {
            if self.core.chance(self.epsilon) {
                return true;
            }
        } else if self.core.chance(self.epsilon.powi(visit_count as i32)) {
            return true;
        }
        self.greedy_policy() != self.core.curr_state.action
    }

    /// The action the current Q-values prefer at `curr_state`.
    fn greedy_policy(&self) -> u8 {
        let (p, c, b) = self.core.curr_state.state;
        let model = self.core.model.borrow();
        let q_taken = model.q_lookup((p, c, b, 1));
        let q_not_taken = model.q_lookup((p, c, b, 0));
        if q_taken > q_not_taken {
            1
        } else if q_taken < q_not_taken {
            0
        } else {
            self.core.curr_state.action
        }
    }

    /// Records the reversed sa as unreachable *before* clearing the
    /// target (spec §9: "record the sa first, pop last" — the explicit
    /// fix for the original's order-dependent bug).
    pub fn handle_unsat_condition(&mut self) {
        if let Some((reversed_sa, _)) = self.target {
            self.core.model.borrow_mut().add_unreachable_sa(reversed_sa);
        }
        self.target = None;
    }

    pub fn handle_nested_unsat_condition(&mut self, reversed_sa: Sa) {
        let mut model = self.core.model.borrow_mut();
        self.core
            .learner
            .punish_state(&mut model, reversed_sa, DEFAULT_PUNISHMENT_PENALTY);
    }

    pub fn compute_branch_score(&self) -> f64 {
        self.core.branch_score(self.core.curr_state.reversed_sa())
    }

    /// Called once a `run_target` loop iteration has fully settled (no
    /// target set, max flips hit, or the solver gave up). Advances the
    /// stall counter used by [`ExploitAgent::has_converged`].
    pub fn finish_iteration(&mut self, hit_max_flip: bool) {
        let stalled = hit_max_flip || self.all_targets == self.last_targets;
        if stalled {
            self.no_progress_count += 1;
        } else {
            self.no_progress_count = 0;
        }
        self.last_targets = std::mem::take(&mut self.all_targets);
    }

    pub fn has_converged(&self) -> bool {
        self.no_progress_count > CONVERGING_THRESHOLD
    }

    pub fn train_on_episode(&mut self) {
        self.core.train_on_episode();
    }
}

pub struct RecordAgent {
    pub core: AgentCore,
    pub traces_dir: PathBuf,
}

impl RecordAgent {
    pub fn handle_new_state(&mut self, pc: u64, callstack: u64, action: u8, distance: Option<u64>) {
        self.core.update_curr_state(pc, callstack, action, distance);
        self.core.append_episode();
    }

    pub fn is_interesting_branch(&self) -> bool {
        false
    }

    pub fn save_trace(&self, filename: &str) -> Result<(), MazerunnerError> {
        fs::create_dir_all(&self.traces_dir)?;
        let trace = Trace {
            entries: self.core.episode.entries().to_vec(),
            distances: self.core.episode.distances().to_vec(),
            min_distance: Some(self.core.min_distance),
        };
        let file = File::create(self.traces_dir.join(filename))?;
        let mut writer = BufWriter::new(file);
        ciborium::into_writer(&trace, &mut writer)?;
        Ok(())
    }
}

pub struct ReplayAgent {
    pub core: AgentCore,
}

impl ReplayAgent {
    /// Trains the model on one previously recorded trace file.
    pub fn replay_log(&mut self, path: &Path) -> Result<(), MazerunnerError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let trace: Trace = ciborium::from_reader(reader)?;
        self.replay_trace(&trace);
        Ok(())
    }

    pub fn replay_trace(&mut self, trace: &Trace) {
        if trace.entries.is_empty() {
            return;
        }
        let rewards = rewards_for(
            self.core.model_kind,
            &trace.distances,
            trace.min_distance,
            self.core.max_distance as f64,
        );
        for sa in &trace.entries {
            self.core.model.borrow_mut().add_visited_sa(*sa);
        }
        let mut model = self.core.model.borrow_mut();
        self.core
            .learner
            .train_episode(&mut model, &trace.entries, &rewards);
    }
}

/// The four agent variants (spec §4.6), dispatched through a small
/// capability set rather than a class hierarchy (spec §9).
pub enum Agent {
    Explore(ExploreAgent),
    Exploit(ExploitAgent),
    Record(RecordAgent),
    Replay(ReplayAgent),
}

impl Agent {
    pub fn core_mut(&mut self) -> &mut AgentCore {
        match self {
            Agent::Explore(a) => &mut a.core,
            Agent::Exploit(a) => &mut a.core,
            Agent::Record(a) => &mut a.core,
            Agent::Replay(a) => &mut a.core,
        }
    }

    pub fn core(&self) -> &AgentCore {
        match self {
            Agent::Explore(a) => &a.core,
            Agent::Exploit(a) => &a.core,
            Agent::Record(a) => &a.core,
            Agent::Replay(a) => &a.core,
        }
    }

    pub fn reset(&mut self) {
        self.core_mut().reset();
    }

    pub fn min_distance(&self) -> u64 {
        self.core().min_distance
    }

    pub fn set_min_distance(&mut self, d: u64) {
        let core = self.core_mut();
        if d < core.min_distance {
            core.min_distance = d;
        }
    }

    pub fn handle_new_state(&mut self, pc: u64, callstack: u64, action: u8, distance: Option<u64>) {
        match self {
            Agent::Explore(a) => a.handle_new_state(pc, callstack, action, distance),
            Agent::Exploit(a) => a.handle_new_state(pc, callstack, action, distance),
            Agent::Record(a) => a.handle_new_state(pc, callstack, action, distance),
            Agent::Replay(_) => {}
        }
    }

    pub fn is_interesting_branch(&mut self) -> bool {
        match self {
            Agent::Explore(a) => a.is_interesting_branch(),
            Agent::Exploit(a) => a.is_interesting_branch(),
            Agent::Record(a) => a.is_interesting_branch(),
            Agent::Replay(_) => false,
        }
    }

    pub fn handle_unsat_condition(&mut self, status: SolvingStatus) {
        match self {
            Agent::Explore(a) => {
                let reversed_sa = a.core.curr_state.reversed_sa();
                a.handle_unsat_condition(reversed_sa, status);
            }
            Agent::Exploit(a) => a.handle_unsat_condition(),
            _ => {}
        }
    }

    pub fn handle_nested_unsat_condition(&mut self, reversed_sa: Sa) {
        match self {
            Agent::Explore(a) => a.handle_nested_unsat_condition(reversed_sa),
            Agent::Exploit(a) => a.handle_nested_unsat_condition(reversed_sa),
            _ => {}
        }
    }

    pub fn compute_branch_score(&self) -> f64 {
        match self {
            Agent::Explore(a) => a.compute_branch_score(),
            Agent::Exploit(a) => a.compute_branch_score(),
            _ => 0.0,
        }
    }

    pub fn is_record(&self) -> bool {
        matches!(self, Agent::Record(_))
    }

    pub fn is_exploit(&self) -> bool {
        matches!(self, Agent::Exploit(_))
    }

    pub fn save_seed_info_enabled(&self) -> bool {
        matches!(self, Agent::Explore(_) | Agent::Exploit(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelKind;

    fn core(seed: u64) -> AgentCore {
        AgentCore::new(
            Rc::new(RefCell::new(RLModel::new(ModelKind::Distance, None))),
            Learner::max_q(0.5, 1.0),
            ModelKind::Distance,
            100,
            seed,
        )
    }

    #[test]
    fn bucket_monotonic_and_clamps() {
        let mut last = 0;
        for count in 0..200u64 {
            let b = bucket_lookup(count);
            assert!(b >= last);
            last = b;
        }
        assert_eq!(bucket_lookup(1000), MAX_BUCKET_SIZE);
    }

    #[test]
    fn episode_dedups_consecutive_entries() {
        let mut episode = Episode::new();
        let mut state = ProgramState::new(100);
        state.update(1, 1, 0, Some(5));
        episode.append_if_eligible(&state);
        episode.append_if_eligible(&state); // same sa, should be ignored
        assert_eq!(episode.len(), 1);
    }

    #[test]
    fn episode_excludes_saturated_bucket() {
        let mut episode = Episode::new();
        let mut state = ProgramState::new(100);
        // Hammer the same edge until its bucket saturates.
        for _ in 0..200 {
            state.update(1, 1, 0, Some(5));
            episode.append_if_eligible(&state);
        }
        assert!(episode.len() < 200);
        assert!(state.state.2 == MAX_BUCKET_SIZE);
    }

    #[test]
    fn explore_agent_marks_reversed_sa_interesting_once() {
        let mut agent = ExploreAgent { core: core(1) };
        agent.handle_new_state(0x1000, 0, 0, Some(10));
        assert!(agent.is_interesting_branch());
        // a second call for the same state must not re-flag it: it's now a target.
        assert!(!agent.is_interesting_branch());
    }

    #[test]
    fn exploit_agent_clears_target_on_reaching_it() {
        let mut agent = ExploitAgent {
            core: core(1),
            epsilon: 1.0, // always curious -> deterministic test
            target: None,
            all_targets: vec![],
            last_targets: vec![],
            no_progress_count: 0,
        };
        agent.core.model.borrow_mut().add_visited_sa((0, 0, 0, 0));
        agent.handle_new_state(0, 0, 0, Some(10));
        assert!(agent.is_interesting_branch());
        assert!(agent.target.is_some());
        let (target_sa, _) = agent.target.unwrap();
        // Simulate reaching the flipped branch.
        let (pc, cs, bucket, action) = target_sa;
        agent.handle_new_state(pc, cs, action, Some(5));
        let _ = bucket;
        assert!(agent.target.is_none());
    }

    #[test]
    fn exploit_converges_after_eleven_stalled_iterations() {
        let mut agent = ExploitAgent {
            core: core(1),
            epsilon: 0.5,
            target: None,
            all_targets: vec![],
            last_targets: vec![],
            no_progress_count: 0,
        };
        for _ in 0..11 {
            agent.finish_iteration(true);
        }
        assert!(agent.has_converged());
    }

    #[test]
    fn record_agent_never_interesting_but_always_appends() {
        let agent = RecordAgent {
            core: core(1),
            traces_dir: PathBuf::from("/tmp/does-not-matter"),
        };
        assert!(!agent.is_interesting_branch());
    }

    /// S1: recording an episode and then replaying its saved trace must
    /// train the model identically to training on the live episode.
    #[test]
    fn record_then_replay_reproduces_the_same_q_updates() {
        let tmp = tempfile::tempdir().unwrap();
        let model = Rc::new(RefCell::new(RLModel::new(ModelKind::Distance, None)));
        let learner = Learner::max_q(0.5, 1.0);

        let mut recorder = RecordAgent {
            core: AgentCore::new(Rc::clone(&model), learner, ModelKind::Distance, 100, 1),
            traces_dir: tmp.path().to_path_buf(),
        };
        recorder.handle_new_state(0x1000, 0, 0, Some(0));
        recorder.core.train_on_episode();
        recorder.save_trace("trace_0").unwrap();
        let live_value = model.borrow().q_lookup((0x1000, 0, 0, 0));

        let replay_model = Rc::new(RefCell::new(RLModel::new(ModelKind::Distance, None)));
        let mut replayer = ReplayAgent {
            core: AgentCore::new(Rc::clone(&replay_model), learner, ModelKind::Distance, 100, 1),
        };
        replayer.replay_log(&tmp.path().join("trace_0")).unwrap();
        let replayed_value = replay_model.borrow().q_lookup((0x1000, 0, 0, 0));

        assert_eq!(live_value, replayed_value);
    }
}
