//! Run-level orchestration: the seed queue, crash/hang bookkeeping, and the
//! per-mode drivers that tie the executor, agent, and model together over
//! the lifetime of a run (spec §5, §4.8; grounded on
//! `original_source/mazerunner/afl.py`'s `Mazerunner` base class and its
//! `QSYMExecutor`/`ExploreExecutor`/`ExploitExecutor`/`RecordExecutor`/
//! `ReplayExecutor`/`HybridExecutor` subclasses).
//!
//! `original_source/mazerunner/minimizer.py` does not exist in this
//! codebase's ancestry, so the AFL-queue novelty checks the original calls
//! through `self.minimizer` (`has_new_cov`, `is_new_file`,
//! `has_closer_distance`) have no ported source. [`Orchestrator`] stands
//! those in with the simplified md5-dedup plus closer-distance check
//! below; see DESIGN.md.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::info;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::agent::{Agent, AgentCore, ExploitAgent, ExploreAgent, RecordAgent, ReplayAgent};
use crate::config::Config;
use crate::error::MazerunnerError;
use crate::executor::{ConcolicExecutor, ExecutorResult};
use crate::learner::Learner;
use crate::mail::MailSink;
use crate::model::RLModel;
use crate::solver::PatchSolver;

/// Crash-count bookkeeping for a single input file. The original Python
/// kept `crashes` as a `set`, which silently collapsed the retry count of
/// every crashing input to membership-only; here it is a real counter with
/// an explicit `-1` sentinel for "seen before, but past the report cutoff
/// so no longer retried" (spec §9, crash-count bug fix).
pub type CrashCounts = HashMap<String, i64>;

/// What a finished execution amounted to, classified from the executor's
/// raw result (spec §5): `returncode` is `None` when the child died to an
/// uncaught signal (a crash), and the `timeout` wrapper around the child
/// exits `124` on its own timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Crashed,
    TimedOut,
}

const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long to wait before retrying an empty sync when nothing is wrong
/// (afl.py `WAITING_INTERVAL`).
const WAITING_INTERVAL: Duration = Duration::from_secs(5);

/// How long to let the external fuzzer catch up after a hang-triggered
/// timeout increase (afl.py: `increase_timeout` always sleeps 60s).
const HANG_SLEEP: Duration = Duration::from_secs(60);

pub fn classify(result: &ExecutorResult) -> Outcome {
    match result.returncode {
        None => Outcome::Crashed,
        Some(TIMEOUT_EXIT_CODE) => Outcome::TimedOut,
        Some(code) if code < 0 => Outcome::Crashed,
        Some(_) => Outcome::Completed,
    }
}

/// Run-spanning state persisted across explore/exploit/hybrid sessions
/// (spec §5). Lives alongside the model under `<output>/mazerunner/`.
#[derive(Debug, Serialize, Deserialize)]
pub struct MazerunnerState {
    pub timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub exploit_ce_time: Duration,
    pub explore_ce_time: Duration,
    pub synced: HashSet<String>,
    pub hang: HashSet<String>,
    pub processed: HashSet<String>,
    pub crashes: CrashCounts,
    pub testcase_md5s: HashSet<String>,
    pub index: u64,
    pub num_error_reports: u32,
    pub num_crash_reports: u32,
    pub best_min_distance: Option<u64>,
    /// The best (lowest-distance) seed found this run, used as exploit
    /// mode's working input (afl.py `_best_seed_info[0]`).
    pub best_seed: Option<String>,
    /// Set whenever [`MazerunnerState::note_distance`] improves on
    /// `best_min_distance`; consumed by the hybrid driver's decision rule
    /// and by exploit's stall counter reset (afl.py
    /// `discovered_closer_seed`).
    pub discovered_closer_seed: bool,
}

impl MazerunnerState {
    pub fn new(timeout_secs: u64, max_timeout_secs: u64) -> Self {
        MazerunnerState {
            timeout_secs,
            max_timeout_secs,
            exploit_ce_time: Duration::ZERO,
            explore_ce_time: Duration::ZERO,
            synced: HashSet::new(),
            hang: HashSet::new(),
            processed: HashSet::new(),
            crashes: HashMap::new(),
            testcase_md5s: HashSet::new(),
            index: 0,
            num_error_reports: 0,
            num_crash_reports: 0,
            best_min_distance: None,
            best_seed: None,
            discovered_closer_seed: false,
        }
    }

    /// Returns the next queue/generation index and advances the counter
    /// (afl.py `tick()`).
    pub fn tick(&mut self) -> u64 {
        let i = self.index;
        self.index += 1;
        i
    }

    pub fn processed_num(&self) -> usize {
        self.processed.len()
    }

    /// Grows the per-run timeout after a hang, capped at `max_timeout_secs`
    /// (mirrors `increase_timeout` in `afl.py`: doubling, not additive).
    pub fn increase_timeout(&mut self) {
        self.timeout_secs = (self.timeout_secs * 2).min(self.max_timeout_secs);
    }

    /// `processed - hang` (afl.py `MazerunnerState.clear()`), run after a
    /// hang-triggered timeout increase so slow seeds get retried at the new,
    /// longer timeout.
    pub fn clear_processed_minus_hang(&mut self) {
        let hang = self.hang.clone();
        self.processed.retain(|p| !hang.contains(p));
    }

    /// Records (or bumps) a crash for `name`. Returns the new count. `-1`
    /// marks a crash that was seen but deliberately not retried further
    /// (spec §9): callers stop bumping once `num_crash_reports` hits its
    /// cap and record the sentinel once via [`Self::mark_crash_seen_only`].
    pub fn record_crash(&mut self, name: &str) -> i64 {
        let entry = self.crashes.entry(name.to_string()).or_insert(0);
        if *entry >= 0 {
            *entry += 1;
        }
        *entry
    }

    pub fn mark_crash_seen_only(&mut self, name: &str) {
        self.crashes.insert(name.to_string(), -1);
    }

    pub fn is_novel(&mut self, contents: &[u8]) -> bool {
        let digest = format!("{:x}", Md5::digest(contents));
        self.testcase_md5s.insert(digest)
    }

    /// Records a fresh `(name, distance)` observation. Returns whether it
    /// improves on the best distance seen so far this run; when it does,
    /// `best_seed`/`best_min_distance` are updated and
    /// `discovered_closer_seed` is set (afl.py `update_best_seed`,
    /// `discovered_closer_seed`).
    pub fn note_distance(&mut self, name: &str, distance: u64) -> bool {
        let improved = match self.best_min_distance {
            Some(best) if distance >= best => false,
            _ => true,
        };
        if improved {
            self.best_min_distance = Some(distance);
            self.best_seed = Some(name.to_string());
            self.discovered_closer_seed = true;
        }
        improved
    }

    fn state_path(dir: &Path) -> PathBuf {
        dir.join("state.json")
    }

    pub fn save(&self, dir: &Path) -> Result<(), MazerunnerError> {
        fs::create_dir_all(dir)?;
        let text = serde_json::to_string_pretty(self)?;
        fs::write(Self::state_path(dir), text)?;
        Ok(())
    }

    pub fn load_or_new(
        dir: &Path,
        timeout_secs: u64,
        max_timeout_secs: u64,
    ) -> Result<Self, MazerunnerError> {
        let path = Self::state_path(dir);
        if !path.exists() {
            return Ok(Self::new(timeout_secs, max_timeout_secs));
        }
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Min-heap over `(priority, path)`, replicating the original's use of a
/// priority queue keyed by `put_seed(fn, priority)` (afl.py): lower
/// priority runs first, and is the seed's last-known distance (or `0` for
/// a freshly synced seed; spec §4.8 "Priority"). `path` breaks ties so
/// `Ord` stays total.
#[derive(Default)]
pub struct SeedQueue {
    heap: BinaryHeap<Reverse<(u64, String)>>,
}

impl SeedQueue {
    pub fn push(&mut self, priority: u64, name: String) {
        self.heap.push(Reverse((priority, name)));
    }

    pub fn pop(&mut self) -> Option<String> {
        self.heap.pop().map(|Reverse((_, name))| name)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Ranks a freshly-synced AFL queue filename, best first: a `+cov` suffix
/// beats none, an `orig:`-tagged seed beats a derived one, and otherwise
/// smaller files win (afl.py `get_score`/`testcase_compare`). Sorting
/// ascending by this key reproduces the original's descending
/// bigger-score-first tuple order.
pub fn testcase_rank(name: &str, file_size: u64) -> (Reverse<bool>, Reverse<bool>, u64, String) {
    let has_cov = name.ends_with("+cov");
    let has_orig = name.contains("orig:");
    (Reverse(has_cov), Reverse(has_orig), file_size, name.to_string())
}

/// Parses AFL's `fuzzer_stats` file into a `name -> value` map, used to
/// detect `-Q` (qemu) mode and read `command_line` (afl.py
/// `parse_fuzzer_stats`).
pub fn parse_fuzzer_stats(text: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once(':') {
            out.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    out
}

/// Ties the executor, agent, model, and [`MazerunnerState`] together across
/// a run. One `Orchestrator` is built per process invocation; the CLI picks
/// which `run_*` method to call based on the requested mode (afl.py's
/// per-subclass `run`).
pub struct Orchestrator {
    pub config: Config,
    pub state: MazerunnerState,
    pub model: Rc<RefCell<RLModel>>,
    pub queue: SeedQueue,
    pub mail: Box<dyn MailSink>,
    /// The exploit agent, kept alive across every exploit step so its
    /// `no_progress_count`/`target`/`all_targets` bookkeeping persists the
    /// way the original's single long-lived `ExploitAgent` object does
    /// across many `_run()` calls (afl.py `ExploitExecutor`).
    exploit_agent: Option<ExploitAgent>,
}

impl Orchestrator {
    pub fn new(config: Config, mail: Box<dyn MailSink>) -> Result<Self, MazerunnerError> {
        let mazerunner_dir = config.output_dir.join(&config.mazerunner_dir);
        let state =
            MazerunnerState::load_or_new(&mazerunner_dir, config.timeout_secs, config.max_timeout_secs)?;
        let mut model = RLModel::new(config.model_kind, Some(mazerunner_dir.clone()));
        model.load()?;
        Ok(Orchestrator {
            config,
            state,
            model: Rc::new(RefCell::new(model)),
            queue: SeedQueue::default(),
            mail,
            exploit_agent: None,
        })
    }

    fn mazerunner_dir(&self) -> PathBuf {
        self.config.output_dir.join(&self.config.mazerunner_dir)
    }

    /// Staging directory synced-in and solver-generated files land in
    /// before novelty filtering (afl.py `my_generations`,
    /// `generated_inputs` on disk).
    fn my_generations_dir(&self) -> PathBuf {
        self.mazerunner_dir().join("generated_inputs")
    }

    /// This process's own verified-interesting queue: survivors of the
    /// novelty filter, re-offered to the external fuzzer and to later
    /// `sync_from_either` calls of *other* mazerunner processes sharing the
    /// same AFL instance (afl.py `my_queue`).
    fn my_queue_dir(&self) -> PathBuf {
        self.mazerunner_dir().join("queue")
    }

    fn my_hangs_dir(&self) -> PathBuf {
        self.mazerunner_dir().join("hangs")
    }

    fn my_errors_dir(&self) -> PathBuf {
        self.mazerunner_dir().join("crashes")
    }

    fn traces_dir(&self) -> PathBuf {
        self.mazerunner_dir().join("traces")
    }

    /// Copies every file under `src` not already in `state.synced` into the
    /// generations staging dir, recording each name as synced. Returns the
    /// copied names (afl.py `sync_from_afl`/`sync_from_initial_seeds`).
    fn sync_dir_into_generations(&mut self, src: &Path) -> Result<Vec<String>, MazerunnerError> {
        if !src.is_dir() {
            return Ok(Vec::new());
        }
        fs::create_dir_all(self.my_generations_dir())?;
        let mut copied = Vec::new();
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.state.synced.contains(&name) {
                continue;
            }
            self.state.synced.insert(name.clone());
            fs::copy(entry.path(), self.my_generations_dir().join(&name))?;
            copied.push(name);
        }
        Ok(copied)
    }

    /// Syncs from the external AFL queue, ranked best-first by
    /// [`testcase_rank`] (afl.py `sync_from_afl(reversed_order=True)`).
    fn sync_from_afl(&mut self) -> Result<Vec<String>, MazerunnerError> {
        let Some(afl_queue) = self.config.afl_queue_dir() else {
            return Ok(Vec::new());
        };
        let mut names = self.sync_dir_into_generations(&afl_queue)?;
        let gen_dir = self.my_generations_dir();
        names.sort_by_cached_key(|n| {
            let size = fs::metadata(gen_dir.join(n)).map(|m| m.len()).unwrap_or(0);
            testcase_rank(n, size)
        });
        Ok(names)
    }

    fn sync_from_initial_seeds(&mut self) -> Result<Vec<String>, MazerunnerError> {
        self.sync_dir_into_generations(&self.config.initial_seed_dir.clone())
    }

    /// AFL's queue first, falling back to the initial seed corpus if AFL
    /// has nothing new (afl.py `sync_from_either`).
    fn sync_from_either(&mut self) -> Result<Vec<String>, MazerunnerError> {
        let from_afl = self.sync_from_afl()?;
        if !from_afl.is_empty() {
            return Ok(from_afl);
        }
        self.sync_from_initial_seeds()
    }

    /// Called when a sync produced nothing to run: either the external
    /// fuzzer is stuck on a batch of hangs (double the timeout, retry
    /// previously-hung seeds, and give it a minute to catch up) or there's
    /// simply nothing new yet (short retry) — afl.py `handle_empty_files`.
    fn handle_empty_files(&mut self) -> Result<(), MazerunnerError> {
        if self.state.hang.len() > self.config.min_hang_files {
            self.state.increase_timeout();
            self.state.clear_processed_minus_hang();
            std::thread::sleep(HANG_SLEEP);
        } else {
            std::thread::sleep(WAITING_INTERVAL);
        }
        Ok(())
    }

    /// Pops seeds off the priority queue until it finds one not already
    /// processed, matching afl.py's `if next_seed not in state.processed`.
    fn pop_unprocessed(&mut self) -> Option<String> {
        while let Some(name) = self.queue.pop() {
            if !self.state.processed.contains(&name) {
                return Some(name);
            }
        }
        None
    }

    fn record_outcome(
        &mut self,
        name: &str,
        path: &Path,
        result: &ExecutorResult,
    ) -> Result<Outcome, MazerunnerError> {
        let outcome = classify(result);
        match outcome {
            Outcome::Crashed => {
                if self.state.num_crash_reports >= self.config.max_crash_reports {
                    self.state.mark_crash_seen_only(name);
                } else {
                    let count = self.state.record_crash(name);
                    if count <= 1 {
                        self.state.num_crash_reports += 1;
                        fs::create_dir_all(self.my_errors_dir())?;
                        fs::copy(path, self.my_errors_dir().join(name))?;
                        self.mail
                            .send("mazerunner: new crash", &format!("new crashing input recorded: {name}"));
                    }
                }
            }
            Outcome::TimedOut => {
                self.state.hang.insert(name.to_string());
                fs::create_dir_all(self.my_hangs_dir())?;
                fs::copy(path, self.my_hangs_dir().join(name))?;
            }
            Outcome::Completed => {}
        }
        Ok(outcome)
    }

    /// Runs one execution under the given `agent`, returning both the
    /// classified outcome and the agent so the caller can inspect or reuse
    /// its post-execution state (the exploit flip loop needs this). Marks
    /// `name` processed regardless of outcome (afl.py: every `run_file`
    /// call is followed unconditionally by `state.processed.add(fn)`).
    fn run_one(
        &mut self,
        seed_path: &Path,
        agent: Agent,
        session_id: u64,
    ) -> Result<(Outcome, ExecutorResult, Agent), MazerunnerError> {
        fs::create_dir_all(self.mazerunner_dir())?;
        let original_input = fs::read(seed_path)?;
        let solver = PatchSolver::new(original_input, self.my_generations_dir(), session_id);
        let mut executor = ConcolicExecutor::new(
            self.config.cmd.clone(),
            agent,
            Box::new(solver),
            self.my_generations_dir(),
            self.config.gep_solver_enabled,
        )?;
        executor.setup(seed_path, session_id)?;
        executor.run(Some(Duration::from_secs(self.state.timeout_secs)))?;
        executor.process_request()?;
        executor.tear_down();
        let result = executor.get_result();
        let name = seed_path.file_name().unwrap_or_default().to_string_lossy().into_owned();
        let outcome = self.record_outcome(&name, seed_path, &result)?;
        self.state.processed.insert(name);
        Ok((outcome, result, executor.into_agent()))
    }

    fn new_core(&self, learner: Learner, max_distance: u64, seed: u64) -> AgentCore {
        AgentCore::new(Rc::clone(&self.model), learner, self.config.model_kind, max_distance, seed)
    }

    fn default_learner(&self) -> Learner {
        Learner::max_q(self.config.learning_rate, self.config.discount_factor)
    }

    /// Filters one execution's generated testcases by novelty (deleting
    /// stale ones), copies survivors into this process's queue, and — when
    /// `enqueue_priority` is given — pushes them onto the priority queue at
    /// that priority (afl.py `sync_back_if_interesting`'s per-testcase
    /// loop; qsym mode passes `None` since it has no priority queue).
    fn sync_back_generated(
        &mut self,
        res: &ExecutorResult,
        enqueue_priority: Option<u64>,
    ) -> Result<(), MazerunnerError> {
        for testcase in &res.generated_testcases {
            let path = self.my_generations_dir().join(testcase);
            let Ok(contents) = fs::read(&path) else {
                continue;
            };
            if !self.state.is_novel(&contents) {
                let _ = fs::remove_file(&path);
                continue;
            }
            let index = self.state.tick();
            let dst_name = format!("id:{index:06},src:{testcase}");
            fs::create_dir_all(self.my_queue_dir())?;
            fs::copy(&path, self.my_queue_dir().join(&dst_name))?;
            if let Some(priority) = enqueue_priority {
                self.queue.push(priority, dst_name);
            }
        }
        Ok(())
    }

    /// Re-offers the seed that produced `is_closer` or novel coverage back
    /// to the external fuzzer, by copying it into this process's queue
    /// (afl.py: `if afl_queue and (is_closer or has_new_cov(fp))`). A no-op
    /// when no external AFL instance is configured.
    fn resync_seed_if_interesting(
        &mut self,
        seed_name: &str,
        seed_path: &Path,
        is_closer: bool,
    ) -> Result<(), MazerunnerError> {
        if self.config.afl_queue_dir().is_none() {
            return Ok(());
        }
        let contents = fs::read(seed_path)?;
        let is_new = self.state.is_novel(&contents);
        if is_closer || is_new {
            fs::create_dir_all(self.my_queue_dir())?;
            fs::copy(seed_path, self.my_queue_dir().join(seed_name))?;
        }
        Ok(())
    }

    fn qsym_step(&mut self) -> Result<Option<Outcome>, MazerunnerError> {
        let files = self.sync_from_afl()?;
        let Some(name) = files.into_iter().next() else {
            return Ok(None);
        };
        let seed_path = self.my_generations_dir().join(&name);
        let agent = Agent::Record(RecordAgent {
            core: self.new_core(self.default_learner(), self.config.max_distance, 0),
            traces_dir: self.traces_dir(),
        });
        let index = self.state.tick();
        let (outcome, res, _) = self.run_one(&seed_path, agent, index)?;
        self.sync_back_generated(&res, None)?;
        Ok(Some(outcome))
    }

    /// Runs qsym mode to completion against whatever AFL keeps syncing:
    /// a `Record`-like pass-through agent drives the executor with no
    /// bucket filtering or RL steering, purely to exercise the
    /// concolic/solver path (afl.py `QSYMExecutor`). Loops until
    /// `should_stop` returns true.
    pub fn run_qsym(&mut self, mut should_stop: impl FnMut() -> bool) -> Result<Vec<Outcome>, MazerunnerError> {
        let mut outcomes = Vec::new();
        while !should_stop() {
            match self.qsym_step()? {
                Some(outcome) => outcomes.push(outcome),
                None => self.handle_empty_files()?,
            }
        }
        Ok(outcomes)
    }

    fn explore_step(&mut self, seed: u64, step: u64) -> Result<Option<Outcome>, MazerunnerError> {
        if self.queue.is_empty() || self.state.processed_num() as u64 % self.config.sync_frequency == 0 {
            for name in self.sync_from_either()? {
                self.queue.push(0, name);
            }
        }
        let Some(name) = self.pop_unprocessed() else {
            return Ok(None);
        };
        let seed_path = self.my_generations_dir().join(&name);
        let agent = Agent::Explore(ExploreAgent {
            core: self.new_core(self.default_learner(), self.config.max_distance, seed.wrapping_add(step)),
        });
        let index = self.state.tick();
        let started = Instant::now();
        let (outcome, res, agent) = self.run_one(&seed_path, agent, index)?;
        self.state.explore_ce_time += started.elapsed();
        if let Agent::Explore(mut agent) = agent {
            agent.train_on_episode();
        }
        let is_closer = self.state.note_distance(&name, res.distance);
        self.sync_back_generated(&res, Some(res.distance))?;
        self.resync_seed_if_interesting(&name, &seed_path, is_closer)?;
        Ok(Some(outcome))
    }

    /// Runs explore mode to completion: per iteration, resync when the
    /// queue runs dry or every `sync_frequency` processed seeds, pop the
    /// closest-distance unprocessed seed, run it, and sync back any novel
    /// result (afl.py `ExploreExecutor._run`/`sync_back_if_interesting`).
    pub fn run_explore(
        &mut self,
        seed: u64,
        mut should_stop: impl FnMut() -> bool,
    ) -> Result<Vec<Outcome>, MazerunnerError> {
        let mut outcomes = Vec::new();
        let mut step = 0u64;
        while !should_stop() {
            match self.explore_step(seed, step)? {
                Some(outcome) => {
                    outcomes.push(outcome);
                    step += 1;
                }
                None => self.handle_empty_files()?,
            }
        }
        Ok(outcomes)
    }

    fn record_step(&mut self) -> Result<Option<Outcome>, MazerunnerError> {
        let files = self.sync_from_either()?;
        let Some(name) = files.into_iter().next() else {
            return Ok(None);
        };
        let seed_path = self.my_generations_dir().join(&name);
        let agent = Agent::Record(RecordAgent {
            core: self.new_core(self.default_learner(), self.config.max_distance, 0),
            traces_dir: self.traces_dir(),
        });
        let index = self.state.tick();
        let (outcome, _, agent) = self.run_one(&seed_path, agent, index)?;
        if let Agent::Record(agent) = agent {
            agent.save_trace(&name)?;
        }
        Ok(Some(outcome))
    }

    /// Runs record mode to completion: every synced seed is executed once
    /// and its episode saved as a trace named after the seed (afl.py
    /// `RecordExecutor._run`).
    pub fn run_record(&mut self, mut should_stop: impl FnMut() -> bool) -> Result<Vec<Outcome>, MazerunnerError> {
        let mut outcomes = Vec::new();
        while !should_stop() {
            match self.record_step()? {
                Some(outcome) => outcomes.push(outcome),
                None => self.handle_empty_files()?,
            }
        }
        Ok(outcomes)
    }

    pub fn run_replay_once(&mut self, trace_path: &Path) -> Result<(), MazerunnerError> {
        let mut agent = ReplayAgent {
            core: self.new_core(self.default_learner(), self.config.max_distance, 0),
        };
        agent.replay_log(trace_path)
    }

    /// Picks a synced seed as exploit mode's initial working input if none
    /// is set yet (afl.py `_init_best_testcase`, simplified: first synced
    /// file rather than a random pick, since no RNG is threaded through
    /// this layer).
    fn init_best_seed_if_needed(&mut self) -> Result<(), MazerunnerError> {
        if self.state.best_seed.is_some() {
            return Ok(());
        }
        let mut candidates = self.sync_from_either()?;
        if candidates.is_empty() && self.my_generations_dir().is_dir() {
            for entry in fs::read_dir(self.my_generations_dir())? {
                candidates.push(entry?.file_name().to_string_lossy().into_owned());
            }
        }
        self.state.best_seed = candidates.into_iter().next();
        Ok(())
    }

    /// One `run_target`-equivalent exploit iteration: flips up to
    /// `max_flip_num` branches against `seed_path` under the persistent
    /// exploit agent, training once and advancing the stall counter at the
    /// end (afl.py `ExploitExecutor.run_target`). `seed_path` is re-run
    /// unchanged across flips within this step, a simplification noted in
    /// DESIGN.md: the original feeds each flip's generated testcase back in
    /// as the next iteration's input, chaining flips against one another.
    fn run_exploit_step(&mut self, seed_path: &Path, seed: u64) -> Result<Vec<Outcome>, MazerunnerError> {
        let mut agent = self.exploit_agent.take().unwrap_or_else(|| ExploitAgent {
            core: self.new_core(self.default_learner(), self.config.max_distance, seed),
            epsilon: self.config.explore_rate,
            target: None,
            all_targets: Vec::new(),
            last_targets: Vec::new(),
            no_progress_count: 0,
        });
        let name = seed_path.file_name().unwrap_or_default().to_string_lossy().into_owned();
        let mut outcomes = Vec::new();
        let mut hit_max_flip = true;
        for _ in 0..self.config.max_flip_num {
            let index = self.state.tick();
            let started = Instant::now();
            let (outcome, res, returned) = self.run_one(seed_path, Agent::Exploit(agent), index)?;
            self.state.exploit_ce_time += started.elapsed();
            let Agent::Exploit(returned_agent) = returned else {
                unreachable!("run_one returns the same variant it was given");
            };
            agent = returned_agent;
            let is_closer = self.state.note_distance(&name, res.distance);
            self.sync_back_generated(&res, Some(res.distance))?;
            self.resync_seed_if_interesting(&name, seed_path, is_closer)?;
            outcomes.push(outcome);
            if agent.target.is_none() {
                hit_max_flip = false;
                break;
            }
        }
        agent.train_on_episode();
        agent.finish_iteration(hit_max_flip);
        self.exploit_agent = Some(agent);
        Ok(outcomes)
    }

    /// Runs exploit mode to completion against the best seed found so far,
    /// re-running it each iteration and resetting the stall counter
    /// whenever a closer seed turns up (afl.py `ExploitExecutor._run`).
    pub fn run_exploit(
        &mut self,
        seed: u64,
        mut should_stop: impl FnMut() -> bool,
    ) -> Result<Vec<Outcome>, MazerunnerError> {
        self.init_best_seed_if_needed()?;
        let mut outcomes = Vec::new();
        let mut step = 0u64;
        while !should_stop() {
            if std::mem::take(&mut self.state.discovered_closer_seed) {
                if let Some(agent) = self.exploit_agent.as_mut() {
                    agent.no_progress_count = 0;
                }
            }
            let Some(best) = self.state.best_seed.clone() else {
                self.handle_empty_files()?;
                continue;
            };
            let seed_path = self.my_generations_dir().join(&best);
            let step_outcomes = self.run_exploit_step(&seed_path, seed.wrapping_add(step))?;
            outcomes.extend(step_outcomes);
            step += 1;
        }
        Ok(outcomes)
    }

    /// Runs the hybrid driver: an initial dry-run of the full synced seed
    /// set through the explore agent, then a loop that picks one exploit
    /// step whenever the explore side just found a closer seed or the
    /// exploit agent hasn't converged yet, and one explore step otherwise
    /// (spec §4.8; afl.py `HybridExecutor.run`). Both steps share this
    /// orchestrator's `model` and `state`, the in-process equivalent of the
    /// original's two executors sharing one `RLModel`/`MazerunnerState`.
    pub fn run_hybrid(&mut self, seed: u64, mut should_stop: impl FnMut() -> bool) -> Result<(), MazerunnerError> {
        for name in self.sync_from_either()? {
            let seed_path = self.my_generations_dir().join(&name);
            let agent = Agent::Explore(ExploreAgent {
                core: self.new_core(self.default_learner(), self.config.max_distance, seed),
            });
            let index = self.state.tick();
            let (_, res, agent) = self.run_one(&seed_path, agent, index)?;
            if let Agent::Explore(mut agent) = agent {
                agent.train_on_episode();
            }
            let is_closer = self.state.note_distance(&name, res.distance);
            self.sync_back_generated(&res, Some(res.distance))?;
            self.resync_seed_if_interesting(&name, &seed_path, is_closer)?;
        }
        self.init_best_seed_if_needed()?;

        let mut step = 0u64;
        while !should_stop() {
            let exploit_converged = self.exploit_agent.as_ref().is_some_and(|a| a.has_converged());
            if self.state.discovered_closer_seed || !exploit_converged {
                if std::mem::take(&mut self.state.discovered_closer_seed) {
                    if let Some(agent) = self.exploit_agent.as_mut() {
                        agent.no_progress_count = 0;
                    }
                }
                if let Some(best) = self.state.best_seed.clone() {
                    let seed_path = self.my_generations_dir().join(&best);
                    self.run_exploit_step(&seed_path, seed.wrapping_add(step))?;
                }
            } else {
                self.explore_step(seed, step)?;
            }
            step += 1;
            if step % self.config.save_frequency == 0 {
                self.model.borrow().save()?;
                self.state.save(&self.mazerunner_dir())?;
            }
        }
        self.model.borrow().save()?;
        self.state.save(&self.mazerunner_dir())?;
        info!("hybrid run stopped after {step} steps");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_counting_stops_incrementing_after_sentinel() {
        let mut state = MazerunnerState::new(60, 1200);
        assert_eq!(state.record_crash("a"), 1);
        assert_eq!(state.record_crash("a"), 2);
        state.mark_crash_seen_only("a");
        assert_eq!(*state.crashes.get("a").unwrap(), -1);
        assert_eq!(state.record_crash("a"), -1);
    }

    #[test]
    fn increase_timeout_doubles_and_caps() {
        let mut state = MazerunnerState::new(60, 100);
        state.increase_timeout();
        assert_eq!(state.timeout_secs, 100);
        state.increase_timeout();
        assert_eq!(state.timeout_secs, 100);
    }

    #[test]
    fn clear_processed_minus_hang_keeps_only_hung_seeds() {
        let mut state = MazerunnerState::new(60, 1200);
        state.processed.insert("a".to_string());
        state.processed.insert("b".to_string());
        state.hang.insert("b".to_string());
        state.clear_processed_minus_hang();
        assert!(!state.processed.contains("a"));
        assert!(state.processed.contains("b"));
    }

    #[test]
    fn seed_queue_pops_lowest_priority_first() {
        let mut queue = SeedQueue::default();
        queue.push(5, "b".into());
        queue.push(1, "a".into());
        assert_eq!(queue.pop(), Some("a".to_string()));
        assert_eq!(queue.pop(), Some("b".to_string()));
    }

    #[test]
    fn novelty_check_is_md5_based_and_idempotent() {
        let mut state = MazerunnerState::new(60, 1200);
        assert!(state.is_novel(b"hello"));
        assert!(!state.is_novel(b"hello"));
        assert!(state.is_novel(b"world"));
    }

    #[test]
    fn note_distance_tracks_running_minimum_and_flags_discovery() {
        let mut state = MazerunnerState::new(60, 1200);
        assert!(state.note_distance("a", 10));
        assert_eq!(state.best_seed.as_deref(), Some("a"));
        assert!(state.discovered_closer_seed);
        state.discovered_closer_seed = false;
        assert!(state.note_distance("b", 5));
        assert_eq!(state.best_seed.as_deref(), Some("b"));
        assert!(!state.note_distance("c", 7));
        assert_eq!(state.best_seed.as_deref(), Some("b"));
    }

    #[test]
    fn testcase_rank_prefers_cov_then_orig_then_smaller_files() {
        let cov = testcase_rank("id:000001,+cov", 100);
        let plain = testcase_rank("id:000002", 10);
        assert!(cov < plain, "+cov suffix should rank ahead of a smaller plain file");

        let orig_big = testcase_rank("id:000003,orig:seed", 100);
        let derived_small = testcase_rank("id:000004,src:seed", 10);
        assert!(orig_big < derived_small, "orig: tag should rank ahead of a smaller derived file");

        let small = testcase_rank("a", 5);
        let big = testcase_rank("b", 50);
        assert!(small < big);
    }

    #[test]
    fn parse_fuzzer_stats_reads_colon_separated_pairs() {
        let text = "command_line : /bin/target -Q @@\nafl_banner  : test\n";
        let stats = parse_fuzzer_stats(text);
        assert_eq!(stats.get("command_line").unwrap(), "/bin/target -Q @@");
        assert!(stats.get("command_line").unwrap().contains("-Q"));
    }

    #[test]
    fn classify_maps_returncodes_to_outcomes() {
        let base = ExecutorResult {
            total_time: Duration::ZERO,
            solving_time: Duration::ZERO,
            distance: 0,
            returncode: None,
            msg_num: 0,
            generated_testcases: vec![],
        };
        assert_eq!(classify(&base), Outcome::Crashed);
        assert_eq!(
            classify(&ExecutorResult { returncode: Some(124), ..base.clone() }),
            Outcome::TimedOut
        );
        assert_eq!(
            classify(&ExecutorResult { returncode: Some(0), ..base.clone() }),
            Outcome::Completed
        );
    }
}
