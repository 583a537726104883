//! The SMT solver adapter boundary (spec §4.2).
//!
//! The real backend — a taint-tracking runtime talking to an SMT solver —
//! is explicitly out of scope (spec §1); what lives here is the
//! [`Solver`] trait boundary, the closed [`SolvingStatus`] enum that drives
//! executor/agent reactions, and [`PatchSolver`], a reference adapter that
//! implements the byte-patch bookkeeping the spec describes (one write per
//! offset, the generated-file naming scheme) without performing any actual
//! constraint solving. `PatchSolver` is what the test suite and the
//! record/replay tooling drive; a real backend plugs in by implementing
//! [`Solver`] against the taint runtime's FFI.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::agent::ProgramState;
use crate::error::MazerunnerError;
use crate::model::Sa;
use crate::wire::GepTrailer;

/// Closed set of outcomes a solve attempt can produce. See spec §4.2 for
/// the full meaning/agent-action table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolvingStatus {
    SolvedNested,
    SolvedOptNestedUnsat,
    SolvedOptNestedTimeout,
    UnsolvedOptUnsat,
    UnsolvedTimeout,
    UnsolvedPreUnsat,
    UnsolvedUninterestingSat,
    UnsolvedUninterestingCond,
    UnsolvedInvalidMsg,
    UnsolvedInvalidExpr,
    UnsolvedUnknown,
}

impl SolvingStatus {
    /// Statuses that are fatal to the current event stream: the executor
    /// must stop dispatching further events for this execution.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            SolvingStatus::UnsolvedInvalidMsg
                | SolvingStatus::UnsolvedInvalidExpr
                | SolvingStatus::UnsolvedUnknown
        )
    }

    /// Whether a nested solve finished (successfully or not) such that an
    /// exploit-mode, single-shot executor should stop reading further
    /// events for this execution.
    pub fn is_single_shot_stop(self) -> bool {
        matches!(
            self,
            SolvingStatus::SolvedNested | SolvingStatus::SolvedOptNestedTimeout
        )
    }
}

pub trait Solver {
    fn handle_cond(
        &mut self,
        label: u32,
        taken: bool,
        interest_hint: bool,
        state: &ProgramState,
        seed_info: &str,
    ) -> Result<SolvingStatus, MazerunnerError>;

    fn handle_gep(&mut self, gmsg: GepTrailer, addr: u64) -> Result<SolvingStatus, MazerunnerError>;

    /// Consumes the memcmp trailer bytes already read off the channel.
    fn handle_memcmp(&mut self, label: u32, trailer: &[u8]) -> Result<(), MazerunnerError>;

    /// Files written since the last [`Solver::reset`].
    fn generated_files(&self) -> Vec<String>;

    /// Clears `generated_files` and any per-execution bookkeeping ahead of
    /// the next input.
    fn reset(&mut self);

    /// The `reversed_sa` a nested-unsat/timeout applies to, if any, so the
    /// agent can punish the right state (spec §4.6, `handle_nested_unsat_condition`).
    fn last_reversed_sa_dependency(&self) -> Option<Sa> {
        None
    }
}

/// A queued model solution: byte offsets to patch and the replacement
/// value, to be applied over a copy of the original input.
#[derive(Debug, Clone)]
pub struct Patch {
    pub offset: usize,
    pub value: u8,
}

/// Reference [`Solver`] implementation. Test code and tooling feed it a
/// scripted sequence of outcomes/patches (it never actually solves
/// anything); it is responsible only for the bookkeeping the spec assigns
/// to the solver layer: one write per offset, and the generated-file
/// naming convention `id-0-<session>-<n>[,<score>:<reversed_sa>]`.
pub struct PatchSolver {
    original_input: Vec<u8>,
    output_dir: PathBuf,
    session_id: u64,
    next_index: u64,
    generated: Vec<String>,
    scripted: Vec<(SolvingStatus, Vec<Patch>)>,
    last_reversed_sa: Option<Sa>,
}

impl PatchSolver {
    pub fn new(original_input: Vec<u8>, output_dir: impl Into<PathBuf>, session_id: u64) -> Self {
        PatchSolver {
            original_input,
            output_dir: output_dir.into(),
            session_id,
            next_index: 0,
            generated: Vec::new(),
            scripted: Vec::new(),
            last_reversed_sa: None,
        }
    }

    /// Queues the outcome the next `handle_cond` call should return, along
    /// with the patch it should write if the outcome calls for one. Used by
    /// tests to simulate solver behavior deterministically.
    pub fn script(&mut self, status: SolvingStatus, patches: Vec<Patch>) {
        self.scripted.push((status, patches));
    }

    fn write_patched_file(
        &mut self,
        patches: &[Patch],
        seed_info: &str,
    ) -> Result<String, MazerunnerError> {
        let mut seen_offsets = HashSet::new();
        let mut buf = self.original_input.clone();
        for patch in patches {
            if !seen_offsets.insert(patch.offset) {
                return Err(MazerunnerError::StateCorruption(format!(
                    "duplicate patch offset {}",
                    patch.offset
                )));
            }
            if patch.offset >= buf.len() {
                buf.resize(patch.offset + 1, 0);
            }
            buf[patch.offset] = patch.value;
        }
        let n = self.next_index;
        self.next_index += 1;
        let mut name = format!("id-0-{}-{n}", self.session_id);
        if !seed_info.is_empty() {
            name.push(',');
            name.push_str(seed_info);
        }
        fs::create_dir_all(&self.output_dir)?;
        fs::write(self.output_dir.join(&name), &buf)?;
        self.generated.push(name.clone());
        Ok(name)
    }
}

impl Solver for PatchSolver {
    fn handle_cond(
        &mut self,
        _label: u32,
        _taken: bool,
        interest_hint: bool,
        _state: &ProgramState,
        seed_info: &str,
    ) -> Result<SolvingStatus, MazerunnerError> {
        if !interest_hint {
            return Ok(SolvingStatus::UnsolvedUninterestingCond);
        }
        let Some((status, patches)) = self.scripted.pop() else {
            return Ok(SolvingStatus::UnsolvedUninterestingSat);
        };
        if matches!(
            status,
            SolvingStatus::SolvedNested
                | SolvingStatus::SolvedOptNestedUnsat
                | SolvingStatus::SolvedOptNestedTimeout
        ) && !patches.is_empty()
        {
            self.write_patched_file(&patches, seed_info)?;
        }
        Ok(status)
    }

    fn handle_gep(&mut self, _gmsg: GepTrailer, _addr: u64) -> Result<SolvingStatus, MazerunnerError> {
        Ok(SolvingStatus::UnsolvedUninterestingSat)
    }

    fn handle_memcmp(&mut self, _label: u32, _trailer: &[u8]) -> Result<(), MazerunnerError> {
        Ok(())
    }

    fn generated_files(&self) -> Vec<String> {
        self.generated.clone()
    }

    fn reset(&mut self) {
        self.generated.clear();
        self.next_index = 0;
    }

    fn last_reversed_sa_dependency(&self) -> Option<Sa> {
        self.last_reversed_sa
    }
}

/// Reads a previously generated testcase back off disk.
pub fn read_generated(dir: &Path, name: &str) -> Result<Vec<u8>, MazerunnerError> {
    Ok(fs::read(dir.join(name))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ProgramState;

    #[test]
    fn one_write_per_offset_is_enforced() {
        let tmp = tempfile::tempdir().unwrap();
        let mut solver = PatchSolver::new(vec![0, 0], tmp.path(), 0);
        let patches = vec![
            Patch { offset: 0, value: 1 },
            Patch { offset: 0, value: 2 },
        ];
        let err = solver.write_patched_file(&patches, "").unwrap_err();
        assert!(matches!(err, MazerunnerError::StateCorruption(_)));
    }

    #[test]
    fn generated_file_naming_includes_seed_info_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let mut solver = PatchSolver::new(vec![0, 0], tmp.path(), 3);
        solver.script(
            SolvingStatus::SolvedNested,
            vec![Patch { offset: 0, value: 0x61 }],
        );
        let state = ProgramState::new(100);
        let status = solver
            .handle_cond(1, true, true, &state, "7:(1,2,3,1)")
            .unwrap();
        assert_eq!(status, SolvingStatus::SolvedNested);
        let files = solver.generated_files();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("id-0-3-0"));
        assert!(files[0].ends_with("7:(1,2,3,1)"));
    }

    #[test]
    fn uninteresting_cond_short_circuits_without_consulting_script() {
        let tmp = tempfile::tempdir().unwrap();
        let mut solver = PatchSolver::new(vec![0], tmp.path(), 0);
        let state = ProgramState::new(100);
        let status = solver.handle_cond(1, true, false, &state, "").unwrap();
        assert_eq!(status, SolvingStatus::UnsolvedUninterestingCond);
        assert!(solver.generated_files().is_empty());
    }
}
