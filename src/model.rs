//! The persistent reinforcement-learning model (spec §3, §4.3).
//!
//! `RLModel` is the one piece of state every agent and executor shares
//! across an entire run: the learned Q-table, which `sa` keys have been
//! visited, which are proven unreachable, and which are currently being
//! pursued as flip targets. It is serialized to three separate files under
//! `<output>/model/`, mirroring the original's three pickle files but via
//! `ciborium` (spec §9, Persistence).

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::MazerunnerError;

/// `(pc, callstack_hash, bucket, action)`.
pub type Sa = (u64, u64, u32, u8);

/// `(pc, callstack_hash, bucket)`, i.e. an `Sa` without the action bit.
pub type StateKey = (u64, u64, u32);

/// The terminal sentinel state used by the learners (spec §4.5).
pub const TERMINAL_STATE: StateKey = (0, 0, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    /// `Q` holds a distance-like real value directly comparable across
    /// states.
    Distance,
    /// `Q` holds a probability in `[0, 1]`; comparable distances are
    /// derived via `-ln(p)`.
    Reachability,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QTable(HashMap<Sa, f64>);

#[derive(Debug, Default, Serialize, Deserialize)]
struct VisitedTable(HashMap<Sa, u64>);

#[derive(Debug, Default, Serialize, Deserialize)]
struct UnreachableTable(HashSet<Sa>);

pub struct RLModel {
    pub kind: ModelKind,
    q: HashMap<Sa, f64>,
    visited_sa: HashMap<Sa, u64>,
    unreachable_sa: HashSet<Sa>,
    target_sa: HashSet<Sa>,
    output_dir: Option<PathBuf>,
}

impl RLModel {
    pub fn new(kind: ModelKind, output_dir: Option<PathBuf>) -> Self {
        RLModel {
            kind,
            q: HashMap::new(),
            visited_sa: HashMap::new(),
            unreachable_sa: HashSet::new(),
            target_sa: HashSet::new(),
            output_dir,
        }
    }

    pub fn q_lookup(&self, sa: Sa) -> f64 {
        *self.q.get(&sa).unwrap_or(&0.0)
    }

    /// Updates `Q[sa]`, refusing to persist a NaN result: the previous
    /// value is kept instead (spec §3 invariant: "`Q[sa]` is NaN-free after
    /// any successful update").
    pub fn q_update(&mut self, sa: Sa, v: f64) {
        if v.is_nan() {
            return;
        }
        self.q.insert(sa, v);
    }

    /// Maps a raw `Q` value back into a distance-like comparable quantity.
    /// `compare_only` permits a cheaper representative that preserves
    /// ordering without computing the full transform.
    pub fn get_distance(&self, s: StateKey, a: u8, compare_only: bool) -> f64 {
        let sa = (s.0, s.1, s.2, a);
        let v = self.q_lookup(sa);
        match self.kind {
            ModelKind::Distance => v,
            ModelKind::Reachability => {
                let p = v;
                if compare_only {
                    // -p is monotone in the same direction as -ln(p) and
                    // far cheaper; fine when only relative order matters.
                    -p
                } else if p > 0.0 {
                    -p.ln()
                } else {
                    f64::INFINITY
                }
            }
        }
    }

    pub fn add_visited_sa(&mut self, sa: Sa) {
        *self.visited_sa.entry(sa).or_insert(0) += 1;
    }

    pub fn visit_count(&self, sa: Sa) -> u64 {
        *self.visited_sa.get(&sa).unwrap_or(&0)
    }

    pub fn is_visited(&self, sa: Sa) -> bool {
        self.visited_sa.contains_key(&sa)
    }

    pub fn is_unreachable(&self, sa: Sa) -> bool {
        self.unreachable_sa.contains(&sa)
    }

    pub fn add_unreachable_sa(&mut self, sa: Sa) {
        self.target_sa.remove(&sa);
        self.unreachable_sa.insert(sa);
    }

    pub fn is_target(&self, sa: Sa) -> bool {
        self.target_sa.contains(&sa)
    }

    pub fn add_target_sa(&mut self, sa: Sa) {
        if !self.unreachable_sa.contains(&sa) {
            self.target_sa.insert(sa);
        }
    }

    pub fn remove_target_sa(&mut self, sa: Sa) {
        self.target_sa.remove(&sa);
    }

    pub fn target_count(&self) -> usize {
        self.target_sa.len()
    }

    /// Invariant check used by tests (spec §8 property 3): at rest,
    /// `target_sa` and `unreachable_sa` never overlap.
    pub fn targets_and_unreachable_disjoint(&self) -> bool {
        self.target_sa.is_disjoint(&self.unreachable_sa)
    }

    fn model_dir(&self) -> Option<PathBuf> {
        self.output_dir.as_ref().map(|p| p.join("model"))
    }

    pub fn save(&self) -> Result<(), MazerunnerError> {
        let Some(dir) = self.model_dir() else {
            return Ok(());
        };
        fs::create_dir_all(&dir)?;
        write_cbor(&dir.join("Q_table"), &QTable(self.q.clone()))?;
        write_cbor(&dir.join("visited_sa"), &VisitedTable(self.visited_sa.clone()))?;
        write_cbor(
            &dir.join("unreachable_branches"),
            &UnreachableTable(self.unreachable_sa.clone()),
        )?;
        Ok(())
    }

    /// Loads the three tables. A missing file yields an empty structure,
    /// not an error (spec §4.3).
    pub fn load(&mut self) -> Result<(), MazerunnerError> {
        let Some(dir) = self.model_dir() else {
            return Ok(());
        };
        if let Some(t) = read_cbor::<QTable>(&dir.join("Q_table"))? {
            self.q = t.0;
        }
        if let Some(t) = read_cbor::<VisitedTable>(&dir.join("visited_sa"))? {
            self.visited_sa = t.0;
        }
        if let Some(t) = read_cbor::<UnreachableTable>(&dir.join("unreachable_branches"))? {
            self.unreachable_sa = t.0;
        }
        Ok(())
    }
}

fn write_cbor<T: Serialize>(path: &Path, value: &T) -> Result<(), MazerunnerError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    ciborium::into_writer(value, &mut writer)?;
    Ok(())
}

fn read_cbor<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, MazerunnerError> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(Some(ciborium::from_reader(reader)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_yields_empty_model_not_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut model = RLModel::new(ModelKind::Distance, Some(tmp.path().to_path_buf()));
        model.load().unwrap();
        assert_eq!(model.q_lookup((1, 2, 0, 0)), 0.0);
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_path_buf();
        let sa = (1, 2, 0, 1);
        {
            let mut model = RLModel::new(ModelKind::Distance, Some(dir.clone()));
            model.q_update(sa, 42.0);
            model.add_visited_sa(sa);
            model.add_unreachable_sa((9, 9, 0, 0));
            model.save().unwrap();
        }
        let mut reloaded = RLModel::new(ModelKind::Distance, Some(dir));
        reloaded.load().unwrap();
        assert_eq!(reloaded.q_lookup(sa), 42.0);
        assert_eq!(reloaded.visit_count(sa), 1);
        assert!(reloaded.is_unreachable((9, 9, 0, 0)));
    }

    #[test]
    fn q_update_ignores_nan() {
        let mut model = RLModel::new(ModelKind::Distance, None);
        let sa = (1, 1, 0, 0);
        model.q_update(sa, 3.0);
        model.q_update(sa, f64::NAN);
        assert_eq!(model.q_lookup(sa), 3.0);
    }

    #[test]
    fn reachability_distance_uses_negative_log() {
        let mut model = RLModel::new(ModelKind::Reachability, None);
        let sa = (1, 1, 0, 0);
        model.q_update(sa, 0.5);
        let d = model.get_distance((1, 1, 0), 0, false);
        assert!((d - (-0.5f64.ln())).abs() < 1e-9);
        assert_eq!(model.get_distance((1, 1, 0), 1, false), f64::INFINITY);
    }

    #[test]
    fn add_unreachable_evicts_from_targets() {
        let mut model = RLModel::new(ModelKind::Distance, None);
        let sa = (1, 1, 0, 1);
        model.add_target_sa(sa);
        assert!(model.is_target(sa));
        model.add_unreachable_sa(sa);
        assert!(!model.is_target(sa));
        assert!(model.is_unreachable(sa));
        assert!(model.targets_and_unreachable_disjoint());
    }

    #[test]
    fn visited_count_is_monotonic() {
        let mut model = RLModel::new(ModelKind::Distance, None);
        let sa = (1, 1, 0, 0);
        for i in 1..=5 {
            model.add_visited_sa(sa);
            assert_eq!(model.visit_count(sa), i);
        }
    }
}
