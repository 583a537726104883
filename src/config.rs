//! Run configuration: defaults mirroring `config.py`'s constants, loaded
//! from an optional JSON file and overridable from CLI flags (spec §6).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::MazerunnerError;
use crate::model::ModelKind;

pub const DEFAULT_MAX_DISTANCE: u64 = i64::MAX as u64;
pub const DEFAULT_DISCOUNT_FACTOR: f64 = 1.0;
pub const DEFAULT_LEARNING_RATE: f64 = 0.5;
pub const DEFAULT_EXPLORE_RATE: f64 = 0.5;
pub const DEFAULT_SYNC_FREQUENCY: u64 = 100;
pub const DEFAULT_SAVE_FREQUENCY: u64 = 200;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_TIMEOUT_SECS: u64 = 20 * 60;
pub const DEFAULT_MAX_ERROR_REPORTS: u32 = 30;
pub const DEFAULT_MAX_CRASH_REPORTS: u32 = 30;
pub const DEFAULT_MAX_FLIP_NUM: usize = 128;
pub const DEFAULT_MIN_HANG_FILES: usize = 30;
/// Free-space floor the resource monitor polls for under `output_dir`
/// (config.py `DISK_LIMIT_SIZE`).
pub const DEFAULT_DISK_LIMIT_BYTES: u64 = 32 * 1024 * 1024 * 1024;

/// Run configuration, deserializable from the JSON config file and
/// overridable from CLI flags (spec §6). Fields without sensible defaults
/// (`cmd`, `output_dir`, ...) are left to the caller to fill in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cmd: Vec<String>,
    pub output_dir: PathBuf,
    pub afl_dir: Option<PathBuf>,
    pub mazerunner_dir: PathBuf,
    pub initial_seed_dir: PathBuf,
    pub mail_command: Option<String>,

    pub nested_branch_enabled: bool,
    pub gep_solver_enabled: bool,
    pub optimistic_solving_enabled: bool,

    pub discount_factor: f64,
    pub learning_rate: f64,
    pub explore_rate: f64,
    pub model_kind: ModelKind,
    pub max_distance: u64,

    pub sync_frequency: u64,
    pub save_frequency: u64,
    pub timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub max_error_reports: u32,
    pub max_crash_reports: u32,
    pub max_flip_num: usize,
    pub min_hang_files: usize,
    pub disk_limit_bytes: u64,

    /// Directory holding a pre-computed `distance.cfg.txt` (and, in the
    /// original, a pickled initial RL policy this port does not attempt to
    /// read back) to seed a run from a prior static-analysis pass
    /// (config.py `static_result_folder`).
    pub static_result_folder: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cmd: Vec::new(),
            output_dir: PathBuf::new(),
            afl_dir: None,
            mazerunner_dir: PathBuf::from("mazerunner"),
            initial_seed_dir: PathBuf::new(),
            mail_command: None,
            nested_branch_enabled: true,
            gep_solver_enabled: false,
            optimistic_solving_enabled: true,
            discount_factor: DEFAULT_DISCOUNT_FACTOR,
            learning_rate: DEFAULT_LEARNING_RATE,
            explore_rate: DEFAULT_EXPLORE_RATE,
            model_kind: ModelKind::Reachability,
            max_distance: DEFAULT_MAX_DISTANCE,
            sync_frequency: DEFAULT_SYNC_FREQUENCY,
            save_frequency: DEFAULT_SAVE_FREQUENCY,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_timeout_secs: DEFAULT_MAX_TIMEOUT_SECS,
            max_error_reports: DEFAULT_MAX_ERROR_REPORTS,
            max_crash_reports: DEFAULT_MAX_CRASH_REPORTS,
            max_flip_num: DEFAULT_MAX_FLIP_NUM,
            min_hang_files: DEFAULT_MIN_HANG_FILES,
            disk_limit_bytes: DEFAULT_DISK_LIMIT_BYTES,
            static_result_folder: None,
        }
    }
}

impl Config {
    /// Loads a JSON config file over the defaults. Missing fields keep
    /// their default value (spec §6: partial overrides are valid).
    pub fn load(path: &Path) -> Result<Config, MazerunnerError> {
        if !path.exists() {
            return Err(MazerunnerError::MissingPath(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MazerunnerError> {
        if self.cmd.is_empty() {
            return Err(MazerunnerError::Configuration("no cmd provided".into()));
        }
        if !self.output_dir.is_dir() {
            return Err(MazerunnerError::MissingPath(self.output_dir.clone()));
        }
        Ok(())
    }

    pub fn afl_queue_dir(&self) -> Option<PathBuf> {
        self.afl_dir.as_ref().map(|d| self.output_dir.join(d).join("queue"))
    }

    pub fn afl_stats_path(&self) -> Option<PathBuf> {
        self.afl_dir
            .as_ref()
            .map(|d| self.output_dir.join(d).join("fuzzer_stats"))
    }

    /// Reads `distance.cfg.txt` out of `static_result_folder`, if set, and
    /// uses it to override `max_distance` (config.py `load_args`'s handling
    /// of `args.static_result_folder`). The original also loads a pickled
    /// `policy.pkl` into the agent's initial Q-table; this port has no
    /// reader for that format and does not attempt it.
    pub fn apply_static_result_folder(&mut self) -> Result<(), MazerunnerError> {
        let Some(dir) = self.static_result_folder.clone() else {
            return Ok(());
        };
        let path = dir.join("distance.cfg.txt");
        if path.is_file() {
            let text = fs::read_to_string(path)?;
            if let Ok(value) = text.trim().parse::<u64>() {
                self.max_distance = value;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_constants() {
        let config = Config::default();
        assert_eq!(config.max_flip_num, 128);
        assert_eq!(config.min_hang_files, 30);
        assert_eq!(config.model_kind, ModelKind::Reachability);
    }

    #[test]
    fn load_rejects_missing_file() {
        let err = Config::load(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(matches!(err, MazerunnerError::MissingPath(_)));
    }

    #[test]
    fn load_applies_partial_overrides_over_defaults() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), r#"{"max_flip_num": 7}"#).unwrap();
        let config = Config::load(tmp.path()).unwrap();
        assert_eq!(config.max_flip_num, 7);
        assert_eq!(config.learning_rate, DEFAULT_LEARNING_RATE);
    }
}
