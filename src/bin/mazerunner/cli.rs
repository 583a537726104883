//! The command line interface of the fuzzer. Flags mirror `config.py`'s
//! `load_args` overrides (spec §6): each is optional and, when present,
//! overrides whatever the JSON config file (or its defaults) set.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(about = "Directed greybox fuzzer: coverage-guided mutation plus RL-steered concolic execution")]
pub struct Cli {
    #[arg(help = "Path to the JSON config file.", short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    #[arg(help = "Output directory (overrides the config file).", short = 'o', long = "output")]
    pub output_dir: Option<PathBuf>,

    #[arg(help = "Directory of the paired AFL instance's output, relative to --output.", long = "afl-dir")]
    pub afl_dir: Option<PathBuf>,

    #[arg(
        help = "This process's own state directory, relative to --output (default: mazerunner).",
        long = "mazerunner-dir"
    )]
    pub mazerunner_dir: Option<PathBuf>,

    #[arg(help = "Initial seed corpus directory.", short = 'i', long = "input")]
    pub input: Option<PathBuf>,

    #[arg(help = "Shell command to run on a new crash/error report.", long = "mail")]
    pub mail: Option<String>,

    #[arg(
        help = "Directory with a pre-computed distance.cfg.txt to seed max_distance from.",
        long = "static-result-folder"
    )]
    pub static_result_folder: Option<PathBuf>,

    #[arg(help = "Enable debug-level logging.", long = "debug")]
    pub debug: bool,

    #[arg(help = "Target command line, e.g. -- /bin/target @@.", last = true)]
    pub cmd: Vec<String>,

    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Debug, Subcommand)]
pub enum Mode {
    /// Run the target once per synced seed with no RL steering, purely to
    /// exercise the concolic/solver path.
    Qsym,
    /// Explore mode: widen coverage by flagging never-visited branches as
    /// interesting, pulling seeds off the priority queue as AFL feeds them.
    Explore {
        #[arg(long, default_value_t = 0)]
        seed_rng: u64,
    },
    /// Exploit mode: repeatedly flip branches against the best seed found
    /// so far until the agent converges or the flip budget runs out.
    Exploit {
        #[arg(long, default_value_t = 0)]
        seed_rng: u64,
    },
    /// Hybrid mode: the driver itself alternates explore/exploit steps
    /// based on whether exploit has converged and whether explore just
    /// found a closer seed.
    Hybrid {
        #[arg(long, default_value_t = 0)]
        seed_rng: u64,
    },
    /// Record mode: run every synced seed once and persist its episode
    /// trace to disk, named after the seed.
    Record,
    /// Replay mode: train the model from a previously recorded trace.
    Replay {
        #[arg(help = "Trace file to replay.")]
        trace: PathBuf,
    },
}
