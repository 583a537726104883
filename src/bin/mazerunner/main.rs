mod cli;

use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use mazerunner_rs::config::Config;
use mazerunner_rs::mail::{MailSink, NoopMailSink, ProcessMailSink};
use mazerunner_rs::resource_monitor::ResourceMonitor;
use mazerunner_rs::scheduler::Orchestrator;

fn main() {
    let cli = cli::Cli::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if cli.debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    let mut config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load config {}: {e}", path.display());
                exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(output_dir) = cli.output_dir {
        config.output_dir = output_dir;
    }
    if let Some(afl_dir) = cli.afl_dir {
        config.afl_dir = Some(afl_dir);
    }
    if let Some(mazerunner_dir) = cli.mazerunner_dir {
        config.mazerunner_dir = mazerunner_dir;
    }
    if let Some(input) = cli.input {
        config.initial_seed_dir = input;
    }
    if let Some(mail) = cli.mail {
        config.mail_command = Some(mail);
    }
    if let Some(static_result_folder) = cli.static_result_folder {
        config.static_result_folder = Some(static_result_folder);
    }
    if !cli.cmd.is_empty() {
        config.cmd = cli.cmd;
    }
    if let Err(e) = config.apply_static_result_folder() {
        eprintln!("failed to read static result folder: {e}");
        exit(1);
    }
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e}");
        exit(1);
    }

    let mail: Box<dyn MailSink> = match &config.mail_command {
        Some(cmd) => Box::new(ProcessMailSink::new(cmd.clone())),
        None => Box::new(NoopMailSink),
    };

    let output_dir = config.output_dir.clone();
    let disk_limit_bytes = config.disk_limit_bytes;

    let mut orchestrator = match Orchestrator::new(config, mail) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("failed to initialize: {e}");
            exit(1);
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            log::warn!("failed to register handler for signal {signal}: {e}");
        }
    }
    let monitor = ResourceMonitor::start(output_dir, disk_limit_bytes, Duration::from_secs(5));
    let should_stop = || shutdown.load(Ordering::Relaxed) || monitor.is_low_on_space();

    let result = match cli.mode {
        cli::Mode::Qsym => orchestrator
            .run_qsym(should_stop)
            .map(|outcomes| log::info!("qsym finished after {} runs: {outcomes:?}", outcomes.len())),
        cli::Mode::Explore { seed_rng } => orchestrator
            .run_explore(seed_rng, should_stop)
            .map(|outcomes| log::info!("explore finished after {} runs: {outcomes:?}", outcomes.len())),
        cli::Mode::Exploit { seed_rng } => orchestrator
            .run_exploit(seed_rng, should_stop)
            .map(|outcomes| log::info!("exploit finished after {} flips: {outcomes:?}", outcomes.len())),
        cli::Mode::Hybrid { seed_rng } => orchestrator.run_hybrid(seed_rng, should_stop),
        cli::Mode::Record => orchestrator
            .run_record(should_stop)
            .map(|outcomes| log::info!("record finished after {} runs: {outcomes:?}", outcomes.len())),
        cli::Mode::Replay { trace } => orchestrator.run_replay_once(&trace),
    };

    if let Err(e) = result {
        eprintln!("run failed: {e}");
        exit(1);
    }
}
