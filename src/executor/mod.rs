//! The concolic executor: spawns one instrumented-target run, streams its
//! events, and feeds them to the agent/solver pair (spec §4.1-§4.2).
//!
//! Grounded on `executor/forkserver.rs`'s process-spawn/pipe plumbing
//! (`nix`, `libafl_bolts::shmem`) and on `original_source/mazerunner/executor.py`
//! for the request-dispatch loop this module replaces. The taint-tracking
//! runtime and SMT backend that would normally sit on the other end of the
//! pipe are out of scope (spec §1); [`Solver`] is the seam a real backend
//! plugs into.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use libafl_bolts::shmem::{ShMem, ShMemProvider, UnixShMem, UnixShMemProvider};
use nix::sys::resource::{setrlimit, Resource};

use crate::agent::Agent;
use crate::channel::{raise_pipe_capacity, read_event, Event, EventPipe, READ_READY_TIMEOUT};
use crate::error::MazerunnerError;
use crate::solver::{Solver, SolvingStatus};
use crate::util::fix_at_file;
use crate::wire::{CondTrailer, GepTrailer, Header};

/// Size of the shared union table the target and solver agree on (spec
/// glossary: `UNION_TABLE_SIZE`).
pub const UNION_TABLE_SIZE: usize = 0xc0000000;

#[derive(Debug, Default, Clone, Copy)]
pub struct Timer {
    proc_start: Option<Instant>,
    proc_end: Option<Instant>,
    pub solving_time: Duration,
}

impl Timer {
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.proc_start = Some(now);
        self.proc_end = Some(now);
        self.solving_time = Duration::ZERO;
    }

    pub fn total_time(&self) -> Duration {
        match (self.proc_start, self.proc_end) {
            (Some(s), Some(e)) => e.duration_since(s),
            _ => Duration::ZERO,
        }
    }

    pub fn emulation_time(&self) -> Duration {
        self.total_time().saturating_sub(self.solving_time)
    }

    pub fn mark_end(&mut self) {
        self.proc_end = Some(Instant::now());
    }

    pub fn timed_out(&self, timeout: Duration) -> bool {
        match self.proc_start {
            Some(start) => start.elapsed() >= timeout,
            None => false,
        }
    }
}

/// Everything one `run()`/`process_request()` cycle produced.
#[derive(Debug, Clone)]
pub struct ExecutorResult {
    pub total_time: Duration,
    pub solving_time: Duration,
    pub distance: u64,
    pub returncode: Option<i32>,
    pub msg_num: u32,
    pub generated_testcases: Vec<String>,
}

impl ExecutorResult {
    pub fn emulation_time(&self) -> Duration {
        self.total_time.saturating_sub(self.solving_time)
    }
}

/// Drives one target execution end-to-end: shared memory, pipe, child
/// process, and the event dispatch loop that feeds the agent and solver.
pub struct ConcolicExecutor {
    cmd: Vec<String>,
    agent: Agent,
    solver: Box<dyn Solver>,
    testcase_dir: PathBuf,
    record_mode_enabled: bool,
    onetime_solving_enabled: bool,
    save_seed_info: bool,
    gep_solver_enabled: bool,
    timer: Timer,
    msg_num: u32,

    shm_provider: UnixShMemProvider,
    shm: Option<UnixShMem>,
    event_pipe: Option<EventPipe>,
    write_fd: Option<std::os::fd::OwnedFd>,
    child: Option<Child>,
    input_file: PathBuf,
}

impl ConcolicExecutor {
    pub fn new(
        cmd: Vec<String>,
        agent: Agent,
        solver: Box<dyn Solver>,
        testcase_dir: PathBuf,
        gep_solver_enabled: bool,
    ) -> Result<Self, MazerunnerError> {
        // Inherited by every child this process spawns; best-effort, like
        // the original's `_disable_core_dump`.
        if let Err(e) = setrlimit(Resource::RLIMIT_CORE, 0, 0) {
            log::warn!("failed to disable core dumps: {e}; try 'ulimit -c 0' manually");
        }
        let shm_provider = UnixShMemProvider::new()
            .map_err(|e| MazerunnerError::Configuration(format!("shmem provider: {e}")))?;
        let record_mode_enabled = agent.is_record();
        let onetime_solving_enabled = agent.is_exploit();
        let save_seed_info = agent.save_seed_info_enabled();
        Ok(ConcolicExecutor {
            cmd,
            agent,
            solver,
            testcase_dir,
            record_mode_enabled,
            onetime_solving_enabled,
            save_seed_info,
            gep_solver_enabled,
            timer: Timer::default(),
            msg_num: 0,
            shm_provider,
            shm: None,
            event_pipe: None,
            write_fd: None,
            child: None,
            input_file: PathBuf::new(),
        })
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut Agent {
        &mut self.agent
    }

    /// Reclaims the agent after `tear_down`/`get_result`, so a caller
    /// running several executions against one logical agent (e.g. the
    /// exploit flip loop) can keep it across executors.
    pub fn into_agent(self) -> Agent {
        self.agent
    }

    fn has_terminated(&mut self) -> bool {
        match &mut self.child {
            None => true,
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
        }
    }

    /// Maps fresh shared memory and pipe fds, resets the agent/solver/timer
    /// ahead of running `input_file`.
    pub fn setup(&mut self, input_file: &Path, _session_id: u64) -> Result<(), MazerunnerError> {
        self.input_file = input_file.to_path_buf();
        self.msg_num = 0;
        let shm = self
            .shm_provider
            .new_shmem(UNION_TABLE_SIZE)
            .map_err(|e| MazerunnerError::Configuration(format!("shmem alloc: {e}")))?;
        self.shm = Some(shm);

        let (read_fd, write_fd) =
            nix::unistd::pipe().map_err(|e| MazerunnerError::ChannelBroken(e.to_string()))?;
        raise_pipe_capacity(std::os::fd::AsRawFd::as_raw_fd(&read_fd));
        raise_pipe_capacity(std::os::fd::AsRawFd::as_raw_fd(&write_fd));
        self.event_pipe = Some(EventPipe::from_fd(read_fd));
        self.write_fd = Some(write_fd);

        self.agent.reset();
        self.solver.reset();
        self.timer.reset();
        Ok(())
    }

    /// Spawns the target with the fixed-up command line and `TAINT_OPTIONS`
    /// environment, optionally wrapped in `timeout -k 1 <secs>`.
    pub fn run(&mut self, timeout: Option<Duration>) -> Result<(), MazerunnerError> {
        let (mut argv, stdin_payload) = fix_at_file(&self.cmd, &self.input_file);
        if let Some(t) = timeout {
            let secs = t.as_secs().max(1).to_string();
            let mut wrapped = vec!["timeout".to_string(), "-k".to_string(), "1".to_string(), secs];
            wrapped.append(&mut argv);
            argv = wrapped;
        }
        let Some(shm) = self.shm.as_mut() else {
            return Err(MazerunnerError::Configuration("setup() not called".into()));
        };
        shm.write_to_env("MAZERUNNER_SHM_ID")
            .map_err(|e| MazerunnerError::Configuration(format!("shmem env: {e}")))?;
        let write_fd = self
            .write_fd
            .as_ref()
            .ok_or_else(|| MazerunnerError::Configuration("setup() not called".into()))?;
        let pipe_fd = std::os::fd::AsRawFd::as_raw_fd(write_fd);
        let taint_options = format!(
            "taint_file={}:shm_env=MAZERUNNER_SHM_ID:pipe_fd={pipe_fd}",
            if stdin_payload.is_some() { "stdin".to_string() } else { self.input_file.display().to_string() }
        );

        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]).env("TAINT_OPTIONS", taint_options);
        if stdin_payload.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }
        command.stdout(Stdio::null()).stderr(Stdio::null());

        log::debug!("executing {}", argv.join(" "));
        let mut child = command.spawn().map_err(|e| {
            MazerunnerError::Configuration(format!(
                "failed to spawn {}: {e}",
                self.input_file.display()
            ))
        })?;
        if let Some(bytes) = stdin_payload {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(&bytes)?;
            }
        }
        self.child = Some(child);
        // The parent has no further use for the write end once the child
        // has inherited it across exec.
        self.write_fd = None;
        Ok(())
    }

    /// Reads and dispatches events until the pipe goes quiet or a status
    /// calls for an early stop.
    pub fn process_request(&mut self) -> Result<(), MazerunnerError> {
        self.timer.solving_time = Duration::ZERO;
        self.msg_num = 0;
        loop {
            let Some(pipe) = self.event_pipe.as_mut() else { break };
            if !pipe.wait_readable(READ_READY_TIMEOUT)? {
                log::info!("process_request: pipe is broken, stop processing.");
                break;
            }
            let start = Instant::now();
            let event = {
                let pipe = self.event_pipe.as_mut().unwrap();
                read_event(pipe)?
            };
            let Some(event) = event else { break };
            let mut stop = false;
            match event {
                Event::Cond { header, trailer } => {
                    let status = self.process_cond(header, trailer)?;
                    if status.is_single_shot_stop() && self.onetime_solving_enabled {
                        stop = true;
                    }
                    if status.is_fatal() {
                        log::error!("process_request: solver panic, stop processing. status={status:?}");
                        stop = true;
                    }
                }
                Event::Gep { header, trailer } => {
                    self.process_gep(header, trailer)?;
                }
                Event::Memcmp { header, payload } => {
                    self.solver.handle_memcmp(header.label, &payload)?;
                }
                Event::Fsize { .. } => {}
                Event::Loop { header } => {
                    log::debug!("loop enter: id={}, header={:#x}", header.id, header.addr);
                }
                Event::Fini { header } => {
                    self.agent.set_min_distance(header.result);
                }
                Event::Unknown { msg_type } => {
                    log::error!("process_request: unknown message type: {msg_type}");
                }
            }
            self.timer.solving_time += start.elapsed();
            self.msg_num += 1;
            if stop {
                break;
            }
        }
        Ok(())
    }

    fn process_cond(&mut self, header: Header, trailer: CondTrailer) -> Result<SolvingStatus, MazerunnerError> {
        let action = header.taken();
        let distance = trailer.distance();
        self.agent.handle_new_state(trailer.addr, trailer.context as u64, action, distance);

        if header.label == 0 {
            return Ok(SolvingStatus::UnsolvedInvalidMsg);
        }
        if self.record_mode_enabled {
            return Ok(SolvingStatus::UnsolvedUninterestingCond);
        }
        let is_interesting = self.agent.is_interesting_branch();
        let mut seed_info = String::new();
        if self.save_seed_info && is_interesting {
            let reversed_sa = self.agent.core().curr_state.reversed_sa();
            let score = self.agent.compute_branch_score();
            seed_info = format!("{score}:{reversed_sa:?}");
        }
        let state = self.agent.core().curr_state.clone();
        let status = self
            .solver
            .handle_cond(header.label, action != 0, is_interesting, &state, &seed_info)?;
        if !is_interesting {
            return Ok(SolvingStatus::UnsolvedUninterestingCond);
        }
        match status {
            SolvingStatus::UnsolvedOptUnsat | SolvingStatus::UnsolvedTimeout => {
                self.agent.handle_unsat_condition(status);
            }
            SolvingStatus::SolvedOptNestedUnsat | SolvingStatus::SolvedOptNestedTimeout => {
                if let Some(dep) = self.solver.last_reversed_sa_dependency() {
                    self.agent.handle_nested_unsat_condition(dep);
                }
            }
            _ => {}
        }
        Ok(status)
    }

    fn process_gep(&mut self, header: Header, trailer: GepTrailer) -> Result<(), MazerunnerError> {
        if header.label != trailer.index_label {
            return Err(MazerunnerError::StateCorruption(format!(
                "incorrect gep msg: {} vs {}",
                header.label, trailer.index_label
            )));
        }
        if self.gep_solver_enabled {
            self.solver.handle_gep(trailer, header.addr)?;
        }
        Ok(())
    }

    fn kill_child(&mut self) {
        if self.has_terminated() {
            self.timer.mark_end();
            return;
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.timer.mark_end();
    }

    pub fn tear_down(&mut self) {
        self.event_pipe = None;
        self.write_fd = None;
        self.kill_child();
        self.shm = None; // Drop unmaps/unlinks the segment.
    }

    pub fn get_result(&mut self) -> ExecutorResult {
        let returncode = self.child.as_mut().and_then(|c| c.try_wait().ok().flatten()).map(|s| s.code().unwrap_or(-1));
        ExecutorResult {
            total_time: self.timer.total_time(),
            solving_time: self.timer.solving_time,
            distance: self.agent.min_distance(),
            returncode,
            msg_num: self.msg_num,
            generated_testcases: self.solver.generated_files(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_emulation_time_excludes_solving_time() {
        let mut timer = Timer::default();
        timer.reset();
        timer.solving_time = Duration::from_millis(10);
        timer.mark_end();
        assert!(timer.emulation_time() <= timer.total_time());
    }
}
