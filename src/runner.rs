//! Orchestration of one execution
//!
//! A [`Runner`] owns everything that exists only for the duration of one
//! run: the named-target pipes, per-command scratch state, and the I/O
//! multiplexer. It moves through four phases, each entered once:
//!
//! ```text
//! Created --start--> Started --run_io--> IoComplete --wait--> Waited
//! ```
//!
//! # Examples
//!
//! ```ignore
//! use shellplumb::{Arg, Command, Direction, ReadMode, Redirect, Runner};
//!
//! let command = Command::new(vec![
//!     "echo".into(),
//!     "hi".into(),
//!     Redirect::named(1, Direction::Write, "stdout").into(),
//! ])?;
//! let mut runner = Runner::new(command)?;
//! runner.run()?;
//! assert_eq!(runner.read("stdout", ReadMode::Full)?, Some(b"hi\n".to_vec()));
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::os::unix::io::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::command::{Command, CommandId};
use crate::directive::{Directive, Redirect, TargetOptions};
use crate::errors::{PlumbError, Result};
use crate::execution::{ExitStatus, PipeWrapper, PostFork, Subprocess};
use crate::io::{Chunk, IoHandler, PidAwareParallelIo};
use crate::pipeline::Pipeline;

/// How much [`Runner::read`] waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Drive I/O to completion, then return everything not yet read
    Full,
    /// Return as soon as any unread bytes exist; `None` once the target
    /// is exhausted
    Partial,
}

/// Execution phase; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Created,
    Started,
    IoComplete,
    Waited,
}

/// One named target: a runner-owned pipe plus what has flowed through it
struct NamedTarget {
    /// Whether the parent reads (the child writes)
    reading: bool,
    /// Descriptor number the child sees
    child_fd: RawFd,
    local: Option<OwnedFd>,
    counterpart: Option<OwnedFd>,
    buffer: Vec<u8>,
    cursor: usize,
    finished: bool,
    options: TargetOptions,
}

/// Named targets and literal-input stores of one run
#[derive(Default)]
pub struct TargetRegistry {
    targets: BTreeMap<String, NamedTarget>,
    literals: HashMap<u64, Redirect>,
}

impl TargetRegistry {
    pub(crate) fn register_named(
        &mut self,
        name: &str,
        parent_reads: bool,
        child_fd: RawFd,
        options: TargetOptions,
    ) -> Result<()> {
        if self.targets.contains_key(name) {
            return Err(PlumbError::Configuration(format!(
                "Runner already has a named target: {}",
                name
            )));
        }

        let mut pipe = PipeWrapper::new()?;
        let (local, counterpart) = if parent_reads {
            (pipe.take_reader()?, pipe.take_writer()?)
        } else {
            (pipe.take_writer()?, pipe.take_reader()?)
        };

        debug!(
            "Registered named target {:?} on child descriptor {} ({})",
            name,
            child_fd,
            if parent_reads { "reading" } else { "writing" }
        );
        self.targets.insert(
            name.to_string(),
            NamedTarget {
                reading: parent_reads,
                child_fd,
                local: Some(local),
                counterpart: Some(counterpart),
                buffer: Vec::new(),
                cursor: 0,
                finished: false,
                options,
            },
        );
        Ok(())
    }

    /// The child's end of a named target, while the parent still holds it
    pub(crate) fn counterpart_fd(&self, name: &str) -> Option<RawFd> {
        self.targets
            .get(name)
            .and_then(|target| target.counterpart.as_ref())
            .map(AsRawFd::as_raw_fd)
    }

    /// Drop the parent's copy of the child's end
    pub(crate) fn close_counterpart(&mut self, name: &str) -> Result<()> {
        self.target_mut(name)?.counterpart.take();
        Ok(())
    }

    pub(crate) fn insert_literal(&mut self, id: u64, redirect: Redirect) {
        self.literals.insert(id, redirect);
    }

    pub(crate) fn literal(&self, id: u64) -> Option<&Redirect> {
        self.literals.get(&id)
    }

    pub(crate) fn remove_literal(&mut self, id: u64) -> Option<Redirect> {
        self.literals.remove(&id)
    }

    pub fn names(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }

    /// Targets the parent reads from
    pub fn readers(&self) -> Vec<&str> {
        self.targets
            .iter()
            .filter(|(_, target)| target.reading)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Targets the parent writes to
    pub fn writers(&self) -> Vec<&str> {
        self.targets
            .iter()
            .filter(|(_, target)| !target.reading)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    fn target(&self, name: &str) -> Result<&NamedTarget> {
        self.targets.get(name).ok_or_else(|| self.invalid_target(name))
    }

    fn target_mut(&mut self, name: &str) -> Result<&mut NamedTarget> {
        if !self.targets.contains_key(name) {
            return Err(self.invalid_target(name));
        }
        self.targets
            .get_mut(name)
            .ok_or_else(|| PlumbError::State(format!("Target {:?} vanished", name)))
    }

    fn invalid_target(&self, name: &str) -> PlumbError {
        PlumbError::Configuration(format!(
            "Invalid target: {:?} (valid targets are: {:?})",
            name,
            self.names()
        ))
    }

    /// Hand over the parent's ends, for the multiplexer to own
    fn take_local_ends(&mut self) -> Vec<(String, OwnedFd, bool)> {
        self.targets
            .iter_mut()
            .filter_map(|(name, target)| {
                target
                    .local
                    .take()
                    .map(|fd| (name.clone(), fd, target.reading))
            })
            .collect()
    }
}

impl fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetRegistry")
            .field("readers", &self.readers())
            .field("writers", &self.writers())
            .field("literals", &self.literals.len())
            .finish()
    }
}

/// Per-command state that exists only within one run
#[derive(Debug, Default)]
pub(crate) struct CommandState {
    pub(crate) subprocess: Option<Subprocess>,
    pub(crate) extra_directives: Vec<Directive>,
    pub(crate) extra_post_fork: Vec<PostFork>,
}

/// Everything a job touches while it runs
#[derive(Debug, Default)]
pub(crate) struct RunState {
    pub(crate) targets: TargetRegistry,
    pub(crate) commands: HashMap<CommandId, CommandState>,
}

impl RunState {
    pub(crate) fn command_state(&mut self, id: CommandId) -> &mut CommandState {
        self.commands.entry(id).or_default()
    }

    pub(crate) fn subprocess(&self, id: CommandId) -> Option<&Subprocess> {
        self.commands.get(&id).and_then(|state| state.subprocess.as_ref())
    }

    pub(crate) fn subprocess_mut(&mut self, id: CommandId) -> Option<&mut Subprocess> {
        self.commands
            .get_mut(&id)
            .and_then(|state| state.subprocess.as_mut())
    }
}

/// What a runner executes
#[derive(Debug, Clone)]
pub enum Job {
    Command(Command),
    Pipeline(Pipeline),
}

impl Job {
    /// Every stage, in order
    pub fn stages(&self) -> &[Command] {
        match self {
            Job::Command(command) => std::slice::from_ref(command),
            Job::Pipeline(pipeline) => pipeline.commands(),
        }
    }

    pub fn render(&self) -> String {
        match self {
            Job::Command(command) => command.render(),
            Job::Pipeline(pipeline) => pipeline.render(),
        }
    }

    fn prepare(&self, run: &mut RunState) -> Result<()> {
        match self {
            Job::Command(command) => command.prepare(run),
            Job::Pipeline(pipeline) => pipeline.prepare(run),
        }
    }

    fn start(&self, run: &mut RunState) -> Result<()> {
        match self {
            Job::Command(command) => command.start(run),
            Job::Pipeline(pipeline) => pipeline.start(run),
        }
    }

    fn wait(&self, run: &mut RunState) -> Result<Option<ExitStatus>> {
        match self {
            Job::Command(command) => command.wait(run),
            Job::Pipeline(pipeline) => pipeline.wait(run),
        }
    }

    fn status(&self, run: &RunState) -> Option<ExitStatus> {
        match self {
            Job::Command(command) => command.status(run),
            Job::Pipeline(pipeline) => pipeline.status(run),
        }
    }
}

impl From<Command> for Job {
    fn from(command: Command) -> Self {
        Job::Command(command)
    }
}

impl From<Pipeline> for Job {
    fn from(pipeline: Pipeline) -> Self {
        Job::Pipeline(pipeline)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Command(command) => fmt::Display::fmt(command, f),
            Job::Pipeline(pipeline) => fmt::Display::fmt(pipeline, f),
        }
    }
}

/// Routes multiplexer events into the target registry
struct TargetSink<'a> {
    targets: &'a mut TargetRegistry,
}

impl IoHandler for TargetSink<'_> {
    fn on_read(&mut self, name: &str, chunk: Chunk<'_>) {
        let Some(target) = self.targets.targets.get_mut(name) else {
            return;
        };

        match chunk {
            Chunk::Data(bytes) => {
                if target.options.tee {
                    tee(target.child_fd, bytes);
                }
                if target.options.on_read.is_none() {
                    target.buffer.extend_from_slice(bytes);
                }
            }
            Chunk::Eof => {
                debug!("EOF reached on {:?}", name);
                target.finished = true;
            }
        }

        if let Some(callback) = &target.options.on_read {
            callback(name, chunk);
        }
    }

    fn on_write(&mut self, name: &str, chunk: Chunk<'_>, remaining: &[u8]) {
        let Some(target) = self.targets.targets.get_mut(name) else {
            return;
        };

        if chunk.is_eof() {
            debug!("EOF reached on {:?}", name);
            target.finished = true;
        }
        if let Some(callback) = &target.options.on_write {
            callback(name, chunk, remaining);
        }
    }
}

/// Copy bytes to the parent's own descriptor `fd`
fn tee(fd: RawFd, mut bytes: &[u8]) {
    // SAFETY: only borrowed for the duration of the writes below; a closed
    // descriptor just makes them fail.
    let out = unsafe { BorrowedFd::borrow_raw(fd) };
    while !bytes.is_empty() {
        match nix::unistd::write(out, bytes) {
            Ok(0) => break,
            Ok(written) => bytes = &bytes[written..],
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("Failed to tee {} bytes to descriptor {}: {}", bytes.len(), fd, e);
                break;
            }
        }
    }
}

/// Runs one [`Job`] from start to reaped
#[derive(Debug)]
pub struct Runner {
    job: Job,
    run: RunState,
    phase: Phase,
    io: Option<PidAwareParallelIo>,
}

impl Runner {
    /// Prepare `job`: named-target pipes and literal stores are allocated
    /// here, before any process exists.
    pub fn new(job: impl Into<Job>) -> Result<Self> {
        let job = job.into();
        let mut run = RunState::default();
        job.prepare(&mut run)?;
        debug!("Prepared {}", job);

        Ok(Self {
            job,
            run,
            phase: Phase::Created,
            io: None,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn targets(&self) -> &TargetRegistry {
        &self.run.targets
    }

    fn require(&self, expected: Phase, action: &str) -> Result<()> {
        if self.phase != expected {
            return Err(PlumbError::State(format!(
                "Can't {} a runner in phase {:?} (must be {:?})",
                action, self.phase, expected
            )));
        }
        Ok(())
    }

    fn require_started(&self, action: &str) -> Result<()> {
        if self.phase == Phase::Created {
            return Err(PlumbError::State(format!(
                "Can't {} a runner that has not been started",
                action
            )));
        }
        Ok(())
    }

    /// Fork and exec every stage
    pub fn start(&mut self) -> Result<&mut Self> {
        self.require(Phase::Created, "start")?;
        self.phase = Phase::Started;
        self.job.start(&mut self.run)?;
        Ok(self)
    }

    /// Drive named-target I/O until every endpoint finishes or every
    /// stage has exited
    pub fn run_io(&mut self) -> Result<()> {
        self.require(Phase::Started, "run I/O on")?;
        self.pump(true)?;
        self.phase = Phase::IoComplete;
        Ok(())
    }

    /// Reap every stage and return the job's status
    pub fn wait(&mut self) -> Result<Option<ExitStatus>> {
        self.require(Phase::IoComplete, "wait on")?;

        // A writer nobody closed would keep its reader waiting forever.
        if let Some(io) = self.io.as_mut() {
            for name in self.run.targets.writers() {
                if io.is_open(name) {
                    io.close(name)?;
                }
            }
        }

        let status = self.job.wait(&mut self.run)?;
        self.phase = Phase::Waited;
        debug!("{} finished: {:?}", self.job, status);
        Ok(status)
    }

    /// Close every writer, finish I/O, then reap
    pub fn communicate(&mut self) -> Result<Option<ExitStatus>> {
        self.require(Phase::Started, "communicate with")?;
        self.ensure_io()?;

        if let Some(io) = self.io.as_mut() {
            for name in self.run.targets.writers() {
                if !io.is_open(name) {
                    continue;
                }
                match io.write(name, b"", true) {
                    Ok(()) | Err(PlumbError::Closed(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        self.run_io()?;
        self.wait()
    }

    /// Start, then communicate
    pub fn run(&mut self) -> Result<&mut Self> {
        self.start()?;
        self.communicate()?;
        Ok(self)
    }

    /// Run, then fail unless every stage exec'd and the job succeeded
    pub fn run_checked(&mut self) -> Result<&mut Self> {
        self.run()?;

        if let Some(err) = self.exec_error() {
            return Err(err);
        }
        match self.status() {
            Some(status) if status.success() => Ok(self),
            Some(status) => Err(PlumbError::BadExit {
                command: self.job.render(),
                status,
            }),
            None => Err(PlumbError::State(format!("{} has no status", self.job))),
        }
    }

    /// Read from a target the child writes to
    pub fn read(&mut self, name: &str, mode: ReadMode) -> Result<Option<Vec<u8>>> {
        self.check_readable(name)?;
        self.require_started("read from")?;

        match mode {
            ReadMode::Full => {
                if self.phase == Phase::Started {
                    self.run_io()?;
                }
                let target = self.run.targets.target_mut(name)?;
                let rest = target.buffer[target.cursor..].to_vec();
                target.cursor = target.buffer.len();
                Ok(Some(rest))
            }
            ReadMode::Partial => loop {
                {
                    let target = self.run.targets.target_mut(name)?;
                    if target.cursor < target.buffer.len() {
                        let rest = target.buffer[target.cursor..].to_vec();
                        target.cursor = target.buffer.len();
                        return Ok(Some(rest));
                    }
                    if target.finished {
                        self.note_io_drained();
                        return Ok(None);
                    }
                }

                if self.phase != Phase::Started {
                    return Ok(None);
                }
                self.ensure_io()?;
                if self.note_io_drained() {
                    return Ok(None);
                }
                self.pump(false)?;
            },
        }
    }

    /// Everything read from a target so far
    pub fn data(&self, name: &str) -> Result<&[u8]> {
        self.check_readable(name)?;
        Ok(&self.run.targets.target(name)?.buffer)
    }

    /// Queue bytes for a target the child reads from
    pub fn write(&mut self, name: &str, data: impl AsRef<[u8]>) -> Result<()> {
        self.check_writable(name)?;
        self.require(Phase::Started, "write to")?;
        self.ensure_io()?;
        self.io_mut()?.write(name, data.as_ref(), false)
    }

    /// Close a writable target once its queued bytes are sent
    pub fn close(&mut self, name: &str) -> Result<()> {
        self.check_writable(name)?;
        self.require(Phase::Started, "close a target of")?;
        self.ensure_io()?;
        self.io_mut()?.write(name, b"", true)
    }

    /// Signal every stage still running; `SIGTERM` unless told otherwise
    pub fn kill(&mut self, signal: Option<Signal>) -> Result<()> {
        self.require_started("kill")?;
        let signal = signal.unwrap_or(Signal::SIGTERM);

        for command in self.job.stages() {
            if let Some(subprocess) = self.run.subprocess(command.id()) {
                debug!("Sending {} to {}", signal, command);
                subprocess.kill(signal)?;
            }
        }
        Ok(())
    }

    /// The job's status: the last stage's
    pub fn status(&self) -> Option<ExitStatus> {
        self.job.status(&self.run)
    }

    /// Each stage's status, in order
    pub fn stage_statuses(&self) -> Vec<Option<ExitStatus>> {
        self.job
            .stages()
            .iter()
            .map(|command| command.status(&self.run))
            .collect()
    }

    /// Pids of every forked stage, in order
    pub fn pids(&self) -> Vec<Pid> {
        self.job
            .stages()
            .iter()
            .filter_map(|command| self.run.subprocess(command.id()))
            .filter_map(Subprocess::pid)
            .collect()
    }

    /// The first stage that failed to exec, as an error
    pub fn exec_error(&self) -> Option<PlumbError> {
        self.job
            .stages()
            .iter()
            .filter_map(|command| self.run.subprocess(command.id()))
            .find_map(Subprocess::exec_error)
            .map(|failure| failure.clone().into())
    }

    fn check_readable(&self, name: &str) -> Result<()> {
        let target = self.run.targets.target(name)?;
        if !target.reading {
            return Err(PlumbError::Configuration(format!(
                "Can only read from targets the child writes to; {:?} is written by the parent",
                name
            )));
        }
        if target.options.on_read.is_some() {
            return Err(PlumbError::Configuration(format!(
                "Target {:?} delivers output to its on_read callback and keeps no buffer",
                name
            )));
        }
        Ok(())
    }

    fn check_writable(&self, name: &str) -> Result<()> {
        if self.run.targets.target(name)?.reading {
            return Err(PlumbError::Configuration(format!(
                "Can only write to targets the child reads from; {:?} is read by the parent",
                name
            )));
        }
        Ok(())
    }

    fn io_mut(&mut self) -> Result<&mut PidAwareParallelIo> {
        self.io
            .as_mut()
            .ok_or_else(|| PlumbError::State("I/O has not been set up".to_string()))
    }

    /// Build the multiplexer on first use; the parent's pipe ends only
    /// matter once the children exist.
    fn ensure_io(&mut self) -> Result<()> {
        if self.io.is_some() {
            return Ok(());
        }

        let mut io = PidAwareParallelIo::new()?;
        for (name, fd, reading) in self.run.targets.take_local_ends() {
            if reading {
                io.register_reader(name, fd)?;
            } else {
                io.register_writer(name, fd)?;
            }
        }
        self.io = Some(io);
        Ok(())
    }

    /// One multiplexer cycle, or cycles until done
    fn pump(&mut self, to_completion: bool) -> Result<()> {
        self.ensure_io()?;

        let stages: Vec<CommandId> = self.job.stages().iter().map(Command::id).collect();
        let RunState {
            targets, commands, ..
        } = &mut self.run;
        let Some(io) = self.io.as_mut() else {
            return Ok(());
        };

        let mut sink = TargetSink { targets };
        let mut tracker = || -> Result<bool> {
            for id in &stages {
                let subprocess = commands
                    .get_mut(id)
                    .and_then(|state| state.subprocess.as_mut());
                if let Some(subprocess) = subprocess {
                    if subprocess.wait(true)?.is_none() {
                        return Ok(false);
                    }
                }
            }
            Ok(true)
        };

        if to_completion {
            io.run(&mut sink, &mut tracker)
        } else {
            io.run_once(&mut sink, &mut tracker)
        }
    }

    /// Move to `IoComplete` once nothing is left to pump
    fn note_io_drained(&mut self) -> bool {
        let drained = self.io.as_ref().map_or(false, |io| !io.has_work());
        if drained && self.phase == Phase::Started {
            self.phase = Phase::IoComplete;
        }
        drained
    }
}

impl fmt::Display for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Runner: {}", self.job.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Arg;
    use crate::directive::{Direction, LiteralInput};
    use crate::test_support::serial_guard;
    use std::sync::{Arc, Mutex};

    fn command(args: Vec<Arg>) -> Command {
        Command::new(args).unwrap()
    }

    fn stdout_target() -> Arg {
        Redirect::named(1, Direction::Write, "stdout").into()
    }

    #[test]
    fn test_registry_allocates_parent_and_child_ends() {
        let mut targets = TargetRegistry::default();
        targets
            .register_named("out", true, 1, TargetOptions::default())
            .unwrap();
        targets
            .register_named("in", false, 0, TargetOptions::default())
            .unwrap();

        assert_eq!(targets.readers(), vec!["out"]);
        assert_eq!(targets.writers(), vec!["in"]);
        assert!(targets.counterpart_fd("out").is_some());

        targets.close_counterpart("out").unwrap();
        assert!(targets.counterpart_fd("out").is_none());
        assert!(targets.close_counterpart("missing").is_err());

        let ends = targets.take_local_ends();
        assert_eq!(ends.len(), 2);
        assert!(targets.take_local_ends().is_empty());
    }

    #[test]
    fn test_duplicate_named_target_fails_at_prepare() {
        let pipeline = Pipeline::new(vec![
            command(vec!["echo".into(), stdout_target()]),
            command(vec!["cat".into(), stdout_target()]),
        ])
        .unwrap();

        let err = Runner::new(pipeline).unwrap_err();
        assert!(matches!(err, PlumbError::Configuration(_)));
        assert!(err.to_string().contains("already has a named target"));
    }

    #[test]
    fn test_phase_transitions_are_guarded() {
        let _guard = serial_guard();
        let mut runner = Runner::new(command(vec!["true".into()])).unwrap();
        assert_eq!(runner.phase(), Phase::Created);

        assert!(matches!(runner.run_io(), Err(PlumbError::State(_))));
        assert!(matches!(runner.wait(), Err(PlumbError::State(_))));
        assert!(matches!(runner.kill(None), Err(PlumbError::State(_))));

        runner.start().unwrap();
        assert_eq!(runner.phase(), Phase::Started);
        assert!(matches!(runner.start(), Err(PlumbError::State(_))));
        assert!(matches!(runner.wait(), Err(PlumbError::State(_))));

        runner.run_io().unwrap();
        assert_eq!(runner.phase(), Phase::IoComplete);
        assert!(matches!(runner.run_io(), Err(PlumbError::State(_))));

        assert_eq!(runner.wait().unwrap(), Some(ExitStatus::Exited(0)));
        assert_eq!(runner.phase(), Phase::Waited);
        assert!(matches!(runner.wait(), Err(PlumbError::State(_))));
    }

    #[test]
    fn test_runner_is_reusable_per_command() {
        let _guard = serial_guard();
        let echo = command(vec!["echo".into(), "again".into(), stdout_target()]);

        for _ in 0..2 {
            let mut runner = Runner::new(echo.clone()).unwrap();
            runner.run().unwrap();
            assert_eq!(runner.data("stdout").unwrap(), b"again\n");
        }
    }

    #[test]
    fn test_three_stage_pipeline_runs_every_stage() {
        let _guard = serial_guard();
        let pipeline = Pipeline::new(vec![
            command(vec!["printf".into(), "abc".into()]),
            command(vec!["cat".into()]),
            command(vec!["cat".into(), stdout_target()]),
        ])
        .unwrap();

        let mut runner = Runner::new(pipeline).unwrap();
        runner.run().unwrap();

        assert_eq!(runner.data("stdout").unwrap(), b"abc");
        assert_eq!(runner.pids().len(), 3);
        assert_eq!(
            runner.stage_statuses(),
            vec![Some(ExitStatus::Exited(0)); 3]
        );
    }

    #[test]
    fn test_read_validates_target() {
        let _guard = serial_guard();
        let on_read: crate::directive::ReadCallback = Arc::new(|_: &str, _: Chunk<'_>| {});
        let mut runner = Runner::new(command(vec![
            "cat".into(),
            Redirect::named(0, Direction::Read, "stdin").into(),
            Redirect::named(1, Direction::Write, "stdout")
                .with_options(TargetOptions {
                    on_read: Some(on_read),
                    ..Default::default()
                })
                .unwrap()
                .into(),
        ]))
        .unwrap();

        assert!(matches!(
            runner.read("stdout", ReadMode::Full),
            Err(PlumbError::Configuration(_))
        ));
        assert!(matches!(
            runner.read("stdin", ReadMode::Full),
            Err(PlumbError::Configuration(_))
        ));
        assert!(matches!(
            runner.read("nope", ReadMode::Full),
            Err(PlumbError::Configuration(_))
        ));
        assert!(matches!(
            runner.write("stdin", "x"),
            Err(PlumbError::State(_))
        ));

        runner.run().unwrap();
        assert!(matches!(
            runner.write("stdout", "x"),
            Err(PlumbError::Configuration(_))
        ));
    }

    #[test]
    fn test_write_callbacks_observe_progress() {
        let _guard = serial_guard();
        let seen: Arc<Mutex<Vec<(Option<Vec<u8>>, usize)>>> = Arc::default();
        let record = Arc::clone(&seen);
        let on_write: crate::directive::WriteCallback = Arc::new(move |_: &str, chunk: Chunk<'_>, remaining: &[u8]| {
            record
                .lock()
                .unwrap()
                .push((chunk.data().map(<[u8]>::to_vec), remaining.len()));
        });

        let mut runner = Runner::new(command(vec![
            "cat".into(),
            Redirect::named(0, Direction::Read, "stdin")
                .with_options(TargetOptions {
                    on_write: Some(on_write),
                    ..Default::default()
                })
                .unwrap()
                .into(),
            stdout_target(),
        ]))
        .unwrap();

        runner.start().unwrap();
        runner.write("stdin", "fed through").unwrap();
        runner.communicate().unwrap();

        assert_eq!(runner.data("stdout").unwrap(), b"fed through");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.first().unwrap(), &(Some(b"fed through".to_vec()), 0));
        assert_eq!(seen.last().unwrap(), &(None, 0));
    }

    #[test]
    fn test_literal_and_named_targets_together() {
        let _guard = serial_guard();
        let mut runner = Runner::new(command(vec![
            "tr".into(),
            "a-z".into(),
            "A-Z".into(),
            LiteralInput::stdin("shout\n").into(),
            stdout_target(),
        ]))
        .unwrap();

        runner.run_checked().unwrap();
        assert_eq!(
            runner.read("stdout", ReadMode::Full).unwrap(),
            Some(b"SHOUT\n".to_vec())
        );
        // Everything was consumed by the first read.
        assert_eq!(
            runner.read("stdout", ReadMode::Full).unwrap(),
            Some(Vec::new())
        );
    }

    #[test]
    fn test_run_checked_reports_bad_exit() {
        let _guard = serial_guard();
        let mut runner =
            Runner::new(command(vec!["sh".into(), "-c".into(), "exit 4".into()])).unwrap();

        match runner.run_checked() {
            Err(PlumbError::BadExit { command, status }) => {
                assert_eq!(command, "sh -c 'exit 4'");
                assert_eq!(status, ExitStatus::Exited(4));
            }
            other => panic!("expected BadExit, got {:?}", other.map(|r| r.to_string())),
        }
    }

    #[test]
    fn test_display() {
        let runner = Runner::new(command(vec!["ls".into(), "-l".into()])).unwrap();
        assert_eq!(runner.to_string(), "Runner: ls -l");
    }
}
