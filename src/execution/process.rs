//! Forking, exec-error reporting and reaping of a single child

use std::ffi::CString;
use std::fmt;
use std::io::{self, Write};
use std::os::unix::io::{BorrowedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{kill, signal, sigprocmask, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, execve, fork, ForkResult, Pid};
use serde::{Deserialize, Serialize};

use super::pipe::PipeWrapper;
use crate::directive::{Directive, DirectiveOps};
use crate::errors::{PlumbError, Result};
use crate::runner::TargetRegistry;
use crate::utils;

/// Exit status of a child whose exec failed
pub const EXEC_FAILURE_STATUS: i32 = 127;

/// Exit status of a callback child that returned an error or panicked
pub const CALLBACK_FAILURE_STATUS: i32 = 1;

/// Error type a callback may return
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// In-process body run by the child instead of exec
pub type Callback = Arc<dyn Fn() -> std::result::Result<(), CallbackError> + Send + Sync>;

/// Why the child could not reach the target program, as sent over the
/// control pipe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecFailure {
    pub message: String,
    pub error_kind: String,
    pub origin: Vec<String>,
}

impl ExecFailure {
    pub fn new(message: impl Into<String>, error_kind: impl Into<String>, origin: Vec<String>) -> Self {
        Self {
            message: message.into(),
            error_kind: error_kind.into(),
            origin,
        }
    }

    pub fn from_errno(errno: Errno, origin: Vec<String>) -> Self {
        Self::new(errno.desc(), format!("{:?}", errno), origin)
    }

    pub fn from_io(err: &io::Error, origin: Vec<String>) -> Self {
        match err.raw_os_error() {
            Some(code) => Self::new(err.to_string(), format!("{:?}", Errno::from_raw(code)), origin),
            None => Self::new(err.to_string(), format!("{:?}", err.kind()), origin),
        }
    }
}

impl From<ExecFailure> for PlumbError {
    fn from(failure: ExecFailure) -> Self {
        PlumbError::Exec {
            message: failure.message,
            kind: failure.error_kind,
            origin: failure.origin,
        }
    }
}

/// How a reaped child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with a status code
    Exited(i32),
    /// Terminated by a signal
    Signaled(Signal),
}

impl ExitStatus {
    /// Exit code, if the child exited normally
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            ExitStatus::Signaled(_) => None,
        }
    }

    /// Terminating signal, if any
    pub fn signal(&self) -> Option<Signal> {
        match self {
            ExitStatus::Exited(_) => None,
            ExitStatus::Signaled(sig) => Some(*sig),
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {}", code),
            ExitStatus::Signaled(sig) => write!(f, "signal {}", sig),
        }
    }
}

/// Action run in the child right after the fork, before any directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostFork {
    /// Change working directory
    Chdir(PathBuf),
    /// Close a descriptor the child must not keep
    Close(RawFd),
}

/// Everything exec needs, built before the fork so the child does as
/// little as possible.
struct ExecPlan {
    path: std::result::Result<CString, ExecFailure>,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

/// One child process: forked once, reaped once
pub struct Subprocess {
    program: Option<String>,
    args: Vec<String>,
    directives: Vec<Directive>,
    post_fork: Vec<PostFork>,
    env: Option<Vec<(String, String)>>,
    callback: Option<Callback>,
    pid: Option<Pid>,
    status: Option<ExitStatus>,
    exec_error: Option<ExecFailure>,
}

impl Subprocess {
    /// Subprocess that execs `args[0]` with the remaining arguments
    pub fn new(
        args: Vec<String>,
        directives: Vec<Directive>,
        post_fork: Vec<PostFork>,
    ) -> Result<Self> {
        let mut args = args.into_iter();
        let program = args.next().ok_or_else(|| {
            PlumbError::Configuration("No command specified (empty argument list)".to_string())
        })?;

        Ok(Self {
            program: Some(program),
            args: args.collect(),
            directives,
            post_fork,
            env: None,
            callback: None,
            pid: None,
            status: None,
            exec_error: None,
        })
    }

    /// Subprocess that runs `callback` in the child instead of exec
    pub fn with_callback(
        callback: Callback,
        directives: Vec<Directive>,
        post_fork: Vec<PostFork>,
    ) -> Self {
        Self {
            program: None,
            args: Vec::new(),
            directives,
            post_fork,
            env: None,
            callback: Some(callback),
            pid: None,
            status: None,
            exec_error: None,
        }
    }

    /// Replace the child's environment entirely
    pub fn env(mut self, env: Option<Vec<(String, String)>>) -> Self {
        self.env = env;
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.program.as_deref()
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    pub fn post_fork(&self) -> &[PostFork] {
        &self.post_fork
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Failure reported by the child before it could exec, if any
    pub fn exec_error(&self) -> Option<&ExecFailure> {
        self.exec_error.as_ref()
    }

    /// Fork and start the child; a no-op once started.
    ///
    /// Returns once the child has either exec'd successfully or reported
    /// why it could not. An exec failure is recorded, not returned.
    pub fn run(&mut self, targets: &mut TargetRegistry) -> Result<Pid> {
        if let Some(pid) = self.pid {
            return Ok(pid);
        }

        let plan = match self.program {
            Some(_) => Some(self.exec_plan()?),
            None => None,
        };

        // Created as late as possible so no other child inherits it.
        let mut control = PipeWrapper::new()?;

        match unsafe { fork() } {
            Ok(ForkResult::Child) => self.run_child(&mut control, targets, plan),
            Ok(ForkResult::Parent { child }) => {
                self.pid = Some(child);
                debug!("Forked {} as pid {}", self, child);
                self.run_parent(&mut control, targets)?;
                Ok(child)
            }
            Err(e) => Err(PlumbError::Syscall(format!("fork failed: {}", e))),
        }
    }

    fn run_parent(&mut self, control: &mut PipeWrapper, targets: &mut TargetRegistry) -> Result<()> {
        control.read_only();

        for directive in &self.directives {
            directive.apply_parent(targets)?;
        }

        self.exec_error = match control.receive_message::<ExecFailure>() {
            Ok(None) => None,
            Ok(Some(failure)) => {
                debug!(
                    "Child {:?} failed to exec: {} ({})",
                    self.pid, failure.message, failure.error_kind
                );
                Some(failure)
            }
            Err(PlumbError::InvalidMessage(detail)) => Some(ExecFailure::new(
                format!("Invalid message received over the control pipe: {}", detail),
                "InvalidMessage",
                Vec::new(),
            )),
            Err(e) => return Err(e),
        };
        Ok(())
    }

    fn exec_plan(&self) -> Result<ExecPlan> {
        let program = self.program.as_deref().unwrap_or_default();
        let env: Vec<(String, String)> = match &self.env {
            Some(env) => env.clone(),
            None => std::env::vars_os()
                .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
                .collect(),
        };

        let path = match utils::resolve_program_path(program, &env) {
            Ok(path) => Ok(to_cstring(&path)?),
            Err(message) => Err(ExecFailure::new(
                message,
                "ENOENT",
                vec!["resolve_program".to_string(), program.to_string()],
            )),
        };

        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(to_cstring(program)?);
        for arg in &self.args {
            argv.push(to_cstring(arg)?);
        }

        let envp = env
            .iter()
            .map(|(k, v)| to_cstring(&format!("{}={}", k, v)))
            .collect::<Result<Vec<_>>>()?;

        Ok(ExecPlan { path, argv, envp })
    }

    /// Child side of the fork. Never returns.
    ///
    /// Failures are reported over the control pipe and end in `_exit`, so
    /// no destructor, atexit hook or unwinding runs in the half-built child.
    fn run_child(
        &self,
        control: &mut PipeWrapper,
        targets: &TargetRegistry,
        plan: Option<ExecPlan>,
    ) -> ! {
        control.write_only();

        if let Err(failure) = self.prepare_child(targets) {
            report_and_exit(control, &failure);
        }

        if let Some(callback) = &self.callback {
            // Nothing left to report; let the parent move on.
            control.close();
            run_callback(callback);
        }

        let Some(plan) = plan else {
            report_and_exit(
                control,
                &ExecFailure::new("nothing to exec", "EINVAL", vec!["exec".to_string()]),
            );
        };

        let path = match plan.path {
            Ok(path) => path,
            Err(failure) => report_and_exit(control, &failure),
        };

        match execve(&path, &plan.argv, &plan.envp) {
            Ok(never) => match never {},
            Err(errno) => {
                let origin = vec!["execve".to_string(), path.to_string_lossy().into_owned()];
                report_and_exit(control, &ExecFailure::from_errno(errno, origin))
            }
        }
    }

    fn prepare_child(&self, targets: &TargetRegistry) -> std::result::Result<(), ExecFailure> {
        reset_signal_state();

        for action in &self.post_fork {
            match action {
                PostFork::Chdir(dir) => chdir(dir.as_path()).map_err(|errno| {
                    ExecFailure::from_errno(
                        errno,
                        vec!["chdir".to_string(), dir.display().to_string()],
                    )
                })?,
                PostFork::Close(fd) => {
                    // SAFETY: the descriptor is a pipe end the child inherited
                    // and never uses; closing the child's copy is harmless.
                    unsafe { libc::close(*fd) };
                }
            }
        }

        for directive in &self.directives {
            directive.apply_child(targets)?;
        }
        Ok(())
    }

    /// Reap the child; a no-op once a status is cached.
    ///
    /// With `nonblock`, returns `Ok(None)` while the child is still running.
    pub fn wait(&mut self, nonblock: bool) -> Result<Option<ExitStatus>> {
        if self.status.is_some() {
            return Ok(self.status);
        }

        let pid = self
            .pid
            .ok_or_else(|| PlumbError::State(format!("{} has not been started", self)))?;
        let flags = if nonblock {
            Some(WaitPidFlag::WNOHANG)
        } else {
            None
        };

        loop {
            match waitpid(pid, flags) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.status = Some(ExitStatus::Exited(code));
                    break;
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    self.status = Some(ExitStatus::Signaled(sig));
                    break;
                }
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    return Err(PlumbError::ReapRace { pid: pid.as_raw() });
                }
                Err(e) => return Err(PlumbError::Syscall(format!("waitpid failed: {}", e))),
            }
        }

        debug!("Reaped pid {}: {:?}", pid, self.status);
        Ok(self.status)
    }

    /// Send `sig` to the child. Does nothing once the child is reaped.
    pub fn kill(&self, sig: Signal) -> Result<()> {
        let pid = self
            .pid
            .ok_or_else(|| PlumbError::State(format!("{} has not been started", self)))?;
        if self.status.is_some() {
            return Ok(());
        }

        match kill(pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(PlumbError::Syscall(format!("kill({}, {}) failed: {}", pid, sig, e))),
        }
    }
}

impl fmt::Display for Subprocess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let directives: Vec<String> = self.directives.iter().map(DirectiveOps::render).collect();
        write!(
            f,
            "Subprocess: command={:?} args={:?} directives={:?}",
            self.program.as_deref().unwrap_or("<callback>"),
            self.args,
            directives
        )
    }
}

impl fmt::Debug for Subprocess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subprocess")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("directives", &self.directives)
            .field("post_fork", &self.post_fork)
            .field("callback", &self.callback.is_some())
            .field("pid", &self.pid)
            .field("status", &self.status)
            .field("exec_error", &self.exec_error)
            .finish()
    }
}

fn to_cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| {
        PlumbError::Configuration(format!("Argument contains a nul byte: {:?}", s))
    })
}

/// Undo parent-only signal state: our SIGCHLD wakeup handler, Rust's
/// ignored SIGPIPE, and any blocked signals.
fn reset_signal_state() {
    unsafe {
        let _ = signal(Signal::SIGCHLD, SigHandler::SigDfl);
        let _ = signal(Signal::SIGPIPE, SigHandler::SigDfl);
    }
    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
}

fn report_and_exit(control: &mut PipeWrapper, failure: &ExecFailure) -> ! {
    if control.send_message(failure).is_err() {
        write_stderr(&format!("exec failed: {}\n", failure.message));
    }
    exit_now(EXEC_FAILURE_STATUS)
}

fn run_callback(callback: &Callback) -> ! {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback()));
    let _ = io::stdout().flush();

    let status = match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            write_stderr(&format!("subprocess callback failed: {}\n", e));
            CALLBACK_FAILURE_STATUS
        }
        Err(_) => {
            write_stderr("subprocess callback panicked\n");
            CALLBACK_FAILURE_STATUS
        }
    };

    exit_now(status)
}

/// Write straight to descriptor 2. The child must not take the logger's or
/// `Stderr`'s lock: another parent thread may have held it at fork time.
fn write_stderr(message: &str) {
    // SAFETY: descriptor 2 is only borrowed for these writes; if it is
    // closed they fail and the message is dropped.
    let fd = unsafe { BorrowedFd::borrow_raw(2) };
    let mut bytes = message.as_bytes();
    while !bytes.is_empty() {
        match nix::unistd::write(fd, bytes) {
            Ok(0) => break,
            Ok(written) => bytes = &bytes[written..],
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
}

/// Leave the child without running destructors or atexit hooks
fn exit_now(status: i32) -> ! {
    // SAFETY: `_exit` never returns and touches no Rust state.
    unsafe { libc::_exit(status) }
}
