//! A single command: argument vector, directives and options
//!
//! A [`Command`] is a plain value. It touches no OS resource until a
//! [`Runner`](crate::Runner) starts it, and can be started by any number of
//! independent runners.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;

use crate::directive::{Directive, DirectiveOps, LiteralInput, Redirect};
use crate::errors::{PlumbError, Result};
use crate::execution::{Callback, CallbackError, ExitStatus, PostFork, Subprocess};
use crate::pipeline::Pipeline;
use crate::runner::RunState;
use crate::utils::shell_escape;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Stable handle used to key a runner's per-command scratch state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u64);

impl CommandId {
    fn next() -> Self {
        CommandId(NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Option bag for a command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// Working directory for the child
    pub cwd: Option<PathBuf>,
    /// Replaces the child's environment entirely when set
    pub env: Option<Vec<(String, String)>>,
}

impl Options {
    pub fn cwd(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Default::default()
        }
    }

    pub fn env<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            env: Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
            ..Default::default()
        }
    }

    /// Fields set in `other` override ours
    fn merge(&mut self, other: &Options) {
        if other.cwd.is_some() {
            self.cwd = other.cwd.clone();
        }
        if other.env.is_some() {
            self.env = other.env.clone();
        }
    }
}

/// One positional argument as given by the caller
#[derive(Debug, Clone)]
pub enum Arg {
    Str(String),
    Directive(Directive),
    Options(Options),
    /// Flattened in place; rejected when it is the only argument
    List(Vec<String>),
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(s)
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Arg::Str(s.clone())
    }
}

impl From<Directive> for Arg {
    fn from(directive: Directive) -> Self {
        Arg::Directive(directive)
    }
}

impl From<Redirect> for Arg {
    fn from(redirect: Redirect) -> Self {
        Arg::Directive(redirect.into())
    }
}

impl From<LiteralInput> for Arg {
    fn from(literal: LiteralInput) -> Self {
        Arg::Directive(literal.into())
    }
}

impl From<Options> for Arg {
    fn from(options: Options) -> Self {
        Arg::Options(options)
    }
}

impl From<Vec<String>> for Arg {
    fn from(list: Vec<String>) -> Self {
        Arg::List(list)
    }
}

impl From<Vec<&str>> for Arg {
    fn from(list: Vec<&str>) -> Self {
        Arg::List(list.into_iter().map(str::to_string).collect())
    }
}

#[derive(Clone)]
enum Program {
    Args(Vec<String>),
    Callback(Callback),
}

/// Program (or callback) plus its directives and options
pub struct Command {
    id: CommandId,
    raw_args: Vec<Arg>,
    program: Program,
    directives: Vec<Directive>,
    options: Options,
}

impl Command {
    /// Parse `args` into strings, directives and options.
    ///
    /// Directives keep their positional order. A lone list argument is
    /// rejected: it almost always means the caller forgot to expand it.
    /// Strings that cannot reach `execve` (a nul byte anywhere, or `=` in an
    /// environment name) are rejected here, before anything is forked.
    pub fn new(args: Vec<Arg>) -> Result<Self> {
        if let [Arg::List(list)] = args.as_slice() {
            return Err(PlumbError::Configuration(format!(
                "The only argument given was a list ({:?}); pass its elements as separate arguments instead",
                list
            )));
        }

        let (strings, directives, options) = parse_args(&args)?;
        if strings.is_empty() {
            return Err(PlumbError::Configuration(
                "No command specified (no string arguments given)".to_string(),
            ));
        }

        Ok(Self {
            id: CommandId::next(),
            raw_args: args,
            program: Program::Args(strings),
            directives,
            options,
        })
    }

    /// Command whose child runs `callback` instead of exec.
    ///
    /// `args` may carry directives and options only.
    pub fn with_callback<F>(callback: F, args: Vec<Arg>) -> Result<Self>
    where
        F: Fn() -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
    {
        let (strings, directives, options) = parse_args(&args)?;
        if !strings.is_empty() {
            return Err(PlumbError::Configuration(format!(
                "Callback commands take no program arguments, got {:?}",
                strings
            )));
        }

        Ok(Self {
            id: CommandId::next(),
            raw_args: args,
            program: Program::Callback(Arc::new(callback)),
            directives,
            options,
        })
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Program name followed by its arguments; empty for callbacks
    pub fn args(&self) -> &[String] {
        match &self.program {
            Program::Args(args) => args,
            Program::Callback(_) => &[],
        }
    }

    pub fn raw_args(&self) -> &[Arg] {
        &self.raw_args
    }

    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn is_callback(&self) -> bool {
        matches!(self.program, Program::Callback(_))
    }

    /// Two-stage pipeline: `self | other`
    pub fn pipe(self, other: Command) -> Pipeline {
        Pipeline::from_stages(vec![self, other])
    }

    /// Shell-like form, for diagnostics only
    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if self.is_callback() {
            parts.push("<callback>".to_string());
        }
        for arg in &self.raw_args {
            match arg {
                Arg::Str(s) => parts.push(shell_escape(s)),
                Arg::List(list) => parts.extend(list.iter().map(|s| shell_escape(s))),
                Arg::Directive(directive) => parts.push(directive.render()),
                Arg::Options(_) => {}
            }
        }
        parts.join(" ")
    }

    pub(crate) fn prepare(&self, run: &mut RunState) -> Result<()> {
        for directive in &self.directives {
            directive.register(&mut run.targets)?;
        }
        run.command_state(self.id);
        Ok(())
    }

    /// Record a directive this command gets only within one run
    pub(crate) fn add_directive(&self, run: &mut RunState, directive: Directive) {
        run.command_state(self.id).extra_directives.push(directive);
    }

    /// Record a post-fork action this command gets only within one run
    pub(crate) fn add_post_fork(&self, run: &mut RunState, action: PostFork) {
        run.command_state(self.id).extra_post_fork.push(action);
    }

    pub(crate) fn start(&self, run: &mut RunState) -> Result<()> {
        let state = run.commands.entry(self.id).or_default();
        if state.subprocess.is_some() {
            return Err(PlumbError::State(format!("{} was already started", self)));
        }

        // Run-scoped extras go first so the command's own directives win
        // on the same descriptor.
        let mut directives = std::mem::take(&mut state.extra_directives);
        directives.extend(self.directives.iter().map(Directive::shared));

        let mut post_fork = Vec::new();
        if let Some(cwd) = &self.options.cwd {
            post_fork.push(PostFork::Chdir(cwd.clone()));
        }
        post_fork.append(&mut state.extra_post_fork);

        let subprocess = match &self.program {
            Program::Args(args) => Subprocess::new(args.clone(), directives, post_fork)?,
            Program::Callback(callback) => {
                Subprocess::with_callback(Arc::clone(callback), directives, post_fork)
            }
        }
        .env(self.options.env.clone());

        debug!("Starting {}", self);
        state
            .subprocess
            .insert(subprocess)
            .run(&mut run.targets)?;
        Ok(())
    }

    pub(crate) fn wait(&self, run: &mut RunState) -> Result<Option<ExitStatus>> {
        match run.subprocess_mut(self.id) {
            Some(subprocess) => subprocess.wait(false),
            // Never forked, e.g. an earlier stage failed to start.
            None => {
                debug!("Nothing to wait for; {} never started", self);
                Ok(None)
            }
        }
    }

    pub(crate) fn status(&self, run: &RunState) -> Option<ExitStatus> {
        run.subprocess(self.id).and_then(Subprocess::status)
    }
}

fn parse_args(args: &[Arg]) -> Result<(Vec<String>, Vec<Directive>, Options)> {
    let mut strings = Vec::new();
    let mut directives = Vec::new();
    let mut options = Options::default();

    for arg in args {
        match arg {
            Arg::Str(s) => strings.push(s.clone()),
            Arg::List(list) => strings.extend(list.iter().cloned()),
            Arg::Directive(directive) => directives.push(directive.shared()),
            Arg::Options(extra) => options.merge(extra),
        }
    }

    for s in &strings {
        reject_nul("Argument", s)?;
    }
    if let Some(cwd) = &options.cwd {
        reject_nul("Working directory", &cwd.to_string_lossy())?;
    }
    for (key, value) in options.env.iter().flatten() {
        reject_nul("Environment name", key)?;
        reject_nul("Environment value", value)?;
        if key.is_empty() || key.contains('=') {
            return Err(PlumbError::Configuration(format!(
                "Environment name must be non-empty and contain no '=': {:?}",
                key
            )));
        }
    }
    Ok((strings, directives, options))
}

fn reject_nul(what: &str, s: &str) -> Result<()> {
    if s.contains('\0') {
        return Err(PlumbError::Configuration(format!(
            "{} contains a nul byte: {:?}",
            what, s
        )));
    }
    Ok(())
}

// A copy is a distinct command: fresh id, and its own literal stores.
impl Clone for Command {
    fn clone(&self) -> Self {
        Self {
            id: CommandId::next(),
            raw_args: self.raw_args.clone(),
            program: self.program.clone(),
            directives: self.directives.clone(),
            options: self.options.clone(),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("args", &self.args())
            .field("callback", &self.is_callback())
            .field("directives", &self.directives)
            .field("options", &self.options)
            .finish()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command: {}", self.render())
    }
}
