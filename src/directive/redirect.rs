//! Descriptor redirects: `2>&1`, `<file`, `>>file`, `>:name`

use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use nix::errno::Errno;

use crate::errors::{PlumbError, Result};
use crate::execution::ExecFailure;
use crate::io::Chunk;
use crate::runner::TargetRegistry;
use crate::utils::{dup_onto, shell_escape};

/// Callback for bytes read from a named target: `(name, chunk)`
pub type ReadCallback = Arc<dyn Fn(&str, Chunk<'_>) + Send + Sync>;

/// Callback for bytes written to a named target: `(name, chunk, remaining)`
pub type WriteCallback = Arc<dyn Fn(&str, Chunk<'_>, &[u8]) + Send + Sync>;

/// Which way data flows through the redirected descriptor, from the
/// child's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// `<`
    Read,
    /// `>`
    Write,
    /// `>|`
    Clobber,
    /// `>>`
    Append,
}

impl Direction {
    pub fn symbol(self) -> &'static str {
        match self {
            Direction::Read => "<",
            Direction::Write => ">",
            Direction::Clobber => ">|",
            Direction::Append => ">>",
        }
    }

    pub fn is_read(self) -> bool {
        matches!(self, Direction::Read)
    }

    fn default_source(self) -> RawFd {
        if self.is_read() {
            0
        } else {
            1
        }
    }
}

/// What a redirected descriptor ends up pointing at
#[derive(Debug, Clone)]
pub enum Target {
    /// An explicit descriptor number in the child
    Fd(RawFd),
    /// An open handle owned by the caller, inherited by the child
    Handle(Arc<OwnedFd>),
    /// A path opened in the child
    Path(PathBuf),
    /// A pipe allocated by the runner and exposed under a name
    Named(String),
}

/// Options for a named target
#[derive(Clone, Default)]
pub struct TargetOptions {
    /// Also copy bytes read from the child to the parent's descriptor with
    /// the same number
    pub tee: bool,
    /// Receive chunks as they are read instead of buffering them
    pub on_read: Option<ReadCallback>,
    /// Observe chunks as they are written
    pub on_write: Option<WriteCallback>,
}

impl fmt::Debug for TargetOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetOptions")
            .field("tee", &self.tee)
            .field("on_read", &self.on_read.is_some())
            .field("on_write", &self.on_write.is_some())
            .finish()
    }
}

/// Redirect `source` in the child to `target`
#[derive(Debug, Clone)]
pub struct Redirect {
    source: RawFd,
    direction: Direction,
    target: Target,
    options: TargetOptions,
}

impl Redirect {
    pub fn new(source: RawFd, direction: Direction, target: Target) -> Self {
        Self {
            source,
            direction,
            target,
            options: TargetOptions::default(),
        }
    }

    /// `source>&fd` or `source<&fd`
    pub fn fd(source: RawFd, direction: Direction, fd: RawFd) -> Self {
        Self::new(source, direction, Target::Fd(fd))
    }

    /// Redirect onto a path opened in the child
    pub fn path(source: RawFd, direction: Direction, path: impl AsRef<Path>) -> Self {
        Self::new(source, direction, Target::Path(path.as_ref().to_path_buf()))
    }

    /// Redirect onto a handle the caller already holds
    pub fn handle(source: RawFd, direction: Direction, handle: impl Into<OwnedFd>) -> Self {
        Self::new(source, direction, Target::Handle(Arc::new(handle.into())))
    }

    /// Redirect onto a runner-allocated pipe exposed as `name`
    pub fn named(source: RawFd, direction: Direction, name: impl Into<String>) -> Self {
        Self::new(source, direction, Target::Named(name.into()))
    }

    /// Attach options; only valid for named targets.
    pub fn with_options(mut self, options: TargetOptions) -> Result<Self> {
        if !matches!(self.target, Target::Named(_)) {
            return Err(PlumbError::Configuration(format!(
                "Target options are only supported for named targets, not {}",
                self.render()
            )));
        }
        self.options = options;
        Ok(self)
    }

    pub fn source(&self) -> RawFd {
        self.source
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn options(&self) -> &TargetOptions {
        &self.options
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.source < 0 {
            return Err(PlumbError::Configuration(format!(
                "Redirect source must be a descriptor number, not {}",
                self.source
            )));
        }

        match &self.target {
            Target::Fd(fd) if *fd < 0 => Err(PlumbError::Configuration(format!(
                "Redirect target must be a descriptor number, not {}",
                fd
            ))),
            Target::Path(path) if path.as_os_str().is_empty() => Err(
                PlumbError::Configuration("Redirect target path is empty".to_string()),
            ),
            Target::Named(name) if name.is_empty() => Err(PlumbError::Configuration(
                "Named target must have a non-empty name".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub(crate) fn register(&self, targets: &mut TargetRegistry) -> Result<()> {
        self.validate()?;

        match &self.target {
            Target::Named(name) => {
                // The parent reads whatever the child writes, and vice versa.
                let parent_reads = !self.direction.is_read();
                targets.register_named(name, parent_reads, self.source, self.options.clone())?;
            }
            // Opened after fork, where nothing may log.
            Target::Path(path) => debug!("Child will open {} for {}", path.display(), self.render()),
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn apply_parent(&self, targets: &mut TargetRegistry) -> Result<()> {
        if let Target::Named(name) = &self.target {
            targets.close_counterpart(name)?;
        }
        Ok(())
    }

    pub(crate) fn apply_child(
        &self,
        targets: &TargetRegistry,
    ) -> std::result::Result<(), ExecFailure> {
        let origin = || vec!["apply_redirect".to_string(), self.render()];

        match &self.target {
            Target::Fd(fd) => dup_onto(*fd, self.source)
                .map_err(|errno| ExecFailure::from_errno(errno, origin())),
            Target::Handle(handle) => dup_onto(handle.as_raw_fd(), self.source)
                .map_err(|errno| ExecFailure::from_errno(errno, origin())),
            Target::Path(path) => {
                let file = self
                    .open_path(path)
                    .map_err(|e| ExecFailure::from_io(&e, origin()))?;
                let raw = file.as_raw_fd();
                if raw == self.source {
                    // Opened straight onto the source; it must outlive `file`.
                    let _ = file.into_raw_fd();
                }
                dup_onto(raw, self.source).map_err(|errno| ExecFailure::from_errno(errno, origin()))
            }
            Target::Named(name) => {
                let fd = targets
                    .counterpart_fd(name)
                    .ok_or_else(|| ExecFailure::from_errno(Errno::EBADF, origin()))?;
                dup_onto(fd, self.source).map_err(|errno| ExecFailure::from_errno(errno, origin()))
            }
        }
    }

    fn open_path(&self, path: &Path) -> std::io::Result<File> {
        let mut options = OpenOptions::new();
        match self.direction {
            Direction::Read => options.read(true),
            Direction::Write | Direction::Clobber => {
                options.write(true).create(true).truncate(true)
            }
            Direction::Append => options.append(true).create(true),
        };
        options.mode(0o666).open(path)
    }

    /// Shell-like rendering, for diagnostics only
    pub fn render(&self) -> String {
        let prefix = if self.source == self.direction.default_source() {
            String::new()
        } else {
            self.source.to_string()
        };
        let dup_symbol = if self.direction.is_read() { "<" } else { ">" };

        match &self.target {
            Target::Fd(fd) => format!("{}{}&{}", prefix, dup_symbol, fd),
            Target::Handle(handle) => {
                format!("{}{}&{}", prefix, dup_symbol, handle.as_raw_fd())
            }
            Target::Path(path) => format!(
                "{}{}{}",
                prefix,
                self.direction.symbol(),
                shell_escape(&path.to_string_lossy())
            ),
            Target::Named(name) => format!("{}{}:{}", prefix, self.direction.symbol(), name),
        }
    }
}

impl fmt::Display for Redirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Redirect: {}", self.render())
    }
}
