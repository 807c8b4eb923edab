//! shellplumb: process graphs without a shell
//!
//! Builds and runs commands and pipelines connected by pipes and descriptor
//! redirects, with concurrent I/O against any number of named endpoints.
//! No shell is ever invoked.
//!
//! # Modules
//!
//! - **directive**: Redirects and literal input applied around the fork
//! - **execution**: Forking, exec-error reporting and reaping
//! - **io**: Non-blocking multiplexed I/O, aware of child exits
//! - **command** / **pipeline**: What to run
//! - **runner**: One execution, from prepare to reaped
//!
//! # Example
//!
//! ```ignore
//! use shellplumb::{Command, Direction, Pipeline, ReadMode, Redirect, Runner};
//!
//! let pipeline = Pipeline::new(vec![
//!     Command::new(vec!["printf".into(), "b\na\n".into()])?,
//!     Command::new(vec![
//!         "sort".into(),
//!         Redirect::named(1, Direction::Write, "sorted").into(),
//!     ])?,
//! ])?;
//!
//! let mut runner = Runner::new(pipeline)?;
//! runner.run_checked()?;
//! assert_eq!(runner.read("sorted", ReadMode::Full)?, Some(b"a\nb\n".to_vec()));
//! ```

// Core modules
pub mod errors;
pub mod utils;

// Layered modules
pub mod directive;
pub mod execution;
pub mod io;

// Composition and orchestration
pub mod command;
pub mod pipeline;
pub mod runner;

// Public API
pub use command::{Arg, Command, CommandId, Options};
pub use directive::{
    Direction, Directive, DirectiveOps, LiteralInput, ReadCallback, Redirect, Target,
    TargetOptions, WriteCallback,
};
pub use errors::{PlumbError, Result};
pub use execution::{ExecFailure, ExitStatus, Subprocess};
pub use io::{Chunk, IoHandler, ParallelIo, PidAwareParallelIo};
pub use pipeline::Pipeline;
pub use runner::{Job, Phase, ReadMode, Runner, TargetRegistry};


#[cfg(test)]
pub mod test_support {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    pub fn serial_guard() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
