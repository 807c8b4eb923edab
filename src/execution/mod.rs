//! Execution layer: forking, exec and reaping
//!
//! This module handles starting one child process and collecting its
//! status.
//!
//! # Features
//!
//! - **Control pipe**: exec failures travel from child to parent as one
//!   serialized message; an empty pipe means the exec succeeded
//! - **Hard exit**: a child that cannot exec leaves through `_exit`
//! - **Callbacks**: a child may run an in-process closure instead of exec
//! - **Reaping**: blocking and non-blocking, with reap races reported
//!
//! # Examples
//!
//! ```ignore
//! use shellplumb::execution::Subprocess;
//! use shellplumb::runner::TargetRegistry;
//!
//! let mut targets = TargetRegistry::default();
//! let mut child = Subprocess::new(vec!["true".into()], vec![], vec![])?;
//! child.run(&mut targets)?;
//! let status = child.wait(false)?;
//! ```

pub mod pipe;
pub mod process;

pub use pipe::PipeWrapper;
pub use process::{
    Callback, CallbackError, ExecFailure, ExitStatus, PostFork, Subprocess,
    CALLBACK_FAILURE_STATUS, EXEC_FAILURE_STATUS,
};

#[cfg(test)]
mod tests;
