//! Parent-side I/O over the runner's named targets
//!
//! - [`ParallelIo`] multiplexes reads and writes over many non-blocking
//!   pipe ends, with per-chunk callbacks
//! - [`PidAwareParallelIo`] adds child-exit awareness, so a descendant
//!   holding a pipe open cannot stall the parent forever

pub mod parallel;
pub mod pid_aware;

pub use parallel::{Chunk, IoHandler, ParallelIo};
pub use pid_aware::{ChildTracker, PidAwareParallelIo};
