//! Error types for process plumbing

use std::io;
use thiserror::Error;

use crate::execution::ExitStatus;

/// Result type for plumbing operations
pub type Result<T> = std::result::Result<T, PlumbError>;

/// Errors that can occur while building or running a process graph
#[derive(Error, Debug)]
pub enum PlumbError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Resource already closed: {0}")]
    Closed(String),

    #[error("Failed to exec in subprocess: {message} ({kind})")]
    Exec {
        message: String,
        kind: String,
        origin: Vec<String>,
    },

    #[error("No child process {pid} to reap (was it reaped elsewhere?)")]
    ReapRace { pid: i32 },

    #[error("Command `{command}` exited unsuccessfully: {status}")]
    BadExit { command: String, status: ExitStatus },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Syscall error: {0}")]
    Syscall(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Invalid message on control pipe: {0}")]
    InvalidMessage(String),
}

impl From<nix::errno::Errno> for PlumbError {
    fn from(errno: nix::errno::Errno) -> Self {
        PlumbError::Syscall(errno.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PlumbError::ReapRace { pid: 42 };
        assert_eq!(
            err.to_string(),
            "No child process 42 to reap (was it reaped elsewhere?)"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = PlumbError::from(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_from_errno() {
        let err = PlumbError::from(nix::errno::Errno::EBADF);
        assert!(matches!(err, PlumbError::Syscall(_)));
    }

    #[test]
    fn test_exec_error_carries_kind() {
        let err = PlumbError::Exec {
            message: "No such file or directory".to_string(),
            kind: "ENOENT".to_string(),
            origin: vec!["execve".to_string()],
        };
        assert!(err.to_string().contains("ENOENT"));
    }

    #[test]
    fn test_bad_exit_mentions_command() {
        let err = PlumbError::BadExit {
            command: "false".to_string(),
            status: ExitStatus::Exited(1),
        };
        assert!(err.to_string().contains("`false`"));
        assert!(err.to_string().contains("exit code 1"));
    }
}
