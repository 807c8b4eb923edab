//! Owned OS pipe with independently closable ends

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use crate::errors::{PlumbError, Result};

/// Both ends of one pipe. Each end is closed at most once, either
/// explicitly or when the wrapper is dropped.
///
/// Ends are created close-on-exec; a child that needs one must duplicate it
/// onto a real descriptor number.
#[derive(Debug)]
pub struct PipeWrapper {
    reader: Option<OwnedFd>,
    writer: Option<OwnedFd>,
}

impl PipeWrapper {
    /// Create a new close-on-exec pipe
    pub fn new() -> Result<Self> {
        Self::with_flags(OFlag::empty())
    }

    /// Create a pipe whose ends are also non-blocking
    pub fn nonblocking() -> Result<Self> {
        Self::with_flags(OFlag::O_NONBLOCK)
    }

    fn with_flags(extra: OFlag) -> Result<Self> {
        let (reader, writer) = pipe2(OFlag::O_CLOEXEC | extra)
            .map_err(|e| PlumbError::Syscall(format!("pipe2 failed: {}", e)))?;
        Ok(Self {
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    /// Raw number of the read end
    pub fn reader_fd(&self) -> Result<RawFd> {
        self.reader
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| PlumbError::Closed("pipe read end".to_string()))
    }

    /// Raw number of the write end
    pub fn writer_fd(&self) -> Result<RawFd> {
        self.writer
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| PlumbError::Closed("pipe write end".to_string()))
    }

    /// Keep only the read end
    pub fn read_only(&mut self) {
        self.writer.take();
    }

    /// Keep only the write end
    pub fn write_only(&mut self) {
        self.reader.take();
    }

    /// Close both ends
    pub fn close(&mut self) {
        self.reader.take();
        self.writer.take();
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none() && self.writer.is_none()
    }

    /// Move the read end out of the wrapper
    pub fn take_reader(&mut self) -> Result<OwnedFd> {
        self.reader
            .take()
            .ok_or_else(|| PlumbError::Closed("pipe read end".to_string()))
    }

    /// Move the write end out of the wrapper
    pub fn take_writer(&mut self) -> Result<OwnedFd> {
        self.writer
            .take()
            .ok_or_else(|| PlumbError::Closed("pipe write end".to_string()))
    }

    /// Serialize `msg` onto the write end, then close it.
    pub fn send_message<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let writer = self.take_writer()?;
        let payload = serde_json::to_vec(msg)
            .map_err(|e| PlumbError::InvalidMessage(e.to_string()))?;

        let mut file = File::from(writer);
        file.write_all(&payload)?;
        Ok(())
    }

    /// Read the read end to end-of-stream, then close it.
    ///
    /// Returns `None` if the writer closed without sending anything.
    pub fn receive_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let reader = self.take_reader()?;
        let mut file = File::from(reader);
        let mut payload = Vec::new();
        file.read_to_end(&mut payload)?;

        if payload.is_empty() {
            return Ok(None);
        }

        serde_json::from_slice(&payload)
            .map(Some)
            .map_err(|e| PlumbError::InvalidMessage(e.to_string()))
    }
}
