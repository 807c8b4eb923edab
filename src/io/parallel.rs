//! Single-threaded readiness multiplexer over named pipe endpoints

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd};

use log::{trace, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::errors::{PlumbError, Result};
use crate::utils::set_nonblocking;

const READ_CHUNK: usize = 4096;

/// One callback payload: bytes, or the single end-of-stream marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk<'a> {
    Data(&'a [u8]),
    Eof,
}

impl<'a> Chunk<'a> {
    pub fn is_eof(&self) -> bool {
        matches!(self, Chunk::Eof)
    }

    pub fn data(&self) -> Option<&'a [u8]> {
        match self {
            Chunk::Data(bytes) => Some(bytes),
            Chunk::Eof => None,
        }
    }
}

/// Receives I/O events for named endpoints.
///
/// For any one endpoint, data callbacks arrive in order and `Chunk::Eof`
/// arrives exactly once, last.
pub trait IoHandler {
    fn on_read(&mut self, _name: &str, _chunk: Chunk<'_>) {}

    /// `remaining` is what is still queued after this chunk
    fn on_write(&mut self, _name: &str, _chunk: Chunk<'_>, _remaining: &[u8]) {}
}

impl IoHandler for () {}

#[derive(Debug)]
struct Reader {
    name: Option<String>,
    file: Option<File>,
    finished: bool,
}

impl Reader {
    fn is_available(&self) -> bool {
        !self.finished && self.file.is_some()
    }
}

#[derive(Debug)]
struct Writer {
    name: Option<String>,
    file: Option<File>,
    pending: Vec<u8>,
    close_on_complete: bool,
    finished: bool,
}

impl Writer {
    fn is_open(&self) -> bool {
        !self.finished && self.file.is_some()
    }

    fn has_pending(&self) -> bool {
        self.is_open() && !self.pending.is_empty()
    }

    fn is_complete(&self) -> bool {
        self.is_open() && self.close_on_complete && self.pending.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Read,
    Write,
}

/// Drains readers and fills writers without blocking on any single one.
///
/// The only blocking point is the readiness wait inside [`run_once`].
///
/// [`run_once`]: ParallelIo::run_once
#[derive(Debug, Default)]
pub struct ParallelIo {
    readers: Vec<Reader>,
    writers: Vec<Writer>,
}

impl ParallelIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reader; may be called between cycles
    pub fn register_reader(&mut self, name: impl Into<String>, fd: impl Into<OwnedFd>) -> Result<()> {
        let name = name.into();
        self.check_unique(&name)?;
        self.push_reader(Some(name), fd.into())
    }

    /// Reader whose bytes are consumed without any callback
    pub(crate) fn register_anonymous_reader(&mut self, fd: OwnedFd) -> Result<()> {
        self.push_reader(None, fd)
    }

    fn push_reader(&mut self, name: Option<String>, fd: OwnedFd) -> Result<()> {
        set_nonblocking(fd.as_raw_fd())?;
        self.readers.push(Reader {
            name,
            file: Some(File::from(fd)),
            finished: false,
        });
        Ok(())
    }

    /// Add a writer; may be called between cycles
    pub fn register_writer(&mut self, name: impl Into<String>, fd: impl Into<OwnedFd>) -> Result<()> {
        let name = name.into();
        self.check_unique(&name)?;
        let fd = fd.into();
        set_nonblocking(fd.as_raw_fd())?;
        self.writers.push(Writer {
            name: Some(name),
            file: Some(File::from(fd)),
            pending: Vec::new(),
            close_on_complete: false,
            finished: false,
        });
        Ok(())
    }

    fn check_unique(&self, name: &str) -> Result<()> {
        let taken = self.readers.iter().any(|r| r.name.as_deref() == Some(name))
            || self.writers.iter().any(|w| w.name.as_deref() == Some(name));
        if taken {
            return Err(PlumbError::Configuration(format!(
                "An endpoint named {:?} is already registered",
                name
            )));
        }
        Ok(())
    }

    fn writer_mut(&mut self, name: &str) -> Result<&mut Writer> {
        self.writers
            .iter_mut()
            .find(|w| w.name.as_deref() == Some(name))
            .ok_or_else(|| PlumbError::Configuration(format!("No writer named {:?}", name)))
    }

    /// Queue `data` on a writer.
    ///
    /// With `close_on_complete`, the writer is closed once everything queued
    /// has been sent, and nothing more may be queued.
    pub fn write(&mut self, name: &str, data: &[u8], close_on_complete: bool) -> Result<()> {
        let writer = self.writer_mut(name)?;

        if writer.close_on_complete {
            return Err(PlumbError::Closed(format!(
                "Writer {:?} is already marked close-on-complete; can't write more data",
                name
            )));
        }
        if !writer.is_open() {
            return Err(PlumbError::Closed(format!("Writer {:?} is closed", name)));
        }

        writer.close_on_complete = close_on_complete;
        writer.pending.extend_from_slice(data);
        Ok(())
    }

    /// Force-close a writer, dropping anything still queued
    pub fn close(&mut self, name: &str) -> Result<()> {
        let writer = self.writer_mut(name)?;
        writer.file.take();
        writer.finished = true;
        Ok(())
    }

    pub fn reader_names(&self) -> Vec<&str> {
        self.readers.iter().filter_map(|r| r.name.as_deref()).collect()
    }

    pub fn writer_names(&self) -> Vec<&str> {
        self.writers.iter().filter_map(|w| w.name.as_deref()).collect()
    }

    /// Whether the named reader or writer is still open
    pub fn is_open(&self, name: &str) -> bool {
        self.readers
            .iter()
            .any(|r| r.name.as_deref() == Some(name) && r.is_available())
            || self
                .writers
                .iter()
                .any(|w| w.name.as_deref() == Some(name) && w.is_open())
    }

    /// Bytes still queued on a writer
    pub fn pending(&self, name: &str) -> Option<&[u8]> {
        self.writers
            .iter()
            .find(|w| w.name.as_deref() == Some(name))
            .map(|w| w.pending.as_slice())
    }

    /// Whether any reader is open or any writer has something to do
    pub fn has_work(&self) -> bool {
        self.readers.iter().any(Reader::is_available)
            || self.writers.iter().any(|w| w.has_pending() || w.is_complete())
    }

    pub(crate) fn has_named_work(&self) -> bool {
        self.readers
            .iter()
            .any(|r| r.name.is_some() && r.is_available())
            || self.writers.iter().any(|w| w.has_pending() || w.is_complete())
    }

    /// Cycle until no reader is open and no writer has pending bytes
    pub fn run(&mut self, handler: &mut dyn IoHandler) -> Result<()> {
        while self.has_work() {
            self.run_once(handler)?;
        }
        Ok(())
    }

    /// Wait for readiness, then do one read or write per ready endpoint.
    ///
    /// Returns how many endpoints were acted on.
    pub fn run_once(&mut self, handler: &mut dyn IoHandler) -> Result<usize> {
        self.cycle(handler, PollTimeout::NONE)
    }

    /// Cycle without blocking until nothing is ready
    pub fn consume_all_available(&mut self, handler: &mut dyn IoHandler) -> Result<()> {
        while self.cycle(handler, PollTimeout::ZERO)? > 0 {}
        Ok(())
    }

    /// Retire every endpoint still open, with an EOF callback for each
    pub fn close_all(&mut self, handler: &mut dyn IoHandler) {
        for idx in 0..self.readers.len() {
            if self.readers[idx].is_available() {
                self.finalize_reader(idx, handler);
            }
        }
        for idx in 0..self.writers.len() {
            if self.writers[idx].is_open() {
                self.finalize_writer(idx, handler);
            }
        }
    }

    fn cycle(&mut self, handler: &mut dyn IoHandler, timeout: PollTimeout) -> Result<usize> {
        let mut acted = self.finalize_completed_writers(handler);

        let ready: Vec<(Side, usize)> = {
            let mut slots = Vec::new();
            let mut fds = Vec::new();

            for (idx, reader) in self.readers.iter().enumerate() {
                if let (false, Some(file)) = (reader.finished, reader.file.as_ref()) {
                    slots.push((Side::Read, idx));
                    fds.push(PollFd::new(file.as_fd(), PollFlags::POLLIN));
                }
            }
            for (idx, writer) in self.writers.iter().enumerate() {
                if !writer.has_pending() {
                    continue;
                }
                if let Some(file) = writer.file.as_ref() {
                    slots.push((Side::Write, idx));
                    fds.push(PollFd::new(file.as_fd(), PollFlags::POLLOUT));
                }
            }

            if fds.is_empty() {
                return Ok(acted);
            }

            loop {
                match poll(&mut fds, timeout) {
                    Ok(_) => break,
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(PlumbError::Syscall(format!("poll failed: {}", e))),
                }
            }

            slots
                .into_iter()
                .zip(fds.iter())
                .filter(|(_, fd)| fd.revents().is_some_and(|events| !events.is_empty()))
                .map(|(slot, _)| slot)
                .collect()
        };

        for (side, idx) in &ready {
            match side {
                Side::Read => self.read_available(*idx, handler),
                Side::Write => self.write_available(*idx, handler),
            }
        }

        acted += ready.len();
        Ok(acted)
    }

    fn read_available(&mut self, idx: usize, handler: &mut dyn IoHandler) {
        let mut buf = [0u8; READ_CHUNK];
        let result = match self.readers[idx].file.as_mut() {
            Some(file) => file.read(&mut buf),
            None => return,
        };

        match result {
            Ok(0) => self.finalize_reader(idx, handler),
            Ok(count) => {
                if let Some(name) = self.readers[idx].name.as_deref() {
                    trace!("Read {} bytes on {:?}", count, name);
                    handler.on_read(name, Chunk::Data(&buf[..count]));
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e) if e.kind() == ErrorKind::BrokenPipe => self.finalize_reader(idx, handler),
            Err(e) => warn!(
                "Read on {:?} failed, retrying next cycle: {}",
                self.readers[idx].name, e
            ),
        }
    }

    fn write_available(&mut self, idx: usize, handler: &mut dyn IoHandler) {
        let writer = &mut self.writers[idx];
        let result = match writer.file.as_mut() {
            Some(file) => file.write(&writer.pending),
            None => return,
        };

        match result {
            Ok(count) => {
                let written: Vec<u8> = writer.pending.drain(..count).collect();
                if let Some(name) = writer.name.as_deref() {
                    trace!("Wrote {} bytes on {:?}", count, name);
                    handler.on_write(name, Chunk::Data(&written), &writer.pending);
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                self.finalize_writer(idx, handler);
                return;
            }
            Err(e) => warn!("Write on {:?} failed, retrying next cycle: {}", writer.name, e),
        }

        if self.writers[idx].is_complete() {
            self.finalize_writer(idx, handler);
        }
    }

    fn finalize_completed_writers(&mut self, handler: &mut dyn IoHandler) -> usize {
        let mut count = 0;
        for idx in 0..self.writers.len() {
            if self.writers[idx].is_complete() {
                self.finalize_writer(idx, handler);
                count += 1;
            }
        }
        count
    }

    fn finalize_reader(&mut self, idx: usize, handler: &mut dyn IoHandler) {
        let reader = &mut self.readers[idx];
        reader.finished = true;
        if let Some(name) = reader.name.as_deref() {
            handler.on_read(name, Chunk::Eof);
        }
        reader.file.take();
    }

    fn finalize_writer(&mut self, idx: usize, handler: &mut dyn IoHandler) {
        let writer = &mut self.writers[idx];
        writer.finished = true;
        if let Some(name) = writer.name.as_deref() {
            handler.on_write(name, Chunk::Eof, &writer.pending);
        }
        writer.file.take();
    }
}
