//! Literal input (`<<<`): feed a fixed byte string to a descriptor

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use tempfile::NamedTempFile;

use super::redirect::{Direction, Redirect, Target};
use crate::errors::{PlumbError, Result};
use crate::execution::ExecFailure;
use crate::runner::TargetRegistry;
use crate::utils::set_cloexec;

static NEXT_LITERAL_ID: AtomicU64 = AtomicU64::new(1);

fn next_literal_id() -> u64 {
    NEXT_LITERAL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Bytes delivered on `source` as if it were a file holding exactly them.
///
/// The bytes are written to an unlinked temporary file before any process
/// is forked, so the child never races a partial write.
pub struct LiteralInput {
    id: u64,
    source: RawFd,
    bytes: Arc<[u8]>,
}

impl LiteralInput {
    pub fn new(source: RawFd, bytes: impl AsRef<[u8]>) -> Self {
        Self {
            id: next_literal_id(),
            source,
            bytes: Arc::from(bytes.as_ref()),
        }
    }

    /// Literal input on stdin
    pub fn stdin(bytes: impl AsRef<[u8]>) -> Self {
        Self::new(0, bytes)
    }

    pub fn source(&self) -> RawFd {
        self.source
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Copy that refers to the same backing store
    pub(crate) fn shared(&self) -> Self {
        Self {
            id: self.id,
            source: self.source,
            bytes: Arc::clone(&self.bytes),
        }
    }

    pub(crate) fn register(&self, targets: &mut TargetRegistry) -> Result<()> {
        if self.source < 0 {
            return Err(PlumbError::Configuration(format!(
                "Literal input source must be a descriptor number, not {}",
                self.source
            )));
        }

        let mut store = NamedTempFile::new()?;
        store.write_all(&self.bytes)?;
        store.flush()?;

        // Reopen read-only so the child cannot write through its input.
        let read_only = File::open(store.path())?;
        drop(store);
        set_cloexec(read_only.as_raw_fd(), true)?;

        debug!(
            "Buffered {} literal bytes for descriptor {}",
            self.bytes.len(),
            self.source
        );
        let redirect = Redirect::new(
            self.source,
            Direction::Read,
            Target::Handle(Arc::new(OwnedFd::from(read_only))),
        );
        targets.insert_literal(self.id, redirect);
        Ok(())
    }

    pub(crate) fn apply_parent(&self, targets: &mut TargetRegistry) -> Result<()> {
        let redirect = targets.remove_literal(self.id).ok_or_else(|| {
            PlumbError::State(format!("{} was never registered", self.render()))
        })?;
        redirect.apply_parent(targets)
    }

    pub(crate) fn apply_child(
        &self,
        targets: &TargetRegistry,
    ) -> std::result::Result<(), ExecFailure> {
        match targets.literal(self.id) {
            Some(redirect) => redirect.apply_child(targets),
            None => Err(ExecFailure::new(
                "literal input was never buffered",
                "EBADF",
                vec!["apply_literal".to_string(), self.render()],
            )),
        }
    }

    pub fn render(&self) -> String {
        let prefix = if self.source == 0 {
            String::new()
        } else {
            self.source.to_string()
        };
        format!("{}<<< ({} bytes)", prefix, self.bytes.len())
    }
}

// Each copy buffers its own backing store, so it needs its own identity.
impl Clone for LiteralInput {
    fn clone(&self) -> Self {
        Self {
            id: next_literal_id(),
            source: self.source,
            bytes: Arc::clone(&self.bytes),
        }
    }
}

impl fmt::Debug for LiteralInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiteralInput")
            .field("source", &self.source)
            .field("len", &self.bytes.len())
            .finish()
    }
}
