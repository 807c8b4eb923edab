//! Multiplexer that also wakes when child processes exit
//!
//! A descendant may inherit a pipe end and keep it open long after the
//! child we care about has exited, so end-of-stream alone cannot tell us
//! when to stop. Each instance owns a self-pipe; a process-wide SIGCHLD
//! handler writes one byte into every registered self-pipe, which wakes the
//! readiness wait so the exit check can run again.

use std::os::unix::io::{AsRawFd, OwnedFd};

use log::debug;

use super::parallel::{IoHandler, ParallelIo};
use crate::errors::Result;
use crate::execution::PipeWrapper;

/// Answers whether every watched child has exited
pub trait ChildTracker {
    fn all_exited(&mut self) -> Result<bool>;
}

impl<F> ChildTracker for F
where
    F: FnMut() -> Result<bool>,
{
    fn all_exited(&mut self) -> Result<bool> {
        self()
    }
}

/// [`ParallelIo`] that finishes up once all watched children have exited
#[derive(Debug)]
pub struct PidAwareParallelIo {
    inner: ParallelIo,
    wakeup_writer: Option<OwnedFd>,
    slot: Option<usize>,
    finalized: bool,
}

impl PidAwareParallelIo {
    pub fn new() -> Result<Self> {
        let mut wakeup = PipeWrapper::nonblocking()?;
        let reader = wakeup.take_reader()?;
        let writer = wakeup.take_writer()?;

        let mut inner = ParallelIo::new();
        inner.register_anonymous_reader(reader)?;

        // Registration wakes the instance once, covering children that
        // exited before the handler was in place.
        let slot = wakeup::register(writer.as_raw_fd())?;

        Ok(Self {
            inner,
            wakeup_writer: Some(writer),
            slot: Some(slot),
            finalized: false,
        })
    }

    pub fn register_reader(&mut self, name: impl Into<String>, fd: impl Into<OwnedFd>) -> Result<()> {
        self.inner.register_reader(name, fd)
    }

    pub fn register_writer(&mut self, name: impl Into<String>, fd: impl Into<OwnedFd>) -> Result<()> {
        self.inner.register_writer(name, fd)
    }

    pub fn write(&mut self, name: &str, data: &[u8], close_on_complete: bool) -> Result<()> {
        self.inner.write(name, data, close_on_complete)
    }

    pub fn close(&mut self, name: &str) -> Result<()> {
        self.inner.close(name)
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.inner.is_open(name)
    }

    pub fn has_work(&self) -> bool {
        !self.finalized && self.inner.has_named_work()
    }

    /// Whether the children-exited cleanup has run
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// One cycle: finish up if every child has exited, otherwise wait for
    /// readiness or a child-exit wakeup.
    pub fn run_once(
        &mut self,
        handler: &mut dyn IoHandler,
        children: &mut dyn ChildTracker,
    ) -> Result<()> {
        if self.finalized {
            return Ok(());
        }

        if children.all_exited()? {
            return self.finalize_all(handler);
        }

        self.inner.run_once(handler)?;
        Ok(())
    }

    /// Cycle until finalized or no named endpoint has work left
    pub fn run(
        &mut self,
        handler: &mut dyn IoHandler,
        children: &mut dyn ChildTracker,
    ) -> Result<()> {
        while self.has_work() {
            self.run_once(handler, children)?;
        }
        Ok(())
    }

    /// Drain what is already buffered, then retire every endpoint.
    ///
    /// Whatever a lingering descendant writes after this point is never read.
    fn finalize_all(&mut self, handler: &mut dyn IoHandler) -> Result<()> {
        self.deregister();
        self.wakeup_writer.take();

        self.inner.consume_all_available(handler)?;
        self.inner.close_all(handler);
        self.finalized = true;

        debug!("All watched children exited; parallel IO finalized");
        Ok(())
    }

    fn deregister(&mut self) {
        if let Some(slot) = self.slot.take() {
            wakeup::deregister(slot);
        }
    }
}

impl Drop for PidAwareParallelIo {
    fn drop(&mut self) {
        self.deregister();
    }
}

/// Process-wide SIGCHLD fan-out to registered self-pipes.
///
/// The handler only touches atomics and calls `write(2)`; the mutex guards
/// installation and removal, which never run inside the handler. A handler
/// counts itself in `IN_FLIGHT` before reading any slot, and `deregister`
/// waits for that count to drain, so once it returns no handler can still
/// be writing to the released descriptor.
mod wakeup {
    use std::os::unix::io::RawFd;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
    use std::sync::{Mutex, MutexGuard};

    use log::{trace, warn};
    use nix::errno::Errno;
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    use crate::errors::{PlumbError, Result};

    const MAX_WAKEUPS: usize = 256;

    const EMPTY: i32 = -1;

    static SLOTS: [AtomicI32; MAX_WAKEUPS] = [const { AtomicI32::new(EMPTY) }; MAX_WAKEUPS];

    static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

    struct Registry {
        live: usize,
        previous: Option<SigAction>,
    }

    static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
        live: 0,
        previous: None,
    });

    fn lock() -> MutexGuard<'static, Registry> {
        REGISTRY.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    extern "C" fn on_sigchld(_signal: libc::c_int) {
        let saved = Errno::last_raw();
        IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
        for slot in SLOTS.iter() {
            let fd = slot.load(Ordering::SeqCst);
            if fd != EMPTY {
                trigger(fd);
            }
        }
        IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
        Errno::set_raw(saved);
    }

    fn trigger(fd: RawFd) {
        // SAFETY: async-signal-safe; a full self-pipe already guarantees a
        // wakeup, so a failed write is ignored.
        unsafe {
            libc::write(fd, b"!".as_ptr().cast(), 1);
        }
    }

    /// Claim a slot for `fd`, installing the handler if this is the first
    pub(super) fn register(fd: RawFd) -> Result<usize> {
        let mut registry = lock();

        let slot = SLOTS
            .iter()
            .position(|slot| slot.load(Ordering::Acquire) == EMPTY)
            .ok_or_else(|| {
                PlumbError::ResourceExhausted(format!(
                    "At most {} child-exit watchers may be live at once",
                    MAX_WAKEUPS
                ))
            })?;

        if registry.live == 0 {
            let action = SigAction::new(
                SigHandler::Handler(on_sigchld),
                SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
                SigSet::empty(),
            );
            // SAFETY: the handler is async-signal-safe.
            let previous = unsafe { sigaction(Signal::SIGCHLD, &action) }?;
            registry.previous = Some(previous);
            trace!("Installed SIGCHLD wakeup handler");
        }

        SLOTS[slot].store(fd, Ordering::Release);
        registry.live += 1;
        trigger(fd);
        Ok(slot)
    }

    /// Release a slot, restoring the previous handler after the last one.
    ///
    /// Returns only once no handler can still write to the slot's
    /// descriptor, so the caller may close it right after.
    pub(super) fn deregister(slot: usize) {
        let mut registry = lock();
        if SLOTS[slot].swap(EMPTY, Ordering::SeqCst) == EMPTY {
            return;
        }

        // Handlers entering from now on see the slot empty; wait out the
        // ones that may have read it before the swap.
        while IN_FLIGHT.load(Ordering::SeqCst) > 0 {
            std::thread::yield_now();
        }

        registry.live = registry.live.saturating_sub(1);
        if registry.live == 0 {
            if let Some(previous) = registry.previous.take() {
                // SAFETY: restores whatever disposition was in place before.
                if let Err(e) = unsafe { sigaction(Signal::SIGCHLD, &previous) } {
                    warn!("Failed to restore previous SIGCHLD handler: {}", e);
                }
            }
            trace!("Removed SIGCHLD wakeup handler");
        }
    }

    #[cfg(test)]
    pub(super) fn live() -> usize {
        lock().live
    }

    /// Pretend a handler is running until [`leave_handler`] is called
    #[cfg(test)]
    pub(super) fn enter_handler() {
        IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(super) fn leave_handler() {
        IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
    }
}
