//! Process-signal dispatch.
//!
//! There is exactly one process-wide handler slot. [`install`] registers a
//! minimal handler for the requested signals; it only records the signal
//! number in an atomic, and [`take_pending`] hands the observation to
//! whoever polls it (the pool's dispatch thread). Dropping the returned
//! guard restores the previous dispositions and clears the slot, so a
//! subsequent pool can install again.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tracing::warn;

/// Process signals the pool reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGHUP
    Hup,
    /// SIGINT
    Int,
    /// SIGTERM
    Term,
    /// SIGQUIT
    Quit,
}

impl Signal {
    /// The termination signals a server pool normally subscribes to.
    pub const TERMINATION: [Signal; 4] = [Signal::Int, Signal::Term, Signal::Quit, Signal::Hup];

    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Hup => libc::SIGHUP,
            Signal::Int => libc::SIGINT,
            Signal::Term => libc::SIGTERM,
            Signal::Quit => libc::SIGQUIT,
        }
    }

    fn from_raw(raw: libc::c_int) -> Option<Signal> {
        match raw {
            libc::SIGHUP => Some(Signal::Hup),
            libc::SIGINT => Some(Signal::Int),
            libc::SIGTERM => Some(Signal::Term),
            libc::SIGQUIT => Some(Signal::Quit),
            _ => None,
        }
    }
}

/// Latest observed signal number; 0 means none. The handler may only do
/// async-signal-safe work, which this single store is.
static PENDING: AtomicI32 = AtomicI32::new(0);
static INSTALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn record_signal(raw: libc::c_int) {
    PENDING.store(raw, Ordering::SeqCst);
}

/// Restores the previous signal dispositions and frees the handler slot on
/// drop.
pub struct SignalGuard {
    previous: Vec<(libc::c_int, libc::sighandler_t)>,
}

/// Install the process-wide handler for the given signals.
///
/// Fails if a handler is already installed; there is a single slot, owned
/// by the running pool.
pub fn install(signals: &[Signal]) -> io::Result<SignalGuard> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "a signal handler is already installed",
        ));
    }
    PENDING.store(0, Ordering::SeqCst);

    let mut previous = Vec::with_capacity(signals.len());
    for sig in signals {
        let raw = sig.as_raw();
        let old = unsafe { libc::signal(raw, record_signal as libc::sighandler_t) };
        if old == libc::SIG_ERR {
            let err = io::Error::last_os_error();
            restore(&previous);
            INSTALLED.store(false, Ordering::SeqCst);
            return Err(err);
        }
        previous.push((raw, old));
    }

    Ok(SignalGuard { previous })
}

/// Consume the most recently observed signal, if any.
pub fn take_pending() -> Option<Signal> {
    match PENDING.swap(0, Ordering::SeqCst) {
        0 => None,
        raw => Signal::from_raw(raw),
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        restore(&self.previous);
        PENDING.store(0, Ordering::SeqCst);
        INSTALLED.store(false, Ordering::SeqCst);
    }
}

fn restore(previous: &[(libc::c_int, libc::sighandler_t)]) {
    for &(raw, old) in previous {
        if unsafe { libc::signal(raw, old) } == libc::SIG_ERR {
            warn!(signal = raw, "Failed to restore previous signal handler");
        }
    }
}

/// Serializes tests that touch the process-wide handler slot.
#[cfg(test)]
pub(crate) static TEST_SIGNAL_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
