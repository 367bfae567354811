//! Listening socket lifecycle.
//!
//! A [`Listener`] owns one bound, listening socket for one address and moves
//! through a strictly linear lifecycle: initial → bound → listening →
//! closed. `accept` blocks, runs the user handler synchronously, and
//! contains handler failures so they never take down the worker thread.
//!
//! Closing is the shutdown primitive: `shutdown(2)` on the listening socket
//! unblocks any thread parked in `accept`, and a tracked duplicate of the
//! in-flight accepted socket lets an external shutdown interrupt a handler
//! blocked on a slow peer.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{error, trace, warn};

use crate::addr::ListenAddr;
use crate::config::Tunables;
use crate::connection::Connection;
use crate::pool::Communicator;

/// A connection handler, run synchronously on the accepting worker's thread.
pub type Handler = dyn Fn(&mut Connection) -> io::Result<()> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Bound,
    Listening,
    Closed,
}

/// One bound+listening socket for one address.
pub struct Listener {
    addr: ListenAddr,
    tunables: Tunables,
    handler: Arc<Handler>,
    socket: Socket,
    state: Mutex<State>,
    /// Duplicate of the most recently accepted, not-yet-finished socket.
    current: Mutex<Option<Socket>>,
}

impl Listener {
    /// Create the socket for the address family. No syscalls beyond
    /// `socket(2)` happen here; the lifecycle starts at `bind`.
    pub fn new(addr: ListenAddr, tunables: Tunables, handler: Arc<Handler>) -> io::Result<Self> {
        let (domain, protocol) = match &addr {
            ListenAddr::Unix(_) => (Domain::UNIX, None),
            ListenAddr::V4(_, _) => (Domain::IPV4, Some(Protocol::TCP)),
            ListenAddr::V6(_, _) => (Domain::IPV6, Some(Protocol::TCP)),
        };
        let socket = Socket::new(domain, Type::STREAM, protocol)?;

        Ok(Self {
            addr,
            tunables,
            handler,
            socket,
            state: Mutex::new(State::Initial),
            current: Mutex::new(None),
        })
    }

    pub fn addr(&self) -> &ListenAddr {
        &self.addr
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// Bind the socket to its address. Unix targets get any stale socket
    /// file unlinked first (best-effort). Valid only in the initial state.
    pub fn bind(&self, reuse_address: bool) -> io::Result<()> {
        let mut state = lock(&self.state);
        if *state != State::Initial {
            return Err(invalid_state("bind", *state));
        }

        let sockaddr = match &self.addr {
            ListenAddr::Unix(path) => {
                if path.exists() {
                    if let Err(e) = std::fs::remove_file(path) {
                        warn!(path = %path.display(), error = %e, "Failed to unlink stale socket file");
                    }
                }
                SockAddr::unix(path)?
            }
            inet => {
                if reuse_address {
                    self.socket.set_reuse_address(true)?;
                }
                let sa = inet.socket_addr().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("listen address '{}' has no port", inet),
                    )
                })?;
                SockAddr::from(sa)
            }
        };

        self.socket.bind(&sockaddr)?;
        *state = State::Bound;
        Ok(())
    }

    /// Put the socket into listening mode. Valid only when bound.
    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        let mut state = lock(&self.state);
        if *state != State::Bound {
            return Err(invalid_state("listen", *state));
        }
        self.socket.listen(backlog)?;
        *state = State::Listening;
        Ok(())
    }

    /// The address the socket is actually bound to. Resolves ephemeral
    /// ports requested with `:0`.
    pub fn local_addr(&self) -> io::Result<ListenAddr> {
        let sockaddr = self.socket.local_addr()?;
        if let Some(sa) = sockaddr.as_socket() {
            return Ok(match sa {
                std::net::SocketAddr::V4(v4) => ListenAddr::V4(*v4.ip(), Some(v4.port())),
                std::net::SocketAddr::V6(v6) => ListenAddr::V6(*v6.ip(), Some(v6.port())),
            });
        }
        Ok(self.addr.clone())
    }

    /// Block until a connection arrives, then run the handler on it.
    ///
    /// Handler errors and panics are logged and contained here; the accepted
    /// socket is force-closed if the handler left it open. Only failures of
    /// the accept syscall itself propagate, classified as
    /// [`AcceptError::Shutdown`] when this listener was closed for shutdown.
    pub fn accept(&self, worker_id: usize, comm: &Communicator) -> Result<(), AcceptError> {
        match *lock(&self.state) {
            State::Listening => {}
            State::Closed => return Err(AcceptError::Shutdown),
            state => return Err(AcceptError::Io(invalid_state("accept", state))),
        }

        let (socket, peer) = match self.socket.accept() {
            Ok(pair) => pair,
            Err(e) => {
                if self.is_closed() {
                    return Err(AcceptError::Shutdown);
                }
                return Err(AcceptError::Io(e));
            }
        };
        trace!(worker = worker_id, peer = ?peer.as_socket(), "Accepted connection");

        // Keep a duplicate so a shutdown can interrupt the handler mid-read.
        match socket.try_clone() {
            Ok(dup) => *lock(&self.current) = Some(dup),
            Err(e) => {
                warn!(worker = worker_id, error = %e, "Failed to track accepted socket")
            }
        }

        let timeout = match self.tunables.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let mut conn = match Connection::new(socket, timeout) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(worker = worker_id, error = %e, "Failed to configure accepted socket");
                *lock(&self.current) = None;
                return Ok(());
            }
        };

        comm.notify_busy();
        let result = panic::catch_unwind(AssertUnwindSafe(|| (self.handler)(&mut conn)));
        comm.notify_idle();
        *lock(&self.current) = None;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(worker = worker_id, addr = %self.addr, error = %e, "Connection handler failed")
            }
            Err(_) => {
                error!(worker = worker_id, addr = %self.addr, "Connection handler panicked")
            }
        }

        if conn.is_open() {
            conn.close();
        }
        Ok(())
    }

    /// Force the listening socket closed, unblocking any parked accept.
    /// Idempotent; closing an already-closed listener is a no-op.
    pub fn ensure_closed_for_shutdown(&self) {
        {
            let mut state = lock(&self.state);
            if *state == State::Closed {
                return;
            }
            *state = State::Closed;
        }
        let _ = self.socket.shutdown(Shutdown::Both);
        if let ListenAddr::Unix(path) = &self.addr {
            let _ = std::fs::remove_file(path);
        }
    }

    /// Force down the in-flight accepted connection, if any. Interrupts a
    /// handler blocked on a slow read or write during shutdown.
    pub fn shutdown_current_accepted(&self) {
        if let Some(socket) = lock(&self.current).take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    fn is_closed(&self) -> bool {
        *lock(&self.state) == State::Closed
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.addr)
            .field("state", &*lock(&self.state))
            .finish()
    }
}

/// Accept-path failures, as seen by the worker.
#[derive(Debug)]
pub enum AcceptError {
    /// The listening socket was closed for shutdown; the worker exits its
    /// loop silently.
    Shutdown,
    /// The accept syscall failed for any other reason.
    Io(io::Error),
}

impl fmt::Display for AcceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptError::Shutdown => write!(f, "listener closed for shutdown"),
            AcceptError::Io(e) => write!(f, "accept failed: {}", e),
        }
    }
}

impl std::error::Error for AcceptError {}

fn invalid_state(op: &str, state: State) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{} is not valid in the {:?} state", op, state),
    )
}

/// Listener state is shared with worker threads whose handler panics are
/// already contained; a poisoned lock carries no torn data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
