//! Worker run loop.
//!
//! Each worker is one OS thread bound to exactly one listener. It blocks in
//! `accept`, runs the handler synchronously, and goes back to accepting
//! until told to stop. Flipping the active flag alone does not unblock a
//! parked accept; the pool forces the listener closed for that.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use crate::listener::{AcceptError, Listener};
use crate::pool::Communicator;

pub(crate) struct Worker {
    id: usize,
    listener: Arc<Listener>,
    comm: Arc<Communicator>,
    active: AtomicBool,
}

impl Worker {
    pub(crate) fn new(id: usize, listener: Arc<Listener>, comm: Arc<Communicator>) -> Self {
        Self {
            id,
            listener,
            comm,
            active: AtomicBool::new(false),
        }
    }

    /// Thread body. Reports "started" exactly once, then accepts until the
    /// active flag is cleared or the listener is closed. Always closes the
    /// listener on the way out (idempotent).
    pub(crate) fn run(&self) {
        self.active.store(true, Ordering::Release);
        self.comm.notify_started();
        debug!(worker = self.id, addr = %self.listener.addr(), "Worker started");

        while self.active.load(Ordering::Acquire) {
            match self.listener.accept(self.id, &self.comm) {
                Ok(()) => {}
                Err(AcceptError::Shutdown) => {
                    debug!(worker = self.id, "Listener closed, worker exiting");
                    break;
                }
                Err(AcceptError::Io(e)) => {
                    error!(worker = self.id, error = %e, "Worker terminating on accept failure");
                    break;
                }
            }
        }

        self.listener.ensure_closed_for_shutdown();
        debug!(worker = self.id, "Worker exited");
    }

    /// Flip the worker inactive. Callable from any thread; does not by
    /// itself interrupt a blocked accept.
    pub(crate) fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::ListenAddr;
    use crate::config::Tunables;
    use crate::listener::Handler;
    use std::net::Ipv4Addr;
    use std::thread;

    fn loopback_listener() -> Arc<Listener> {
        let handler: Arc<Handler> = Arc::new(|_conn| Ok(()));
        let listener = Listener::new(
            ListenAddr::V4(Ipv4Addr::LOCALHOST, Some(0)),
            Tunables::default(),
            handler,
        )
        .unwrap();
        listener.bind(true).unwrap();
        listener.listen(16).unwrap();
        Arc::new(listener)
    }

    #[test]
    fn test_worker_exits_when_listener_closes() {
        let listener = loopback_listener();
        let comm = Arc::new(Communicator::new());
        let worker = Arc::new(Worker::new(0, Arc::clone(&listener), Arc::clone(&comm)));

        let thread_worker = Arc::clone(&worker);
        let handle = thread::spawn(move || thread_worker.run());

        // Wait for the worker to report in, then force the listener closed.
        while comm.started_count() == 0 {
            thread::yield_now();
        }
        worker.shutdown();
        listener.ensure_closed_for_shutdown();

        handle.join().unwrap();
        assert_eq!(comm.started_count(), 1);
        assert_eq!(comm.busy_count(), 0);
    }

    #[test]
    fn test_shutdown_flips_active() {
        let listener = loopback_listener();
        let comm = Arc::new(Communicator::new());
        let worker = Worker::new(3, listener, comm);

        assert!(!worker.is_active());
        worker.shutdown();
        assert!(!worker.is_active());
    }
}
