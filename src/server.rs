//! Server facade.
//!
//! Owns the set of listeners and the shared connection handler, binds the
//! listeners, and delegates execution to a freshly constructed
//! [`WorkerPool`]. The pool itself is single-use; every call to `run`
//! builds a new one.

use std::io;
use std::sync::Arc;
use tracing::{info, warn};

use crate::addr::ListenAddr;
use crate::config::Tunables;
use crate::listener::{Handler, Listener};
use crate::pool::WorkerPool;

/// A multi-listener blocking socket server.
pub struct Server {
    defaults: Tunables,
    handler: Arc<Handler>,
    listeners: Vec<Arc<Listener>>,
    setup_signals: bool,
}

impl Server {
    /// Create a server with pool-level default tunables and the handler
    /// every listener dispatches to.
    pub fn new(defaults: Tunables, handler: Arc<Handler>) -> Self {
        Self {
            defaults,
            handler,
            listeners: Vec::new(),
            setup_signals: false,
        }
    }

    /// Enable process-signal handling for the next run.
    pub fn set_signal_handling(&mut self, enabled: bool) {
        self.setup_signals = enabled;
    }

    /// Register a listener using the server's default tunables.
    pub fn add_listener(&mut self, addr: ListenAddr) -> io::Result<()> {
        self.add_listener_with(addr, self.defaults.clone())
    }

    /// Register a listener with its own tunables.
    pub fn add_listener_with(&mut self, addr: ListenAddr, tunables: Tunables) -> io::Result<()> {
        let listener = Listener::new(addr, tunables, Arc::clone(&self.handler))?;
        self.listeners.push(Arc::new(listener));
        Ok(())
    }

    /// The registered listeners. Useful for reading back ephemeral ports
    /// after `bind`.
    pub fn listeners(&self) -> &[Arc<Listener>] {
        &self.listeners
    }

    /// Bind every registered listener. A bind failure aborts the whole
    /// startup rather than serving a partial set.
    pub fn bind(&mut self) -> io::Result<()> {
        for listener in &self.listeners {
            listener.bind(true)?;
            info!(addr = %listener.addr(), "Listener bound");
        }
        Ok(())
    }

    /// Run a worker pool over the bound listeners until it shuts down.
    ///
    /// Returns the pool's exit status (0 clean, 1 if any worker thread
    /// failed). A server with no listeners has nothing to do and returns 0
    /// without building a pool.
    pub fn run(&mut self) -> io::Result<i32> {
        if self.listeners.is_empty() {
            warn!("No listeners configured, nothing to serve");
            return Ok(0);
        }

        let pool = WorkerPool::new(self.listeners.clone(), self.setup_signals);
        pool.run()
    }
}
