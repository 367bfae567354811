//! Worker pool controller.
//!
//! A pool is built once per server run from the bound listeners. It puts
//! every listener into listening mode, spawns the configured floor of
//! worker threads per listener, optionally installs signal handling with a
//! dispatch thread that performs the forced-close fanout, grows dynamic
//! listeners' pools while all their workers are busy, and finally joins
//! everything and reports an aggregate exit status.

mod communicator;
mod worker;

pub use communicator::Communicator;
pub(crate) use worker::Worker;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::SpawnStrategy;
use crate::listener::Listener;
use crate::signal::{self, Signal};

/// Poll interval while waiting for spawned workers to report started.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Poll interval for the busy check of the dynamic-spawn monitor. Short,
/// to react quickly to load.
const BUSY_POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Poll interval of the signal dispatch thread.
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-listener bookkeeping inside the pool.
struct ListenerMeta {
    listener: Arc<Listener>,
    comm: Arc<Communicator>,
    /// Workers spawned at startup (configured count, clamped to max).
    floor: usize,
    /// Cap on workers under the dynamic strategy.
    max: usize,
    /// Still eligible for dynamic spawning.
    monitored: bool,
    /// Indices into the pool's thread collection.
    threads: Vec<usize>,
}

/// The controller owning all workers and threads of one server run.
///
/// `run` consumes the pool; a pool cannot be started twice.
pub struct WorkerPool {
    metas: Vec<ListenerMeta>,
    workers: Arc<Mutex<Vec<Arc<Worker>>>>,
    threads: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    setup_signals: bool,
}

impl WorkerPool {
    /// Build a pool from bound listeners, validating each listener's
    /// tunables. Misconfigured worker counts are clamped, not fatal.
    pub fn new(listeners: Vec<Arc<Listener>>, setup_signals: bool) -> Self {
        let metas = listeners
            .into_iter()
            .map(|listener| {
                let tunables = listener.tunables();
                let dynamic = tunables.strategy == SpawnStrategy::Dynamic;
                let mut floor = tunables.workers;
                let max = tunables.workers_max;

                if dynamic && floor > max {
                    error!(
                        addr = %listener.addr(),
                        configured = floor,
                        max,
                        "Configured workers exceed the maximum, clamping"
                    );
                    floor = max;
                } else if dynamic && floor == max {
                    warn!(
                        addr = %listener.addr(),
                        workers = floor,
                        "Dynamic pool with workers == max behaves as a static pool"
                    );
                }

                ListenerMeta {
                    comm: Arc::new(Communicator::new()),
                    monitored: dynamic && floor > 0 && floor < max,
                    listener,
                    floor,
                    max,
                    threads: Vec::new(),
                }
            })
            .collect();

        Self {
            metas,
            workers: Arc::new(Mutex::new(Vec::new())),
            threads: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            setup_signals,
        }
    }

    /// Run the pool to completion.
    ///
    /// Returns the aggregate exit status: 0 for a clean shutdown, 1 if any
    /// worker thread ended abnormally. Setup failures (listen, signal
    /// installation, thread spawning) propagate as errors instead.
    pub fn run(mut self) -> io::Result<i32> {
        if self.metas.is_empty() {
            info!("Worker pool has no listeners, nothing to run");
            return Ok(0);
        }

        for meta in &self.metas {
            meta.listener.listen(meta.listener.tunables().backlog)?;
            info!(
                addr = %meta.listener.addr(),
                workers = meta.floor,
                strategy = ?meta.listener.tunables().strategy,
                "Listener active"
            );
        }

        let dispatch = if self.setup_signals {
            Some(self.start_signal_dispatch()?)
        } else {
            None
        };

        for mi in 0..self.metas.len() {
            for _ in 0..self.metas[mi].floor {
                if let Err(e) = self.spawn_worker(mi) {
                    error!(error = %e, "Failed to spawn worker, aborting startup");
                    self.abort_startup();
                    if let Some(dispatch) = dispatch {
                        dispatch.finish();
                    }
                    return Err(e);
                }
            }
        }

        if self.metas.iter().any(|m| !m.threads.is_empty() && m.monitored) {
            self.wait_for_startup();
            self.monitor();
        }

        let mut join_failures = 0usize;
        for handle in std::mem::take(&mut self.threads) {
            let name = handle
                .thread()
                .name()
                .unwrap_or("worker")
                .to_string();
            if handle.join().is_err() {
                join_failures += 1;
                error!(thread = %name, "Worker thread terminated abnormally");
            }
        }

        if let Some(dispatch) = dispatch {
            dispatch.finish();
        }

        if join_failures > 0 {
            warn!(failed = join_failures, "Pool finished with failed workers");
            Ok(1)
        } else {
            info!("Pool finished cleanly");
            Ok(0)
        }
    }

    /// Spawn one worker thread for the listener at `meta_idx`.
    fn spawn_worker(&mut self, meta_idx: usize) -> io::Result<()> {
        let id = self.threads.len();
        let meta = &self.metas[meta_idx];
        let worker = Arc::new(Worker::new(
            id,
            Arc::clone(&meta.listener),
            Arc::clone(&meta.comm),
        ));

        let thread_worker = Arc::clone(&worker);
        let handle = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || thread_worker.run())?;

        lock(&self.workers).push(worker);
        self.threads.push(handle);
        self.metas[meta_idx].threads.push(id);
        Ok(())
    }

    /// Install the process signal handler and start the dispatch thread
    /// that reacts to an observed signal by forcing everything closed.
    fn start_signal_dispatch(&self) -> io::Result<SignalDispatch> {
        let guard = signal::install(&Signal::TERMINATION)?;

        let done = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::clone(&self.shutdown);
        let workers = Arc::clone(&self.workers);
        let listeners: Vec<Arc<Listener>> = self
            .metas
            .iter()
            .map(|m| Arc::clone(&m.listener))
            .collect();

        let thread_done = Arc::clone(&done);
        let handle = thread::Builder::new()
            .name("signal-dispatch".to_string())
            .spawn(move || {
                while !thread_done.load(Ordering::Acquire) {
                    if let Some(sig) = signal::take_pending() {
                        info!(signal = ?sig, "Termination signal received, shutting down pool");
                        shutdown.store(true, Ordering::Release);
                        for worker in lock(&workers).iter() {
                            worker.shutdown();
                        }
                        for listener in &listeners {
                            listener.ensure_closed_for_shutdown();
                            listener.shutdown_current_accepted();
                        }
                        break;
                    }
                    thread::sleep(SIGNAL_POLL_INTERVAL);
                }
            })?;

        Ok(SignalDispatch {
            guard,
            done,
            handle,
        })
    }

    /// Block until every spawned worker has reported started, with a
    /// coarse poll. Aborts early if a shutdown was observed.
    fn wait_for_startup(&self) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            let all_started = self
                .metas
                .iter()
                .all(|m| m.comm.started_count() >= m.threads.len());
            if all_started {
                return;
            }
            thread::sleep(STARTUP_POLL_INTERVAL);
        }
    }

    /// The dynamic-spawn loop: while any listener is still monitored, spawn
    /// one extra worker for a listener whose workers are all busy.
    ///
    /// The busy check is a racy snapshot by design; the heuristic only needs
    /// to be roughly right, and a worker count can never exceed the
    /// listener's max.
    fn monitor(&mut self) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }

            let mut any_monitored = false;
            for mi in 0..self.metas.len() {
                if !self.metas[mi].monitored {
                    continue;
                }

                let live = self.metas[mi]
                    .threads
                    .iter()
                    .any(|&ti| !self.threads[ti].is_finished());
                if !live {
                    debug!(
                        addr = %self.metas[mi].listener.addr(),
                        "Listener has no live workers, monitoring stopped"
                    );
                    self.metas[mi].monitored = false;
                    continue;
                }

                let spawned = self.metas[mi].threads.len();
                if self.metas[mi].comm.busy_count() >= spawned {
                    if spawned >= self.metas[mi].max {
                        info!(
                            addr = %self.metas[mi].listener.addr(),
                            max = self.metas[mi].max,
                            "Worker pool at maximum size, monitoring stopped"
                        );
                        self.metas[mi].monitored = false;
                    } else if let Err(e) = self.spawn_worker(mi) {
                        error!(
                            addr = %self.metas[mi].listener.addr(),
                            error = %e,
                            "Failed to spawn additional worker, monitoring stopped"
                        );
                        self.metas[mi].monitored = false;
                    } else {
                        debug!(
                            addr = %self.metas[mi].listener.addr(),
                            workers = spawned + 1,
                            "All workers busy, spawned another"
                        );
                    }
                }

                if self.metas[mi].monitored {
                    any_monitored = true;
                }
            }

            if !any_monitored {
                return;
            }
            thread::sleep(BUSY_POLL_INTERVAL);
        }
    }

    /// Startup failed mid-spawn: tear down whatever is already running.
    fn abort_startup(&mut self) {
        for worker in lock(&self.workers).iter() {
            worker.shutdown();
        }
        for meta in &self.metas {
            meta.listener.ensure_closed_for_shutdown();
        }
        for handle in std::mem::take(&mut self.threads) {
            let _ = handle.join();
        }
    }
}

/// Keeps the signal handler installed and the dispatch thread running for
/// the lifetime of a pool run.
struct SignalDispatch {
    guard: signal::SignalGuard,
    done: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl SignalDispatch {
    /// Stop the dispatch thread and restore the previous signal handlers.
    fn finish(self) {
        self.done.store(true, Ordering::Release);
        let _ = self.handle.join();
        drop(self.guard);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::ListenAddr;
    use crate::config::Tunables;
    use crate::connection::Connection;
    use crate::listener::Handler;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpStream};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Instant;

    /// Handler that records how many connections are in flight at once.
    struct LoadTracker {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl LoadTracker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn enter(&self) -> usize {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            now
        }

        fn exit(&self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }

        fn active(&self) -> usize {
            self.active.load(Ordering::SeqCst)
        }
    }

    fn bound_listener(tunables: Tunables, handler: Arc<Handler>) -> Arc<Listener> {
        let listener = Listener::new(
            ListenAddr::V4(Ipv4Addr::LOCALHOST, Some(0)),
            tunables,
            handler,
        )
        .unwrap();
        listener.bind(true).unwrap();
        Arc::new(listener)
    }

    fn tcp_addr(listener: &Listener) -> std::net::SocketAddr {
        listener.local_addr().unwrap().socket_addr().unwrap()
    }

    /// The pool's run thread puts the listener into listening mode; retry
    /// the connect briefly instead of racing it.
    fn connect_with_retry(addr: std::net::SocketAddr) -> TcpStream {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match TcpStream::connect(addr) {
                Ok(stream) => return stream,
                Err(e) if Instant::now() >= deadline => {
                    panic!("pool never started listening: {e}");
                }
                Err(_) => thread::sleep(Duration::from_millis(5)),
            }
        }
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_empty_pool_returns_zero() {
        let pool = WorkerPool::new(Vec::new(), false);
        assert_eq!(pool.run().unwrap(), 0);
    }

    #[test]
    fn test_clamps_configured_workers_to_max() {
        let tunables = Tunables {
            strategy: SpawnStrategy::Dynamic,
            workers: 5,
            workers_max: 2,
            ..Tunables::default()
        };
        let handler: Arc<Handler> = Arc::new(|_conn| Ok(()));
        let listener = bound_listener(tunables, handler);
        let pool = WorkerPool::new(vec![listener], false);

        assert_eq!(pool.metas[0].floor, 2);
        assert_eq!(pool.metas[0].max, 2);
        // degenerate dynamic pool is not monitored
        assert!(!pool.metas[0].monitored);
    }

    #[test]
    fn test_static_pool_serves_concurrent_clients() {
        let tracker = LoadTracker::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let handler_tracker = Arc::clone(&tracker);
        let handler_received = Arc::clone(&received);
        let handler: Arc<Handler> = Arc::new(move |conn: &mut Connection| {
            handler_tracker.enter();
            let mut buf = [0u8; 64];
            let n = conn.recv(&mut buf)?;
            lock(&handler_received).push(buf[..n].to_vec());

            // Hold the connection until both clients are in flight, so the
            // test observes two workers really running concurrently.
            let start = Instant::now();
            while handler_tracker.active() < 2 && start.elapsed() < Duration::from_secs(5) {
                thread::sleep(Duration::from_millis(5));
            }

            let result = conn.send_all(b"pong");
            handler_tracker.exit();
            result
        });

        let tunables = Tunables {
            strategy: SpawnStrategy::Static,
            workers: 2,
            workers_max: 2,
            timeout_secs: 10,
            ..Tunables::default()
        };
        let listener = bound_listener(tunables, handler);
        let addr = tcp_addr(&listener);

        let pool = WorkerPool::new(vec![Arc::clone(&listener)], false);
        let run = thread::spawn(move || pool.run());

        let mut clients = Vec::new();
        for _ in 0..2 {
            clients.push(thread::spawn(move || {
                let mut client = connect_with_retry(addr);
                client.write_all(b"ping").unwrap();
                let mut reply = Vec::new();
                client.read_to_end(&mut reply).unwrap();
                reply
            }));
        }
        for client in clients {
            assert_eq!(client.join().unwrap(), b"pong");
        }

        listener.ensure_closed_for_shutdown();
        assert_eq!(run.join().unwrap().unwrap(), 0);

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert!(received.iter().all(|msg| msg == b"ping"));
        // a static pool of two runs exactly two handlers at once
        assert_eq!(tracker.peak(), 2);
    }

    #[test]
    fn test_dynamic_pool_grows_to_max_and_no_further() {
        let tracker = LoadTracker::new();

        let handler_tracker = Arc::clone(&tracker);
        let handler: Arc<Handler> = Arc::new(move |conn: &mut Connection| {
            handler_tracker.enter();
            let mut buf = [0u8; 64];
            loop {
                match conn.recv(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(ref e) if Connection::is_timeout(e) => break,
                    Err(_) => break,
                }
            }
            handler_tracker.exit();
            Ok(())
        });

        let tunables = Tunables {
            strategy: SpawnStrategy::Dynamic,
            workers: 1,
            workers_max: 3,
            timeout_secs: 30,
            ..Tunables::default()
        };
        let listener = bound_listener(tunables, handler);
        let addr = tcp_addr(&listener);

        let pool = WorkerPool::new(vec![Arc::clone(&listener)], false);
        let run = thread::spawn(move || pool.run());

        // Three slow clients that connect and then just sit there.
        let clients: Vec<TcpStream> = (0..3).map(|_| connect_with_retry(addr)).collect();

        // The pool starts with one worker and grows one at a time while
        // everyone is busy, stopping at the max of three.
        assert!(
            wait_until(Duration::from_secs(10), || tracker.active() == 3),
            "pool never grew to three busy workers"
        );
        assert_eq!(tracker.peak(), 3);

        drop(clients);
        assert!(wait_until(Duration::from_secs(10), || tracker.active() == 0));
        // growth stopped at the max; no fourth worker ever appeared
        assert_eq!(tracker.peak(), 3);

        listener.ensure_closed_for_shutdown();
        assert_eq!(run.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_signal_shuts_down_pool_mid_handler() {
        let _serial = crate::signal::TEST_SIGNAL_LOCK.lock().unwrap();

        let tracker = LoadTracker::new();
        let handler_tracker = Arc::clone(&tracker);
        let handler: Arc<Handler> = Arc::new(move |conn: &mut Connection| {
            handler_tracker.enter();
            let mut buf = [0u8; 64];
            // Block until the forced close errors this read out.
            let _ = conn.recv(&mut buf);
            handler_tracker.exit();
            Ok(())
        });

        let tunables = Tunables {
            strategy: SpawnStrategy::Static,
            workers: 1,
            workers_max: 1,
            timeout_secs: 30,
            ..Tunables::default()
        };
        let listener = bound_listener(tunables, handler);
        let addr = tcp_addr(&listener);

        let pool = WorkerPool::new(vec![Arc::clone(&listener)], true);
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(pool.run());
        });

        let _client = connect_with_retry(addr);
        assert!(
            wait_until(Duration::from_secs(5), || tracker.active() == 1),
            "handler never started"
        );

        unsafe { libc::raise(libc::SIGTERM) };

        let status = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("pool did not shut down after the signal")
            .unwrap();
        assert_eq!(status, 0);
        assert_eq!(tracker.active(), 0);
    }
}
