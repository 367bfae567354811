//! Shared counters coordinating one listener's workers with the pool.
//!
//! Two counters per listener: `started` (incremented once per worker on
//! entering its run loop, never decremented) and `busy` (tracks workers
//! currently inside a handler). All operations are lock-free; readers get
//! eventually-consistent values, which is all the dynamic-spawn heuristic
//! needs.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-listener start/busy counters, shared between the pool controller
/// and every worker bound to that listener.
#[derive(Debug, Default)]
pub struct Communicator {
    started: AtomicUsize,
    busy: AtomicUsize,
}

impl Communicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A worker has entered its run loop. Called exactly once per worker.
    pub fn notify_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    /// A worker has begun handling an accepted connection.
    pub fn notify_busy(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
    }

    /// A worker's handler has returned.
    pub fn notify_idle(&self) {
        self.busy.fetch_sub(1, Ordering::Relaxed);
    }

    /// Number of workers that have entered their run loop.
    pub fn started_count(&self) -> usize {
        self.started.load(Ordering::Relaxed)
    }

    /// Number of workers currently inside a handler.
    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counters_track_notifications() {
        let comm = Communicator::new();
        assert_eq!(comm.started_count(), 0);
        assert_eq!(comm.busy_count(), 0);

        comm.notify_started();
        comm.notify_busy();
        assert_eq!(comm.started_count(), 1);
        assert_eq!(comm.busy_count(), 1);

        comm.notify_idle();
        assert_eq!(comm.busy_count(), 0);
        // started never decrements
        assert_eq!(comm.started_count(), 1);
    }

    #[test]
    fn test_concurrent_updates() {
        let comm = Arc::new(Communicator::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let comm = Arc::clone(&comm);
            handles.push(thread::spawn(move || {
                comm.notify_started();
                for _ in 0..1000 {
                    comm.notify_busy();
                    comm.notify_idle();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(comm.started_count(), 8);
        assert_eq!(comm.busy_count(), 0);
    }
}
