//! Threading helpers with graceful shutdown support.
//!
//! Every long-lived stafford task -- collectors, listeners, timers -- runs on
//! a thread spawned here. The thread receives a `Shutdown` handle and is
//! expected to check it between cycles: shutdown never aborts a cycle in
//! flight, it only stops new ones from starting.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A one-way latch shared between a worker and whoever owns it.
///
/// Workers either poll `is_set` between units of work or park in
/// `wait_timeout`, which doubles as the task's periodic timer.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    /// Create an unsignaled latch.
    pub fn new() -> Shutdown {
        Shutdown {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Trip the latch and wake every waiter.
    pub fn signal(&self) {
        let (ref lock, ref cvar) = *self.inner;
        let mut stopped = lock.lock().unwrap();
        *stopped = true;
        cvar.notify_all();
    }

    /// True once the latch has been tripped.
    pub fn is_set(&self) -> bool {
        let (ref lock, _) = *self.inner;
        *lock.lock().unwrap()
    }

    /// Sleep for `dur` or until the latch trips, whichever comes first.
    ///
    /// Returns true when woken by shutdown, false when the timer ran out.
    pub fn wait_timeout(&self, dur: Duration) -> bool {
        let (ref lock, ref cvar) = *self.inner;
        let deadline = Instant::now() + dur;

        let mut stopped = lock.lock().unwrap();
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cvar.wait_timeout(stopped, deadline - now).unwrap();
            stopped = guard;
        }
        true
    }
}

impl Default for Shutdown {
    fn default() -> Shutdown {
        Shutdown::new()
    }
}

/// A spawned worker thread and its shutdown latch.
pub struct ThreadHandle {
    /// JoinHandle for the executing thread.
    pub handle: thread::JoinHandle<()>,

    stop: Shutdown,
}

/// Graceful shutdown interface, implemented by anything owning threads.
pub trait Stoppable {
    /// Block until the thread exits on its own.
    fn join(self);
    /// Signal shutdown, then block until the thread exits.
    fn shutdown(self);
}

/// Spawn a new worker executing the provided closure.
///
/// The closure receives the thread's `Shutdown` handle and is responsible
/// for observing it.
pub fn spawn<F>(f: F) -> ThreadHandle
where
    F: Send + 'static + FnOnce(Shutdown) -> (),
{
    let stop = Shutdown::new();
    let thread_stop = stop.clone();

    ThreadHandle {
        stop,
        handle: thread::spawn(move || {
            f(thread_stop);
        }),
    }
}

impl Stoppable for ThreadHandle {
    fn join(self) {
        self.handle.join().expect("failed to join child thread");
    }

    fn shutdown(self) {
        self.stop.signal();
        self.join();
    }
}

// Tests
//
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_wait_timeout_expires() {
        let stop = Shutdown::new();
        assert!(!stop.wait_timeout(Duration::from_millis(10)));
        assert!(!stop.is_set());
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let stop = Shutdown::new();
        let waiter = stop.clone();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));

        stop.signal();
        assert!(handle.join().unwrap());
        assert!(stop.is_set());
    }

    #[test]
    fn test_worker_observes_shutdown() {
        let handle = spawn(move |stop| {
            let mut beats = 0;
            while !stop.wait_timeout(Duration::from_millis(1)) {
                beats += 1;
                if beats > 10_000 {
                    panic!("shutdown never observed");
                }
            }
        });
        handle.shutdown();
    }
}
