//! Thread pool with a shared, pollable stop signal.
//!
//! One pool per session. Workers are named, detached OS threads that all
//! observe the same [`StopHandle`]; the handle doubles as a file descriptor
//! so blocking I/O can wait on it together with a transport descriptor.
//!
//! Lifecycle:
//! - [`ThreadPool::stop`] raises the signal exactly once (idempotent)
//! - [`ThreadPool::stop_and_wait`] additionally blocks until every worker
//!   has exited. It must never be called from inside a pool worker.
//! - [`ThreadPool::restart`] re-arms a drained pool so it can spawn again.

use std::io::Write;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use mio::unix::pipe;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::Result;

/// One generation of the stop signal: a flag plus a pipe whose read end
/// becomes (and stays) readable once the signal is raised.
struct StopGeneration {
    raised: AtomicBool,
    tx: Mutex<pipe::Sender>,
    rx: pipe::Receiver,
}

impl StopGeneration {
    fn new() -> std::io::Result<Self> {
        let (tx, rx) = pipe::new()?;
        Ok(Self {
            raised: AtomicBool::new(false),
            tx: Mutex::new(tx),
            rx,
        })
    }

    fn raise(&self) {
        // The flag is set before the pipe byte so a waker that observed the
        // readable fd always sees `raised == true`.
        if !self.raised.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.tx.lock().write(&[1]) {
                warn!("stop pipe write failed: {e}");
            }
        }
    }
}

/// Cloneable view of the pool's stop signal.
///
/// Captured by each worker at spawn time; a pool restart hands out a fresh
/// generation, so workers of the previous generation keep seeing the signal
/// that stopped them.
#[derive(Clone)]
pub struct StopHandle {
    gen: Arc<StopGeneration>,
}

impl StopHandle {
    /// Whether the signal has been raised.
    #[inline]
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.gen.raised.load(Ordering::SeqCst)
    }

    /// Raise the signal. Idempotent.
    pub fn raise(&self) {
        self.gen.raise();
    }

    /// Raw descriptor that becomes readable when the signal is raised.
    ///
    /// Register it with a `mio::Poll` via `SourceFd`; the byte is never
    /// consumed, so the descriptor stays readable for every poller.
    #[must_use]
    pub fn poll_fd(&self) -> RawFd {
        self.gen.rx.as_raw_fd()
    }
}

struct PoolInner {
    current: RwLock<Arc<StopGeneration>>,
    active: Mutex<usize>,
    drained: Condvar,
}

/// Spawns named, detached workers sharing one stop signal.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

/// Fires the worker-exit bookkeeping on every exit path, panics included.
struct ExitGuard {
    inner: Arc<PoolInner>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let mut active = self.inner.active.lock();
        *active -= 1;
        if *active == 0 {
            self.inner.drained.notify_all();
        }
    }
}

impl ThreadPool {
    /// Create an armed, empty pool.
    pub fn new() -> Result<Self> {
        let gen = StopGeneration::new()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                current: RwLock::new(Arc::new(gen)),
                active: Mutex::new(0),
                drained: Condvar::new(),
            }),
        })
    }

    /// Start a detached worker named `name`.
    ///
    /// The worker receives a [`StopHandle`] bound to the pool generation
    /// that was current at spawn time.
    pub fn spawn<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(StopHandle) + Send + 'static,
    {
        let stop = self.stop_handle();
        *self.inner.active.lock() += 1;
        let guard = ExitGuard {
            inner: Arc::clone(&self.inner),
        };

        // On spawn failure the closure (and with it the guard) is dropped,
        // which undoes the count above.
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = guard;
                f(stop);
            })?;
        Ok(())
    }

    /// Raise the pool's stop signal. Idempotent, non-blocking.
    pub fn stop(&self) {
        self.inner.current.read().raise();
    }

    /// Raise the stop signal and block until every worker has exited.
    ///
    /// Deadlocks if called from inside a pool worker; callers must ensure
    /// they are on an outside thread.
    pub fn stop_and_wait(&self) {
        self.stop();
        let mut active = self.inner.active.lock();
        while *active > 0 {
            self.inner.drained.wait(&mut active);
        }
        debug!("thread pool drained");
    }

    /// Re-arm a drained pool with a fresh stop generation.
    pub fn restart(&self) -> Result<()> {
        let gen = StopGeneration::new()?;
        *self.inner.current.write() = Arc::new(gen);
        Ok(())
    }

    /// Whether the current generation's signal has been raised.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.current.read().raised.load(Ordering::SeqCst)
    }

    /// Handle onto the current stop generation.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            gen: Arc::clone(&self.inner.current.read()),
        }
    }

    /// Number of live workers.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        *self.inner.active.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_stop_and_wait_drains_workers() {
        let pool = ThreadPool::new().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let ran = Arc::clone(&ran);
            pool.spawn(&format!("worker-{i}"), move |stop| {
                while !stop.is_raised() {
                    thread::sleep(Duration::from_millis(1));
                }
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.stop_and_wait();
        assert_eq!(ran.load(Ordering::SeqCst), 4);
        assert_eq!(pool.active_workers(), 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let pool = ThreadPool::new().unwrap();
        pool.stop();
        pool.stop();
        assert!(pool.is_stopped());
        pool.stop_and_wait();
    }

    #[test]
    fn test_restart_rearms_signal() {
        let pool = ThreadPool::new().unwrap();
        pool.stop_and_wait();
        assert!(pool.is_stopped());

        pool.restart().unwrap();
        assert!(!pool.is_stopped());

        let saw_stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&saw_stop);
        pool.spawn("restarted", move |stop| {
            while !stop.is_raised() {
                thread::sleep(Duration::from_millis(1));
            }
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        pool.stop_and_wait();
        assert!(saw_stop.load(Ordering::SeqCst));
    }

    #[test]
    fn test_old_generation_unaffected_by_restart() {
        let pool = ThreadPool::new().unwrap();
        let old = pool.stop_handle();
        pool.stop_and_wait();
        pool.restart().unwrap();
        assert!(old.is_raised());
        assert!(!pool.is_stopped());
    }

    #[test]
    fn test_worker_panic_still_counts_as_exit() {
        let pool = ThreadPool::new().unwrap();
        pool.spawn("panicker", |_stop| panic!("boom")).unwrap();
        // Must not hang: the exit guard runs during unwind.
        pool.stop_and_wait();
        assert_eq!(pool.active_workers(), 0);
    }

    #[test]
    fn test_stop_fd_becomes_readable() {
        use mio::unix::SourceFd;
        use mio::{Events, Interest, Poll, Token};

        let pool = ThreadPool::new().unwrap();
        let stop = pool.stop_handle();

        let mut poll = Poll::new().unwrap();
        let mut events = Events::with_capacity(4);
        poll.registry()
            .register(&mut SourceFd(&stop.poll_fd()), Token(0), Interest::READABLE)
            .unwrap();

        pool.stop();
        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(events.iter().next().is_some());
        assert!(stop.is_raised());
    }
}
