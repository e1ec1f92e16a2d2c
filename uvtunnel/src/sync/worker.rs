//! Named worker threads with cooperative stop.
//!
//! A [`Worker`] owns one OS thread and a shared stop flag. Stopping sets the
//! flag, unparks the thread and joins it, except when called from the worker
//! thread itself, where joining would deadlock and is skipped.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;

use crate::trace::{debug, warn};

/// Stop flag handed to a worker's body.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once the owning [`Worker`] has been asked to stop.
    #[inline]
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Raises the flag. Does not wake a parked thread; see [`Worker::signal`].
    pub fn raise(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Sleeps for `period` unless stopped first.
    ///
    /// Returns `false` if the signal was raised before the period elapsed.
    /// Wakes early when the worker is unparked by [`Worker::signal`].
    pub fn sleep(&self, period: Duration) -> bool {
        let deadline = Instant::now() + period;
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::park_timeout(deadline - now);
        }
    }
}

/// Handle to a named background thread.
///
/// Dropping the handle stops and joins the thread.
pub struct Worker {
    name: String,
    stop: StopSignal,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns `body` on a new thread named `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to create the thread.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> io::Result<Self>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let name = name.into();
        let stop = StopSignal::new();
        let thread_stop = stop.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            debug!("worker started");
            body(thread_stop);
            debug!("worker exiting");
        })?;
        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }

    /// Raises the stop flag and unparks the thread without waiting.
    pub fn signal(&self) {
        self.stop.raise();
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    /// Signals the thread and waits for it to exit.
    ///
    /// Called from the worker's own thread, the join is skipped and the
    /// thread is left to unwind on its own.
    pub fn stop(&mut self) {
        self.signal();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            debug!(worker = %self.name, "stop requested from own thread, skipping join");
            return;
        }
        if handle.join().is_err() {
            warn!(worker = %self.name, "worker thread panicked");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("stopped", &self.stop.is_stopped())
            .field("joined", &self.handle.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn stop_joins_looping_worker() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let mut worker = Worker::spawn("test-loop", move |stop| {
            while stop.sleep(Duration::from_millis(1)) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        })
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        worker.stop();
        let after = ticks.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(ticks.load(Ordering::Relaxed), after);
    }

    #[test]
    fn sleep_wakes_early_on_signal() {
        let mut worker = Worker::spawn("test-sleeper", |stop| {
            assert!(!stop.sleep(Duration::from_secs(30)));
        })
        .unwrap();
        let start = Instant::now();
        worker.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stop_from_own_thread_does_not_deadlock() {
        let slot: Arc<Mutex<Option<Worker>>> = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        let done = Arc::new(AtomicBool::new(false));
        let done_flag = Arc::clone(&done);

        let worker = Worker::spawn("test-self-stop", move |stop| {
            while !stop.is_stopped() {
                if let Some(mut me) = inner.lock().unwrap().take() {
                    me.stop();
                }
                thread::sleep(Duration::from_millis(1));
            }
            done_flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        *slot.lock().unwrap() = Some(worker);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !done.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "worker never exited");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn thread_is_named() {
        let (tx, rx) = std::sync::mpsc::channel();
        let _worker = Worker::spawn("uvt-test-name", move |_| {
            tx.send(thread::current().name().map(str::to_owned)).unwrap();
        })
        .unwrap();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("uvt-test-name"));
    }
}
