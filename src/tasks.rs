//! Background workers.
//!
//! Long-lived loops sleep through [`Shutdown::wait`] instead of `thread::sleep`,
//! so a stop request wakes them immediately.
use std::{
    sync::{Arc, Condvar, Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

/// Shortest interval a [`PeriodicTask`] runs at.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Process-wide stop signal.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for `timeout` or until triggered. Returns whether the signal fired.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut stopped = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            stopped = cvar
                .wait_timeout(stopped, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *stopped
    }
}

pub type Job = Box<dyn FnMut() + Send + 'static>;

/// A named thread running a job at a fixed interval until dropped.
///
/// The first run happens one interval after spawning. Intervals below
/// [`MIN_INTERVAL`] are raised to it. Dropping the task stops it between runs and
/// joins the thread.
#[derive(Debug)]
pub struct PeriodicTask {
    name: String,
    shutdown: Shutdown,
    thread: Option<thread::JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: &str, interval: Duration, job: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        if interval < MIN_INTERVAL {
            warn!("task {name}: interval {interval:?} raised to {MIN_INTERVAL:?}");
        }
        let interval = interval.max(MIN_INTERVAL);

        let mut job: Job = Box::new(job);
        let shutdown = Shutdown::new();
        let signal = shutdown.clone();
        let task = name.to_string();
        let thread = thread::spawn(move || {
            debug!("task {task} started, running every {interval:?}");
            while !signal.wait(interval) {
                debug!("task {task} running");
                job();
            }
            debug!("task {task} stopped");
        });

        Self {
            name: name.to_string(),
            shutdown,
            thread: Some(thread),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.shutdown.trigger();

        if let Some(thread) = self.thread.take() {
            info!("shutting down task {}", self.name);
            if thread.join().is_err() {
                error!("task {} panicked", self.name);
            }
        }
    }
}
