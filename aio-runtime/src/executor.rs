//! Listener Executor
//!
//! Completion listeners are user code of arbitrary duration. When an
//! executor is configured, a completing thread (result-handler worker,
//! timer thread, issuing caller) hands the listener off instead of running
//! it inline.
//!
//! [`ThreadPoolExecutor`] is a fixed set of named threads draining an
//! unbounded `crossbeam-channel` queue.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{self as cc, Sender};
use parking_lot::Mutex;

use crate::panic::run_isolated;

/// A unit of listener work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs listener tasks off the completing thread.
pub trait ListenerExecutor: Send + Sync {
    /// Submit `task`. A rejected task is handed back so the caller can run
    /// it inline.
    fn execute(&self, task: Task) -> Result<(), Task>;

    /// Stop accepting work and wait for queued tasks to finish.
    fn shutdown(&self) {}
}

/// Fixed-size pool of listener threads.
pub struct ThreadPoolExecutor {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    executed: std::sync::Arc<AtomicU64>,
}

impl ThreadPoolExecutor {
    /// Start `threads` worker threads (at least one).
    pub fn new(threads: usize) -> io::Result<Self> {
        let (tx, rx) = cc::unbounded::<Task>();
        let executed = std::sync::Arc::new(AtomicU64::new(0));
        let mut workers = Vec::with_capacity(threads.max(1));
        for id in 0..threads.max(1) {
            let rx = rx.clone();
            let executed = executed.clone();
            let handle = thread::Builder::new()
                .name(format!("aio-listener-{id}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        run_isolated("completion listener", task);
                        executed.fetch_add(1, Ordering::Relaxed);
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            executed,
        })
    }

    /// Tasks run to completion or contained panic.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

impl ListenerExecutor for ThreadPoolExecutor {
    fn execute(&self, task: Task) -> Result<(), Task> {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(task).map_err(|err| err.into_inner()),
            None => Err(task),
        }
    }

    fn shutdown(&self) {
        // Dropping the sender disconnects the queue once it drains.
        drop(self.sender.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!(target: crate::log::targets::ENGINE, "listener thread panicked");
            }
        }
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("threads", &self.workers.lock().len())
            .field("executed", &self.executed())
            .finish()
    }
}
