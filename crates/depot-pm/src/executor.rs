//! Bounded worker pool
//!
//! Manifest loads, repository fetches and artifact downloads run on a fixed
//! set of named worker threads fed by a crossbeam channel. Every submission
//! returns a [`TaskHandle`] that can be awaited or waited on synchronously.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors observed by a task handle
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The pool shut down before the task ran
    #[error("task was cancelled before completion")]
    Cancelled,

    #[error("task panicked: {0}")]
    Panicked(String),
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads
pub struct Executor {
    work_tx: Mutex<Option<Sender<Job>>>,
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl Executor {
    /// Start `size` workers (at least one)
    pub fn new(size: usize) -> std::io::Result<Self> {
        let size = size.max(1);
        let (work_tx, work_rx) = channel::unbounded::<Job>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let rx = work_rx.clone();
            let shutdown = shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("depot-worker-{}", i))
                .spawn(move || Self::worker_loop(rx, shutdown))?;
            handles.push(handle);
        }

        Ok(Executor {
            work_tx: Mutex::new(Some(work_tx)),
            shutdown,
            handles: Mutex::new(handles),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn worker_loop(work_rx: Receiver<Job>, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Acquire) {
            let job = match work_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(job) => job,
                Err(channel::RecvTimeoutError::Timeout) => continue,
                Err(channel::RecvTimeoutError::Disconnected) => break,
            };
            job();
        }
    }

    /// Run `f` on the pool without a handle
    ///
    /// Returns `false` if the pool has shut down and the job was dropped.
    pub fn execute<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.work_tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(Box::new(f)).is_ok(),
            None => false,
        }
    }

    /// Run `f` on the pool
    pub fn spawn<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(move || {
            let _ = tx.send(catch_panic(f));
        });
        TaskHandle { rx }
    }

    /// Stop accepting work and join the workers
    ///
    /// Jobs already queued may be dropped; their handles report
    /// [`TaskError::Cancelled`].
    pub fn shutdown(&self) {
        self.work_tx.lock().take();
        self.shutdown.store(true, Ordering::Release);
        let current = thread::current().id();
        for handle in self.handles.lock().drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run `f` on a dedicated named thread
///
/// Used for top-level operations that themselves fan work out to an
/// [`Executor`] and must not occupy one of its workers while waiting.
pub fn spawn_detached<T, F>(name: &str, f: F) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
        let _ = tx.send(catch_panic(f));
    });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "Failed to spawn operation thread");
    }
    TaskHandle { rx }
}

fn catch_panic<T, F>(f: F) -> Result<T, TaskError>
where
    F: FnOnce() -> T,
{
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        TaskError::Panicked(message)
    })
}

/// Result of a submitted task
///
/// Implements [`Future`] for async callers; [`TaskHandle::wait`] blocks the
/// current thread and must not be called from inside an async runtime.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    pub fn wait(self) -> Result<T, TaskError> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(TaskError::Cancelled),
        }
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(TaskError::Cancelled),
        })
    }
}

/// Wait for every handle, preserving submission order
pub fn wait_all<T>(handles: Vec<TaskHandle<T>>) -> Vec<Result<T, TaskError>> {
    handles.into_iter().map(TaskHandle::wait).collect()
}
