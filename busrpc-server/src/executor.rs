//! Request executors.
//!
//! The server hands every admitted request to an [`Executor`]. The default
//! [`WorkerPool`] runs a fixed number of worker tasks fed by a bounded queue;
//! once the queue is full, submission waits, which in turn stops the server
//! from taking more messages off the broker.

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Unit of work handed to an executor.
pub type Task = BoxFuture<'static, ()>;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor is shut down")]
    Shutdown,
}

/// Runs request tasks.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Queues a task. May wait while the executor is saturated.
    async fn submit(&self, task: Task) -> Result<(), ExecutorError>;

    /// Stops accepting tasks. Queued tasks still run.
    fn shutdown(&self);

    /// Waits for queued and running tasks to finish. Returns false on timeout.
    async fn await_termination(&self, timeout: Duration) -> bool;

    /// Drops queued tasks and aborts running ones.
    fn shutdown_now(&self);

    fn is_shutdown(&self) -> bool;
}

/// Fixed-size pool of worker tasks with a bounded queue.
///
/// Workers are spawned on the first submission.
pub struct WorkerPool {
    worker_count: usize,
    queue_len: usize,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool. Zero values are raised to one.
    pub fn new(worker_count: usize, queue_len: usize) -> Self {
        let worker_count = worker_count.max(1);
        let queue_len = queue_len.max(1);
        let (sender, receiver) = mpsc::channel(queue_len);
        Self {
            worker_count,
            queue_len,
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn queue_len(&self) -> usize {
        self.queue_len
    }

    fn ensure_started(&self) {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let mut workers = self.workers.lock();
        for id in 0..self.worker_count {
            let receiver = Arc::clone(&self.receiver);
            workers.push(tokio::spawn(run_worker(id, receiver)));
        }
        tracing::debug!("Started {} workers", self.worker_count);
    }
}

async fn run_worker(id: usize, receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>) {
    loop {
        let task = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };

        match task {
            Some(task) => {
                if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                    tracing::error!("Worker {} task panicked", id);
                }
            }
            None => break,
        }
    }
    tracing::trace!("Worker {} exiting", id);
}

#[async_trait]
impl Executor for WorkerPool {
    async fn submit(&self, task: Task) -> Result<(), ExecutorError> {
        let sender = self.sender.lock().clone().ok_or(ExecutorError::Shutdown)?;
        self.ensure_started();
        sender.send(task).await.map_err(|_| ExecutorError::Shutdown)
    }

    fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            tracing::debug!("Worker pool shutting down");
        }
    }

    async fn await_termination(&self, timeout: Duration) -> bool {
        let mut handles = std::mem::take(&mut *self.workers.lock());
        let finished = tokio::time::timeout(timeout, join_all(handles.iter_mut()))
            .await
            .is_ok();
        if !finished {
            self.workers.lock().extend(handles);
        }
        finished
    }

    fn shutdown_now(&self) {
        self.shutdown();
        if let Ok(mut receiver) = self.receiver.try_lock() {
            receiver.close();
        }
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
    }

    fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in self.workers.get_mut().drain(..) {
            handle.abort();
        }
    }
}
