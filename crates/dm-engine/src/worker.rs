//! Bounded worker pool for slow operations.
//!
//! Reboots, factory resets and firmware operations run here so that the
//! inbound delivery path only acknowledges and returns. A single worker
//! serializes those operations for one endpoint; a gateway shares one pool
//! sized for its devices.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{Error, Result};

type Job = BoxFuture<'static, ()>;

/// Fixed-size pool consuming a bounded job queue.
pub struct WorkerPool {
    name: String,
    size: usize,
    sender: async_channel::Sender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `size` workers sharing a queue of `capacity` jobs.
    ///
    /// Must run inside a tokio runtime.
    pub fn new(name: impl Into<String>, size: usize, capacity: usize) -> Self {
        let name = name.into();
        let size = size.max(1);
        let (sender, receiver) = async_channel::bounded::<Job>(capacity.max(1));

        let workers = (0..size)
            .map(|index| {
                let receiver = receiver.clone();
                let pool = name.clone();
                tokio::spawn(async move {
                    while let Ok(job) = receiver.recv().await {
                        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            error!(pool = %pool, worker = index, "job panicked");
                        }
                    }
                    debug!(pool = %pool, worker = index, "worker stopped");
                })
            })
            .collect();

        Self {
            name,
            size,
            sender,
            workers: Mutex::new(workers),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    /// Queue a job without waiting. Fails when the queue is full or closed.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.sender.try_send(job.boxed()).map_err(|e| match e {
            async_channel::TrySendError::Full(_) => {
                Error::Worker(format!("{}: queue full", self.name))
            }
            async_channel::TrySendError::Closed(_) => {
                Error::Worker(format!("{}: pool shut down", self.name))
            }
        })
    }

    /// Stop accepting jobs. Queued and running jobs still complete.
    pub fn shutdown(&self) {
        self.sender.close();
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.is_closed()
    }

    /// Wait for every worker to exit after [`shutdown`](Self::shutdown).
    pub async fn join(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            worker.await.ok();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.close();
    }
}
