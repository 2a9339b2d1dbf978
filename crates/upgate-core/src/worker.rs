//! Dedicated background worker that runs submitted jobs one at a time.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use futures_util::FutureExt;
use log::{debug, error};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::task::TaskTracker;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("{0} worker requires a running Tokio runtime")]
    NoRuntime(&'static str),
    #[error("{0} worker has been shut down")]
    ShutDown(&'static str),
    #[error("{0} worker job aborted before producing a result")]
    Aborted(&'static str),
}

/// Owns one task that drains a job queue in submission order. A job submitted
/// while another is running waits for it; two jobs never overlap.
#[derive(Debug)]
pub struct Worker {
    name: &'static str,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    tracker: TaskTracker,
}

impl Worker {
    /// Spawn the worker task on the current Tokio runtime.
    ///
    /// # Errors
    /// Returns [`WorkerError::NoRuntime`] when called outside a runtime.
    pub fn spawn(name: &'static str) -> Result<Self, WorkerError> {
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| WorkerError::NoRuntime(name))?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let tracker = TaskTracker::new();

        tracker.spawn_on(
            async move {
                while let Some(job) = receiver.recv().await {
                    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                        error!("{name} worker job panicked; continuing with next job");
                    }
                }
                debug!("{name} worker stopped");
            },
            &handle,
        );
        tracker.close();

        debug!("{name} worker started");
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            tracker,
        })
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queue `job` and wait for its output.
    ///
    /// # Errors
    /// Returns [`WorkerError::ShutDown`] if the worker no longer accepts work
    /// and [`WorkerError::Aborted`] if the job panicked.
    pub async fn run<F, T>(&self, job: F) -> Result<T, WorkerError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let wrapped: Job = Box::pin(async move {
            let output = job.await;
            let _ = result_tx.send(output);
        });

        {
            let guard = self
                .sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let sender = guard.as_ref().ok_or(WorkerError::ShutDown(self.name))?;
            sender
                .send(wrapped)
                .map_err(|_| WorkerError::ShutDown(self.name))?;
        }

        result_rx.await.map_err(|_| WorkerError::Aborted(self.name))
    }

    /// Stop accepting new jobs. Jobs already queued still run.
    pub fn shutdown(&self) {
        let previous = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            debug!("{} worker shutting down", self.name);
        }
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Wait until the worker task has exited. Only completes after
    /// [`Worker::shutdown`] and once every queued job has finished.
    pub async fn drained(&self) {
        self.tracker.wait().await;
    }
}
