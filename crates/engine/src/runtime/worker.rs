//! Worker queue — a single background task draining enqueued maintenance
//! jobs in order. Shutdown waits for the queue to empty.

use std::future::Future;
use std::pin::Pin;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) struct Worker {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn start() -> Worker {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let handle = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job.await;
            }
            tracing::debug!("worker queue drained");
        });
        Worker {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a job. Jobs submitted after shutdown are dropped with a
    /// warning.
    pub fn enqueue<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.sender.lock().as_ref() {
            Some(sender) => {
                if sender.send(Box::pin(job)).is_err() {
                    tracing::warn!("worker task is gone; dropping enqueued job");
                }
            }
            None => tracing::warn!("worker queue is shut down; dropping enqueued job"),
        }
    }

    /// Close the queue and wait for queued jobs to finish.
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker task panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_jobs_run_in_order_and_drain() {
        let worker = Worker::start();
        let counter = Arc::new(AtomicU32::new(0));
        for expected in 0..10u32 {
            let counter = Arc::clone(&counter);
            worker.enqueue(async move {
                // Each job observes exactly the jobs before it.
                assert_eq!(counter.fetch_add(1, Ordering::SeqCst), expected);
            });
        }
        worker.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_dropped() {
        let worker = Worker::start();
        worker.shutdown().await;
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        worker.enqueue(async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
