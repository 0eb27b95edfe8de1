use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::error::{ProcessingError, ProcessingResult};
use super::processor::{EpisodeProcessor, ProcessingJob};
use crate::catalog::ConversionStatus;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub workers: usize,
    pub capacity: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub accepting: bool,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

/// Bounded job queue served by a fixed set of worker tasks.
#[derive(Debug)]
pub struct ProcessingQueue {
    sender: StdMutex<Option<mpsc::Sender<ProcessingJob>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    workers: usize,
    capacity: usize,
}

impl ProcessingQueue {
    /// Spawns `workers` tasks on the current runtime.
    pub fn start(processor: Arc<EpisodeProcessor>, workers: usize, capacity: usize) -> Self {
        let workers = workers.max(1);
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let handles = (0..workers)
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    Arc::clone(&processor),
                    Arc::clone(&receiver),
                    Arc::clone(&counters),
                ))
            })
            .collect();
        info!(workers, capacity, "processing queue started");

        Self {
            sender: StdMutex::new(Some(sender)),
            handles: Mutex::new(handles),
            counters,
            workers,
            capacity,
        }
    }

    /// Enqueues without waiting; fails with `QueueFull` when saturated.
    pub fn try_dispatch(&self, job: ProcessingJob) -> ProcessingResult<()> {
        let sender = self.sender()?;
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.counters.queued.fetch_sub(1, Ordering::SeqCst);
                match err {
                    mpsc::error::TrySendError::Full(job) => {
                        debug!(show = %job.show_id, episode = %job.episode_id, "processing queue full");
                        Err(ProcessingError::QueueFull {
                            capacity: self.capacity,
                        })
                    }
                    mpsc::error::TrySendError::Closed(_) => Err(ProcessingError::QueueClosed),
                }
            }
        }
    }

    /// Enqueues, waiting for room.
    pub async fn dispatch(&self, job: ProcessingJob) -> ProcessingResult<()> {
        let sender = self.sender()?;
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        if sender.send(job).await.is_err() {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(ProcessingError::QueueClosed);
        }
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        let accepting = self
            .sender
            .lock()
            .map(|sender| sender.is_some())
            .unwrap_or(false);
        QueueStats {
            workers: self.workers,
            capacity: self.capacity,
            queued: self.counters.queued.load(Ordering::SeqCst),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            succeeded: self.counters.succeeded.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            accepting,
        }
    }

    /// Stops accepting jobs, lets workers drain the queue and waits for them.
    pub async fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        drop(sender);
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "processing worker panicked");
            }
        }
        info!("processing queue drained");
    }

    fn sender(&self) -> ProcessingResult<mpsc::Sender<ProcessingJob>> {
        self.sender
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
            .ok_or(ProcessingError::QueueClosed)
    }
}

async fn run_worker(
    worker: usize,
    processor: Arc<EpisodeProcessor>,
    receiver: Arc<Mutex<mpsc::Receiver<ProcessingJob>>>,
    counters: Arc<Counters>,
) {
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(job) = job else {
            debug!(worker, "processing worker stopping");
            break;
        };
        counters.queued.fetch_sub(1, Ordering::SeqCst);
        counters.in_flight.fetch_add(1, Ordering::SeqCst);
        debug!(worker, show = %job.show_id, episode = %job.episode_id, "picked up job");

        let succeeded = match processor.process(&job).await {
            Ok(outcome) => outcome.status == ConversionStatus::Success,
            Err(err) => {
                error!(
                    worker,
                    show = %job.show_id,
                    episode = %job.episode_id,
                    error = %err,
                    "processing job could not run"
                );
                false
            }
        };
        if succeeded {
            counters.succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            counters.failed.fetch_add(1, Ordering::SeqCst);
        }
        counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
