//! Job queue shared by the worker pool, and the ledger that tracks when every
//! submitted job has been consumed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};

use crate::config::HarvestConfig;
use crate::harvest::formats::ParserMode;
use crate::harvest::pipeline::HarvestError;
use crate::model::CatalogEntry;

/// One retrieval to perform. Consumed exactly once by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchJob {
    pub uri: String,
    pub mode: ParserMode,

    /// Name given to the payload; results are reported under it
    pub output: String,

    pub timeout: Option<Duration>,
}

impl FetchJob {
    /// Seed job for the catalog index.
    pub fn index(config: &HarvestConfig) -> Self {
        Self {
            uri: config.index_uri(),
            mode: ParserMode::Index,
            output: "packages".to_string(),
            timeout: config.index_timeout(),
        }
    }

    pub fn detail(config: &HarvestConfig, entry: &CatalogEntry) -> Self {
        Self {
            uri: config.detail_uri(&entry.package, &entry.version),
            mode: ParserMode::Detail,
            output: entry.label(),
            timeout: config.detail_timeout(),
        }
    }
}

/// Item on the queue: real work, or the sentinel telling one worker to exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Fetch(FetchJob),
    Shutdown,
}

/// Submitted/consumed counters for the queue-drained condition.
///
/// Drained means every submitted job, sentinels included, has been marked
/// consumed. It is not the same as the queue being empty: a popped job is
/// still in flight until its worker marks it.
#[derive(Debug, Default)]
pub struct QueueLedger {
    submitted: AtomicUsize,
    consumed: AtomicUsize,
    changed: Notify,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub submitted: usize,
    pub consumed: usize,
}

impl QueueLedger {
    fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
    }

    fn retract_submitted(&self) {
        self.submitted.fetch_sub(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn mark_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn is_drained(&self) -> bool {
        self.consumed.load(Ordering::SeqCst) >= self.submitted.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            submitted: self.submitted.load(Ordering::SeqCst),
            consumed: self.consumed.load(Ordering::SeqCst),
        }
    }

    /// Resolves once the drained condition holds.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent `mark_consumed` is not missed.
            notified.as_mut().enable();
            if self.is_drained() {
                return;
            }
            notified.await;
        }
    }
}

enum Sender {
    Unbounded(mpsc::UnboundedSender<Job>),
    Bounded(mpsc::Sender<Job>),
}

enum Receiver {
    Unbounded(mpsc::UnboundedReceiver<Job>),
    Bounded(mpsc::Receiver<Job>),
}

/// Producer side of the job queue.
pub struct JobQueue {
    sender: Sender,
    ledger: Arc<QueueLedger>,
}

/// Consumer side, shared by all workers.
pub struct JobReceiver {
    receiver: Mutex<Receiver>,
}

/// Creates a job queue. `None` is unbounded; `Some(n)` makes
/// [`JobQueue::submit`] wait while `n` jobs are pending.
pub fn job_queue(capacity: Option<usize>) -> (JobQueue, Arc<JobReceiver>) {
    let (sender, receiver) = match capacity {
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (Sender::Unbounded(tx), Receiver::Unbounded(rx))
        }
        Some(n) => {
            let (tx, rx) = mpsc::channel(n.max(1));
            (Sender::Bounded(tx), Receiver::Bounded(rx))
        }
    };

    (
        JobQueue {
            sender,
            ledger: Arc::new(QueueLedger::default()),
        },
        Arc::new(JobReceiver {
            receiver: Mutex::new(receiver),
        }),
    )
}

impl JobQueue {
    /// Enqueues a job and counts it as submitted.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::QueueClosed`] if every receiver is gone.
    pub async fn submit(&self, job: Job) -> Result<(), HarvestError> {
        self.ledger.record_submitted();
        let sent = match &self.sender {
            Sender::Unbounded(tx) => tx.send(job).is_ok(),
            Sender::Bounded(tx) => tx.send(job).await.is_ok(),
        };
        if !sent {
            self.ledger.retract_submitted();
            return Err(HarvestError::QueueClosed);
        }
        Ok(())
    }

    pub fn ledger(&self) -> &Arc<QueueLedger> {
        &self.ledger
    }
}

impl JobReceiver {
    /// Waits for the next job. `None` once the queue is closed and empty.
    pub async fn next(&self) -> Option<Job> {
        let mut receiver = self.receiver.lock().await;
        match &mut *receiver {
            Receiver::Unbounded(rx) => rx.recv().await,
            Receiver::Bounded(rx) => rx.recv().await,
        }
    }
}
