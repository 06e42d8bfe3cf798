//! Pool workers.
//!
//! Each worker loops `Idle → Fetching → Normalizing → Parsing → Emitting →
//! Idle` until it pops a [`Job::Shutdown`] sentinel (`Idle → Done`). Every
//! popped job is marked consumed on the ledger exactly once, whatever its
//! outcome.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::executor::{JobOutcome, JobRunner};
use crate::harvest::pipeline::HarvestError;
use crate::harvest::queue::{Job, JobReceiver, QueueLedger};
use crate::model::ParsedDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Idle,
    Fetching,
    Normalizing,
    Parsing,
    Emitting,
    Done,
}

/// One parsed document on the completion channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub label: String,
    pub document: ParsedDocument,
}

/// Everything a worker needs, built once per run and shared by the pool.
pub struct PipelineContext {
    pub jobs: Arc<JobReceiver>,
    pub ledger: Arc<QueueLedger>,
    pub results: mpsc::UnboundedSender<JobResult>,
    pub runner: JobRunner,
}

/// Per-worker counters returned when the worker exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub id: usize,
    pub jobs: usize,
    pub results: usize,
    pub dropped: usize,
}

pub struct Worker {
    id: usize,
    ctx: Arc<PipelineContext>,
    state: watch::Sender<WorkerState>,
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<PipelineContext>) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self { id, ctx, state }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Observes this worker's state transitions.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Consumes jobs until a sentinel arrives.
    ///
    /// # Errors
    ///
    /// [`HarvestError::QueueClosed`] if the queue closes before a sentinel
    /// is seen, [`HarvestError::ResultChannelClosed`] if results can no
    /// longer be emitted.
    pub async fn run(self) -> Result<WorkerReport, HarvestError> {
        let mut report = WorkerReport {
            id: self.id,
            ..Default::default()
        };
        debug!(worker = self.id, "Worker started");

        loop {
            self.set_state(WorkerState::Idle);
            let Some(job) = self.ctx.jobs.next().await else {
                warn!(worker = self.id, "Job queue closed before shutdown");
                return Err(HarvestError::QueueClosed);
            };

            let job = match job {
                Job::Shutdown => {
                    self.ctx.ledger.mark_consumed();
                    self.set_state(WorkerState::Done);
                    info!(
                        worker = self.id,
                        jobs = report.jobs,
                        results = report.results,
                        dropped = report.dropped,
                        "Worker exiting"
                    );
                    return Ok(report);
                }
                Job::Fetch(job) => job,
            };

            report.jobs += 1;
            let outcome = self.ctx.runner.run(&job, |s| self.set_state(s)).await;
            self.ctx.ledger.mark_consumed();

            match outcome {
                JobOutcome::Parsed { documents, .. } => {
                    self.set_state(WorkerState::Emitting);
                    for (label, document) in documents {
                        debug!(worker = self.id, label = %label, "Emitting result");
                        self.ctx
                            .results
                            .send(JobResult { label, document })
                            .map_err(|_| HarvestError::ResultChannelClosed)?;
                        report.results += 1;
                    }
                }
                JobOutcome::Dropped { attempts, error } => {
                    warn!(
                        worker = self.id,
                        output = %job.output,
                        attempts,
                        error = %error,
                        "Dropping job without result"
                    );
                    report.dropped += 1;
                }
            }
        }
    }
}
