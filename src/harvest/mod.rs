//! Harvest module - concurrent catalog fetch and parse pipeline.
//!
//! - **Queue**: [`queue::JobQueue`] plus the [`queue::QueueLedger`] used for
//!   drain detection
//! - **Workers**: fixed pool of [`worker::Worker`]s sharing one queue
//! - **Formats**: payload normalization and the index/detail parsers
//! - **Pipeline**: [`pipeline::Harvester`] drives a run end to end

pub mod formats;
pub mod pipeline;
pub mod queue;
pub mod worker;

// Re-export commonly used types
pub use formats::ParserMode;
pub use pipeline::{Aggregator, HarvestError, HarvestOutput, HarvestStats, Harvester};
pub use queue::{job_queue, FetchJob, Job, JobQueue, JobReceiver, QueueLedger};
pub use worker::{JobResult, PipelineContext, Worker, WorkerReport, WorkerState};
