//! Per-job execution: fetch → normalize → parse, with bounded retry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{error, instrument, warn};

use crate::harvest::formats::{archive, ParserMode};
use crate::harvest::queue::FetchJob;
use crate::harvest::worker::WorkerState;
use crate::model::{PackageDetail, ParsedDocument};
use crate::traits::{DownloadError, Fetcher, Payload};

/// Retries an operation in place. Every [`DownloadError`] is retried until
/// the attempt bound is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

/// How a retried operation ended.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success { value: T, attempts: u32 },

    /// Every attempt failed
    Exhausted { attempts: u32, last_error: DownloadError },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Success { attempts, .. } | RetryOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 100 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `op` (given the 1-based attempt number) until it succeeds or the
    /// attempt bound is reached. Each failure is logged.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => {
                    return RetryOutcome::Success {
                        value,
                        attempts: attempt,
                    }
                }
                Err(error) if attempt >= self.max_attempts => {
                    error!(
                        label,
                        attempts = attempt,
                        error = %error,
                        "Giving up after exhausting all attempts"
                    );
                    return RetryOutcome::Exhausted {
                        attempts: attempt,
                        last_error: error,
                    };
                }
                Err(error) => {
                    warn!(
                        label,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "Download failed, retrying"
                    );
                }
            }
        }
    }
}

/// Result of running one job.
#[derive(Debug)]
pub enum JobOutcome {
    /// One parsed document per payload member, labelled by member name
    Parsed {
        documents: Vec<(String, ParsedDocument)>,
        attempts: u32,
    },

    /// No result; the job still counts as consumed
    Dropped { attempts: u32, error: DownloadError },
}

/// Fetches, normalizes and parses jobs with a shared fetcher and retry policy.
#[derive(Clone)]
pub struct JobRunner {
    fetcher: Arc<dyn Fetcher>,
    retry: RetryPolicy,
}

impl JobRunner {
    pub fn new(fetcher: Arc<dyn Fetcher>, retry: RetryPolicy) -> Self {
        Self { fetcher, retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Runs a job to completion. `on_state` observes stage transitions.
    #[instrument(skip(self, job, on_state), fields(uri = %job.uri, output = %job.output))]
    pub async fn run<S>(&self, job: &FetchJob, on_state: S) -> JobOutcome
    where
        S: Fn(WorkerState) + Sync,
    {
        let on_state = &on_state;
        let outcome = self
            .retry
            .run(&job.output, move |_attempt| async move {
                on_state(WorkerState::Fetching);
                let payload = self.fetch(job).await?;
                on_state(WorkerState::Normalizing);
                normalize(payload).await
            })
            .await;

        match outcome {
            RetryOutcome::Success { value, attempts } => {
                on_state(WorkerState::Parsing);
                JobOutcome::Parsed {
                    documents: parse(job.mode, value).await,
                    attempts,
                }
            }
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => JobOutcome::Dropped {
                attempts,
                error: last_error,
            },
        }
    }

    /// Single retrieval bounded by the job's timeout.
    async fn fetch(&self, job: &FetchJob) -> Result<Payload, DownloadError> {
        let request = self.fetcher.fetch(&job.uri, &job.output, job.timeout);
        match job.timeout {
            None => request.await,
            Some(limit) => timeout(limit, request).await.map_err(|_| DownloadError::Timeout {
                uri: job.uri.clone(),
                timeout_ms: duration_ms(limit),
            })?,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn normalize(payload: Payload) -> Result<Vec<Payload>, DownloadError> {
    let name = payload.name.clone();
    tokio::task::spawn_blocking(move || archive::normalize(payload))
        .await
        .map_err(|e| DownloadError::Archive {
            name,
            message: format!("Task join error: {}", e),
        })?
}

/// Parses every member with the job's parser. Parsers are total, so a
/// crashed parse task degrades to empty documents as well.
async fn parse(mode: ParserMode, payloads: Vec<Payload>) -> Vec<(String, ParsedDocument)> {
    let names: Vec<String> = payloads.iter().map(|p| p.name.clone()).collect();
    let parsed = tokio::task::spawn_blocking(move || {
        payloads
            .into_iter()
            .map(|p| {
                let document = mode.parse(&p.bytes);
                (p.name, document)
            })
            .collect::<Vec<_>>()
    })
    .await;

    parsed.unwrap_or_else(|e| {
        error!(error = %e, "Parser task failed, ignoring its payloads");
        names
            .into_iter()
            .map(|name| {
                let empty = match mode {
                    ParserMode::Index => ParsedDocument::Index(Vec::new()),
                    ParserMode::Detail => ParsedDocument::Detail(PackageDetail::default()),
                };
                (name, empty)
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarvestConfig;
    use crate::model::CatalogEntry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Fails the first `failures` calls, then serves `body`.
    struct FlakyFetcher {
        failures: u32,
        calls: AtomicU32,
        body: &'static str,
    }

    #[async_trait]
    impl Fetcher for FlakyFetcher {
        async fn fetch(
            &self,
            uri: &str,
            output: &str,
            _timeout: Option<Duration>,
        ) -> Result<Payload, DownloadError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(DownloadError::Status {
                    uri: uri.to_string(),
                    status: 503,
                });
            }
            Ok(Payload::new(output, self.body.as_bytes().to_vec()))
        }
    }

    struct StallingFetcher;

    #[async_trait]
    impl Fetcher for StallingFetcher {
        async fn fetch(
            &self,
            _uri: &str,
            _output: &str,
            _timeout: Option<Duration>,
        ) -> Result<Payload, DownloadError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(DownloadError::Request {
                uri: String::new(),
                message: "unreachable".to_string(),
            })
        }
    }

    fn detail_job() -> FetchJob {
        FetchJob::detail(&HarvestConfig::default(), &CatalogEntry::new("foo", "1.0"))
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let policy = RetryPolicy::new(5);
        let mut seen = Vec::new();
        let outcome = policy
            .run("job", |attempt| {
                seen.push(attempt);
                async move {
                    if attempt < 3 {
                        Err(DownloadError::Request {
                            uri: "u".to_string(),
                            message: "reset".to_string(),
                        })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Success {
                value: 3,
                attempts: 3
            }
        ));
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_retry_exhausts_after_bound() {
        let policy = RetryPolicy::default();
        let mut calls = 0u32;
        let outcome: RetryOutcome<()> = policy
            .run("job", |_| {
                calls += 1;
                async {
                    Err(DownloadError::Status {
                        uri: "u".to_string(),
                        status: 500,
                    })
                }
            })
            .await;

        assert_eq!(calls, 100);
        assert_eq!(outcome.attempts(), 100);
        assert!(matches!(outcome, RetryOutcome::Exhausted { .. }));
    }

    #[tokio::test]
    async fn test_runner_parses_after_transient_failures() {
        let fetcher = Arc::new(FlakyFetcher {
            failures: 2,
            calls: AtomicU32::new(0),
            body: r#"<ul class="nodot"><li><strong>Home Page:</strong><span>https://foo.example</span></li></ul>"#,
        });
        let runner = JobRunner::new(fetcher.clone(), RetryPolicy::new(3));
        let states = Mutex::new(Vec::new());

        let outcome = runner
            .run(&detail_job(), |s| states.lock().unwrap().push(s))
            .await;

        let JobOutcome::Parsed {
            documents,
            attempts,
        } = outcome
        else {
            panic!("job should have been parsed");
        };
        assert_eq!(attempts, 3);
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].0, "foo-1.0");
        let ParsedDocument::Detail(detail) = &documents[0].1 else {
            panic!("detail job must yield a detail document");
        };
        assert_eq!(detail.info_text("Home Page"), Some("https://foo.example"));

        let states = states.into_inner().unwrap();
        assert_eq!(states.first(), Some(&WorkerState::Fetching));
        assert_eq!(states.last(), Some(&WorkerState::Parsing));
        assert!(states.contains(&WorkerState::Normalizing));
    }

    #[tokio::test]
    async fn test_runner_drops_job_when_exhausted() {
        let fetcher = Arc::new(FlakyFetcher {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            body: "",
        });
        let runner = JobRunner::new(fetcher.clone(), RetryPolicy::new(4));

        let outcome = runner.run(&detail_job(), |_| {}).await;
        assert!(matches!(outcome, JobOutcome::Dropped { attempts: 4, .. }));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);
    }

    /// Serves a gzip header followed by an invalid deflate block.
    struct CorruptFetcher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Fetcher for CorruptFetcher {
        async fn fetch(
            &self,
            _uri: &str,
            output: &str,
            _timeout: Option<Duration>,
        ) -> Result<Payload, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let bytes = vec![0x1f, 0x8b, 0x08, 0, 0, 0, 0, 0, 0, 0xff, 0xde, 0xad, 0xbe, 0xef];
            Ok(Payload::new(output, bytes))
        }
    }

    #[tokio::test]
    async fn test_decompress_failure_is_retried_to_bound() {
        let fetcher = Arc::new(CorruptFetcher {
            calls: AtomicU32::new(0),
        });
        let runner = JobRunner::new(fetcher.clone(), RetryPolicy::new(3));

        let outcome = runner.run(&detail_job(), |_| {}).await;
        let JobOutcome::Dropped { attempts, error } = outcome else {
            panic!("undecodable payload must be dropped");
        };
        assert_eq!(attempts, 3);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert!(matches!(error, DownloadError::Decompress { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_is_download_error() {
        let runner = JobRunner::new(Arc::new(StallingFetcher), RetryPolicy::new(2));
        let outcome = runner.run(&detail_job(), |_| {}).await;

        let JobOutcome::Dropped { attempts, error } = outcome else {
            panic!("stalled fetch must be dropped");
        };
        assert_eq!(attempts, 2);
        assert!(matches!(error, DownloadError::Timeout { timeout_ms: 2000, .. }));
    }
}
