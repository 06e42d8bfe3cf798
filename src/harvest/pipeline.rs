//! Harvest pipeline coordinator.
//!
//! This module provides the [`Harvester`] that runs one harvest:
//! - Discovers the catalog index via the seed job
//! - Enumerates releases and enqueues one detail job per `(package, version)`
//! - Drives a fixed pool of [`Worker`]s over the shared job queue
//! - Waits for the queue-drained condition, then lets the [`Aggregator`]
//!   empty the completion channel into the [`AggregateStore`]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::config::HarvestConfig;
use crate::executor::{JobOutcome, JobRunner, RetryPolicy};
use crate::harvest::queue::{job_queue, FetchJob, Job, QueueLedger};
use crate::harvest::worker::{JobResult, PipelineContext, Worker, WorkerReport};
use crate::model::{AggregateStore, Catalog, CatalogEntry, ParsedDocument};
use crate::traits::{Fetcher, ReleaseSource, SinkError};

// ============================================================================
// Errors
// ============================================================================

/// Failures that end a run. Everything else degrades per job.
#[derive(thiserror::Error, Debug)]
pub enum HarvestError {
    /// The job queue has no consumer or no producer left
    #[error("Job queue closed unexpectedly")]
    QueueClosed,

    /// The completion channel has no receiver left
    #[error("Result channel closed unexpectedly")]
    ResultChannelClosed,

    #[error("Worker task failed: {0}")]
    WorkerPanicked(String),

    #[error("Persistence failed: {0}")]
    Sink(#[from] SinkError),
}

// ============================================================================
// Aggregator
// ============================================================================

/// Owns the authoritative store. Mutated from the coordinating task only.
#[derive(Debug, Default)]
pub struct Aggregator {
    labels: HashMap<String, CatalogEntry>,
    store: AggregateStore,
    duplicates: usize,
    unmatched: usize,
    collisions: usize,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entry and returns the label its detail result will carry,
    /// or `None` if the label is already taken. Results are matched by label,
    /// so a distinct entry whose label collides (`foo-1`/`0` vs `foo`/`1-0`)
    /// is skipped as well.
    pub fn register(&mut self, entry: CatalogEntry) -> Option<String> {
        let label = entry.label();
        if let Some(existing) = self.labels.get(&label) {
            if *existing != entry {
                warn!(
                    label = %label,
                    registered = ?existing,
                    skipped = ?entry,
                    "Label collision between distinct entries, skipping the later one"
                );
                self.collisions += 1;
            }
            return None;
        }
        self.labels.insert(label.clone(), entry);
        Some(label)
    }

    /// Folds one result into the store. At most one detail is kept per entry.
    pub fn merge(&mut self, result: JobResult) {
        let JobResult { label, document } = result;
        let ParsedDocument::Detail(detail) = document else {
            debug!(label = %label, "Ignoring non-detail result");
            self.unmatched += 1;
            return;
        };
        let Some(entry) = self.labels.get(&label) else {
            debug!(label = %label, "Ignoring result for an unregistered label");
            self.unmatched += 1;
            return;
        };
        if self.store.contains_key(entry) {
            warn!(label = %label, "Duplicate result, keeping the first one");
            self.duplicates += 1;
            return;
        }
        self.store.insert(entry.clone(), detail);
    }

    /// Waits for the queue-drained condition, then empties the completion
    /// channel. An empty channel is confirmed once more after `poll` before
    /// the stream is treated as final. Returns the number of results received.
    pub async fn drain(
        &mut self,
        results: &mut mpsc::UnboundedReceiver<JobResult>,
        ledger: &QueueLedger,
        poll: Duration,
    ) -> usize {
        ledger.wait_drained().await;
        info!(remaining = results.len(), "Queue drained, emptying result channel");

        let mut received = 0;
        loop {
            match results.try_recv() {
                Ok(result) => {
                    self.merge(result);
                    received += 1;
                }
                Err(TryRecvError::Empty) => {
                    tokio::time::sleep(poll).await;
                    if results.is_empty() {
                        break;
                    }
                    info!(
                        remaining = results.len(),
                        "Emptying queue: estimated queue length left"
                    );
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }
        received
    }

    pub fn store(&self) -> &AggregateStore {
        &self.store
    }

    pub fn into_store(self) -> AggregateStore {
        self.store
    }
}

// ============================================================================
// Harvester
// ============================================================================

/// Statistics about one run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct HarvestStats {
    pub total_duration_ms: u64,
    pub workers: usize,
    pub packages_discovered: usize,
    pub entries_enqueued: usize,

    /// Jobs submitted to the queue, sentinels included
    pub jobs_submitted: usize,
    pub jobs_consumed: usize,
    pub jobs_dropped: usize,
    pub results_received: usize,
    pub duplicates: usize,
    pub unmatched: usize,

    /// Distinct entries skipped because their label was already taken
    pub label_collisions: usize,
}

/// Outcome of [`Harvester::harvest`].
#[derive(Debug)]
pub struct HarvestOutput {
    /// Every enqueued entry with its description
    pub catalog: Catalog,

    /// Parsed detail per entry that produced a result
    pub store: AggregateStore,

    pub stats: HarvestStats,
}

/// Runs the fetch/parse pipeline for one catalog.
pub struct Harvester {
    config: HarvestConfig,
    fetcher: Arc<dyn Fetcher>,
    releases: Arc<dyn ReleaseSource>,
}

impl Harvester {
    pub fn new(
        config: HarvestConfig,
        fetcher: Arc<dyn Fetcher>,
        releases: Arc<dyn ReleaseSource>,
    ) -> Self {
        Self {
            config,
            fetcher,
            releases,
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    fn runner(&self) -> JobRunner {
        JobRunner::new(
            self.fetcher.clone(),
            RetryPolicy::new(self.config.max_attempts),
        )
    }

    /// Fetches and parses the catalog index through the seed job.
    ///
    /// An unreachable or unparseable index yields no packages; the run goes
    /// on with nothing to do.
    #[instrument(skip(self))]
    pub async fn discover(&self) -> Vec<String> {
        let job = FetchJob::index(&self.config);
        let mut packages = match self.runner().run(&job, |_| {}).await {
            JobOutcome::Parsed { documents, .. } => documents
                .into_iter()
                .filter_map(|(_, document)| match document {
                    ParsedDocument::Index(names) => Some(names),
                    ParsedDocument::Detail(_) => None,
                })
                .flatten()
                .collect::<Vec<_>>(),
            JobOutcome::Dropped { attempts, error } => {
                error!(uri = %job.uri, attempts, error = %error, "Catalog index unavailable");
                Vec::new()
            }
        };

        if let Some(limit) = self.config.max_packages {
            packages.truncate(limit);
        }
        info!(packages = packages.len(), "Catalog index discovered");
        packages
    }

    /// Runs the whole pipeline and returns the aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError`] only when the queue or channel primitives
    /// fail or a worker task dies; per-job failures are absorbed.
    pub async fn harvest(&self) -> Result<HarvestOutput, HarvestError> {
        let start = Instant::now();
        let worker_count = self.config.worker_count();
        let mut stats = HarvestStats {
            workers: worker_count,
            ..Default::default()
        };

        let (queue, jobs) = job_queue(self.config.queue_capacity);
        let ledger = queue.ledger().clone();
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(PipelineContext {
            jobs,
            ledger: ledger.clone(),
            results: results_tx,
            runner: self.runner(),
        });

        // Workers start before enumeration so a bounded queue keeps moving.
        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            workers.spawn(Worker::new(id, ctx.clone()).run());
        }
        drop(ctx);
        info!(workers = worker_count, "Worker pool started");

        let mut aggregator = Aggregator::new();
        let mut catalog = Catalog::new();

        let packages = self.discover().await;
        stats.packages_discovered = packages.len();

        for package in packages {
            let listing = self.releases.releases(&package).await;
            let description = listing.summary.unwrap_or_default();
            for version in listing.versions {
                let entry = CatalogEntry::new(package.clone(), version);
                if aggregator.register(entry.clone()).is_none() {
                    continue;
                }
                queue
                    .submit(Job::Fetch(FetchJob::detail(&self.config, &entry)))
                    .await?;
                catalog.insert(entry, description.clone());
                stats.entries_enqueued += 1;
            }
        }

        for _ in 0..worker_count {
            queue.submit(Job::Shutdown).await?;
        }
        info!(
            entries = stats.entries_enqueued,
            "All jobs submitted, waiting for the queue to drain"
        );

        let mut reports = wait_for_drain(&ledger, &mut workers).await?;

        let received = aggregator
            .drain(&mut results_rx, &ledger, self.config.drain_poll())
            .await;

        while let Some(joined) = workers.join_next().await {
            reports.push(joined_report(joined)?);
        }

        let snapshot = ledger.snapshot();
        stats.jobs_submitted = snapshot.submitted;
        stats.jobs_consumed = snapshot.consumed;
        stats.jobs_dropped = reports.iter().map(|r| r.dropped).sum();
        stats.results_received = received;
        stats.duplicates = aggregator.duplicates;
        stats.unmatched = aggregator.unmatched;
        stats.label_collisions = aggregator.collisions;
        stats.total_duration_ms = start.elapsed().as_millis() as u64;

        info!(
            duration_ms = stats.total_duration_ms,
            submitted = stats.jobs_submitted,
            consumed = stats.jobs_consumed,
            dropped = stats.jobs_dropped,
            results = stats.results_received,
            "Harvest completed"
        );

        Ok(HarvestOutput {
            catalog,
            store: aggregator.into_store(),
            stats,
        })
    }
}

/// Waits for the drained condition while watching for workers that die
/// before consuming their sentinel, which would otherwise stall the wait.
async fn wait_for_drain(
    ledger: &QueueLedger,
    workers: &mut JoinSet<Result<WorkerReport, HarvestError>>,
) -> Result<Vec<WorkerReport>, HarvestError> {
    let mut reports = Vec::new();
    loop {
        tokio::select! {
            _ = ledger.wait_drained() => return Ok(reports),
            joined = workers.join_next() => match joined {
                Some(joined) => reports.push(joined_report(joined)?),
                None => return Ok(reports),
            },
        }
    }
}

fn joined_report(
    joined: Result<Result<WorkerReport, HarvestError>, tokio::task::JoinError>,
) -> Result<WorkerReport, HarvestError> {
    joined.map_err(|e| HarvestError::WorkerPanicked(e.to_string()))?
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PackageDetail, HOME_PAGE_LABEL};
    use crate::traits::{DownloadError, Payload, ReleaseListing};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const INDEX: &str = r#"<html><body>
        <a href="/simple/foo/">foo</a>
        <a href="/simple/bar/">bar</a>
        <a href="/simple/down/">down</a>
    </body></html>"#;

    fn detail_page(home: &str) -> String {
        format!(
            r##"<html><body>
            <table class="list">
              <tr><th>File</th><th>Type</th><th>Py Version</th><th>Uploaded on</th><th>Size</th></tr>
              <tr><td><a href="https://files.test/pkg.tar.gz#md5=abcdef">pkg.tar.gz</a></td><td>Source</td><td></td><td>2015-01-01</td><td>1KB</td></tr>
              <tr><td>total</td></tr>
            </table>
            <ul class="nodot"><li><strong>Home Page:</strong><span>{home}</span></li></ul>
            </body></html>"##
        )
    }

    /// Serves pages from memory; URIs containing `down` always fail.
    #[derive(Default)]
    struct MockFetcher {
        pages: BTreeMap<String, String>,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl MockFetcher {
        fn calls_to(&self, uri: &str) -> usize {
            self.calls.lock().unwrap().get(uri).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(
            &self,
            uri: &str,
            output: &str,
            _timeout: Option<Duration>,
        ) -> Result<Payload, DownloadError> {
            *self.calls.lock().unwrap().entry(uri.to_string()).or_default() += 1;
            match self.pages.get(uri) {
                Some(body) => Ok(Payload::new(output, body.as_bytes().to_vec())),
                None => Err(DownloadError::Status {
                    uri: uri.to_string(),
                    status: 503,
                }),
            }
        }
    }

    struct MockReleases {
        versions: BTreeMap<&'static str, Vec<&'static str>>,
        queried: AtomicUsize,
    }

    #[async_trait]
    impl ReleaseSource for MockReleases {
        async fn releases(&self, package: &str) -> ReleaseListing {
            self.queried.fetch_add(1, Ordering::SeqCst);
            ReleaseListing {
                versions: self
                    .versions
                    .get(package)
                    .map(|v| v.iter().map(|s| s.to_string()).collect())
                    .unwrap_or_default(),
                summary: Some(format!("{package} summary")),
            }
        }
    }

    fn fixture(config: &HarvestConfig) -> (Arc<MockFetcher>, Arc<MockReleases>) {
        let mut pages = BTreeMap::new();
        pages.insert(config.index_uri(), INDEX.to_string());
        pages.insert(config.detail_uri("foo", "1.0"), detail_page("https://foo.test"));
        pages.insert(config.detail_uri("foo", "1.1"), detail_page("https://foo.test/1.1"));
        pages.insert(config.detail_uri("bar", "0.1"), "<html><body>garbage".to_string());

        let mut versions = BTreeMap::new();
        versions.insert("foo", vec!["1.0", "1.1", "1.0"]);
        versions.insert("bar", vec!["0.1"]);
        versions.insert("down", vec!["9.9"]);

        (
            Arc::new(MockFetcher {
                pages,
                ..Default::default()
            }),
            Arc::new(MockReleases {
                versions,
                queried: AtomicUsize::new(0),
            }),
        )
    }

    fn test_config() -> HarvestConfig {
        HarvestConfig::default()
            .with_repo_uri("https://catalog.test/")
            .with_workers(3)
            .with_max_attempts(5)
            .with_drain_poll(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_harvest_accounts_for_every_job() {
        let config = test_config();
        let (fetcher, releases) = fixture(&config);
        let harvester = Harvester::new(config.clone(), fetcher.clone(), releases.clone());

        let output = harvester.harvest().await.unwrap();

        // 4 unique entries + 3 sentinels.
        assert_eq!(output.stats.entries_enqueued, 4);
        assert_eq!(output.stats.jobs_submitted, 7);
        assert_eq!(output.stats.jobs_consumed, output.stats.jobs_submitted);
        assert_eq!(output.stats.jobs_dropped, 1);
        assert_eq!(output.stats.results_received, 3);
        assert_eq!(releases.queried.load(Ordering::SeqCst), 3);

        // The failing entry was retried up to the bound and left out.
        assert_eq!(fetcher.calls_to(&config.detail_uri("down", "9.9")), 5);
        assert!(!output.store.contains_key(&CatalogEntry::new("down", "9.9")));
        assert!(output.catalog.contains_key(&CatalogEntry::new("down", "9.9")));

        let foo = &output.store[&CatalogEntry::new("foo", "1.0")];
        assert_eq!(foo.info_text(HOME_PAGE_LABEL), Some("https://foo.test"));
        assert_eq!(foo.files.len(), 1);
        assert_eq!(
            output.catalog[&CatalogEntry::new("foo", "1.0")],
            "foo summary"
        );

        // Malformed page is kept as the empty detail, not an error.
        assert_eq!(
            output.store[&CatalogEntry::new("bar", "0.1")],
            PackageDetail::default()
        );
    }

    #[tokio::test]
    async fn test_bounded_queue_and_single_worker() {
        let config = test_config().with_workers(1).with_queue_capacity(1);
        let (fetcher, releases) = fixture(&config);
        let harvester = Harvester::new(config, fetcher, releases);

        let output = harvester.harvest().await.unwrap();
        assert_eq!(output.stats.jobs_submitted, 5);
        assert_eq!(output.stats.jobs_consumed, 5);
        assert_eq!(output.store.len(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_index_yields_empty_run() {
        let config = test_config();
        let harvester = Harvester::new(
            config,
            Arc::new(MockFetcher::default()),
            Arc::new(MockReleases {
                versions: BTreeMap::new(),
                queried: AtomicUsize::new(0),
            }),
        );

        let output = harvester.harvest().await.unwrap();
        assert_eq!(output.stats.packages_discovered, 0);
        assert_eq!(output.stats.jobs_submitted, 3);
        assert_eq!(output.stats.jobs_consumed, 3);
        assert!(output.store.is_empty());
    }

    #[tokio::test]
    async fn test_max_packages_caps_discovery() {
        let config = test_config().with_max_packages(1);
        let (fetcher, releases) = fixture(&config);
        let harvester = Harvester::new(config, fetcher, releases);

        assert_eq!(harvester.discover().await, vec!["foo"]);
    }

    #[test]
    fn test_aggregator_keeps_one_detail_per_entry() {
        let mut aggregator = Aggregator::new();
        let label = aggregator
            .register(CatalogEntry::new("foo", "1.0"))
            .unwrap();
        assert!(aggregator.register(CatalogEntry::new("foo", "1.0")).is_none());

        let mut first = PackageDetail::default();
        first.info.insert(
            HOME_PAGE_LABEL.to_string(),
            crate::model::InfoValue::Text("first".to_string()),
        );
        aggregator.merge(JobResult {
            label: label.clone(),
            document: ParsedDocument::Detail(first.clone()),
        });
        aggregator.merge(JobResult {
            label,
            document: ParsedDocument::Detail(PackageDetail::default()),
        });
        aggregator.merge(JobResult {
            label: "unknown-0".to_string(),
            document: ParsedDocument::Detail(PackageDetail::default()),
        });

        assert_eq!(aggregator.store().len(), 1);
        assert_eq!(aggregator.store()[&CatalogEntry::new("foo", "1.0")], first);
        assert_eq!(aggregator.duplicates, 1);
        assert_eq!(aggregator.unmatched, 1);
    }

    #[test]
    fn test_register_reports_label_collisions() {
        let mut aggregator = Aggregator::new();
        assert_eq!(
            aggregator.register(CatalogEntry::new("foo-1", "0")).as_deref(),
            Some("foo-1-0")
        );
        assert!(aggregator.register(CatalogEntry::new("foo", "1-0")).is_none());
        assert!(aggregator.register(CatalogEntry::new("foo-1", "0")).is_none());

        assert_eq!(aggregator.collisions, 1);
        assert_eq!(
            aggregator.labels["foo-1-0"],
            CatalogEntry::new("foo-1", "0")
        );
    }

    #[tokio::test]
    async fn test_drain_waits_for_ledger() {
        let (queue, _jobs) = job_queue(None);
        let ledger = queue.ledger().clone();
        queue.submit(Job::Shutdown).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut aggregator = Aggregator::new();
        let label = aggregator
            .register(CatalogEntry::new("foo", "1.0"))
            .unwrap();

        let producer = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ledger.mark_consumed();
                tx.send(JobResult {
                    label,
                    document: ParsedDocument::Detail(PackageDetail::default()),
                })
                .unwrap();
            })
        };

        let received = aggregator
            .drain(&mut rx, &ledger, Duration::from_millis(50))
            .await;
        producer.await.unwrap();

        assert_eq!(received, 1);
        assert_eq!(aggregator.store().len(), 1);
    }

    #[tokio::test]
    async fn test_single_package_end_to_end() {
        use crate::normalize::RecordNormalizer;
        use crate::traits::ConfigConversions;

        let config = test_config();
        let mut pages = BTreeMap::new();
        pages.insert(
            config.index_uri(),
            r#"<html><body><a href="/simple/foo/">foo</a></body></html>"#.to_string(),
        );
        pages.insert(config.detail_uri("foo", "1.0"), detail_page("https://foo.test"));
        let fetcher = Arc::new(MockFetcher {
            pages,
            ..Default::default()
        });
        let releases = Arc::new(MockReleases {
            versions: BTreeMap::from([("foo", vec!["1.0"])]),
            queried: AtomicUsize::new(0),
        });

        let output = Harvester::new(config.clone(), fetcher, releases)
            .harvest()
            .await
            .unwrap();

        let run_date = chrono::NaiveDate::from_ymd_opt(2026, 10, 15).unwrap();
        let normalizer = RecordNormalizer::new(&config, &ConfigConversions, run_date);
        let records = normalizer.normalize_all(&output.catalog, &output.store);

        assert_eq!(records.len(), 1);
        let (id, record) = &records[0];
        assert_eq!((id.name.as_str(), id.version.as_str()), ("foo", "1.0"));
        assert_eq!(record.source_uri, "https://files.test/pkg.tar.gz");
        assert_eq!(record.content_hash.as_deref(), Some("abcdef"));
        assert_eq!(record.homepage, "https://foo.test");
        assert_eq!(record.python_compat, "(python{2_7,3_3,3_4,3_5})");
        assert_eq!(record.description, "foo summary");
    }
}
