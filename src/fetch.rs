//! HTTP implementations of [`Fetcher`] and [`ReleaseSource`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::HarvestConfig;
use crate::traits::{DownloadError, Fetcher, Payload, ReleaseListing, ReleaseSource};

const USER_AGENT: &str = concat!("catalog-harvester/", env!("CARGO_PKG_VERSION"));

/// Filesystem-safe spool name for a payload.
pub fn spool_name(output: &str) -> String {
    let name: String = output
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        "payload".to_string()
    } else {
        name
    }
}

fn request_error(uri: &str, timeout: Option<Duration>, e: reqwest::Error) -> DownloadError {
    match timeout {
        Some(limit) if e.is_timeout() => DownloadError::Timeout {
            uri: uri.to_string(),
            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        },
        _ => DownloadError::Request {
            uri: uri.to_string(),
            message: e.to_string(),
        },
    }
}

/// Downloads into a private temporary directory that is removed before the
/// payload is handed back.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,

    /// Parent of the per-fetch spool directories; the system temp dir if unset
    spool_root: Option<PathBuf>,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| DownloadError::Request {
                uri: String::new(),
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            spool_root: None,
        }
    }

    pub fn with_spool_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.spool_root = Some(root.into());
        self
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        uri: &str,
        output: &str,
        timeout: Option<Duration>,
    ) -> Result<Payload, DownloadError> {
        let mut request = self.client.get(uri);
        if let Some(limit) = timeout {
            request = request.timeout(limit);
        }
        let mut response = request
            .send()
            .await
            .map_err(|e| request_error(uri, timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                uri: uri.to_string(),
                status: status.as_u16(),
            });
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("harvest-download-");
        let spool = match &self.spool_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        let path = spool.path().join(spool_name(output));
        let mut file = tokio::fs::File::create(&path).await?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| request_error(uri, timeout, e))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let bytes = tokio::fs::read(&path).await?;
        debug!(uri, output, size = bytes.len(), "Downloaded");
        Ok(Payload::new(output, bytes))
    }
}

#[derive(Debug, Deserialize)]
struct ReleaseDocument {
    #[serde(default)]
    releases: BTreeMap<String, Value>,
    #[serde(default)]
    info: Option<ReleaseInfo>,
}

#[derive(Debug, Deserialize)]
struct ReleaseInfo {
    #[serde(default)]
    summary: Option<String>,
}

/// Reads the release-metadata JSON document.
pub fn parse_release_listing(bytes: &[u8]) -> Result<ReleaseListing, serde_json::Error> {
    let document: ReleaseDocument = serde_json::from_slice(bytes)?;
    Ok(ReleaseListing {
        versions: document.releases.into_keys().collect(),
        summary: document
            .info
            .and_then(|info| info.summary)
            .filter(|s| !s.is_empty()),
    })
}

/// Queries the per-package release endpoint.
#[derive(Clone)]
pub struct HttpReleaseSource {
    client: reqwest::Client,
    endpoint: String,
    timeout: Option<Duration>,
}

impl HttpReleaseSource {
    pub fn new(config: &HarvestConfig) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| DownloadError::Request {
                uri: config.releases_uri.clone(),
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            endpoint: config.releases_uri.clone(),
            timeout: config.detail_timeout(),
        })
    }

    async fn try_releases(&self, uri: &str) -> Result<ReleaseListing, DownloadError> {
        let mut request = self.client.get(uri);
        if let Some(limit) = self.timeout {
            request = request.timeout(limit);
        }
        let response = request
            .send()
            .await
            .map_err(|e| request_error(uri, self.timeout, e))?;
        if !response.status().is_success() {
            return Err(DownloadError::Status {
                uri: uri.to_string(),
                status: response.status().as_u16(),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| request_error(uri, self.timeout, e))?;
        parse_release_listing(&bytes).map_err(|e| DownloadError::Request {
            uri: uri.to_string(),
            message: format!("Invalid release document: {}", e),
        })
    }
}

#[async_trait]
impl ReleaseSource for HttpReleaseSource {
    async fn releases(&self, package: &str) -> ReleaseListing {
        let uri = self.endpoint.replace("{name}", package);
        match self.try_releases(&uri).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(package, error = %e, "Could not list releases, skipping package");
                ReleaseListing::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spool_name() {
        assert_eq!(spool_name("foo-1.0"), "foo-1.0");
        assert_eq!(spool_name("../etc/passwd"), ".._etc_passwd");
        assert_eq!(spool_name("zope interface"), "zope_interface");
        assert_eq!(spool_name(".."), "payload");
        assert_eq!(spool_name(""), "payload");
    }

    #[test]
    fn test_parse_release_listing() {
        let body = br#"{
            "info": {"summary": "Fast foo", "name": "foo"},
            "releases": {"1.0": [], "0.9": [{"url": "x"}], "2.0b1": []}
        }"#;
        let listing = parse_release_listing(body).unwrap();
        assert_eq!(listing.versions, vec!["0.9", "1.0", "2.0b1"]);
        assert_eq!(listing.summary.as_deref(), Some("Fast foo"));
    }

    #[test]
    fn test_parse_release_listing_without_info() {
        let listing = parse_release_listing(br#"{"releases": {}}"#).unwrap();
        assert!(listing.versions.is_empty());
        assert!(listing.summary.is_none());

        let listing = parse_release_listing(br#"{"info": {"summary": ""}}"#).unwrap();
        assert!(listing.summary.is_none());

        assert!(parse_release_listing(b"not json").is_err());
    }

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn serve(route: &str, response: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(response)
            .mount(&server)
            .await;
        server
    }

    fn spool_entries(root: &std::path::Path) -> usize {
        std::fs::read_dir(root).unwrap().count()
    }

    #[tokio::test]
    async fn test_fetch_returns_body_and_removes_spool() {
        let server = serve(
            "/simple",
            ResponseTemplate::new(200).set_body_string("<html><body>foo</body></html>"),
        )
        .await;
        let spool = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new().unwrap().with_spool_root(spool.path());

        let payload = fetcher
            .fetch(&format!("{}/simple", server.uri()), "packages", None)
            .await
            .unwrap();

        assert_eq!(payload.name, "packages");
        assert_eq!(payload.bytes, b"<html><body>foo</body></html>");
        assert_eq!(spool_entries(spool.path()), 0);
    }

    #[tokio::test]
    async fn test_fetch_error_status() {
        let server = serve("/pypi/foo/1.0", ResponseTemplate::new(503)).await;
        let spool = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new().unwrap().with_spool_root(spool.path());

        let err = fetcher
            .fetch(&format!("{}/pypi/foo/1.0", server.uri()), "foo-1.0", None)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Status { status: 503, .. }));
        assert_eq!(spool_entries(spool.path()), 0);
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let server = serve(
            "/pypi/foo/1.0",
            ResponseTemplate::new(200)
                .set_body_string("late")
                .set_delay(Duration::from_secs(5)),
        )
        .await;
        let spool = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new().unwrap().with_spool_root(spool.path());

        let err = fetcher
            .fetch(
                &format!("{}/pypi/foo/1.0", server.uri()),
                "foo-1.0",
                Some(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Timeout { timeout_ms: 200, .. }));
        assert_eq!(spool_entries(spool.path()), 0);
    }

    fn release_source(server: &MockServer) -> HttpReleaseSource {
        let config = HarvestConfig {
            releases_uri: format!("{}/pypi/{{name}}/json", server.uri()),
            ..Default::default()
        };
        HttpReleaseSource::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_releases_from_endpoint() {
        let server = serve(
            "/pypi/foo/json",
            ResponseTemplate::new(200)
                .set_body_string(r#"{"info": {"summary": "Fast foo"}, "releases": {"1.0": []}}"#),
        )
        .await;

        let listing = release_source(&server).releases("foo").await;
        assert_eq!(listing.versions, vec!["1.0"]);
        assert_eq!(listing.summary.as_deref(), Some("Fast foo"));
    }

    #[tokio::test]
    async fn test_releases_degrade_to_empty() {
        let server = serve(
            "/pypi/foo/json",
            ResponseTemplate::new(200).set_body_string("{not json"),
        )
        .await;
        let source = release_source(&server);

        assert_eq!(source.releases("foo").await, ReleaseListing::default());
        // No route for this package: the mock server answers 404.
        assert_eq!(source.releases("bar").await, ReleaseListing::default());
    }
}
