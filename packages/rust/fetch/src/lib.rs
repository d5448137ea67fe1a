//! Polite, cache-aware HTTP fetcher for the tune metadata site.
//!
//! Every fetch goes through three gates in order: the URL allow-list
//! (fail closed), the raw HTML cache (cache hits cost nothing), and the
//! rate limiter (one request per configured interval, serialized across
//! the whole process). Cache misses retry transient failures with
//! exponential backoff.

use std::path::PathBuf;
use std::time::Instant;

use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use tunebook_shared::config::FetchConfig;
use tunebook_shared::error::{Result, TunebookError};

// ---------------------------------------------------------------------------
// FetchOutcome
// ---------------------------------------------------------------------------

/// A fetched document and where it came from.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Raw response body.
    pub body: String,
    /// True when the body was served from the local cache with no
    /// network activity.
    pub from_cache: bool,
}

// ---------------------------------------------------------------------------
// RateLimitedFetcher
// ---------------------------------------------------------------------------

/// Single-host fetcher enforcing allow-list, cache, spacing, and retries.
pub struct RateLimitedFetcher {
    config: FetchConfig,
    client: Client,
    /// Completion time of the most recent network request. Held across
    /// the spacing wait and the request itself, so concurrent callers
    /// are strictly serialized.
    last_request: Mutex<Option<Instant>>,
}

impl RateLimitedFetcher {
    /// Create a fetcher and its cache directory.
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TunebookError::Fetch(format!("failed to build HTTP client: {e}")))?;

        std::fs::create_dir_all(&config.cache_dir)
            .map_err(|e| TunebookError::io(&config.cache_dir, e))?;

        Ok(Self {
            config,
            client,
            last_request: Mutex::new(None),
        })
    }

    /// Build the search URL for a normalized `+`-separated query.
    pub fn search_url(&self, query: &str) -> Result<Url> {
        self.config
            .base_url
            .join(&format!("/search?qu={query}+in%3Atunes"))
            .map_err(|e| TunebookError::Fetch(format!("bad search query '{query}': {e}")))
    }

    /// Build the canonical detail-page URL for a tune slug.
    pub fn tune_url(&self, slug: &str) -> Result<Url> {
        self.config
            .base_url
            .join(&format!("/tune/{slug}"))
            .map_err(|e| TunebookError::Fetch(format!("bad tune slug '{slug}': {e}")))
    }

    /// Fetch a URL, serving from cache when possible.
    ///
    /// The allow-list is checked before anything else; a rejected URL
    /// produces [`TunebookError::Policy`] and never touches the network
    /// or the cache.
    pub async fn fetch(&self, url: &Url) -> Result<FetchOutcome> {
        self.check_allowed(url)?;

        let cache_path = self.cache_path(url);
        if let Some(body) = self.read_cache(&cache_path) {
            debug!(%url, "cache hit");
            return Ok(FetchOutcome {
                body,
                from_cache: true,
            });
        }

        let body = self.fetch_with_retries(url).await?;

        // Only successful responses are cached, so a failure is retried
        // on the next run rather than pinned forever.
        if let Err(e) = std::fs::write(&cache_path, &body) {
            warn!(%url, path = %cache_path.display(), error = %e, "failed to write cache");
        }

        Ok(FetchOutcome {
            body,
            from_cache: false,
        })
    }

    /// Reject any URL outside the configured host and path prefixes.
    fn check_allowed(&self, url: &Url) -> Result<()> {
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(TunebookError::Policy(format!(
                "scheme '{}' not allowed: {url}",
                url.scheme()
            )));
        }

        if url.host_str() != self.config.base_url.host_str() {
            return Err(TunebookError::Policy(format!(
                "host not allowed: {url} (expected {})",
                self.config.base_url
            )));
        }

        let path = url.path();
        let allowed = self
            .config
            .allowed_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()));
        if !allowed {
            return Err(TunebookError::Policy(format!(
                "path '{path}' not in allow-list {:?}",
                self.config.allowed_path_prefixes
            )));
        }

        Ok(())
    }

    /// Cache file for a URL: sha256 of the fragment-stripped URL string.
    fn cache_path(&self, url: &Url) -> PathBuf {
        let mut normalized = url.clone();
        normalized.set_fragment(None);

        let mut hasher = Sha256::new();
        hasher.update(normalized.as_str().as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        self.config.cache_dir.join(format!("{hash}.html"))
    }

    fn read_cache(&self, path: &PathBuf) -> Option<String> {
        match std::fs::read_to_string(path) {
            Ok(body) => Some(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable cache file, refetching");
                None
            }
        }
    }

    /// Network fetch with spacing and the configured retry schedule.
    async fn fetch_with_retries(&self, url: &Url) -> Result<String> {
        let mut last_error = String::new();

        for attempt in self.config.retry.attempts() {
            match self.fetch_spaced(url).await {
                Ok(body) => {
                    info!(%url, attempt, bytes = body.len(), "fetched");
                    return Ok(body);
                }
                Err(FetchFailure::Permanent(msg)) => {
                    return Err(TunebookError::Fetch(msg));
                }
                Err(FetchFailure::Transient(msg)) => {
                    warn!(%url, attempt, error = %msg, "fetch attempt failed");
                    last_error = msg;
                    if let Some(backoff) = self.config.retry.backoff_after(attempt) {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(TunebookError::Fetch(format!(
            "{url}: giving up after {} attempts: {last_error}",
            self.config.retry.max_attempts
        )))
    }

    /// One network attempt behind the rate gate.
    ///
    /// The lock is held for the whole attempt, so requests are strictly
    /// serialized and the interval is measured from the previous
    /// request's completion, not its start.
    async fn fetch_spaced(&self, url: &Url) -> std::result::Result<String, FetchFailure> {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.config.min_interval {
                let wait = self.config.min_interval - elapsed;
                debug!(wait_ms = wait.as_millis() as u64, "rate limit wait");
                tokio::time::sleep(wait).await;
            }
        }
        let result = self.fetch_once(url).await;
        *last = Some(Instant::now());
        result
    }

    async fn fetch_once(&self, url: &Url) -> std::result::Result<String, FetchFailure> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| FetchFailure::Transient(format!("{url}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response
                .text()
                .await
                .map_err(|e| FetchFailure::Transient(format!("{url}: body read failed: {e}")));
        }

        let msg = format!("{url}: HTTP {status}");
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            Err(FetchFailure::Transient(msg))
        } else {
            Err(FetchFailure::Permanent(msg))
        }
    }
}

/// Whether a single attempt's failure is worth retrying.
enum FetchFailure {
    Transient(String),
    Permanent(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use tunebook_shared::retry::RetryPolicy;

    fn test_config(server_uri: &str, min_interval_ms: u64) -> FetchConfig {
        let cache_dir = std::env::temp_dir().join(format!("tunebook-fetch-test-{}", uuid_ish()));
        FetchConfig {
            base_url: Url::parse(server_uri).expect("server uri"),
            allowed_path_prefixes: vec!["/search".into(), "/tune/".into()],
            min_interval: Duration::from_millis(min_interval_ms),
            request_timeout: Duration::from_secs(5),
            retry: RetryPolicy::new(3, 0),
            cache_dir,
            user_agent: "tunebook/test".into(),
        }
    }

    fn uuid_ish() -> u128 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    }

    #[tokio::test]
    async fn rejects_url_outside_allow_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let fetcher = RateLimitedFetcher::new(test_config(&server.uri(), 0)).unwrap();
        let url = Url::parse(&format!("{}/admin/users", server.uri())).unwrap();

        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(matches!(err, TunebookError::Policy(_)), "got: {err}");
    }

    #[tokio::test]
    async fn rejects_other_hosts() {
        let server = MockServer::start().await;
        let fetcher = RateLimitedFetcher::new(test_config(&server.uri(), 0)).unwrap();

        let url = Url::parse("https://example.com/tune/foo").unwrap();
        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(matches!(err, TunebookError::Policy(_)));
    }

    #[tokio::test]
    async fn second_fetch_is_served_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tune/ein_feste_burg"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>tune</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = RateLimitedFetcher::new(test_config(&server.uri(), 0)).unwrap();
        let url = Url::parse(&format!("{}/tune/ein_feste_burg", server.uri())).unwrap();

        let first = fetcher.fetch(&url).await.unwrap();
        assert!(!first.from_cache);

        let second = fetcher.fetch(&url).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(first.body, second.body);
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_string("results"))
            .mount(&server)
            .await;

        let fetcher = RateLimitedFetcher::new(test_config(&server.uri(), 0)).unwrap();
        let url = fetcher.search_url("A+Mighty+Fortress").unwrap();

        let outcome = fetcher.fetch(&url).await.unwrap();
        assert_eq!(outcome.body, "results");
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tune/missing"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let fetcher = RateLimitedFetcher::new(test_config(&server.uri(), 0)).unwrap();
        let url = Url::parse(&format!("{}/tune/missing", server.uri())).unwrap();

        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(matches!(err, TunebookError::Fetch(_)));
        assert!(err.to_string().contains("giving up"));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tune/nope"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = RateLimitedFetcher::new(test_config(&server.uri(), 0)).unwrap();
        let url = Url::parse(&format!("{}/tune/nope", server.uri())).unwrap();

        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn enforces_minimum_spacing_between_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let fetcher = RateLimitedFetcher::new(test_config(&server.uri(), 250)).unwrap();
        let a = Url::parse(&format!("{}/tune/first", server.uri())).unwrap();
        let b = Url::parse(&format!("{}/tune/second", server.uri())).unwrap();

        let start = Instant::now();
        fetcher.fetch(&a).await.unwrap();
        fetcher.fetch(&b).await.unwrap();
        assert!(
            start.elapsed() >= Duration::from_millis(250),
            "second request went out too early: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn spacing_is_measured_from_request_completion() {
        let server = MockServer::start().await;
        // The first response takes longer than the interval itself.
        Mock::given(method("GET"))
            .and(path("/tune/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("ok")
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tune/fast"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let fetcher = RateLimitedFetcher::new(test_config(&server.uri(), 200)).unwrap();
        let slow = Url::parse(&format!("{}/tune/slow", server.uri())).unwrap();
        let fast = Url::parse(&format!("{}/tune/fast", server.uri())).unwrap();

        let start = Instant::now();
        fetcher.fetch(&slow).await.unwrap();
        fetcher.fetch(&fast).await.unwrap();
        // 300ms response plus a full 200ms gap after it completed.
        assert!(
            start.elapsed() >= Duration::from_millis(500),
            "interval was not measured from completion: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn cache_hit_skips_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = RateLimitedFetcher::new(test_config(&server.uri(), 60_000)).unwrap();
        let url = Url::parse(&format!("{}/tune/cached", server.uri())).unwrap();

        fetcher.fetch(&url).await.unwrap();
        // Would block for a minute if the cache hit went through the limiter.
        let start = Instant::now();
        let second = fetcher.fetch(&url).await.unwrap();
        assert!(second.from_cache);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn search_url_shape() {
        let config = test_config("https://hymnary.org", 0);
        let fetcher = RateLimitedFetcher::new(config).unwrap();
        let url = fetcher.search_url("Abide+with+Me").unwrap();
        assert_eq!(
            url.as_str(),
            "https://hymnary.org/search?qu=Abide+with+Me+in%3Atunes"
        );
    }
}
