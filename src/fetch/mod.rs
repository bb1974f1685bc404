//! Fetching JSON documents for adapters, references and init sources.
//!
//! [`HttpFetcher`] serves `http(s)://` URLs through reqwest and everything
//! else (`file://` URLs and plain paths) from the local filesystem.
//! [`MemoryFetcher`] answers from an in-memory table and is what tests use.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::CatalogConfig;
use crate::error::{CatalogError, CatalogResult};

/// Source of JSON documents.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch and parse one JSON document.
    async fn fetch_json(&self, url: &str) -> CatalogResult<Value>;
}

fn fetch_error(url: &str, message: impl std::fmt::Display) -> CatalogError {
    CatalogError::Fetch {
        url: url.to_string(),
        message: message.to_string(),
    }
}

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Resolve `url` against `base`. Absolute URLs are returned unchanged.
pub fn resolve_url(base: Option<&str>, url: &str) -> String {
    if is_http(url) || url.starts_with("file://") || url.starts_with('/') {
        return url.to_string();
    }
    match base {
        Some(base) if !base.is_empty() => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            url.trim_start_matches("./")
        ),
        _ => url.to_string(),
    }
}

// ---------------------------------------------------------------------------
// HttpFetcher
// ---------------------------------------------------------------------------

/// Fetcher backed by reqwest and tokio's filesystem API.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpFetcher {
    pub fn new(base_url: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client, base_url }
    }

    pub fn from_config(config: &CatalogConfig) -> Self {
        Self::new(
            config.base_url.clone(),
            Duration::from_secs(config.http_timeout_secs),
        )
    }

    async fn fetch_http(&self, url: &str) -> CatalogResult<Value> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| fetch_error(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(url, format!("HTTP {}", status)));
        }
        response.json::<Value>().await.map_err(|e| fetch_error(url, e))
    }

    async fn fetch_file(&self, url: &str) -> CatalogResult<Value> {
        let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| fetch_error(url, e))?;
        serde_json::from_str(&text).map_err(|e| fetch_error(url, e))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_json(&self, url: &str) -> CatalogResult<Value> {
        let resolved = resolve_url(self.base_url.as_deref(), url);
        log::debug!("Fetching {}", resolved);
        if is_http(&resolved) {
            self.fetch_http(&resolved).await
        } else {
            self.fetch_file(&resolved).await
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryFetcher
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    documents: HashMap<String, Value>,
    delays: HashMap<String, Duration>,
    calls: HashMap<String, usize>,
}

/// In-memory URL table with optional per-URL latency and call counters.
#[derive(Default)]
pub struct MemoryFetcher {
    state: Mutex<MemoryState>,
}

impl std::fmt::Debug for MemoryFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryFetcher")
            .field("documents", &state.documents.len())
            .field("calls", &state.calls)
            .finish()
    }
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `document` for `url`, replacing any previous document.
    pub fn insert(&self, url: impl Into<String>, document: Value) {
        self.state.lock().documents.insert(url.into(), document);
    }

    /// Delay every fetch of `url` by `delay`.
    pub fn set_delay(&self, url: impl Into<String>, delay: Duration) {
        self.state.lock().delays.insert(url.into(), delay);
    }

    /// Stop serving `url`.
    pub fn remove(&self, url: &str) -> Option<Value> {
        self.state.lock().documents.remove(url)
    }

    /// Number of fetches of `url` so far, successful or not.
    pub fn calls(&self, url: &str) -> usize {
        self.state.lock().calls.get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.values().sum()
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch_json(&self, url: &str) -> CatalogResult<Value> {
        let delay = {
            let mut state = self.state.lock();
            *state.calls.entry(url.to_string()).or_insert(0) += 1;
            state.delays.get(url).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state
            .lock()
            .documents
            .get(url)
            .cloned()
            .ok_or_else(|| fetch_error(url, "not found"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_resolve_url() {
        assert_eq!(resolve_url(Some("http://a/b/"), "init/x.json"), "http://a/b/init/x.json");
        assert_eq!(resolve_url(Some("http://a/b"), "./x.json"), "http://a/b/x.json");
        assert_eq!(resolve_url(Some("http://a"), "https://c/d"), "https://c/d");
        assert_eq!(resolve_url(Some("http://a"), "/abs/x.json"), "/abs/x.json");
        assert_eq!(resolve_url(None, "x.json"), "x.json");
    }

    #[tokio::test]
    async fn test_memory_fetcher_counts_and_misses() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("mem://a", json!({"a": 1}));
        assert_eq!(fetcher.fetch_json("mem://a").await.unwrap(), json!({"a": 1}));
        let err = fetcher.fetch_json("mem://b").await.unwrap_err();
        assert!(matches!(err, CatalogError::Fetch { ref url, .. } if url == "mem://b"));
        assert_eq!(fetcher.calls("mem://a"), 1);
        assert_eq!(fetcher.calls("mem://b"), 1);
        assert_eq!(fetcher.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_memory_fetcher_delay() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("mem://slow", json!(true));
        fetcher.set_delay("mem://slow", Duration::from_millis(30));
        let started = tokio::time::Instant::now();
        fetcher.fetch_json("mem://slow").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_http_fetcher_reads_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("init.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"{{"catalog": []}}"#).unwrap();

        let fetcher = HttpFetcher::new(Some(dir.path().display().to_string()), Duration::from_secs(1));
        assert_eq!(fetcher.fetch_json("init.json").await.unwrap(), json!({"catalog": []}));
        let url = format!("file://{}", path.display());
        assert_eq!(fetcher.fetch_json(&url).await.unwrap(), json!({"catalog": []}));
        assert!(fetcher.fetch_json("missing.json").await.is_err());
    }
}
