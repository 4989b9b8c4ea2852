// Test mocks for the source clients.
//
// MockFetcher (HttpFetcher) answers from a URL→response table. A per-URL
// script of responses is consumed first, in order; once it runs out the
// fixed response (if any) is returned for every further call. Every call is
// recorded with the proxy it went through.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{FetchError, Result};
use crate::http::HttpFetcher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub url: String,
    pub proxy: Option<String>,
}

pub struct MockFetcher {
    fixed: HashMap<String, Result<String>>,
    scripted: Mutex<HashMap<String, VecDeque<Result<String>>>>,
    calls: Mutex<Vec<RecordedCall>>,
    latency: Duration,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            fixed: HashMap::new(),
            scripted: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    /// Always answer `url` with `body`.
    pub fn on_text(mut self, url: &str, body: impl Into<String>) -> Self {
        self.fixed.insert(url.to_string(), Ok(body.into()));
        self
    }

    /// Always fail `url` with `error`.
    pub fn on_error(mut self, url: &str, error: FetchError) -> Self {
        self.fixed.insert(url.to_string(), Err(error));
        self
    }

    /// Queue one response for `url`, consumed before the fixed response.
    pub fn then(self, url: &str, response: Result<String>) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
        self
    }

    /// Delay every response, so concurrent callers overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.url == url).count()
    }
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// A transient failure, as a blocked or timed-out request would produce.
pub fn transient(url: &str) -> FetchError {
    FetchError::Transient {
        url: url.to_string(),
        message: "connection reset".to_string(),
    }
}

#[async_trait]
impl HttpFetcher for MockFetcher {
    async fn get_text(&self, url: &str, proxy: Option<&str>) -> Result<String> {
        self.calls.lock().unwrap().push(RecordedCall {
            url: url.to_string(),
            proxy: proxy.map(str::to_string),
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|queue| queue.pop_front());
        if let Some(response) = scripted {
            return response;
        }

        self.fixed
            .get(url)
            .cloned()
            .unwrap_or_else(|| Err(transient(url)))
    }
}
