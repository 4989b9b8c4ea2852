// HttpFetcher: the one network seam every source client goes through.
//
// ReqwestFetcher is the production implementation. Tests swap in
// MockFetcher (see testing.rs) to script responses per URL and proxy.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{FetchError, Result};

#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// GET `url` and return the body. `proxy` routes the request through a
    /// forward proxy; `None` means a direct connection.
    async fn get_text(&self, url: &str, proxy: Option<&str>) -> Result<String>;
}

/// GET `url` directly and decode the body as JSON.
pub async fn get_json<T: DeserializeOwned>(fetcher: &dyn HttpFetcher, url: &str) -> Result<T> {
    let body = fetcher.get_text(url, None).await?;
    serde_json::from_str(&body).map_err(|e| FetchError::parse(url, e))
}

pub struct ReqwestFetcher {
    direct: reqwest::Client,
    timeout: Duration,
    user_agent: String,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration, user_agent: impl Into<String>) -> anyhow::Result<Self> {
        let user_agent = user_agent.into();
        let direct = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.clone())
            .build()?;
        Ok(Self {
            direct,
            timeout,
            user_agent,
        })
    }

    fn proxied_client(&self, proxy: &str) -> Result<reqwest::Client> {
        let proxy_err = |e: reqwest::Error| FetchError::Proxy {
            proxy: proxy.to_string(),
            message: e.to_string(),
        };
        let route = reqwest::Proxy::all(proxy).map_err(proxy_err)?;
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .proxy(route)
            .build()
            .map_err(proxy_err)
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get_text(&self, url: &str, proxy: Option<&str>) -> Result<String> {
        let client = match proxy {
            Some(p) => self.proxied_client(p)?,
            None => self.direct.clone(),
        };

        debug!(url, proxy = proxy.unwrap_or("direct"), "GET");

        let resp = client
            .get(url)
            .header("Accept-Language", "es-PE,es;q=0.9")
            .send()
            .await
            .map_err(|e| classify(url, e))?;

        let status = resp.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(FetchError::Transient {
                url: url.to_string(),
                message: format!("HTTP {status}"),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        resp.text().await.map_err(|e| classify(url, e))
    }
}

fn classify(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_decode() {
        FetchError::parse(url, e)
    } else {
        FetchError::Transient {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}
