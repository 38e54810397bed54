//! Transport used by monitors to pull playlists and segment bytes.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use tracing::trace;
use url::Url;

use crate::config::{Credentials, HttpConfig};
use crate::error::RelayError;

/// Result of a single request. Exactly one is produced per request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Success(Bytes),
    Failed {
        status: Option<StatusCode>,
        reason: String,
    },
    /// The request was abandoned before it completed.
    Cancelled,
}

impl FetchOutcome {
    pub fn failed(status: Option<StatusCode>, reason: impl Into<String>) -> Self {
        Self::Failed {
            status,
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Success(_) => Some(StatusCode::OK),
            Self::Failed { status, .. } => *status,
            Self::Cancelled => None,
        }
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> FetchOutcome;
}

/// Appends `query` pairs to `url`, keeping any query it already carries.
pub fn with_query(url: &Url, query: &[(String, String)]) -> Url {
    let mut url = url.clone();
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    url
}

/// Plain HTTP transport on top of reqwest.
pub struct HttpFetcher {
    client: Client,
    credentials: Option<Credentials>,
    response_timeout: Duration,
    transfer_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: &HttpConfig) -> Result<Self, RelayError> {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(5)
            .user_agent(&config.user_agent)
            .default_headers(config.headers.clone());

        if !config.connect_timeout.is_zero() {
            builder = builder.connect_timeout(config.connect_timeout);
        }

        let client = builder.build()?;
        Ok(Self {
            client,
            credentials: config.credentials.clone(),
            response_timeout: config.response_timeout,
            transfer_timeout: config.transfer_timeout,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> FetchOutcome {
        let started = Instant::now();
        let mut request = self.client.get(url.clone());
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = match tokio::time::timeout(self.response_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return FetchOutcome::failed(e.status(), e.to_string()),
            Err(_) => {
                return FetchOutcome::failed(
                    None,
                    format!("no response within {:?}", self.response_timeout),
                );
            }
        };

        let status = response.status();
        if !status.is_success() {
            trace!(url = %url, %status, "request rejected");
            return FetchOutcome::failed(Some(status), format!("HTTP {status}"));
        }

        let remaining = self.transfer_timeout.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, response.bytes()).await {
            Ok(Ok(body)) => {
                trace!(url = %url, bytes = body.len(), elapsed = ?started.elapsed(), "request complete");
                FetchOutcome::Success(body)
            }
            Ok(Err(e)) => FetchOutcome::failed(None, e.to_string()),
            Err(_) => FetchOutcome::failed(
                None,
                format!("transfer exceeded {:?}", self.transfer_timeout),
            ),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_query_appends_pairs() {
        let url = Url::parse("https://example.com/live/index.m3u8?a=1").unwrap();
        let query = vec![("token".to_owned(), "x y".to_owned())];
        assert_eq!(
            with_query(&url, &query).as_str(),
            "https://example.com/live/index.m3u8?a=1&token=x+y"
        );
        assert_eq!(with_query(&url, &[]), url);
    }

    #[test]
    fn outcome_status() {
        assert_eq!(FetchOutcome::Success(Bytes::new()).status(), Some(StatusCode::OK));
        assert_eq!(FetchOutcome::Cancelled.status(), None);
        let failed = FetchOutcome::failed(Some(StatusCode::FORBIDDEN), "HTTP 403");
        assert_eq!(failed.status(), Some(StatusCode::FORBIDDEN));
    }

    #[test]
    fn http_fetcher_builds_from_defaults() {
        assert!(HttpFetcher::new(&HttpConfig::default()).is_ok());
    }
}
