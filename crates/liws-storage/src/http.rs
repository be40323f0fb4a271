//! JSON-over-HTTP client for the reporting API, retrying transient failures with capped backoff.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl RetryDisposition {
    /// Throttling and server-side failures are transient; anything else is final.
    pub fn for_status(status: StatusCode) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Self::Retryable,
            s if s.is_server_error() => Self::Retryable,
            _ => Self::NonRetryable,
        }
    }

    pub fn for_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }
}

/// Attempt budget and delay curve: `first_delay * 2^n`, never above `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            first_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, retry: u32) -> Duration {
        self.first_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.ceiling)
    }

    /// A server-provided `Retry-After` wins over the curve, still capped.
    fn delay_after(&self, retry: u32, headers: &HeaderMap) -> Duration {
        retry_after(headers)
            .map(|wait| wait.min(self.ceiling))
            .unwrap_or_else(|| self.delay(retry))
    }
}

/// `Retry-After` in delta-seconds form; HTTP-date values are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },
    #[error("{url} returned a body that is not JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(agent) = config.user_agent.as_deref() {
            builder = builder.user_agent(agent);
        }
        Ok(Self {
            client: builder.build().context("building http client")?,
            backoff: config.backoff,
        })
    }

    /// GET returning a JSON body, optionally authorized with a bearer token.
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        bearer: Option<&str>,
    ) -> Result<JsonValue, FetchError> {
        let response = self
            .send(url, || {
                let request = self.client.get(url).query(query);
                match bearer {
                    Some(token) => request.bearer_auth(token),
                    None => request,
                }
            })
            .instrument(info_span!("http_get", url))
            .await?;
        decode(url, response).await
    }

    /// POST an urlencoded form and return the JSON body.
    pub async fn post_form_json(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<JsonValue, FetchError> {
        let response = self
            .send(url, || self.client.post(url).form(form))
            .instrument(info_span!("http_post", url))
            .await?;
        decode(url, response).await
    }

    /// Sends until a success, a final failure, or the retry budget runs out.
    async fn send<F>(&self, url: &str, request: F) -> Result<Response, FetchError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retry = 0;
        loop {
            let sent = request().header(ACCEPT, "application/json").send().await;
            let (disposition, wait, failure) = match sent {
                Ok(response) if response.status().is_success() => {
                    debug!(status = %response.status(), retry, "http ok");
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status();
                    (
                        RetryDisposition::for_status(status),
                        self.backoff.delay_after(retry, response.headers()),
                        FetchError::Status {
                            url: url.to_string(),
                            status: status.as_u16(),
                        },
                    )
                }
                Err(source) => (
                    RetryDisposition::for_error(&source),
                    self.backoff.delay(retry),
                    FetchError::Request {
                        url: url.to_string(),
                        source,
                    },
                ),
            };

            if disposition == RetryDisposition::NonRetryable || retry >= self.backoff.max_retries {
                return Err(failure);
            }
            warn!(error = %failure, retry, wait_ms = wait.as_millis() as u64, "retrying");
            tokio::time::sleep(wait).await;
            retry += 1;
        }
    }
}

async fn decode(url: &str, response: Response) -> Result<JsonValue, FetchError> {
    response
        .json::<JsonValue>()
        .await
        .map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
}
