//! Sales API client: one GET per extraction window, retried on throttling,
//! server errors and dropped connections.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

/// Exponential delay between attempts, capped at `ceiling`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` sends exactly one request.
    pub retries: usize,
    pub initial_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_before_retry(&self, retry: usize) -> Duration {
        let shift = u32::try_from(retry).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.ceiling)
    }
}

/// 429 and 5xx are worth another attempt; any other status is final.
pub fn status_is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn transport_is_transient(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || err.is_request()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// The window and credentials sent to a source's sales endpoint.
#[derive(Debug, Clone)]
pub struct SalesApiRequest<'a> {
    pub source_name: &'a str,
    pub endpoint: &'a str,
    pub start_date: String,
    pub end_date: String,
    pub api_key: Option<&'a str>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("sales api transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("sales api answered {status} at {url}")]
    Status { status: u16, url: String },
}

enum Attempt {
    Done(Vec<u8>),
    Retry(FetchError),
    Fail(FetchError),
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(Self {
            client: builder.build().context("building sales api client")?,
            retry: config.retry,
        })
    }

    /// Returns the response body of a successful `GET endpoint?start_date=..&end_date=..`.
    pub async fn fetch_sales(&self, request: &SalesApiRequest<'_>) -> Result<Vec<u8>, FetchError> {
        let span = info_span!(
            "sales_api",
            source = request.source_name,
            endpoint = request.endpoint,
            start = %request.start_date,
            end = %request.end_date,
        );
        async {
            let mut retry = 0;
            loop {
                let err = match self.attempt(request).await {
                    Attempt::Done(body) => {
                        debug!(bytes = body.len(), retry, "sales api responded");
                        return Ok(body);
                    }
                    Attempt::Fail(err) => return Err(err),
                    Attempt::Retry(err) if retry >= self.retry.retries => return Err(err),
                    Attempt::Retry(err) => err,
                };
                let delay = self.retry.delay_before_retry(retry);
                warn!(error = %err, retry, delay_ms = delay.as_millis() as u64, "retrying sales api");
                tokio::time::sleep(delay).await;
                retry += 1;
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, request: &SalesApiRequest<'_>) -> Attempt {
        let mut builder = self.client.get(request.endpoint).query(&[
            ("start_date", request.start_date.as_str()),
            ("end_date", request.end_date.as_str()),
        ]);
        if let Some(key) = request.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) if transport_is_transient(&err) => return Attempt::Retry(err.into()),
            Err(err) => return Attempt::Fail(err.into()),
        };

        let status = response.status();
        if !status.is_success() {
            let err = FetchError::Status {
                status: status.as_u16(),
                url: response.url().to_string(),
            };
            return if status_is_transient(status) {
                Attempt::Retry(err)
            } else {
                Attempt::Fail(err)
            };
        }
        match response.bytes().await {
            Ok(body) => Attempt::Done(body.to_vec()),
            Err(err) => Attempt::Fail(err.into()),
        }
    }
}
