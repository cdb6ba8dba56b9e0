//! Streaming downloader for rate-limited, multi-endpoint Overpass services
//!
//! A [`StreamingFetcher`] owns its endpoint pool and request throttle. Each
//! attempt streams the response body straight to the destination file; failed
//! attempts are classified and retried with backoff, rotating endpoints after
//! timeouts, rate limits and repeated server errors. Permanent (4xx) errors are
//! returned immediately.

mod classify;
mod endpoint;
mod filter;
mod query;
mod throttle;

pub use classify::{classify_status, classify_transport, summarize_error_body};
pub use endpoint::EndpointPool;
pub use filter::{TagFilter, TagValues};
pub use query::{CategoryFilter, overpass_query};
pub use throttle::RequestThrottle;

use crate::config::FetchConfig;
use crate::error::{Classify, FetchError};
use crate::retry::{IsRetryable, RetryPolicy};
use crate::types::Event;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Summary of what a download would do, without performing it
#[derive(Clone, Debug, Serialize)]
pub struct DownloadInfo {
    /// Endpoints in rotation order
    pub endpoints: Vec<String>,
    /// Endpoint the next request goes to
    pub current_endpoint: String,
    /// Query length in bytes
    pub query_length: usize,
    /// Whole-request timeout in seconds
    pub request_timeout_secs: f64,
    /// Attempt budget
    pub max_attempts: u32,
}

/// Retrying, rotating, throttled streaming downloader
#[derive(Debug)]
pub struct StreamingFetcher {
    client: reqwest::Client,
    endpoints: EndpointPool,
    throttle: RequestThrottle,
    policy: RetryPolicy,
    config: FetchConfig,
    event_tx: Option<broadcast::Sender<Event>>,
}

impl StreamingFetcher {
    /// Create a fetcher from configuration
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            endpoints: EndpointPool::new(config.endpoints.clone())?,
            throttle: RequestThrottle::new(config.min_request_interval),
            policy: RetryPolicy::from_config(&config.retry),
            config,
            event_tx: None,
        })
    }

    /// Publish progress and retry events on `event_tx`
    pub fn with_events(mut self, event_tx: broadcast::Sender<Event>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Endpoint pool (rotation state)
    pub fn endpoints(&self) -> &EndpointPool {
        &self.endpoints
    }

    /// Describe a download of `query` without performing it
    pub fn describe(&self, query: &str) -> DownloadInfo {
        DownloadInfo {
            endpoints: self.endpoints.endpoints().to_vec(),
            current_endpoint: self.endpoints.current().to_string(),
            query_length: query.len(),
            request_timeout_secs: self.config.request_timeout.as_secs_f64(),
            max_attempts: self.policy.max_attempts,
        }
    }

    /// Download the result of `query` into `destination`
    ///
    /// On success the destination holds the complete response. On failure any
    /// partial file is removed. A permanent error on the first attempt is
    /// returned as is; after earlier retries it is wrapped in
    /// [`FetchError::Aborted`], and a spent budget yields
    /// [`FetchError::RetriesExhausted`]. Both carry the attempt count.
    pub async fn fetch(&self, query: &str, destination: &Path) -> Result<PathBuf, FetchError> {
        let mut state = self.policy.start();
        let mut consecutive_transient = 0u32;

        loop {
            self.throttle.acquire().await;
            let endpoint = self.endpoints.current().to_string();
            let attempt = state.attempt();

            info!(
                endpoint = %endpoint,
                attempt = attempt + 1,
                max_attempts = self.policy.max_attempts,
                "Requesting map data"
            );
            self.emit(Event::FetchStarted {
                endpoint: endpoint.clone(),
                attempt,
            });

            let error = match self.attempt(&endpoint, query, destination).await {
                Ok(bytes) => {
                    info!(
                        endpoint = %endpoint,
                        bytes,
                        path = %destination.display(),
                        "Download complete"
                    );
                    self.emit(Event::FetchComplete {
                        path: destination.to_path_buf(),
                        bytes,
                    });
                    return Ok(destination.to_path_buf());
                }
                Err(e) => e,
            };

            state.record_failure(error.classification());

            if !error.is_retryable() {
                warn!(
                    endpoint = %endpoint,
                    error = %error,
                    attempts = state.attempts_made(),
                    "Download failed permanently"
                );
                self.discard_partial(destination).await;
                return Err(error.after_attempts(state.attempts_made()));
            }

            if !state.can_retry() {
                warn!(
                    endpoint = %endpoint,
                    error = %error,
                    attempts = state.attempts_made(),
                    "Download failed after all retry attempts exhausted"
                );
                self.discard_partial(destination).await;
                return Err(FetchError::RetriesExhausted {
                    attempts: state.attempts_made(),
                    last: Box::new(error),
                });
            }

            let (delay, rotate) = match &error {
                FetchError::RateLimited { .. } => {
                    consecutive_transient = 0;
                    (self.rate_limit_delay(attempt), true)
                }
                FetchError::Timeout { .. } => {
                    consecutive_transient = 0;
                    (self.policy.delay_for(attempt), true)
                }
                _ => {
                    consecutive_transient += 1;
                    (self.policy.delay_for(attempt), consecutive_transient >= 2)
                }
            };

            warn!(
                endpoint = %endpoint,
                error = %error,
                classification = error.classification(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                rotate,
                "Download attempt failed, retrying"
            );
            self.emit(Event::FetchRetry {
                endpoint: endpoint.clone(),
                attempt,
                classification: error.classification().to_string(),
                delay_ms: delay.as_millis() as u64,
            });

            tokio::time::sleep(delay).await;
            if rotate {
                self.endpoints.rotate();
            }
            state.advance(delay);
        }
    }

    /// Wait after a rate-limit response: a fixed part plus an increment per attempt
    fn rate_limit_delay(&self, attempt: u32) -> Duration {
        self.config.rate_limit_wait + self.config.rate_limit_increment * attempt
    }

    async fn attempt(
        &self,
        endpoint: &str,
        query: &str,
        destination: &Path,
    ) -> Result<u64, FetchError> {
        let timeout = self.config.request_timeout;
        let mut response = self
            .client
            .post(endpoint)
            .form(&[("data", query)])
            .send()
            .await
            .map_err(|e| classify_transport(endpoint, &e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(endpoint, status.as_u16(), &body));
        }

        let total = response.content_length();
        debug!(endpoint = %endpoint, total = ?total, "Streaming response to disk");

        let io_err = |e: std::io::Error| FetchError::Io {
            path: destination.to_path_buf(),
            source: e,
        };

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let file = tokio::fs::File::create(destination).await.map_err(io_err)?;
        let mut writer = BufWriter::new(file);

        let interval = self.config.progress_interval_bytes.max(1);
        let mut downloaded = 0u64;
        let mut next_report = interval;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| classify_transport(endpoint, &e, timeout))?
        {
            writer.write_all(&chunk).await.map_err(io_err)?;
            downloaded += chunk.len() as u64;
            if downloaded >= next_report {
                self.emit(Event::FetchProgress { downloaded, total });
                next_report = downloaded + interval;
            }
        }
        writer.flush().await.map_err(io_err)?;
        self.emit(Event::FetchProgress { downloaded, total });

        if downloaded == 0 {
            return Err(FetchError::EmptyResponse {
                endpoint: endpoint.to_string(),
            });
        }
        Ok(downloaded)
    }

    async fn discard_partial(&self, destination: &Path) {
        if let Err(e) = crate::utils::remove_file_if_exists(destination).await {
            warn!(path = %destination.display(), error = %e, "Failed to remove partial download");
        }
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = &self.event_tx {
            // No subscribers is fine
            let _ = tx.send(event);
        }
    }
}
