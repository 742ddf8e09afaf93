use std::sync::Mutex;
use std::time::Instant;

use log::{debug, trace, warn};
use rand::Rng;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::time::sleep;

use tally_common::events::{EventBus, IngestEvent};

use crate::provider::registry::{ProviderConfig, RateLimit, RetryPolicy};
use crate::provider::ProviderError;

// Rate-limited, retrying HTTP client shared by the concrete providers.
// One instance per provider; the rate limit and retry policy come from the
// provider's configuration.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
    domain: String,
    provider: String,
    rate_limit: RateLimit,
    retries: RetryPolicy,
    events: EventBus,
    // Instant of the last outgoing request; lock is held only to compute
    // the next slot, never across I/O
    last_request_at: Mutex<Option<Instant>>,
    api_key: Option<String>,
}

impl HttpClient {
    pub fn new(
        domain: impl Into<String>,
        provider: impl Into<String>,
        base_url: impl Into<String>,
        config: &ProviderConfig,
        events: EventBus,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            domain: domain.into(),
            provider: provider.into(),
            rate_limit: config.rate_limit.clone(),
            retries: config.retries.clone(),
            events,
            last_request_at: Mutex::new(None),
            api_key: config.api_key.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // GET {base_url}{path} and decode the body as JSON
    pub async fn get_json(&self, path: &str) -> Result<Value, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        self.request_json(&url).await
    }

    async fn request_json(&self, url: &str) -> Result<Value, ProviderError> {
        let operation = url.to_owned();
        let mut delay_ms = self.retries.base_delay_ms;
        let mut attempt: u32 = 0;

        loop {
            self.throttle().await;

            self.events.emit(IngestEvent::ProviderRequestStarted {
                domain: self.domain.clone(),
                provider: self.provider.clone(),
                operation: operation.clone(),
            });

            let started = Instant::now();
            let mut request = self.client.get(url);
            if let Some(key) = &self.api_key {
                request = request.header("API-Key", key);
            }

            let outcome = request.send().await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let retry_in = self.jittered(delay_ms);
                        self.events.emit(IngestEvent::ProviderRateLimited {
                            domain: self.domain.clone(),
                            provider: self.provider.clone(),
                            retry_in_ms: retry_in,
                        });
                        if attempt >= self.retries.max_retries {
                            return Err(ProviderError::RateLimited(attempt + 1));
                        }
                        debug!(
                            "{} rate limited, retrying in {}ms",
                            self.provider, retry_in
                        );
                        self.backoff(attempt, retry_in).await;
                    } else if status.is_server_error() {
                        let message = response.text().await.unwrap_or_default();
                        if attempt >= self.retries.max_retries {
                            return Err(ProviderError::Api {
                                status: status.as_u16(),
                                message,
                            });
                        }
                        warn!(
                            "{} answered {} ({}), retrying",
                            self.provider, status, message
                        );
                        let retry_in = self.jittered(delay_ms);
                        self.backoff(attempt, retry_in).await;
                    } else if !status.is_success() {
                        let message = response.text().await.unwrap_or_default();
                        self.emit_failed(&operation, &message);
                        return Err(ProviderError::Api {
                            status: status.as_u16(),
                            message,
                        });
                    } else {
                        let value = response.json::<Value>().await?;
                        self.events.emit(IngestEvent::ProviderRequestSucceeded {
                            domain: self.domain.clone(),
                            provider: self.provider.clone(),
                            operation: operation.clone(),
                            elapsed_ms,
                        });
                        return Ok(value);
                    }
                }
                Err(e) => {
                    self.emit_failed(&operation, &e.to_string());
                    if attempt >= self.retries.max_retries {
                        return Err(ProviderError::Http(e));
                    }
                    warn!("{} request failed ({}), retrying", self.provider, e);
                    let retry_in = self.jittered(delay_ms);
                    self.backoff(attempt, retry_in).await;
                }
            }

            attempt += 1;
            delay_ms = delay_ms.saturating_mul(2);
        }
    }

    // Space requests at least min_interval apart
    async fn throttle(&self) {
        let min_interval = self.rate_limit.min_interval();
        let wait = {
            let mut last = self
                .last_request_at
                .lock()
                .expect("http throttle lock poisoned");
            let now = Instant::now();
            let wait = match *last {
                Some(at) => min_interval.checked_sub(now.duration_since(at)),
                None => None,
            };
            // reserve the slot before sleeping so concurrent callers space out
            *last = Some(now + wait.unwrap_or_default());
            wait
        };

        if let Some(wait) = wait {
            trace!("throttling {} for {:?}", self.provider, wait);
            sleep(wait).await;
        }
    }

    async fn backoff(&self, attempt: u32, delay_ms: u64) {
        self.events.emit(IngestEvent::ProviderBackoff {
            domain: self.domain.clone(),
            provider: self.provider.clone(),
            attempt: attempt + 1,
            delay_ms,
        });
        sleep(std::time::Duration::from_millis(delay_ms)).await;
    }

    fn jittered(&self, delay_ms: u64) -> u64 {
        let spread = (delay_ms / 2).max(1);
        delay_ms + rand::thread_rng().gen_range(0..spread)
    }

    fn emit_failed(&self, operation: &str, error: &str) {
        self.events.emit(IngestEvent::ProviderRequestFailed {
            domain: self.domain.clone(),
            provider: self.provider.clone(),
            operation: operation.to_owned(),
            error: error.to_owned(),
        });
    }
}
