use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{StatusCode, Url};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{PubMedError, Result};

const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

// ─── Clock ────────────────────────────────────────────────────────────────────

/// Time source for rate limiting and retry backoff.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that only moves when slept on or advanced. Records every sleep.
pub struct ManualClock {
    origin: Instant,
    state: StdMutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    offset: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: StdMutex::new(ManualState::default()),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.state().offset += by;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.state().sleeps.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.state().offset
    }

    async fn sleep(&self, duration: Duration) {
        let mut state = self.state();
        state.offset += duration;
        state.sleeps.push(duration);
    }
}

// ─── RateLimiter ──────────────────────────────────────────────────────────────

/// Shared rate-limit clock: successive `acquire` calls return at least
/// `min_interval` apart, across every caller holding the limiter.
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
            clock,
        }
    }

    pub fn system(min_interval: Duration) -> Self {
        Self::new(min_interval, Arc::new(SystemClock))
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(t) = *last {
            let elapsed = self.clock.now().saturating_duration_since(t);
            if elapsed < self.min_interval {
                self.clock.sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(self.clock.now());
    }
}

// ─── RateLimitedClient ────────────────────────────────────────────────────────

pub struct RateLimitedClient {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    max_retries: u32,
}

impl RateLimitedClient {
    pub fn new(limiter: Arc<RateLimiter>, max_retries: u32, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .gzip(true)
            .build()?;
        Ok(Self {
            client,
            limiter,
            max_retries,
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// GET `url` and return the body. Errors name only the endpoint path so
    /// credentials in the query string never reach logs.
    pub async fn get(&self, url: Url) -> Result<String> {
        let endpoint = url.path().to_string();
        let clock = self.limiter.clock();
        let mut attempt = 0u32;
        loop {
            self.limiter.acquire().await;
            let resp = self.client.get(url.clone()).send().await;
            match resp {
                Ok(r) if r.status() == StatusCode::TOO_MANY_REQUESTS => {
                    let wait = r
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.trim().parse::<u64>().ok())
                        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                    if attempt >= self.max_retries {
                        return Err(PubMedError::RateLimit(endpoint, wait));
                    }
                    warn!(endpoint = %endpoint, wait, "rate limited, backing off");
                    clock.sleep(Duration::from_secs(wait)).await;
                    attempt += 1;
                }
                Ok(r) if !r.status().is_success() => {
                    let status = r.status().as_u16();
                    let body = r.text().await.unwrap_or_default();
                    return Err(PubMedError::ApiError(
                        endpoint,
                        format!("HTTP {status}: {}", body.trim()),
                    ));
                }
                Ok(r) => return r.text().await.map_err(PubMedError::Http),
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(PubMedError::Http(e));
                    }
                    let backoff = 2u64.pow(attempt);
                    debug!(endpoint = %endpoint, attempt, backoff, "transport error, retrying: {e}");
                    clock.sleep(Duration::from_secs(backoff)).await;
                    attempt += 1;
                }
            }
        }
    }
}
