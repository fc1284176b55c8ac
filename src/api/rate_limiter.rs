use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::FetchError;

const MAX_RETRIES: u32 = 3;

/// Token bucket in front of the plain REST endpoints
pub struct RateLimiter {
    /// One permit per available request (capacity = burst size)
    semaphore: Arc<Semaphore>,
    tokens_per_second: u32,
    max_tokens: u32,
    last_refill: tokio::sync::Mutex<Instant>,
    initial_backoff: Duration,
}

impl RateLimiter {
    pub fn new(tokens_per_second: u32, max_tokens: u32) -> Self {
        let tokens_per_second = tokens_per_second.max(1);
        let max_tokens = max_tokens.max(1);

        Self {
            semaphore: Arc::new(Semaphore::new(max_tokens as usize)),
            tokens_per_second,
            max_tokens,
            last_refill: tokio::sync::Mutex::new(Instant::now()),
            initial_backoff: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Wait until a request may be sent
    pub async fn acquire(&self) {
        let wait = Duration::from_secs_f64(1.0 / f64::from(self.tokens_per_second));

        loop {
            self.refill().await;

            match self.semaphore.try_acquire() {
                Ok(permit) => {
                    // tokens come back through refill(), not by dropping the permit
                    permit.forget();
                    return;
                }
                Err(tokio::sync::TryAcquireError::NoPermits) => sleep(wait).await,
                Err(tokio::sync::TryAcquireError::Closed) => {
                    warn!("限流器信号量意外关闭");
                    sleep(wait).await;
                }
            }
        }
    }

    async fn refill(&self) {
        let mut last_refill = self.last_refill.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(*last_refill);

        #[allow(clippy::cast_sign_loss)]
        let earned = (elapsed.as_secs_f64() * f64::from(self.tokens_per_second)) as u32;
        if earned == 0 {
            return;
        }

        let available = self.semaphore.available_permits() as u32;
        let to_add = earned.min(self.max_tokens.saturating_sub(available));
        if to_add > 0 {
            self.semaphore.add_permits(to_add as usize);
            *last_refill = now;
        }
    }

    /// Run `f` under the limiter, retrying HTTP 429 with exponential backoff
    pub async fn execute<F, T>(&self, request_name: &str, mut f: F) -> Result<T, FetchError>
    where
        F: FnMut() -> BoxFuture<'static, Result<T, FetchError>>,
    {
        let mut attempt = 0;
        let mut backoff = self.initial_backoff;

        loop {
            self.acquire().await;
            debug!(request = request_name, attempt, "发送限流请求");

            match f().await {
                Err(err) if err.is_rate_limited() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    warn!(
                        request = request_name,
                        attempt,
                        max = MAX_RETRIES,
                        ?backoff,
                        "触发限流，稍后重试"
                    );
                    sleep(backoff).await;
                    backoff *= 2;
                }
                result => return result,
            }
        }
    }

    pub fn available_tokens(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test(start_paused = true)]
    async fn first_acquire_is_immediate() {
        let limiter = RateLimiter::new(10, 20);
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(limiter.available_tokens(), 19);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_refill_after_burst() {
        let limiter = RateLimiter::new(10, 5);
        for _ in 0..5 {
            limiter.acquire().await;
        }

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limited_requests() {
        let limiter = RateLimiter::new(10, 20).with_backoff(Duration::from_millis(50));
        let mut attempt = 0;

        let result = limiter
            .execute("search", || {
                attempt += 1;
                let current = attempt;
                async move {
                    if current < 2 {
                        Err(FetchError::Status {
                            status: 429,
                            body: "too many requests".to_string(),
                        })
                    } else {
                        Ok(42)
                    }
                }
                .boxed()
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_other_failures() {
        let limiter = RateLimiter::new(10, 20);
        let mut attempt = 0;

        let result: Result<u32, _> = limiter
            .execute("news", || {
                attempt += 1;
                async { Err(FetchError::Network("connection reset".to_string())) }.boxed()
            })
            .await;

        assert!(matches!(result, Err(FetchError::Network(_))));
        assert_eq!(attempt, 1);
    }
}
