//! Token-bucket rate limiting for the ingest stream
//!
//! Two buckets, records and bytes, refilled continuously (`tokens += rate × Δt`,
//! capped at burst). A send acquires from both; the limiter blocks until both
//! dimensions are satisfiable, waking within one refill tick.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use otb_core::{BridgeError, RateLimitSpec};

#[derive(Debug)]
struct Bucket {
    rate: f64,
    burst: f64,
    tokens: f64,
}

impl Bucket {
    fn new(rate: u64, burst_mult: f64) -> Self {
        let rate = rate as f64;
        let burst = rate * burst_mult;
        Self {
            rate,
            burst,
            tokens: burst,
        }
    }

    fn refill(&mut self, elapsed: Duration) {
        self.tokens = (self.tokens + self.rate * elapsed.as_secs_f64()).min(self.burst);
    }

    /// Seconds until `needed` tokens are available; zero when satisfiable now
    fn deficit_secs(&self, needed: f64) -> f64 {
        if self.tokens >= needed {
            0.0
        } else {
            (needed - self.tokens) / self.rate
        }
    }
}

#[derive(Debug)]
struct Inner {
    records: Bucket,
    bytes: Bucket,
    last_refill: Instant,
}

pub struct RateLimiter {
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(spec: &RateLimitSpec) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: Bucket::new(spec.records_per_sec, spec.burst_mult),
                bytes: Bucket::new(spec.bytes_per_sec, spec.burst_mult),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Block until `n_records` and `n_bytes` can both be deducted.
    ///
    /// Requests larger than the burst size are admitted once the buckets are
    /// full; they cannot be paced more finely than the burst allows.
    pub async fn acquire(
        &self,
        n_records: usize,
        n_bytes: usize,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        let need_records = n_records as f64;
        let need_bytes = n_bytes as f64;
        loop {
            let wait = {
                let mut inner = self.inner.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(inner.last_refill);
                inner.last_refill = now;
                inner.records.refill(elapsed);
                inner.bytes.refill(elapsed);

                let need_records = need_records.min(inner.records.burst);
                let need_bytes = need_bytes.min(inner.bytes.burst);
                let deficit = inner
                    .records
                    .deficit_secs(need_records)
                    .max(inner.bytes.deficit_secs(need_bytes));
                if deficit == 0.0 {
                    inner.records.tokens -= need_records;
                    inner.bytes.tokens -= need_bytes;
                    return Ok(());
                }
                Duration::from_secs_f64(deficit)
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(records: u64, bytes: u64) -> RateLimitSpec {
        RateLimitSpec {
            records_per_sec: records,
            bytes_per_sec: bytes,
            burst_mult: 2.0,
        }
    }

    #[tokio::test]
    async fn burst_is_admitted_immediately() {
        let limiter = RateLimiter::new(&spec(100, 10_000));
        let cancel = CancellationToken::new();
        // burst = 200 records
        limiter.acquire(200, 1_000, &cancel).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn depleted_bucket_blocks_until_refill() {
        let limiter = RateLimiter::new(&spec(100, 1_000_000));
        let cancel = CancellationToken::new();
        limiter.acquire(200, 0, &cancel).await.unwrap();

        let started = tokio::time::Instant::now();
        limiter.acquire(50, 0, &cancel).await.unwrap();
        // 50 records at 100/s takes ~500ms to refill
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(450), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(700), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn slowest_dimension_governs() {
        let limiter = RateLimiter::new(&spec(1_000_000, 100));
        let cancel = CancellationToken::new();
        limiter.acquire(1, 200, &cancel).await.unwrap();
        let started = tokio::time::Instant::now();
        limiter.acquire(1, 100, &cancel).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn cancellation_interrupts_acquire() {
        let limiter = RateLimiter::new(&spec(1, 1));
        let cancel = CancellationToken::new();
        limiter.acquire(2, 0, &cancel).await.unwrap();
        cancel.cancel();
        let err = limiter.acquire(2, 0, &cancel).await.unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));
    }
}
