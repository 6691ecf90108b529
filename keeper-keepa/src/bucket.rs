use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing;

use crate::error::{KeepaError, KeepaResult};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(120);

/// Point-in-time view of the bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSnapshot {
    pub available: u32,
    pub per_minute: u32,
    pub seconds_since_refill: u64,
    pub total_consumed: u64,
}

#[derive(Debug)]
struct BucketState {
    available: u32,
    capacity: u32,
    per_minute: u32,
    last_refill: Instant,
    total_consumed: u64,
}

impl BucketState {
    /// Lazy refill: credit whole tokens earned since the last refill and
    /// advance the refill mark only by the time those tokens account for,
    /// so fractional progress is never dropped.
    fn refill(&mut self, now: Instant) {
        if self.per_minute == 0 || self.available >= self.capacity {
            self.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned = (elapsed.as_secs_f64() * self.per_minute as f64 / 60.0).floor() as u32;
        if earned == 0 {
            return;
        }

        let credited = earned.min(self.capacity - self.available);
        self.available += credited;
        self.last_refill += Duration::from_secs_f64(earned as f64 * 60.0 / self.per_minute as f64);
        if self.available >= self.capacity {
            self.last_refill = now;
        }
    }

    fn try_consume(&mut self, cost: u32, now: Instant) -> bool {
        self.refill(now);
        if self.available >= cost {
            self.available -= cost;
            self.total_consumed += cost as u64;
            true
        } else {
            false
        }
    }
}

/// Admission control for outbound API calls. One bucket per process, shared
/// by every caller; all mutation happens under a single mutex.
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(per_minute: u32, capacity: u32) -> Self {
        TokenBucket {
            state: Mutex::new(BucketState {
                available: capacity,
                capacity,
                per_minute,
                last_refill: Instant::now(),
                total_consumed: 0,
            }),
        }
    }

    /// Block until `cost` tokens are available and consume them atomically.
    /// Fails with TokensExhausted once `max_wait` elapses; the bucket is
    /// left unchanged in that case.
    pub async fn acquire(&self, cost: u32, max_wait: Duration) -> KeepaResult<()> {
        let started = Instant::now();

        loop {
            {
                let mut state = self.state.lock().await;
                if state.try_consume(cost, Instant::now()) {
                    let waited = started.elapsed();
                    if waited > Duration::from_secs(1) {
                        tracing::info!("Waited {:.1}s for {} tokens", waited.as_secs_f64(), cost);
                    }
                    tracing::debug!("Tokens consumed: -{}, remaining: {}", cost, state.available);
                    return Ok(());
                }
            }

            if started.elapsed() >= max_wait {
                tracing::warn!("Timed out waiting {}s for {} tokens", max_wait.as_secs(), cost);
                return Err(KeepaError::TokensExhausted {
                    cost,
                    waited_secs: max_wait.as_secs(),
                });
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Replace the local count with the server-reported balance. Called
    /// after every successful API response to eliminate drift; last writer
    /// wins when in-flight calls complete out of order.
    pub async fn sync(&self, server_reported: u32) {
        let mut state = self.state.lock().await;
        state.available = server_reported;
        state.last_refill = Instant::now();
        tracing::debug!("Token bucket synced to server balance: {}", server_reported);
    }

    pub async fn set_rate(&self, per_minute: u32) {
        let mut state = self.state.lock().await;
        if per_minute > 0 {
            state.per_minute = per_minute;
        }
    }

    pub async fn snapshot(&self) -> BucketSnapshot {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.refill(now);
        BucketSnapshot {
            available: state.available,
            per_minute: state.per_minute,
            seconds_since_refill: now.saturating_duration_since(state.last_refill).as_secs(),
            total_consumed: state.total_consumed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consumes_from_a_full_bucket() {
        let bucket = TokenBucket::new(20, 200);
        bucket.acquire(15, DEFAULT_MAX_WAIT).await.unwrap();
        let snap = bucket.snapshot().await;
        assert_eq!(snap.available, 185);
        assert_eq!(snap.total_consumed, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn refills_at_the_configured_rate() {
        let bucket = TokenBucket::new(20, 200);
        bucket.acquire(200, DEFAULT_MAX_WAIT).await.unwrap();
        assert_eq!(bucket.snapshot().await.available, 0);

        // 20 per minute is one token every 3 seconds.
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(bucket.snapshot().await.available, 3);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bucket.snapshot().await.available, 23);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_capacity() {
        let bucket = TokenBucket::new(60, 10);
        bucket.acquire(10, DEFAULT_MAX_WAIT).await.unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(bucket.snapshot().await.available, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_blocks_until_refill_covers_the_cost() {
        let bucket = TokenBucket::new(20, 200);
        bucket.acquire(200, DEFAULT_MAX_WAIT).await.unwrap();

        // 15 tokens at 20/min arrive after 45s; the poll loop picks them up.
        bucket.acquire(15, DEFAULT_MAX_WAIT).await.unwrap();
        assert_eq!(bucket.snapshot().await.available, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_bucket_with_zero_rate_times_out() {
        let bucket = TokenBucket::new(0, 10);
        bucket.acquire(10, DEFAULT_MAX_WAIT).await.unwrap();

        let before = bucket.snapshot().await;
        let err = bucket
            .acquire(5, Duration::from_secs(2))
            .await
            .expect_err("must time out");
        assert!(matches!(err, KeepaError::TokensExhausted { cost: 5, .. }));
        // Failed acquire leaves the bucket unchanged.
        assert_eq!(bucket.snapshot().await.available, before.available);
    }

    #[tokio::test]
    async fn sync_replaces_the_local_balance() {
        let bucket = TokenBucket::new(20, 200);
        bucket.acquire(150, DEFAULT_MAX_WAIT).await.unwrap();
        bucket.sync(7).await;
        assert_eq!(bucket.snapshot().await.available, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn fractional_refill_progress_is_preserved() {
        let bucket = TokenBucket::new(20, 200);
        bucket.acquire(200, DEFAULT_MAX_WAIT).await.unwrap();

        // 4s earns one token (3s) and keeps 1s of progress.
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(bucket.snapshot().await.available, 1);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(bucket.snapshot().await.available, 2);
    }
}
