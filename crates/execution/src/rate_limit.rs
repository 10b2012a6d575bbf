// In crates/execution/src/rate_limit.rs

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

struct BucketState {
    tokens: f64,
    updated: Instant,
}

/// An async token bucket used to pace REST calls against a venue's rate
/// limit. One bucket per adapter; the router additionally serializes
/// calls per broker, so the bucket only smooths bursts within a cycle.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            rate: rate_per_sec,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                updated: Instant::now(),
            }),
        }
    }

    /// Waits until a token is available, then consumes it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let dt = now.duration_since(state.updated).as_secs_f64();
                state.updated = now;
                state.tokens = (state.tokens + dt * self.rate).min(self.capacity);

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                let deficit = 1.0 - state.tokens;
                if self.rate > 0.0 { deficit / self.rate } else { 1.0 }
            };
            sleep(Duration::from_secs_f64(wait.max(0.0))).await;
        }
    }
}
