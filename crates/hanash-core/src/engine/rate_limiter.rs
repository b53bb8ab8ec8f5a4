//! Token bucket limiter for the per-worker speed cap
//!
//! Each worker attempt gets its own limiter sized from the cap the pool
//! manager computed for it. The bucket is kept small (100 ms worth of
//! data) so concurrent workers queue for tokens instead of bursting.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<State>>,
}

struct State {
    /// Maximum tokens (bytes) the bucket can hold.
    capacity: u64,
    /// Currently available tokens.
    tokens: f64,
    last_refill: Instant,
    /// Tokens added per second, i.e. the speed cap in bytes/s.
    refill_rate: u64,
}

impl RateLimiter {
    /// Create a limiter capped at `bytes_per_second` (> 0).
    pub fn new(bytes_per_second: u64) -> Self {
        let capacity = ((bytes_per_second as f64 * 0.1) as u64).max(1024);
        Self {
            state: Arc::new(Mutex::new(State {
                capacity,
                tokens: capacity as f64,
                last_refill: Instant::now(),
                refill_rate: bytes_per_second.max(1),
            })),
        }
    }

    /// Take `bytes` tokens, sleeping until the bucket refills far enough.
    pub async fn acquire(&self, bytes: u64) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                refill(&mut state);

                if state.tokens >= bytes as f64 {
                    state.tokens -= bytes as f64;
                    return;
                }

                let needed = bytes as f64 - state.tokens;
                state.tokens = 0.0;
                Duration::from_secs_f64(needed / state.refill_rate as f64)
            };

            // sleep outside the lock so sibling workers can refill too
            tokio::time::sleep(wait.min(Duration::from_millis(100))).await;
        }
    }
}

fn refill(state: &mut State) {
    let now = Instant::now();
    let elapsed = now.duration_since(state.last_refill).as_secs_f64();
    if elapsed > 0.0 {
        let new_tokens = elapsed * state.refill_rate as f64;
        state.tokens = (state.tokens + new_tokens).min(state.capacity as f64);
        state.last_refill = now;
    }
}
