//! Per-provider call budgets.
//!
//! `acquire` suspends the caller until both constraints hold: fewer than
//! `max_calls` in the rolling window, and at least `min_gap` since the
//! provider's last call. Strictly first-come-first-served: the state lock
//! is held across the wait, and tokio's mutex queues waiters in arrival
//! order. Never errors; each waiter proceeds as soon as its slot opens.
//!
//! The limiter does not observe HTTP status; on a 429 the caller sleeps
//! `BACKOFF_429` and re-acquires a slot.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Fixed backoff callers apply after a 429-class response.
pub const BACKOFF_429: Duration = Duration::from_secs(15);

/// Link-resolution API budget: 9 calls per rolling minute, 7 s apart.
pub fn link_api_limiter() -> RateLimiter {
    RateLimiter::new(9, Duration::from_secs(60), Duration::from_secs(7))
}

pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    min_gap: Duration,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Completion times of calls inside the current window, oldest first.
    calls: VecDeque<Instant>,
    last_call: Option<Instant>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration, min_gap: Duration) -> Self {
        Self {
            max_calls,
            window,
            min_gap,
            state: Mutex::new(State::default()),
        }
    }

    /// Suspend until a call slot is available, then claim it. The guard is
    /// held while sleeping so later arrivals cannot steal the slot.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        loop {
            let now = Instant::now();

            while let Some(front) = state.calls.front() {
                if now.duration_since(*front) >= self.window {
                    state.calls.pop_front();
                } else {
                    break;
                }
            }

            let gap_wait = state
                .last_call
                .map(|last| self.min_gap.saturating_sub(now.duration_since(last)))
                .filter(|d| !d.is_zero());
            let window_wait = if state.calls.len() >= self.max_calls {
                state
                    .calls
                    .front()
                    .map(|oldest| self.window - now.duration_since(*oldest))
            } else {
                None
            };

            match (gap_wait, window_wait) {
                (None, None) => {
                    state.calls.push_back(now);
                    state.last_call = Some(now);
                    return;
                }
                (a, b) => {
                    if let Some(wait) = a.into_iter().chain(b).max() {
                        debug!("rate limiter: waiting {:?} for a slot", wait);
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }
    }
}
