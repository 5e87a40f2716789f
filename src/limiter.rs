//! Windowed burst limiting primitives.
//!
//! A [`WindowedLimiter`] admits at most `limit` acquisitions per window of
//! `period`, blocking additional acquirers until the window resets. Waiters
//! are woken in the order they arrived, and a cancelled waiter never
//! consumes a slot: slots are claimed at the instant [`acquire`] returns.
//!
//! The [`GlobalLimiter`] is one such window shared by every bucket,
//! enforcing the API-wide request ceiling.
//!
//! [`acquire`]: WindowedLimiter::acquire

use std::{sync::Mutex, time::Duration};
use tokio::{
    sync::Mutex as AsyncMutex,
    time::{sleep_until, Instant},
};

/// Period of the global ratelimit window.
pub const GLOBAL_LIMIT_PERIOD: Duration = Duration::from_secs(1);

/// Requests allotted per [`GLOBAL_LIMIT_PERIOD`] unless configured
/// otherwise, per the API's documented default.
pub(crate) const DEFAULT_GLOBAL_LIMIT: u64 = 50;

/// Parameters governing admission in the current window.
#[derive(Clone, Copy, Debug)]
struct Window {
    /// Total slots allotted per window.
    limit: u64,
    /// Slots left in the current window.
    remaining: u64,
    /// When the current window ends.
    reset_at: Instant,
    /// Length of a window.
    period: Duration,
}

/// Limiter admitting at most `limit` acquisitions per window of `period`.
#[derive(Debug)]
pub struct WindowedLimiter {
    /// Queue of acquirers; the lock is fair, so waiters are woken in FIFO
    /// order.
    queue: AsyncMutex<()>,
    /// Current window parameters.
    window: Mutex<Window>,
}

impl WindowedLimiter {
    /// Create a new limiter allotting `limit` slots per `period`.
    #[must_use]
    pub fn new(limit: u64, period: Duration) -> Self {
        Self {
            queue: AsyncMutex::new(()),
            window: Mutex::new(Window {
                limit,
                remaining: limit,
                reset_at: Instant::now() + period,
                period,
            }),
        }
    }

    /// Wait for a slot in the window, claiming it upon return.
    pub async fn acquire(&self) {
        let _queue = self.queue.lock().await;

        loop {
            let reset_at = {
                let mut window = self.window.lock().expect("window poisoned");
                let now = Instant::now();

                if now >= window.reset_at {
                    window.remaining = window.limit;
                    window.reset_at = now + window.period;
                }

                if window.remaining > 0 {
                    window.remaining -= 1;

                    return;
                }

                window.reset_at
            };

            sleep_until(reset_at).await;
        }
    }

    /// Whether an acquisition at `now` would have to wait.
    #[must_use]
    pub fn is_rate_limited(&self, now: Instant) -> bool {
        let window = self.window.lock().expect("window poisoned");

        window.remaining == 0 && now < window.reset_at
    }

    /// Install window parameters reported by the API.
    ///
    /// The period is recomputed as the time left until `reset_at`, clamped
    /// to zero, and `remaining` is clamped to `limit`.
    pub fn update(&self, remaining: u64, limit: u64, reset_at: Instant) {
        let mut window = self.window.lock().expect("window poisoned");

        window.limit = limit;
        window.remaining = remaining.min(limit);
        window.reset_at = reset_at;
        window.period = reset_at.saturating_duration_since(Instant::now());
    }

    /// Empty the current window until `duration` has passed.
    ///
    /// The limit and period are untouched, so the window refills to its
    /// usual allotment once the penalty is over. Used for preemptive
    /// retry-after signals.
    pub fn throttle(&self, duration: Duration) {
        let mut window = self.window.lock().expect("window poisoned");

        window.remaining = 0;
        window.reset_at = Instant::now() + duration;
    }

    /// Total slots allotted per window.
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.window.lock().expect("window poisoned").limit
    }

    /// Slots left in the current window.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.window.lock().expect("window poisoned").remaining
    }

    /// When the current window ends.
    #[must_use]
    pub fn reset_at(&self) -> Instant {
        self.window.lock().expect("window poisoned").reset_at
    }
}

/// Cross-bucket limiter enforcing the API-wide request ceiling.
#[derive(Debug)]
pub struct GlobalLimiter {
    /// Window shared by every bucket, one [`GLOBAL_LIMIT_PERIOD`] long.
    inner: WindowedLimiter,
}

impl GlobalLimiter {
    /// Create a new global limiter allotting `limit` requests per
    /// [`GLOBAL_LIMIT_PERIOD`].
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            inner: WindowedLimiter::new(limit, GLOBAL_LIMIT_PERIOD),
        }
    }

    /// Wait for a slot in the global window.
    pub async fn acquire(&self) {
        self.inner.acquire().await;
    }

    /// Block every bucket for `retry_after`, in response to a global 429.
    pub fn throttle(&self, retry_after: Duration) {
        tracing::debug!(?retry_after, "globally ratelimited");

        self.inner.throttle(retry_after);
    }

    /// Whether the global window is exhausted at `now`.
    #[must_use]
    pub fn is_locked(&self, now: Instant) -> bool {
        self.inner.is_rate_limited(now)
    }
}

#[cfg(test)]
mod tests {
    use super::{GlobalLimiter, WindowedLimiter, GLOBAL_LIMIT_PERIOD};
    use static_assertions::assert_impl_all;
    use std::{fmt::Debug, time::Duration};
    use tokio::time::{self, Instant};

    assert_impl_all!(WindowedLimiter: Debug, Send, Sync);
    assert_impl_all!(GlobalLimiter: Debug, Send, Sync);

    #[tokio::test(start_paused = true)]
    async fn acquire_refills_after_period() {
        let limiter = WindowedLimiter::new(2, Duration::from_secs(1));
        let now = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(0, limiter.remaining());
        assert!(now.elapsed() < Duration::from_secs(1));

        limiter.acquire().await;
        assert!(now.elapsed() >= Duration::from_secs(1));
        assert_eq!(1, limiter.remaining());
    }

    #[tokio::test(start_paused = true)]
    async fn update_installs_parameters() {
        let limiter = WindowedLimiter::new(1, Duration::from_secs(1));
        let reset_at = Instant::now() + Duration::from_secs(5);

        limiter.update(0, 3, reset_at);

        assert!(limiter.is_rate_limited(Instant::now()));
        assert_eq!(reset_at, limiter.reset_at());
        assert_eq!(3, limiter.limit());

        let now = Instant::now();
        limiter.acquire().await;
        assert!(now.elapsed() >= Duration::from_secs(5));
        assert_eq!(2, limiter.remaining());
    }

    #[tokio::test(start_paused = true)]
    async fn update_clamps_remaining_to_limit() {
        let limiter = WindowedLimiter::new(1, Duration::from_secs(1));

        limiter.update(9, 3, Instant::now() + Duration::from_secs(5));

        assert_eq!(3, limiter.remaining());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_claims_no_slot() {
        let limiter = WindowedLimiter::new(1, Duration::from_secs(1));

        limiter.acquire().await;
        assert_eq!(0, limiter.remaining());

        {
            let acquire = limiter.acquire();
            tokio::pin!(acquire);
            assert!(futures_util::poll!(acquire.as_mut()).is_pending());
        }

        time::advance(Duration::from_secs(1)).await;

        limiter.acquire().await;
        assert_eq!(0, limiter.remaining());
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_fifo() {
        let limiter = WindowedLimiter::new(1, Duration::from_secs(1));

        limiter.acquire().await;

        let first = limiter.acquire();
        tokio::pin!(first);
        let second = limiter.acquire();
        tokio::pin!(second);

        assert!(futures_util::poll!(first.as_mut()).is_pending());
        assert!(futures_util::poll!(second.as_mut()).is_pending());

        time::advance(Duration::from_secs(1)).await;

        tokio::select! {
            biased;
            _ = second.as_mut() => panic!("not acquired in order"),
            _ = first.as_mut() => {}
        }

        second.await;
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_empties_window() {
        let limiter = WindowedLimiter::new(3, GLOBAL_LIMIT_PERIOD);
        let now = Instant::now();

        limiter.throttle(Duration::from_secs(2));
        assert!(limiter.is_rate_limited(now));

        limiter.acquire().await;
        assert!(now.elapsed() >= Duration::from_secs(2));
        assert_eq!(2, limiter.remaining());
    }
}
