//! Buckets of ratelimited requests, gated to one in flight at a time.
//!
//! A [`Bucket`] pairs a mutual-exclusion gate with a [`WindowedLimiter`].
//! The gate serialises in-flight requests so that response headers arrive
//! in a well-defined order before the next request is sent; the window
//! enforces the API's count per reset period. Both are needed: the window
//! alone would not stop concurrent in-flight requests from racing past the
//! remaining count.
//!
//! Acquirers of an unresolved bucket skip the window, since no parameters
//! have been learned yet, but still take the gate and the global limiter.

use crate::{
    error::{RatelimitError, RatelimitErrorType},
    limiter::{GlobalLimiter, WindowedLimiter},
    request::CompiledRoute,
    UNKNOWN_HASH,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex as AsyncMutex, MutexGuard},
    time::Instant,
};

/// Window slots assumed until the API reports real parameters.
const INITIAL_LIMIT: u64 = 1;

/// Window length assumed until the API reports real parameters.
const INITIAL_PERIOD: Duration = Duration::from_secs(1);

/// Registration of a caller that is inside or queued on a bucket.
///
/// Registered before the gate is awaited and deregistered on drop, so a
/// cancelled acquirer leaves no trace.
#[derive(Debug)]
struct PendingGuard<'a> {
    /// Counter the registration lives in.
    pending: &'a AtomicUsize,
}

impl<'a> PendingGuard<'a> {
    /// Register a caller on the given counter.
    fn register(pending: &'a AtomicUsize) -> Self {
        pending.fetch_add(1, Ordering::AcqRel);

        Self { pending }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Permit to perform one request in a bucket.
///
/// Dropping the permit releases the bucket's gate, letting the next queued
/// acquirer through. Hold it for the duration of the request; dropping on
/// any path, including cancellation, releases the gate.
#[derive(Debug)]
pub struct BucketGuard<'a> {
    /// Held gate of the bucket, released first on drop.
    _gate: MutexGuard<'a, ()>,
    /// Pending registration, released after the gate.
    _pending: PendingGuard<'a>,
}

/// Ratelimit state for all requests sharing one server-assigned bucket.
#[derive(Debug)]
pub struct Bucket {
    /// Real hash the bucket is registered under.
    name: Mutex<String>,
    /// Route that first created the bucket, for diagnostics.
    route: CompiledRoute,
    /// Limiter enforcing the API-wide ceiling, shared with every bucket.
    global: Arc<GlobalLimiter>,
    /// Window enforcing the bucket's own count per reset period.
    window: WindowedLimiter,
    /// Gate serialising in-flight requests; fair, so acquirers are FIFO.
    gate: AsyncMutex<()>,
    /// Number of callers inside the bucket or queued on its gate.
    pending: AtomicUsize,
    /// Whether the bucket has been closed.
    closed: AtomicBool,
    /// Longest predicted wait an acquire will agree to.
    max_rate_limit: Option<Duration>,
}

impl Bucket {
    /// Create a new bucket named by a real hash.
    pub(crate) fn new(
        name: String,
        route: CompiledRoute,
        global: Arc<GlobalLimiter>,
        max_rate_limit: Option<Duration>,
    ) -> Self {
        Self {
            name: Mutex::new(name),
            route,
            global,
            window: WindowedLimiter::new(INITIAL_LIMIT, INITIAL_PERIOD),
            gate: AsyncMutex::new(()),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            max_rate_limit,
        }
    }

    /// Real hash the bucket is currently registered under.
    #[must_use]
    pub fn name(&self) -> String {
        self.name.lock().expect("name poisoned").clone()
    }

    /// Route that first created the bucket.
    #[must_use]
    pub const fn route(&self) -> &CompiledRoute {
        &self.route
    }

    /// Whether the bucket's identity has not been learned yet.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.name
            .lock()
            .expect("name poisoned")
            .starts_with(UNKNOWN_HASH)
    }

    /// Whether no caller is inside the bucket or queued on its gate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
    }

    /// Whether an acquisition at `now` would have to wait on the window.
    #[must_use]
    pub fn is_rate_limited(&self, now: Instant) -> bool {
        self.window.is_rate_limited(now)
    }

    /// Total requests allotted per window.
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.window.limit()
    }

    /// Requests left in the current window.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.window.remaining()
    }

    /// When the current window ends.
    #[must_use]
    pub fn reset_at(&self) -> Instant {
        self.window.reset_at()
    }

    /// Wait for clearance to perform one request.
    ///
    /// Takes the gate, then a slot in the bucket's window if the bucket is
    /// resolved, and finally a slot in the global window. Cancelling the
    /// returned future releases whatever was already taken.
    ///
    /// # Errors
    ///
    /// Returns an error of type [`RateLimitTooLong`] if the predicted wait
    /// on the bucket's window exceeds the configured maximum; the gate is
    /// released before returning and no window slot is consumed.
    ///
    /// Returns an error of type [`Closed`] if the bucket has been closed.
    ///
    /// [`Closed`]: RatelimitErrorType::Closed
    /// [`RateLimitTooLong`]: RatelimitErrorType::RateLimitTooLong
    pub async fn acquire(&self) -> Result<BucketGuard<'_>, RatelimitError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RatelimitError::new(RatelimitErrorType::Closed));
        }

        let pending = PendingGuard::register(&self.pending);
        let gate = self.gate.lock().await;

        if !self.is_unknown() {
            if let Some(max_rate_limit) = self.max_rate_limit {
                let now = Instant::now();

                if self.window.is_rate_limited(now) {
                    let wait = self.window.reset_at().saturating_duration_since(now);

                    if wait > max_rate_limit {
                        tracing::debug!(route = %self.route, ?wait, "refusing to wait out ratelimit");

                        return Err(RatelimitError::new(RatelimitErrorType::RateLimitTooLong {
                            wait,
                        }));
                    }
                }
            }

            self.window.acquire().await;
        }

        self.global.acquire().await;

        Ok(BucketGuard {
            _gate: gate,
            _pending: pending,
        })
    }

    /// Install window parameters reported by the API.
    pub fn update_rate_limit(&self, remaining: u64, limit: u64, reset_at: Instant) {
        self.window.update(remaining, limit, reset_at);
    }

    /// Name the bucket with the real hash learned from the API.
    ///
    /// # Errors
    ///
    /// Returns an error of type [`AlreadyResolved`] if the bucket carries a
    /// real hash already; resolving happens exactly once.
    ///
    /// [`AlreadyResolved`]: RatelimitErrorType::AlreadyResolved
    pub fn resolve(&self, real_hash: String) -> Result<(), RatelimitError> {
        let mut name = self.name.lock().expect("name poisoned");

        if !name.starts_with(UNKNOWN_HASH) {
            return Err(RatelimitError::new(RatelimitErrorType::AlreadyResolved));
        }

        tracing::debug!(name = %real_hash, "resolved bucket");
        *name = real_hash;

        Ok(())
    }

    /// Mark the bucket closed; subsequent acquires fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::Bucket;
    use crate::{
        error::RatelimitErrorType,
        limiter::GlobalLimiter,
        request::{CompiledRoute, Method, Route},
    };
    use static_assertions::assert_impl_all;
    use std::{fmt::Debug, sync::Arc};

    assert_impl_all!(Bucket: Debug, Send, Sync);

    fn bucket(name: &str) -> Bucket {
        Bucket::new(
            name.to_owned(),
            CompiledRoute::new(Route::new(Method::Get, "/foo/bar"), "/foo/bar", ""),
            Arc::new(GlobalLimiter::new(50)),
            None,
        )
    }

    #[test]
    fn unknown_is_a_prefix_check() {
        assert!(bucket("UNKNOWN;auth;1").is_unknown());
        assert!(!bucket("spaghetti;auth;1").is_unknown());
    }

    #[test]
    fn resolve_renames_once() {
        let bucket = bucket("UNKNOWN;auth;1");

        bucket.resolve(String::from("real;auth;1")).unwrap();
        assert_eq!("real;auth;1", bucket.name());

        let error = bucket.resolve(String::from("other;auth;1")).unwrap_err();
        assert!(matches!(
            error.kind(),
            RatelimitErrorType::AlreadyResolved
        ));
        assert_eq!("real;auth;1", bucket.name());
    }

    #[tokio::test]
    async fn closed_bucket_refuses_permits() {
        let bucket = bucket("spaghetti;auth;1");
        bucket.close();

        let error = bucket.acquire().await.unwrap_err();
        assert!(matches!(error.kind(), RatelimitErrorType::Closed));
        assert!(bucket.is_empty());
    }

    #[tokio::test]
    async fn permit_release_reopens_gate() {
        let bucket = bucket("UNKNOWN;auth;1");

        let permit = bucket.acquire().await.unwrap();
        assert!(!bucket.is_empty());

        drop(permit);
        assert!(bucket.is_empty());

        drop(bucket.acquire().await.unwrap());
    }
}
