//! Registry of ratelimit buckets and the background task reclaiming them.
//!
//! The manager keeps two mappings: route templates to the bucket hash the
//! API last assigned them, and real bucket hashes to live [`Bucket`]s.
//! Buckets are created on first acquire, renamed in place when an
//! unresolved bucket learns its real hash, and reclaimed by a garbage
//! collection task once they have been quiet longer than the expiry.
//!
//! The route-to-hash mapping is only ever written from observed responses:
//! caching a guess on acquire would persist a wrong identity and defeat
//! re-homing when two routes turn out to share a bucket.

use crate::{
    bucket::Bucket,
    error::{RatelimitError, RatelimitErrorType},
    limiter::{GlobalLimiter, DEFAULT_GLOBAL_LIMIT},
    request::{CompiledRoute, Route},
    UNKNOWN_HASH,
};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{timeout, Instant},
};

/// How often the garbage collector polls for stale buckets.
const GC_POLL_PERIOD: Duration = Duration::from_secs(20);

/// How long a bucket's window must be over before it is reclaimed.
const GC_EXPIRE_AFTER: Duration = Duration::from_secs(10);

/// Length in characters of an authentication fingerprint.
const AUTH_HASH_LEN: usize = 16;

/// Alphabet for rendering fingerprint bytes.
const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

/// The manager's two mappings, shared with the garbage collector.
#[derive(Debug, Default)]
struct Registry {
    /// Bucket hash the API last assigned each route template.
    routes_to_hashes: HashMap<Route, String>,
    /// Live bucket under each real hash.
    real_hashes_to_buckets: HashMap<String, Arc<Bucket>>,
}

/// Registry of ratelimit buckets for one API client.
///
/// Created with [`new`] and optionally configured with the builder-style
/// setters, then armed with [`start`]. See the crate documentation for the
/// acquire/update cycle.
///
/// [`new`]: Self::new
/// [`start`]: Self::start
#[derive(Debug)]
pub struct BucketManager {
    /// Shared mappings, also visible to the garbage collector.
    registry: Arc<Mutex<Registry>>,
    /// Limiter enforcing the API-wide ceiling, shared by every bucket.
    global: Arc<GlobalLimiter>,
    /// Longest predicted wait a bucket acquire will agree to.
    max_rate_limit: Option<Duration>,
    /// How often the garbage collector wakes.
    gc_poll_period: Duration,
    /// Quiet time after which a bucket is reclaimed.
    gc_expire_after: Duration,
    /// Signal armed by `start` and fired by `close`; `None` while the
    /// manager is not running.
    closed: Mutex<Option<watch::Sender<()>>>,
    /// Handle of the garbage collection task.
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl BucketManager {
    /// Create a new manager with an unbounded maximum wait and the API's
    /// default global allotment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            global: Arc::new(GlobalLimiter::new(DEFAULT_GLOBAL_LIMIT)),
            max_rate_limit: None,
            gc_poll_period: GC_POLL_PERIOD,
            gc_expire_after: GC_EXPIRE_AFTER,
            closed: Mutex::new(None),
            gc_task: Mutex::new(None),
        }
    }

    /// Fail acquires whose predicted wait exceeds `max`.
    #[must_use]
    pub fn max_rate_limit(mut self, max: Duration) -> Self {
        self.max_rate_limit = Some(max);

        self
    }

    /// Requests allotted per second across all buckets.
    #[must_use]
    pub fn global_limit(mut self, limit: u64) -> Self {
        self.global = Arc::new(GlobalLimiter::new(limit));

        self
    }

    /// Garbage collection cadence: poll every `poll_period` and reclaim
    /// buckets whose window has been over longer than `expire_after`.
    #[must_use]
    pub fn gc_periods(mut self, poll_period: Duration, expire_after: Duration) -> Self {
        self.gc_poll_period = poll_period;
        self.gc_expire_after = expire_after;

        self
    }

    /// Whether the manager has been started and not yet closed.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.closed.lock().expect("closed poisoned").is_some()
    }

    /// Arm the closed signal and spawn the garbage collection task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error of type [`AlreadyStarted`] if the manager is
    /// already running.
    ///
    /// [`AlreadyStarted`]: RatelimitErrorType::AlreadyStarted
    pub fn start(&self) -> Result<(), RatelimitError> {
        let mut closed = self.closed.lock().expect("closed poisoned");

        if closed.is_some() {
            return Err(RatelimitError::new(RatelimitErrorType::AlreadyStarted));
        }

        let (tx, rx) = watch::channel(());
        closed.replace(tx);

        let task = tokio::spawn(gc(
            Arc::clone(&self.registry),
            rx,
            self.gc_poll_period,
            self.gc_expire_after,
        ));
        self.gc_task
            .lock()
            .expect("gc task poisoned")
            .replace(task);

        Ok(())
    }

    /// Close every bucket, clear the registry and stop the garbage
    /// collector.
    ///
    /// Safe to call multiple times; the manager may be started again
    /// afterwards.
    pub fn close(&self) {
        // Dropping the sender fires the closed signal.
        drop(self.closed.lock().expect("closed poisoned").take());

        if let Some(task) = self.gc_task.lock().expect("gc task poisoned").take() {
            task.abort();
        }

        let mut registry = self.registry.lock().expect("registry poisoned");

        for bucket in registry.real_hashes_to_buckets.values() {
            bucket.close();
        }

        registry.real_hashes_to_buckets.clear();
        registry.routes_to_hashes.clear();
    }

    /// Look up or create the bucket a route acquires under.
    ///
    /// The returned bucket is entered with [`Bucket::acquire`]. Routes the
    /// API has not assigned a hash yet share unresolved buckets keyed by
    /// authentication fingerprint and major parameters; nothing is written
    /// to the route-to-hash mapping here, only [`update_rate_limits`] does
    /// that.
    ///
    /// # Errors
    ///
    /// Returns an error of type [`Closed`] if the manager is not running.
    ///
    /// [`Closed`]: RatelimitErrorType::Closed
    /// [`update_rate_limits`]: Self::update_rate_limits
    pub fn acquire_bucket(
        &self,
        route: &CompiledRoute,
        authentication: Option<&str>,
    ) -> Result<Arc<Bucket>, RatelimitError> {
        if !self.is_alive() {
            return Err(RatelimitError::new(RatelimitErrorType::Closed));
        }

        let auth_hash = create_authentication_hash(authentication);
        let mut registry = self.registry.lock().expect("registry poisoned");

        let real_hash = match registry.routes_to_hashes.get(route.route()) {
            Some(initial_hash) => route.real_bucket_hash(initial_hash, &auth_hash),
            None => create_unknown_hash(route, &auth_hash),
        };

        let bucket = registry
            .real_hashes_to_buckets
            .entry(real_hash.clone())
            .or_insert_with(|| {
                tracing::debug!(name = %real_hash, route = %route, "created new bucket");

                Arc::new(Bucket::new(
                    real_hash.clone(),
                    route.clone(),
                    Arc::clone(&self.global),
                    self.max_rate_limit,
                ))
            });

        Ok(Arc::clone(bucket))
    }

    /// Feed back the ratelimit information of a response.
    ///
    /// May re-home the route to a different bucket when the API's assigned
    /// hash changed, resolve a previously-unknown bucket in place, or
    /// simply install the new window parameters. `reset_after` is treated
    /// as a delta against the local monotonic clock.
    ///
    /// # Errors
    ///
    /// Returns an error of type [`Closed`] if the manager is not running.
    ///
    /// [`Closed`]: RatelimitErrorType::Closed
    pub fn update_rate_limits(
        &self,
        route: &CompiledRoute,
        authentication: Option<&str>,
        bucket_header: &str,
        remaining: u64,
        limit: u64,
        reset_after: Duration,
    ) -> Result<(), RatelimitError> {
        if !self.is_alive() {
            return Err(RatelimitError::new(RatelimitErrorType::Closed));
        }

        let reset_at = Instant::now() + reset_after;
        let auth_hash = create_authentication_hash(authentication);
        let real_hash = route.real_bucket_hash(bucket_header, &auth_hash);

        let mut registry = self.registry.lock().expect("registry poisoned");

        let rehome = registry
            .routes_to_hashes
            .get(route.route())
            .map_or(true, |initial_hash| initial_hash.as_str() != bucket_header);

        if rehome {
            tracing::debug!(name = %real_hash, route = %route, "assigning route to bucket");

            registry
                .routes_to_hashes
                .insert(route.route().clone(), bucket_header.to_owned());

            // An unresolved bucket for this route keeps its queue: rename
            // and re-key it instead of creating a second bucket, so that
            // acquirers already waiting on its gate are unaffected.
            let unknown_hash = create_unknown_hash(route, &auth_hash);

            if let Some(bucket) = registry.real_hashes_to_buckets.remove(&unknown_hash) {
                bucket.resolve(real_hash.clone())?;
                registry
                    .real_hashes_to_buckets
                    .insert(real_hash.clone(), bucket);
            }
        }

        let bucket = registry
            .real_hashes_to_buckets
            .entry(real_hash.clone())
            .or_insert_with(|| {
                Arc::new(Bucket::new(
                    real_hash.clone(),
                    route.clone(),
                    Arc::clone(&self.global),
                    self.max_rate_limit,
                ))
            });

        bucket.update_rate_limit(remaining, limit, reset_at);

        Ok(())
    }

    /// Preemptively block every bucket, in response to a global 429.
    pub fn throttle_global(&self, retry_after: Duration) {
        self.global.throttle(retry_after);
    }
}

impl Default for BucketManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll for stale buckets until the closed signal fires.
async fn gc(
    registry: Arc<Mutex<Registry>>,
    mut closed: watch::Receiver<()>,
    poll_period: Duration,
    expire_after: Duration,
) {
    loop {
        // Fires on close and when the manager is dropped.
        if timeout(poll_period, closed.changed()).await.is_ok() {
            break;
        }

        purge_stale_buckets(&registry, expire_after);
    }
}

/// Close and remove buckets that have been quiet longer than
/// `expire_after`.
///
/// Buckets with callers inside or queued are never reclaimed, and neither
/// are buckets whose window is still running: dropping one would forget
/// the limit and burst through it on the next request.
fn purge_stale_buckets(registry: &Mutex<Registry>, expire_after: Duration) {
    let now = Instant::now();
    let mut registry = registry.lock().expect("registry poisoned");
    let before = registry.real_hashes_to_buckets.len();

    registry.real_hashes_to_buckets.retain(|name, bucket| {
        if !bucket.is_empty() {
            return true;
        }

        let reset_at = bucket.reset_at();

        if now < reset_at || now.saturating_duration_since(reset_at) <= expire_after {
            return true;
        }

        tracing::debug!(name = %name, "reclaiming stale bucket");
        bucket.close();

        false
    });

    let purged = before - registry.real_hashes_to_buckets.len();

    if purged > 0 {
        tracing::debug!(purged, "purged stale buckets");
    }
}

/// Fingerprint a credential for use in registry keys.
///
/// Authenticated callers are identified by a truncated SHA-256 digest; the
/// raw credential never appears in keys or logs.
fn create_authentication_hash(authentication: Option<&str>) -> String {
    authentication.map_or_else(
        || String::from("unauthenticated"),
        |credential| {
            let digest = Sha256::digest(credential.as_bytes());
            let mut hash = String::with_capacity(AUTH_HASH_LEN);

            for byte in digest.iter().copied().take(AUTH_HASH_LEN / 2) {
                hash.push(char::from(HEX_CHARS[usize::from(byte >> 4)]));
                hash.push(char::from(HEX_CHARS[usize::from(byte & 0xf)]));
            }

            hash
        },
    )
}

/// Compose the registry identity of a route with no known bucket hash.
fn create_unknown_hash(route: &CompiledRoute, auth_hash: &str) -> String {
    route.real_bucket_hash(UNKNOWN_HASH, auth_hash)
}

#[cfg(test)]
mod tests {
    use super::{create_authentication_hash, create_unknown_hash, BucketManager};
    use crate::request::{CompiledRoute, Method, Route};
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(BucketManager: Debug, Default, Send, Sync);

    #[test]
    fn authentication_hash_is_opaque() {
        let token = "Bot dG90YWxseS1yZWFsLXRva2Vu";
        let hash = create_authentication_hash(Some(token));

        assert_eq!(hash, create_authentication_hash(Some(token)));
        assert_eq!(16, hash.len());
        assert!(hash.bytes().all(|byte| byte.is_ascii_hexdigit()));
        assert_ne!(hash, create_authentication_hash(Some("Bot another")));
    }

    #[test]
    fn unauthenticated_fingerprint_is_stable() {
        assert_eq!("unauthenticated", create_authentication_hash(None));
    }

    #[test]
    fn unknown_hash_composition() {
        let route = CompiledRoute::new(
            Route::new(Method::Post, "/webhooks/{webhook}/{token}"),
            "/webhooks/1234/abcd",
            "1234;abcd",
        );

        assert_eq!("UNKNOWN;anon;1234;abcd", create_unknown_hash(&route, "anon"));
    }
}
