use eventide_http_ratelimiting::{BucketManager, CompiledRoute, Method, RatelimitErrorType, Route};
use std::time::Duration;
use tokio::time::Instant;

const AUTH: Option<&str> = Some("Bot dG90YWxseS1hLXRva2Vu");

fn messages_route() -> CompiledRoute {
    CompiledRoute::new(
        Route::new(Method::Get, "/channels/{channel}/messages"),
        "/channels/1234/messages",
        "1234",
    )
}

#[tokio::test]
async fn gate_is_fifo() {
    let manager = BucketManager::new();
    manager.start().unwrap();

    let bucket = manager.acquire_bucket(&messages_route(), AUTH).unwrap();
    let permit = bucket.acquire().await.unwrap();

    let first = bucket.acquire();
    tokio::pin!(first);
    let second = bucket.acquire();
    tokio::pin!(second);

    // Queue both waiters on the gate, in order.
    assert!(futures_util::poll!(first.as_mut()).is_pending());
    assert!(futures_util::poll!(second.as_mut()).is_pending());

    drop(permit);

    tokio::select! {
        biased;
        _ = second.as_mut() => panic!("not acquired in order"),
        permit = first.as_mut() => {
            drop(permit.unwrap());
            second.await.unwrap();
        }
    }

    manager.close();
}

#[tokio::test(start_paused = true)]
async fn refuses_too_long_waits() {
    let manager = BucketManager::new().max_rate_limit(Duration::from_secs(60));
    manager.start().unwrap();

    let route = messages_route();
    let bucket = manager.acquire_bucket(&route, AUTH).unwrap();
    manager
        .update_rate_limits(&route, AUTH, "a1b2c3", 0, 5, Duration::from_secs(3600))
        .unwrap();

    let error = bucket.acquire().await.unwrap_err();

    assert!(matches!(
        error.kind(),
        RatelimitErrorType::RateLimitTooLong { wait } if *wait > Duration::from_secs(60)
    ));
    assert_eq!(0, bucket.remaining());
    assert!(bucket.is_empty());

    manager.close();
}

#[tokio::test(start_paused = true)]
async fn unbounded_manager_waits_out_any_window() {
    let manager = BucketManager::new();
    manager.start().unwrap();

    let route = messages_route();
    let bucket = manager.acquire_bucket(&route, AUTH).unwrap();
    manager
        .update_rate_limits(&route, AUTH, "a1b2c3", 0, 5, Duration::from_secs(3600))
        .unwrap();

    let now = Instant::now();
    drop(bucket.acquire().await.unwrap());

    assert!(now.elapsed() >= Duration::from_secs(3600));

    manager.close();
}

#[tokio::test(start_paused = true)]
async fn acquire_consumes_one_slot() {
    let manager = BucketManager::new();
    manager.start().unwrap();

    let route = messages_route();
    let bucket = manager.acquire_bucket(&route, AUTH).unwrap();
    manager
        .update_rate_limits(&route, AUTH, "a1b2c3", 5, 5, Duration::from_secs(10))
        .unwrap();

    drop(bucket.acquire().await.unwrap());
    assert_eq!(4, bucket.remaining());

    // A route that has never seen a response stays unresolved.
    let other = CompiledRoute::new(Route::new(Method::Get, "/foo/bar"), "/foo/bar", "");
    assert!(manager.acquire_bucket(&other, AUTH).unwrap().is_unknown());

    manager.close();
}

#[tokio::test(start_paused = true)]
async fn cancelled_waiter_leaves_gate_untouched() {
    let manager = BucketManager::new();
    manager.start().unwrap();

    let route = messages_route();
    let bucket = manager.acquire_bucket(&route, AUTH).unwrap();
    manager
        .update_rate_limits(&route, AUTH, "a1b2c3", 5, 5, Duration::from_secs(10))
        .unwrap();

    let permit = bucket.acquire().await.unwrap();
    let remaining = bucket.remaining();

    {
        let waiter = bucket.acquire();
        tokio::pin!(waiter);
        assert!(futures_util::poll!(waiter.as_mut()).is_pending());
    }

    drop(permit);

    let permit = bucket.acquire().await.unwrap();
    assert_eq!(remaining - 1, bucket.remaining());

    drop(permit);
    assert!(bucket.is_empty());

    manager.close();
}
