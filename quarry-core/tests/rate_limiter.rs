use std::{sync::Arc, time::Duration};

use quarry_core::ratelimit::{BucketKind, Principal, RateLimiter};
use quarry_core::{GovernorError, RateLimitSettings, TenantId, WindowLimit};
use tokio::time::Instant;

fn limiter() -> RateLimiter {
    RateLimiter::new(RateLimitSettings {
        general: WindowLimit {
            limit: 3,
            window_secs: 60,
        },
        expensive: WindowLimit {
            limit: 1,
            window_secs: 60,
        },
        max_concurrent_requests: 2,
        ..RateLimitSettings::default()
    })
}

fn learner(raw: &str) -> Principal {
    Principal::Tenant(TenantId::new(raw).expect("valid tenant"))
}

#[test]
fn request_beyond_the_window_limit_is_rejected_with_a_retry_hint() {
    let limiter = limiter();
    let who = learner("u1");
    let base = Instant::now();

    for offset in [0, 10, 20] {
        limiter
            .check_rate_at(&who, BucketKind::General, base + Duration::from_secs(offset))
            .expect("within limit");
    }

    let err = limiter
        .check_rate_at(&who, BucketKind::General, base + Duration::from_secs(30))
        .expect_err("fourth request in the window");
    match err {
        GovernorError::RateLimitExceeded {
            bucket,
            limit,
            retry_after,
            ..
        } => {
            assert_eq!(bucket, BucketKind::General);
            assert_eq!(limit, 3);
            assert_eq!(retry_after, Duration::from_secs(30));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Once the oldest request leaves the window there is room again.
    limiter
        .check_rate_at(&who, BucketKind::General, base + Duration::from_secs(61))
        .expect("window slid");
}

#[test]
fn buckets_and_principals_are_counted_separately() {
    let limiter = limiter();
    let (u1, u2) = (learner("u1"), learner("u2"));
    let now = Instant::now();

    limiter.check_rate_at(&u1, BucketKind::Expensive, now).expect("first expensive");
    assert!(limiter.check_rate_at(&u1, BucketKind::Expensive, now).is_err());

    limiter.check_rate_at(&u1, BucketKind::General, now).expect("general is separate");
    limiter.check_rate_at(&u2, BucketKind::Expensive, now).expect("other tenant");

    let address = Principal::Address("192.0.2.10".parse().expect("ip"));
    limiter.check_rate_at(&address, BucketKind::Expensive, now).expect("anonymous caller");
}

#[test]
fn concurrency_gate_counts_guards_until_they_drop() {
    let limiter = limiter();
    let who = learner("u1");

    let first = limiter.enter(&who).expect("first");
    let _second = limiter.enter(&who).expect("second");
    let err = limiter.enter(&who).expect_err("third");
    assert!(matches!(err, GovernorError::ConcurrencyLimitExceeded { limit: 2 }), "{err:?}");

    drop(first);
    assert_eq!(limiter.in_flight(&who), 1);
    let _third = limiter.enter(&who).expect("slot released");
}

#[test]
fn rate_rejection_does_not_take_a_concurrency_slot() {
    let limiter = limiter();
    let who = learner("u1");

    let guard = limiter.admit(&who, BucketKind::Expensive).expect("admitted");
    assert!(limiter.admit(&who, BucketKind::Expensive).is_err());
    assert_eq!(limiter.in_flight(&who), 1);

    drop(guard);
    assert_eq!(limiter.in_flight(&who), 0);
    assert_eq!(limiter.stats().principals_in_flight, 0);
}

#[tokio::test]
async fn guards_release_when_the_request_task_is_cancelled() {
    let limiter = Arc::new(limiter());
    let who = learner("u1");

    let task = {
        let limiter = Arc::clone(&limiter);
        let who = who.clone();
        tokio::spawn(async move {
            let _guard = limiter.enter(&who).expect("enter");
            tokio::time::sleep(Duration::from_secs(60)).await;
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(limiter.in_flight(&who), 1);

    task.abort();
    let _ = task.await;
    assert_eq!(limiter.in_flight(&who), 0);
}

#[test]
fn prune_drops_expired_windows() {
    let limiter = limiter();
    let base = Instant::now();
    limiter
        .check_rate_at(&learner("u1"), BucketKind::General, base)
        .expect("request");
    limiter
        .check_rate_at(&learner("u2"), BucketKind::General, base + Duration::from_secs(50))
        .expect("request");

    let report = limiter.prune(base + Duration::from_secs(70));

    assert_eq!(report.windows_removed, 1);
    assert_eq!(report.timestamps_removed, 1);
    assert_eq!(report.windows_retained, 1);
    assert_eq!(limiter.stats().windows, 1);
}
