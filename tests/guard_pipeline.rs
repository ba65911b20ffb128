//! End-to-end pipeline scenarios run through a built `Shield`.

use shield::{
    CircuitBreakerConfig, GuardError, ManualClock, MemoryStore, OverloadConfig, ProtectionContext,
    RateLimitConfig, ShedStrategy, Shield, ShieldError, ThrottleConfig,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TestError(&'static str);

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TestError {}

fn builder(clock: &ManualClock) -> shield::ShieldBuilder {
    Shield::builder()
        .clock(Arc::new(clock.clone()))
        .store(Arc::new(MemoryStore::with_clock(Arc::new(clock.clone()))))
}

fn ctx_from(clock: &ManualClock, ip: &str, path: &str) -> ProtectionContext {
    ProtectionContext::builder("GET", path)
        .ip(ip.parse().unwrap())
        .build(clock)
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

#[tokio::test]
async fn fixed_window_rate_limit_scenario() {
    let clock = ManualClock::new(0);
    let shield = builder(&clock)
        .rate_limit(RateLimitConfig::new(5, Duration::from_secs(60)).unwrap())
        .build()
        .unwrap();
    let guard = shield.guard();

    // Five requests from the same address: allowed, remaining counts down.
    for expected in ["4", "3", "2", "1", "0"] {
        let ctx = ctx_from(&clock, "1.2.3.4", "/api");
        let out = guard
            .protect(&ctx, || async { Ok::<_, Infallible>(()) })
            .await
            .unwrap();
        assert_eq!(header(&out.headers, "X-RateLimit-Limit"), Some("5"));
        assert_eq!(header(&out.headers, "X-RateLimit-Remaining"), Some(expected));
        assert_eq!(header(&out.headers, "X-RateLimit-Reset"), Some("60"));
    }

    // The sixth, ten seconds in, is rejected with Retry-After: 50.
    clock.set(10_000);
    let ctx = ctx_from(&clock, "1.2.3.4", "/api");
    let err = guard
        .protect(&ctx, || async { Ok::<_, Infallible>(()) })
        .await
        .unwrap_err();
    let rejected = match &err {
        GuardError::Rejected(e) => e,
        other => panic!("expected rejection, got {:?}", other),
    };
    assert_eq!(rejected.status_code(), 429);
    assert_eq!(rejected.retry_after(), Some(50));
    let rejection = guard.rejection(&ctx, rejected);
    assert_eq!(header(&rejection.headers, "Retry-After"), Some("50"));
    assert_eq!(rejection.body["statusCode"], 429);

    // A different caller is unaffected.
    let other = ctx_from(&clock, "5.6.7.8", "/api");
    assert!(guard.protect(&other, || async { Ok::<_, Infallible>(()) }).await.is_ok());

    // At the window boundary the counter starts over.
    clock.set(60_000);
    let ctx = ctx_from(&clock, "1.2.3.4", "/api");
    let out = guard
        .protect(&ctx, || async { Ok::<_, Infallible>(()) })
        .await
        .unwrap();
    assert_eq!(header(&out.headers, "X-RateLimit-Remaining"), Some("4"));
}

#[tokio::test]
async fn throttle_anchors_to_the_first_request() {
    let clock = ManualClock::new(0);
    let shield = builder(&clock)
        .throttle(ThrottleConfig::new(3, Duration::from_secs(10)).unwrap())
        .build()
        .unwrap();
    let guard = shield.guard();

    for at in [0, 4_000, 9_000] {
        clock.set(at);
        let ctx = ctx_from(&clock, "1.2.3.4", "/api");
        assert!(
            guard.protect(&ctx, || async { Ok::<_, Infallible>(()) }).await.is_ok(),
            "request at t={} should pass",
            at
        );
    }

    clock.set(9_500);
    let ctx = ctx_from(&clock, "1.2.3.4", "/api");
    let err = guard
        .protect(&ctx, || async { Ok::<_, Infallible>(()) })
        .await
        .unwrap_err();
    match err {
        GuardError::Rejected(ShieldError::ThrottleLimitExceeded { retry_after, .. }) => {
            assert_eq!(retry_after, Duration::from_secs(1));
        }
        other => panic!("expected throttle rejection, got {:?}", other),
    }

    // Past the anchored window a fresh one starts.
    clock.set(11_000);
    let ctx = ctx_from(&clock, "1.2.3.4", "/api");
    let out = guard
        .protect(&ctx, || async { Ok::<_, Infallible>(()) })
        .await
        .unwrap();
    assert_eq!(header(&out.headers, "X-Throttle-Remaining"), Some("2"));
}

#[tokio::test]
async fn breaker_opens_probes_and_closes() {
    let clock = ManualClock::new(0);
    let shield = builder(&clock)
        .circuit_breaker(CircuitBreakerConfig {
            enabled: true,
            timeout: None,
            error_threshold_percentage: 50.0,
            reset_timeout: Duration::from_millis(1000),
            volume_threshold: 5,
            ..CircuitBreakerConfig::default()
        })
        .build()
        .unwrap();
    let guard = shield.guard();

    // Five failing calls trip the breaker.
    for _ in 0..5 {
        let ctx = ctx_from(&clock, "1.2.3.4", "/orders");
        let result: Result<_, GuardError<TestError>> = guard
            .protect(&ctx, || async { Err::<(), _>(TestError("downstream")) })
            .await;
        assert!(matches!(result, Err(GuardError::Handler(_))));
    }

    // While open, calls are rejected as 503 without reaching the handler.
    let handler_ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
    for _ in 0..3 {
        let ctx = ctx_from(&clock, "1.2.3.4", "/orders");
        let ran = handler_ran.clone();
        let err = guard
            .protect(&ctx, move || async move {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, Infallible>("must not run")
            })
            .await
            .unwrap_err();
        let rejected = err.rejection().expect("must be a rejection");
        assert_eq!(rejected.status_code(), 503);
        assert!(rejected.is_circuit_open());
    }
    assert!(!handler_ran.load(std::sync::atomic::Ordering::SeqCst));

    // After the reset timeout a single successful probe closes the circuit.
    clock.advance(1_001);
    let ctx = ctx_from(&clock, "1.2.3.4", "/orders");
    let out = guard
        .protect(&ctx, || async { Ok::<_, Infallible>("probe") })
        .await
        .unwrap();
    assert_eq!(out.value, "probe");

    let ctx = ctx_from(&clock, "1.2.3.4", "/orders");
    let out = guard
        .protect(&ctx, || async { Ok::<_, Infallible>("normal") })
        .await
        .unwrap();
    assert_eq!(header(&out.headers, "X-Circuit-Breaker-State"), Some("closed"));
}

#[tokio::test(start_paused = true)]
async fn overload_fifo_queue_and_timeout_scenario() {
    let clock = ManualClock::new(0);
    let shield = Arc::new(
        builder(&clock)
            .overload(OverloadConfig {
                enabled: true,
                max_concurrent: 1,
                max_queue_size: 2,
                queue_timeout: Duration::from_millis(100),
                shed_strategy: ShedStrategy::Fifo,
                ..OverloadConfig::default()
            })
            .build()
            .unwrap(),
    );
    let guard = shield.guard();

    // Hold the only slot with a long-running call.
    let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
    let held = {
        let guard = guard.clone();
        let ctx = ctx_from(&clock, "1.2.3.4", "/slow");
        tokio::spawn(async move {
            guard
                .protect(&ctx, move || async move {
                    let _ = gate_rx.await;
                    Ok::<_, Infallible>("held")
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(shield.overload_status().current, 1);

    // A and B queue up; B arrives 50ms later.
    let a = {
        let guard = guard.clone();
        let ctx = ctx_from(&clock, "1.2.3.4", "/slow");
        tokio::spawn(async move {
            guard.protect(&ctx, || async { Ok::<_, Infallible>("a") }).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let b = {
        let guard = guard.clone();
        let ctx = ctx_from(&clock, "1.2.3.4", "/slow");
        tokio::spawn(async move {
            guard.protect(&ctx, || async { Ok::<_, Infallible>("b") }).await
        })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(shield.overload_status().queued, 2);

    // The queue is full: C is rejected immediately.
    let ctx = ctx_from(&clock, "1.2.3.4", "/slow");
    let err = guard
        .protect(&ctx, || async { Ok::<_, Infallible>("c") })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GuardError::Rejected(ShieldError::OverloadQueueFull { .. })
    ));

    // A's deadline passes at ~t=101.
    tokio::time::sleep(Duration::from_millis(55)).await;
    assert!(matches!(
        a.await.unwrap().unwrap_err(),
        GuardError::Rejected(ShieldError::OverloadTimeout { .. })
    ));

    // Releasing the held slot admits B before its own deadline.
    gate_tx.send(()).unwrap();
    assert_eq!(held.await.unwrap().unwrap().value, "held");
    assert_eq!(b.await.unwrap().unwrap().value, "b");
    assert_eq!(shield.overload_status().current, 0);
}

#[tokio::test(start_paused = true)]
async fn priority_waiters_preempt_lower_classes() {
    let clock = ManualClock::new(0);
    let shield = Arc::new(
        builder(&clock)
            .overload(OverloadConfig {
                enabled: true,
                max_concurrent: 1,
                max_queue_size: 4,
                queue_timeout: Duration::from_secs(10),
                shed_strategy: ShedStrategy::Priority,
                ..OverloadConfig::default()
            })
            .build()
            .unwrap(),
    );
    let guard = shield.guard();

    // A normal-priority request holds the slot.
    let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
    let n1 = {
        let guard = guard.clone();
        let ctx = ProtectionContext::builder("GET", "/work")
            .ip("1.2.3.4".parse().unwrap())
            .header("X-Request-Priority", "5")
            .build(&clock);
        tokio::spawn(async move {
            guard
                .protect(&ctx, move || async move {
                    let _ = gate_rx.await;
                    Ok::<_, Infallible>("n1")
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;

    // A high-priority request queues, then another normal one behind it.
    let h1 = {
        let guard = guard.clone();
        let ctx = ProtectionContext::builder("GET", "/work")
            .ip("1.2.3.4".parse().unwrap())
            .header("X-Request-Priority", "8")
            .build(&clock);
        tokio::spawn(async move {
            guard.protect(&ctx, || async { Ok::<_, Infallible>("h1") }).await
        })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    let n2 = {
        let guard = guard.clone();
        let ctx = ProtectionContext::builder("GET", "/work")
            .ip("1.2.3.4".parse().unwrap())
            .header("X-Request-Priority", "5")
            .build(&clock);
        tokio::spawn(async move {
            guard.protect(&ctx, || async { Ok::<_, Infallible>("n2") }).await
        })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(shield.overload_status().queued, 2);

    // N1 releases: H1 is served first despite arriving before N2 released.
    gate_tx.send(()).unwrap();
    assert_eq!(n1.await.unwrap().unwrap().value, "n1");
    assert_eq!(h1.await.unwrap().unwrap().value, "h1");
    assert_eq!(n2.await.unwrap().unwrap().value, "n2");
}

#[tokio::test]
async fn graceful_shutdown_scenario() {
    let clock = ManualClock::new(0);
    let shield = Arc::new(
        builder(&clock)
            .overload(OverloadConfig {
                enabled: true,
                max_concurrent: 3,
                max_queue_size: 8,
                queue_timeout: Duration::from_secs(30),
                ..OverloadConfig::default()
            })
            .circuit_breaker(CircuitBreakerConfig {
                enabled: true,
                ..CircuitBreakerConfig::default()
            })
            .build()
            .unwrap(),
    );
    shield.start();
    let guard = shield.guard();

    // Touch a route so a breaker instance exists.
    let warm = ctx_from(&clock, "1.2.3.4", "/orders");
    guard
        .protect(&warm, || async { Ok::<_, Infallible>(()) })
        .await
        .unwrap();

    // Three in-flight requests hold every slot.
    let (gate_tx, gate_rx) = tokio::sync::broadcast::channel::<()>(1);
    let in_flight: Vec<_> = (0..3)
        .map(|_| {
            let guard = guard.clone();
            let mut gate = gate_tx.subscribe();
            let ctx = ctx_from(&clock, "1.2.3.4", "/orders");
            tokio::spawn(async move {
                guard
                    .protect(&ctx, move || async move {
                        let _ = gate.recv().await;
                        Ok::<_, Infallible>("drained")
                    })
                    .await
            })
        })
        .collect();
    drop(gate_rx);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(shield.overload_status().current, 3);

    // Four more are queued.
    let queued: Vec<_> = (0..4)
        .map(|_| {
            let guard = guard.clone();
            let ctx = ctx_from(&clock, "1.2.3.4", "/orders");
            tokio::spawn(async move {
                guard.protect(&ctx, || async { Ok::<_, Infallible>("queued") }).await
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(shield.overload_status().queued, 4);

    // Shutdown releases the gate mid-drain.
    let releaser = {
        let gate_tx = gate_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = gate_tx.send(());
        })
    };
    shield.shutdown(Duration::from_secs(60)).await;
    releaser.await.unwrap();

    // The queued four were rejected with QUEUE_CLEARED.
    for handle in queued {
        assert!(matches!(
            handle.await.unwrap().unwrap_err(),
            GuardError::Rejected(ShieldError::QueueCleared)
        ));
    }
    // The in-flight three completed normally.
    for handle in in_flight {
        assert_eq!(handle.await.unwrap().unwrap().value, "drained");
    }
    // All breakers report disabled.
    let snapshots = shield.breaker_snapshots();
    assert!(!snapshots.is_empty());
    assert!(snapshots.iter().all(|s| s.state == shield::BreakerState::Disabled));
}
