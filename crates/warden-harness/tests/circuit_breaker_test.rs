use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use warden_core::config::BreakerConfig;
use warden_harness::circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerRegistry, CircuitState,
};

fn fast_config() -> BreakerConfig {
    BreakerConfig {
        failure_threshold: 3,
        half_open_max_attempts: 2,
        timeout_ms: 100,
        permanent_open_threshold: 10,
        permanent_open_patterns: vec!["Invalid API Key".into()],
    }
}

async fn fail(cb: &CircuitBreaker, message: &'static str) {
    let _ = cb.execute(|| async move { Err::<i32, _>(message) }).await;
}

#[tokio::test]
async fn starts_closed() {
    let cb = CircuitBreaker::new("api", fast_config());
    assert_eq!(cb.state().await, CircuitState::Closed);
    assert_eq!(cb.name(), "api");
}

#[tokio::test]
async fn stays_closed_on_success() {
    let cb = CircuitBreaker::new("api", fast_config());
    let res = cb.execute(|| async { Ok::<_, String>(42) }).await;
    assert_eq!(res.unwrap(), 42);
    assert_eq!(cb.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn opens_after_threshold_failures() {
    let cb = CircuitBreaker::new("api", fast_config());

    for _ in 0..2 {
        fail(&cb, "fail").await;
    }
    assert_eq!(cb.state().await, CircuitState::Closed);

    fail(&cb, "fail").await;
    assert_eq!(cb.state().await, CircuitState::Open);
}

#[tokio::test]
async fn success_in_closed_resets_failure_streak() {
    let cb = CircuitBreaker::new("api", fast_config());
    fail(&cb, "fail").await;
    fail(&cb, "fail").await;
    let _ = cb.execute(|| async { Ok::<_, String>(1) }).await;
    assert_eq!(cb.failure_count().await, 0);

    fail(&cb, "fail").await;
    fail(&cb, "fail").await;
    assert_eq!(cb.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn operation_error_is_returned_unchanged() {
    let cb = CircuitBreaker::new("api", fast_config());
    let err = cb
        .execute(|| async { Err::<i32, _>("upstream 503".to_string()) })
        .await
        .unwrap_err();
    assert!(!err.is_rejection());
    assert_eq!(err.into_operation().as_deref(), Some("upstream 503"));
}

#[tokio::test]
async fn rejects_calls_when_open_without_invoking() {
    let cb = CircuitBreaker::new("api", fast_config());
    for _ in 0..3 {
        fail(&cb, "fail").await;
    }

    let invoked = Arc::new(AtomicU32::new(0));
    let counter = invoked.clone();
    let result = cb
        .execute(|| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(1)
        })
        .await;

    match result {
        Err(BreakerError::Open { retry_after, .. }) => {
            assert!(retry_after <= Duration::from_millis(100));
        }
        other => panic!("expected open rejection, got {other:?}"),
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn transitions_to_half_open_after_timeout() {
    let cb = CircuitBreaker::new("api", fast_config());
    for _ in 0..3 {
        fail(&cb, "fail").await;
    }
    assert_eq!(cb.state().await, CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(150)).await;

    let result = cb.execute(|| async { Ok::<_, String>(99) }).await;
    assert_eq!(result.unwrap(), 99);
    assert_eq!(cb.state().await, CircuitState::HalfOpen);
    assert_eq!(cb.success_count().await, 1);
}

#[tokio::test]
async fn recovers_from_half_open_to_closed() {
    let cb = CircuitBreaker::new("api", fast_config());
    for _ in 0..3 {
        fail(&cb, "fail").await;
    }

    tokio::time::sleep(Duration::from_millis(150)).await;

    let _ = cb.execute(|| async { Ok::<_, String>(1) }).await;
    let _ = cb.execute(|| async { Ok::<_, String>(2) }).await;

    assert_eq!(cb.state().await, CircuitState::Closed);
    assert_eq!(cb.failure_count().await, 0);
}

/// Start a half-open call that holds its slot until `gate` gets a permit.
async fn hold_half_open_slot(
    cb: &CircuitBreaker,
    gate: &Arc<tokio::sync::Semaphore>,
) -> tokio::task::JoinHandle<Result<(), BreakerError<String>>> {
    let (cb, gate) = (cb.clone(), gate.clone());
    let (admitted_tx, admitted_rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(async move {
        cb.execute(move || async move {
            let _ = admitted_tx.send(());
            let _permit = gate.acquire().await.map_err(|e| e.to_string())?;
            Ok::<_, String>(())
        })
        .await
    });
    admitted_rx.await.unwrap();
    handle
}

#[tokio::test]
async fn half_open_rejects_calls_beyond_the_attempt_budget() {
    let cb = CircuitBreaker::new("api", fast_config());
    for _ in 0..3 {
        fail(&cb, "fail").await;
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let first = hold_half_open_slot(&cb, &gate).await;
    let second = hold_half_open_slot(&cb, &gate).await;
    assert_eq!(cb.state().await, CircuitState::HalfOpen);

    let calls = AtomicU32::new(0);
    let rejected = cb
        .execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(())
        })
        .await;
    assert!(matches!(
        rejected,
        Err(BreakerError::HalfOpenSaturated { ref name }) if name == "api"
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(cb.state().await, CircuitState::HalfOpen);

    gate.add_permits(2);
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(cb.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn aborted_half_open_call_frees_its_slot() {
    let mut config = fast_config();
    config.half_open_max_attempts = 1;
    let cb = CircuitBreaker::new("api", config);
    for _ in 0..3 {
        fail(&cb, "fail").await;
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let stuck = hold_half_open_slot(&cb, &gate).await;
    let rejected = cb.execute(|| async { Ok::<_, String>(()) }).await;
    assert!(matches!(
        rejected,
        Err(BreakerError::HalfOpenSaturated { .. })
    ));

    stuck.abort();
    assert!(stuck.await.unwrap_err().is_cancelled());

    cb.execute(|| async { Ok::<_, String>(()) }).await.unwrap();
    assert_eq!(cb.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn failure_in_half_open_reopens() {
    let cb = CircuitBreaker::new("api", fast_config());
    for _ in 0..3 {
        fail(&cb, "fail").await;
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    fail(&cb, "still failing").await;

    assert_eq!(cb.state().await, CircuitState::Open);
}

#[tokio::test]
async fn failure_count_reaching_permanent_threshold_is_terminal() {
    let config = BreakerConfig {
        failure_threshold: 2,
        half_open_max_attempts: 1,
        timeout_ms: 10,
        permanent_open_threshold: 4,
        permanent_open_patterns: Vec::new(),
    };
    let cb = CircuitBreaker::new("api", config);

    for _ in 0..2 {
        fail(&cb, "fail").await;
    }
    assert_eq!(cb.state().await, CircuitState::Open);

    // Each elapsed timeout lets one more probe fail.
    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        fail(&cb, "fail").await;
    }
    assert_eq!(cb.state().await, CircuitState::PermanentOpen);

    tokio::time::sleep(Duration::from_millis(30)).await;
    let result = cb.execute(|| async { Ok::<_, String>(1) }).await;
    assert!(matches!(result, Err(BreakerError::PermanentlyOpen { .. })));
}

#[tokio::test]
async fn matching_error_message_opens_permanently() {
    let cb = CircuitBreaker::new("api", fast_config());
    fail(&cb, "401: invalid api key supplied").await;

    let status = cb.status().await;
    assert_eq!(status.state, CircuitState::PermanentOpen);
    assert!(status
        .permanent_open_reason
        .unwrap()
        .contains("invalid api key"));
}

#[tokio::test]
async fn permanent_open_rejects_until_forced_reset() {
    let cb = CircuitBreaker::new("api", fast_config());
    fail(&cb, "INVALID API KEY").await;

    for _ in 0..3 {
        let result = cb.execute(|| async { Ok::<_, String>(1) }).await;
        assert!(matches!(result, Err(BreakerError::PermanentlyOpen { .. })));
    }

    assert!(!cb.reset(false).await);
    assert_eq!(cb.state().await, CircuitState::PermanentOpen);

    assert!(cb.reset(true).await);
    assert_eq!(cb.state().await, CircuitState::Closed);
    let result = cb.execute(|| async { Ok::<_, String>(7) }).await;
    assert_eq!(result.unwrap(), 7);
}

#[tokio::test]
async fn manual_reset() {
    let cb = CircuitBreaker::new("api", fast_config());
    for _ in 0..3 {
        fail(&cb, "fail").await;
    }
    assert_eq!(cb.state().await, CircuitState::Open);

    assert!(cb.reset(false).await);
    assert_eq!(cb.state().await, CircuitState::Closed);
    assert_eq!(cb.failure_count().await, 0);
    assert!(cb.status().await.last_failure_time.is_none());
}

#[tokio::test]
async fn registry_creates_lazily_and_shares_state() {
    let registry = CircuitBreakerRegistry::new(fast_config());
    assert!(registry.is_empty());

    let a = registry.get_or_create("remote-api");
    let again = registry.get_or_create("remote-api");
    for _ in 0..3 {
        fail(&a, "fail").await;
    }
    assert_eq!(again.state().await, CircuitState::Open);
    assert_eq!(registry.len(), 1);

    registry.get_or_create("embeddings");
    let names: Vec<String> = registry
        .get_status()
        .await
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, vec!["embeddings".to_string(), "remote-api".to_string()]);
    assert!(registry.get("missing").is_none());
}

#[tokio::test]
async fn registry_reset_all_respects_force() {
    let registry = CircuitBreakerRegistry::new(fast_config());
    let open = registry.get_or_create("open");
    let permanent = registry.get_or_create("permanent");
    for _ in 0..3 {
        fail(&open, "fail").await;
    }
    fail(&permanent, "invalid api key").await;

    assert_eq!(registry.reset_all(false).await, 1);
    assert_eq!(open.state().await, CircuitState::Closed);
    assert_eq!(permanent.state().await, CircuitState::PermanentOpen);

    assert_eq!(registry.reset_all(true).await, 2);
    assert_eq!(permanent.state().await, CircuitState::Closed);
}
