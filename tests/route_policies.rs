mod common;

use common::TestConsumer;
use routeguard::telemetry::{CircuitBreakerEvent, MemorySink, ThrottleEvent};
use routeguard::{
    CircuitBreakerConfig, CircuitBreakerRoutePolicy, CircuitState, ConsumerStatus,
    DefaultInflightRepository, EventNotifier, ExceptionType, Exchange, Failure,
    InflightRepository, InflightThrottlePolicy, ManualClock, PolicyEvent, Route, RouteConsumer, RoutePolicy,
    ThrottleScope,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn failed() -> Exchange {
    let mut exchange = Exchange::with_body(json!({"order": 1}));
    exchange.set_exception(Failure::new(ExceptionType::new("IoException"), "backend down"));
    exchange
}

/// Runs one exchange through every policy the way a route would.
async fn complete(policies: &[Arc<dyn RoutePolicy>], route: &Route, exchange: &Exchange) {
    for policy in policies {
        policy.on_exchange_begin(route, exchange).await;
    }
    for policy in policies {
        policy.on_exchange_done(route, exchange).await;
    }
}

#[tokio::test(start_paused = true)]
async fn circuit_breaker_full_cycle() {
    let clock = ManualClock::new(0);
    let sink = MemorySink::new();
    let breaker = CircuitBreakerRoutePolicy::builder(
        CircuitBreakerConfig::builder()
            .failure_threshold(5)
            .failure_window(Duration::from_secs(10))
            .half_open_after(Duration::from_secs(5))
            .build()
            .unwrap(),
    )
    .clock(clock.clone())
    .notifier(EventNotifier::new(sink.clone()))
    .build();
    let consumer = TestConsumer::new();
    let route = Route::new("orders", consumer.clone());
    let policies: Vec<Arc<dyn RoutePolicy>> = vec![Arc::new(breaker.clone())];

    for policy in &policies {
        policy.on_init(&route).await;
    }
    for _ in 0..5 {
        clock.advance(100);
        complete(&policies, &route, &failed()).await;
    }
    assert_eq!(breaker.state().await, CircuitState::Open);
    assert_eq!(consumer.status(), ConsumerStatus::Suspended);
    assert_eq!(breaker.opened_at().await, Some(500));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);

    // The failures are still inside the window, so even a successful probe reopens.
    clock.advance(6_000);
    complete(&policies, &route, &Exchange::with_body(json!(2))).await;
    assert_eq!(breaker.state().await, CircuitState::Open);
    assert_eq!(breaker.failures().await, 5);

    tokio::time::sleep(Duration::from_secs(6)).await;
    clock.advance(11_000);
    complete(&policies, &route, &Exchange::with_body(json!(3))).await;
    assert_eq!(breaker.state().await, CircuitState::Closed);
    assert_eq!(breaker.failures().await, 0);

    assert_eq!(
        consumer.transitions(),
        vec![
            ConsumerStatus::Suspended,
            ConsumerStatus::Started,
            ConsumerStatus::Suspended,
            ConsumerStatus::Started,
        ]
    );
    let transitions: Vec<_> = sink
        .events()
        .into_iter()
        .filter_map(|event| match event {
            PolicyEvent::CircuitBreaker(event) => Some(event),
            _ => None,
        })
        .collect();
    assert!(matches!(transitions[0], CircuitBreakerEvent::Opened { failures: 5, .. }));
    assert!(matches!(transitions.last(), Some(CircuitBreakerEvent::Closed { .. })));
}

#[tokio::test(start_paused = true)]
async fn manual_close_resets_and_resumes() {
    let breaker = CircuitBreakerRoutePolicy::builder(
        CircuitBreakerConfig::builder().failure_threshold(1).build().unwrap(),
    )
    .clock(ManualClock::new(0))
    .build();
    let consumer = TestConsumer::new();
    let route = Route::new("orders", consumer.clone());

    breaker.on_init(&route).await;
    breaker.on_exchange_done(&route, &failed()).await;
    assert_eq!(breaker.state().await, CircuitState::Open);

    breaker.close().await;
    assert_eq!(breaker.state().await, CircuitState::Closed);
    assert_eq!(consumer.status(), ConsumerStatus::Started);

    // The half-open timer armed by the open transition is void now.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(breaker.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn throttle_suspends_over_max_and_resumes_at_seventy_percent() {
    let sink = MemorySink::new();
    let throttle = InflightThrottlePolicy::builder()
        .max_inflight_exchanges(100)
        .notifier(EventNotifier::new(sink.clone()))
        .build()
        .unwrap();
    let consumer = TestConsumer::new();
    let route = Route::new("orders", consumer.clone());
    let exchange = Exchange::with_body(json!(null));

    for _ in 0..101 {
        throttle.on_exchange_begin(&route, &exchange).await;
    }
    throttle.on_exchange_done(&route, &exchange).await;
    assert_eq!(consumer.status(), ConsumerStatus::Suspended);

    while throttle.repository().size("orders") > 70 {
        throttle.on_exchange_done(&route, &exchange).await;
        assert_eq!(consumer.status(), ConsumerStatus::Suspended);
    }
    throttle.on_exchange_done(&route, &exchange).await;
    assert_eq!(consumer.status(), ConsumerStatus::Started);

    let events = sink.events();
    assert!(matches!(
        events[0],
        PolicyEvent::Throttle(ThrottleEvent::Suspended { inflight: 101, max: 100, .. })
    ));
    assert!(matches!(
        events[1],
        PolicyEvent::Throttle(ThrottleEvent::Resumed { inflight: 70, threshold: 70, .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completions_settle_consistently() {
    let repository: Arc<dyn InflightRepository> = Arc::new(DefaultInflightRepository::new());
    let throttle = InflightThrottlePolicy::builder()
        .max_inflight_exchanges(10)
        .scope(ThrottleScope::Context)
        .repository(Arc::clone(&repository))
        .build()
        .unwrap();
    let consumer = TestConsumer::new();
    let route = Route::new("orders", consumer.clone());
    let exchange = Exchange::with_body(json!(null));

    for _ in 0..50 {
        throttle.on_exchange_begin(&route, &exchange).await;
    }
    let mut tasks = Vec::new();
    for _ in 0..50 {
        let throttle = throttle.clone();
        let route = route.clone();
        let exchange = exchange.clone();
        tasks.push(tokio::spawn(async move { throttle.on_exchange_done(&route, &exchange).await }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(repository.total_size(), 0);
    assert_eq!(consumer.status(), ConsumerStatus::Started);
    let transitions = consumer.transitions();
    for pair in transitions.windows(2) {
        assert_ne!(pair[0], pair[1], "lifecycle calls are idempotent");
    }
}
