use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Events emitted by error handlers, route policies, pools and caches.
///
/// Events describe state changes, not individual log lines; sinks decide whether to log,
/// aggregate or forward them.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PolicyEvent {
    /// Error handler decisions
    Redelivery(RedeliveryEvent),
    /// Circuit breaker route policy transitions
    CircuitBreaker(CircuitBreakerEvent),
    /// Inflight throttle actions
    Throttle(ThrottleEvent),
    /// Resource pool lifecycle
    Pool(PoolEvent),
    /// Paired notifications around every producer dispatch
    Exchange(ExchangeEvent),
}

/// Events emitted by the error handler.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RedeliveryEvent {
    /// A redelivery is about to be made after `delay`.
    Attempt { exchange_id: String, attempt: u32, delay: Duration },
    /// No more redeliveries are allowed.
    Exhausted { exchange_id: String, attempts: u32 },
    /// The failure was marked handled.
    Handled { exchange_id: String },
    /// The failure was ignored and routing continued.
    Continued { exchange_id: String },
    /// The exchange was dispatched to the dead letter endpoint.
    DeadLettered { exchange_id: String, endpoint: String },
    /// A pending redelivery was dropped because the handler is stopping.
    Abandoned { exchange_id: String, attempts: u32 },
}

/// Events emitted by the circuit breaker route policy.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CircuitBreakerEvent {
    /// Circuit opened and the consumer was suspended.
    Opened { route_id: String, failures: u64 },
    /// Circuit half-open; the consumer was resumed to probe with live traffic.
    HalfOpen { route_id: String },
    /// Circuit closed; counters were reset.
    Closed { route_id: String },
}

/// Events emitted by the inflight throttle route policy.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ThrottleEvent {
    Suspended { route_id: String, inflight: usize, max: usize },
    Resumed { route_id: String, inflight: usize, threshold: usize },
}

/// Events emitted by resource pools.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PoolEvent {
    /// A new resource was created and started.
    Created { endpoint: String },
    /// A released resource did not fit the idle queue and was stopped.
    Discarded { endpoint: String },
    /// A resource or a whole endpoint entry was marked for eviction.
    Evicted { endpoint: String },
}

/// Paired notifications around a producer dispatch; `Sending` always precedes `Sent`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExchangeEvent {
    Sending { exchange_id: String, endpoint: String },
    Sent { exchange_id: String, endpoint: String, duration: Duration, failed: bool },
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::Redelivery(event) => write!(f, "Redelivery::{}", event),
            PolicyEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
            PolicyEvent::Throttle(event) => write!(f, "Throttle::{}", event),
            PolicyEvent::Pool(event) => write!(f, "Pool::{}", event),
            PolicyEvent::Exchange(event) => write!(f, "Exchange::{}", event),
        }
    }
}

impl fmt::Display for RedeliveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedeliveryEvent::Attempt { exchange_id, attempt, delay } => {
                write!(f, "Attempt({}, #{}, delay={:?})", exchange_id, attempt, delay)
            }
            RedeliveryEvent::Exhausted { exchange_id, attempts } => {
                write!(f, "Exhausted({}, attempts={})", exchange_id, attempts)
            }
            RedeliveryEvent::Handled { exchange_id } => write!(f, "Handled({})", exchange_id),
            RedeliveryEvent::Continued { exchange_id } => write!(f, "Continued({})", exchange_id),
            RedeliveryEvent::DeadLettered { exchange_id, endpoint } => {
                write!(f, "DeadLettered({} -> {})", exchange_id, endpoint)
            }
            RedeliveryEvent::Abandoned { exchange_id, attempts } => {
                write!(f, "Abandoned({}, attempts={})", exchange_id, attempts)
            }
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { route_id, failures } => {
                write!(f, "Opened({}, failures={})", route_id, failures)
            }
            CircuitBreakerEvent::HalfOpen { route_id } => write!(f, "HalfOpen({})", route_id),
            CircuitBreakerEvent::Closed { route_id } => write!(f, "Closed({})", route_id),
        }
    }
}

impl fmt::Display for ThrottleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleEvent::Suspended { route_id, inflight, max } => {
                write!(f, "Suspended({}, {}/{})", route_id, inflight, max)
            }
            ThrottleEvent::Resumed { route_id, inflight, threshold } => {
                write!(f, "Resumed({}, {}<={})", route_id, inflight, threshold)
            }
        }
    }
}

impl fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolEvent::Created { endpoint } => write!(f, "Created({})", endpoint),
            PoolEvent::Discarded { endpoint } => write!(f, "Discarded({})", endpoint),
            PoolEvent::Evicted { endpoint } => write!(f, "Evicted({})", endpoint),
        }
    }
}

impl fmt::Display for ExchangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeEvent::Sending { exchange_id, endpoint } => {
                write!(f, "Sending({} -> {})", exchange_id, endpoint)
            }
            ExchangeEvent::Sent { exchange_id, endpoint, duration, failed } => write!(
                f,
                "Sent({} -> {}, {:?}{})",
                exchange_id,
                endpoint,
                duration,
                if *failed { ", failed" } else { "" }
            ),
        }
    }
}

#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a PolicyEvent into a JSON value for sinks.
pub fn event_to_json(event: &PolicyEvent) -> serde_json::Value {
    match event {
        PolicyEvent::Redelivery(r) => match r {
            RedeliveryEvent::Attempt { exchange_id, attempt, delay } => json!({
                "kind": "redelivery_attempt",
                "exchange_id": exchange_id,
                "attempt": *attempt,
                "delay_ms": clamp_u64(delay.as_millis()),
            }),
            RedeliveryEvent::Exhausted { exchange_id, attempts } => json!({
                "kind": "redelivery_exhausted",
                "exchange_id": exchange_id,
                "attempts": *attempts,
            }),
            RedeliveryEvent::Handled { exchange_id } => {
                json!({ "kind": "failure_handled", "exchange_id": exchange_id })
            }
            RedeliveryEvent::Continued { exchange_id } => {
                json!({ "kind": "failure_continued", "exchange_id": exchange_id })
            }
            RedeliveryEvent::DeadLettered { exchange_id, endpoint } => json!({
                "kind": "dead_lettered",
                "exchange_id": exchange_id,
                "endpoint": endpoint,
            }),
            RedeliveryEvent::Abandoned { exchange_id, attempts } => json!({
                "kind": "redelivery_abandoned",
                "exchange_id": exchange_id,
                "attempts": *attempts,
            }),
        },
        PolicyEvent::CircuitBreaker(c) => match c {
            CircuitBreakerEvent::Opened { route_id, failures } => {
                json!({ "kind": "circuit_opened", "route_id": route_id, "failures": *failures })
            }
            CircuitBreakerEvent::HalfOpen { route_id } => {
                json!({ "kind": "circuit_half_open", "route_id": route_id })
            }
            CircuitBreakerEvent::Closed { route_id } => {
                json!({ "kind": "circuit_closed", "route_id": route_id })
            }
        },
        PolicyEvent::Throttle(t) => match t {
            ThrottleEvent::Suspended { route_id, inflight, max } => json!({
                "kind": "throttle_suspended",
                "route_id": route_id,
                "inflight": *inflight,
                "max": *max,
            }),
            ThrottleEvent::Resumed { route_id, inflight, threshold } => json!({
                "kind": "throttle_resumed",
                "route_id": route_id,
                "inflight": *inflight,
                "threshold": *threshold,
            }),
        },
        PolicyEvent::Pool(p) => match p {
            PoolEvent::Created { endpoint } => json!({ "kind": "pool_created", "endpoint": endpoint }),
            PoolEvent::Discarded { endpoint } => {
                json!({ "kind": "pool_discarded", "endpoint": endpoint })
            }
            PoolEvent::Evicted { endpoint } => json!({ "kind": "pool_evicted", "endpoint": endpoint }),
        },
        PolicyEvent::Exchange(e) => match e {
            ExchangeEvent::Sending { exchange_id, endpoint } => json!({
                "kind": "exchange_sending",
                "exchange_id": exchange_id,
                "endpoint": endpoint,
            }),
            ExchangeEvent::Sent { exchange_id, endpoint, duration, failed } => json!({
                "kind": "exchange_sent",
                "exchange_id": exchange_id,
                "endpoint": endpoint,
                "duration_ms": clamp_u64(duration.as_millis()),
                "failed": *failed,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redelivery_attempt_display_and_json() {
        let event = PolicyEvent::Redelivery(RedeliveryEvent::Attempt {
            exchange_id: "ex-1".into(),
            attempt: 2,
            delay: Duration::from_millis(200),
        });
        assert!(event.to_string().contains("#2"));

        let v = event_to_json(&event);
        assert_eq!(v["kind"], "redelivery_attempt");
        assert_eq!(v["attempt"], 2);
        assert_eq!(v["delay_ms"], 200);
    }

    #[test]
    fn circuit_opened_json() {
        let v = event_to_json(&PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Opened {
            route_id: "orders".into(),
            failures: 4,
        }));
        assert_eq!(v["kind"], "circuit_opened");
        assert_eq!(v["route_id"], "orders");
        assert_eq!(v["failures"], 4);
    }

    #[test]
    fn throttle_display() {
        let event = ThrottleEvent::Suspended { route_id: "r".into(), inflight: 101, max: 100 };
        assert!(event.to_string().contains("101/100"));
    }

    #[test]
    fn sent_event_marks_failures() {
        let sent = ExchangeEvent::Sent {
            exchange_id: "e".into(),
            endpoint: "mock:dlq".into(),
            duration: Duration::from_millis(3),
            failed: true,
        };
        assert!(sent.to_string().contains("failed"));
        let v = event_to_json(&PolicyEvent::Exchange(sent));
        assert_eq!(v["failed"], true);
        assert_eq!(v["duration_ms"], 3);
    }
}
