//! Convenient re-exports for common routeguard types.
pub use crate::{
    cache::{ConsumerCache, ProducerCache},
    endpoint::{Endpoint, PollingConsumer, PooledResource, Producer},
    error::{ConfigError, PoolError},
    error_handler::{Delivery, DeliveryState, ErrorHandler, ErrorHandlerDefinition, ErrorHandlerFactory},
    exception::{ExceptionType, Failure},
    exception_policy::{ExceptionPolicies, ExceptionPolicy},
    exchange::{Exchange, Message},
    processor::{processor_fn, Predicate, Processor},
    redelivery::RedeliveryPolicy,
    route_policy::{
        CircuitBreakerConfig, CircuitBreakerRoutePolicy, InflightThrottlePolicy, Route,
        RouteConsumer, RoutePolicy,
    },
    telemetry::{EventNotifier, PolicyEvent},
};
