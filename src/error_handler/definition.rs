//! Error handler definitions and the factory turning them into handlers.
//!
//! A definition is plain configuration: which variant, and the redelivery options it carries.
//! [`ErrorHandlerFactory`] maps each [`ErrorHandlerKind`] to a constructor function. The map is
//! an ordinary value injected where handlers are created, so tests can register their own
//! constructors and [`reset`](ErrorHandlerFactory::reset) afterwards.

use super::{ErrorHandler, ErrorHandlerBuilder};
use crate::cache::ProducerCache;
use crate::error::ConfigError;
use crate::exception_policy::ExceptionPolicies;
use crate::processor::{Predicate, SharedProcessor};
use crate::redelivery::RedeliveryPolicy;
use crate::registry::Registry;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::EventNotifier;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Error handler variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorHandlerKind {
    /// Failures propagate untouched: no redelivery, no logging.
    NoErrorHandler,
    /// Redeliver, then rethrow.
    Default,
    /// Redeliver, then send to a dead letter endpoint.
    DeadLetterChannel,
}

impl fmt::Display for ErrorHandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorHandlerKind::NoErrorHandler => write!(f, "NoErrorHandler"),
            ErrorHandlerKind::Default => write!(f, "DefaultErrorHandler"),
            ErrorHandlerKind::DeadLetterChannel => write!(f, "DeadLetterChannel"),
        }
    }
}

/// Redelivery configuration shared by the redelivering variants.
#[derive(Clone, Default)]
pub struct RedeliveryOptions {
    pub redelivery_policy: Option<RedeliveryPolicy>,
    /// Name of a policy in the registry. Mutually exclusive with `redelivery_policy`.
    pub redelivery_policy_ref: Option<String>,
    /// Name of the executor used for asynchronous delayed redelivery.
    pub executor_ref: Option<String>,
    pub on_redelivery: Option<SharedProcessor>,
    pub on_exception_occurred: Option<SharedProcessor>,
    pub on_prepare_failure: Option<SharedProcessor>,
    pub retry_while: Option<Predicate>,
    pub use_original_message: bool,
    pub use_original_body: bool,
}

impl RedeliveryOptions {
    pub fn with_policy(policy: RedeliveryPolicy) -> Self {
        Self { redelivery_policy: Some(policy), ..Self::default() }
    }

    pub fn with_policy_ref(name: impl Into<String>) -> Self {
        Self { redelivery_policy_ref: Some(name.into()), ..Self::default() }
    }

    fn apply(&self, mut builder: ErrorHandlerBuilder) -> ErrorHandlerBuilder {
        if let Some(policy) = &self.redelivery_policy {
            builder = builder.redelivery_policy(policy.clone());
        }
        if let Some(name) = &self.redelivery_policy_ref {
            builder = builder.redelivery_policy_ref(name.clone());
        }
        if let Some(name) = &self.executor_ref {
            builder = builder.executor_ref(name.clone());
        }
        if let Some(hook) = &self.on_redelivery {
            builder = builder.on_redelivery(Arc::clone(hook));
        }
        if let Some(hook) = &self.on_exception_occurred {
            builder = builder.on_exception_occurred(Arc::clone(hook));
        }
        if let Some(hook) = &self.on_prepare_failure {
            builder = builder.on_prepare_failure(Arc::clone(hook));
        }
        if let Some(predicate) = &self.retry_while {
            builder = builder.retry_while(predicate.clone());
        }
        builder
            .use_original_message(self.use_original_message)
            .use_original_body(self.use_original_body)
    }
}

impl fmt::Debug for RedeliveryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedeliveryOptions")
            .field("redelivery_policy", &self.redelivery_policy)
            .field("redelivery_policy_ref", &self.redelivery_policy_ref)
            .field("executor_ref", &self.executor_ref)
            .field("use_original_message", &self.use_original_message)
            .field("use_original_body", &self.use_original_body)
            .finish_non_exhaustive()
    }
}

/// Declarative error handler configuration for one route.
#[derive(Debug, Clone)]
pub enum ErrorHandlerDefinition {
    NoErrorHandler,
    Default(RedeliveryOptions),
    DeadLetterChannel { uri: String, options: RedeliveryOptions },
}

impl ErrorHandlerDefinition {
    pub fn dead_letter(uri: impl Into<String>, options: RedeliveryOptions) -> Self {
        ErrorHandlerDefinition::DeadLetterChannel { uri: uri.into(), options }
    }

    pub fn kind(&self) -> ErrorHandlerKind {
        match self {
            ErrorHandlerDefinition::NoErrorHandler => ErrorHandlerKind::NoErrorHandler,
            ErrorHandlerDefinition::Default(_) => ErrorHandlerKind::Default,
            ErrorHandlerDefinition::DeadLetterChannel { .. } => ErrorHandlerKind::DeadLetterChannel,
        }
    }

    pub fn options(&self) -> Option<&RedeliveryOptions> {
        match self {
            ErrorHandlerDefinition::NoErrorHandler => None,
            ErrorHandlerDefinition::Default(options)
            | ErrorHandlerDefinition::DeadLetterChannel { options, .. } => Some(options),
        }
    }

    pub fn dead_letter_uri(&self) -> Option<&str> {
        match self {
            ErrorHandlerDefinition::DeadLetterChannel { uri, .. } => Some(uri.as_str()),
            _ => None,
        }
    }

    /// Whether the definition redelivers at all.
    pub fn supports_redelivery(&self) -> bool {
        !matches!(self, ErrorHandlerDefinition::NoErrorHandler)
    }
}

impl Default for ErrorHandlerDefinition {
    fn default() -> Self {
        ErrorHandlerDefinition::Default(RedeliveryOptions::default())
    }
}

/// Everything a constructor needs besides the definition.
pub struct ErrorHandlerContext {
    pub route_id: String,
    pub output: SharedProcessor,
    pub exception_policies: ExceptionPolicies,
    pub registry: Arc<Registry>,
    pub producers: ProducerCache,
    pub sleeper: Arc<dyn Sleeper>,
    pub notifier: EventNotifier,
}

impl ErrorHandlerContext {
    pub fn new(route_id: impl Into<String>, output: SharedProcessor, registry: Arc<Registry>) -> Self {
        Self {
            route_id: route_id.into(),
            output,
            exception_policies: ExceptionPolicies::new(),
            registry,
            producers: ProducerCache::new(),
            sleeper: Arc::new(TokioSleeper),
            notifier: EventNotifier::disabled(),
        }
    }

    pub fn with_exception_policies(mut self, policies: ExceptionPolicies) -> Self {
        self.exception_policies = policies;
        self
    }

    pub fn with_producers(mut self, producers: ProducerCache) -> Self {
        self.producers = producers;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_notifier(mut self, notifier: EventNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    fn into_builder(self) -> ErrorHandlerBuilder {
        ErrorHandler::builder(self.route_id, self.output)
            .exception_policies(self.exception_policies)
            .registry(self.registry)
            .producer_cache(self.producers)
            .sleeper(self.sleeper)
            .notifier(self.notifier)
    }
}

/// Constructor registered for an [`ErrorHandlerKind`].
pub type ErrorHandlerConstructor =
    fn(&ErrorHandlerDefinition, ErrorHandlerContext) -> Result<ErrorHandler, ConfigError>;

/// Maps each handler kind to its constructor.
#[derive(Clone)]
pub struct ErrorHandlerFactory {
    constructors: HashMap<ErrorHandlerKind, ErrorHandlerConstructor>,
}

impl Default for ErrorHandlerFactory {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ErrorHandlerFactory {
    /// Factory with no constructors registered.
    pub fn empty() -> Self {
        Self { constructors: HashMap::new() }
    }

    /// Factory with the built-in constructor for every kind.
    pub fn with_defaults() -> Self {
        let mut factory = Self::empty();
        factory.reset();
        factory
    }

    /// Register `constructor` for `kind`, returning the one it replaces.
    pub fn register(
        &mut self,
        kind: ErrorHandlerKind,
        constructor: ErrorHandlerConstructor,
    ) -> Option<ErrorHandlerConstructor> {
        self.constructors.insert(kind, constructor)
    }

    pub fn contains(&self, kind: ErrorHandlerKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    /// Drop custom registrations and restore the built-in constructors.
    pub fn reset(&mut self) {
        self.constructors.clear();
        self.constructors.insert(ErrorHandlerKind::NoErrorHandler, create_no_error_handler);
        self.constructors.insert(ErrorHandlerKind::Default, create_default);
        self.constructors.insert(ErrorHandlerKind::DeadLetterChannel, create_dead_letter_channel);
    }

    /// Build the handler for `definition`. Configuration errors surface here, never at runtime.
    pub fn create(
        &self,
        definition: &ErrorHandlerDefinition,
        context: ErrorHandlerContext,
    ) -> Result<ErrorHandler, ConfigError> {
        let kind = definition.kind();
        let constructor = self
            .constructors
            .get(&kind)
            .ok_or_else(|| ConfigError::UnknownErrorHandler(kind.to_string()))?;
        tracing::debug!(
            target: "routeguard::error_handler",
            route_id = %context.route_id,
            kind = %kind,
            "creating error handler"
        );
        constructor(definition, context)
    }
}

impl fmt::Debug for ErrorHandlerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.constructors.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        f.debug_struct("ErrorHandlerFactory").field("kinds", &kinds).finish()
    }
}

fn create_no_error_handler(
    _definition: &ErrorHandlerDefinition,
    context: ErrorHandlerContext,
) -> Result<ErrorHandler, ConfigError> {
    let policy = RedeliveryPolicy::builder()
        .maximum_redeliveries(0)
        .log_exhausted(false)
        .log_retry_attempted(false)
        .build()?;
    ErrorHandler::builder(context.route_id, context.output)
        .redelivery_policy(policy)
        .registry(context.registry)
        .notifier(context.notifier)
        .build()
}

fn create_default(
    definition: &ErrorHandlerDefinition,
    context: ErrorHandlerContext,
) -> Result<ErrorHandler, ConfigError> {
    let builder = context.into_builder();
    match definition.options() {
        Some(options) => options.apply(builder).build(),
        None => builder.build(),
    }
}

fn create_dead_letter_channel(
    definition: &ErrorHandlerDefinition,
    context: ErrorHandlerContext,
) -> Result<ErrorHandler, ConfigError> {
    let uri = definition
        .dead_letter_uri()
        .ok_or_else(|| ConfigError::invalid("dead letter uri", "dead letter channel requires an endpoint"))?;
    let builder = context.into_builder().dead_letter_uri(uri);
    match definition.options() {
        Some(options) => options.apply(builder).build(),
        None => builder.build(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReferenceKind;
    use crate::exception::{ExceptionType, Failure};
    use crate::exchange::Exchange;
    use crate::processor::processor_fn;
    use crate::sleeper::InstantSleeper;
    use crate::DeliveryState;
    use serde_json::json;

    fn failing_output() -> SharedProcessor {
        Arc::new(processor_fn(|_ex: &mut Exchange| {
            Err(Failure::new(ExceptionType::new("IoException"), "down"))
        }))
    }

    fn context(registry: &Arc<Registry>) -> ErrorHandlerContext {
        ErrorHandlerContext::new("orders", failing_output(), Arc::clone(registry))
            .with_sleeper(Arc::new(InstantSleeper))
    }

    #[test]
    fn definition_kinds() {
        assert_eq!(ErrorHandlerDefinition::NoErrorHandler.kind(), ErrorHandlerKind::NoErrorHandler);
        assert_eq!(ErrorHandlerDefinition::default().kind(), ErrorHandlerKind::Default);
        let dlc = ErrorHandlerDefinition::dead_letter("mock:dead", RedeliveryOptions::default());
        assert_eq!(dlc.kind(), ErrorHandlerKind::DeadLetterChannel);
        assert_eq!(dlc.dead_letter_uri(), Some("mock:dead"));
        assert!(!ErrorHandlerDefinition::NoErrorHandler.supports_redelivery());
    }

    #[test]
    fn conflicting_options_fail_at_create() {
        let registry = Arc::new(Registry::new());
        registry.register_redelivery_policy("shared", RedeliveryPolicy::default());
        let options = RedeliveryOptions {
            redelivery_policy: Some(RedeliveryPolicy::default()),
            redelivery_policy_ref: Some("shared".into()),
            ..Default::default()
        };
        let err = ErrorHandlerFactory::with_defaults()
            .create(&ErrorHandlerDefinition::Default(options), context(&registry))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingRedeliveryPolicy { .. }));
    }

    #[test]
    fn unknown_dead_letter_endpoint_fails_at_create() {
        let registry = Arc::new(Registry::new());
        let definition = ErrorHandlerDefinition::dead_letter("mock:missing", RedeliveryOptions::default());
        let err = ErrorHandlerFactory::with_defaults().create(&definition, context(&registry)).unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedReference { kind: ReferenceKind::Endpoint, .. }));
    }

    #[test]
    fn unregistered_kind_is_reported_and_reset_restores_it() {
        let registry = Arc::new(Registry::new());
        let mut factory = ErrorHandlerFactory::empty();
        let err = factory.create(&ErrorHandlerDefinition::default(), context(&registry)).unwrap_err();
        assert_eq!(err, ConfigError::UnknownErrorHandler("DefaultErrorHandler".into()));

        factory.reset();
        assert!(factory.contains(ErrorHandlerKind::Default));
        assert!(factory.create(&ErrorHandlerDefinition::default(), context(&registry)).is_ok());
    }

    #[test]
    fn custom_constructor_replaces_builtin() {
        fn always_no_handler(
            definition: &ErrorHandlerDefinition,
            context: ErrorHandlerContext,
        ) -> Result<ErrorHandler, ConfigError> {
            create_no_error_handler(definition, context)
        }

        let registry = Arc::new(Registry::new());
        let mut factory = ErrorHandlerFactory::with_defaults();
        assert!(factory.register(ErrorHandlerKind::Default, always_no_handler).is_some());

        let options = RedeliveryOptions::with_policy(
            RedeliveryPolicy::builder().maximum_redeliveries(5).build().unwrap(),
        );
        let handler = factory.create(&ErrorHandlerDefinition::Default(options), context(&registry)).unwrap();
        assert_eq!(handler.redelivery_policy().maximum_redeliveries(), 0);
    }

    #[tokio::test]
    async fn no_error_handler_rethrows_immediately() {
        let registry = Arc::new(Registry::new());
        let handler = ErrorHandlerFactory::with_defaults()
            .create(&ErrorHandlerDefinition::NoErrorHandler, context(&registry))
            .unwrap();
        let delivery = handler.process(Exchange::with_body(json!(1))).await;
        assert_eq!(delivery.state, DeliveryState::Rethrown);
        assert_eq!(delivery.exchange.failure().redelivery_counter, 0);
    }
}
