//! Exception policies: declarative rules matching a failure to its handling.
//!
//! An [`ExceptionPolicy`] lists one or more exception types, an optional route scope and an
//! optional `on_when` guard. It is registered in [`ExceptionPolicies`] under one
//! [`ExceptionPolicyKey`] per exception type. At runtime an [`ExceptionPolicyResolver`] picks
//! the single best policy for a failure.
//!
//! ```rust
//! use routeguard::{
//!     DefaultExceptionPolicyResolver, Exchange, ExceptionPolicies, ExceptionPolicy,
//!     ExceptionPolicyResolver, ExceptionType, Failure,
//! };
//!
//! let io = ExceptionType::new("IoException");
//! let connect = io.subtype("ConnectException");
//!
//! let mut policies = ExceptionPolicies::new();
//! policies.add(ExceptionPolicy::builder(io.clone()).id("global-io").build().unwrap());
//! policies.add(
//!     ExceptionPolicy::builder(io.clone()).id("orders-io").route_scoped("orders").build().unwrap(),
//! );
//!
//! let mut exchange = Exchange::with_body("payload");
//! exchange.set_route_id("orders");
//! let failure = Failure::new(connect, "refused");
//!
//! let resolved = DefaultExceptionPolicyResolver.resolve(&policies, &exchange, &failure);
//! assert_eq!(resolved.unwrap().id(), "orders-io");
//! ```

use crate::error::{ConfigError, ReferenceKind};
use crate::exception::{ExceptionType, Failure};
use crate::exchange::Exchange;
use crate::processor::{Predicate, SharedProcessor};
use crate::redelivery::RedeliveryPolicy;
use crate::registry::Registry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Map key of a registered policy. Route-scoped and global keys for the same type differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExceptionPolicyKey {
    route_id: Option<String>,
    exception_type: ExceptionType,
    when: Option<Predicate>,
}

impl ExceptionPolicyKey {
    pub fn new(
        route_id: Option<String>,
        exception_type: ExceptionType,
        when: Option<Predicate>,
    ) -> Self {
        Self { route_id, exception_type, when }
    }

    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    pub fn exception_type(&self) -> &ExceptionType {
        &self.exception_type
    }

    pub fn when(&self) -> Option<&Predicate> {
        self.when.as_ref()
    }
}

/// Where an exception policy takes its redelivery settings from.
#[derive(Debug, Clone)]
pub enum RedeliverySource {
    Inline(Arc<RedeliveryPolicy>),
    /// Name looked up in the [`Registry`] when the error handler is built.
    Reference(String),
}

/// Handling rule for one or more exception types. Immutable once built.
#[derive(Clone)]
pub struct ExceptionPolicy {
    id: String,
    route_id: Option<String>,
    exception_types: Vec<ExceptionType>,
    when: Option<Predicate>,
    handled: Option<Predicate>,
    continued: Option<Predicate>,
    retry_while: Option<Predicate>,
    on_redelivery: Option<SharedProcessor>,
    on_exception_occurred: Option<SharedProcessor>,
    on_prepare_failure: Option<SharedProcessor>,
    redelivery: Option<RedeliverySource>,
    use_original_message: bool,
    use_original_body: bool,
    outputs: Option<SharedProcessor>,
}

impl ExceptionPolicy {
    pub fn builder(exception_type: ExceptionType) -> ExceptionPolicyBuilder {
        ExceptionPolicyBuilder::new(exception_type)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    pub fn exception_types(&self) -> &[ExceptionType] {
        &self.exception_types
    }

    pub fn when(&self) -> Option<&Predicate> {
        self.when.as_ref()
    }

    pub fn handled(&self) -> Option<&Predicate> {
        self.handled.as_ref()
    }

    pub fn continued(&self) -> Option<&Predicate> {
        self.continued.as_ref()
    }

    pub fn retry_while(&self) -> Option<&Predicate> {
        self.retry_while.as_ref()
    }

    pub fn on_redelivery(&self) -> Option<&SharedProcessor> {
        self.on_redelivery.as_ref()
    }

    pub fn on_exception_occurred(&self) -> Option<&SharedProcessor> {
        self.on_exception_occurred.as_ref()
    }

    pub fn on_prepare_failure(&self) -> Option<&SharedProcessor> {
        self.on_prepare_failure.as_ref()
    }

    pub fn redelivery(&self) -> Option<&RedeliverySource> {
        self.redelivery.as_ref()
    }

    /// The inline redelivery policy; `None` for references not yet resolved.
    pub fn redelivery_policy(&self) -> Option<&Arc<RedeliveryPolicy>> {
        match &self.redelivery {
            Some(RedeliverySource::Inline(policy)) => Some(policy),
            _ => None,
        }
    }

    pub fn use_original_message(&self) -> bool {
        self.use_original_message
    }

    pub fn use_original_body(&self) -> bool {
        self.use_original_body
    }

    pub fn outputs(&self) -> Option<&SharedProcessor> {
        self.outputs.as_ref()
    }

    pub fn has_outputs(&self) -> bool {
        self.outputs.is_some()
    }

    /// One key per exception type.
    pub fn keys(&self) -> impl Iterator<Item = ExceptionPolicyKey> + '_ {
        self.exception_types
            .iter()
            .map(|t| ExceptionPolicyKey::new(self.route_id.clone(), t.clone(), self.when.clone()))
    }

    /// Copy with a by-name redelivery reference replaced by the registered policy.
    pub fn resolve_references(&self, registry: &Registry) -> Result<Self, ConfigError> {
        match &self.redelivery {
            Some(RedeliverySource::Reference(name)) => {
                let policy = registry.redelivery_policy(name).ok_or_else(|| {
                    ConfigError::UnresolvedReference {
                        kind: ReferenceKind::RedeliveryPolicy,
                        name: name.clone(),
                    }
                })?;
                let mut resolved = self.clone();
                resolved.redelivery = Some(RedeliverySource::Inline(policy));
                Ok(resolved)
            }
            _ => Ok(self.clone()),
        }
    }
}

impl fmt::Debug for ExceptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionPolicy")
            .field("id", &self.id)
            .field("route_id", &self.route_id)
            .field("exception_types", &self.exception_types)
            .field("guarded", &self.when.is_some())
            .field("redelivery", &self.redelivery)
            .field("has_outputs", &self.has_outputs())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ExceptionPolicy`].
pub struct ExceptionPolicyBuilder {
    policy: ExceptionPolicy,
    inline: Option<RedeliveryPolicy>,
    reference: Option<String>,
}

impl ExceptionPolicyBuilder {
    fn new(exception_type: ExceptionType) -> Self {
        Self {
            policy: ExceptionPolicy {
                id: String::new(),
                route_id: None,
                exception_types: vec![exception_type],
                when: None,
                handled: None,
                continued: None,
                retry_while: None,
                on_redelivery: None,
                on_exception_occurred: None,
                on_prepare_failure: None,
                redelivery: None,
                use_original_message: false,
                use_original_body: false,
                outputs: None,
            },
            inline: None,
            reference: None,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.policy.id = id.into();
        self
    }

    /// Also match this exception type.
    pub fn exception(mut self, exception_type: ExceptionType) -> Self {
        if !self.policy.exception_types.contains(&exception_type) {
            self.policy.exception_types.push(exception_type);
        }
        self
    }

    /// Restrict the policy to one route.
    pub fn route_scoped(mut self, route_id: impl Into<String>) -> Self {
        self.policy.route_id = Some(route_id.into());
        self
    }

    /// Guard: the policy only qualifies when the predicate holds for the exchange.
    pub fn on_when(mut self, predicate: Predicate) -> Self {
        self.policy.when = Some(predicate);
        self
    }

    pub fn handled(mut self, predicate: Predicate) -> Self {
        self.policy.handled = Some(predicate);
        self
    }

    pub fn continued(mut self, predicate: Predicate) -> Self {
        self.policy.continued = Some(predicate);
        self
    }

    pub fn retry_while(mut self, predicate: Predicate) -> Self {
        self.policy.retry_while = Some(predicate);
        self
    }

    pub fn on_redelivery(mut self, processor: SharedProcessor) -> Self {
        self.policy.on_redelivery = Some(processor);
        self
    }

    pub fn on_exception_occurred(mut self, processor: SharedProcessor) -> Self {
        self.policy.on_exception_occurred = Some(processor);
        self
    }

    pub fn on_prepare_failure(mut self, processor: SharedProcessor) -> Self {
        self.policy.on_prepare_failure = Some(processor);
        self
    }

    pub fn redelivery_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.inline = Some(policy);
        self
    }

    pub fn redelivery_policy_ref(mut self, name: impl Into<String>) -> Self {
        self.reference = Some(name.into());
        self
    }

    pub fn use_original_message(mut self, enabled: bool) -> Self {
        self.policy.use_original_message = enabled;
        self
    }

    pub fn use_original_body(mut self, enabled: bool) -> Self {
        self.policy.use_original_body = enabled;
        self
    }

    /// Custom handling processor; replaces the dead letter endpoint as failure destination.
    pub fn outputs(mut self, processor: SharedProcessor) -> Self {
        self.policy.outputs = Some(processor);
        self
    }

    pub fn build(self) -> Result<ExceptionPolicy, ConfigError> {
        let mut policy = self.policy;
        if policy.id.is_empty() {
            let names: Vec<&str> = policy.exception_types.iter().map(|t| t.name()).collect();
            policy.id = format!("onException[{}]", names.join(","));
        }
        policy.redelivery = match (self.inline, self.reference) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::ConflictingRedeliveryPolicy { owner: policy.id })
            }
            (Some(inline), None) => Some(RedeliverySource::Inline(Arc::new(inline))),
            (None, Some(name)) => Some(RedeliverySource::Reference(name)),
            (None, None) => None,
        };
        Ok(policy)
    }
}

#[derive(Debug, Clone)]
struct Registration {
    key: ExceptionPolicyKey,
    policy: Arc<ExceptionPolicy>,
}

/// Ordered set of exception policies, fixed once the route is built.
///
/// Registering a policy under a key that already exists replaces the earlier policy but keeps
/// its registration position.
#[derive(Debug, Clone, Default)]
pub struct ExceptionPolicies {
    entries: Vec<Registration>,
    index: HashMap<ExceptionPolicyKey, usize>,
}

impl ExceptionPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, policy: ExceptionPolicy) {
        let policy = Arc::new(policy);
        for key in policy.keys() {
            match self.index.get(&key) {
                Some(&position) => {
                    self.entries[position].policy = Arc::clone(&policy);
                }
                None => {
                    self.index.insert(key.clone(), self.entries.len());
                    self.entries.push(Registration { key, policy: Arc::clone(&policy) });
                }
            }
        }
    }

    pub fn with(mut self, policy: ExceptionPolicy) -> Self {
        self.add(policy);
        self
    }

    pub fn get(&self, key: &ExceptionPolicyKey) -> Option<&Arc<ExceptionPolicy>> {
        self.index.get(key).map(|&position| &self.entries[position].policy)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered `(key, policy)` pairs in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&ExceptionPolicyKey, &Arc<ExceptionPolicy>)> {
        self.entries.iter().map(|r| (&r.key, &r.policy))
    }

    /// Distinct policies in registration order.
    pub fn policies(&self) -> Vec<Arc<ExceptionPolicy>> {
        let mut seen: Vec<Arc<ExceptionPolicy>> = Vec::new();
        for registration in &self.entries {
            if !seen.iter().any(|p| Arc::ptr_eq(p, &registration.policy)) {
                seen.push(Arc::clone(&registration.policy));
            }
        }
        seen
    }

    /// Copy with every policy's redelivery reference resolved. Each key keeps the policy
    /// currently registered for it, at the same position.
    pub fn resolve_references(&self, registry: &Registry) -> Result<Self, ConfigError> {
        let mut resolved: Vec<(Arc<ExceptionPolicy>, Arc<ExceptionPolicy>)> = Vec::new();
        let mut entries = Vec::with_capacity(self.entries.len());
        for registration in &self.entries {
            let known = resolved.iter().find(|(from, _)| Arc::ptr_eq(from, &registration.policy));
            let policy = match known {
                Some((_, to)) => Arc::clone(to),
                None => {
                    let to = Arc::new(registration.policy.resolve_references(registry)?);
                    resolved.push((Arc::clone(&registration.policy), Arc::clone(&to)));
                    to
                }
            };
            entries.push(Registration { key: registration.key.clone(), policy });
        }
        Ok(Self { entries, index: self.index.clone() })
    }
}

/// Strategy picking the policy for a failure. Pure: no side effects on the exchange.
pub trait ExceptionPolicyResolver: Send + Sync + fmt::Debug {
    fn resolve(
        &self,
        policies: &ExceptionPolicies,
        exchange: &Exchange,
        failure: &Failure,
    ) -> Option<Arc<ExceptionPolicy>>;
}

/// Walks the cause chain from the innermost failure outwards. For each failure, candidates
/// are the registrations whose type is the failure's type or an ancestor of it, whose route
/// scope is global or the exchange's route, and whose guard (if any) holds. Candidates rank
/// by route scope, then type distance, then guarded before unguarded, then registration
/// order. The first failure in the walk with any candidate decides.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultExceptionPolicyResolver;

impl ExceptionPolicyResolver for DefaultExceptionPolicyResolver {
    fn resolve(
        &self,
        policies: &ExceptionPolicies,
        exchange: &Exchange,
        failure: &Failure,
    ) -> Option<Arc<ExceptionPolicy>> {
        let route_id = exchange.route_id();
        let chain: Vec<&Failure> = failure.chain().collect();

        for link in chain.iter().rev() {
            let best = policies
                .entries
                .iter()
                .enumerate()
                .filter_map(|(order, registration)| {
                    let key = &registration.key;
                    let route_scoped = match key.route_id() {
                        None => false,
                        Some(scope) if Some(scope) == route_id => true,
                        Some(_) => return None,
                    };
                    let distance = link.kind().distance_to(key.exception_type())?;
                    let guarded = match key.when() {
                        Some(guard) if !guard.matches(exchange) => return None,
                        Some(_) => true,
                        None => false,
                    };
                    Some(((!route_scoped, distance, !guarded, order), registration))
                })
                .min_by_key(|(rank, _)| *rank);

            if let Some((_, registration)) = best {
                tracing::trace!(
                    target: "routeguard::exception_policy",
                    policy = %registration.policy.id(),
                    failure = %link.kind(),
                    "exception policy resolved"
                );
                return Some(Arc::clone(&registration.policy));
            }
        }
        None
    }
}
