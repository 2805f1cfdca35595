//! Failure types and the exception type hierarchy used for policy matching.
//!
//! Routes classify failures by type the way a JVM route engine would use `instanceof`: every
//! [`ExceptionType`] is a node in a single-inheritance tree rooted at [`ExceptionType::root`].
//! Policies registered for a type match that type and all of its descendants; the hierarchy
//! distance between the thrown type and the registered type decides how specific a match is.
//!
//! ```rust
//! use routeguard::{ExceptionType, Failure};
//!
//! let io = ExceptionType::new("IoException");
//! let connect = io.subtype("ConnectException");
//!
//! assert!(connect.is_a(&io));
//! assert_eq!(connect.distance_to(&io), Some(1));
//! assert_eq!(connect.distance_to(&ExceptionType::root()), Some(2));
//!
//! let failure = Failure::new(ExceptionType::new("RouteException"), "send failed")
//!     .with_cause(Failure::new(connect, "connection refused"));
//! assert_eq!(failure.chain().count(), 2);
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

const ROOT_NAME: &str = "Exception";

/// Name of the failure type raised when a redelivery is abandoned because the route stops.
pub const REJECTED_EXECUTION: &str = "RejectedExecutionException";

#[derive(Debug)]
struct TypeNode {
    name: String,
    parent: Option<ExceptionType>,
}

/// A named failure type with an optional parent.
///
/// Equality and hashing use the type name only, so two handles created independently for the
/// same name compare equal.
#[derive(Clone)]
pub struct ExceptionType(Arc<TypeNode>);

impl ExceptionType {
    /// Root of every hierarchy. Matches any failure.
    pub fn root() -> Self {
        Self(Arc::new(TypeNode { name: ROOT_NAME.to_string(), parent: None }))
    }

    /// A new type directly below the root.
    pub fn new(name: impl Into<String>) -> Self {
        Self::root().subtype(name)
    }

    /// A new type whose parent is `self`.
    pub fn subtype(&self, name: impl Into<String>) -> Self {
        Self(Arc::new(TypeNode { name: name.into(), parent: Some(self.clone()) }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn parent(&self) -> Option<&ExceptionType> {
        self.0.parent.as_ref()
    }

    /// Returns true when `self` equals `ancestor` or descends from it.
    pub fn is_a(&self, ancestor: &ExceptionType) -> bool {
        self.distance_to(ancestor).is_some()
    }

    /// Number of parent hops from `self` up to `ancestor`; `None` when unrelated.
    pub fn distance_to(&self, ancestor: &ExceptionType) -> Option<usize> {
        let mut current = Some(self);
        let mut hops = 0;
        while let Some(node) = current {
            if node == ancestor {
                return Some(hops);
            }
            hops += 1;
            current = node.parent();
        }
        None
    }

    /// Iterate from `self` up to the root.
    pub fn ancestors(&self) -> impl Iterator<Item = &ExceptionType> {
        std::iter::successors(Some(self), |t| t.parent())
    }
}

impl PartialEq for ExceptionType {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.name == other.0.name
    }
}

impl Eq for ExceptionType {}

impl Hash for ExceptionType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.name.hash(state);
    }
}

impl fmt::Debug for ExceptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExceptionType({})", self.0.name)
    }
}

impl fmt::Display for ExceptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

/// A processing failure: a typed message with an optional cause.
#[derive(Debug, Clone)]
pub struct Failure {
    kind: ExceptionType,
    message: String,
    cause: Option<Box<Failure>>,
}

impl Failure {
    pub fn new(kind: ExceptionType, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), cause: None }
    }

    /// Attach the failure that caused this one.
    pub fn with_cause(mut self, cause: Failure) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn kind(&self) -> &ExceptionType {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&Failure> {
        self.cause.as_deref()
    }

    /// Outermost failure first, then each cause in turn.
    pub fn chain(&self) -> impl Iterator<Item = &Failure> {
        std::iter::successors(Some(self), |f| f.cause())
    }

    /// The deepest cause (the failure itself when it has none).
    pub fn root_cause(&self) -> &Failure {
        self.chain().last().unwrap_or(self)
    }

    /// True if this failure or any of its causes is an instance of `kind`.
    pub fn caused_by(&self, kind: &ExceptionType) -> bool {
        self.chain().any(|f| f.kind.is_a(kind))
    }

    /// Failure raised when a scheduled redelivery is abandoned during shutdown.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ExceptionType::new(REJECTED_EXECUTION), message)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &dyn std::error::Error)
    }
}
