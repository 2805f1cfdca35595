//! Processors and predicates: the opaque callables routes are built from.

use crate::exception::Failure;
use crate::exchange::Exchange;
use async_trait::async_trait;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A unit of work applied to an exchange. Returning `Err` raises a processing failure.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), Failure>;
}

/// Shared, type-erased processor.
pub type SharedProcessor = Arc<dyn Processor>;

/// Adapter turning a synchronous closure into a [`Processor`].
#[derive(Clone)]
pub struct FnProcessor<F> {
    f: F,
}

/// Wrap a closure as a processor.
///
/// ```rust
/// use routeguard::{processor_fn, Exchange, Processor};
/// use serde_json::json;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let upper = processor_fn(|ex: &mut Exchange| {
///     let text = ex.body().as_str().unwrap_or_default().to_uppercase();
///     ex.set_body(text);
///     Ok(())
/// });
/// let mut exchange = Exchange::with_body(json!("hi"));
/// upper.process(&mut exchange).await.unwrap();
/// assert_eq!(exchange.body(), &json!("HI"));
/// # });
/// ```
pub fn processor_fn<F>(f: F) -> FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), Failure> + Send + Sync,
{
    FnProcessor { f }
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), Failure> + Send + Sync,
{
    async fn process(&self, exchange: &mut Exchange) -> Result<(), Failure> {
        (self.f)(exchange)
    }
}

/// Boolean test evaluated against an exchange.
///
/// Predicates compare and hash by identity: two clones of the same predicate are equal, two
/// predicates built from identical closures are not.
#[derive(Clone)]
pub struct Predicate(Arc<dyn Fn(&Exchange) -> bool + Send + Sync>);

impl Predicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Exchange) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Predicate that always yields `value`.
    pub fn constant(value: bool) -> Self {
        Self::new(move |_| value)
    }

    pub fn matches(&self, exchange: &Exchange) -> bool {
        (self.0)(exchange)
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for Predicate {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.addr(), other.addr())
    }
}

impl Eq for Predicate {}

impl Hash for Predicate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Predicate({:p})", self.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::ExceptionType;
    use serde_json::json;

    #[test]
    fn predicate_identity_equality() {
        let p = Predicate::new(|_| true);
        let q = Predicate::new(|_| true);
        assert_eq!(p, p.clone());
        assert_ne!(p, q);
    }

    #[test]
    fn constant_predicate() {
        let exchange = Exchange::with_body(json!(null));
        assert!(Predicate::constant(true).matches(&exchange));
        assert!(!Predicate::constant(false).matches(&exchange));
    }

    #[tokio::test]
    async fn fn_processor_propagates_failure() {
        let failing =
            processor_fn(|_ex: &mut Exchange| Err(Failure::new(ExceptionType::new("Boom"), "no")));
        let mut exchange = Exchange::with_body(json!(1));
        let err = failing.process(&mut exchange).await.unwrap_err();
        assert_eq!(err.kind().name(), "Boom");
    }
}
