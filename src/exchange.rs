//! The unit of work flowing through a route.
//!
//! An [`Exchange`] carries the current [`Message`], free-form properties, the failure currently
//! being handled and the bookkeeping the error handler writes while it redelivers.

use crate::exception::Failure;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Message headers keyed by name.
pub type Headers = BTreeMap<String, Value>;

/// Body plus headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub body: Value,
    pub headers: Headers,
}

impl Message {
    pub fn new(body: impl Into<Value>) -> Self {
        Self { body: body.into(), headers: Headers::new() }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }
}

/// Failure and redelivery state the error handler maintains on an exchange.
#[derive(Debug, Clone, Default)]
pub struct FailureInfo {
    /// The failure was handled by an exception policy or a dead letter channel.
    pub handled: bool,
    /// The failure was ignored and routing continued.
    pub continued: bool,
    /// The error handler took ownership of the failure (dead letter or policy outputs).
    pub error_handler_handled: bool,
    /// The failure moved off the exchange when it was handled, continued or dead-lettered.
    pub exception_caught: Option<Failure>,
    /// Last endpoint the exchange was sent to when it failed.
    pub failure_endpoint: Option<String>,
    /// Route whose error handler processed the failure.
    pub failure_route_id: Option<String>,
    pub redelivered: bool,
    pub redelivery_counter: u32,
    /// `None` for unlimited redeliveries.
    pub redelivery_max_counter: Option<u32>,
    pub redelivery_exhausted: bool,
}

/// One step recorded in the message history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub route_id: String,
    pub node: String,
    pub at: SystemTime,
}

/// Mutable unit of work passed between processors.
#[derive(Debug, Clone)]
pub struct Exchange {
    id: String,
    route_id: Option<String>,
    message: Message,
    original_message: Option<Message>,
    properties: BTreeMap<String, Value>,
    exception: Option<Failure>,
    failure: FailureInfo,
    to_endpoint: Option<String>,
    history: Vec<HistoryEntry>,
}

impl Exchange {
    pub fn new(message: Message) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            route_id: None,
            message,
            original_message: None,
            properties: BTreeMap::new(),
            exception: None,
            failure: FailureInfo::default(),
            to_endpoint: None,
            history: Vec::new(),
        }
    }

    /// Exchange with a body and no headers.
    pub fn with_body(body: impl Into<Value>) -> Self {
        Self::new(Message::new(body))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    pub fn set_route_id(&mut self, route_id: impl Into<String>) {
        self.route_id = Some(route_id.into());
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    pub fn body(&self) -> &Value {
        &self.message.body
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.message.body = body.into();
    }

    /// Snapshot of the message as it entered the error handler, if one was captured.
    pub fn original_message(&self) -> Option<&Message> {
        self.original_message.as_ref()
    }

    /// Capture the current message as the original; later calls keep the first snapshot.
    pub fn capture_original(&mut self) {
        if self.original_message.is_none() {
            self.original_message = Some(self.message.clone());
        }
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn exception(&self) -> Option<&Failure> {
        self.exception.as_ref()
    }

    pub fn set_exception(&mut self, failure: Failure) {
        self.exception = Some(failure);
    }

    pub fn take_exception(&mut self) -> Option<Failure> {
        self.exception.take()
    }

    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    pub fn failure(&self) -> &FailureInfo {
        &self.failure
    }

    pub fn failure_mut(&mut self) -> &mut FailureInfo {
        &mut self.failure
    }

    /// Endpoint URI the exchange was last sent to.
    pub fn to_endpoint(&self) -> Option<&str> {
        self.to_endpoint.as_deref()
    }

    pub fn set_to_endpoint(&mut self, uri: impl Into<String>) {
        self.to_endpoint = Some(uri.into());
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn record_history(&mut self, route_id: impl Into<String>, node: impl Into<String>) {
        self.history.push(HistoryEntry {
            route_id: route_id.into(),
            node: node.into(),
            at: SystemTime::now(),
        });
    }

    /// Copy for dispatching elsewhere: same message and properties, fresh id, no failure.
    pub fn copy_for_dispatch(&self) -> Self {
        let mut copy = self.clone();
        copy.id = uuid::Uuid::new_v4().to_string();
        copy.exception = None;
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::ExceptionType;
    use serde_json::json;

    #[test]
    fn capture_original_keeps_first_snapshot() {
        let mut exchange = Exchange::with_body(json!("first"));
        exchange.capture_original();
        exchange.set_body(json!("second"));
        exchange.capture_original();

        assert_eq!(exchange.original_message().unwrap().body, json!("first"));
        assert_eq!(exchange.body(), &json!("second"));
    }

    #[test]
    fn copy_for_dispatch_drops_exception_and_renews_id() {
        let mut exchange = Exchange::new(Message::new(json!(1)).with_header("k", "v"));
        exchange.set_exception(Failure::new(ExceptionType::new("Boom"), "x"));
        let copy = exchange.copy_for_dispatch();

        assert_ne!(copy.id(), exchange.id());
        assert!(copy.exception().is_none());
        assert_eq!(copy.message().header("k"), Some(&json!("v")));
    }

    #[test]
    fn history_records_in_order() {
        let mut exchange = Exchange::with_body(json!(null));
        exchange.record_history("r1", "a");
        exchange.record_history("r1", "b");
        let nodes: Vec<_> = exchange.history().iter().map(|h| h.node.as_str()).collect();
        assert_eq!(nodes, vec!["a", "b"]);
    }
}
