//! Per-invocation state handed through the middleware chain.

use crate::context::LambdaContext;
use crate::services::{ScopeFactory, ServiceScope};
use bytes::Bytes;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

type Slot = Box<dyn Any + Send + Sync>;

/// State of a single invocation.
///
/// Created by the composer at the start of an invocation and closed at its
/// end on every exit path. Nothing in here is shared with other invocations.
pub struct InvocationContext {
    lambda: Arc<LambdaContext>,
    raw_event: Bytes,
    event: Option<Slot>,
    response: Option<Slot>,
    items: HashMap<String, Slot>,
    scope_factory: Arc<dyn ScopeFactory>,
    scope: OnceLock<Arc<dyn ServiceScope>>,
    cancellation: CancellationToken,
}

impl InvocationContext {
    /// Create a context. The event slot starts out holding `raw_event` as
    /// [`Bytes`]; the service scope is not created until first used.
    pub fn new(
        lambda: Arc<LambdaContext>,
        raw_event: Bytes,
        scope_factory: Arc<dyn ScopeFactory>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            lambda,
            event: Some(Box::new(raw_event.clone())),
            raw_event,
            response: None,
            items: HashMap::new(),
            scope_factory,
            scope: OnceLock::new(),
            cancellation,
        }
    }

    /// Platform context.
    pub fn lambda(&self) -> &LambdaContext {
        &self.lambda
    }

    pub(crate) fn lambda_arc(&self) -> Arc<LambdaContext> {
        self.lambda.clone()
    }

    /// Platform request ID.
    pub fn request_id(&self) -> &str {
        &self.lambda.request_id
    }

    /// The payload as received from the platform.
    pub fn raw_event(&self) -> &Bytes {
        &self.raw_event
    }

    /// Token tripped by the invocation deadline or process shutdown.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// The typed event, if the deserializer produced one of type `T`.
    pub fn event<T: Any>(&self) -> Option<&T> {
        self.event.as_ref().and_then(|e| e.downcast_ref::<T>())
    }

    pub fn event_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.event.as_mut().and_then(|e| e.downcast_mut::<T>())
    }

    /// Replace the event slot.
    pub fn set_event<T: Any + Send + Sync>(&mut self, event: T) {
        self.event = Some(Box::new(event));
    }

    /// Move the event out if it is a `T`. A mismatched event stays in place.
    pub fn take_event<T: Any>(&mut self) -> Option<T> {
        take_slot(&mut self.event)
    }

    pub fn has_event(&self) -> bool {
        self.event.is_some()
    }

    /// The typed response, if the handler produced one of type `T`.
    pub fn response<T: Any>(&self) -> Option<&T> {
        self.response.as_ref().and_then(|r| r.downcast_ref::<T>())
    }

    pub fn response_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.response.as_mut().and_then(|r| r.downcast_mut::<T>())
    }

    /// Replace the response slot.
    pub fn set_response<T: Any + Send + Sync>(&mut self, response: T) {
        self.response = Some(Box::new(response));
    }

    /// Move the response out if it is a `T`. A mismatched response stays in place.
    pub fn take_response<T: Any>(&mut self) -> Option<T> {
        take_slot(&mut self.response)
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    /// Store a value for middleware further down (or up) the chain.
    pub fn insert_item<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.items.insert(key.into(), Box::new(value));
    }

    pub fn item<T: Any>(&self, key: &str) -> Option<&T> {
        self.items.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn remove_item(&mut self, key: &str) -> bool {
        self.items.remove(key).is_some()
    }

    /// The invocation's service scope, created on first access.
    pub fn services(&self) -> &dyn ServiceScope {
        self.scope_arc().as_ref()
    }

    pub(crate) fn scope_arc(&self) -> &Arc<dyn ServiceScope> {
        self.scope.get_or_init(|| self.scope_factory.create_scope())
    }

    /// Resolve a service from the invocation scope.
    pub fn service<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.services().get::<T>()
    }

    /// Whether anything has touched the service scope yet.
    pub fn scope_created(&self) -> bool {
        self.scope.get().is_some()
    }

    /// Dispose the scope, if one was created.
    pub(crate) async fn close(&mut self) {
        if let Some(scope) = self.scope.take() {
            scope.dispose().await;
        }
    }
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("request_id", &self.lambda.request_id)
            .field("raw_event_len", &self.raw_event.len())
            .field("has_event", &self.event.is_some())
            .field("has_response", &self.response.is_some())
            .field("items", &self.items.len())
            .field("scope_created", &self.scope_created())
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

fn take_slot<T: Any>(slot: &mut Option<Slot>) -> Option<T> {
    match slot.take() {
        Some(boxed) => match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                *slot = Some(other);
                None
            }
        },
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ServiceCollection;
    use std::time::Duration;

    fn context() -> InvocationContext {
        let mut services = ServiceCollection::new();
        services.add_scoped(|_| String::from("scoped"));
        InvocationContext::new(
            Arc::new(LambdaContext::new("req-1", Duration::from_secs(10))),
            Bytes::from_static(b"raw"),
            Arc::new(services.build()),
            CancellationToken::new(),
        )
    }

    #[test]
    fn event_slot_is_typed() {
        let mut ctx = context();
        assert_eq!(ctx.raw_event().as_ref(), b"raw");
        assert_eq!(ctx.event::<Bytes>().map(|raw| raw.as_ref()), Some(&b"raw"[..]));

        ctx.set_event(42_u32);
        assert_eq!(ctx.event::<u32>(), Some(&42));
        assert_eq!(ctx.event::<String>(), None);

        *ctx.event_mut::<u32>().unwrap() += 1;

        // Wrong type leaves the value in place.
        assert_eq!(ctx.take_event::<String>(), None);
        assert_eq!(ctx.take_event::<u32>(), Some(43));
        assert!(!ctx.has_event());
    }

    #[test]
    fn response_slot_is_typed() {
        let mut ctx = context();
        ctx.set_response(String::from("pong"));
        assert_eq!(ctx.response::<String>().map(String::as_str), Some("pong"));
        assert_eq!(ctx.take_response::<String>().as_deref(), Some("pong"));
        assert!(!ctx.has_response());
    }

    #[test]
    fn items_bag() {
        let mut ctx = context();
        ctx.insert_item("user", String::from("alice"));
        assert_eq!(ctx.item::<String>("user").map(String::as_str), Some("alice"));
        assert_eq!(ctx.item::<u8>("user"), None);
        assert!(ctx.remove_item("user"));
        assert!(!ctx.remove_item("user"));
    }

    #[tokio::test]
    async fn scope_is_created_lazily() {
        let mut ctx = context();
        assert!(!ctx.scope_created());

        let value = ctx.service::<String>().unwrap();
        assert_eq!(value.as_str(), "scoped");
        assert!(ctx.scope_created());

        ctx.close().await;
        assert!(!ctx.scope_created());
    }
}
