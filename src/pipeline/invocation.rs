//! Invocation pipeline builder.

use super::binding::{into_delegate, InvocationArgs, IntoHandlerResponse, TypedHandler};
use super::delegate::{
    DelegateRegistry, EventDeserializer, InvocationDelegate, Middleware, Next, ResponseSerializer,
};
use crate::context::InvocationContext;
use crate::error::{BoxError, ConfigError};
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Collects the terminal handler, middleware and codec hooks, then folds
/// them into one callable.
///
/// The first registered middleware is the outermost: it runs first on the
/// way in and last on the way out.
#[derive(Debug, Default)]
pub struct InvocationBuilder {
    registry: DelegateRegistry,
}

impl InvocationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware.
    pub fn use_middleware(&mut self, middleware: Middleware) -> &mut Self {
        self.registry.middleware.push(middleware);
        self
    }

    /// Append an around-style middleware function.
    pub fn use_fn<F>(&mut self, f: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut InvocationContext, Next) -> BoxFuture<'a, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        self.use_middleware(Middleware::from_fn(f))
    }

    /// Set the terminal handler. Fails if one is already set.
    pub fn handle(&mut self, handler: InvocationDelegate) -> Result<&mut Self, ConfigError> {
        if self.registry.handler.is_some() {
            return Err(ConfigError::HandlerAlreadySet);
        }
        self.registry.handler = Some(handler);
        Ok(self)
    }

    /// Set a terminal handler whose parameters are bound from the invocation.
    ///
    /// See [`super::binding`] for the parameter types that can be bound.
    pub fn handle_fn<H, Args>(&mut self, handler: H) -> Result<&mut Self, ConfigError>
    where
        H: TypedHandler<Args>,
        Args: InvocationArgs,
        H::Output: IntoHandlerResponse,
    {
        self.handle(into_delegate(handler))
    }

    /// Set the event deserializer hook.
    pub fn deserializer(&mut self, deserializer: EventDeserializer) -> &mut Self {
        self.registry.deserializer = Some(deserializer);
        self
    }

    /// Set the response serializer hook.
    pub fn serializer(&mut self, serializer: ResponseSerializer) -> &mut Self {
        self.registry.serializer = Some(serializer);
        self
    }

    /// JSON hooks: the event slot holds an `E`, the response slot an `R`.
    pub fn use_json<E, R>(&mut self) -> &mut Self
    where
        E: DeserializeOwned + Send + Sync + 'static,
        R: Serialize + Send + Sync + 'static,
    {
        self.deserializer(EventDeserializer::from_fn(|raw: &[u8]| {
            serde_json::from_slice::<E>(raw).map_err(BoxError::from)
        }))
        .serializer(ResponseSerializer::from_fn(|response: &R| {
            serde_json::to_vec(response)
                .map(Bytes::from)
                .map_err(BoxError::from)
        }))
    }

    /// Registered state.
    pub fn registry(&self) -> &DelegateRegistry {
        &self.registry
    }

    /// Fold the middleware around the terminal handler.
    ///
    /// Building again yields an equivalent chain from the same registrations.
    pub fn build(&self) -> Result<InvocationDelegate, ConfigError> {
        let handler = self
            .registry
            .handler
            .clone()
            .ok_or(ConfigError::HandlerNotSet)?;

        let chain = compose(&self.registry.middleware, handler);
        debug!(
            middleware = self.registry.middleware.len(),
            "Invocation pipeline built"
        );
        Ok(chain)
    }
}

/// Wrap `handler` so that `middleware[0]` is outermost.
pub(crate) fn compose(middleware: &[Middleware], handler: InvocationDelegate) -> InvocationDelegate {
    middleware
        .iter()
        .rev()
        .fold(handler, |next, layer| layer.apply(next))
}
