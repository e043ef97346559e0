//! Delegate types and the registry they are collected in.

use crate::context::InvocationContext;
use crate::error::BoxError;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

type HandlerFn =
    dyn for<'a> Fn(&'a mut InvocationContext) -> BoxFuture<'a, Result<(), BoxError>> + Send + Sync;

type DeserializeFn = dyn for<'a> Fn(&'a mut InvocationContext, Bytes) -> BoxFuture<'a, Result<(), BoxError>>
    + Send
    + Sync;

type SerializeFn =
    dyn for<'a> Fn(&'a mut InvocationContext) -> BoxFuture<'a, Result<Bytes, BoxError>> + Send + Sync;

type MiddlewareFn = dyn Fn(InvocationDelegate) -> InvocationDelegate + Send + Sync;

/// A callable step of the invocation chain.
///
/// Cheap to clone; the terminal handler and every composed chain share this type.
#[derive(Clone)]
pub struct InvocationDelegate(Arc<HandlerFn>);

/// The rest of the chain, as seen from inside a middleware.
pub type Next = InvocationDelegate;

impl InvocationDelegate {
    /// Wrap a function taking the context by mutable reference.
    ///
    /// ```rust,no_run
    /// use fezz_hosting::pipeline::InvocationDelegate;
    ///
    /// let handler = InvocationDelegate::new(|ctx| {
    ///     Box::pin(async move {
    ///         ctx.set_response(String::from("ok"));
    ///         Ok(())
    ///     })
    /// });
    /// ```
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut InvocationContext) -> BoxFuture<'a, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        Self(Arc::new(f))
    }

    /// Run this step against the context.
    pub fn call<'a>(&self, ctx: &'a mut InvocationContext) -> BoxFuture<'a, Result<(), BoxError>> {
        (self.0)(ctx)
    }

    /// Whether two delegates are the same callable.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for InvocationDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InvocationDelegate")
    }
}

/// A function from "next handler" to "handler".
#[derive(Clone)]
pub struct Middleware(Arc<MiddlewareFn>);

impl Middleware {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(InvocationDelegate) -> InvocationDelegate + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Build a middleware from an around-style function.
    ///
    /// The function receives the context and the rest of the chain; work done
    /// before `next.call(ctx)` runs on the way in, work after it on the way out.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut InvocationContext, Next) -> BoxFuture<'a, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        let f = Arc::new(f);
        Self::new(move |next: Next| {
            let f = f.clone();
            InvocationDelegate::new(move |ctx| f(ctx, next.clone()))
        })
    }

    /// Wrap `next`.
    pub fn apply(&self, next: InvocationDelegate) -> InvocationDelegate {
        (self.0)(next)
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Middleware")
    }
}

/// Fills the context's event slot from the raw payload.
#[derive(Clone)]
pub struct EventDeserializer(Arc<DeserializeFn>);

impl EventDeserializer {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut InvocationContext, Bytes) -> BoxFuture<'a, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        Self(Arc::new(f))
    }

    /// Deserialize synchronously with a plain function of the payload.
    pub fn from_fn<T, F>(f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&[u8]) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        Self::new(move |ctx, raw| {
            let decoded = f(&raw);
            Box::pin(async move {
                ctx.set_event(decoded?);
                Ok(())
            })
        })
    }

    pub fn deserialize<'a>(
        &self,
        ctx: &'a mut InvocationContext,
        raw: Bytes,
    ) -> BoxFuture<'a, Result<(), BoxError>> {
        (self.0)(ctx, raw)
    }
}

impl fmt::Debug for EventDeserializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventDeserializer")
    }
}

/// Produces the raw output from the context's response slot.
#[derive(Clone)]
pub struct ResponseSerializer(Arc<SerializeFn>);

impl ResponseSerializer {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut InvocationContext) -> BoxFuture<'a, Result<Bytes, BoxError>>
            + Send
            + Sync
            + 'static,
    {
        Self(Arc::new(f))
    }

    /// Serialize synchronously from a typed response.
    ///
    /// A missing response serializes to an empty payload.
    pub fn from_fn<T, F>(f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&T) -> Result<Bytes, BoxError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(move |ctx| {
            let encoded = match ctx.response::<T>() {
                Some(response) => f(response),
                None if ctx.has_response() => Err(format!(
                    "response slot does not hold a {}",
                    std::any::type_name::<T>()
                )
                .into()),
                None => Ok(Bytes::new()),
            };
            Box::pin(async move { encoded })
        })
    }

    pub fn serialize<'a>(&self, ctx: &'a mut InvocationContext) -> BoxFuture<'a, Result<Bytes, BoxError>> {
        (self.0)(ctx)
    }
}

impl fmt::Debug for ResponseSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseSerializer")
    }
}

/// Everything registered for the invocation pipeline.
///
/// Mutable while the application is being configured; the host only reads
/// it after the pipeline is built.
#[derive(Debug, Clone, Default)]
pub struct DelegateRegistry {
    pub(crate) handler: Option<InvocationDelegate>,
    pub(crate) middleware: Vec<Middleware>,
    pub(crate) deserializer: Option<EventDeserializer>,
    pub(crate) serializer: Option<ResponseSerializer>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> Option<&InvocationDelegate> {
        self.handler.as_ref()
    }

    /// Middleware in registration order (outermost first).
    pub fn middleware(&self) -> &[Middleware] {
        &self.middleware
    }

    pub fn deserializer(&self) -> Option<&EventDeserializer> {
        self.deserializer.as_ref()
    }

    pub fn serializer(&self) -> Option<&ResponseSerializer> {
        self.serializer.as_ref()
    }
}
