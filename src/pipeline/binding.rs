//! Parameter binding for typed handlers.
//!
//! A typed handler is a plain async function whose parameters are resolved
//! from the unit of work it runs in. The table of what can be bound is
//! explicit: one trait impl per capability.
//!
//! | Parameter type        | Invocation handler          | Init / shutdown handler |
//! |-----------------------|-----------------------------|-------------------------|
//! | [`Event<T>`]          | event slot, moved out       | -                       |
//! | [`Service<T>`]        | invocation scope            | phase handler scope     |
//! | [`CancellationToken`] | invocation token            | phase token             |
//! | [`LambdaContext`]     | platform context            | -                       |
//!
//! The binding for each handler is fixed when it is registered; nothing is
//! looked up by name at call time.

use super::delegate::InvocationDelegate;
use super::lifecycle::PhaseHandler;
use crate::context::{InvocationContext, LambdaContext};
use crate::error::{BoxError, HostingError};
use crate::services::ServiceScope;
use futures::future::BoxFuture;
use std::any::type_name;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The deserialized event of type `T`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<T>(pub T);

/// A service resolved from the current scope.
#[derive(Debug)]
pub struct Service<T>(pub Arc<T>);

impl<T> Clone for Service<T> {
    fn clone(&self) -> Self {
        Service(self.0.clone())
    }
}

impl<T> Deref for Service<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// A parameter that can be bound from an invocation.
pub trait FromInvocation: Sized + Send + 'static {
    fn from_invocation(ctx: &mut InvocationContext) -> Result<Self, HostingError>;
}

/// A parameter that can be bound for a lifecycle phase handler.
pub trait FromScope: Sized + Send + 'static {
    fn from_scope(scope: &dyn ServiceScope, token: &CancellationToken) -> Result<Self, HostingError>;
}

impl<T: Send + Sync + 'static> FromInvocation for Event<T> {
    fn from_invocation(ctx: &mut InvocationContext) -> Result<Self, HostingError> {
        ctx.take_event::<T>().map(Event).ok_or_else(|| {
            HostingError::Binding(format!(
                "no event of type {} in the invocation context",
                type_name::<T>()
            ))
        })
    }
}

impl<T: Send + Sync + 'static> FromInvocation for Service<T> {
    fn from_invocation(ctx: &mut InvocationContext) -> Result<Self, HostingError> {
        ctx.services().require::<T>().map(Service)
    }
}

impl<T: Send + Sync + 'static> FromScope for Service<T> {
    fn from_scope(scope: &dyn ServiceScope, _token: &CancellationToken) -> Result<Self, HostingError> {
        scope.require::<T>().map(Service)
    }
}

impl FromInvocation for CancellationToken {
    fn from_invocation(ctx: &mut InvocationContext) -> Result<Self, HostingError> {
        Ok(ctx.cancellation().clone())
    }
}

impl FromScope for CancellationToken {
    fn from_scope(_scope: &dyn ServiceScope, token: &CancellationToken) -> Result<Self, HostingError> {
        Ok(token.clone())
    }
}

impl FromInvocation for LambdaContext {
    fn from_invocation(ctx: &mut InvocationContext) -> Result<Self, HostingError> {
        Ok(ctx.lambda().clone())
    }
}

/// A tuple of parameters bound from an invocation.
pub trait InvocationArgs: Sized + Send + 'static {
    fn bind(ctx: &mut InvocationContext) -> Result<Self, HostingError>;
}

/// A tuple of parameters bound for a lifecycle phase handler.
pub trait ScopeArgs: Sized + Send + 'static {
    fn bind(scope: &dyn ServiceScope, token: &CancellationToken) -> Result<Self, HostingError>;
}

/// An async function of `Args`.
pub trait TypedHandler<Args>: Clone + Send + Sync + 'static {
    type Output: Send + 'static;

    fn invoke(&self, args: Args) -> BoxFuture<'static, Self::Output>;
}

macro_rules! impl_binding {
    ($($ty:ident),*) => {
        #[allow(non_snake_case, unused_variables)]
        impl<$($ty: FromInvocation,)*> InvocationArgs for ($($ty,)*) {
            fn bind(ctx: &mut InvocationContext) -> Result<Self, HostingError> {
                Ok(($($ty::from_invocation(ctx)?,)*))
            }
        }

        #[allow(non_snake_case, unused_variables)]
        impl<$($ty: FromScope,)*> ScopeArgs for ($($ty,)*) {
            fn bind(scope: &dyn ServiceScope, token: &CancellationToken) -> Result<Self, HostingError> {
                Ok(($($ty::from_scope(scope, token)?,)*))
            }
        }

        #[allow(non_snake_case)]
        impl<F, Fut, $($ty,)*> TypedHandler<($($ty,)*)> for F
        where
            F: Fn($($ty),*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future + Send + 'static,
            Fut::Output: Send + 'static,
        {
            type Output = Fut::Output;

            fn invoke(&self, ($($ty,)*): ($($ty,)*)) -> BoxFuture<'static, Self::Output> {
                Box::pin((self)($($ty),*))
            }
        }
    };
}

impl_binding!();
impl_binding!(A1);
impl_binding!(A1, A2);
impl_binding!(A1, A2, A3);
impl_binding!(A1, A2, A3, A4);
impl_binding!(A1, A2, A3, A4, A5);
impl_binding!(A1, A2, A3, A4, A5, A6);

/// What a typed invocation handler returns.
///
/// `Ok(value)` is written to the response slot.
pub trait IntoHandlerResponse: Send + 'static {
    fn into_response(self, ctx: &mut InvocationContext) -> Result<(), BoxError>;
}

impl<R, E> IntoHandlerResponse for Result<R, E>
where
    R: Send + Sync + 'static,
    E: Into<BoxError> + Send + 'static,
{
    fn into_response(self, ctx: &mut InvocationContext) -> Result<(), BoxError> {
        let response = self.map_err(Into::into)?;
        ctx.set_response(response);
        Ok(())
    }
}

/// What a typed init handler returns: `false` halts startup.
pub trait IntoInitOutcome: Send + 'static {
    fn into_outcome(self) -> Result<bool, BoxError>;
}

impl<E: Into<BoxError> + Send + 'static> IntoInitOutcome for Result<bool, E> {
    fn into_outcome(self) -> Result<bool, BoxError> {
        self.map_err(Into::into)
    }
}

impl<E: Into<BoxError> + Send + 'static> IntoInitOutcome for Result<(), E> {
    fn into_outcome(self) -> Result<bool, BoxError> {
        self.map(|()| true).map_err(Into::into)
    }
}

/// What a typed shutdown handler returns.
pub trait IntoShutdownOutcome: Send + 'static {
    fn into_outcome(self) -> Result<(), BoxError>;
}

impl<E: Into<BoxError> + Send + 'static> IntoShutdownOutcome for Result<(), E> {
    fn into_outcome(self) -> Result<(), BoxError> {
        self.map_err(Into::into)
    }
}

pub(crate) fn into_delegate<H, Args>(handler: H) -> InvocationDelegate
where
    H: TypedHandler<Args>,
    Args: InvocationArgs,
    H::Output: IntoHandlerResponse,
{
    InvocationDelegate::new(move |ctx| {
        let handler = handler.clone();
        Box::pin(async move {
            let args = Args::bind(ctx)?;
            handler.invoke(args).await.into_response(ctx)
        })
    })
}

pub(crate) fn into_init_handler<H, Args>(handler: H) -> PhaseHandler<bool>
where
    H: TypedHandler<Args>,
    Args: ScopeArgs,
    H::Output: IntoInitOutcome,
{
    PhaseHandler::new(move |scope, token| {
        let handler = handler.clone();
        Box::pin(async move {
            let args = Args::bind(scope.as_ref(), &token)?;
            handler.invoke(args).await.into_outcome()
        })
    })
}

pub(crate) fn into_shutdown_handler<H, Args>(handler: H) -> PhaseHandler<()>
where
    H: TypedHandler<Args>,
    Args: ScopeArgs,
    H::Output: IntoShutdownOutcome,
{
    PhaseHandler::new(move |scope, token| {
        let handler = handler.clone();
        Box::pin(async move {
            let args = Args::bind(scope.as_ref(), &token)?;
            handler.invoke(args).await.into_outcome()
        })
    })
}
