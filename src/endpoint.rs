//! The callable-operation abstraction everything else in this crate is built on.
//!
//! An [`Endpoint`] is a shared asynchronous function taking an execution
//! [`Context`] and a request. Pools hold collections of them, balancers pick one,
//! and the retry executor wraps a balancer back into a single `Endpoint`, so the
//! layers compose freely with [`Middleware`].

use futures::future::BoxFuture;
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, PoolError};

/// A deadline-bound, cancellable execution scope handed to every endpoint call.
///
/// Derived scopes (`with_timeout`, `with_cancel`) get a child cancellation token:
/// cancelling a parent cancels its children, never the other way round.
#[derive(Clone, Debug, Default)]
pub struct Context {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl Context {
    /// A scope with no deadline that is never cancelled unless asked to.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a scope expiring after `timeout`, or at the parent's deadline if that is sooner.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a scope expiring at `deadline`, or at the parent's deadline if that is sooner.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self { deadline: Some(deadline), token: self.token.child_token() }
    }

    /// Derives a scope that can be cancelled independently of its parent.
    pub fn with_cancel(&self) -> Self {
        Self { deadline: self.deadline, token: self.token.child_token() }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `None` while the scope is live, otherwise the reason it ended.
    pub fn err(&self) -> Option<PoolError> {
        if self.token.is_cancelled() {
            return Some(PoolError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(PoolError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the scope is cancelled or its deadline passes.
    pub async fn done(&self) -> PoolError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => PoolError::Canceled,
                _ = tokio::time::sleep_until(deadline) => PoolError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                PoolError::Canceled
            }
        }
    }

    /// Drives `fut` to completion unless the scope ends first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, PoolError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}

type EndpointFn<Req, Res> =
    dyn Fn(Context, Req) -> BoxFuture<'static, Result<Res, BoxError>> + Send + Sync;

/// A single remote operation, cheap to clone and safe to share between tasks.
///
/// Clones share identity: [`Endpoint::ptr_eq`] tells whether two handles refer
/// to the same underlying operation.
pub struct Endpoint<Req, Res> {
    inner: Arc<EndpointFn<Req, Res>>,
}

impl<Req, Res> Endpoint<Req, Res>
where
    Req: 'static,
    Res: 'static,
{
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, BoxError>> + Send + 'static,
    {
        let inner: Arc<EndpointFn<Req, Res>> =
            Arc::new(move |ctx: Context, req: Req| -> BoxFuture<'static, Result<Res, BoxError>> {
                Box::pin(f(ctx, req))
            });
        Self { inner }
    }
}

impl<Req, Res> Endpoint<Req, Res> {
    pub fn call(&self, ctx: Context, req: Req) -> BoxFuture<'static, Result<Res, BoxError>> {
        (self.inner)(ctx, req)
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl<Req, Res> Clone for Endpoint<Req, Res> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<Req, Res> fmt::Debug for Endpoint<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint").field("ptr", &Arc::as_ptr(&self.inner)).finish()
    }
}

/// An endpoint that does nothing and succeeds with `Res::default()`. Useful in tests.
pub fn nop<Req, Res>() -> Endpoint<Req, Res>
where
    Req: Send + 'static,
    Res: Default + Send + 'static,
{
    Endpoint::new(|_ctx: Context, _req: Req| async { Ok(Res::default()) })
}

/// A chainable behavior modifier for endpoints.
pub type Middleware<Req, Res> = Arc<dyn Fn(Endpoint<Req, Res>) -> Endpoint<Req, Res> + Send + Sync>;

/// Composes middlewares so requests traverse them in declaration order:
/// `outer` is the outermost layer, the last of `others` sits closest to the endpoint.
pub fn chain<Req, Res>(
    outer: Middleware<Req, Res>,
    others: Vec<Middleware<Req, Res>>,
) -> Middleware<Req, Res>
where
    Req: 'static,
    Res: 'static,
{
    Arc::new(move |next: Endpoint<Req, Res>| {
        let next = others.iter().rev().fold(next, |next, mw| mw(next));
        outer(next)
    })
}
