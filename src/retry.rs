//! Retrying endpoints: wrap a [`Balancer`] into a single [`Endpoint`] that keeps
//! picking and calling pool members until one succeeds, the budget runs out,
//! or the shared deadline passes.

use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{
    balancer::Balancer,
    endpoint::{Context, Endpoint},
    error::{BoxError, RetryError, SharedError},
    metrics::{LB_RETRY_ATTEMPTS, LB_RETRY_DEADLINE_EXCEEDED, LB_RETRY_EXHAUSTED},
};

/// Decides after each failed attempt whether to keep going.
///
/// Receives the 1-based attempt index and that attempt's error. Returning
/// `false` stops the loop; a `Some` error then replaces the final error.
pub type Callback = Arc<dyn Fn(usize, &SharedError) -> (bool, Option<BoxError>) + Send + Sync>;

/// Retries up to `max_attempts` times within `timeout`.
pub fn retry<Req, Res>(
    max_attempts: usize,
    timeout: Duration,
    balancer: Arc<dyn Balancer<Req, Res>>,
) -> Endpoint<Req, Res>
where
    Req: Clone + Send + 'static,
    Res: Send + 'static,
{
    let callback: Callback =
        Arc::new(move |attempt: usize, _err: &SharedError| -> (bool, Option<BoxError>) {
            (attempt < max_attempts, None)
        });
    retry_with_callback(timeout, balancer, Some(callback))
}

/// Retries within `timeout` for as long as `callback` allows. `None` always continues.
///
/// The deadline is derived once per call and shared by every attempt. When it
/// passes, the context error is returned as-is instead of a [`RetryError`].
pub fn retry_with_callback<Req, Res>(
    timeout: Duration,
    balancer: Arc<dyn Balancer<Req, Res>>,
    callback: Option<Callback>,
) -> Endpoint<Req, Res>
where
    Req: Clone + Send + 'static,
    Res: Send + 'static,
{
    Endpoint::new(move |ctx: Context, req: Req| {
        run(ctx.with_timeout(timeout), balancer.clone(), callback.clone(), req)
    })
}

async fn run<Req, Res>(
    ctx: Context,
    balancer: Arc<dyn Balancer<Req, Res>>,
    callback: Option<Callback>,
    req: Req,
) -> Result<Res, BoxError>
where
    Req: Clone,
{
    let mut attempts: Vec<SharedError> = Vec::new();
    let mut attempt = 0;
    loop {
        if let Some(err) = ctx.err() {
            LB_RETRY_DEADLINE_EXCEEDED.inc();
            debug!(attempts = attempts.len(), error = %err, "Retry deadline reached");
            return Err(err.into());
        }
        attempt += 1;
        LB_RETRY_ATTEMPTS.inc();

        let outcome = tokio::select! {
            biased;
            err = ctx.done() => {
                LB_RETRY_DEADLINE_EXCEEDED.inc();
                debug!(attempt = attempt, error = %err, "Attempt aborted by deadline");
                return Err(err.into());
            }
            res = call_once(balancer.as_ref(), ctx.clone(), req.clone()) => res,
        };

        let err: SharedError = match outcome {
            Ok(res) => return Ok(res),
            Err(e) => Arc::from(e),
        };
        debug!(attempt = attempt, error = %err, "Attempt failed");
        attempts.push(err.clone());

        let (keep_going, replacement) = match &callback {
            Some(cb) => cb(attempt, &err),
            None => (true, None),
        };
        if !keep_going {
            LB_RETRY_EXHAUSTED.inc();
            let final_error = replacement.map(SharedError::from).unwrap_or(err);
            warn!(attempts = attempt, error = %final_error, "Giving up after failed attempts");
            return Err(Box::new(RetryError { final_error, attempts }));
        }
        // A failed attempt may have completed without suspending (an empty
        // pool never does); let the pool's consumer and other tasks run.
        tokio::task::yield_now().await;
    }
}

/// Selects one endpoint and calls it. An empty pool fails the attempt like any other error.
async fn call_once<Req, Res>(
    balancer: &dyn Balancer<Req, Res>,
    ctx: Context,
    req: Req,
) -> Result<Res, BoxError> {
    let endpoint = balancer.endpoint()?;
    endpoint.call(ctx, req).await
}
