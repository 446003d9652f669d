//! The endpoint pool facade: wires a discovery source to an [`EndpointCache`]
//! through an event queue drained by one background task.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    cache::{CacheOptions, EndpointCache, Factory},
    endpoint::Endpoint,
    error::PoolError,
    instancer::{DiscoveryEvent, EventSender, Instancer},
};

/// Anything that can hand out the current, ordered set of endpoints.
pub trait Endpointer<Req, Res>: Send + Sync {
    fn endpoints(&self) -> Result<Arc<[Endpoint<Req, Res>]>, PoolError>;
}

/// A pool over a pre-built, unchanging set of endpoints.
pub struct FixedEndpointer<Req, Res> {
    endpoints: Arc<[Endpoint<Req, Res>]>,
}

impl<Req, Res> FixedEndpointer<Req, Res> {
    pub fn new(endpoints: Vec<Endpoint<Req, Res>>) -> Self {
        Self { endpoints: endpoints.into() }
    }
}

impl<Req, Res> Endpointer<Req, Res> for FixedEndpointer<Req, Res> {
    fn endpoints(&self) -> Result<Arc<[Endpoint<Req, Res>]>, PoolError> {
        Ok(Arc::clone(&self.endpoints))
    }
}

/// Keeps an [`EndpointCache`] in sync with a discovery source.
///
/// Must be created inside a Tokio runtime. Events are applied strictly in the
/// order the source emitted them.
pub struct EndpointPool<Req, Res> {
    cache: Arc<EndpointCache<Req, Res>>,
    instancer: Arc<dyn Instancer>,
    tx: Mutex<Option<EventSender>>,
    closing: CancellationToken,
    drained: CancellationToken,
}

impl<Req, Res> EndpointPool<Req, Res>
where
    Req: 'static,
    Res: 'static,
{
    pub fn new(
        instancer: Arc<dyn Instancer>,
        factory: Factory<Req, Res>,
        options: CacheOptions,
    ) -> Self {
        let cache = Arc::new(EndpointCache::new(factory, options));
        let (tx, rx) = mpsc::unbounded_channel();
        let closing = CancellationToken::new();
        let drained = CancellationToken::new();

        tokio::spawn(consume(cache.clone(), rx, closing.clone(), drained.clone()));
        instancer.register(tx.clone());
        info!(
            invalidate_on_error = options.invalidate_on_error,
            invalidate_timeout_ms = options.invalidate_timeout.as_millis() as u64,
            "Endpoint pool started"
        );

        Self { cache, instancer, tx: Mutex::new(Some(tx)), closing, drained }
    }
}

impl<Req, Res> EndpointPool<Req, Res> {
    /// Deregisters from the discovery source and stops the consumer task.
    ///
    /// Events already queued are still applied; afterwards every cached entry
    /// is released once. Calling `close` again is a no-op.
    pub fn close(&self) {
        let Some(tx) = self.tx.lock().take() else {
            return;
        };
        self.instancer.deregister(&tx);
        drop(tx);
        self.closing.cancel();
        info!("Endpoint pool closing");
    }

    /// Resolves once a closed pool has drained its queue and released its entries.
    pub async fn closed(&self) {
        self.drained.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

impl<Req, Res> Endpointer<Req, Res> for EndpointPool<Req, Res> {
    fn endpoints(&self) -> Result<Arc<[Endpoint<Req, Res>]>, PoolError> {
        self.cache.endpoints()
    }
}

impl<Req, Res> Drop for EndpointPool<Req, Res> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn consume<Req, Res>(
    cache: Arc<EndpointCache<Req, Res>>,
    mut rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
    closing: CancellationToken,
    drained: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => match event {
                Some(event) => cache.update(event),
                None => break,
            },
            _ = closing.cancelled() => {
                // The source may still hold a sender; apply what is queued and stop.
                rx.close();
                while let Some(event) = rx.recv().await {
                    cache.update(event);
                }
                break;
            }
        }
    }
    debug!("Endpoint pool consumer draining");
    cache.release_all();
    drained.cancel();
    info!("Endpoint pool consumer stopped");
}
