//! The endpoint cache: turns instance-set notifications into a stable,
//! lexicographically ordered snapshot of endpoints.
//!
//! Mutation happens on a single writer (the pool's consumer task) through
//! [`EndpointCache::update`]. Readers call [`EndpointCache::endpoints`]
//! concurrently; the steady state only takes a shared lock and clones an `Arc`.
//!
//! Lock order is always `entries` before `published`. `entries` is only
//! contended by the writer and by the rare reader that performs invalidation.

use parking_lot::{Mutex, RwLock};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    endpoint::Endpoint,
    error::{BoxError, PoolError, SharedError},
    instancer::{DiscoveryEvent, Instance},
    metrics::{
        SD_CACHE_INVALIDATIONS, SD_ENDPOINTS_CREATED, SD_ENDPOINTS_RELEASED, SD_EVENTS,
        SD_FACTORY_FAILURES,
    },
};

/// A resource tied to one cached endpoint (a pooled connection, a client handle)
/// that must be released when its instance disappears.
///
/// `release` consumes the resource, so it can run at most once.
pub trait Releasable: Send {
    fn release(self: Box<Self>) -> Result<(), BoxError>;
}

impl<F> Releasable for F
where
    F: FnOnce() -> Result<(), BoxError> + Send,
{
    fn release(self: Box<Self>) -> Result<(), BoxError> {
        (*self)()
    }
}

/// What a [`Factory`] hands back for one instance.
pub type Built<Req, Res> = (Endpoint<Req, Res>, Option<Box<dyn Releasable>>);

/// Converts an instance identifier into an endpoint plus an optional releasable
/// resource. Invoked only for instances not already cached; failures only
/// exclude that one instance.
pub type Factory<Req, Res> = Arc<dyn Fn(&str) -> Result<Built<Req, Res>, BoxError> + Send + Sync>;

/// Error policy of the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// When false, discovery errors are logged and the last good snapshot keeps being served.
    pub invalidate_on_error: bool,
    /// Grace period between the first discovery error and invalidation.
    pub invalidate_timeout: Duration,
}

impl CacheOptions {
    pub fn invalidate_on_error(timeout: Duration) -> Self {
        Self { invalidate_on_error: true, invalidate_timeout: timeout }
    }
}

struct CachedEntry<Req, Res> {
    endpoint: Endpoint<Req, Res>,
    releasable: Option<Box<dyn Releasable>>,
}

impl<Req, Res> CachedEntry<Req, Res> {
    fn release(self, instance: &str) {
        let Some(releasable) = self.releasable else {
            return;
        };
        SD_ENDPOINTS_RELEASED.inc();
        match releasable.release() {
            Ok(()) => debug!(instance = %instance, "Released endpoint resources"),
            Err(e) => {
                warn!(instance = %instance, error = %e, "Failed to release endpoint resources")
            }
        }
    }
}

struct Published<Req, Res> {
    snapshot: Arc<[Endpoint<Req, Res>]>,
    last_error: Option<SharedError>,
    invalidate_deadline: Option<Instant>,
}

impl<Req, Res> Published<Req, Res> {
    /// True while readers may be handed the current snapshot.
    fn is_serving(&self, now: Instant) -> bool {
        match (&self.last_error, self.invalidate_deadline) {
            (None, _) => true,
            (Some(_), Some(deadline)) => now < deadline,
            (Some(_), None) => false,
        }
    }
}

pub struct EndpointCache<Req, Res> {
    options: CacheOptions,
    factory: Factory<Req, Res>,
    entries: Mutex<BTreeMap<Instance, CachedEntry<Req, Res>>>,
    published: RwLock<Published<Req, Res>>,
}

impl<Req, Res> EndpointCache<Req, Res> {
    pub fn new(factory: Factory<Req, Res>, options: CacheOptions) -> Self {
        Self {
            options,
            factory,
            entries: Mutex::new(BTreeMap::new()),
            published: RwLock::new(Published {
                snapshot: Arc::from(Vec::new()),
                last_error: None,
                invalidate_deadline: None,
            }),
        }
    }

    pub fn options(&self) -> CacheOptions {
        self.options
    }

    /// Applies one discovery event. Must not be called concurrently with itself.
    pub fn update(&self, event: DiscoveryEvent) {
        let Some(err) = event.err else {
            SD_EVENTS.with_label_values(&["ok"]).inc();
            let mut entries = self.entries.lock();
            let next = self.rebuild(&mut entries, event.instances);
            let mut published = self.published.write();
            Self::swap(&mut entries, next, &mut published);
            published.last_error = None;
            published.invalidate_deadline = None;
            info!(endpoints = published.snapshot.len(), "Endpoint cache updated");
            return;
        };

        SD_EVENTS.with_label_values(&["error"]).inc();
        warn!(
            error = %err,
            invalidate_on_error = self.options.invalidate_on_error,
            "Service discovery reported an error"
        );
        if !self.options.invalidate_on_error {
            return;
        }

        let mut published = self.published.write();
        if published.last_error.is_some() {
            // The first error's deadline stands until a good event clears it.
            return;
        }
        published.invalidate_deadline = Some(Instant::now() + self.options.invalidate_timeout);
        published.last_error = Some(err);
    }

    /// The current endpoints, ordered by instance.
    ///
    /// Once a recorded discovery error outlives the invalidation timeout, every
    /// cached entry is released and the error is returned until a good event arrives.
    pub fn endpoints(&self) -> Result<Arc<[Endpoint<Req, Res>]>, PoolError> {
        {
            let published = self.published.read();
            if published.is_serving(Instant::now()) {
                return Ok(Arc::clone(&published.snapshot));
            }
        }

        let mut entries = self.entries.lock();
        let mut published = self.published.write();

        // Another reader may have won the race, or a good event may have landed.
        if published.is_serving(Instant::now()) {
            return Ok(Arc::clone(&published.snapshot));
        }

        let Some(err) = published.last_error.clone() else {
            return Ok(Arc::clone(&published.snapshot));
        };
        if !entries.is_empty() || !published.snapshot.is_empty() {
            SD_CACHE_INVALIDATIONS.inc();
            error!(
                error = %err,
                endpoints = published.snapshot.len(),
                "Discovery error outlived invalidation timeout, dropping all endpoints"
            );
            Self::swap(&mut entries, BTreeMap::new(), &mut published);
        }
        Err(PoolError::Discovery(err))
    }

    /// Releases every cached entry and publishes an empty snapshot.
    pub fn release_all(&self) {
        let mut entries = self.entries.lock();
        let mut published = self.published.write();
        let released = entries.len();
        Self::swap(&mut entries, BTreeMap::new(), &mut published);
        info!(released = released, "Released all cached endpoints");
    }

    pub fn len(&self) -> usize {
        self.published.read().snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds the entry map for `instances`, moving surviving entries out of
    /// `current` and calling the factory for new ones. On return `current`
    /// holds only the entries whose instances disappeared.
    fn rebuild(
        &self,
        current: &mut BTreeMap<Instance, CachedEntry<Req, Res>>,
        mut instances: Vec<Instance>,
    ) -> BTreeMap<Instance, CachedEntry<Req, Res>> {
        instances.sort();
        instances.dedup();

        let mut next = BTreeMap::new();
        for instance in instances {
            if let Some(entry) = current.remove(&instance) {
                next.insert(instance, entry);
                continue;
            }
            match (self.factory)(&instance) {
                Ok((endpoint, releasable)) => {
                    SD_ENDPOINTS_CREATED.inc();
                    next.insert(instance, CachedEntry { endpoint, releasable });
                }
                Err(e) => {
                    SD_FACTORY_FAILURES.inc();
                    warn!(
                        instance = %instance,
                        error = %e,
                        "Endpoint factory failed, skipping instance"
                    );
                }
            }
        }
        next
    }

    /// Installs `next`, releases the leftovers, then publishes the new snapshot.
    fn swap(
        entries: &mut BTreeMap<Instance, CachedEntry<Req, Res>>,
        next: BTreeMap<Instance, CachedEntry<Req, Res>>,
        published: &mut Published<Req, Res>,
    ) {
        let leftovers = std::mem::replace(entries, next);
        for (instance, entry) in leftovers {
            entry.release(&instance);
        }
        published.snapshot = entries.values().map(|e| e.endpoint.clone()).collect();
    }
}
