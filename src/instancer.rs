//! Discovery-source contracts.
//!
//! A discovery source ([`Instancer`]) reports the live set of backend instances
//! as [`DiscoveryEvent`]s. Listeners register an event queue (an unbounded
//! `mpsc` sender) and receive every subsequent change. [`InstanceCache`] is the
//! reusable listener registry concrete sources publish through.

use parking_lot::Mutex;
use std::{error::Error as StdError, sync::Arc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::SharedError;

/// Opaque identifier for one discovered backend, e.g. `"10.0.0.7:8080"`.
pub type Instance = String;

/// The sending half of a listener's event queue.
pub type EventSender = mpsc::UnboundedSender<DiscoveryEvent>;

/// One notification from a discovery source.
///
/// If `err` is set it takes precedence over `instances` for policy purposes.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryEvent {
    pub instances: Vec<Instance>,
    pub err: Option<SharedError>,
}

impl DiscoveryEvent {
    pub fn from_instances<I, S>(instances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Instance>,
    {
        Self { instances: instances.into_iter().map(Into::into).collect(), err: None }
    }

    pub fn from_error<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self { instances: Vec::new(), err: Some(Arc::new(err)) }
    }

    fn same_as(&self, other: &DiscoveryEvent) -> bool {
        if self.instances != other.instances {
            return false;
        }
        match (&self.err, &other.err) {
            (None, None) => true,
            (Some(a), Some(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}

/// A source of instance-set notifications that many listeners can subscribe to.
pub trait Instancer: Send + Sync {
    /// Adds `tx` to the listener set. Sources are expected to deliver their
    /// current state to the new listener right away.
    fn register(&self, tx: EventSender);
    /// Removes the listener whose queue is `tx`.
    fn deregister(&self, tx: &EventSender);
    /// Shuts the source down and drops every listener.
    fn stop(&self);
}

#[derive(Default)]
struct Registry {
    state: DiscoveryEvent,
    listeners: Vec<EventSender>,
}

/// Keeps the latest discovery state and fans it out to registered listeners.
#[derive(Default)]
pub struct InstanceCache {
    inner: Mutex<Registry>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `event` as the current state and broadcasts it.
    ///
    /// Instances are sorted first; an event identical to the current state is
    /// dropped. Listeners whose queue has been closed are pruned.
    pub fn update(&self, mut event: DiscoveryEvent) {
        event.instances.sort();

        let mut registry = self.inner.lock();
        if registry.state.same_as(&event) {
            debug!(
                instances = event.instances.len(),
                "Discovery state unchanged, not broadcasting"
            );
            return;
        }
        registry.state = event.clone();
        registry.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// The most recently recorded discovery state.
    pub fn state(&self) -> DiscoveryEvent {
        self.inner.lock().state.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

impl Instancer for InstanceCache {
    fn register(&self, tx: EventSender) {
        let mut registry = self.inner.lock();
        if tx.send(registry.state.clone()).is_ok() {
            registry.listeners.push(tx);
        }
    }

    fn deregister(&self, tx: &EventSender) {
        self.inner.lock().listeners.retain(|l| !l.same_channel(tx));
    }

    fn stop(&self) {
        self.inner.lock().listeners.clear();
    }
}

/// A discovery source with a fixed instance set, for tests and static setups.
#[derive(Debug, Clone, Default)]
pub struct FixedInstancer {
    instances: Vec<Instance>,
}

impl FixedInstancer {
    pub fn new<I, S>(instances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Instance>,
    {
        Self { instances: instances.into_iter().map(Into::into).collect() }
    }
}

impl Instancer for FixedInstancer {
    fn register(&self, tx: EventSender) {
        let _ = tx.send(DiscoveryEvent::from_instances(self.instances.clone()));
    }

    fn deregister(&self, _tx: &EventSender) {}

    fn stop(&self) {}
}
