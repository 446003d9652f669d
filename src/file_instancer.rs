//! A discovery source backed by a local TOML file.
//!
//! The file lists instances under a single key:
//!
//! ```toml
//! instances = ["10.0.0.1:8080", "10.0.0.2:8080"]
//! ```
//!
//! Every [`FileInstancer::reload`] re-reads the file and publishes the result to
//! registered listeners. A missing or unparseable file is published as a
//! discovery error, so pools keep serving their last good set or invalidate,
//! depending on their policy.

use serde::Deserialize;
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::{validate_and_dedupe_instances, ConfigError},
    error::Message,
    instancer::{DiscoveryEvent, EventSender, InstanceCache, Instancer},
};

#[derive(Debug, Deserialize, Default)]
struct InstancesFile {
    instances: Option<Vec<String>>,
}

/// What a successful reload changed, relative to the previously published set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstanceChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl InstanceChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct FileInstancer {
    path: PathBuf,
    cache: InstanceCache,
}

impl FileInstancer {
    /// Creates the source without reading the file; call [`reload`](Self::reload)
    /// or start a watcher to publish the first set.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), cache: InstanceCache::new() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the file and publishes its instances, or publishes the failure.
    pub fn reload(&self) -> Result<InstanceChanges, ConfigError> {
        let path = self.path.display().to_string();
        let instances = match self.read() {
            Ok(instances) => instances,
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to reload instances");
                self.cache.update(DiscoveryEvent::from_error(Message::new(e.to_string())));
                return Err(e);
            }
        };

        let previous = self.cache.state();
        let before: BTreeSet<&String> = if previous.err.is_none() {
            previous.instances.iter().collect()
        } else {
            BTreeSet::new()
        };
        let after: BTreeSet<&String> = instances.iter().collect();
        let changes = InstanceChanges {
            added: after.difference(&before).map(|s| s.to_string()).collect(),
            removed: before.difference(&after).map(|s| s.to_string()).collect(),
        };

        info!(
            path = %path,
            instances = instances.len(),
            added = changes.added.len(),
            removed = changes.removed.len(),
            "Reloaded instances"
        );
        self.cache.update(DiscoveryEvent::from_instances(instances));
        Ok(changes)
    }

    fn read(&self) -> Result<Vec<String>, ConfigError> {
        let raw = fs::read_to_string(&self.path)
            .map_err(|e| ConfigError::Io { path: self.path.display().to_string(), source: e })?;
        let file: InstancesFile =
            toml::from_str(&raw).map_err(|e| ConfigError::ConfigError(e.to_string()))?;
        Ok(validate_and_dedupe_instances(file.instances.unwrap_or_default()))
    }

    /// Reloads immediately and then every `period` until the returned handle is stopped.
    pub fn spawn_watcher(self: &Arc<Self>, period: Duration) -> WatcherHandle {
        let token = CancellationToken::new();
        let instancer = Arc::clone(self);
        let cancel = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!(path = %instancer.path.display(), "Instance file watcher stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        // Failures are already published to listeners.
                        let _ = instancer.reload();
                    }
                }
            }
        });
        WatcherHandle { token, handle }
    }
}

impl Instancer for FileInstancer {
    fn register(&self, tx: EventSender) {
        self.cache.register(tx);
    }

    fn deregister(&self, tx: &EventSender) {
        self.cache.deregister(tx);
    }

    fn stop(&self) {
        self.cache.stop();
    }
}

/// Controls a running watcher task.
pub struct WatcherHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl WatcherHandle {
    /// Stops the watcher and waits for it to exit.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}
