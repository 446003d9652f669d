use serde::Deserialize;
use std::{collections::BTreeSet, fs, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    balancer::{build_balancer, Balancer, BalancerKind},
    cache::CacheOptions,
    endpoint::Endpoint,
    file_instancer::{FileInstancer, WatcherHandle},
    instancer::Instance,
    pool::Endpointer,
    retry::{retry, retry_with_callback},
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    pub cache: Option<CacheConfig>,
    pub balancer: Option<BalancerConfig>,
    pub retry: Option<RetryConfig>,
    pub discovery: Option<DiscoveryConfig>,
}

impl Config {
    /// Applies defaults and clamps values to usable ranges.
    /// After this every section is `Some` and every defaulted field is filled in.
    pub fn finalize(mut self) -> Result<Self, ConfigError> {
        let mut cache_cfg = self.cache.take().unwrap_or_default();
        cache_cfg.invalidate_on_error = cache_cfg.invalidate_on_error.or(Some(false));
        cache_cfg.invalidate_timeout_ms =
            cache_cfg.invalidate_timeout_ms.or(Some(DEFAULT_INVALIDATE_TIMEOUT_MS));
        self.cache = Some(cache_cfg);

        let mut balancer_cfg = self.balancer.take().unwrap_or_default();
        balancer_cfg.strategy = balancer_cfg.strategy.or(Some(BalancerKind::default()));
        balancer_cfg.seed = balancer_cfg.seed.or(Some(DEFAULT_SEED));
        self.balancer = Some(balancer_cfg);

        let mut retry_cfg = self.retry.take().unwrap_or_default();
        retry_cfg.max_attempts = retry_cfg.max_attempts.map(|n| n.max(1));
        retry_cfg.timeout_ms =
            Some(retry_cfg.timeout_ms.unwrap_or(DEFAULT_RETRY_TIMEOUT_MS).max(1));
        self.retry = Some(retry_cfg);

        let mut discovery_cfg = self.discovery.take().unwrap_or_default();
        if let Some(path) = discovery_cfg.instances_file.take() {
            let path = path.trim().to_string();
            if path.is_empty() {
                return Err(ConfigError::ConfigError(
                    "discovery.instances_file is empty".to_string(),
                ));
            }
            discovery_cfg.instances_file = Some(path);
        }
        discovery_cfg.poll_interval_secs =
            Some(discovery_cfg.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS).max(1));
        self.discovery = Some(discovery_cfg);

        Ok(self)
    }

    pub fn cache_options(&self) -> CacheOptions {
        self.cache.clone().unwrap_or_default().options()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CacheConfig {
    pub invalidate_on_error: Option<bool>,
    pub invalidate_timeout_ms: Option<u64>,
}

impl CacheConfig {
    pub fn options(&self) -> CacheOptions {
        CacheOptions {
            invalidate_on_error: self.invalidate_on_error.unwrap_or(false),
            invalidate_timeout: Duration::from_millis(
                self.invalidate_timeout_ms.unwrap_or(DEFAULT_INVALIDATE_TIMEOUT_MS),
            ),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BalancerConfig {
    pub strategy: Option<BalancerKind>,
    pub seed: Option<u64>,
}

impl BalancerConfig {
    /// Builds the configured strategy over `endpointer`.
    pub fn build<Req, Res>(
        &self,
        endpointer: Arc<dyn Endpointer<Req, Res>>,
    ) -> Arc<dyn Balancer<Req, Res>>
    where
        Req: 'static,
        Res: 'static,
    {
        let kind = self.strategy.unwrap_or_default();
        let seed = self.seed.unwrap_or(DEFAULT_SEED);
        info!(strategy = %kind, seed = seed, "Building balancer");
        build_balancer(kind, seed, endpointer)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RetryConfig {
    /// Unset selects the callback variant that keeps trying until the timeout.
    pub max_attempts: Option<usize>,
    pub timeout_ms: Option<u64>,
}

impl RetryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_RETRY_TIMEOUT_MS).max(1))
    }

    /// Wraps `balancer` into a retrying endpoint as configured.
    pub fn wrap<Req, Res>(&self, balancer: Arc<dyn Balancer<Req, Res>>) -> Endpoint<Req, Res>
    where
        Req: Clone + Send + 'static,
        Res: Send + 'static,
    {
        match self.max_attempts {
            Some(max) => retry(max.max(1), self.timeout(), balancer),
            None => retry_with_callback(self.timeout(), balancer, None),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DiscoveryConfig {
    pub instances_file: Option<String>,
    pub poll_interval_secs: Option<u64>,
}

impl DiscoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS).max(1))
    }

    /// Starts a file-backed discovery source polling `instances_file`.
    ///
    /// Returns `None` when no file is configured. Must be called inside a Tokio runtime.
    pub fn spawn(&self) -> Option<(Arc<FileInstancer>, WatcherHandle)> {
        let path = self.instances_file.as_deref()?;
        let instancer = Arc::new(FileInstancer::new(path));
        let watcher = instancer.spawn_watcher(self.poll_interval());
        info!(
            path = %path,
            poll_interval_secs = self.poll_interval().as_secs(),
            "Instance file watcher started"
        );
        Some((instancer, watcher))
    }
}

pub const DEFAULT_INVALIDATE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SEED: u64 = 0;
pub const DEFAULT_RETRY_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

pub fn try_load_config(path: &str) -> Result<Option<Config>, ConfigError> {
    match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<Config>(&raw) {
            Ok(cfg) => {
                info!(path = %path, "Loaded config");
                Ok(Some(cfg))
            }
            Err(e) => {
                error!(path = %path, error = %e, "Failed to parse config");
                Err(ConfigError::ConfigError(e.to_string()))
            }
        },
        Err(e) => {
            if e.kind() == std::io::ErrorKind::NotFound {
                info!(path = %path, "No config file found, using defaults");
                Ok(None)
            } else {
                Err(ConfigError::Io { path: path.to_string(), source: e })
            }
        }
    }
}

/// Cleans a raw instance list: trims entries, drops empty, over-long and
/// malformed ones, de-duplicates and sorts what is left.
pub fn validate_and_dedupe_instances(instances: Vec<String>) -> Vec<Instance> {
    const MAX_INSTANCE_LEN: usize = 2048;

    let mut seen = BTreeSet::new();
    for raw in instances {
        let instance = raw.trim();
        if instance.is_empty() {
            warn!("Skipping empty instance");
            continue;
        }
        if instance.len() > MAX_INSTANCE_LEN {
            warn!(instance = %instance, "Skipping instance exceeding max length");
            continue;
        }
        if instance.chars().any(|c| c.is_control() || c.is_whitespace()) {
            warn!(instance = %instance, "Skipping instance with invalid characters");
            continue;
        }
        seen.insert(instance.to_string());
    }
    seen.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        endpoint::Context,
        error::{Message, RetryError},
        instancer::Instancer,
        pool::FixedEndpointer,
        strategy::RoundRobin,
    };
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};
    use tokio::sync::mpsc;

    fn load(toml: &str) -> Config {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", toml).unwrap();
        let path = file.path().to_str().unwrap();
        try_load_config(path).unwrap().unwrap()
    }

    #[test]
    fn test_try_load_config_valid_file() {
        let cfg = load(
            r#"
            [cache]
            invalidate_on_error = true
            invalidate_timeout_ms = 250

            [balancer]
            strategy = "random"
            seed = 42

            [retry]
            max_attempts = 5
            timeout_ms = 300

            [discovery]
            instances_file = "instances.toml"
            poll_interval_secs = 2
            "#,
        );
        let cache = cfg.cache.clone().unwrap();
        assert_eq!(cache.invalidate_on_error, Some(true));
        assert_eq!(cache.invalidate_timeout_ms, Some(250));
        let balancer = cfg.balancer.clone().unwrap();
        assert_eq!(balancer.strategy, Some(BalancerKind::Random));
        assert_eq!(balancer.seed, Some(42));
        assert_eq!(cfg.retry.clone().unwrap().max_attempts, Some(5));
        let discovery = cfg.discovery.clone().unwrap();
        assert_eq!(discovery.instances_file.as_deref(), Some("instances.toml"));
        assert_eq!(
            cfg.cache_options(),
            CacheOptions::invalidate_on_error(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_try_load_config_file_not_found() {
        let result = try_load_config("nonexistent.toml").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_try_load_config_invalid_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[cache]\ninvalidate_on_error = \"yes\"").unwrap();
        let path = file.path().to_str().unwrap();
        assert!(matches!(try_load_config(path), Err(ConfigError::ConfigError(_))));
    }

    #[test]
    fn test_try_load_empty_file() {
        let cfg = load("");
        assert!(cfg.cache.is_none());
        assert!(cfg.balancer.is_none());
        assert!(cfg.retry.is_none());
        assert!(cfg.discovery.is_none());
    }

    #[test]
    fn test_finalize_applies_defaults() {
        let cfg = Config::default().finalize().unwrap();
        assert_eq!(cfg.cache_options(), CacheOptions {
            invalidate_on_error: false,
            invalidate_timeout: Duration::from_millis(DEFAULT_INVALIDATE_TIMEOUT_MS),
        });
        let balancer = cfg.balancer.unwrap();
        assert_eq!(balancer.strategy, Some(BalancerKind::RoundRobin));
        assert_eq!(balancer.seed, Some(DEFAULT_SEED));
        let retry = cfg.retry.unwrap();
        assert!(retry.max_attempts.is_none());
        assert_eq!(retry.timeout(), Duration::from_millis(DEFAULT_RETRY_TIMEOUT_MS));
        let discovery = cfg.discovery.unwrap();
        assert!(discovery.instances_file.is_none());
        assert_eq!(discovery.poll_interval(), Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS));
    }

    #[test]
    fn test_finalize_clamps_values() {
        let cfg = Config {
            retry: Some(RetryConfig { max_attempts: Some(0), timeout_ms: Some(0) }),
            discovery: Some(DiscoveryConfig { instances_file: None, poll_interval_secs: Some(0) }),
            ..Default::default()
        }
        .finalize()
        .unwrap();
        let retry = cfg.retry.unwrap();
        assert_eq!(retry.max_attempts, Some(1));
        assert_eq!(retry.timeout_ms, Some(1));
        assert_eq!(cfg.discovery.unwrap().poll_interval_secs, Some(1));
    }

    #[test]
    fn test_finalize_rejects_blank_instances_file() {
        let cfg = Config {
            discovery: Some(DiscoveryConfig {
                instances_file: Some("  ".into()),
                poll_interval_secs: None,
            }),
            ..Default::default()
        };
        assert!(matches!(cfg.finalize(), Err(ConfigError::ConfigError(_))));
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[balancer]\nstrategy = \"least_loaded\"").unwrap();
        assert!(try_load_config(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_validate_and_dedupe_instances() {
        let instances = vec![
            " 10.0.0.2:80 ".to_string(),
            "10.0.0.1:80".to_string(),
            "10.0.0.2:80".to_string(),
            "".to_string(),
            "bad host:80".to_string(),
            "ctl\x07:80".to_string(),
            format!("{}:80", "a".repeat(2048)),
        ];
        assert_eq!(validate_and_dedupe_instances(instances), vec!["10.0.0.1:80", "10.0.0.2:80"]);
    }

    #[tokio::test]
    async fn test_retry_config_wraps_balancer() {
        let failing =
            Endpoint::new(|_ctx: Context, _req: ()| async { Err(Message::new("down").into()) });
        let endpointer: Arc<dyn Endpointer<(), ()>> = Arc::new(FixedEndpointer::new(vec![failing]));
        let balancer: Arc<dyn Balancer<(), ()>> = Arc::new(RoundRobin::new(endpointer));

        let cfg = RetryConfig { max_attempts: Some(4), timeout_ms: Some(1_000) };
        let err = cfg.wrap(balancer).call(Context::background(), ()).await.unwrap_err();
        assert_eq!(err.downcast_ref::<RetryError>().unwrap().attempts.len(), 4);
    }

    #[tokio::test]
    async fn test_balancer_config_builds_round_robin_by_default() {
        let first = Endpoint::new(|_ctx: Context, _req: ()| async { Ok(1u32) });
        let second = Endpoint::new(|_ctx: Context, _req: ()| async { Ok(2u32) });
        let endpointer: Arc<dyn Endpointer<(), u32>> =
            Arc::new(FixedEndpointer::new(vec![first, second]));

        let balancer = BalancerConfig::default().build(endpointer);
        let mut picks = Vec::new();
        for _ in 0..4 {
            let endpoint = balancer.endpoint().unwrap();
            picks.push(endpoint.call(Context::background(), ()).await.unwrap());
        }
        // The starting index is unspecified; the picks must alternate.
        assert_ne!(picks[0], picks[1]);
        assert_eq!(picks[0], picks[2]);
        assert_eq!(picks[1], picks[3]);
    }

    #[test]
    fn test_balancer_config_seeded_random_is_repeatable() {
        let endpoints: Vec<Endpoint<(), ()>> = (0..8)
            .map(|_| Endpoint::new(|_ctx: Context, _req: ()| async { Ok(()) }))
            .collect();
        let endpointer: Arc<dyn Endpointer<(), ()>> = Arc::new(FixedEndpointer::new(endpoints));
        let cfg = BalancerConfig { strategy: Some(BalancerKind::Random), seed: Some(9) };

        let a = cfg.build(endpointer.clone());
        let b = cfg.build(endpointer);
        for _ in 0..32 {
            assert!(Endpoint::ptr_eq(&a.endpoint().unwrap(), &b.endpoint().unwrap()));
        }
    }

    #[tokio::test]
    async fn test_discovery_config_spawns_file_watcher() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("instances.toml");
        fs::write(&path, r#"instances = ["b:80", "a:80"]"#).unwrap();
        let cfg = DiscoveryConfig {
            instances_file: Some(path.display().to_string()),
            poll_interval_secs: Some(1),
        };

        let (instancer, watcher) = cfg.spawn().unwrap();
        assert_eq!(instancer.path(), path.as_path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        instancer.register(tx);
        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if !event.instances.is_empty() {
                    return event;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.instances, vec!["a:80", "b:80"]);

        watcher.stop().await;
    }

    #[test]
    fn test_discovery_config_without_file_spawns_nothing() {
        assert!(DiscoveryConfig::default().spawn().is_none());
    }
}
