//! Client-side service discovery and load balancing.
//!
//! A discovery source ([`Instancer`]) reports which backend instances are live.
//! An [`EndpointPool`] turns those reports into an ordered, stable set of
//! [`Endpoint`]s through a [`Factory`], a [`Balancer`] picks one per call, and
//! [`retry`] wraps the balancer back into a single endpoint that retries across
//! the pool within a time budget.

pub mod balancer;
pub mod cache;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod file_instancer;
pub mod instancer;
pub mod pool;
pub mod retry;
pub mod strategy;
pub mod utils;
pub use utils::metrics;

pub use balancer::{build_balancer, Balancer, BalancerKind};
pub use cache::{CacheOptions, EndpointCache, Factory, Releasable};
pub use endpoint::{chain, nop, Context, Endpoint, Middleware};
pub use error::{BoxError, PoolError, RetryError, SharedError};
pub use instancer::{DiscoveryEvent, FixedInstancer, Instance, InstanceCache, Instancer};
pub use pool::{EndpointPool, Endpointer, FixedEndpointer};
pub use retry::{retry, retry_with_callback, Callback};
pub use strategy::{Random, RoundRobin};
