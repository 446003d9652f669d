//! The selection contract shared by all strategies, and a builder that picks
//! a strategy from configuration.

use serde::Deserialize;
use std::{fmt, sync::Arc};

use crate::{
    endpoint::Endpoint,
    error::PoolError,
    pool::Endpointer,
    strategy::{Random, RoundRobin},
};

/// Picks exactly one endpoint from the current pool per call.
///
/// Implementations re-read the pool on every call and return
/// [`PoolError::NoEndpoints`] when it is empty. Pool errors are passed through.
pub trait Balancer<Req, Res>: Send + Sync {
    fn endpoint(&self) -> Result<Endpoint<Req, Res>, PoolError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    #[default]
    RoundRobin,
    Random,
}

impl fmt::Display for BalancerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancerKind::RoundRobin => write!(f, "round_robin"),
            BalancerKind::Random => write!(f, "random"),
        }
    }
}

/// Builds the balancer named by `kind` over `endpointer`.
///
/// `seed` only matters for [`BalancerKind::Random`].
pub fn build_balancer<Req, Res>(
    kind: BalancerKind,
    seed: u64,
    endpointer: Arc<dyn Endpointer<Req, Res>>,
) -> Arc<dyn Balancer<Req, Res>>
where
    Req: 'static,
    Res: 'static,
{
    match kind {
        BalancerKind::RoundRobin => Arc::new(RoundRobin::new(endpointer)),
        BalancerKind::Random => Arc::new(Random::new(endpointer, seed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{endpoint::nop, pool::FixedEndpointer};

    #[derive(Deserialize)]
    struct Wrapper {
        strategy: BalancerKind,
    }

    #[test]
    fn test_kind_parses_snake_case() {
        let w: Wrapper = toml::from_str(r#"strategy = "random""#).unwrap();
        assert_eq!(w.strategy, BalancerKind::Random);
        let w: Wrapper = toml::from_str(r#"strategy = "round_robin""#).unwrap();
        assert_eq!(w.strategy, BalancerKind::RoundRobin);
        assert!(toml::from_str::<Wrapper>(r#"strategy = "weighted""#).is_err());
    }

    #[test]
    fn test_build_balancer_selects_from_pool() {
        let endpointer: Arc<dyn Endpointer<(), ()>> =
            Arc::new(FixedEndpointer::new(vec![nop(), nop()]));
        for kind in [BalancerKind::RoundRobin, BalancerKind::Random] {
            let balancer = build_balancer(kind, 7, endpointer.clone());
            assert!(balancer.endpoint().is_ok(), "{kind} failed to select");
        }
    }
}
