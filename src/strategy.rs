//! Endpoint selection strategies.
//!
//! Both strategies fetch a fresh snapshot from their [`Endpointer`] on every
//! call, so they always see the latest discovery state.

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::debug;

use crate::{
    balancer::Balancer, endpoint::Endpoint, error::PoolError, metrics::LB_NO_ENDPOINTS,
    pool::Endpointer,
};

/// Cycles through the pool in order. Lock-free: one atomic increment per call.
pub struct RoundRobin<Req, Res> {
    endpointer: Arc<dyn Endpointer<Req, Res>>,
    counter: AtomicU64,
}

impl<Req, Res> RoundRobin<Req, Res> {
    pub fn new(endpointer: Arc<dyn Endpointer<Req, Res>>) -> Self {
        Self { endpointer, counter: AtomicU64::new(0) }
    }
}

impl<Req, Res> Balancer<Req, Res> for RoundRobin<Req, Res> {
    fn endpoint(&self) -> Result<Endpoint<Req, Res>, PoolError> {
        let endpoints = self.endpointer.endpoints()?;
        if endpoints.is_empty() {
            LB_NO_ENDPOINTS.with_label_values(&["round_robin"]).inc();
            return Err(PoolError::NoEndpoints);
        }
        // First call after construction selects index 0.
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let idx = (n % endpoints.len() as u64) as usize;
        Ok(endpoints[idx].clone())
    }
}

/// Picks uniformly at random from a caller-seeded generator, so selections
/// are reproducible for a given seed and call sequence.
pub struct Random<Req, Res> {
    endpointer: Arc<dyn Endpointer<Req, Res>>,
    rng: Mutex<StdRng>,
}

impl<Req, Res> Random<Req, Res> {
    pub fn new(endpointer: Arc<dyn Endpointer<Req, Res>>, seed: u64) -> Self {
        debug!(seed = seed, "Seeding random balancer");
        Self { endpointer, rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }
}

impl<Req, Res> Balancer<Req, Res> for Random<Req, Res> {
    fn endpoint(&self) -> Result<Endpoint<Req, Res>, PoolError> {
        let endpoints = self.endpointer.endpoints()?;
        if endpoints.is_empty() {
            LB_NO_ENDPOINTS.with_label_values(&["random"]).inc();
            return Err(PoolError::NoEndpoints);
        }
        let idx = self.rng.lock().gen_range(0..endpoints.len());
        Ok(endpoints[idx].clone())
    }
}
