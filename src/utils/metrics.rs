use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};
use std::sync::LazyLock;

// --- Discovery Metrics ---

/// Discovery events applied to endpoint caches, by outcome (`ok` or `error`).
///
/// A steadily growing `error` series means the discovery source is unhealthy.
/// Example query: `rate(sd_events_total{outcome="error"}[5m])`.
pub static SD_EVENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "sd_events_total",
        "Total number of discovery events applied, by outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Endpoints built by the factory for newly seen instances.
pub static SD_ENDPOINTS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "sd_endpoints_created_total",
        "Total number of endpoints created by the factory"
    )
    .unwrap()
});

/// Releasable resources handed back after their instance disappeared.
///
/// Should track `sd_endpoints_created_total` over time; a widening gap is
/// simply the number of live instances.
pub static SD_ENDPOINTS_RELEASED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "sd_endpoints_released_total",
        "Total number of endpoint resources released"
    )
    .unwrap()
});

/// Factory invocations that failed; the instance was left out of the snapshot.
pub static SD_FACTORY_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "sd_factory_failures_total",
        "Total number of endpoint factory failures"
    )
    .unwrap()
});

/// Times a cache dropped all of its endpoints because a discovery error outlived
/// the invalidation timeout.
pub static SD_CACHE_INVALIDATIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "sd_cache_invalidations_total",
        "Total number of endpoint cache invalidations after a discovery error"
    )
    .unwrap()
});

// --- Load Balancing Metrics ---

/// Selections that failed because the pool was empty, by strategy.
///
/// Example query: `increase(lb_no_endpoints_total[1m]) > 0` for alerting.
pub static LB_NO_ENDPOINTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "lb_no_endpoints_total",
        "Total number of selections with no endpoints available",
        &["strategy"]
    )
    .unwrap()
});

/// Individual attempts made by retrying endpoints, successful or not.
pub static LB_RETRY_ATTEMPTS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "lb_retry_attempts_total",
        "Total number of attempts made by retry executors"
    )
    .unwrap()
});

/// Retrying calls that gave up after the callback (or attempt budget) said stop.
pub static LB_RETRY_EXHAUSTED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("lb_retry_exhausted_total", "Total number of retrying calls that gave up")
        .unwrap()
});

/// Retrying calls cut short by their overall deadline or cancellation.
pub static LB_RETRY_DEADLINE_EXCEEDED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "lb_retry_deadline_exceeded_total",
        "Total number of retrying calls aborted by deadline or cancellation"
    )
    .unwrap()
});
