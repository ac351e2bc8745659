use failsafe::{backoff, failure_policy, Config};
use std::time::Duration;

/// Consecutive gateway failures that open the breaker.
pub const GATEWAY_FAILURE_THRESHOLD: u32 = 5;

/// Circuit breaker around WhatsApp gateway sends during a disparo batch.
///
/// After five consecutive failures the breaker opens and further sends are
/// rejected without touching the gateway, backing off from 30s up to 5 min.
pub fn create_gateway_circuit_breaker(
) -> impl failsafe::CircuitBreaker + failsafe::futures::CircuitBreaker {
    let backoff_strategy = backoff::exponential(Duration::from_secs(30), Duration::from_secs(300));
    let policy = failure_policy::consecutive_failures(GATEWAY_FAILURE_THRESHOLD, backoff_strategy);

    Config::new().failure_policy(policy).build()
}
