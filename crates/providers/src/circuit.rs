use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::error::ProviderError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown: Duration::from_secs(30) }
    }
}

#[derive(Debug)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen { probe_in_flight: bool },
}

/// Consecutive-failure circuit breaker shared by all worker slots for one
/// provider. Half-open admits exactly one probe; its outcome decides whether
/// the circuit closes or re-opens.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, state: Mutex::new(State::Closed { consecutive_failures: 0 }) }
    }

    pub fn check(&self) -> Result<(), ProviderError> {
        let mut state = self.state.lock().expect("breaker lock");
        match &mut *state {
            State::Closed { .. } => Ok(()),
            State::Open { since } => {
                if since.elapsed() >= self.config.cooldown {
                    *state = State::HalfOpen { probe_in_flight: true };
                    Ok(())
                } else {
                    Err(ProviderError::CircuitOpen)
                }
            }
            State::HalfOpen { probe_in_flight } => {
                if *probe_in_flight {
                    Err(ProviderError::CircuitOpen)
                } else {
                    *probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock");
        *state = State::Closed { consecutive_failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock");
        match &mut *state {
            State::Closed { consecutive_failures } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        event_name = "provider.circuit.opened",
                        failures = *consecutive_failures,
                        "circuit breaker opened after consecutive failures"
                    );
                    *state = State::Open { since: Instant::now() };
                }
            }
            State::HalfOpen { .. } => {
                *state = State::Open { since: Instant::now() };
            }
            State::Open { .. } => {}
        }
    }
}
