//! Circuit breaker to prevent cascade failures.
//!
//! Each dependency (a `provider:model` pair) has its own circuit, so one
//! failing model is isolated without blocking the rest of the pool. While a
//! circuit is open, [`CircuitBreaker::check`] rejects immediately and the
//! gateway never touches the network.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tokio::time::Instant;

use relay_core::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Failing fast until the recovery timeout elapses
    Open,

    /// Letting trial calls through to test recovery
    HalfOpen,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Circuit open for '{dependency}'")]
pub struct CircuitOpenError {
    pub dependency: String,
}

/// Observable counters for one dependency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    /// Consecutive failures while closed.
    pub failure_count: u32,
    /// Consecutive successes while half-open.
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct Circuit {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            last_failure_time: None,
        }
    }
}

impl Circuit {
    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.success_count = 0;
    }
}

pub struct CircuitBreaker {
    circuits: RwLock<HashMap<String, Circuit>>,
    config: CircuitBreakerConfig,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("circuits", &self.circuits.read().len())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a call to `dependency` may proceed.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open
    /// and admits the call.
    pub fn check(&self, dependency: &str) -> Result<(), CircuitOpenError> {
        if !self.config.enabled {
            return Ok(());
        }
        {
            let circuits = self.circuits.read();
            match circuits.get(dependency) {
                Some(c) if c.state == CircuitState::Open => {}
                _ => return Ok(()),
            }
        }

        let mut circuits = self.circuits.write();
        let Some(circuit) = circuits.get_mut(dependency) else {
            return Ok(());
        };
        match circuit.state {
            CircuitState::Open => {
                let elapsed = circuit
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if elapsed {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.success_count = 0;
                    tracing::info!(dependency, "Circuit half-open, admitting trial calls");
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        dependency: dependency.to_string(),
                    })
                }
            }
            _ => Ok(()),
        }
    }

    pub fn record_success(&self, dependency: &str) {
        if !self.config.enabled {
            return;
        }
        let mut circuits = self.circuits.write();
        let circuit = circuits.entry(dependency.to_string()).or_default();
        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.success_count += 1;
                if circuit.success_count >= self.config.success_threshold {
                    circuit.state = CircuitState::Closed;
                    circuit.failure_count = 0;
                    circuit.success_count = 0;
                    circuit.opened_at = None;
                    tracing::info!(dependency, "Circuit closed after successful recovery");
                }
            }
            CircuitState::Closed => {
                circuit.failure_count = 0;
            }
            // A straggler finishing after the circuit opened does not close it.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, dependency: &str) {
        if !self.config.enabled {
            return;
        }
        let mut circuits = self.circuits.write();
        let circuit = circuits.entry(dependency.to_string()).or_default();
        circuit.last_failure_time = Some(Utc::now());
        match circuit.state {
            CircuitState::Closed => {
                circuit.failure_count += 1;
                if circuit.failure_count >= self.config.failure_threshold {
                    circuit.open();
                    tracing::warn!(
                        dependency,
                        failures = circuit.failure_count,
                        "Circuit opened after repeated failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                circuit.open();
                tracing::warn!(dependency, "Circuit reopened after failed recovery attempt");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state without triggering the half-open transition.
    pub fn state(&self, dependency: &str) -> CircuitState {
        self.circuits
            .read()
            .get(dependency)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, dependency: &str) -> BreakerSnapshot {
        let circuits = self.circuits.read();
        let circuit = circuits.get(dependency).cloned().unwrap_or_default();
        BreakerSnapshot {
            state: circuit.state,
            failure_count: circuit.failure_count,
            success_count: circuit.success_count,
            last_failure_time: circuit.last_failure_time,
        }
    }

    /// Dependencies with a circuit that is not closed.
    pub fn tripped(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .circuits
            .read()
            .iter()
            .filter(|(_, c)| c.state != CircuitState::Closed)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn reset_dependency(&self, dependency: &str) {
        self.circuits.write().remove(dependency);
    }

    /// Reset all circuits to closed.
    pub fn reset(&self) {
        self.circuits.write().clear();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
