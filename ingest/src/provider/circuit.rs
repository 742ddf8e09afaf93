use std::collections::HashMap;

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use strum::Display;

use tally_common::time::TimestampSeconds;

use crate::config::{
    CIRCUIT_COOLDOWN_SECS, CIRCUIT_FAILURE_THRESHOLD, CIRCUIT_FAILURE_WINDOW_SECS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitConfig {
    // Failures inside the window before the breaker opens
    pub failure_threshold: u32,
    pub failure_window: TimestampSeconds,
    // Time the breaker stays open before allowing a half-open probe
    pub cooldown: TimestampSeconds,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: CIRCUIT_FAILURE_THRESHOLD,
            failure_window: CIRCUIT_FAILURE_WINDOW_SECS,
            cooldown: CIRCUIT_COOLDOWN_SECS,
        }
    }
}

// Per-provider breaker. All transitions take an explicit `now` so the
// state machine is fully deterministic and testable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreaker {
    state: CircuitStateKind,
    opened_at: Option<TimestampSeconds>,
    window_started_at: Option<TimestampSeconds>,
    failures_in_window: u32,
    consecutive_failures: u32,
    half_open_probe: bool,
    config: CircuitConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            state: CircuitStateKind::Closed,
            opened_at: None,
            window_started_at: None,
            failures_in_window: 0,
            consecutive_failures: 0,
            half_open_probe: false,
            config,
        }
    }

    pub fn state(&self, now: TimestampSeconds) -> CircuitStateKind {
        match self.state {
            CircuitStateKind::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                if now >= opened_at + self.config.cooldown {
                    CircuitStateKind::HalfOpen
                } else {
                    CircuitStateKind::Open
                }
            }
            other => other,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    // Whether a call may go out right now. In half-open exactly one probe
    // is allowed; its outcome closes or re-opens the breaker.
    pub fn allows_call(&mut self, now: TimestampSeconds) -> bool {
        match self.state(now) {
            CircuitStateKind::Closed => true,
            CircuitStateKind::Open => false,
            CircuitStateKind::HalfOpen => {
                if self.half_open_probe {
                    false
                } else {
                    self.state = CircuitStateKind::HalfOpen;
                    self.half_open_probe = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self, _now: TimestampSeconds) {
        trace!("circuit success");
        self.state = CircuitStateKind::Closed;
        self.opened_at = None;
        self.window_started_at = None;
        self.failures_in_window = 0;
        self.consecutive_failures = 0;
        self.half_open_probe = false;
    }

    // Returns true when this failure opened the breaker
    pub fn record_failure(&mut self, now: TimestampSeconds) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.state(now) == CircuitStateKind::HalfOpen {
            debug!("half-open probe failed, circuit re-opened");
            self.open(now);
            return true;
        }

        // Restart the failure window when the previous one elapsed
        match self.window_started_at {
            Some(started) if now.saturating_sub(started) <= self.config.failure_window => {}
            _ => {
                self.window_started_at = Some(now);
                self.failures_in_window = 0;
            }
        }
        self.failures_in_window = self.failures_in_window.saturating_add(1);

        if self.state == CircuitStateKind::Closed
            && self.failures_in_window >= self.config.failure_threshold
        {
            self.open(now);
            return true;
        }

        false
    }

    fn open(&mut self, now: TimestampSeconds) {
        self.state = CircuitStateKind::Open;
        self.opened_at = Some(now);
        self.half_open_probe = false;
        self.failures_in_window = 0;
        self.window_started_at = None;
    }
}

// Breakers keyed by "domain/provider" so different domains never interfere
pub struct CircuitBreakerRegistry {
    breakers: HashMap<String, CircuitBreaker>,
    config: CircuitConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            breakers: HashMap::new(),
            config,
        }
    }

    pub fn get_or_create(&mut self, key: &str) -> &mut CircuitBreaker {
        let config = self.config;
        self.breakers
            .entry(key.to_owned())
            .or_insert_with(|| CircuitBreaker::new(config))
    }

    pub fn allows_call(&mut self, key: &str, now: TimestampSeconds) -> bool {
        self.get_or_create(key).allows_call(now)
    }

    pub fn state(&self, key: &str, now: TimestampSeconds) -> CircuitStateKind {
        self.breakers
            .get(key)
            .map(|breaker| breaker.state(now))
            .unwrap_or(CircuitStateKind::Closed)
    }

    pub fn record_success(&mut self, key: &str, now: TimestampSeconds) {
        self.get_or_create(key).record_success(now);
    }

    pub fn record_failure(&mut self, key: &str, now: TimestampSeconds) -> bool {
        self.get_or_create(key).record_failure(now)
    }

    pub fn consecutive_failures(&self, key: &str) -> u32 {
        self.breakers
            .get(key)
            .map(CircuitBreaker::consecutive_failures)
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, CircuitBreaker> {
        self.breakers.clone()
    }

    pub fn restore(&mut self, snapshot: HashMap<String, CircuitBreaker>) {
        self.breakers = snapshot;
    }

    pub fn clear(&mut self) {
        self.breakers.clear();
    }
}
