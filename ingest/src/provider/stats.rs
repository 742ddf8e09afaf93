use std::collections::HashMap;

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use tally_common::time::TimestampSeconds;

use crate::provider::circuit::{CircuitBreaker, CircuitBreakerRegistry};
use crate::storage::StorageError;

// Exponential moving average weight for response latency
const LATENCY_EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub avg_latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_call_at: Option<TimestampSeconds>,
}

impl ProviderHealth {
    pub fn record(
        &mut self,
        success: bool,
        latency_ms: u64,
        error: Option<String>,
        now: TimestampSeconds,
    ) {
        if success {
            self.success_count += 1;
            self.consecutive_failures = 0;
            self.last_error = None;
        } else {
            self.failure_count += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.last_error = error;
        }

        let latency = latency_ms as f64;
        if self.success_count + self.failure_count == 1 {
            self.avg_latency_ms = latency;
        } else {
            self.avg_latency_ms =
                self.avg_latency_ms * (1.0 - LATENCY_EMA_ALPHA) + latency * LATENCY_EMA_ALPHA;
        }

        self.last_call_at = Some(now);
    }

    // Unknown providers start with full confidence
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    // Composite selection score: recent reliability dominates, latency is
    // a soft penalty, repeated failures are punished hard
    pub fn score(&self) -> f64 {
        self.success_rate() * 100.0
            - f64::from(self.consecutive_failures) * 10.0
            - self.avg_latency_ms / 100.0
    }
}

// Snapshot persisted across restarts: health counters plus breaker states
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedProviderState {
    pub health: HashMap<String, ProviderHealth>,
    pub circuits: HashMap<String, CircuitBreaker>,
}

// Persistence seam for provider state; implemented by the storage layer
pub trait ProviderStateQueries: Send + Sync {
    fn load_provider_state(&self) -> Result<Option<PersistedProviderState>, StorageError>;
    fn save_provider_state(&self, state: &PersistedProviderState) -> Result<(), StorageError>;
}

// In-memory health snapshot per provider key
#[derive(Default)]
pub struct ProviderStatsStore {
    health: HashMap<String, ProviderHealth>,
}

impl ProviderStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Called on registration. Does not clobber counters hydrated from
    // persistence before registration ran.
    pub fn initialize_provider(&mut self, key: &str) {
        self.health.entry(key.to_owned()).or_default();
    }

    pub fn update_health(
        &mut self,
        key: &str,
        success: bool,
        latency_ms: u64,
        error: Option<String>,
        now: TimestampSeconds,
    ) {
        trace!("update health for {}: success={}", key, success);
        self.health
            .entry(key.to_owned())
            .or_default()
            .record(success, latency_ms, error, now);
    }

    pub fn get(&self, key: &str) -> Option<&ProviderHealth> {
        self.health.get(key)
    }

    pub fn score(&self, key: &str) -> f64 {
        self.health
            .get(key)
            .map(ProviderHealth::score)
            .unwrap_or(100.0)
    }

    pub fn health_for_domain(&self, domain: &str) -> HashMap<String, ProviderHealth> {
        let prefix = format!("{}/", domain);
        self.health
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, health)| (key.clone(), health.clone()))
            .collect()
    }

    pub fn load(
        &mut self,
        store: &dyn ProviderStateQueries,
        breakers: &mut CircuitBreakerRegistry,
    ) -> Result<(), StorageError> {
        if let Some(state) = store.load_provider_state()? {
            debug!(
                "hydrated provider state: {} health entries, {} breakers",
                state.health.len(),
                state.circuits.len()
            );
            self.health = state.health;
            breakers.restore(state.circuits);
        }
        Ok(())
    }

    // Best-effort: callers log failures and carry on
    pub fn save(
        &self,
        store: &dyn ProviderStateQueries,
        breakers: &CircuitBreakerRegistry,
    ) -> Result<(), StorageError> {
        let state = PersistedProviderState {
            health: self.health.clone(),
            circuits: breakers.snapshot(),
        };
        store.save_provider_state(&state)
    }

    pub fn save_or_warn(
        &self,
        store: &dyn ProviderStateQueries,
        breakers: &CircuitBreakerRegistry,
    ) {
        if let Err(e) = self.save(store, breakers) {
            warn!("failed to persist provider stats: {}", e);
        }
    }

    pub fn clear(&mut self) {
        self.health.clear();
    }
}
