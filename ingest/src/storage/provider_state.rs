use crate::provider::stats::{PersistedProviderState, ProviderStateQueries};
use crate::storage::{IngestStorage, StorageError};

const PROVIDER_STATE_KEY: &[u8] = b"provider_state";

impl ProviderStateQueries for IngestStorage {
    fn load_provider_state(&self) -> Result<Option<PersistedProviderState>, StorageError> {
        self.provider_state
            .get(PROVIDER_STATE_KEY)?
            .map(|bytes| Self::from_bytes(&bytes))
            .transpose()
    }

    fn save_provider_state(&self, state: &PersistedProviderState) -> Result<(), StorageError> {
        self.provider_state
            .insert(PROVIDER_STATE_KEY, Self::to_bytes(state)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::circuit::{CircuitBreakerRegistry, CircuitConfig, CircuitStateKind};
    use crate::provider::stats::ProviderStatsStore;

    #[test]
    fn test_round_trip_through_storage() {
        let storage = IngestStorage::open_temporary().unwrap();
        assert!(storage.load_provider_state().unwrap().is_none());

        let mut stats = ProviderStatsStore::new();
        stats.update_health("ethereum/etherscan", false, 250, Some("boom".into()), 100);
        let mut breakers = CircuitBreakerRegistry::new(CircuitConfig {
            failure_threshold: 1,
            failure_window: 60,
            cooldown: 60,
        });
        breakers.record_failure("ethereum/etherscan", 100);

        stats.save(&storage, &breakers).unwrap();

        // a fresh process hydrates the same view of the world
        let mut restored_stats = ProviderStatsStore::new();
        let mut restored_breakers = CircuitBreakerRegistry::new(CircuitConfig::default());
        restored_stats
            .load(&storage, &mut restored_breakers)
            .unwrap();

        let health = restored_stats.get("ethereum/etherscan").unwrap();
        assert_eq!(health.failure_count, 1);
        assert_eq!(health.last_error.as_deref(), Some("boom"));
        assert_eq!(
            restored_breakers.state("ethereum/etherscan", 101),
            CircuitStateKind::Open
        );
    }
}
