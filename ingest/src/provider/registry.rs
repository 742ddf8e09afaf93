use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, trace};

use tally_common::cursor::{CursorType, ReplayWindow};
use tally_common::events::EventBus;

use crate::config::{
    DEFAULT_HTTP_TIMEOUT, DEFAULT_MAX_RETRIES, DEFAULT_REQUESTS_PER_SECOND,
    DEFAULT_RETRY_BASE_DELAY_MS,
};
use crate::error::IngestError;
use crate::provider::{OperationKind, Provider};

#[derive(Debug, Clone)]
pub struct RateLimit {
    pub requests_per_second: u32,
    pub per_minute: Option<u32>,
    pub per_hour: Option<u32>,
    pub burst_limit: Option<u32>,
}

impl RateLimit {
    pub fn per_second(requests_per_second: u32) -> Self {
        Self {
            requests_per_second,
            per_minute: None,
            per_hour: None,
            burst_limit: None,
        }
    }

    // Minimum spacing between two requests under this limit
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.requests_per_second.max(1)))
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::per_second(DEFAULT_REQUESTS_PER_SECOND)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub rate_limit: RateLimit,
    pub retries: RetryPolicy,
    pub timeout: Duration,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimit::default(),
            retries: RetryPolicy::default(),
            timeout: DEFAULT_HTTP_TIMEOUT,
            api_key: None,
            api_secret: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderCapabilities {
    pub supported_operations: Vec<OperationKind>,
    pub supported_transaction_types: Vec<String>,
    pub supported_cursor_types: Vec<CursorType>,
    pub preferred_cursor_type: Option<CursorType>,
    pub replay_window: Option<ReplayWindow>,
    pub supports_pagination: bool,
    pub max_batch_size: Option<usize>,
    pub requires_api_key: bool,
}

impl ProviderCapabilities {
    pub fn supports(&self, kind: OperationKind) -> bool {
        self.supported_operations.contains(&kind)
    }

    pub fn supports_cursor(&self, cursor_type: CursorType) -> bool {
        self.supported_cursor_types.contains(&cursor_type)
    }
}

// Everything a provider declares about itself at registration time
#[derive(Debug, Clone)]
pub struct ProviderMetadata {
    pub name: String,
    pub display_name: String,
    pub domain: String,
    pub base_url: String,
    pub capabilities: ProviderCapabilities,
    pub default_config: ProviderConfig,
}

pub fn provider_key(domain: &str, name: &str) -> String {
    format!("{}/{}", domain, name)
}

pub type ProviderFactory =
    Box<dyn Fn(ProviderConfig, EventBus) -> Result<Arc<dyn Provider>, IngestError> + Send + Sync>;

struct RegistryEntry {
    metadata: Arc<ProviderMetadata>,
    factory: ProviderFactory,
}

// Catalog of available providers per source domain. Built once at boot;
// registration order is preserved and breaks scoring ties downstream.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: IndexMap<String, RegistryEntry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        metadata: ProviderMetadata,
        factory: ProviderFactory,
    ) -> Result<(), IngestError> {
        let key = provider_key(&metadata.domain, &metadata.name);
        if self.entries.contains_key(&key) {
            return Err(IngestError::DuplicateProvider {
                domain: metadata.domain,
                name: metadata.name,
            });
        }

        debug!("registered provider {}", key);
        self.entries.insert(
            key,
            RegistryEntry {
                metadata: Arc::new(metadata),
                factory,
            },
        );
        Ok(())
    }

    pub fn metadata(&self, domain: &str, name: &str) -> Option<Arc<ProviderMetadata>> {
        self.entries
            .get(&provider_key(domain, name))
            .map(|entry| Arc::clone(&entry.metadata))
    }

    // Synthesize a provider config from the declared metadata
    pub fn default_config(&self, domain: &str, name: &str) -> Result<ProviderConfig, IngestError> {
        self.entries
            .get(&provider_key(domain, name))
            .map(|entry| entry.metadata.default_config.clone())
            .ok_or_else(|| IngestError::UnknownProvider {
                domain: domain.to_owned(),
                name: name.to_owned(),
            })
    }

    pub fn domain_metadata(&self, domain: &str) -> Vec<Arc<ProviderMetadata>> {
        self.entries
            .values()
            .filter(|entry| entry.metadata.domain == domain)
            .map(|entry| Arc::clone(&entry.metadata))
            .collect()
    }

    // Instantiate the providers of a domain. A pinned preferred provider,
    // when registered for the domain, is the only one returned.
    pub fn create_for_domain(
        &self,
        domain: &str,
        preferred: Option<&str>,
        events: &EventBus,
    ) -> Result<Vec<Arc<dyn Provider>>, IngestError> {
        trace!("create providers for domain {}", domain);

        let entries: Vec<&RegistryEntry> = self
            .entries
            .values()
            .filter(|entry| entry.metadata.domain == domain)
            .collect();

        if entries.is_empty() {
            return Err(IngestError::NoProviders(domain.to_owned()));
        }

        let selected: Vec<&RegistryEntry> = match preferred {
            Some(name) => {
                let pinned: Vec<&RegistryEntry> = entries
                    .iter()
                    .copied()
                    .filter(|entry| entry.metadata.name == name)
                    .collect();
                if pinned.is_empty() {
                    debug!(
                        "preferred provider '{}' is not registered for domain '{}', using all",
                        name, domain
                    );
                    entries
                } else {
                    pinned
                }
            }
            None => entries,
        };

        let mut providers = Vec::with_capacity(selected.len());
        for entry in selected {
            let config = entry.metadata.default_config.clone();
            providers.push((entry.factory)(config, events.clone())?);
        }
        Ok(providers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        BatchStream, OneShotOperation, OneShotOutput, ProviderError, StreamOperation,
    };
    use async_trait::async_trait;
    use tally_common::cursor::CursorState;

    #[derive(Debug)]
    struct NullProvider {
        metadata: ProviderMetadata,
    }

    #[async_trait]
    impl Provider for NullProvider {
        fn metadata(&self) -> &ProviderMetadata {
            &self.metadata
        }

        async fn execute(
            &self,
            _operation: &OneShotOperation,
        ) -> Result<OneShotOutput, ProviderError> {
            Ok(OneShotOutput::Exists(false))
        }

        fn execute_streaming(
            self: std::sync::Arc<Self>,
            _operation: StreamOperation,
            _resume: Option<CursorState>,
        ) -> BatchStream {
            Box::pin(futures::stream::empty())
        }
    }

    fn metadata(domain: &str, name: &str) -> ProviderMetadata {
        ProviderMetadata {
            name: name.to_owned(),
            display_name: name.to_owned(),
            domain: domain.to_owned(),
            base_url: "http://localhost".into(),
            capabilities: ProviderCapabilities {
                supported_operations: vec![OperationKind::AddressTransactions],
                supported_transaction_types: vec!["transfer".into()],
                supported_cursor_types: vec![CursorType::BlockNumber],
                preferred_cursor_type: Some(CursorType::BlockNumber),
                replay_window: None,
                supports_pagination: true,
                max_batch_size: None,
                requires_api_key: false,
            },
            default_config: ProviderConfig::default(),
        }
    }

    fn factory() -> ProviderFactory {
        Box::new(|_config, _events| {
            Ok(std::sync::Arc::new(NullProvider {
                metadata: metadata("testnet", "null"),
            }) as std::sync::Arc<dyn Provider>)
        })
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ProviderRegistry::new();
        registry.register(metadata("testnet", "null"), factory()).unwrap();
        let err = registry
            .register(metadata("testnet", "null"), factory())
            .unwrap_err();
        assert!(matches!(err, IngestError::DuplicateProvider { .. }));
    }

    #[test]
    fn test_same_name_in_other_domain_is_fine() {
        let mut registry = ProviderRegistry::new();
        registry.register(metadata("testnet", "null"), factory()).unwrap();
        registry.register(metadata("othernet", "null"), factory()).unwrap();
    }

    #[test]
    fn test_preferred_provider_short_circuits() {
        let events = EventBus::new(4);
        let mut registry = ProviderRegistry::new();
        registry.register(metadata("testnet", "a"), factory()).unwrap();
        registry.register(metadata("testnet", "b"), factory()).unwrap();

        let all = registry.create_for_domain("testnet", None, &events).unwrap();
        assert_eq!(all.len(), 2);

        let pinned = registry
            .create_for_domain("testnet", Some("b"), &events)
            .unwrap();
        assert_eq!(pinned.len(), 1);

        // Unknown preferred name falls back to the full set
        let fallback = registry
            .create_for_domain("testnet", Some("zzz"), &events)
            .unwrap();
        assert_eq!(fallback.len(), 2);
    }

    #[test]
    fn test_unknown_domain_is_no_providers() {
        let events = EventBus::new(4);
        let registry = ProviderRegistry::new();
        let err = registry
            .create_for_domain("testnet", None, &events)
            .unwrap_err();
        assert!(matches!(err, IngestError::NoProviders(_)));
    }

    #[test]
    fn test_default_config_comes_from_metadata() {
        let mut registry = ProviderRegistry::new();
        let mut md = metadata("testnet", "null");
        md.default_config.rate_limit = RateLimit::per_second(2);
        registry.register(md, factory()).unwrap();

        let config = registry.default_config("testnet", "null").unwrap();
        assert_eq!(config.rate_limit.requests_per_second, 2);
        assert_eq!(
            config.rate_limit.min_interval(),
            Duration::from_millis(500)
        );

        assert!(matches!(
            registry.default_config("testnet", "missing"),
            Err(IngestError::UnknownProvider { .. })
        ));
    }
}
