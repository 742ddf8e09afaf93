pub mod bitcoin;
pub mod evm;
pub mod kraken;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use log::debug;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tally_common::account::{Account, SourceFamily};
use tally_common::transaction::TransactionStatus;

use crate::error::IngestError;
use crate::importer::Importer;
use crate::process::RawBatchProvider;
use crate::processor::Processor;
use crate::provider::manager::ProviderManager;
use crate::provider::registry::ProviderRegistry;
use crate::scam::ScamDetector;
use crate::storage::IngestStorage;

// Optional capabilities injected into processors that declare them
#[derive(Clone, Default)]
pub struct ProcessorDeps {
    pub scam_detector: Option<Arc<dyn ScamDetector>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveBalance {
    pub asset_symbol: String,
    pub amount: Decimal,
}

// Transaction status as it appears in normalized provider payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizedStatus {
    Success,
    Failed,
    Pending,
}

impl From<NormalizedStatus> for TransactionStatus {
    fn from(status: NormalizedStatus) -> Self {
        match status {
            NormalizedStatus::Success => TransactionStatus::Success,
            NormalizedStatus::Failed => TransactionStatus::Failed,
            NormalizedStatus::Pending => TransactionStatus::Pending,
        }
    }
}

// Scale an integer base-unit amount string (wei, sats) into a decimal.
// Purely textual so huge integers never round-trip through floats.
pub fn scale_base_units(value: &str, decimals: u32) -> Option<Decimal> {
    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let digits = digits.trim_start_matches('0');
    let decimals = decimals as usize;
    let unsigned = if decimals == 0 {
        if digits.is_empty() {
            "0".to_owned()
        } else {
            digits.to_owned()
        }
    } else if digits.len() <= decimals {
        format!("0.{}{}", "0".repeat(decimals - digits.len()), digits)
    } else {
        let split = digits.len() - decimals;
        format!("{}.{}", &digits[..split], &digits[split..])
    };

    let text = if negative {
        format!("-{}", unsigned)
    } else {
        unsigned
    };
    Decimal::from_str(&text).ok()
}

// Per-source component bundle: importer, processor and the optional
// specializations a source may declare.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn family(&self) -> SourceFamily;

    fn create_importer(
        &self,
        manager: Arc<ProviderManager>,
        preferred_provider: Option<&str>,
    ) -> Result<Arc<dyn Importer>, IngestError>;

    fn create_processor(&self, deps: &ProcessorDeps) -> Result<Arc<dyn Processor>, IngestError>;

    // None means the process service picks its default for the family
    fn create_batch_provider(
        &self,
        _storage: Arc<IngestStorage>,
        _account_id: u64,
    ) -> Option<Box<dyn RawBatchProvider>> {
        None
    }

    async fn fetch_live_balance(
        &self,
        _manager: &Arc<ProviderManager>,
        _account: &Account,
    ) -> Result<Option<Vec<LiveBalance>>, IngestError> {
        Ok(None)
    }
}

// Immutable map of source adapters, built once at startup
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: IndexMap<String, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) -> Result<(), IngestError> {
        let name = adapter.name().to_lowercase();
        if self.adapters.contains_key(&name) {
            return Err(IngestError::DuplicateSource(name));
        }
        debug!("registered source adapter '{}'", name);
        self.adapters.insert(name, adapter);
        Ok(())
    }

    pub fn get(&self, source_name: &str) -> Result<Arc<dyn SourceAdapter>, IngestError> {
        self.adapters
            .get(&source_name.to_lowercase())
            .cloned()
            .ok_or_else(|| IngestError::UnknownSource(source_name.to_owned()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }

    // All built-in sources
    pub fn builtin() -> Result<Self, IngestError> {
        let mut registry = Self::new();
        registry.register(Arc::new(evm::EthereumAdapter))?;
        registry.register(Arc::new(bitcoin::BitcoinAdapter))?;
        registry.register(Arc::new(kraken::KrakenAdapter))?;
        Ok(registry)
    }
}

// All built-in providers, keyed by (domain, name)
pub fn builtin_provider_registry() -> Result<ProviderRegistry, IngestError> {
    let mut registry = ProviderRegistry::new();
    evm::register_providers(&mut registry)?;
    bitcoin::register_providers(&mut registry)?;
    Ok(registry)
}
