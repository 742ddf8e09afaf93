mod esplora;
mod processor;

pub use esplora::EsploraProvider;
pub use processor::BitcoinTransform;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tally_common::account::{Account, SourceFamily};
use tally_common::cursor::{CursorType, ReplayWindow};
use tally_common::time::TimestampMillis;

use crate::error::IngestError;
use crate::importer::{ChainImporter, Importer};
use crate::processor::{Processor, SchemaProcessor};
use crate::provider::manager::ProviderManager;
use crate::provider::registry::{
    ProviderCapabilities, ProviderConfig, ProviderMetadata, ProviderRegistry, RateLimit,
    RetryPolicy,
};
use crate::provider::{OneShotOperation, OneShotOutput, OperationKind, Provider};
use crate::sources::{LiveBalance, ProcessorDeps, SourceAdapter};

pub const CHAIN: &str = "bitcoin";
pub const NATIVE_SYMBOL: &str = "BTC";
pub const NATIVE_DECIMALS: u32 = 8;

// One side of a transaction: a previous output being spent, or a new
// output being created. Coinbase inputs and OP_RETURN outputs have no
// address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitcoinSide {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    // Satoshis
    pub value: u64,
}

// Provider-neutral normalization of one confirmed Bitcoin transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitcoinTransaction {
    pub id: String,
    pub tx_hash: String,
    pub chain: String,
    pub block_height: u64,
    pub timestamp: TimestampMillis,
    pub inputs: Vec<BitcoinSide>,
    pub outputs: Vec<BitcoinSide>,
    pub fee: u64,
}

fn esplora_capabilities() -> ProviderCapabilities {
    ProviderCapabilities {
        supported_operations: vec![
            OperationKind::AddressTransactions,
            OperationKind::AddressBalance,
            OperationKind::TransactionExists,
        ],
        supported_transaction_types: vec!["transfer".into()],
        supported_cursor_types: vec![CursorType::BlockNumber],
        preferred_cursor_type: Some(CursorType::BlockNumber),
        replay_window: Some(ReplayWindow::Blocks(6)),
        supports_pagination: true,
        max_batch_size: Some(25),
        requires_api_key: false,
    }
}

pub fn mempool_space_metadata() -> ProviderMetadata {
    ProviderMetadata {
        name: "mempool_space".into(),
        display_name: "mempool.space".into(),
        domain: CHAIN.into(),
        base_url: "https://mempool.space/api".into(),
        capabilities: esplora_capabilities(),
        default_config: ProviderConfig {
            rate_limit: RateLimit::per_second(4),
            retries: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            api_key: None,
            api_secret: None,
        },
    }
}

pub fn blockstream_metadata() -> ProviderMetadata {
    ProviderMetadata {
        name: "blockstream".into(),
        display_name: "Blockstream".into(),
        domain: CHAIN.into(),
        base_url: "https://blockstream.info/api".into(),
        capabilities: esplora_capabilities(),
        default_config: ProviderConfig {
            rate_limit: RateLimit::per_second(4),
            retries: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            api_key: None,
            api_secret: None,
        },
    }
}

pub fn register_providers(registry: &mut ProviderRegistry) -> Result<(), IngestError> {
    registry.register(
        mempool_space_metadata(),
        Box::new(|config, events| {
            Ok(
                Arc::new(EsploraProvider::new(mempool_space_metadata(), &config, events)?)
                    as Arc<dyn Provider>,
            )
        }),
    )?;
    registry.register(
        blockstream_metadata(),
        Box::new(|config, events| {
            Ok(
                Arc::new(EsploraProvider::new(blockstream_metadata(), &config, events)?)
                    as Arc<dyn Provider>,
            )
        }),
    )?;
    Ok(())
}

pub struct BitcoinAdapter;

#[async_trait]
impl SourceAdapter for BitcoinAdapter {
    fn name(&self) -> &'static str {
        CHAIN
    }

    fn family(&self) -> SourceFamily {
        SourceFamily::Blockchain
    }

    fn create_importer(
        &self,
        manager: Arc<ProviderManager>,
        preferred_provider: Option<&str>,
    ) -> Result<Arc<dyn Importer>, IngestError> {
        Ok(Arc::new(ChainImporter::new(
            manager,
            CHAIN,
            vec![OperationKind::AddressTransactions],
            preferred_provider.map(str::to_owned),
        )))
    }

    fn create_processor(&self, _deps: &ProcessorDeps) -> Result<Arc<dyn Processor>, IngestError> {
        Ok(Arc::new(SchemaProcessor::new(BitcoinTransform::new())))
    }

    async fn fetch_live_balance(
        &self,
        manager: &Arc<ProviderManager>,
        account: &Account,
    ) -> Result<Option<Vec<LiveBalance>>, IngestError> {
        let operation = OneShotOperation::AddressBalance {
            address: account.identifier.clone(),
        };
        match manager.execute_once(CHAIN, &operation).await? {
            OneShotOutput::Balance {
                asset_symbol,
                amount,
            } => Ok(Some(vec![LiveBalance {
                asset_symbol,
                amount,
            }])),
            _ => Ok(None),
        }
    }
}
