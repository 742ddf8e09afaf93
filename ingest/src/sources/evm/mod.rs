mod processor;
mod scan;

pub use processor::EvmTransform;
pub use scan::EvmScanProvider;

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
use crate::sources::{LiveBalance, NormalizedStatus, ProcessorDeps, SourceAdapter};

pub const CHAIN: &str = "ethereum";
pub const NATIVE_SYMBOL: &str = "ETH";
pub const NATIVE_DECIMALS: u32 = 18;

// Which of the three EVM streams produced a normalized row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvmMovementKind {
    Native,
    Internal,
    Token,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvmToken {
    pub contract: String,
    pub symbol: String,
    pub decimals: u32,
}

// Provider-neutral normalization of one EVM history row. One on-chain
// transaction may normalize into several rows (its native transfer, its
// internal calls, its token logs); they share tx_hash and are re-merged by
// the processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvmTransaction {
    pub id: String,
    pub tx_hash: String,
    pub chain: String,
    pub block_height: u64,
    pub timestamp: TimestampMillis,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    // Base units (wei or token units), decimal string
    pub value: String,
    // Wei paid by the sender; only present on native rows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<String>,
    pub status: NormalizedStatus,
    pub movement: EvmMovementKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<EvmToken>,
}

fn scan_capabilities(with_token_metadata: bool) -> ProviderCapabilities {
    let mut operations = vec![
        OperationKind::AddressTransactions,
        OperationKind::AddressInternalTransactions,
        OperationKind::TokenTransactions,
        OperationKind::AddressBalance,
        OperationKind::TransactionExists,
    ];
    if with_token_metadata {
        operations.push(OperationKind::TokenMetadata);
    }

    ProviderCapabilities {
        supported_operations: operations,
        supported_transaction_types: vec![
            "transfer".into(),
            "internal".into(),
            "token_transfer".into(),
        ],
        supported_cursor_types: vec![CursorType::BlockNumber],
        preferred_cursor_type: Some(CursorType::BlockNumber),
        replay_window: Some(ReplayWindow::Blocks(10)),
        supports_pagination: true,
        max_batch_size: Some(100),
        requires_api_key: false,
    }
}

pub fn etherscan_metadata() -> ProviderMetadata {
    ProviderMetadata {
        name: "etherscan".into(),
        display_name: "Etherscan".into(),
        domain: CHAIN.into(),
        base_url: "https://api.etherscan.io/api".into(),
        capabilities: scan_capabilities(false),
        default_config: ProviderConfig {
            rate_limit: RateLimit::per_second(5),
            retries: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            api_key: None,
            api_secret: None,
        },
    }
}

pub fn blockscout_metadata() -> ProviderMetadata {
    ProviderMetadata {
        name: "blockscout".into(),
        display_name: "Blockscout".into(),
        domain: CHAIN.into(),
        base_url: "https://eth.blockscout.com/api".into(),
        capabilities: scan_capabilities(true),
        default_config: ProviderConfig {
            rate_limit: RateLimit::per_second(10),
            retries: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            api_key: None,
            api_secret: None,
        },
    }
}

pub fn register_providers(registry: &mut ProviderRegistry) -> Result<(), IngestError> {
    registry.register(
        etherscan_metadata(),
        Box::new(|config, events| {
            Ok(Arc::new(EvmScanProvider::new(etherscan_metadata(), &config, events)?)
                as Arc<dyn Provider>)
        }),
    )?;
    registry.register(
        blockscout_metadata(),
        Box::new(|config, events| {
            Ok(
                Arc::new(EvmScanProvider::new(blockscout_metadata(), &config, events)?)
                    as Arc<dyn Provider>,
            )
        }),
    )?;
    Ok(())
}

pub struct EthereumAdapter;

#[async_trait]
impl SourceAdapter for EthereumAdapter {
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
            vec![
                OperationKind::AddressTransactions,
                OperationKind::AddressInternalTransactions,
                OperationKind::TokenTransactions,
            ],
            preferred_provider.map(str::to_owned),
        )))
    }

    fn create_processor(&self, deps: &ProcessorDeps) -> Result<Arc<dyn Processor>, IngestError> {
        let mut processor = SchemaProcessor::new(EvmTransform::new(CHAIN));
        if let Some(detector) = &deps.scam_detector {
            processor = processor.with_scam_detector(Arc::clone(detector));
        }
        Ok(Arc::new(processor))
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
