pub mod cache;
pub mod circuit;
pub mod http;
pub mod manager;
pub mod registry;
pub mod stats;
pub mod streaming;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;
use thiserror::Error;

use tally_common::cursor::{CursorState, CursorType};

use self::registry::ProviderMetadata;

// Everything a provider can be asked to do. Streaming and one-shot
// operations are separate execution shapes; this enum is the shared
// capability vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    AddressTransactions,
    AddressInternalTransactions,
    TokenTransactions,
    LedgerEntries,
    AddressBalance,
    TokenMetadata,
    TransactionExists,
}

// Streaming operations yield a lazy sequence of batches with a cursor
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOperation {
    AddressTransactions { address: String },
    AddressInternalTransactions { address: String },
    TokenTransactions { address: String },
    LedgerEntries,
}

impl StreamOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            StreamOperation::AddressTransactions { .. } => OperationKind::AddressTransactions,
            StreamOperation::AddressInternalTransactions { .. } => {
                OperationKind::AddressInternalTransactions
            }
            StreamOperation::TokenTransactions { .. } => OperationKind::TokenTransactions,
            StreamOperation::LedgerEntries => OperationKind::LedgerEntries,
        }
    }

    // Stream type naming the cursor slot in Account::last_cursor
    pub fn stream_type(&self) -> &'static str {
        match self {
            StreamOperation::AddressTransactions { .. } => "normal",
            StreamOperation::AddressInternalTransactions { .. } => "internal",
            StreamOperation::TokenTransactions { .. } => "token",
            StreamOperation::LedgerEntries => "ledger",
        }
    }

    pub fn address(&self) -> Option<&str> {
        match self {
            StreamOperation::AddressTransactions { address }
            | StreamOperation::AddressInternalTransactions { address }
            | StreamOperation::TokenTransactions { address } => Some(address),
            StreamOperation::LedgerEntries => None,
        }
    }

    // Build an address-scoped operation from its kind; None for kinds
    // that are not address streams
    pub fn for_address(kind: OperationKind, address: &str) -> Option<Self> {
        let address = address.to_owned();
        match kind {
            OperationKind::AddressTransactions => {
                Some(StreamOperation::AddressTransactions { address })
            }
            OperationKind::AddressInternalTransactions => {
                Some(StreamOperation::AddressInternalTransactions { address })
            }
            OperationKind::TokenTransactions => {
                Some(StreamOperation::TokenTransactions { address })
            }
            _ => None,
        }
    }
}

// One-shot operations yield exactly one response and may be cached
#[derive(Debug, Clone, PartialEq)]
pub enum OneShotOperation {
    AddressBalance { address: String },
    TokenMetadata { contract: String },
    TransactionExists { tx_hash: String },
}

impl OneShotOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            OneShotOperation::AddressBalance { .. } => OperationKind::AddressBalance,
            OneShotOperation::TokenMetadata { .. } => OperationKind::TokenMetadata,
            OneShotOperation::TransactionExists { .. } => OperationKind::TransactionExists,
        }
    }

    // Cache key namespaced by operation content
    pub fn cache_key(&self) -> String {
        match self {
            OneShotOperation::AddressBalance { address } => {
                format!("address_balance:{}", address.to_lowercase())
            }
            OneShotOperation::TokenMetadata { contract } => {
                format!("token_metadata:{}", contract.to_lowercase())
            }
            OneShotOperation::TransactionExists { tx_hash } => {
                format!("transaction_exists:{}", tx_hash.to_lowercase())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OneShotOutput {
    Balance {
        asset_symbol: String,
        amount: Decimal,
    },
    TokenMetadata {
        contract: String,
        symbol: String,
        name: String,
        decimals: u32,
    },
    Exists(bool),
}

// One external payload together with its provider-neutral normalization
#[derive(Debug, Clone)]
pub struct ProviderItem {
    pub external_id: String,
    // Set only when this item uniquely represents the on-chain transaction
    pub tx_hash: Option<String>,
    pub raw: Value,
    pub normalized: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub fetched: usize,
    pub deduplicated: usize,
    pub yielded: usize,
}

#[derive(Debug, Clone)]
pub struct ProviderBatch {
    pub items: Vec<ProviderItem>,
    pub cursor: CursorState,
    pub is_complete: bool,
    pub stats: BatchStats,
}

pub type BatchStream = Pin<Box<dyn Stream<Item = Result<ProviderBatch, ProviderError>> + Send>>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rate limited after {0} attempts")]
    RateLimited(u32),

    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unexpected payload shape: {0}")]
    Payload(String),

    #[error("cursor of type {0} is not supported")]
    UnsupportedCursor(CursorType),

    #[error("operation '{0}' is not supported")]
    UnsupportedOperation(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream ended without a completion signal")]
    IncompleteStream,
}

// Concrete integration with one external data source API
#[async_trait]
pub trait Provider: std::fmt::Debug + Send + Sync {
    fn metadata(&self) -> &ProviderMetadata;

    fn name(&self) -> &str {
        &self.metadata().name
    }

    // One-shot execution: balance, token metadata, existence checks
    async fn execute(&self, operation: &OneShotOperation) -> Result<OneShotOutput, ProviderError>;

    // Streaming execution. Implementations must honor a compatible resume
    // cursor, stamp their own name into every emitted cursor, keep
    // pagination state in cursor.metadata.custom, apply their replay
    // window when resuming, and emit is_complete=true exactly once.
    fn execute_streaming(
        self: Arc<Self>,
        operation: StreamOperation,
        resume: Option<CursorState>,
    ) -> BatchStream;

    // Fast, dependency-free liveness probe
    async fn is_healthy(&self) -> bool {
        true
    }

    async fn destroy(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_types_are_distinct_cursor_slots() {
        let ops = [
            StreamOperation::AddressTransactions {
                address: "0xabc".into(),
            },
            StreamOperation::AddressInternalTransactions {
                address: "0xabc".into(),
            },
            StreamOperation::TokenTransactions {
                address: "0xabc".into(),
            },
            StreamOperation::LedgerEntries,
        ];
        let mut types: Vec<_> = ops.iter().map(|op| op.stream_type()).collect();
        types.sort_unstable();
        types.dedup();
        assert_eq!(types.len(), ops.len());
    }

    #[test]
    fn test_cache_keys_are_content_addressed() {
        let a = OneShotOperation::AddressBalance {
            address: "0xABC".into(),
        };
        let b = OneShotOperation::AddressBalance {
            address: "0xabc".into(),
        };
        assert_eq!(a.cache_key(), b.cache_key());

        let c = OneShotOperation::TransactionExists {
            tx_hash: "0xabc".into(),
        };
        assert_ne!(a.cache_key(), c.cache_key());
    }
}
