use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

use crate::account::SourceFamily;
use crate::time::TimestampMillis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionStatus {
    Success,
    Failed,
    Pending,
}

// A single asset flow in or out of the account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    pub asset_id: String,
    pub asset_symbol: String,
    pub gross_amount: Decimal,
    pub net_amount: Decimal,
}

impl Movement {
    pub fn new(asset_id: impl Into<String>, asset_symbol: impl Into<String>, amount: Decimal) -> Self {
        Self {
            asset_id: asset_id.into(),
            asset_symbol: asset_symbol.into(),
            gross_amount: amount,
            net_amount: amount,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Movements {
    #[serde(default)]
    pub inflows: Vec<Movement>,
    #[serde(default)]
    pub outflows: Vec<Movement>,
}

impl Movements {
    pub fn is_empty(&self) -> bool {
        self.inflows.is_empty() && self.outflows.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FeeScope {
    Network,
    Platform,
    Spread,
    Tax,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum FeeSettlement {
    // Paid in the on-chain transaction itself
    #[serde(rename = "on-chain")]
    #[strum(serialize = "on-chain")]
    OnChain,
    // Deducted from the account balance at the platform
    #[serde(rename = "balance")]
    #[strum(serialize = "balance")]
    Balance,
    // Settled outside the tracked account
    #[serde(rename = "external")]
    #[strum(serialize = "external")]
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fee {
    pub asset_id: String,
    pub asset_symbol: String,
    pub amount: Decimal,
    pub scope: FeeScope,
    pub settlement: FeeSettlement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationCategory {
    Transfer,
    Trade,
    Staking,
    Governance,
    Contract,
    Fee,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub category: OperationCategory,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Operation {
    pub fn new(category: OperationCategory, kind: impl Into<String>) -> Self {
        Self {
            category,
            kind: kind.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockchainInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
    pub transaction_hash: String,
    pub is_confirmed: bool,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("transaction has an empty external id")]
    MissingExternalId,
    #[error("transaction {0} has no movements and no fees")]
    Empty(String),
    #[error("negative amount on {asset} in transaction {id}")]
    NegativeAmount { id: String, asset: String },
    #[error("negative fee on {asset} in transaction {id}")]
    NegativeFee { id: String, asset: String },
}

// Canonical, replayable representation of one transaction, derived from
// raw provider payloads by a processor. Identical input always derives the
// same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedTransaction {
    pub external_id: String,
    pub datetime: DateTime<Utc>,
    pub timestamp: TimestampMillis,
    pub source: String,
    pub source_type: SourceFamily,
    pub status: TransactionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default)]
    pub movements: Movements,
    #[serde(default)]
    pub fees: Vec<Fee>,
    pub operation: Operation,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockchain: Option<BlockchainInfo>,
    #[serde(default)]
    pub is_spam: bool,
}

impl ProcessedTransaction {
    // A record that moves nothing and costs nothing is not persisted
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.external_id.is_empty() {
            return Err(RecordError::MissingExternalId);
        }

        if self.movements.is_empty() && self.fees.is_empty() {
            return Err(RecordError::Empty(self.external_id.clone()));
        }

        for movement in self
            .movements
            .inflows
            .iter()
            .chain(self.movements.outflows.iter())
        {
            if movement.gross_amount.is_sign_negative() || movement.net_amount.is_sign_negative() {
                return Err(RecordError::NegativeAmount {
                    id: self.external_id.clone(),
                    asset: movement.asset_id.clone(),
                });
            }
        }

        for fee in &self.fees {
            if fee.amount.is_sign_negative() {
                return Err(RecordError::NegativeFee {
                    id: self.external_id.clone(),
                    asset: fee.asset_id.clone(),
                });
            }
        }

        Ok(())
    }
}
