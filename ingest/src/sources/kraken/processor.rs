use std::str::FromStr;

use chrono::DateTime;
use indexmap::IndexMap;
use rust_decimal::Decimal;

use tally_common::asset;
use tally_common::transaction::{
    Fee, FeeScope, FeeSettlement, Movement, Movements, Operation, OperationCategory,
    ProcessedTransaction, TransactionStatus,
};
use tally_common::SourceFamily;

use crate::error::IngestError;
use crate::processor::{ProcessingContext, Transform};
use crate::sources::kraken::{KrakenLedgerEntry, LedgerEntryType, LedgerEnvelope, SOURCE};

fn validation(field: &str, record_index: usize) -> IngestError {
    IngestError::Validation {
        field_path: field.to_owned(),
        record_index,
    }
}

// Correlates ledger entries by their reference id: the two legs of a trade
// plus their fees become one canonical trade, single-leg groups become
// deposits, withdrawals or rewards.
#[derive(Default)]
pub struct KrakenTransform;

impl KrakenTransform {
    pub fn new() -> Self {
        Self
    }

    fn merge(
        &self,
        group_id: String,
        entries: Vec<(usize, KrakenLedgerEntry)>,
    ) -> Result<ProcessedTransaction, IngestError> {
        let mut movements = Movements::default();
        let mut fees = Vec::new();
        let mut timestamp = 0u64;
        let mut types = Vec::new();

        for (index, entry) in &entries {
            timestamp = timestamp.max(entry.timestamp);
            if !types.contains(&entry.entry_type) {
                types.push(entry.entry_type);
            }

            let amount = Decimal::from_str(&entry.amount)
                .map_err(|_| validation("amount", *index))?;
            let asset_id = asset::exchange(SOURCE, &entry.asset);

            if amount.is_sign_negative() {
                movements.outflows.push(Movement::new(
                    asset_id.clone(),
                    entry.asset.clone(),
                    -amount,
                ));
            } else if !amount.is_zero() {
                movements
                    .inflows
                    .push(Movement::new(asset_id.clone(), entry.asset.clone(), amount));
            }

            let fee = Decimal::from_str(&entry.fee).map_err(|_| validation("fee", *index))?;
            if !fee.is_zero() {
                fees.push(Fee {
                    asset_id,
                    asset_symbol: entry.asset.clone(),
                    amount: fee.abs(),
                    scope: FeeScope::Platform,
                    settlement: FeeSettlement::Balance,
                });
            }
        }

        let first_index = entries[0].0;
        let datetime = DateTime::from_timestamp_millis(timestamp as i64)
            .ok_or_else(|| validation("timestamp", first_index))?;

        let operation = if types.contains(&LedgerEntryType::Trade) {
            Operation::new(OperationCategory::Trade, "trade")
        } else if types.contains(&LedgerEntryType::Staking) {
            Operation::new(OperationCategory::Staking, "staking_reward")
        } else if types.contains(&LedgerEntryType::Withdrawal) {
            Operation::new(OperationCategory::Transfer, "withdrawal")
        } else if types.contains(&LedgerEntryType::Deposit) {
            Operation::new(OperationCategory::Transfer, "deposit")
        } else if types.contains(&LedgerEntryType::Spend)
            || types.contains(&LedgerEntryType::Receive)
        {
            Operation::new(OperationCategory::Trade, "conversion")
        } else {
            Operation::new(OperationCategory::Transfer, "transfer")
        };

        Ok(ProcessedTransaction {
            external_id: group_id,
            datetime,
            timestamp,
            source: SOURCE.to_owned(),
            source_type: SourceFamily::Exchange,
            status: TransactionStatus::Success,
            from: None,
            to: None,
            movements,
            fees,
            operation,
            notes: Vec::new(),
            blockchain: None,
            is_spam: false,
        })
    }
}

impl Transform for KrakenTransform {
    type Input = LedgerEnvelope;

    fn source(&self) -> &str {
        SOURCE
    }

    fn transform(
        &self,
        batch: Vec<Self::Input>,
        _context: &ProcessingContext,
    ) -> Result<Vec<ProcessedTransaction>, IngestError> {
        let mut groups: IndexMap<String, Vec<(usize, KrakenLedgerEntry)>> = IndexMap::new();
        for (index, envelope) in batch.into_iter().enumerate() {
            let entry = envelope.normalized;
            let key = if entry.ref_id.is_empty() {
                entry.id.clone()
            } else {
                entry.ref_id.clone()
            };
            groups.entry(key).or_default().push((index, entry));
        }

        let mut transactions = Vec::with_capacity(groups.len());
        for (group_id, entries) in groups {
            transactions.push(self.merge(group_id, entries)?);
        }
        Ok(transactions)
    }
}
