use chrono::DateTime;
use indexmap::IndexMap;
use rust_decimal::Decimal;

use tally_common::asset;
use tally_common::transaction::{
    BlockchainInfo, Fee, FeeScope, FeeSettlement, Movement, Movements, Operation,
    OperationCategory, ProcessedTransaction,
};
use tally_common::SourceFamily;

use crate::error::IngestError;
use crate::processor::{ProcessingContext, Transform};
use crate::sources::evm::{EvmMovementKind, EvmTransaction, NATIVE_DECIMALS, NATIVE_SYMBOL};
use crate::sources::{scale_base_units, NormalizedStatus};

fn validation(field: &str, record_index: usize) -> IngestError {
    IngestError::Validation {
        field_path: field.to_owned(),
        record_index,
    }
}

// Derives canonical transactions from normalized EVM rows. The input batch
// is hash-grouped, so all rows of one on-chain transaction (native,
// internal, token) arrive together and merge into a single record.
pub struct EvmTransform {
    chain: String,
}

impl EvmTransform {
    pub fn new(chain: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
        }
    }

    fn merge(
        &self,
        hash: String,
        rows: Vec<(usize, EvmTransaction)>,
        context: &ProcessingContext,
    ) -> Result<ProcessedTransaction, IngestError> {
        let first_index = rows[0].0;
        let base = rows
            .iter()
            .map(|(_, row)| row)
            .find(|row| row.movement == EvmMovementKind::Native)
            .unwrap_or(&rows[0].1);
        let base_from = base.from.clone();
        let base_to = base.to.clone();
        let base_status = base.status;
        let timestamp = base.timestamp;
        let block_height = base.block_height;

        let datetime = DateTime::from_timestamp_millis(timestamp as i64)
            .ok_or_else(|| validation("timestamp", first_index))?;

        let mut movements = Movements::default();
        let mut fees = Vec::new();
        let mut has_token = false;

        for (index, row) in &rows {
            match row.movement {
                EvmMovementKind::Native | EvmMovementKind::Internal => {
                    let amount = scale_base_units(&row.value, NATIVE_DECIMALS)
                        .ok_or_else(|| validation("value", *index))?;
                    if row.status == NormalizedStatus::Success && !amount.is_zero() {
                        let asset_id = asset::native(&self.chain);
                        if context.owns_address(&row.from) {
                            movements.outflows.push(Movement::new(
                                asset_id.clone(),
                                NATIVE_SYMBOL,
                                amount,
                            ));
                        }
                        if let Some(to) = &row.to {
                            if context.owns_address(to) {
                                movements
                                    .inflows
                                    .push(Movement::new(asset_id, NATIVE_SYMBOL, amount));
                            }
                        }
                    }

                    // the sender pays gas whether or not the call succeeded
                    if row.movement == EvmMovementKind::Native {
                        if let Some(fee) = &row.fee {
                            if context.owns_address(&row.from) {
                                let amount = scale_base_units(fee, NATIVE_DECIMALS)
                                    .ok_or_else(|| validation("fee", *index))?;
                                fees.push(Fee {
                                    asset_id: asset::native(&self.chain),
                                    asset_symbol: NATIVE_SYMBOL.to_owned(),
                                    amount,
                                    scope: FeeScope::Network,
                                    settlement: FeeSettlement::OnChain,
                                });
                            }
                        }
                    }
                }
                EvmMovementKind::Token => {
                    has_token = true;
                    let token = row
                        .token
                        .as_ref()
                        .ok_or_else(|| validation("token", *index))?;
                    let amount = scale_base_units(&row.value, token.decimals)
                        .ok_or_else(|| validation("value", *index))?;
                    let asset_id = asset::token(&self.chain, &token.contract);
                    if context.owns_address(&row.from) {
                        movements
                            .outflows
                            .push(Movement::new(asset_id.clone(), token.symbol.clone(), amount));
                    }
                    if let Some(to) = &row.to {
                        if context.owns_address(to) {
                            movements
                                .inflows
                                .push(Movement::new(asset_id, token.symbol.clone(), amount));
                        }
                    }
                }
            }
        }

        let mut notes = Vec::new();
        if movements.is_empty() && fees.is_empty() {
            // record the transaction with zero impact rather than dropping it
            let movement = Movement::new(asset::native(&self.chain), NATIVE_SYMBOL, Decimal::ZERO);
            if context.owns_address(&base_from) {
                movements.outflows.push(movement);
            } else {
                movements.inflows.push(movement);
            }
            notes.push(if base_status == NormalizedStatus::Failed {
                "failed transaction".to_owned()
            } else {
                "no balance impact".to_owned()
            });
        }

        let operation = if has_token
            && !movements.inflows.is_empty()
            && !movements.outflows.is_empty()
        {
            Operation::new(OperationCategory::Trade, "swap")
        } else if has_token {
            Operation::new(OperationCategory::Transfer, "token_transfer")
        } else if base_to.is_none() {
            Operation::new(OperationCategory::Contract, "contract_deployment")
        } else {
            Operation::new(OperationCategory::Transfer, "transfer")
        };

        Ok(ProcessedTransaction {
            external_id: hash.clone(),
            datetime,
            timestamp,
            source: self.chain.clone(),
            source_type: SourceFamily::Blockchain,
            status: base_status.into(),
            from: Some(base_from),
            to: base_to,
            movements,
            fees,
            operation,
            notes,
            blockchain: Some(BlockchainInfo {
                name: self.chain.clone(),
                block_height: Some(block_height),
                transaction_hash: hash,
                is_confirmed: true,
            }),
            is_spam: false,
        })
    }
}

impl Transform for EvmTransform {
    type Input = EvmTransaction;

    fn source(&self) -> &str {
        &self.chain
    }

    fn transform(
        &self,
        batch: Vec<Self::Input>,
        context: &ProcessingContext,
    ) -> Result<Vec<ProcessedTransaction>, IngestError> {
        let mut groups: IndexMap<String, Vec<(usize, EvmTransaction)>> = IndexMap::new();
        for (index, row) in batch.into_iter().enumerate() {
            groups
                .entry(row.tx_hash.clone())
                .or_default()
                .push((index, row));
        }

        let mut transactions = Vec::with_capacity(groups.len());
        for (hash, rows) in groups {
            transactions.push(self.merge(hash, rows, context)?);
        }
        Ok(transactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{Processor, SchemaProcessor};
    use crate::scam::StaticScamList;
    use crate::sources::evm::EvmToken;
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::str::FromStr;
    use std::sync::Arc;
    use tally_common::transaction::TransactionStatus;

    const USER: &str = "0xuser";
    const OTHER: &str = "0xother";

    fn ctx() -> ProcessingContext {
        ProcessingContext::for_address(USER)
    }

    fn native_row(hash: &str, from: &str, to: &str, value: &str, fee: &str) -> EvmTransaction {
        EvmTransaction {
            id: hash.to_owned(),
            tx_hash: hash.to_owned(),
            chain: "ethereum".into(),
            block_height: 17_000_000,
            timestamp: 1_700_000_000_000,
            from: from.to_owned(),
            to: Some(to.to_owned()),
            value: value.to_owned(),
            fee: Some(fee.to_owned()),
            status: NormalizedStatus::Success,
            movement: EvmMovementKind::Native,
            token: None,
        }
    }

    fn token_row(hash: &str, from: &str, to: &str, value: &str, contract: &str) -> EvmTransaction {
        EvmTransaction {
            id: format!("{}:token:1", hash),
            tx_hash: hash.to_owned(),
            chain: "ethereum".into(),
            block_height: 17_000_000,
            timestamp: 1_700_000_000_000,
            from: from.to_owned(),
            to: Some(to.to_owned()),
            value: value.to_owned(),
            fee: None,
            status: NormalizedStatus::Success,
            movement: EvmMovementKind::Token,
            token: Some(EvmToken {
                contract: contract.to_owned(),
                symbol: "TOK".into(),
                decimals: 6,
            }),
        }
    }

    #[test]
    fn test_outgoing_transfer_has_outflow_and_fee() {
        let transform = EvmTransform::new("ethereum");
        let rows = vec![native_row(
            "0xaaa",
            USER,
            OTHER,
            "1500000000000000000",
            "2100000000000000",
        )];
        let txs = transform.transform(rows, &ctx()).unwrap();
        assert_eq!(txs.len(), 1);

        let tx = &txs[0];
        assert_eq!(tx.status, TransactionStatus::Success);
        assert!(tx.movements.inflows.is_empty());
        assert_eq!(tx.movements.outflows.len(), 1);
        assert_eq!(
            tx.movements.outflows[0].gross_amount,
            Decimal::from_str("1.5").unwrap()
        );
        assert_eq!(tx.fees.len(), 1);
        assert_eq!(tx.fees[0].amount, Decimal::from_str("0.0021").unwrap());
        assert_eq!(tx.operation.kind, "transfer");
        assert_eq!(tx.blockchain.as_ref().unwrap().transaction_hash, "0xaaa");
    }

    #[test]
    fn test_incoming_transfer_has_inflow_and_no_fee() {
        let transform = EvmTransform::new("ethereum");
        let rows = vec![native_row(
            "0xbbb",
            OTHER,
            USER,
            "1000000000000000000",
            "2100000000000000",
        )];
        let txs = transform.transform(rows, &ctx()).unwrap();
        let tx = &txs[0];
        assert_eq!(tx.movements.inflows.len(), 1);
        assert!(tx.movements.outflows.is_empty());
        assert!(tx.fees.is_empty());
    }

    #[test]
    fn test_hash_group_merges_native_and_token_rows() {
        let transform = EvmTransform::new("ethereum");
        let rows = vec![
            native_row("0xccc", USER, "0xrouter", "0", "3000000000000000"),
            token_row("0xccc", USER, OTHER, "2500000", "0xc0ffee"),
        ];
        let txs = transform.transform(rows, &ctx()).unwrap();
        assert_eq!(txs.len(), 1);

        let tx = &txs[0];
        assert_eq!(tx.operation.kind, "token_transfer");
        assert_eq!(tx.movements.outflows.len(), 1);
        assert_eq!(
            tx.movements.outflows[0].asset_id,
            "blockchain:ethereum:0xc0ffee"
        );
        assert_eq!(
            tx.movements.outflows[0].gross_amount,
            Decimal::from_str("2.5").unwrap()
        );
        assert_eq!(tx.fees.len(), 1);
    }

    #[test]
    fn test_swap_classification_on_two_sided_token_flow() {
        let transform = EvmTransform::new("ethereum");
        let rows = vec![
            native_row("0xddd", USER, "0xrouter", "1000000000000000000", "0"),
            token_row("0xddd", "0xpool", USER, "4000000", "0xc0ffee"),
        ];
        let txs = transform.transform(rows, &ctx()).unwrap();
        assert_eq!(txs[0].operation.category.to_string(), "trade");
        assert_eq!(txs[0].operation.kind, "swap");
    }

    #[test]
    fn test_failed_transaction_keeps_fee_only() {
        let transform = EvmTransform::new("ethereum");
        let mut row = native_row(
            "0xeee",
            USER,
            OTHER,
            "1000000000000000000",
            "2100000000000000",
        );
        row.status = NormalizedStatus::Failed;
        let txs = transform.transform(vec![row], &ctx()).unwrap();

        let tx = &txs[0];
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert!(tx.movements.is_empty());
        assert_eq!(tx.fees.len(), 1);
        tx.validate().unwrap();
    }

    #[test]
    fn test_unrelated_failed_transaction_records_zero_impact() {
        let transform = EvmTransform::new("ethereum");
        let mut row = native_row("0xfff", OTHER, USER, "1000000000000000000", "0");
        row.status = NormalizedStatus::Failed;
        let txs = transform.transform(vec![row], &ctx()).unwrap();

        let tx = &txs[0];
        assert_eq!(tx.movements.inflows.len(), 1);
        assert!(tx.movements.inflows[0].gross_amount.is_zero());
        assert_eq!(tx.notes, vec!["failed transaction".to_owned()]);
        tx.validate().unwrap();
    }

    #[test]
    fn test_transform_is_deterministic() {
        let transform = EvmTransform::new("ethereum");
        let rows = || {
            vec![
                native_row("0xccc", USER, "0xrouter", "0", "3000000000000000"),
                token_row("0xccc", USER, OTHER, "2500000", "0xc0ffee"),
            ]
        };
        let first = transform.transform(rows(), &ctx()).unwrap();
        let second = transform.transform(rows(), &ctx()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_schema_processor_rejects_malformed_record() {
        let processor = SchemaProcessor::new(EvmTransform::new("ethereum"));
        let good = serde_json::to_value(native_row(
            "0xaaa",
            USER,
            OTHER,
            "1000000000000000000",
            "0",
        ))
        .unwrap();
        let bad = json!({ "id": "0xbbb" });

        let err = processor.process(&[good, bad], &ctx()).unwrap_err();
        match err {
            IngestError::Validation { record_index, .. } => assert_eq!(record_index, 1),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_spam_contract_is_annotated_not_dropped() {
        let detector = Arc::new(StaticScamList::new(["0xbadc0de"]));
        let processor =
            SchemaProcessor::new(EvmTransform::new("ethereum")).with_scam_detector(detector);

        let row = token_row("0xabc", OTHER, USER, "999000000", "0xbadc0de");
        let value = serde_json::to_value(row).unwrap();
        let txs = processor.process(&[value], &ctx()).unwrap();

        assert_eq!(txs.len(), 1);
        assert!(txs[0].is_spam);
        assert!(txs[0].notes.iter().any(|note| note.contains("0xbadc0de")));
        // movements are intact so balances stay computable
        assert_eq!(txs[0].movements.inflows.len(), 1);
    }
}
