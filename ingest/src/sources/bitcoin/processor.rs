use chrono::DateTime;
use rust_decimal::Decimal;

use tally_common::asset;
use tally_common::transaction::{
    BlockchainInfo, Fee, FeeScope, FeeSettlement, Movement, Movements, Operation,
    OperationCategory, ProcessedTransaction, TransactionStatus,
};
use tally_common::SourceFamily;

use crate::error::IngestError;
use crate::processor::{ProcessingContext, Transform};
use crate::sources::bitcoin::{BitcoinTransaction, CHAIN, NATIVE_DECIMALS, NATIVE_SYMBOL};
use crate::sources::scale_base_units;

fn validation(field: &str, record_index: usize) -> IngestError {
    IngestError::Validation {
        field_path: field.to_owned(),
        record_index,
    }
}

fn sats_to_btc(sats: u64, field: &str, record_index: usize) -> Result<Decimal, IngestError> {
    scale_base_units(&sats.to_string(), NATIVE_DECIMALS)
        .ok_or_else(|| validation(field, record_index))
}

// UTXO fund-flow derivation: what the user's addresses funded versus what
// they received decides the direction, change flowing back to the user is
// netted out, and the mining fee is attributed to the funder.
#[derive(Default)]
pub struct BitcoinTransform;

impl BitcoinTransform {
    pub fn new() -> Self {
        Self
    }

    fn derive(
        &self,
        index: usize,
        row: BitcoinTransaction,
        context: &ProcessingContext,
    ) -> Result<ProcessedTransaction, IngestError> {
        let owns = |address: &Option<String>| {
            address
                .as_deref()
                .map(|a| context.owns_address(a))
                .unwrap_or(false)
        };

        let spent: u64 = row
            .inputs
            .iter()
            .filter(|side| owns(&side.address))
            .map(|side| side.value)
            .sum();
        let received: u64 = row
            .outputs
            .iter()
            .filter(|side| owns(&side.address))
            .map(|side| side.value)
            .sum();
        let user_funded = spent > 0;

        let datetime = DateTime::from_timestamp_millis(row.timestamp as i64)
            .ok_or_else(|| validation("timestamp", index))?;

        let mut movements = Movements::default();
        let mut fees = Vec::new();
        let mut notes = Vec::new();
        let asset_id = asset::native(CHAIN);

        if user_funded {
            fees.push(Fee {
                asset_id: asset_id.clone(),
                asset_symbol: NATIVE_SYMBOL.to_owned(),
                amount: sats_to_btc(row.fee, "fee", index)?,
                scope: FeeScope::Network,
                settlement: FeeSettlement::OnChain,
            });
        }

        // change back to the user and the fee are netted out of the send
        let sent_to_others = spent
            .saturating_sub(received)
            .saturating_sub(if user_funded { row.fee } else { 0 });

        let operation = if user_funded && sent_to_others > 0 {
            movements.outflows.push(Movement::new(
                asset_id.clone(),
                NATIVE_SYMBOL,
                sats_to_btc(sent_to_others, "value", index)?,
            ));
            Operation::new(OperationCategory::Transfer, "send")
        } else if !user_funded && received > 0 {
            movements.inflows.push(Movement::new(
                asset_id.clone(),
                NATIVE_SYMBOL,
                sats_to_btc(received, "value", index)?,
            ));
            Operation::new(OperationCategory::Transfer, "receive")
        } else if user_funded {
            notes.push("self transfer".to_owned());
            Operation::new(OperationCategory::Transfer, "self_transfer")
        } else {
            // indexed for the account but with no owned side; keep it
            // with zero impact rather than dropping it
            movements
                .inflows
                .push(Movement::new(asset_id.clone(), NATIVE_SYMBOL, Decimal::ZERO));
            notes.push("no balance impact".to_owned());
            Operation::new(OperationCategory::Other, "unrelated")
        };

        let from = row.inputs.iter().find_map(|side| side.address.clone());
        let to = row.outputs.iter().find_map(|side| side.address.clone());

        Ok(ProcessedTransaction {
            external_id: row.id,
            datetime,
            timestamp: row.timestamp,
            source: CHAIN.to_owned(),
            source_type: SourceFamily::Blockchain,
            status: TransactionStatus::Success,
            from,
            to,
            movements,
            fees,
            operation,
            notes,
            blockchain: Some(BlockchainInfo {
                name: CHAIN.to_owned(),
                block_height: Some(row.block_height),
                transaction_hash: row.tx_hash,
                is_confirmed: true,
            }),
            is_spam: false,
        })
    }
}

impl Transform for BitcoinTransform {
    type Input = BitcoinTransaction;

    fn source(&self) -> &str {
        CHAIN
    }

    fn transform(
        &self,
        batch: Vec<Self::Input>,
        context: &ProcessingContext,
    ) -> Result<Vec<ProcessedTransaction>, IngestError> {
        batch
            .into_iter()
            .enumerate()
            .map(|(index, row)| self.derive(index, row, context))
            .collect()
    }
}
