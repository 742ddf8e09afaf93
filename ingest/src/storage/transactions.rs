use log::trace;
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;

use tally_common::raw::{ProcessingStatus, RawTransaction};
use tally_common::transaction::ProcessedTransaction;

use crate::storage::{IngestStorage, StorageError};

impl IngestStorage {
    // Persist derived rows and mark their raw rows processed in one
    // transaction: a crash leaves the whole batch pending, never half.
    // Reprocessing overwrites derived rows in place (they are keyed by
    // external id), which keeps the derivation replayable.
    pub fn save_processed_batch(
        &self,
        account_id: u64,
        transactions: &[ProcessedTransaction],
        raw_ids: &[u64],
    ) -> Result<(), StorageError> {
        trace!(
            "save {} derived rows, marking {} raw rows",
            transactions.len(),
            raw_ids.len()
        );

        (&self.transactions, &self.raw, &self.raw_pending)
            .transaction(|(tx_t, raw_t, pending_t)| {
                for transaction in transactions {
                    let key =
                        Self::composite_key(account_id, transaction.external_id.as_bytes());
                    let bytes = serde_json::to_vec(transaction).map_err(|e| {
                        ConflictableTransactionError::Abort(StorageError::Serde(e))
                    })?;
                    tx_t.insert(key, bytes)?;
                }

                for id in raw_ids {
                    let key = id.to_be_bytes();
                    let bytes = raw_t.get(key)?.ok_or(ConflictableTransactionError::Abort(
                        StorageError::RawNotFound(*id),
                    ))?;
                    let mut row: RawTransaction = serde_json::from_slice(&bytes).map_err(|e| {
                        ConflictableTransactionError::Abort(StorageError::Serde(e))
                    })?;
                    row.processing_status = ProcessingStatus::Processed;
                    let bytes = serde_json::to_vec(&row).map_err(|e| {
                        ConflictableTransactionError::Abort(StorageError::Serde(e))
                    })?;
                    raw_t.insert(key.to_vec(), bytes)?;
                    pending_t.remove(Self::composite_key(account_id, &key))?;
                }

                Ok(())
            })?;

        Ok(())
    }

    pub fn get_transaction(
        &self,
        account_id: u64,
        external_id: &str,
    ) -> Result<Option<ProcessedTransaction>, StorageError> {
        self.transactions
            .get(Self::composite_key(account_id, external_id.as_bytes()))?
            .map(|bytes| Self::from_bytes(&bytes))
            .transpose()
    }

    pub fn transactions_for_account(
        &self,
        account_id: u64,
    ) -> Result<Vec<ProcessedTransaction>, StorageError> {
        self.transactions
            .scan_prefix(account_id.to_be_bytes())
            .map(|entry| {
                let (_, bytes) = entry?;
                Self::from_bytes(&bytes)
            })
            .collect()
    }
}
