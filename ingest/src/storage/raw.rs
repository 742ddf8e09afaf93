use log::trace;
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;

use tally_common::raw::{NewRawTransaction, ProcessingStatus, RawTransaction};
use tally_common::time::get_current_time_in_seconds;

use crate::storage::{IngestStorage, StorageError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOutcome {
    pub inserted: u64,
    pub skipped: u64,
}

impl IngestStorage {
    // Persist one import batch atomically. Rows violating the per-account
    // uniqueness of external_id or tx_hash are counted as skipped, never
    // treated as failures, and never overwrite the existing row.
    pub fn save_raw_batch(
        &self,
        data_source_id: u64,
        account_id: u64,
        rows: &[NewRawTransaction],
    ) -> Result<SaveOutcome, StorageError> {
        trace!(
            "save batch of {} raw rows for account {}",
            rows.len(),
            account_id
        );
        if rows.is_empty() {
            return Ok(SaveOutcome::default());
        }

        let created_at = get_current_time_in_seconds();
        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            // ids assigned up front; ids of skipped rows stay unused
            prepared.push((self.next_id()?, row));
        }

        let outcome = (
            &self.raw,
            &self.raw_by_external,
            &self.raw_by_hash,
            &self.raw_pending,
        )
            .transaction(|(raw_t, ext_t, hash_t, pending_t)| {
                let mut inserted = 0u64;
                let mut skipped = 0u64;

                for (id, row) in &prepared {
                    let ext_key = Self::composite_key(account_id, row.external_id.as_bytes());
                    if ext_t.get(ext_key.as_slice())?.is_some() {
                        skipped += 1;
                        continue;
                    }

                    if let Some(hash) = &row.tx_hash {
                        let hash_key = Self::composite_key(account_id, hash.as_bytes());
                        if hash_t.get(hash_key.as_slice())?.is_some() {
                            skipped += 1;
                            continue;
                        }
                        hash_t.insert(hash_key, id.to_be_bytes().to_vec())?;
                    }

                    let record = RawTransaction {
                        id: *id,
                        data_source_id,
                        account_id,
                        external_id: row.external_id.clone(),
                        tx_hash: row.tx_hash.clone(),
                        provider_data: row.provider_data.clone(),
                        normalized_data: row.normalized_data.clone(),
                        processing_status: ProcessingStatus::Pending,
                        stream_type: row.stream_type.clone(),
                        created_at,
                    };
                    let bytes = serde_json::to_vec(&record).map_err(|e| {
                        ConflictableTransactionError::Abort(StorageError::Serde(e))
                    })?;

                    raw_t.insert(id.to_be_bytes().to_vec(), bytes)?;
                    ext_t.insert(ext_key, id.to_be_bytes().to_vec())?;
                    pending_t.insert(
                        Self::composite_key(account_id, &id.to_be_bytes()),
                        Vec::new(),
                    )?;
                    inserted += 1;
                }

                Ok(SaveOutcome { inserted, skipped })
            })?;

        Ok(outcome)
    }

    pub fn get_raw(&self, id: u64) -> Result<RawTransaction, StorageError> {
        self.raw
            .get(id.to_be_bytes())?
            .map(|bytes| Self::from_bytes(&bytes))
            .transpose()?
            .ok_or(StorageError::RawNotFound(id))
    }

    // Unprocessed rows of one account in insertion order
    pub fn pending_raw_rows(
        &self,
        account_id: u64,
        limit: Option<usize>,
    ) -> Result<Vec<RawTransaction>, StorageError> {
        let mut rows = Vec::new();
        for entry in self.raw_pending.scan_prefix(account_id.to_be_bytes()) {
            let (key, _) = entry?;
            let mut id_bytes = [0u8; 8];
            id_bytes.copy_from_slice(&key[8..16]);
            rows.push(self.get_raw(u64::from_be_bytes(id_bytes))?);
            if let Some(limit) = limit {
                if rows.len() >= limit {
                    break;
                }
            }
        }
        Ok(rows)
    }

    pub fn raw_rows_for_account(
        &self,
        account_id: u64,
    ) -> Result<Vec<RawTransaction>, StorageError> {
        let mut rows = Vec::new();
        for entry in self.raw_by_external.scan_prefix(account_id.to_be_bytes()) {
            let (_, id_bytes) = entry?;
            let mut id = [0u8; 8];
            id.copy_from_slice(&id_bytes);
            rows.push(self.get_raw(u64::from_be_bytes(id))?);
        }
        Ok(rows)
    }

    pub fn raw_count(&self, account_id: u64) -> Result<u64, StorageError> {
        let mut count = 0u64;
        for entry in self.raw_by_external.scan_prefix(account_id.to_be_bytes()) {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}
