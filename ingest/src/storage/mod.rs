mod accounts;
mod data_sources;
mod provider_state;
mod raw;
mod transactions;

pub use raw::SaveOutcome;

use std::path::Path;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::TransactionError;
use sled::{Db, Tree};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("account {0} not found")]
    AccountNotFound(u64),

    #[error("raw transaction {0} not found")]
    RawNotFound(u64),
}

impl From<TransactionError<StorageError>> for StorageError {
    fn from(e: TransactionError<StorageError>) -> Self {
        match e {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(e) => StorageError::Sled(e),
        }
    }
}

// Persistence for the ingestion engine. Trees stand in for the logical
// tables; index trees enforce the uniqueness contract of raw rows:
//
//   accounts          id -> account
//   data_sources      account_id ++ id -> session (per-account scans)
//   raw_transactions  id -> raw row
//   raw_by_external   account_id ++ external_id -> id    (unique)
//   raw_by_hash       account_id ++ tx_hash -> id        (partial unique)
//   raw_pending       account_id ++ id -> ()             (pending scans)
//   transactions      account_id ++ external_id -> derived row
//   provider_state    health + circuit snapshots
pub struct IngestStorage {
    db: Db,
    pub(crate) accounts: Tree,
    pub(crate) data_sources: Tree,
    pub(crate) raw: Tree,
    pub(crate) raw_by_external: Tree,
    pub(crate) raw_by_hash: Tree,
    pub(crate) raw_pending: Tree,
    pub(crate) transactions: Tree,
    pub(crate) provider_state: Tree,
}

impl IngestStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        debug!("opening storage at {}", path.as_ref().display());
        Self::from_db(sled::open(path)?)
    }

    // In-memory database, removed on drop
    pub fn open_temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        Ok(Self {
            accounts: db.open_tree("accounts")?,
            data_sources: db.open_tree("data_sources")?,
            raw: db.open_tree("raw_transactions")?,
            raw_by_external: db.open_tree("raw_by_external")?,
            raw_by_hash: db.open_tree("raw_by_hash")?,
            raw_pending: db.open_tree("raw_pending")?,
            transactions: db.open_tree("transactions")?,
            provider_state: db.open_tree("provider_state")?,
            db,
        })
    }

    pub async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush_async().await?;
        Ok(())
    }

    pub(crate) fn next_id(&self) -> Result<u64, StorageError> {
        Ok(self.db.generate_id()?)
    }

    pub(crate) fn composite_key(id: u64, rest: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + rest.len());
        key.extend_from_slice(&id.to_be_bytes());
        key.extend_from_slice(rest);
        key
    }

    pub(crate) fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec(value)?)
    }

    pub(crate) fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
