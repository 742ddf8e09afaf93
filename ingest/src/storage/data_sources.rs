use log::trace;

use tally_common::data_source::{DataSource, DataSourceStatus};
use tally_common::time::get_current_time_in_seconds;

use crate::storage::{IngestStorage, StorageError};

impl IngestStorage {
    pub fn create_data_source(&self, account_id: u64) -> Result<DataSource, StorageError> {
        let session = DataSource::new(self.next_id()?, account_id, get_current_time_in_seconds());
        trace!("create data source {} for account {}", session.id, account_id);
        self.update_data_source(&session)?;
        Ok(session)
    }

    pub fn update_data_source(&self, session: &DataSource) -> Result<(), StorageError> {
        let key = Self::composite_key(session.account_id, &session.id.to_be_bytes());
        self.data_sources.insert(key, Self::to_bytes(session)?)?;
        Ok(())
    }

    // Sessions of one account in creation order
    pub fn data_sources_for(&self, account_id: u64) -> Result<Vec<DataSource>, StorageError> {
        self.data_sources
            .scan_prefix(account_id.to_be_bytes())
            .map(|entry| {
                let (_, bytes) = entry?;
                Self::from_bytes(&bytes)
            })
            .collect()
    }

    // Latest session that needs another import run before processing may
    // touch the account: still running (started) or aborted (failed).
    // Resuming it preserves the at-most-one-non-terminal invariant.
    pub fn find_latest_incomplete(
        &self,
        account_id: u64,
    ) -> Result<Option<DataSource>, StorageError> {
        Ok(self
            .data_sources_for(account_id)?
            .into_iter()
            .filter(|session| session.status.blocks_processing())
            .last())
    }

    pub fn has_blocking_data_source(&self, account_id: u64) -> Result<bool, StorageError> {
        Ok(self.find_latest_incomplete(account_id)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_common::data_source::ImportSummary;

    #[test]
    fn test_create_and_list_in_order() {
        let storage = IngestStorage::open_temporary().unwrap();
        let first = storage.create_data_source(7).unwrap();
        let second = storage.create_data_source(7).unwrap();
        storage.create_data_source(8).unwrap();

        let sessions = storage.data_sources_for(7).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, first.id);
        assert_eq!(sessions[1].id, second.id);
        assert_eq!(sessions[0].status, DataSourceStatus::Started);
    }

    #[test]
    fn test_find_latest_incomplete_skips_terminal_success() {
        let storage = IngestStorage::open_temporary().unwrap();
        let mut first = storage.create_data_source(7).unwrap();
        first.status = DataSourceStatus::Completed;
        first.completed_at = Some(first.started_at + 10);
        storage.update_data_source(&first).unwrap();

        assert!(storage.find_latest_incomplete(7).unwrap().is_none());
        assert!(!storage.has_blocking_data_source(7).unwrap());

        let second = storage.create_data_source(7).unwrap();
        let found = storage.find_latest_incomplete(7).unwrap().unwrap();
        assert_eq!(found.id, second.id);
        assert!(storage.has_blocking_data_source(7).unwrap());
    }

    #[test]
    fn test_failed_session_blocks_and_is_resumable() {
        let storage = IngestStorage::open_temporary().unwrap();
        let mut session = storage.create_data_source(7).unwrap();
        session.status = DataSourceStatus::Failed;
        session.error_message = Some("provider down".into());
        session.import_result = ImportSummary {
            transactions_imported: 40,
            ..Default::default()
        };
        storage.update_data_source(&session).unwrap();

        let found = storage.find_latest_incomplete(7).unwrap().unwrap();
        assert_eq!(found.import_result.transactions_imported, 40);
        assert!(storage.has_blocking_data_source(7).unwrap());
    }

    #[test]
    fn test_completed_with_warnings_does_not_block() {
        let storage = IngestStorage::open_temporary().unwrap();
        let mut session = storage.create_data_source(7).unwrap();
        session.status = DataSourceStatus::CompletedWithWarnings;
        session.error_message = Some("3 batch warnings".into());
        storage.update_data_source(&session).unwrap();

        assert!(!storage.has_blocking_data_source(7).unwrap());
        assert!(storage.find_latest_incomplete(7).unwrap().is_none());
    }
}
