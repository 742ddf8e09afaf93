use log::trace;

use tally_common::account::{Account, AccountType, Credentials};
use tally_common::cursor::CursorState;

use crate::storage::{IngestStorage, StorageError};

impl IngestStorage {
    // Accounts are owned by the account manager upstream; this is the
    // creation seam it goes through.
    pub fn create_account(
        &self,
        account_type: AccountType,
        source_name: &str,
        identifier: &str,
        provider_name: Option<String>,
        credentials: Option<Credentials>,
    ) -> Result<Account, StorageError> {
        let account = Account {
            id: self.next_id()?,
            account_type,
            source_name: source_name.to_lowercase(),
            identifier: identifier.to_owned(),
            provider_name,
            credentials,
            last_cursor: Default::default(),
        };
        self.put_account(&account)?;
        Ok(account)
    }

    pub fn put_account(&self, account: &Account) -> Result<(), StorageError> {
        trace!("put account {}", account.id);
        self.accounts
            .insert(account.id.to_be_bytes().to_vec(), Self::to_bytes(account)?)?;
        Ok(())
    }

    pub fn get_account(&self, account_id: u64) -> Result<Account, StorageError> {
        self.accounts
            .get(account_id.to_be_bytes())?
            .map(|bytes| Self::from_bytes(&bytes))
            .transpose()?
            .ok_or(StorageError::AccountNotFound(account_id))
    }

    // The core only ever advances one cursor slot at a time
    pub fn update_account_cursor(
        &self,
        account_id: u64,
        stream_type: &str,
        cursor: &CursorState,
    ) -> Result<(), StorageError> {
        trace!("update cursor {}/{}", account_id, stream_type);
        let mut account = self.get_account(account_id)?;
        account
            .last_cursor
            .insert(stream_type.to_owned(), cursor.clone());
        self.put_account(&account)
    }
}
