use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::task::yield_now;

use tally_common::account::Account;
use tally_common::data_source::{DataSource, DataSourceStatus, ImportSummary};
use tally_common::events::{EventBus, IngestEvent};
use tally_common::time::get_current_time_in_seconds;

use crate::error::IngestError;
use crate::importer::{ImportParams, Importer};
use crate::provider::manager::ProviderManager;
use crate::sources::AdapterRegistry;
use crate::storage::IngestStorage;

#[derive(Debug, Clone, Copy)]
pub struct ImportOutcome {
    pub data_source_id: u64,
    pub status: DataSourceStatus,
    pub summary: ImportSummary,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unexpected panic".to_owned()
    }
}

// Per-account streaming import loop: session lifecycle, batch persistence,
// cursor advancement, finalization. This shell is the only place where an
// unexpected panic is caught; it finalizes the session as failed and comes
// back as a typed error.
pub struct ImportOrchestrator {
    storage: Arc<IngestStorage>,
    adapters: Arc<AdapterRegistry>,
    manager: Arc<ProviderManager>,
    events: EventBus,
}

impl ImportOrchestrator {
    pub fn new(
        storage: Arc<IngestStorage>,
        adapters: Arc<AdapterRegistry>,
        manager: Arc<ProviderManager>,
        events: EventBus,
    ) -> Self {
        Self {
            storage,
            adapters,
            manager,
            events,
        }
    }

    pub async fn import_account(&self, account_id: u64) -> Result<ImportOutcome, IngestError> {
        let account = self.storage.get_account(account_id)?;
        let adapter = self.adapters.get(&account.source_name)?;

        // resume check: at most one non-terminal session per account
        let mut session = match self.storage.find_latest_incomplete(account_id)? {
            Some(mut existing) => {
                debug!(
                    "resuming import session {} for account {} ({} already imported)",
                    existing.id, account_id, existing.import_result.transactions_imported
                );
                existing.status = DataSourceStatus::Started;
                existing.completed_at = None;
                existing.error_message = None;
                self.storage.update_data_source(&existing)?;
                existing
            }
            None => self.storage.create_data_source(account_id)?,
        };

        let importer =
            adapter.create_importer(Arc::clone(&self.manager), account.provider_name.as_deref())?;

        let result = match AssertUnwindSafe(self.run_stream(&account, &mut session, importer))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(IngestError::ImportAborted(panic_message(panic.as_ref()))),
        };

        let now = get_current_time_in_seconds();
        match result {
            Ok(summary) => {
                session.import_result = summary;
                session.completed_at = Some(now);
                if summary.warnings > 0 {
                    session.status = DataSourceStatus::CompletedWithWarnings;
                    session.error_message = Some(format!("{} batch warnings", summary.warnings));
                } else {
                    session.status = DataSourceStatus::Completed;
                    session.error_message = None;
                }
                self.storage.update_data_source(&session)?;
                self.manager.persist_stats().await;

                info!(
                    "import for account {} {}: {} imported, {} duplicates skipped",
                    account_id, session.status, summary.transactions_imported,
                    summary.duplicates_skipped
                );
                Ok(ImportOutcome {
                    data_source_id: session.id,
                    status: session.status,
                    summary,
                })
            }
            Err(e) => {
                session.status = DataSourceStatus::Failed;
                session.completed_at = Some(now);
                session.error_message = Some(e.to_string());
                // best-effort: the import error is what gets surfaced
                if let Err(save_err) = self.storage.update_data_source(&session) {
                    error!(
                        "failed to finalize session {} as failed: {}",
                        session.id, save_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_stream(
        &self,
        account: &Account,
        session: &mut DataSource,
        importer: Arc<dyn Importer>,
    ) -> Result<ImportSummary, IngestError> {
        // a resumed session keeps its running totals
        let mut summary = session.import_result;

        let mut stream = importer.import_streaming(ImportParams {
            account: account.clone(),
        });

        while let Some(next) = stream.next().await {
            // a batch-level error is terminal for this import
            let batch = next?;

            let outcome =
                self.storage
                    .save_raw_batch(session.id, account.id, &batch.raw_transactions)?;

            summary.transactions_imported += outcome.inserted;
            summary.duplicates_skipped += outcome.skipped;
            summary.batches += 1;
            summary.warnings += batch.warnings.len() as u64;
            for warning in &batch.warnings {
                warn!("import warning for account {}: {}", account.id, warning);
            }

            self.events.emit(IngestEvent::ImportBatchSaved {
                account_id: account.id,
                stream_type: batch.operation_type.clone(),
                inserted: outcome.inserted,
                skipped: outcome.skipped,
            });

            // a lost cursor only costs a redundant re-fetch next run;
            // deduplication absorbs it
            if let Err(e) = self.storage.update_account_cursor(
                account.id,
                &batch.operation_type,
                &batch.cursor,
            ) {
                warn!(
                    "failed to persist cursor for account {} stream {}: {}",
                    account.id, batch.operation_type, e
                );
            }

            session.import_result = summary;
            self.storage.update_data_source(session)?;

            // let progress events flush before the next batch
            yield_now().await;
        }

        Ok(summary)
    }
}
