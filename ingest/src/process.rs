use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use log::{debug, info, trace};
use serde_json::{json, Value};
use tokio::task::yield_now;

use tally_common::account::SourceFamily;
use tally_common::events::{EventBus, IngestEvent};
use tally_common::raw::RawTransaction;

use crate::config::{EXCHANGE_PROCESS_BATCH_SIZE, HASH_GROUP_TARGET_SIZE};
use crate::error::IngestError;
use crate::processor::ProcessingContext;
use crate::sources::{AdapterRegistry, ProcessorDeps};
use crate::storage::IngestStorage;

// Feeds pending raw rows to the processor in batches. Implementations
// decide the batch shape; the service only drives the loop.
pub trait RawBatchProvider: Send {
    fn next_batch(&mut self) -> Result<Vec<RawTransaction>, IngestError>;
}

// Default blockchain strategy: rows sharing a transaction hash are never
// split across batches, so multi-row transactions keep their correlation.
pub struct HashGroupedBatches {
    storage: Arc<IngestStorage>,
    groups: VecDeque<Vec<u64>>,
    target_size: usize,
}

impl HashGroupedBatches {
    pub fn new(
        storage: Arc<IngestStorage>,
        account_id: u64,
        target_size: usize,
    ) -> Result<Self, IngestError> {
        let rows = storage.pending_raw_rows(account_id, None)?;
        let mut groups: IndexMap<String, Vec<u64>> = IndexMap::new();
        for row in rows {
            groups.entry(row.correlation_key()).or_default().push(row.id);
        }
        debug!(
            "hash grouping: {} pending groups for account {}",
            groups.len(),
            account_id
        );
        Ok(Self {
            storage,
            groups: groups.into_values().collect(),
            target_size,
        })
    }
}

impl RawBatchProvider for HashGroupedBatches {
    fn next_batch(&mut self) -> Result<Vec<RawTransaction>, IngestError> {
        let mut batch = Vec::new();
        while let Some(group) = self.groups.pop_front() {
            for id in group {
                batch.push(self.storage.get_raw(id)?);
            }
            if batch.len() >= self.target_size {
                break;
            }
        }
        Ok(batch)
    }
}

// Default exchange strategy: pending rows in insertion order, bounded.
// Rows leave the pending index as they are marked processed, so each call
// sees what is left.
pub struct AllAtOnceBatches {
    storage: Arc<IngestStorage>,
    account_id: u64,
    limit: usize,
}

impl AllAtOnceBatches {
    pub fn new(storage: Arc<IngestStorage>, account_id: u64, limit: usize) -> Self {
        Self {
            storage,
            account_id,
            limit,
        }
    }
}

impl RawBatchProvider for AllAtOnceBatches {
    fn next_batch(&mut self) -> Result<Vec<RawTransaction>, IngestError> {
        Ok(self
            .storage
            .pending_raw_rows(self.account_id, Some(self.limit))?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub batches: u64,
    pub raw_rows_processed: u64,
    pub transactions_created: u64,
}

// Drives the derived phase for one account: guard, processor, batches,
// atomic persist-and-mark.
pub struct ProcessService {
    storage: Arc<IngestStorage>,
    adapters: Arc<AdapterRegistry>,
    deps: ProcessorDeps,
    events: EventBus,
}

impl ProcessService {
    pub fn new(
        storage: Arc<IngestStorage>,
        adapters: Arc<AdapterRegistry>,
        deps: ProcessorDeps,
        events: EventBus,
    ) -> Self {
        Self {
            storage,
            adapters,
            deps,
            events,
        }
    }

    pub async fn process_account(&self, account_id: u64) -> Result<ProcessSummary, IngestError> {
        trace!("process account {}", account_id);
        let account = self.storage.get_account(account_id)?;

        // deriving over a half-imported raw set would corrupt the result
        if self.storage.has_blocking_data_source(account_id)? {
            return Err(IngestError::IncompleteImportBlocksProcessing(account_id));
        }

        let adapter = self.adapters.get(&account.source_name)?;
        let processor = adapter.create_processor(&self.deps)?;
        let family = account.account_type.family();
        let context = match family {
            SourceFamily::Blockchain => ProcessingContext::for_address(&account.identifier),
            SourceFamily::Exchange => ProcessingContext::empty(),
        };

        let mut batches: Box<dyn RawBatchProvider> =
            match adapter.create_batch_provider(Arc::clone(&self.storage), account_id) {
                Some(custom) => custom,
                None => match family {
                    SourceFamily::Blockchain => Box::new(HashGroupedBatches::new(
                        Arc::clone(&self.storage),
                        account_id,
                        HASH_GROUP_TARGET_SIZE,
                    )?),
                    SourceFamily::Exchange => Box::new(AllAtOnceBatches::new(
                        Arc::clone(&self.storage),
                        account_id,
                        EXCHANGE_PROCESS_BATCH_SIZE,
                    )),
                },
            };

        let mut summary = ProcessSummary::default();
        loop {
            let rows = batches.next_batch()?;
            if rows.is_empty() {
                break;
            }

            self.events.emit(IngestEvent::ProcessBatchStarted {
                account_id,
                source: account.source_name.clone(),
                size: rows.len(),
            });
            let started = Instant::now();

            // blockchains are processed from their normalization directly,
            // exchange rows travel in the raw/normalized envelope
            let values: Vec<Value> = rows
                .iter()
                .map(|row| match family {
                    SourceFamily::Blockchain => row.normalized_data.clone(),
                    SourceFamily::Exchange => json!({
                        "raw": row.provider_data,
                        "normalized": row.normalized_data,
                        "event_id": row.external_id,
                    }),
                })
                .collect();

            // a processor error aborts the account with nothing marked
            let transactions = processor.process(&values, &context)?;

            let ids: Vec<u64> = rows.iter().map(|row| row.id).collect();
            self.storage
                .save_processed_batch(account_id, &transactions, &ids)?;

            summary.batches += 1;
            summary.raw_rows_processed += ids.len() as u64;
            summary.transactions_created += transactions.len() as u64;

            self.events.emit(IngestEvent::ProcessBatchCompleted {
                account_id,
                source: account.source_name.clone(),
                produced: transactions.len(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            });

            yield_now().await;
        }

        info!(
            "processed account {}: {} raw rows -> {} transactions",
            account_id, summary.raw_rows_processed, summary.transactions_created
        );
        Ok(summary)
    }
}
