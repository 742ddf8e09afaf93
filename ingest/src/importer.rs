use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures::{Stream, StreamExt};
use log::trace;

use tally_common::account::Account;
use tally_common::cursor::CursorState;
use tally_common::raw::NewRawTransaction;

use crate::error::IngestError;
use crate::provider::manager::ProviderManager;
use crate::provider::{OperationKind, StreamOperation};

// A persistence unit: the orchestrator writes and commits every batch
// atomically, then persists its cursor.
#[derive(Debug, Clone)]
pub struct ImportBatch {
    pub raw_transactions: Vec<NewRawTransaction>,
    // Stream this batch belongs to; names the cursor slot on the account
    pub operation_type: String,
    pub cursor: CursorState,
    pub is_complete: bool,
    // Tolerated row-level problems; surfaced as completed_with_warnings
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ImportParams {
    pub account: Account,
}

pub type ImportStream = Pin<Box<dyn Stream<Item = Result<ImportBatch, IngestError>> + Send>>;

// Per-source lazy producer of import batches. Streaming is the only
// supported shape; non-streaming sources are rejected at creation time.
pub trait Importer: Send + Sync {
    fn import_streaming(self: Arc<Self>, params: ImportParams) -> ImportStream;
}

// Generic blockchain importer: runs each configured address stream through
// the provider manager and converts provider items into raw rows.
pub struct ChainImporter {
    manager: Arc<ProviderManager>,
    domain: String,
    operations: Vec<OperationKind>,
    preferred_provider: Option<String>,
}

impl ChainImporter {
    pub fn new(
        manager: Arc<ProviderManager>,
        domain: impl Into<String>,
        operations: Vec<OperationKind>,
        preferred_provider: Option<String>,
    ) -> Self {
        Self {
            manager,
            domain: domain.into(),
            operations,
            preferred_provider,
        }
    }
}

impl Importer for ChainImporter {
    fn import_streaming(self: Arc<Self>, params: ImportParams) -> ImportStream {
        Box::pin(stream! {
            let address = params.account.identifier.clone();

            for kind in self.operations.clone() {
                let operation = match StreamOperation::for_address(kind, &address) {
                    Some(operation) => operation,
                    None => continue,
                };
                let stream_type = operation.stream_type().to_owned();
                trace!(
                    "importing {} stream for account {}",
                    stream_type,
                    params.account.id
                );

                let resume = params.account.cursor_for(&stream_type).cloned();
                let mut inner = self.manager.execute_streaming(
                    &self.domain,
                    operation,
                    resume,
                    self.preferred_provider.clone(),
                );

                while let Some(result) = inner.next().await {
                    match result {
                        Ok(batch) => {
                            let raw_transactions: Vec<NewRawTransaction> = batch
                                .items
                                .into_iter()
                                .map(|item| NewRawTransaction {
                                    external_id: item.external_id,
                                    tx_hash: item.tx_hash,
                                    provider_data: item.raw,
                                    normalized_data: item.normalized,
                                    stream_type: stream_type.clone(),
                                })
                                .collect();
                            let is_complete = batch.is_complete;

                            yield Ok(ImportBatch {
                                raw_transactions,
                                operation_type: stream_type.clone(),
                                cursor: batch.cursor,
                                is_complete,
                                warnings: Vec::new(),
                            });

                            if is_complete {
                                break;
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
        })
    }
}
