mod api;
mod csv;
mod processor;

pub use api::{kraken_api_metadata, KrakenLedgerFetcher};
pub use csv::{collect_csv_files, read_ledger_file, CSV_STREAM_TYPE};
pub use processor::KrakenTransform;

use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tally_common::account::{AccountType, SourceFamily};
use tally_common::events::EventBus;
use tally_common::raw::NewRawTransaction;
use tally_common::time::TimestampMillis;

use crate::error::IngestError;
use crate::importer::{ImportBatch, ImportParams, ImportStream, Importer};
use crate::processor::{Processor, SchemaProcessor};
use crate::provider::manager::ProviderManager;
use crate::provider::streaming::paged_stream;
use crate::provider::StreamOperation;
use crate::sources::{ProcessorDeps, SourceAdapter};

pub const SOURCE: &str = "kraken";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    Deposit,
    Withdrawal,
    Trade,
    Staking,
    Spend,
    Receive,
    Transfer,
    #[serde(other)]
    Other,
}

// Provider-neutral normalization of one Kraken ledger entry. Amounts are
// signed decimal strings exactly as the exchange reports them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KrakenLedgerEntry {
    pub id: String,
    pub ref_id: String,
    pub timestamp: TimestampMillis,
    pub entry_type: LedgerEntryType,
    pub asset: String,
    pub amount: String,
    pub fee: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<String>,
}

// Envelope handed to the processor for exchange rows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEnvelope {
    pub raw: Value,
    pub normalized: KrakenLedgerEntry,
    pub event_id: String,
}

// Kraken reports assets with legacy X/Z prefixes (XXBT, ZUSD)
pub fn normalize_asset(asset: &str) -> String {
    let upper = asset.to_uppercase();
    let stripped = if upper.len() == 4 && (upper.starts_with('X') || upper.starts_with('Z')) {
        upper[1..].to_owned()
    } else {
        upper
    };
    match stripped.as_str() {
        "XBT" => "BTC".to_owned(),
        "XDG" => "DOGE".to_owned(),
        other => other.to_owned(),
    }
}

// Streams the exchange ledger: through the REST API for api accounts, or
// from CSV export directories (one file per batch) for csv accounts.
pub struct KrakenImporter {
    events: EventBus,
}

impl KrakenImporter {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }
}

impl Importer for KrakenImporter {
    fn import_streaming(self: Arc<Self>, params: ImportParams) -> ImportStream {
        Box::pin(stream! {
            match params.account.account_type {
                AccountType::ExchangeApi => {
                    let credentials = params.account.credentials.clone().unwrap_or_default();
                    let fetcher =
                        match KrakenLedgerFetcher::new(&credentials, self.events.clone()) {
                            Ok(fetcher) => Arc::new(fetcher),
                            Err(e) => {
                                yield Err(IngestError::Provider(e));
                                return;
                            }
                        };

                    let resume = params.account.cursor_for("ledger").cloned();
                    let mut inner =
                        paged_stream(fetcher, StreamOperation::LedgerEntries, resume);
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
                                        stream_type: "ledger".to_owned(),
                                    })
                                    .collect();
                                let is_complete = batch.is_complete;
                                yield Ok(ImportBatch {
                                    raw_transactions,
                                    operation_type: "ledger".to_owned(),
                                    cursor: batch.cursor,
                                    is_complete,
                                    warnings: Vec::new(),
                                });
                                if is_complete {
                                    return;
                                }
                            }
                            Err(e) => {
                                yield Err(IngestError::Provider(e));
                                return;
                            }
                        }
                    }
                }
                AccountType::ExchangeCsv => {
                    let directories = params.account.csv_directories();
                    let files = match collect_csv_files(&directories) {
                        Ok(files) => files,
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    };
                    debug!("importing {} csv files for kraken", files.len());

                    let total = files.len();
                    for (index, file) in files.into_iter().enumerate() {
                        trace!("reading {}", file.display());
                        match read_ledger_file(&file) {
                            Ok((rows, warnings, cursor)) => {
                                yield Ok(ImportBatch {
                                    raw_transactions: rows,
                                    operation_type: CSV_STREAM_TYPE.to_owned(),
                                    cursor,
                                    is_complete: index + 1 == total,
                                    warnings,
                                });
                            }
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        }
                    }

                    // an account with no export files still completes
                    if total == 0 {
                        yield Ok(ImportBatch {
                            raw_transactions: Vec::new(),
                            operation_type: CSV_STREAM_TYPE.to_owned(),
                            cursor: csv::empty_cursor(),
                            is_complete: true,
                            warnings: Vec::new(),
                        });
                    }
                }
                AccountType::Blockchain => {
                    yield Err(IngestError::UnsupportedOperation {
                        domain: SOURCE.to_owned(),
                        operation: "blockchain import".to_owned(),
                    });
                }
            }
        })
    }
}

pub struct KrakenAdapter;

#[async_trait]
impl SourceAdapter for KrakenAdapter {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn family(&self) -> SourceFamily {
        SourceFamily::Exchange
    }

    fn create_importer(
        &self,
        manager: Arc<ProviderManager>,
        _preferred_provider: Option<&str>,
    ) -> Result<Arc<dyn Importer>, IngestError> {
        Ok(Arc::new(KrakenImporter::new(manager.events().clone())))
    }

    fn create_processor(&self, _deps: &ProcessorDeps) -> Result<Arc<dyn Processor>, IngestError> {
        Ok(Arc::new(SchemaProcessor::new(KrakenTransform::new())))
    }
}
