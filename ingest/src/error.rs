use thiserror::Error;

use tally_common::cursor::CursorType;

use crate::provider::ProviderError;
use crate::storage::StorageError;

// Tagged error taxonomy of the ingestion engine. Every fallible operation
// returns one of these; nothing panics across module boundaries.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no provider registered for domain '{0}'")]
    NoProviders(String),

    #[error("no provider for domain '{domain}' can resume from a {cursor} cursor")]
    NoCompatibleProviders { domain: String, cursor: CursorType },

    #[error("all providers failed for domain '{domain}': {last_error}")]
    AllProvidersFailed { domain: String, last_error: String },

    #[error("validation failed at '{field_path}' (record {record_index})")]
    Validation {
        field_path: String,
        record_index: usize,
    },

    #[error("processor for '{source_name}' returned no output for {inputs} input rows")]
    EmptyProcessorOutput { source_name: String, inputs: usize },

    #[error("account {0} has an incomplete import session, re-run the import before processing")]
    IncompleteImportBlocksProcessing(u64),

    #[error("no provider for domain '{domain}' supports operation '{operation}'")]
    UnsupportedOperation { domain: String, operation: String },

    // Used as a selection filter inside the manager, not surfaced to users
    #[error("provider '{provider}' cannot resume from a {cursor} cursor")]
    CursorIncompatible {
        provider: String,
        cursor: CursorType,
    },

    #[error("resource cleanup failed: {0}")]
    ResourceCleanup(String),

    #[error("unknown source '{0}'")]
    UnknownSource(String),

    #[error("source '{0}' is already registered")]
    DuplicateSource(String),

    #[error("provider '{domain}/{name}' is already registered")]
    DuplicateProvider { domain: String, name: String },

    #[error("unknown provider '{domain}/{name}'")]
    UnknownProvider { domain: String, name: String },

    #[error("streaming is mandatory for imports, source '{0}' does not support it")]
    StreamingNotSupported(String),

    #[error("import aborted: {0}")]
    ImportAborted(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}
