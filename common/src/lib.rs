pub mod account;
pub mod asset;
pub mod cursor;
pub mod data_source;
pub mod events;
pub mod raw;
pub mod time;
pub mod transaction;

pub use account::{Account, AccountType, Credentials, SourceFamily};
pub use cursor::{CursorMetadata, CursorState, CursorType, PrimaryCursor, ReplayWindow};
pub use data_source::{DataSource, DataSourceStatus, ImportSummary};
pub use events::{EventBus, IngestEvent};
pub use raw::{NewRawTransaction, ProcessingStatus, RawTransaction};
pub use transaction::{
    BlockchainInfo, Fee, FeeScope, FeeSettlement, Movement, Movements, Operation,
    OperationCategory, ProcessedTransaction, RecordError, TransactionStatus,
};
