use serde::{Deserialize, Serialize};
use strum::Display;

use crate::time::TimestampSeconds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DataSourceStatus {
    Started,
    Completed,
    Failed,
    CompletedWithWarnings,
}

impl DataSourceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, DataSourceStatus::Started)
    }

    // A half-imported raw set must not be derived over
    pub fn blocks_processing(self) -> bool {
        matches!(self, DataSourceStatus::Started | DataSourceStatus::Failed)
    }
}

// Running totals of one import session, persisted as the session metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub transactions_imported: u64,
    pub duplicates_skipped: u64,
    pub batches: u64,
    pub warnings: u64,
}

// One import attempt against one account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: u64,
    pub account_id: u64,
    pub status: DataSourceStatus,
    pub started_at: TimestampSeconds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<TimestampSeconds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub import_result: ImportSummary,
}

impl DataSource {
    pub fn new(id: u64, account_id: u64, started_at: TimestampSeconds) -> Self {
        Self {
            id,
            account_id,
            status: DataSourceStatus::Started,
            started_at,
            completed_at: None,
            error_message: None,
            import_result: ImportSummary::default(),
        }
    }
}
