use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

use crate::time::TimestampSeconds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processed,
}

// Immutable record of one external payload. provider_data and
// normalized_data are never rewritten after insert; only processing_status
// transitions pending -> processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransaction {
    pub id: u64,
    pub data_source_id: u64,
    pub account_id: u64,
    // Provider-assigned event id, unique per account
    pub external_id: String,
    // On-chain hash, set only when this row uniquely represents the
    // transaction within the account (cross-provider dedup key). Streams
    // that decompose one transaction into several rows keep the hash in
    // normalized_data instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub provider_data: Value,
    pub normalized_data: Value,
    pub processing_status: ProcessingStatus,
    pub stream_type: String,
    pub created_at: TimestampSeconds,
}

impl RawTransaction {
    // Key grouping raw rows that belong to the same on-chain transaction
    pub fn correlation_key(&self) -> String {
        if let Some(hash) = self
            .normalized_data
            .get("tx_hash")
            .and_then(Value::as_str)
        {
            return hash.to_owned();
        }
        if let Some(hash) = &self.tx_hash {
            return hash.clone();
        }
        self.external_id.clone()
    }
}

// Insert shape produced by importers; ids and session linkage are assigned
// by the repository at save time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRawTransaction {
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub provider_data: Value,
    pub normalized_data: Value,
    pub stream_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(normalized: Value, tx_hash: Option<&str>) -> RawTransaction {
        RawTransaction {
            id: 1,
            data_source_id: 1,
            account_id: 1,
            external_id: "evt-1".into(),
            tx_hash: tx_hash.map(str::to_owned),
            provider_data: json!({}),
            normalized_data: normalized,
            processing_status: ProcessingStatus::Pending,
            stream_type: "normal".into(),
            created_at: 0,
        }
    }

    #[test]
    fn test_correlation_prefers_normalized_hash() {
        let row = raw(json!({"tx_hash": "0xaaa"}), Some("0xbbb"));
        assert_eq!(row.correlation_key(), "0xaaa");
    }

    #[test]
    fn test_correlation_falls_back_to_column_then_external_id() {
        let row = raw(json!({}), Some("0xbbb"));
        assert_eq!(row.correlation_key(), "0xbbb");

        let row = raw(json!({}), None);
        assert_eq!(row.correlation_key(), "evt-1");
    }
}
