use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::cursor::CursorState;

// How an account's history is sourced: directly from a chain through
// explorer providers, from an exchange REST API, or from CSV exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum AccountType {
    #[serde(rename = "blockchain")]
    #[strum(serialize = "blockchain")]
    Blockchain,
    #[serde(rename = "exchange-api")]
    #[strum(serialize = "exchange-api")]
    ExchangeApi,
    #[serde(rename = "exchange-csv")]
    #[strum(serialize = "exchange-csv")]
    ExchangeCsv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SourceFamily {
    Blockchain,
    Exchange,
}

impl AccountType {
    pub fn family(self) -> SourceFamily {
        match self {
            AccountType::Blockchain => SourceFamily::Blockchain,
            AccountType::ExchangeApi | AccountType::ExchangeCsv => SourceFamily::Exchange,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
}

// A wallet or exchange account under which imports and processing are
// scoped. Created by the account manager upstream; the ingestion core only
// reads it and advances last_cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: u64,
    pub account_type: AccountType,
    // Lowercased key in the source adapter registry
    pub source_name: String,
    // On-chain address, or comma-separated CSV directories
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    // One cursor slot per stream type
    #[serde(default)]
    pub last_cursor: IndexMap<String, CursorState>,
}

impl Account {
    pub fn cursor_for(&self, stream_type: &str) -> Option<&CursorState> {
        self.last_cursor.get(stream_type)
    }

    // CSV accounts carry their export directories in the identifier
    pub fn csv_directories(&self) -> Vec<String> {
        self.identifier
            .split(',')
            .map(|dir| dir.trim().to_owned())
            .filter(|dir| !dir.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_type_wire_names() {
        assert_eq!(
            serde_json::to_value(AccountType::ExchangeApi).unwrap(),
            "exchange-api"
        );
        assert_eq!(
            serde_json::to_value(AccountType::ExchangeCsv).unwrap(),
            "exchange-csv"
        );
        assert_eq!(AccountType::Blockchain.to_string(), "blockchain");
    }

    #[test]
    fn test_family_routing() {
        assert_eq!(AccountType::Blockchain.family(), SourceFamily::Blockchain);
        assert_eq!(AccountType::ExchangeApi.family(), SourceFamily::Exchange);
        assert_eq!(AccountType::ExchangeCsv.family(), SourceFamily::Exchange);
    }

    #[test]
    fn test_csv_directories_split() {
        let account = Account {
            id: 1,
            account_type: AccountType::ExchangeCsv,
            source_name: "kraken".into(),
            identifier: "/exports/2023, /exports/2024,".into(),
            provider_name: None,
            credentials: None,
            last_cursor: IndexMap::new(),
        };
        assert_eq!(
            account.csv_directories(),
            vec!["/exports/2023".to_owned(), "/exports/2024".to_owned()]
        );
    }
}
