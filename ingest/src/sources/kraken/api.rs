use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use tally_common::account::Credentials;
use tally_common::cursor::{CursorType, PrimaryCursor, ReplayWindow};
use tally_common::events::EventBus;

use crate::provider::http::HttpClient;
use crate::provider::registry::{
    ProviderCapabilities, ProviderConfig, ProviderMetadata, RateLimit, RetryPolicy,
};
use crate::provider::streaming::{Mapped, Page, PagedFetcher, PageRequest};
use crate::provider::{OperationKind, ProviderError, ProviderItem, StreamOperation};
use crate::sources::kraken::{normalize_asset, KrakenLedgerEntry, LedgerEntryType, SOURCE};

const OFFSET_KEY: &str = "ofs";

pub fn kraken_api_metadata() -> ProviderMetadata {
    ProviderMetadata {
        name: "kraken_api".into(),
        display_name: "Kraken".into(),
        domain: SOURCE.into(),
        base_url: "https://api.kraken.com".into(),
        capabilities: ProviderCapabilities {
            supported_operations: vec![OperationKind::LedgerEntries],
            supported_transaction_types: vec![
                "deposit".into(),
                "withdrawal".into(),
                "trade".into(),
                "staking".into(),
            ],
            supported_cursor_types: vec![CursorType::Timestamp],
            preferred_cursor_type: Some(CursorType::Timestamp),
            // ledger entries can settle late, re-pull a few minutes
            replay_window: Some(ReplayWindow::Seconds(300)),
            supports_pagination: true,
            max_batch_size: Some(50),
            requires_api_key: true,
        },
        default_config: ProviderConfig {
            rate_limit: RateLimit::per_second(1),
            retries: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            api_key: None,
            api_secret: None,
        },
    }
}

// Kraken private Ledgers endpoint: timestamp floor plus offset pagination.
// The offset lives in cursor custom metadata, so only this fetcher can
// resume its own pagination; a timestamp cursor alone restarts the page
// walk from the floor and deduplication absorbs the overlap.
#[derive(Debug)]
pub struct KrakenLedgerFetcher {
    metadata: ProviderMetadata,
    http: HttpClient,
}

impl KrakenLedgerFetcher {
    pub fn new(credentials: &Credentials, events: EventBus) -> Result<Self, ProviderError> {
        let metadata = kraken_api_metadata();
        let api_key = credentials
            .api_key
            .clone()
            .ok_or_else(|| ProviderError::MissingCredentials("kraken api key".into()))?;

        let mut config = metadata.default_config.clone();
        config.api_key = Some(api_key);
        config.api_secret = credentials.api_secret.clone();

        let http = HttpClient::new(
            metadata.domain.clone(),
            metadata.name.clone(),
            metadata.base_url.clone(),
            &config,
            events,
        )?;
        Ok(Self { metadata, http })
    }

    fn page_size(&self) -> usize {
        self.metadata.capabilities.max_batch_size.unwrap_or(50)
    }
}

fn str_entry(entry: &Value, key: &str) -> Result<String, ProviderError> {
    entry
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ProviderError::Payload(format!("missing field '{}'", key)))
}

#[async_trait]
impl PagedFetcher for KrakenLedgerFetcher {
    type Raw = (String, Value);

    fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    async fn fetch_page(
        &self,
        _operation: &StreamOperation,
        request: &PageRequest,
    ) -> Result<Page<Self::Raw>, ProviderError> {
        let offset = request
            .custom
            .as_ref()
            .and_then(|custom| custom.get(OFFSET_KEY))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let start = request.start_position.unwrap_or(0);

        let path = format!("/0/private/Ledgers?start={}&ofs={}", start, offset);
        let body = self.http.get_json(&path).await?;

        if let Some(errors) = body.get("error").and_then(Value::as_array) {
            if !errors.is_empty() {
                let message = errors
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(ProviderError::Api {
                    status: 200,
                    message,
                });
            }
        }

        let ledger = body
            .get("result")
            .and_then(|result| result.get("ledger"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let mut items: Vec<(String, Value)> = ledger.into_iter().collect();
        // the map ordering is not part of the API contract
        items.sort_by(|a, b| {
            let time = |entry: &Value| {
                entry
                    .get("time")
                    .and_then(Value::as_f64)
                    .unwrap_or_default()
            };
            time(&a.1)
                .partial_cmp(&time(&b.1))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let fetched = items.len();
        let is_complete = fetched < self.page_size();
        let mut custom = Map::new();
        custom.insert(OFFSET_KEY.to_owned(), Value::from(offset + fetched as u64));

        Ok(Page {
            items,
            next_page_token: None,
            is_complete,
            custom: Some(custom),
        })
    }

    fn map_item(
        &self,
        _operation: &StreamOperation,
        raw: Self::Raw,
    ) -> Result<Mapped, ProviderError> {
        let (id, entry) = raw;

        let entry_type: LedgerEntryType =
            serde_json::from_value(entry.get("type").cloned().unwrap_or(Value::Null))
                .unwrap_or(LedgerEntryType::Other);
        // margin rollovers and other non-flow entries are not tracked
        if entry_type == LedgerEntryType::Other {
            return Ok(Mapped::Skip);
        }

        let time = entry
            .get("time")
            .and_then(Value::as_f64)
            .ok_or_else(|| ProviderError::Payload("missing field 'time'".into()))?;

        let normalized = KrakenLedgerEntry {
            id: id.clone(),
            ref_id: str_entry(&entry, "refid")?,
            timestamp: (time * 1000.0) as u64,
            entry_type,
            asset: normalize_asset(&str_entry(&entry, "asset")?),
            amount: str_entry(&entry, "amount")?,
            fee: str_entry(&entry, "fee")?,
            balance: entry
                .get("balance")
                .and_then(Value::as_str)
                .map(str::to_owned),
        };

        Ok(Mapped::Items(vec![ProviderItem {
            external_id: id,
            tx_hash: None,
            normalized: serde_json::to_value(&normalized)?,
            raw: entry,
        }]))
    }

    fn cursor_for(&self, item: &ProviderItem) -> PrimaryCursor {
        let millis = item
            .normalized
            .get("timestamp")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        PrimaryCursor::timestamp(millis / 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fetcher() -> KrakenLedgerFetcher {
        KrakenLedgerFetcher::new(
            &Credentials {
                api_key: Some("key".into()),
                api_secret: Some("secret".into()),
            },
            EventBus::new(4),
        )
        .unwrap()
    }

    #[test]
    fn test_missing_credentials_rejected_at_creation() {
        let err = KrakenLedgerFetcher::new(&Credentials::default(), EventBus::new(4)).unwrap_err();
        assert!(matches!(err, ProviderError::MissingCredentials(_)));
    }

    #[test]
    fn test_map_trade_entry() {
        let raw = (
            "L4UESK-KG3EQ-UFO4T5".to_owned(),
            json!({
                "refid": "TJKLXF-PGMUI-4NTLXU",
                "time": 1688464484.1787f64,
                "type": "trade",
                "subtype": "",
                "aclass": "currency",
                "asset": "XXBT",
                "amount": "0.05",
                "fee": "0.00000000",
                "balance": "0.15"
            }),
        );
        let items = match fetcher()
            .map_item(&StreamOperation::LedgerEntries, raw)
            .unwrap()
        {
            Mapped::Items(items) => items,
            Mapped::Skip => panic!("unexpected skip"),
        };

        let normalized: KrakenLedgerEntry =
            serde_json::from_value(items[0].normalized.clone()).unwrap();
        assert_eq!(normalized.asset, "BTC");
        assert_eq!(normalized.entry_type, LedgerEntryType::Trade);
        assert_eq!(normalized.timestamp, 1688464484178);
        assert_eq!(items[0].external_id, "L4UESK-KG3EQ-UFO4T5");
        assert!(items[0].tx_hash.is_none());
    }

    #[test]
    fn test_untracked_entry_type_is_skipped() {
        let raw = (
            "LROLL-OVER1-234567".to_owned(),
            json!({
                "refid": "R1",
                "time": 1688464484.0f64,
                "type": "rollover",
                "asset": "XXBT",
                "amount": "0",
                "fee": "0.01"
            }),
        );
        assert!(matches!(
            fetcher()
                .map_item(&StreamOperation::LedgerEntries, raw)
                .unwrap(),
            Mapped::Skip
        ));
    }

    #[test]
    fn test_cursor_is_entry_time_in_seconds() {
        let raw = (
            "L1".to_owned(),
            json!({
                "refid": "R1",
                "time": 1688464484.1787f64,
                "type": "deposit",
                "asset": "ZUSD",
                "amount": "100.0",
                "fee": "0"
            }),
        );
        let items = match fetcher()
            .map_item(&StreamOperation::LedgerEntries, raw)
            .unwrap()
        {
            Mapped::Items(items) => items,
            Mapped::Skip => panic!("unexpected skip"),
        };
        let cursor = fetcher().cursor_for(&items[0]);
        assert_eq!(cursor.kind, CursorType::Timestamp);
        assert_eq!(cursor.value, "1688464484");
    }
}
