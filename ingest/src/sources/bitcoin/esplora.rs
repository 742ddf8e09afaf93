use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use tally_common::cursor::{CursorState, PrimaryCursor};
use tally_common::events::EventBus;

use crate::provider::http::HttpClient;
use crate::provider::registry::{ProviderConfig, ProviderMetadata};
use crate::provider::streaming::{paged_stream, Mapped, Page, PagedFetcher, PageRequest};
use crate::provider::{
    BatchStream, OneShotOperation, OneShotOutput, Provider, ProviderError, ProviderItem,
    StreamOperation,
};
use crate::sources::bitcoin::{BitcoinSide, BitcoinTransaction, NATIVE_DECIMALS, NATIVE_SYMBOL};
use crate::sources::scale_base_units;

const FROM_HEIGHT_KEY: &str = "from_height";

// Esplora-style address index, shared by mempool.space and blockstream.
// History is walked forward by confirmation height; only confirmed
// transactions are imported, so unconfirmed activity is picked up by the
// next run once it lands in a block.
#[derive(Debug)]
pub struct EsploraProvider {
    metadata: ProviderMetadata,
    http: HttpClient,
}

impl EsploraProvider {
    pub fn new(
        metadata: ProviderMetadata,
        config: &ProviderConfig,
        events: EventBus,
    ) -> Result<Self, ProviderError> {
        let http = HttpClient::new(
            metadata.domain.clone(),
            metadata.name.clone(),
            metadata.base_url.clone(),
            config,
            events,
        )?;
        Ok(Self { metadata, http })
    }

    fn page_size(&self) -> usize {
        self.metadata.capabilities.max_batch_size.unwrap_or(25)
    }
}

fn side(entry: &Value, address_key: &str, value_key: &str) -> BitcoinSide {
    BitcoinSide {
        address: entry
            .get(address_key)
            .and_then(Value::as_str)
            .map(str::to_owned),
        value: entry.get(value_key).and_then(Value::as_u64).unwrap_or(0),
    }
}

#[async_trait]
impl PagedFetcher for EsploraProvider {
    type Raw = Value;

    fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    async fn fetch_page(
        &self,
        operation: &StreamOperation,
        request: &PageRequest,
    ) -> Result<Page<Self::Raw>, ProviderError> {
        let address = operation.address().ok_or_else(|| {
            ProviderError::UnsupportedOperation(operation.kind().to_string())
        })?;

        let from_height = request
            .custom
            .as_ref()
            .and_then(|custom| custom.get(FROM_HEIGHT_KEY))
            .and_then(Value::as_u64)
            .or(request.start_position)
            .unwrap_or(0);
        let limit = self.page_size();

        let path = format!(
            "/address/{}/txs/chain?from_height={}&limit={}",
            address, from_height, limit
        );
        let body = self.http.get_json(&path).await?;
        let items = match body {
            Value::Array(items) => items,
            _ => return Err(ProviderError::Payload("expected a transaction array".into())),
        };

        let is_complete = items.len() < limit;
        let custom = items
            .iter()
            .rev()
            .find_map(|entry| {
                entry
                    .get("status")
                    .and_then(|status| status.get("block_height"))
                    .and_then(Value::as_u64)
            })
            .map(|height| {
                let mut custom = Map::new();
                custom.insert(FROM_HEIGHT_KEY.to_owned(), Value::from(height));
                custom
            });

        Ok(Page {
            items,
            next_page_token: None,
            is_complete,
            custom,
        })
    }

    fn map_item(
        &self,
        _operation: &StreamOperation,
        raw: Self::Raw,
    ) -> Result<Mapped, ProviderError> {
        let txid = raw
            .get("txid")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Payload("missing field 'txid'".into()))?
            .to_owned();

        let status = raw.get("status").cloned().unwrap_or(Value::Null);
        let confirmed = status
            .get("confirmed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        // mempool transactions have no height to anchor a cursor on
        if !confirmed {
            return Ok(Mapped::Skip);
        }

        let block_height = status
            .get("block_height")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProviderError::Payload("missing field 'block_height'".into()))?;
        let block_time = status
            .get("block_time")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProviderError::Payload("missing field 'block_time'".into()))?;

        let inputs: Vec<BitcoinSide> = raw
            .get("vin")
            .and_then(Value::as_array)
            .map(|vin| {
                vin.iter()
                    .map(|entry| match entry.get("prevout") {
                        Some(prevout) => side(prevout, "scriptpubkey_address", "value"),
                        None => BitcoinSide {
                            address: None,
                            value: 0,
                        },
                    })
                    .collect()
            })
            .unwrap_or_default();
        let outputs: Vec<BitcoinSide> = raw
            .get("vout")
            .and_then(Value::as_array)
            .map(|vout| {
                vout.iter()
                    .map(|entry| side(entry, "scriptpubkey_address", "value"))
                    .collect()
            })
            .unwrap_or_default();

        let normalized = BitcoinTransaction {
            id: txid.clone(),
            tx_hash: txid.clone(),
            chain: self.metadata.domain.clone(),
            block_height,
            timestamp: block_time * 1000,
            inputs,
            outputs,
            fee: raw.get("fee").and_then(Value::as_u64).unwrap_or(0),
        };

        Ok(Mapped::Items(vec![ProviderItem {
            external_id: txid.clone(),
            tx_hash: Some(txid),
            normalized: serde_json::to_value(&normalized)?,
            raw,
        }]))
    }

    fn cursor_for(&self, item: &ProviderItem) -> PrimaryCursor {
        let block = item
            .normalized
            .get("block_height")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        PrimaryCursor::block(block)
    }
}

#[async_trait]
impl Provider for EsploraProvider {
    fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    async fn execute(&self, operation: &OneShotOperation) -> Result<OneShotOutput, ProviderError> {
        if !self.metadata.capabilities.supports(operation.kind()) {
            return Err(ProviderError::UnsupportedOperation(
                operation.kind().to_string(),
            ));
        }

        match operation {
            OneShotOperation::AddressBalance { address } => {
                let body = self.http.get_json(&format!("/address/{}", address)).await?;
                let stats = body
                    .get("chain_stats")
                    .ok_or_else(|| ProviderError::Payload("missing chain_stats".into()))?;
                let funded = stats
                    .get("funded_txo_sum")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let spent = stats
                    .get("spent_txo_sum")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let sats = funded.saturating_sub(spent);
                let amount = scale_base_units(&sats.to_string(), NATIVE_DECIMALS)
                    .ok_or_else(|| ProviderError::Payload("balance is not a number".into()))?;
                Ok(OneShotOutput::Balance {
                    asset_symbol: NATIVE_SYMBOL.to_owned(),
                    amount,
                })
            }
            OneShotOperation::TransactionExists { tx_hash } => {
                match self.http.get_json(&format!("/tx/{}", tx_hash)).await {
                    Ok(_) => Ok(OneShotOutput::Exists(true)),
                    Err(ProviderError::Api { status: 404, .. }) => Ok(OneShotOutput::Exists(false)),
                    Err(e) => Err(e),
                }
            }
            OneShotOperation::TokenMetadata { .. } => Err(ProviderError::UnsupportedOperation(
                operation.kind().to_string(),
            )),
        }
    }

    fn execute_streaming(
        self: Arc<Self>,
        operation: StreamOperation,
        resume: Option<CursorState>,
    ) -> BatchStream {
        paged_stream(self, operation, resume)
    }

    async fn is_healthy(&self) -> bool {
        self.http.get_json("/blocks/tip/height").await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::bitcoin::mempool_space_metadata;
    use serde_json::json;

    fn provider() -> EsploraProvider {
        EsploraProvider::new(
            mempool_space_metadata(),
            &ProviderConfig::default(),
            EventBus::new(4),
        )
        .unwrap()
    }

    fn op() -> StreamOperation {
        StreamOperation::AddressTransactions {
            address: "bc1quser".into(),
        }
    }

    fn confirmed_tx() -> Value {
        json!({
            "txid": "f4184fc596403b9d638783cf57adfe4c75c605f6356fbc91338530e9831e9e16",
            "status": {
                "confirmed": true,
                "block_height": 170,
                "block_time": 1231731025
            },
            "vin": [
                { "prevout": { "scriptpubkey_address": "bc1qalice", "value": 5000000000u64 } }
            ],
            "vout": [
                { "scriptpubkey_address": "bc1quser", "value": 1000000000u64 },
                { "scriptpubkey_address": "bc1qalice", "value": 3999990000u64 }
            ],
            "fee": 10000
        })
    }

    #[test]
    fn test_map_confirmed_transaction() {
        let items = match provider().map_item(&op(), confirmed_tx()).unwrap() {
            Mapped::Items(items) => items,
            Mapped::Skip => panic!("unexpected skip"),
        };
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert!(item.tx_hash.is_some());

        let normalized: BitcoinTransaction =
            serde_json::from_value(item.normalized.clone()).unwrap();
        assert_eq!(normalized.block_height, 170);
        assert_eq!(normalized.timestamp, 1_231_731_025_000);
        assert_eq!(normalized.inputs.len(), 1);
        assert_eq!(normalized.outputs.len(), 2);
        assert_eq!(normalized.fee, 10000);
    }

    #[test]
    fn test_unconfirmed_transaction_is_skipped() {
        let tx = json!({
            "txid": "deadbeef",
            "status": { "confirmed": false },
            "vin": [],
            "vout": []
        });
        assert!(matches!(
            provider().map_item(&op(), tx).unwrap(),
            Mapped::Skip
        ));
    }

    #[test]
    fn test_coinbase_input_has_no_address() {
        let tx = json!({
            "txid": "c0ffee",
            "status": { "confirmed": true, "block_height": 1, "block_time": 1231469665 },
            "vin": [ {} ],
            "vout": [ { "scriptpubkey_address": "bc1quser", "value": 5000000000u64 } ],
            "fee": 0
        });
        let items = match provider().map_item(&op(), tx).unwrap() {
            Mapped::Items(items) => items,
            Mapped::Skip => panic!("unexpected skip"),
        };
        let normalized: BitcoinTransaction =
            serde_json::from_value(items[0].normalized.clone()).unwrap();
        assert_eq!(normalized.inputs[0].address, None);
    }

    #[test]
    fn test_cursor_follows_confirmation_height() {
        let items = match provider().map_item(&op(), confirmed_tx()).unwrap() {
            Mapped::Items(items) => items,
            Mapped::Skip => panic!("unexpected skip"),
        };
        assert_eq!(provider().cursor_for(&items[0]).value, "170");
    }
}
