use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use tally_common::cursor::{CursorState, PrimaryCursor};
use tally_common::events::EventBus;

use crate::provider::http::HttpClient;
use crate::provider::registry::{ProviderConfig, ProviderMetadata};
use crate::provider::streaming::{paged_stream, Mapped, Page, PagedFetcher, PageRequest};
use crate::provider::{
    BatchStream, OneShotOperation, OneShotOutput, Provider, ProviderError, ProviderItem,
    StreamOperation,
};
use crate::sources::evm::{EvmMovementKind, EvmToken, EvmTransaction, NATIVE_SYMBOL, NATIVE_DECIMALS};
use crate::sources::{scale_base_units, NormalizedStatus};

const START_BLOCK_KEY: &str = "start_block";

// Etherscan-compatible account API, shared by etherscan and blockscout.
// Pagination advances a start-block floor kept in cursor custom metadata;
// the same-block overlap of consecutive pages is removed by the dedup
// window of the streaming adapter.
#[derive(Debug)]
pub struct EvmScanProvider {
    metadata: ProviderMetadata,
    http: HttpClient,
}

impl EvmScanProvider {
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
        self.metadata.capabilities.max_batch_size.unwrap_or(100)
    }

    fn action_for(operation: &StreamOperation) -> Result<&'static str, ProviderError> {
        match operation {
            StreamOperation::AddressTransactions { .. } => Ok("txlist"),
            StreamOperation::AddressInternalTransactions { .. } => Ok("txlistinternal"),
            StreamOperation::TokenTransactions { .. } => Ok("tokentx"),
            StreamOperation::LedgerEntries => Err(ProviderError::UnsupportedOperation(
                "ledger_entries".to_owned(),
            )),
        }
    }

    // {"status":"1","message":"OK","result":[...]} with status "0" both for
    // plain empty result sets and for real errors
    fn unwrap_result(&self, body: Value) -> Result<Vec<Value>, ProviderError> {
        let status = body.get("status").and_then(Value::as_str).unwrap_or("0");
        if status == "1" {
            return match body.get("result") {
                Some(Value::Array(items)) => Ok(items.clone()),
                _ => Err(ProviderError::Payload("result is not an array".into())),
            };
        }

        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        if message.contains("No transactions found") || message.contains("No internal transactions")
        {
            return Ok(Vec::new());
        }
        Err(ProviderError::Api {
            status: 200,
            message,
        })
    }
}

fn str_field(entry: &Value, key: &str) -> Result<String, ProviderError> {
    entry
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ProviderError::Payload(format!("missing field '{}'", key)))
}

fn u64_field(entry: &Value, key: &str) -> Result<u64, ProviderError> {
    str_field(entry, key)?
        .parse()
        .map_err(|_| ProviderError::Payload(format!("field '{}' is not a number", key)))
}

fn opt_str_field(entry: &Value, key: &str) -> Option<String> {
    entry
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

// gas_used * gas_price, both decimal strings
fn fee_wei(entry: &Value) -> Result<String, ProviderError> {
    let gas_used: u128 = str_field(entry, "gasUsed")?
        .parse()
        .map_err(|_| ProviderError::Payload("gasUsed is not a number".into()))?;
    let gas_price: u128 = str_field(entry, "gasPrice")?
        .parse()
        .map_err(|_| ProviderError::Payload("gasPrice is not a number".into()))?;
    gas_used
        .checked_mul(gas_price)
        .map(|fee| fee.to_string())
        .ok_or_else(|| ProviderError::Payload("fee overflow".into()))
}

fn status_of(entry: &Value) -> NormalizedStatus {
    let is_error = entry.get("isError").and_then(Value::as_str) == Some("1");
    let receipt_failed = entry.get("txreceipt_status").and_then(Value::as_str) == Some("0");
    if is_error || receipt_failed {
        NormalizedStatus::Failed
    } else {
        NormalizedStatus::Success
    }
}

#[async_trait]
impl PagedFetcher for EvmScanProvider {
    type Raw = Value;

    fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    async fn fetch_page(
        &self,
        operation: &StreamOperation,
        request: &PageRequest,
    ) -> Result<Page<Self::Raw>, ProviderError> {
        let action = Self::action_for(operation)?;
        let address = operation
            .address()
            .ok_or_else(|| ProviderError::UnsupportedOperation(action.to_owned()))?;

        let start_block = request
            .custom
            .as_ref()
            .and_then(|custom| custom.get(START_BLOCK_KEY))
            .and_then(Value::as_u64)
            .or(request.start_position)
            .unwrap_or(0);
        let limit = self.page_size();

        let path = format!(
            "?module=account&action={}&address={}&startblock={}&endblock=99999999&page=1&offset={}&sort=asc",
            action, address, start_block, limit
        );
        let body = self.http.get_json(&path).await?;
        let items = self.unwrap_result(body)?;

        let is_complete = items.len() < limit;
        let custom = items
            .last()
            .and_then(|entry| entry.get("blockNumber"))
            .and_then(Value::as_str)
            .and_then(|block| block.parse::<u64>().ok())
            .map(|block| {
                let mut custom = Map::new();
                custom.insert(START_BLOCK_KEY.to_owned(), Value::from(block));
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
        operation: &StreamOperation,
        raw: Self::Raw,
    ) -> Result<Mapped, ProviderError> {
        let hash = str_field(&raw, "hash")?;
        let block_height = u64_field(&raw, "blockNumber")?;
        let timestamp = u64_field(&raw, "timeStamp")? * 1000;
        let from = str_field(&raw, "from")?.to_lowercase();
        let to = opt_str_field(&raw, "to").map(|to| to.to_lowercase());
        let value = str_field(&raw, "value")?;
        let chain = self.metadata.domain.clone();

        let normalized = match operation {
            StreamOperation::AddressTransactions { .. } => EvmTransaction {
                id: hash.clone(),
                tx_hash: hash.clone(),
                chain,
                block_height,
                timestamp,
                from,
                to,
                fee: Some(fee_wei(&raw)?),
                status: status_of(&raw),
                movement: EvmMovementKind::Native,
                token: None,
                value,
            },
            StreamOperation::AddressInternalTransactions { .. } => {
                // zero-value internal calls carry no balance impact
                if value == "0" {
                    return Ok(Mapped::Skip);
                }
                let trace = opt_str_field(&raw, "traceId").unwrap_or_else(|| "0".to_owned());
                EvmTransaction {
                    id: format!("{}:internal:{}", hash, trace),
                    tx_hash: hash.clone(),
                    chain,
                    block_height,
                    timestamp,
                    from,
                    to,
                    fee: None,
                    status: status_of(&raw),
                    movement: EvmMovementKind::Internal,
                    token: None,
                    value,
                }
            }
            StreamOperation::TokenTransactions { .. } => {
                let contract = match opt_str_field(&raw, "contractAddress") {
                    Some(contract) => contract.to_lowercase(),
                    // a token log without its contract cannot be attributed
                    None => return Ok(Mapped::Skip),
                };
                let log_index = opt_str_field(&raw, "logIndex").unwrap_or_else(|| "0".to_owned());
                let decimals = str_field(&raw, "tokenDecimal")?
                    .parse()
                    .map_err(|_| ProviderError::Payload("tokenDecimal is not a number".into()))?;
                EvmTransaction {
                    id: format!("{}:token:{}", hash, log_index),
                    tx_hash: hash.clone(),
                    chain,
                    block_height,
                    timestamp,
                    from,
                    to,
                    fee: None,
                    status: NormalizedStatus::Success,
                    movement: EvmMovementKind::Token,
                    token: Some(EvmToken {
                        contract,
                        symbol: str_field(&raw, "tokenSymbol")?,
                        decimals,
                    }),
                    value,
                }
            }
            StreamOperation::LedgerEntries => {
                return Err(ProviderError::UnsupportedOperation("ledger_entries".into()))
            }
        };

        // only the native row carries the cross-provider dedup hash: the
        // internal and token rows of the same transaction must be able to
        // coexist with it under the per-account hash constraint
        let tx_hash = match normalized.movement {
            EvmMovementKind::Native => Some(hash),
            _ => None,
        };

        let item = ProviderItem {
            external_id: normalized.id.clone(),
            tx_hash,
            normalized: serde_json::to_value(&normalized)?,
            raw,
        };
        Ok(Mapped::Items(vec![item]))
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
impl Provider for EvmScanProvider {
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
                let path = format!("?module=account&action=balance&address={}&tag=latest", address);
                let body = self.http.get_json(&path).await?;
                let wei = body
                    .get("result")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProviderError::Payload("missing balance result".into()))?;
                let amount = scale_base_units(wei, NATIVE_DECIMALS)
                    .ok_or_else(|| ProviderError::Payload("balance is not a number".into()))?;
                Ok(OneShotOutput::Balance {
                    asset_symbol: NATIVE_SYMBOL.to_owned(),
                    amount,
                })
            }
            OneShotOperation::TransactionExists { tx_hash } => {
                let path = format!(
                    "?module=proxy&action=eth_getTransactionByHash&txhash={}",
                    tx_hash
                );
                let body = self.http.get_json(&path).await?;
                let exists = body.get("result").map(|r| !r.is_null()).unwrap_or(false);
                Ok(OneShotOutput::Exists(exists))
            }
            OneShotOperation::TokenMetadata { contract } => {
                let path = format!(
                    "?module=token&action=getToken&contractaddress={}",
                    contract
                );
                let body = self.http.get_json(&path).await?;
                let result = body
                    .get("result")
                    .cloned()
                    .unwrap_or(json!({}));
                let decimals = result
                    .get("decimals")
                    .and_then(Value::as_str)
                    .and_then(|d| d.parse().ok())
                    .unwrap_or(18);
                Ok(OneShotOutput::TokenMetadata {
                    contract: contract.to_lowercase(),
                    symbol: str_field(&result, "symbol")?,
                    name: str_field(&result, "name")?,
                    decimals,
                })
            }
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
        let path = "?module=proxy&action=eth_blockNumber";
        self.http.get_json(path).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::evm::etherscan_metadata;

    fn provider() -> EvmScanProvider {
        EvmScanProvider::new(
            etherscan_metadata(),
            &ProviderConfig::default(),
            EventBus::new(4),
        )
        .unwrap()
    }

    fn normal_entry() -> Value {
        json!({
            "blockNumber": "17000000",
            "timeStamp": "1700000000",
            "hash": "0xAAA",
            "from": "0xSender",
            "to": "0xRecipient",
            "value": "1500000000000000000",
            "gasUsed": "21000",
            "gasPrice": "100000000000",
            "isError": "0",
            "txreceipt_status": "1"
        })
    }

    fn op_normal() -> StreamOperation {
        StreamOperation::AddressTransactions {
            address: "0xsender".into(),
        }
    }

    #[test]
    fn test_map_normal_row() {
        let provider = provider();
        let mapped = provider.map_item(&op_normal(), normal_entry()).unwrap();
        let items = match mapped {
            Mapped::Items(items) => items,
            Mapped::Skip => panic!("unexpected skip"),
        };
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.external_id, "0xAAA");
        assert_eq!(item.tx_hash.as_deref(), Some("0xAAA"));

        let normalized: EvmTransaction =
            serde_json::from_value(item.normalized.clone()).unwrap();
        assert_eq!(normalized.movement, EvmMovementKind::Native);
        assert_eq!(normalized.from, "0xsender");
        assert_eq!(normalized.fee.as_deref(), Some("2100000000000000"));
        assert_eq!(normalized.timestamp, 1_700_000_000_000);
        assert_eq!(normalized.status, NormalizedStatus::Success);
    }

    #[test]
    fn test_map_token_row_has_no_dedup_hash() {
        let provider = provider();
        let entry = json!({
            "blockNumber": "17000001",
            "timeStamp": "1700000100",
            "hash": "0xBBB",
            "from": "0xsender",
            "to": "0xrecipient",
            "value": "2500000",
            "contractAddress": "0xC0FFEE",
            "tokenSymbol": "USDC",
            "tokenDecimal": "6",
            "logIndex": "12"
        });
        let op = StreamOperation::TokenTransactions {
            address: "0xsender".into(),
        };
        let items = match provider.map_item(&op, entry).unwrap() {
            Mapped::Items(items) => items,
            Mapped::Skip => panic!("unexpected skip"),
        };
        let item = &items[0];
        assert_eq!(item.external_id, "0xBBB:token:12");
        assert!(item.tx_hash.is_none());

        let normalized: EvmTransaction =
            serde_json::from_value(item.normalized.clone()).unwrap();
        let token = normalized.token.unwrap();
        assert_eq!(token.contract, "0xc0ffee");
        assert_eq!(token.decimals, 6);
    }

    #[test]
    fn test_zero_value_internal_is_skipped() {
        let provider = provider();
        let entry = json!({
            "blockNumber": "17000002",
            "timeStamp": "1700000200",
            "hash": "0xCCC",
            "from": "0xsender",
            "to": "0xrecipient",
            "value": "0",
            "traceId": "0_1",
            "isError": "0"
        });
        let op = StreamOperation::AddressInternalTransactions {
            address: "0xsender".into(),
        };
        assert!(matches!(
            provider.map_item(&op, entry).unwrap(),
            Mapped::Skip
        ));
    }

    #[test]
    fn test_failed_receipt_maps_to_failed_status() {
        let provider = provider();
        let mut entry = normal_entry();
        entry["txreceipt_status"] = Value::from("0");
        let items = match provider.map_item(&op_normal(), entry).unwrap() {
            Mapped::Items(items) => items,
            Mapped::Skip => panic!("unexpected skip"),
        };
        let normalized: EvmTransaction =
            serde_json::from_value(items[0].normalized.clone()).unwrap();
        assert_eq!(normalized.status, NormalizedStatus::Failed);
    }

    #[test]
    fn test_missing_field_is_payload_error() {
        let provider = provider();
        let mut entry = normal_entry();
        entry.as_object_mut().unwrap().remove("hash");
        assert!(matches!(
            provider.map_item(&op_normal(), entry),
            Err(ProviderError::Payload(_))
        ));
    }

    #[test]
    fn test_unwrap_result_tolerates_empty_result_sets() {
        let provider = provider();
        let empty = json!({
            "status": "0",
            "message": "No transactions found",
            "result": []
        });
        assert!(provider.unwrap_result(empty).unwrap().is_empty());

        let error = json!({
            "status": "0",
            "message": "Max rate limit reached",
            "result": null
        });
        assert!(matches!(
            provider.unwrap_result(error),
            Err(ProviderError::Api { .. })
        ));
    }

    #[test]
    fn test_cursor_follows_block_height() {
        let provider = provider();
        let items = match provider.map_item(&op_normal(), normal_entry()).unwrap() {
            Mapped::Items(items) => items,
            Mapped::Skip => panic!("unexpected skip"),
        };
        let cursor = provider.cursor_for(&items[0]);
        assert_eq!(cursor.value, "17000000");
    }
}
