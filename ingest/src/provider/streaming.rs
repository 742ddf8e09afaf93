use std::num::NonZeroUsize;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use log::{debug, trace};
use lru::LruCache;
use serde_json::{Map, Value};

use tally_common::cursor::{CursorMetadata, CursorState, CursorType, PrimaryCursor};

use crate::config::DEDUP_WINDOW_SIZE;
use crate::provider::registry::ProviderMetadata;
use crate::provider::{BatchStats, BatchStream, ProviderBatch, ProviderError, ProviderItem, StreamOperation};

// Key under which the generic driver keeps a provider's next page token
pub const PAGE_TOKEN_KEY: &str = "page_token";

// Bounded set of recently seen transaction ids. Used inside every
// provider stream and again inside the manager across failovers.
pub struct DedupWindow {
    window: LruCache<String, ()>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: LruCache::new(
                NonZeroUsize::new(capacity).expect("Non zero capacity for dedup window"),
            ),
        }
    }

    pub fn seed(&mut self, id: &str) {
        self.window.put(id.to_owned(), ());
    }

    // Returns false when the id was seen recently; fresh ids are recorded
    pub fn check_and_insert(&mut self, id: &str) -> bool {
        if self.window.get(id).is_some() {
            return false;
        }
        self.window.put(id.to_owned(), ());
        true
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

// Outcome of mapping one raw page entry. Skip discards entries that are
// not relevant to the stream without failing it.
pub enum Mapped {
    Items(Vec<ProviderItem>),
    Skip,
}

// What the driver asks a provider to fetch next
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub page_token: Option<String>,
    // Numeric resume floor (block height, timestamp); first fetch only
    pub start_position: Option<u64>,
    // Provider-private state carried from the previous page or from the
    // resume cursor's custom metadata
    pub custom: Option<Map<String, Value>>,
}

pub struct Page<R> {
    pub items: Vec<R>,
    pub next_page_token: Option<String>,
    pub is_complete: bool,
    pub custom: Option<Map<String, Value>>,
}

// Provider-side pagination contract. Implementors only describe how to
// fetch one page and map one item; paged_stream turns that into a uniform
// lazy sequence of deduplicated batches with cursor propagation.
#[async_trait]
pub trait PagedFetcher: Send + Sync + 'static {
    type Raw: Send + 'static;

    fn metadata(&self) -> &ProviderMetadata;

    async fn fetch_page(
        &self,
        operation: &StreamOperation,
        request: &PageRequest,
    ) -> Result<Page<Self::Raw>, ProviderError>;

    fn map_item(
        &self,
        operation: &StreamOperation,
        raw: Self::Raw,
    ) -> Result<Mapped, ProviderError>;

    // Primary cursor position after having yielded this item
    fn cursor_for(&self, item: &ProviderItem) -> PrimaryCursor;
}

pub fn paged_stream<F: PagedFetcher>(
    fetcher: Arc<F>,
    operation: StreamOperation,
    resume: Option<CursorState>,
) -> BatchStream {
    Box::pin(stream! {
        let meta = fetcher.metadata().clone();

        // Reject cursors this provider cannot consume
        if let Some(cursor) = &resume {
            if !meta.capabilities.supports_cursor(cursor.primary.kind) {
                yield Err(ProviderError::UnsupportedCursor(cursor.primary.kind));
                return;
            }
        }

        let mut window = DedupWindow::new(DEDUP_WINDOW_SIZE);
        let mut page_token: Option<String> = None;
        let mut start_position: Option<u64> = None;
        let mut custom: Option<Map<String, Value>> = None;
        let mut last_primary: Option<PrimaryCursor> = None;
        let mut last_id: Option<String> = None;

        // Restore pagination state from the resume cursor, first call only
        if let Some(cursor) = &resume {
            if let Some(id) = &cursor.last_transaction_id {
                window.seed(id);
                last_id = Some(id.clone());
            }

            let replayed = match meta.capabilities.replay_window {
                Some(replay) => cursor.rewound(replay),
                None => cursor.clone(),
            };

            if cursor.owned_by(&meta.name) {
                custom = cursor.metadata.custom.clone();
                page_token = cursor.custom_str(PAGE_TOKEN_KEY).map(str::to_owned);
            }
            if page_token.is_none() && cursor.primary.kind == CursorType::PageToken {
                page_token = Some(replayed.primary.value.clone());
            }
            start_position = replayed.primary.position();
            // the rewind only lowers the fetch floor; the reported cursor
            // never moves behind the resume point on a quiet stream
            last_primary = Some(cursor.primary.clone());
            debug!(
                "{} resuming {} stream from {:?}",
                meta.name,
                operation.stream_type(),
                last_primary
            );
        }

        loop {
            let request = PageRequest {
                page_token: page_token.clone(),
                start_position,
                custom: custom.clone(),
            };

            let page = match fetcher.fetch_page(&operation, &request).await {
                Ok(page) => page,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let fetched = page.items.len();
            trace!("{} fetched {} items", meta.name, fetched);

            let mut mapped = Vec::with_capacity(fetched);
            for raw in page.items {
                match fetcher.map_item(&operation, raw) {
                    Ok(Mapped::Items(items)) => mapped.extend(items),
                    Ok(Mapped::Skip) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }

            let mapped_len = mapped.len();
            let mut items = Vec::with_capacity(mapped_len);
            for item in mapped {
                if window.check_and_insert(&item.external_id) {
                    items.push(item);
                }
            }
            let deduplicated = mapped_len - items.len();

            if let Some(last) = items.last() {
                last_primary = Some(fetcher.cursor_for(last));
                last_id = Some(last.external_id.clone());
            }

            let mut cursor_custom = page.custom.clone().unwrap_or_default();
            if let Some(next) = &page.next_page_token {
                cursor_custom.insert(PAGE_TOKEN_KEY.to_owned(), Value::from(next.clone()));
            }

            let primary = last_primary.clone().unwrap_or_else(|| PrimaryCursor {
                kind: meta
                    .capabilities
                    .preferred_cursor_type
                    .unwrap_or(CursorType::PageToken),
                value: String::new(),
            });

            let cursor = CursorState {
                primary,
                metadata: CursorMetadata {
                    provider_name: meta.name.clone(),
                    custom: if cursor_custom.is_empty() {
                        None
                    } else {
                        Some(cursor_custom)
                    },
                },
                replay_window: meta.capabilities.replay_window,
                last_transaction_id: last_id.clone(),
            };

            let is_complete = page.is_complete;
            let yielded = items.len();
            yield Ok(ProviderBatch {
                items,
                cursor,
                is_complete,
                stats: BatchStats {
                    fetched,
                    deduplicated,
                    yielded,
                },
            });

            if is_complete {
                return;
            }

            page_token = page.next_page_token;
            custom = page.custom;
            // only the first fetch starts from the resume position
            start_position = None;
        }
    })
}
