use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::Display;

// Kind of position a stream cursor tracks.
// block_number and timestamp have a natural numeric order, tx_hash and
// page_token are opaque markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CursorType {
    BlockNumber,
    TxHash,
    Timestamp,
    PageToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryCursor {
    pub kind: CursorType,
    pub value: String,
}

impl PrimaryCursor {
    pub fn block(height: u64) -> Self {
        Self {
            kind: CursorType::BlockNumber,
            value: height.to_string(),
        }
    }

    pub fn timestamp(ts: u64) -> Self {
        Self {
            kind: CursorType::Timestamp,
            value: ts.to_string(),
        }
    }

    pub fn tx_hash(hash: impl Into<String>) -> Self {
        Self {
            kind: CursorType::TxHash,
            value: hash.into(),
        }
    }

    pub fn page_token(token: impl Into<String>) -> Self {
        Self {
            kind: CursorType::PageToken,
            value: token.into(),
        }
    }

    // Numeric position for cursor kinds with a natural order
    pub fn position(&self) -> Option<u64> {
        match self.kind {
            CursorType::BlockNumber | CursorType::Timestamp => self.value.parse().ok(),
            CursorType::TxHash | CursorType::PageToken => None,
        }
    }
}

// Deliberate overlap applied when resuming a stream, to tolerate upstream
// eventual consistency. Units depend on the cursor kind the provider uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "amount", rename_all = "snake_case")]
pub enum ReplayWindow {
    Blocks(u64),
    Seconds(u64),
    Pages(u32),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CursorMetadata {
    // Provider that emitted this cursor. Custom metadata below is only
    // meaningful to it.
    pub provider_name: String,
    // Opaque per-provider pagination state, preserved verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    pub primary: PrimaryCursor,
    pub metadata: CursorMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_window: Option<ReplayWindow>,
    // Last transaction id yielded before this cursor was persisted,
    // used to seed deduplication windows on resume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transaction_id: Option<String>,
}

impl CursorState {
    pub fn new(primary: PrimaryCursor, provider_name: impl Into<String>) -> Self {
        Self {
            primary,
            metadata: CursorMetadata {
                provider_name: provider_name.into(),
                custom: None,
            },
            replay_window: None,
            last_transaction_id: None,
        }
    }

    pub fn owned_by(&self, provider: &str) -> bool {
        self.metadata.provider_name == provider
    }

    pub fn custom_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .custom
            .as_ref()
            .and_then(|map| map.get(key))
            .and_then(Value::as_str)
    }

    pub fn custom_u64(&self, key: &str) -> Option<u64> {
        self.metadata
            .custom
            .as_ref()
            .and_then(|map| map.get(key))
            .and_then(Value::as_u64)
    }

    // Rewind the primary cursor by a replay window. Only meaningful for
    // cursor kinds with a numeric order; opaque cursors are returned as-is
    // and the provider handles page replay through its custom metadata.
    pub fn rewound(&self, window: ReplayWindow) -> Self {
        let mut cursor = self.clone();
        let position = match (window, self.primary.kind) {
            (ReplayWindow::Blocks(n), CursorType::BlockNumber) => {
                self.primary.position().map(|p| p.saturating_sub(n))
            }
            (ReplayWindow::Seconds(s), CursorType::Timestamp) => {
                self.primary.position().map(|p| p.saturating_sub(s))
            }
            _ => None,
        };

        if let Some(position) = position {
            cursor.primary.value = position.to_string();
        }

        cursor
    }

    // Prepare this cursor for a provider that did not emit it: the owning
    // provider's custom pagination state is opaque to everyone else, so it
    // is stripped, and the adopting provider's replay window is applied so
    // the takeover re-pulls a small overlap (removed again by dedup).
    pub fn adopted_by(&self, provider: &str, window: Option<ReplayWindow>) -> Self {
        if self.owned_by(provider) {
            return self.clone();
        }

        let mut cursor = self.clone();
        cursor.metadata.custom = None;
        if let Some(window) = window {
            cursor = cursor.rewound(window);
        }

        cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_only_for_ordered_kinds() {
        assert_eq!(PrimaryCursor::block(120).position(), Some(120));
        assert_eq!(PrimaryCursor::timestamp(1700000000).position(), Some(1700000000));
        assert_eq!(PrimaryCursor::tx_hash("0xabc").position(), None);
        assert_eq!(PrimaryCursor::page_token("p2").position(), None);
    }

    #[test]
    fn test_rewound_saturates_at_zero() {
        let cursor = CursorState::new(PrimaryCursor::block(3), "p1");
        let rewound = cursor.rewound(ReplayWindow::Blocks(10));
        assert_eq!(rewound.primary.value, "0");
    }

    #[test]
    fn test_rewound_ignores_mismatched_units() {
        let cursor = CursorState::new(PrimaryCursor::page_token("tok"), "p1");
        let rewound = cursor.rewound(ReplayWindow::Blocks(5));
        assert_eq!(rewound.primary.value, "tok");
    }

    #[test]
    fn test_adopted_by_strips_foreign_custom_and_rewinds() {
        let mut cursor = CursorState::new(PrimaryCursor::block(110), "p1");
        let mut custom = Map::new();
        custom.insert("page".into(), Value::from(7));
        cursor.metadata.custom = Some(custom);

        let adopted = cursor.adopted_by("p2", Some(ReplayWindow::Blocks(5)));
        assert!(adopted.metadata.custom.is_none());
        assert_eq!(adopted.primary.value, "105");

        // Own cursor is returned untouched
        let own = cursor.adopted_by("p1", Some(ReplayWindow::Blocks(5)));
        assert_eq!(own, cursor);
    }

    #[test]
    fn test_cursor_serde_round_trip() {
        let mut cursor = CursorState::new(PrimaryCursor::timestamp(1700000000), "kraken_api");
        cursor.replay_window = Some(ReplayWindow::Seconds(300));
        cursor.last_transaction_id = Some("L1234-ABCD".into());

        let json = serde_json::to_value(&cursor).unwrap();
        assert_eq!(json["primary"]["kind"], "timestamp");
        assert_eq!(json["replay_window"]["unit"], "seconds");

        let back: CursorState = serde_json::from_value(json).unwrap();
        assert_eq!(back, cursor);
    }
}
