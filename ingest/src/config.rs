use std::time::Duration;

// Recent-transaction ids kept to filter overlapping fetches. Applies to
// both the in-provider window and the cross-provider window in the manager.
pub const DEDUP_WINDOW_SIZE: usize = 500;

// Circuit breaker: open after this many failures inside the window,
// stay open for the cooldown, then allow a single half-open probe
pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
pub const CIRCUIT_FAILURE_WINDOW_SECS: u64 = 120;
pub const CIRCUIT_COOLDOWN_SECS: u64 = 60;

// One-shot response cache
pub const RESPONSE_CACHE_SIZE: usize = 256;
pub const RESPONSE_CACHE_TTL: Duration = Duration::from_secs(30);

// Default per-provider HTTP settings, overridable per provider metadata
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

// Derived-phase batching
pub const EXCHANGE_PROCESS_BATCH_SIZE: usize = 500;
pub const HASH_GROUP_TARGET_SIZE: usize = 100;

// Advisory event bus
pub const EVENT_BUS_CAPACITY: usize = 256;
