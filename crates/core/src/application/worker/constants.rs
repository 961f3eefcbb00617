// Orchestration constants (No magic values)
use std::time::Duration;

/// Sleep duration after a worker error before consuming again (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

/// Broker consume block per poll (2s)
pub const DEFAULT_CONSUME_BLOCK: Duration = Duration::from_secs(2);

/// Consecutive consume failures before a worker gives up on the broker
pub const MAX_CONSECUTIVE_BROKER_ERRORS: u32 = 5;

/// Heartbeat while a worker process runs (10s), must stay below the stall window
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Broker connect + readiness budget at startup (1.5s)
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Active job without a heartbeat for this long is stalled (30s)
pub const DEFAULT_STALL_WINDOW_MS: i64 = 30_000;

/// How often the stall detector sweeps (15s)
pub const DEFAULT_STALL_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Stall requeues before the job is failed
pub const DEFAULT_MAX_STALL_RETRIES: u32 = 1;

/// Retry budgets per kind
pub const DOWNLOAD_MAX_ATTEMPTS: u32 = 3;
pub const PARSE_MAX_ATTEMPTS: u32 = 5;
pub const GENERATE_MAX_ATTEMPTS: u32 = 3;

/// Backoff base per kind (ms)
pub const DOWNLOAD_BASE_DELAY_MS: i64 = 5_000;
pub const PARSE_BASE_DELAY_MS: i64 = 3_000;
pub const GENERATE_BASE_DELAY_MS: i64 = 5_000;

/// delay = base * factor^(attempt - 1)
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Worker slots per kind
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 2;
pub const DEFAULT_PARSE_CONCURRENCY: usize = 2;
pub const DEFAULT_GENERATE_CONCURRENCY: usize = 1;

/// Upper bound on each status list returned by a listing call
pub const LISTING_LIMIT: u32 = 500;
