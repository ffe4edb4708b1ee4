use std::time::Duration;

/// Default delay between retry-session firings for a pending job.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Default resend budget before a stalled job is declared dead.
pub const DEFAULT_MAX_RESENDS: u32 = 10;

/// Default bound on consecutive nonce recoveries for one job.
pub const DEFAULT_MAX_RECOVERY: u32 = 5;

/// Receipt fetch attempts absorbing the mined-to-queryable propagation lag.
pub const RECEIPT_FETCH_ATTEMPTS: u32 = 3;

/// Fixed backoff between receipt fetch attempts.
pub const RECEIPT_FETCH_BACKOFF: Duration = Duration::from_millis(500);

/// Default TTL on nonce records.
pub const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(12 * 60 * 60);
