use std::time::Duration;

/// Default per-wait timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Configuration shared by writers and readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Deadline applied to every individual wait, not to the whole transfer.
    pub timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl TransferConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn with_timeout_ms(ms: u64) -> Self {
        Self::with_timeout(Duration::from_millis(ms))
    }
}
