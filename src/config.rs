use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub db_path: String,
    /// Upper bound on how long a request waits for an instance to become ready.
    pub ready_timeout: Duration,
    /// Upper bound on draining all sessions at shutdown.
    pub shutdown_timeout: Duration,
    pub mailbox_capacity: usize,
    /// Attempts for event-driven pairing writes before giving up.
    pub write_retry_attempts: u32,
    pub write_retry_backoff: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            db_path: "wagate.db".to_string(),
            ready_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(10),
            mailbox_capacity: 32,
            write_retry_attempts: 3,
            write_retry_backoff: Duration::from_millis(200),
        }
    }
}
