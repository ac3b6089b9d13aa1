use crate::store::{InstanceStore, StoreError};
use crate::types::InstanceId;
use log::{debug, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Bounded retry for event-driven writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Persists pairing progress of one instance.
///
/// Driven only by the owning handle's task, so writes land in event order and
/// the stored QR is always the latest one.
#[derive(Clone)]
pub struct PairingFlow {
    store: Arc<dyn InstanceStore>,
    instance_id: InstanceId,
    retry: RetryPolicy,
}

impl PairingFlow {
    pub fn new(store: Arc<dyn InstanceStore>, instance_id: InstanceId, retry: RetryPolicy) -> Self {
        Self {
            store,
            instance_id,
            retry,
        }
    }

    pub async fn store_qr(&self, payload: &str) -> Result<(), StoreError> {
        debug!("Storing new QR payload for instance {}", self.instance_id);
        self.with_retry("QR payload", || {
            self.store.update_qr_code(self.instance_id, payload)
        })
        .await
    }

    pub async fn clear_qr(&self) -> Result<(), StoreError> {
        self.with_retry("QR payload", || self.store.update_qr_code(self.instance_id, ""))
            .await
    }

    /// Writes the identity and clears the QR in one update.
    pub async fn store_pairing(&self, identity: &str) -> Result<(), StoreError> {
        self.with_retry("pairing identity", || {
            self.store.update_pairing(self.instance_id, identity)
        })
        .await
    }

    pub async fn set_connected(&self, connected: bool) -> Result<(), StoreError> {
        self.with_retry("connected flag", || {
            self.store.update_connected(self.instance_id, connected)
        })
        .await
    }

    pub async fn clear_pairing(&self) -> Result<(), StoreError> {
        self.with_retry("pairing reset", || self.store.clear_pairing(self.instance_id))
            .await
    }

    async fn with_retry<F, Fut>(&self, what: &str, mut op: F) -> Result<(), StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), StoreError>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                // A vanished row will not come back by retrying.
                Err(e @ StoreError::NotFound(_)) => return Err(e),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(
                        "Writing {what} for instance {} failed (attempt {attempt}/{attempts}): {e}",
                        self.instance_id
                    );
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                    attempt += 1;
                }
            }
        }
    }
}
