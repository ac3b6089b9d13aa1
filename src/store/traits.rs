use super::error::Result;
use crate::types::{AccountId, InstanceId, InstanceRow, NewInstance};
use async_trait::async_trait;

/// Durable access to instance records.
///
/// Lookups return `Ok(None)` when no row matches; implementations must not
/// distinguish "unknown token" from "token owned by another account".
/// Updates against a missing id return [`StoreError::NotFound`](super::StoreError::NotFound).
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn insert_instance(&self, instance: NewInstance) -> Result<InstanceRow>;

    async fn get_instance(&self, id: InstanceId) -> Result<Option<InstanceRow>>;

    async fn get_instance_by_token(&self, token: &str) -> Result<Option<InstanceRow>>;

    async fn get_instance_by_id_and_account(
        &self,
        id: InstanceId,
        account_id: AccountId,
    ) -> Result<Option<InstanceRow>>;

    async fn list_instances(&self) -> Result<Vec<InstanceRow>>;

    async fn list_instances_by_account(&self, account_id: AccountId) -> Result<Vec<InstanceRow>>;

    /// Overwrites the stored QR payload. An empty payload clears it.
    async fn update_qr_code(&self, id: InstanceId, payload: &str) -> Result<()>;

    /// Stores the pairing identity, clears the QR payload and marks the
    /// instance connected in a single atomic update.
    async fn update_pairing(&self, id: InstanceId, identity: &str) -> Result<()>;

    /// Clears pairing identity and QR payload and marks the instance disconnected.
    async fn clear_pairing(&self, id: InstanceId) -> Result<()>;

    async fn update_connected(&self, id: InstanceId, connected: bool) -> Result<()>;
}
