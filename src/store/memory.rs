use super::error::{Result, StoreError};
use super::traits::InstanceStore;
use crate::types::{AccountId, InstanceId, InstanceRow, NewInstance};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// In-memory instance store for tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryStore {
    rows: Arc<RwLock<BTreeMap<InstanceId, InstanceRow>>>,
    next_id: Arc<RwLock<i32>>,
    // Number of upcoming writes that should fail, for exercising retry paths.
    failing_writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` write operations fail with a database error.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Database("injected write failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    async fn modify<F>(&self, id: InstanceId, f: F) -> Result<()>
    where
        F: FnOnce(&mut InstanceRow),
    {
        self.check_write()?;
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("instance {id}")))?;
        f(row);
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn insert_instance(&self, instance: NewInstance) -> Result<InstanceRow> {
        self.check_write()?;
        let mut rows = self.rows.write().await;
        if rows.values().any(|row| row.token == instance.token) {
            return Err(StoreError::Duplicate("instance token".to_string()));
        }

        let mut next_id = self.next_id.write().await;
        *next_id += 1;
        let row = InstanceRow {
            id: InstanceId(*next_id),
            account_id: AccountId(instance.account_id),
            name: instance.name,
            token: instance.token,
            webhook: instance.webhook,
            pairing_identity: String::new(),
            qr_code: String::new(),
            connected: false,
            events: instance.events,
            expiration: instance.expiration,
        };
        rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_instance(&self, id: InstanceId) -> Result<Option<InstanceRow>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn get_instance_by_token(&self, token: &str) -> Result<Option<InstanceRow>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|row| row.token == token)
            .cloned())
    }

    async fn get_instance_by_id_and_account(
        &self,
        id: InstanceId,
        account_id: AccountId,
    ) -> Result<Option<InstanceRow>> {
        Ok(self
            .rows
            .read()
            .await
            .get(&id)
            .filter(|row| row.account_id == account_id)
            .cloned())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRow>> {
        Ok(self.rows.read().await.values().cloned().collect())
    }

    async fn list_instances_by_account(&self, account_id: AccountId) -> Result<Vec<InstanceRow>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|row| row.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn update_qr_code(&self, id: InstanceId, payload: &str) -> Result<()> {
        self.modify(id, |row| row.qr_code = payload.to_string()).await
    }

    async fn update_pairing(&self, id: InstanceId, identity: &str) -> Result<()> {
        self.modify(id, |row| {
            row.pairing_identity = identity.to_string();
            row.qr_code.clear();
            row.connected = true;
        })
        .await
    }

    async fn clear_pairing(&self, id: InstanceId) -> Result<()> {
        self.modify(id, |row| {
            row.pairing_identity.clear();
            row.qr_code.clear();
            row.connected = false;
        })
        .await
    }

    async fn update_connected(&self, id: InstanceId, connected: bool) -> Result<()> {
        self.modify(id, |row| row.connected = connected).await
    }
}
