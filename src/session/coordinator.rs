use super::handle::ClientHandle;
use super::pairing::{PairingFlow, RetryPolicy};
use super::registry::SessionRegistry;
use crate::config::GatewayConfig;
use crate::error::InitError;
use crate::protocol::{ClientFactory, ClientSpec};
use crate::store::InstanceStore;
use crate::types::{EventFilter, InstanceId};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Brings instances from "nothing in memory" to a registered, ready handle.
#[derive(Clone)]
pub struct InitializationCoordinator {
    registry: SessionRegistry,
    factory: Arc<dyn ClientFactory>,
    store: Arc<dyn InstanceStore>,
    retry: RetryPolicy,
    mailbox_capacity: usize,
    default_timeout: Duration,
}

impl InitializationCoordinator {
    pub fn new(
        registry: SessionRegistry,
        factory: Arc<dyn ClientFactory>,
        store: Arc<dyn InstanceStore>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            registry,
            factory,
            store,
            retry: RetryPolicy {
                attempts: config.write_retry_attempts,
                backoff: config.write_retry_backoff,
            },
            mailbox_capacity: config.mailbox_capacity,
            default_timeout: config.ready_timeout,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Returns a ready handle for the instance, building one if needed.
    ///
    /// A handle past initialization is returned as is, whatever its state.
    /// Otherwise the call waits, at most `timeout`, for the build (its own or
    /// one already in flight) to reach `AwaitingPairing` or `Connected`. On
    /// timeout the handle stays registered and a later call picks it up.
    pub async fn ensure_ready(
        &self,
        instance_id: InstanceId,
        token: &str,
        events: &EventFilter,
        timeout: Duration,
    ) -> Result<Arc<ClientHandle>, InitError> {
        if let Some(handle) = self.registry.get(instance_id) {
            if handle.state().is_settled() {
                return Ok(handle);
            }
        }

        let coordinator = self.clone();
        let token = token.to_string();
        let events = events.clone();
        let build = move || async move { coordinator.build(instance_id, token, events).await };
        let wait = async {
            let handle = self.registry.get_or_create(instance_id, build).await?;
            handle.wait_ready().await?;
            Ok(handle)
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Instance {instance_id} not ready after {timeout:?}");
                Err(InitError::Timeout)
            }
        }
    }

    /// Starts initialization in the background without waiting for it.
    /// Returns false when a handle or build already exists, or the registry
    /// is closed.
    pub fn spawn_init(&self, instance_id: InstanceId, token: &str, events: &EventFilter) -> bool {
        if self.registry.is_closed()
            || self.registry.get(instance_id).is_some()
            || self.registry.is_building(instance_id)
        {
            return false;
        }
        let coordinator = self.clone();
        let token = token.to_string();
        let events = events.clone();
        tokio::spawn(async move {
            let timeout = coordinator.default_timeout;
            match coordinator
                .ensure_ready(instance_id, &token, &events, timeout)
                .await
            {
                Ok(handle) => debug!(
                    "Background initialization of instance {instance_id} finished in {}",
                    handle.state()
                ),
                Err(e) => warn!("Background initialization of instance {instance_id} failed: {e}"),
            }
        });
        true
    }

    async fn build(
        &self,
        instance_id: InstanceId,
        token: String,
        events: EventFilter,
    ) -> Result<Arc<ClientHandle>, InitError> {
        let row = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(InitError::NotFound)?;
        let pairing = PairingFlow::new(self.store.clone(), instance_id, self.retry);

        // A QR left by an earlier stream can no longer be scanned.
        if row.pairing_identity().is_none() && row.qr_code().is_some() {
            debug!("Clearing stale QR of instance {instance_id}");
            pairing.clear_qr().await?;
        }

        let spec = ClientSpec {
            instance_id,
            token,
            pairing_identity: row.pairing_identity().map(str::to_string),
            events,
        };
        info!(
            "Creating protocol client for instance {instance_id} ({})",
            if spec.pairing_identity.is_some() { "paired" } else { "unpaired" }
        );
        let parts = self
            .factory
            .create(&spec)
            .await
            .map_err(|e| InitError::ClientCreationFailed(e.to_string()))?;

        if self.registry.is_closed() {
            debug!("Dropping client of instance {instance_id}: shutting down");
            return Err(InitError::ShuttingDown);
        }

        let handle = ClientHandle::spawn(
            instance_id,
            parts,
            pairing,
            self.registry.downgrade(),
            self.mailbox_capacity,
        );

        if let Err(e) = handle.connect().await {
            handle.shutdown().await;
            return Err(InitError::ClientCreationFailed(e.to_string()));
        }
        Ok(handle)
    }
}
