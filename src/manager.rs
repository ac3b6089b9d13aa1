use crate::config::GatewayConfig;
use crate::error::SessionError;
use crate::protocol::{ClientFactory, ProtoError};
use crate::session::registry::LogoutTarget;
use crate::session::{ClientHandle, ConnectionState, InitializationCoordinator, SessionRegistry};
use crate::store::InstanceStore;
use crate::types::{AccountId, Contact, GroupInfo, InstanceId, InstanceRow, ProfilePicture};
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    pub connected: bool,
    pub logged_in: bool,
    pub state: ConnectionState,
}

/// Caller-facing entry point: resolves instances and runs session operations
/// against their live clients, initializing them on first use.
///
/// Every operation takes the instance id explicitly; ids come from
/// [`resolve`](Self::resolve), which checks ownership.
pub struct InstanceManager {
    store: Arc<dyn InstanceStore>,
    registry: SessionRegistry,
    coordinator: InitializationCoordinator,
    config: GatewayConfig,
}

impl InstanceManager {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        factory: Arc<dyn ClientFactory>,
        config: GatewayConfig,
    ) -> Self {
        let registry = SessionRegistry::new();
        let coordinator =
            InitializationCoordinator::new(registry.clone(), factory, store.clone(), &config);
        Self {
            store,
            registry,
            coordinator,
            config,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Maps an account's instance token to the instance id. A token owned by
    /// another account is indistinguishable from an unknown one.
    pub async fn resolve(&self, account: AccountId, token: &str) -> Result<InstanceId, SessionError> {
        match self.store.get_instance_by_token(token).await? {
            Some(row) if row.account_id == account => Ok(row.id),
            _ => Err(SessionError::NotFound),
        }
    }

    pub async fn list_instances(&self, account: AccountId) -> Result<Vec<InstanceRow>, SessionError> {
        Ok(self.store.list_instances_by_account(account).await?)
    }

    pub async fn ensure_ready(&self, id: InstanceId) -> Result<Arc<ClientHandle>, SessionError> {
        let row = self.load(id).await?;
        let handle = self
            .coordinator
            .ensure_ready(id, &row.token, &row.event_filter(), self.config.ready_timeout)
            .await?;
        Ok(handle)
    }

    pub async fn status(&self, id: InstanceId) -> Result<InstanceStatus, SessionError> {
        let handle = self.ensure_ready(id).await?;
        Ok(InstanceStatus {
            connected: handle.is_connected(),
            logged_in: handle.is_logged_in(),
            state: handle.state(),
        })
    }

    /// The stored QR payload. Never waits; starts initialization in the
    /// background when no client is running so a polling caller gets one.
    ///
    /// A payload is only scannable while the client that issued it runs, so
    /// without a registered client there is none to return.
    pub async fn qr_code(&self, id: InstanceId) -> Result<Option<String>, SessionError> {
        let row = self.load(id).await?;
        if self.registry.get(id).is_none() {
            self.coordinator
                .spawn_init(id, &row.token, &row.event_filter());
            return Ok(None);
        }
        Ok(row.qr_code().map(str::to_string))
    }

    pub async fn connect(&self, id: InstanceId) -> Result<(), SessionError> {
        let handle = self.ensure_ready(id).await?;
        handle.connect().await
    }

    /// Closes the stream of a running instance. Nothing to do when none runs.
    pub async fn disconnect(&self, id: InstanceId) -> Result<(), SessionError> {
        self.load(id).await?;
        match self.registry.get(id) {
            Some(handle) => handle.disconnect().await,
            None => {
                debug!("Disconnect of instance {id}: no running client");
                Ok(())
            }
        }
    }

    /// Logs the instance out and forgets its pairing. Safe to repeat.
    ///
    /// An initialization in flight is cut off: the client it produces is
    /// logged out instead of registered, and the call waits for that, up to
    /// the ready timeout.
    pub async fn logout(&self, id: InstanceId) -> Result<(), SessionError> {
        self.load(id).await?;
        match self.registry.detach_for_logout(id) {
            LogoutTarget::Ready(handle) => handle.logout().await,
            LogoutTarget::Building(build) => {
                self.store.clear_pairing(id).await?;
                let finished =
                    tokio::time::timeout(self.config.ready_timeout, build.finished()).await;
                if finished.is_err() {
                    warn!("Instance {id} is still initializing; it is logged out once it finishes");
                }
                info!("Logged out instance {id} during initialization");
                Ok(())
            }
            LogoutTarget::Idle => {
                self.store.clear_pairing(id).await?;
                info!("Cleared pairing of instance {id} without a running client");
                Ok(())
            }
        }
    }

    pub async fn contacts(&self, id: InstanceId) -> Result<Vec<Contact>, SessionError> {
        let handle = self.connected_handle(id).await?;
        Ok(handle.client().get_contacts().await?)
    }

    pub async fn groups(&self, id: InstanceId) -> Result<Vec<GroupInfo>, SessionError> {
        let handle = self.connected_handle(id).await?;
        Ok(handle.client().get_joined_groups().await?)
    }

    /// Profile picture of `jid` as seen by the instance.
    ///
    /// `Ok(None)` when the instance is not paired, not connected, or the
    /// picture does not exist. Other protocol failures are returned.
    pub async fn avatar(
        &self,
        id: InstanceId,
        jid: &str,
    ) -> Result<Option<ProfilePicture>, SessionError> {
        let row = self.load(id).await?;
        self.fetch_avatar(&row, jid).await
    }

    /// Profile picture of the instance's own paired identity.
    pub async fn own_avatar(
        &self,
        account: AccountId,
        id: InstanceId,
    ) -> Result<Option<ProfilePicture>, SessionError> {
        let row = self
            .store
            .get_instance_by_id_and_account(id, account)
            .await?
            .ok_or(SessionError::NotFound)?;
        match row.pairing_identity() {
            Some(jid) => self.fetch_avatar(&row, jid).await,
            None => Ok(None),
        }
    }

    /// Starts background initialization of every stored, unexpired instance.
    /// Returns how many were started.
    pub async fn warm_up(&self) -> Result<usize, SessionError> {
        let rows = self.store.list_instances().await?;
        let now = Utc::now();
        let mut started = 0;

        for row in &rows {
            if row.is_expired_at(now) {
                debug!("Skipping expired instance {}", row.id);
                continue;
            }
            if self
                .coordinator
                .spawn_init(row.id, &row.token, &row.event_filter())
            {
                started += 1;
            }
        }

        info!("Warm-up started {started} of {} instances", rows.len());
        Ok(started)
    }

    /// Stops new initializations, lets the ones in flight finish, then
    /// disconnects every live client and waits for its task. The whole
    /// sequence is bounded by the configured shutdown timeout.
    pub async fn shutdown(&self) {
        let deadline = Instant::now() + self.config.shutdown_timeout;

        let mut builds = self.registry.close();
        if !builds.is_empty() {
            info!("Waiting for {} initializations to finish", builds.len());
            if !join_all_until(&mut builds, deadline).await {
                warn!(
                    "Shutdown timed out with {} initializations in flight",
                    builds.len()
                );
                builds.abort_all();
            }
        }

        let handles = self.registry.drain();
        if handles.is_empty() {
            return;
        }
        info!("Shutting down {} sessions", handles.len());

        let mut tasks = JoinSet::new();
        for handle in handles {
            tasks.spawn(async move { handle.shutdown().await });
        }
        if !join_all_until(&mut tasks, deadline).await {
            warn!(
                "Shutdown timed out with {} sessions still draining",
                tasks.len()
            );
            tasks.abort_all();
        }
    }

    async fn load(&self, id: InstanceId) -> Result<InstanceRow, SessionError> {
        self.store
            .get_instance(id)
            .await?
            .ok_or(SessionError::NotFound)
    }

    async fn connected_handle(&self, id: InstanceId) -> Result<Arc<ClientHandle>, SessionError> {
        let handle = self.ensure_ready(id).await?;
        if handle.state() != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        Ok(handle)
    }

    async fn fetch_avatar(
        &self,
        row: &InstanceRow,
        jid: &str,
    ) -> Result<Option<ProfilePicture>, SessionError> {
        if row.pairing_identity().is_none() {
            return Ok(None);
        }
        let Some(handle) = self.registry.get(row.id) else {
            return Ok(None);
        };
        if handle.state() != ConnectionState::Connected {
            return Ok(None);
        }

        match handle.client().get_profile_picture(jid).await {
            Ok(picture) => Ok(picture),
            Err(ProtoError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Joins every task in `tasks`. False if `deadline` passed first.
async fn join_all_until(tasks: &mut JoinSet<()>, deadline: Instant) -> bool {
    let joined = tokio::time::timeout_at(deadline, async {
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("Shutdown task failed: {e}");
            }
        }
    })
    .await;
    joined.is_ok()
}
