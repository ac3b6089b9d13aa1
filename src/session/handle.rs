use super::pairing::PairingFlow;
use super::registry::WeakRegistry;
use super::state::{ConnectionState, Effect};
use crate::error::{InitError, SessionError};
use crate::protocol::{ClientParts, ProtoError, ProtocolClient, ProtocolEvent};
use crate::store::StoreError;
use crate::types::InstanceId;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// What the session task last published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: ConnectionState,
    /// Set when the durable write for the latest transition failed.
    pub write_error: Option<StoreError>,
}

type Reply = oneshot::Sender<Result<(), SessionError>>;

enum HandleCommand {
    Connect(Reply),
    Disconnect(Reply),
    Logout(Reply),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Live protocol client of one instance.
///
/// All state changes happen on the handle's own task: explicit operations go
/// through its mailbox and protocol events through the client's event stream,
/// so the two never race. Read-only queries go straight to the client.
pub struct ClientHandle {
    instance_id: InstanceId,
    serial: u64,
    client: Arc<dyn ProtocolClient>,
    status: watch::Receiver<Snapshot>,
    commands: mpsc::Sender<HandleCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientHandle {
    /// Starts the session task and returns a handle in `Uninitialized`.
    pub(crate) fn spawn(
        instance_id: InstanceId,
        parts: ClientParts,
        pairing: PairingFlow,
        registry: WeakRegistry,
        mailbox_capacity: usize,
    ) -> Arc<Self> {
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        let (command_tx, command_rx) = mpsc::channel(mailbox_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(Snapshot {
            state: ConnectionState::Uninitialized,
            write_error: None,
        });

        let worker = SessionTask {
            instance_id,
            serial,
            client: parts.client.clone(),
            events: parts.events,
            commands: command_rx,
            status: status_tx,
            pairing,
            registry,
        };
        let task = tokio::spawn(worker.run());

        Arc::new(Self {
            instance_id,
            serial,
            client: parts.client,
            status: status_rx,
            commands: command_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn snapshot(&self) -> Snapshot {
        self.status.borrow().clone()
    }

    pub fn client(&self) -> &Arc<dyn ProtocolClient> {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn is_logged_in(&self) -> bool {
        self.client.is_logged_in()
    }

    /// Waits until the published state satisfies `predicate` and returns it.
    /// Returns the last state if the session task stops first.
    pub async fn wait_until<F>(&self, mut predicate: F) -> ConnectionState
    where
        F: FnMut(ConnectionState) -> bool,
    {
        let mut status = self.status.clone();
        match status.wait_for(|s| predicate(s.state)).await {
            Ok(snapshot) => snapshot.state,
            Err(_) => self.state(),
        }
    }

    /// Waits for initialization to settle. No timeout here; the caller bounds it.
    pub async fn wait_ready(&self) -> Result<(), InitError> {
        let mut status = self.status.clone();
        let snapshot = match status.wait_for(|s| s.state.is_settled()).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => {
                return Err(InitError::ClientCreationFailed(format!(
                    "session task of instance {} stopped during initialization",
                    self.instance_id
                )));
            }
        };

        match snapshot.state {
            ConnectionState::AwaitingPairing | ConnectionState::Connected => {
                match snapshot.write_error {
                    Some(e) => Err(InitError::Store(e)),
                    None => Ok(()),
                }
            }
            ConnectionState::LoggedOut => Err(InitError::Proto(ProtoError::LoggedOut)),
            _ => Err(InitError::Proto(ProtoError::StreamClosed)),
        }
    }

    /// Starts a connection attempt. A no-op unless `Uninitialized` or `Disconnected`.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.request(HandleCommand::Connect).await
    }

    /// Closes the stream and keeps the pairing.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(HandleCommand::Disconnect).await
    }

    /// Revokes the pairing, clears it from storage and evicts this handle.
    pub async fn logout(&self) -> Result<(), SessionError> {
        match self.request(HandleCommand::Logout).await {
            Err(_) if self.state() == ConnectionState::LoggedOut => Ok(()),
            other => other,
        }
    }

    /// Disconnects gracefully and waits for the session task to finish.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(HandleCommand::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Session task of instance {} failed: {e}", self.instance_id);
            }
        }
    }

    async fn request(&self, command: fn(Reply) -> HandleCommand) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(command(tx)).await.is_err() {
            return Err(self.stopped_error());
        }
        rx.await.unwrap_or_else(|_| Err(self.stopped_error()))
    }

    fn stopped_error(&self) -> SessionError {
        match self.state() {
            ConnectionState::LoggedOut => SessionError::Proto(ProtoError::LoggedOut),
            _ => SessionError::NotConnected,
        }
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("instance_id", &self.instance_id)
            .field("serial", &self.serial)
            .field("state", &self.state())
            .finish()
    }
}

/// The single writer of a handle's state.
struct SessionTask {
    instance_id: InstanceId,
    serial: u64,
    client: Arc<dyn ProtocolClient>,
    events: mpsc::Receiver<ProtocolEvent>,
    commands: mpsc::Receiver<HandleCommand>,
    status: watch::Sender<Snapshot>,
    pairing: PairingFlow,
    registry: WeakRegistry,
}

impl SessionTask {
    async fn run(mut self) {
        debug!("Session task for instance {} started", self.instance_id);
        let mut events_open = true;

        loop {
            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // Every handle was dropped.
                    None => Flow::Stop,
                },
                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        debug!("Event stream of instance {} ended", self.instance_id);
                        events_open = false;
                        self.handle_event(ProtocolEvent::StreamClosed).await
                    }
                },
            };
            if flow == Flow::Stop {
                break;
            }
        }

        debug!("Session task for instance {} stopped", self.instance_id);
    }

    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    fn publish(&self, state: ConnectionState, write_error: Option<StoreError>) {
        self.status.send_replace(Snapshot { state, write_error });
    }

    async fn handle_event(&mut self, event: ProtocolEvent) -> Flow {
        let current = self.state();
        let (next, effect) = current.on_event(&event);
        debug!(
            "Instance {}: {} in {current} -> {next}",
            self.instance_id,
            event.name()
        );

        let write_error = match self.apply(effect).await {
            Ok(()) => None,
            Err(e) => {
                error!(
                    "Failed to persist {} for instance {}: {e}",
                    event.name(),
                    self.instance_id
                );
                Some(e)
            }
        };

        if next == ConnectionState::LoggedOut && current != ConnectionState::LoggedOut {
            info!("Instance {} was logged out remotely", self.instance_id);
            self.client.disconnect().await;
            self.retire(next, write_error);
            return Flow::Stop;
        }

        match next {
            ConnectionState::Connected if current != ConnectionState::Connected => {
                info!("Instance {} connected", self.instance_id);
            }
            ConnectionState::Disconnected if current != ConnectionState::Disconnected => {
                warn!("Instance {} lost its stream", self.instance_id);
            }
            _ => {}
        }
        self.publish(next, write_error);
        Flow::Continue
    }

    async fn apply(&self, effect: Effect) -> Result<(), StoreError> {
        match effect {
            Effect::None => Ok(()),
            Effect::StoreQr(payload) => self.pairing.store_qr(&payload).await,
            Effect::ClearQr => self.pairing.clear_qr().await,
            Effect::StorePairing(identity) => self.pairing.store_pairing(&identity).await,
            Effect::SetConnected(connected) => self.pairing.set_connected(connected).await,
            Effect::ClearPairing => self.pairing.clear_pairing().await,
        }
    }

    async fn handle_command(&mut self, command: HandleCommand) -> Flow {
        match command {
            HandleCommand::Connect(reply) => {
                let result = self.connect().await;
                let _ = reply.send(result);
                Flow::Continue
            }
            HandleCommand::Disconnect(reply) => {
                let result = self.disconnect().await;
                let _ = reply.send(result);
                Flow::Continue
            }
            HandleCommand::Logout(reply) => {
                let (result, flow) = self.logout().await;
                let _ = reply.send(result);
                flow
            }
            HandleCommand::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                Flow::Stop
            }
        }
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        let state = self.state();
        if !state.can_connect() {
            debug!(
                "Connect ignored for instance {} in state {state}",
                self.instance_id
            );
            return Ok(());
        }

        info!("Connecting instance {}", self.instance_id);
        self.publish(ConnectionState::Initializing, None);
        if let Err(e) = self.client.connect().await {
            warn!("Failed to connect instance {}: {e}", self.instance_id);
            self.publish(ConnectionState::Disconnected, None);
            return Err(SessionError::Proto(e));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), SessionError> {
        let state = self.state();
        if !state.can_disconnect() {
            debug!(
                "Disconnect ignored for instance {} in state {state}",
                self.instance_id
            );
            return Ok(());
        }

        info!("Disconnecting instance {}", self.instance_id);
        self.client.disconnect().await;
        let result = if state == ConnectionState::AwaitingPairing {
            self.pairing.clear_qr().await
        } else {
            self.pairing.set_connected(false).await
        };
        self.publish(ConnectionState::Disconnected, None);
        result.map_err(SessionError::Store)
    }

    async fn logout(&mut self) -> (Result<(), SessionError>, Flow) {
        if self.client.is_logged_in() {
            if let Err(e) = self.client.logout().await {
                warn!("Logout of instance {} failed: {e}", self.instance_id);
                return (Err(SessionError::Proto(e)), Flow::Continue);
            }
        }

        info!("Logging out instance {}", self.instance_id);
        self.client.disconnect().await;
        let result = self.pairing.clear_pairing().await;
        self.retire(ConnectionState::LoggedOut, None);
        (result.map_err(SessionError::Store), Flow::Stop)
    }

    /// Publishes the final state and takes this handle out of the registry in
    /// one step. A build that has not registered the handle yet sees the
    /// final state and drops it.
    fn retire(&self, state: ConnectionState, write_error: Option<StoreError>) {
        self.registry
            .evict_then(self.instance_id, self.serial, || self.publish(state, write_error));
    }

    async fn shutdown(&mut self) {
        let state = self.state();
        if state.can_disconnect() {
            self.client.disconnect().await;
            // A QR is only valid for the stream that issued it.
            let result = if state == ConnectionState::AwaitingPairing {
                self.pairing.clear_qr().await
            } else {
                self.pairing.set_connected(false).await
            };
            if let Err(e) = result {
                warn!(
                    "Failed to reset stored state of instance {} on shutdown: {e}",
                    self.instance_id
                );
            }
            self.publish(ConnectionState::Disconnected, None);
        }
        debug!("Instance {} shut down from state {state}", self.instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientFactory;
    use crate::protocol::ClientSpec;
    use crate::protocol::mock::{MockBehavior, MockFactory};
    use crate::session::pairing::RetryPolicy;
    use crate::session::registry::SessionRegistry;
    use crate::store::{InstanceStore, MemoryStore};
    use crate::types::{EventFilter, NewInstance};
    use std::time::Duration;

    struct Fixture {
        store: MemoryStore,
        factory: MockFactory,
        handle: Arc<ClientHandle>,
        _registry: SessionRegistry,
    }

    async fn fixture(behavior: MockBehavior, identity: Option<&str>) -> Fixture {
        let store = MemoryStore::new();
        let row = store
            .insert_instance(NewInstance {
                account_id: 1,
                name: "handle".into(),
                token: "T1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        if let Some(identity) = identity {
            store.update_pairing(row.id, identity).await.unwrap();
        }

        let factory = MockFactory::new().with_behavior(behavior);
        let parts = factory
            .create(&ClientSpec {
                instance_id: row.id,
                token: row.token.clone(),
                pairing_identity: identity.map(str::to_string),
                events: EventFilter::All,
            })
            .await
            .unwrap();
        let registry = SessionRegistry::new();
        let retry = RetryPolicy {
            attempts: 2,
            backoff: Duration::from_millis(1),
        };
        let pairing = PairingFlow::new(Arc::new(store.clone()), row.id, retry);
        let handle = ClientHandle::spawn(row.id, parts, pairing, registry.downgrade(), 8);

        Fixture {
            store,
            factory,
            handle,
            _registry: registry,
        }
    }

    #[tokio::test]
    async fn test_connect_unpaired_awaits_pairing() {
        let fx = fixture(MockBehavior::Auto, None).await;
        assert_eq!(fx.handle.state(), ConnectionState::Uninitialized);

        fx.handle.connect().await.unwrap();
        fx.handle.wait_ready().await.unwrap();
        assert_eq!(fx.handle.state(), ConnectionState::AwaitingPairing);

        let row = fx.store.get_instance(fx.handle.instance_id()).await.unwrap().unwrap();
        assert_eq!(row.qr_code(), Some("qr-1-1"));
    }

    #[tokio::test]
    async fn test_connect_while_connected_is_noop() {
        let fx = fixture(MockBehavior::Auto, Some("5511@s.whatsapp.net")).await;
        fx.handle.connect().await.unwrap();
        fx.handle.wait_ready().await.unwrap();
        assert_eq!(fx.handle.state(), ConnectionState::Connected);

        fx.handle.connect().await.unwrap();
        let client = fx.factory.client(fx.handle.instance_id()).unwrap();
        assert_eq!(client.connect_calls(), 1);
        assert_eq!(fx.handle.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_keeps_pairing() {
        let fx = fixture(MockBehavior::Auto, Some("5511@s.whatsapp.net")).await;
        fx.handle.connect().await.unwrap();
        fx.handle.wait_ready().await.unwrap();

        fx.handle.disconnect().await.unwrap();
        assert_eq!(fx.handle.state(), ConnectionState::Disconnected);

        let row = fx.store.get_instance(fx.handle.instance_id()).await.unwrap().unwrap();
        assert_eq!(row.pairing_identity(), Some("5511@s.whatsapp.net"));
        assert!(!row.connected);

        // Second disconnect has nothing to close.
        fx.handle.disconnect().await.unwrap();
        let client = fx.factory.client(fx.handle.instance_id()).unwrap();
        assert_eq!(client.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn test_stream_closed_then_reconnect() {
        let fx = fixture(MockBehavior::Auto, Some("5511@s.whatsapp.net")).await;
        fx.handle.connect().await.unwrap();
        fx.handle.wait_ready().await.unwrap();

        let client = fx.factory.client(fx.handle.instance_id()).unwrap();
        client.close_stream().await;
        let state = fx
            .handle
            .wait_until(|s| s == ConnectionState::Disconnected)
            .await;
        assert_eq!(state, ConnectionState::Disconnected);

        fx.handle.connect().await.unwrap();
        let state = fx.handle.wait_until(|s| s == ConnectionState::Connected).await;
        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(client.connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_connect_settles_disconnected() {
        let fx = fixture(MockBehavior::Auto, None).await;
        let client = fx.factory.client(fx.handle.instance_id()).unwrap();
        client
            .fail_connect(Some(ProtoError::Transport("refused".into())))
            .await;

        let result = fx.handle.connect().await;
        assert!(matches!(result, Err(SessionError::Proto(ProtoError::Transport(_)))));
        assert_eq!(fx.handle.state(), ConnectionState::Disconnected);
        assert!(matches!(
            fx.handle.wait_ready().await,
            Err(InitError::Proto(ProtoError::StreamClosed))
        ));
    }

    #[tokio::test]
    async fn test_logout_failure_keeps_state() {
        let fx = fixture(MockBehavior::Auto, Some("5511@s.whatsapp.net")).await;
        fx.handle.connect().await.unwrap();
        fx.handle.wait_ready().await.unwrap();

        let client = fx.factory.client(fx.handle.instance_id()).unwrap();
        client
            .fail_logout(Some(ProtoError::Transport("timeout".into())))
            .await;

        let result = fx.handle.logout().await;
        assert!(matches!(result, Err(SessionError::Proto(_))));
        assert_eq!(fx.handle.state(), ConnectionState::Connected);

        let row = fx.store.get_instance(fx.handle.instance_id()).await.unwrap().unwrap();
        assert_eq!(row.pairing_identity(), Some("5511@s.whatsapp.net"));
    }

    #[tokio::test]
    async fn test_pairing_write_failure_is_reported() {
        let fx = fixture(MockBehavior::Silent, None).await;
        fx.handle.connect().await.unwrap();

        fx.store.fail_next_writes(2);
        let client = fx.factory.client(fx.handle.instance_id()).unwrap();
        client.emit(ProtocolEvent::QrIssued("q1".into())).await;

        let result = fx.handle.wait_ready().await;
        assert!(matches!(result, Err(InitError::Store(_))));
        assert_eq!(fx.handle.state(), ConnectionState::AwaitingPairing);

        // The next successful write clears the error.
        client.emit(ProtocolEvent::QrIssued("q2".into())).await;
        let mut status = fx.handle.status.clone();
        status
            .wait_for(|s| s.write_error.is_none())
            .await
            .unwrap();
        let row = fx.store.get_instance(fx.handle.instance_id()).await.unwrap().unwrap();
        assert_eq!(row.qr_code(), Some("q2"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_task() {
        let fx = fixture(MockBehavior::Auto, Some("5511@s.whatsapp.net")).await;
        fx.handle.connect().await.unwrap();
        fx.handle.wait_ready().await.unwrap();

        fx.handle.shutdown().await;
        assert_eq!(fx.handle.state(), ConnectionState::Disconnected);
        assert!(matches!(
            fx.handle.connect().await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_while_awaiting_pairing_clears_qr() {
        let fx = fixture(MockBehavior::Auto, None).await;
        fx.handle.connect().await.unwrap();
        fx.handle.wait_ready().await.unwrap();
        let id = fx.handle.instance_id();
        assert!(fx.store.get_instance(id).await.unwrap().unwrap().qr_code().is_some());

        fx.handle.shutdown().await;
        let row = fx.store.get_instance(id).await.unwrap().unwrap();
        assert_eq!(row.qr_code(), None);
        assert!(!row.connected);
    }

    #[tokio::test]
    async fn test_write_error_keeps_store_error_kind() {
        let missing = InstanceId(999);
        let factory = MockFactory::new();
        let parts = factory
            .create(&ClientSpec {
                instance_id: missing,
                token: "T9".into(),
                pairing_identity: None,
                events: EventFilter::All,
            })
            .await
            .unwrap();
        let registry = SessionRegistry::new();
        let retry = RetryPolicy {
            attempts: 2,
            backoff: Duration::from_millis(1),
        };
        let pairing = PairingFlow::new(Arc::new(MemoryStore::new()), missing, retry);
        let handle = ClientHandle::spawn(missing, parts, pairing, registry.downgrade(), 4);

        handle.connect().await.unwrap();
        let err = handle.wait_ready().await.unwrap_err();
        assert!(matches!(err, InitError::Store(StoreError::NotFound(_))));
        assert!(matches!(
            SessionError::from(err),
            SessionError::Store(StoreError::NotFound(_))
        ));
    }
}
