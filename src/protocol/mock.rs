//! Scriptable in-process protocol double.
//!
//! [`MockFactory`] counts constructions and can be told to fail; every client
//! it builds is kept so tests can inject events and inspect calls.

use super::{ClientFactory, ClientParts, ClientSpec, ProtoError, ProtocolClient, ProtocolEvent};
use crate::types::{Contact, GroupInfo, InstanceId, ProfilePicture};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

const EVENT_BUFFER: usize = 64;

/// How a mock client reacts to `connect()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MockBehavior {
    /// Paired clients report `Connected`, unpaired ones issue a QR.
    #[default]
    Auto,
    /// `connect()` emits nothing; the test drives every event.
    Silent,
    /// The server revoked the pairing: `connect()` is answered with `LoggedOut`.
    Revoked,
}

#[derive(Default)]
struct FactoryState {
    created: AtomicUsize,
    failing_creates: AtomicUsize,
    clients: DashMap<InstanceId, Arc<MockClient>>,
    per_instance: DashMap<InstanceId, usize>,
}

#[derive(Clone, Default)]
pub struct MockFactory {
    behavior: MockBehavior,
    create_delay: Duration,
    state: Arc<FactoryState>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(mut self, behavior: MockBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Makes every construction take `delay`, widening race windows.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Total number of `create` calls, failed ones included.
    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn created_for(&self, instance_id: InstanceId) -> usize {
        self.state
            .per_instance
            .get(&instance_id)
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.state.failing_creates.store(count, Ordering::SeqCst);
    }

    /// The most recently built client for an instance.
    pub fn client(&self, instance_id: InstanceId) -> Option<Arc<MockClient>> {
        self.state
            .clients
            .get(&instance_id)
            .map(|client| client.clone())
    }
}

#[async_trait]
impl ClientFactory for MockFactory {
    async fn create(&self, spec: &ClientSpec) -> Result<ClientParts, ProtoError> {
        self.state.created.fetch_add(1, Ordering::SeqCst);
        *self
            .state
            .per_instance
            .entry(spec.instance_id)
            .or_insert(0) += 1;

        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }

        let failing = self
            .state
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            debug!("Mock factory failing construction for instance {}", spec.instance_id);
            return Err(ProtoError::Transport("injected construction failure".to_string()));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let client = Arc::new(MockClient::new(spec.clone(), self.behavior, tx));
        self.state.clients.insert(spec.instance_id, client.clone());

        Ok(ClientParts {
            client,
            events: rx,
        })
    }
}

pub struct MockClient {
    spec: ClientSpec,
    behavior: MockBehavior,
    events: mpsc::Sender<ProtocolEvent>,
    connected: AtomicBool,
    logged_in: AtomicBool,
    qr_counter: AtomicUsize,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    connect_error: Mutex<Option<ProtoError>>,
    logout_error: Mutex<Option<ProtoError>>,
    picture_error: Mutex<Option<ProtoError>>,
    contacts: Mutex<Vec<Contact>>,
    groups: Mutex<Vec<GroupInfo>>,
    pictures: Mutex<HashMap<String, ProfilePicture>>,
}

impl MockClient {
    fn new(spec: ClientSpec, behavior: MockBehavior, events: mpsc::Sender<ProtocolEvent>) -> Self {
        let logged_in = spec.pairing_identity.is_some();
        Self {
            spec,
            behavior,
            events,
            connected: AtomicBool::new(false),
            logged_in: AtomicBool::new(logged_in),
            qr_counter: AtomicUsize::new(0),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            connect_error: Mutex::new(None),
            logout_error: Mutex::new(None),
            picture_error: Mutex::new(None),
            contacts: Mutex::new(Vec::new()),
            groups: Mutex::new(Vec::new()),
            pictures: Mutex::new(HashMap::new()),
        }
    }

    pub fn spec(&self) -> &ClientSpec {
        &self.spec
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    /// Pushes an event as if the library produced it.
    pub async fn emit(&self, event: ProtocolEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Mock client {} has no event consumer", self.spec.instance_id);
        }
    }

    /// Completes pairing from the phone side.
    pub async fn pair(&self, identity: &str) {
        self.logged_in.store(true, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        self.emit(ProtocolEvent::Paired(identity.to_string())).await;
    }

    pub async fn close_stream(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(ProtocolEvent::StreamClosed).await;
    }

    /// Revokes the pairing remotely.
    pub async fn revoke(&self) {
        self.logged_in.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.emit(ProtocolEvent::LoggedOut).await;
    }

    pub async fn fail_connect(&self, error: Option<ProtoError>) {
        *self.connect_error.lock().await = error;
    }

    pub async fn fail_logout(&self, error: Option<ProtoError>) {
        *self.logout_error.lock().await = error;
    }

    pub async fn fail_profile_picture(&self, error: Option<ProtoError>) {
        *self.picture_error.lock().await = error;
    }

    pub async fn set_contacts(&self, contacts: Vec<Contact>) {
        *self.contacts.lock().await = contacts;
    }

    pub async fn set_groups(&self, groups: Vec<GroupInfo>) {
        *self.groups.lock().await = groups;
    }

    pub async fn set_profile_picture(&self, jid: &str, picture: ProfilePicture) {
        self.pictures.lock().await.insert(jid.to_string(), picture);
    }

    fn ensure_connected(&self) -> Result<(), ProtoError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProtoError::NotConnected)
        }
    }
}

#[async_trait]
impl ProtocolClient for MockClient {
    async fn connect(&self) -> Result<(), ProtoError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.connect_error.lock().await.clone() {
            return Err(err);
        }
        self.connected.store(true, Ordering::SeqCst);

        let event = match self.behavior {
            MockBehavior::Silent => return Ok(()),
            MockBehavior::Revoked => {
                self.logged_in.store(false, Ordering::SeqCst);
                self.connected.store(false, Ordering::SeqCst);
                ProtocolEvent::LoggedOut
            }
            MockBehavior::Auto if self.logged_in.load(Ordering::SeqCst) => ProtocolEvent::Connected,
            MockBehavior::Auto => {
                let n = self.qr_counter.fetch_add(1, Ordering::SeqCst) + 1;
                ProtocolEvent::QrIssued(format!("qr-{}-{n}", self.spec.instance_id))
            }
        };
        // The consumer is busy awaiting this very call, so never block on it.
        if let Err(e) = self.events.try_send(event) {
            warn!("Mock client {} dropped event: {e}", self.spec.instance_id);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn logout(&self) -> Result<(), ProtoError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.logout_error.lock().await.clone() {
            return Err(err);
        }
        if !self.logged_in.load(Ordering::SeqCst) {
            return Err(ProtoError::NotLoggedIn);
        }
        self.logged_in.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    async fn get_contacts(&self) -> Result<Vec<Contact>, ProtoError> {
        self.ensure_connected()?;
        Ok(self.contacts.lock().await.clone())
    }

    async fn get_joined_groups(&self) -> Result<Vec<GroupInfo>, ProtoError> {
        self.ensure_connected()?;
        Ok(self.groups.lock().await.clone())
    }

    async fn get_profile_picture(&self, jid: &str) -> Result<Option<ProfilePicture>, ProtoError> {
        if let Some(err) = self.picture_error.lock().await.clone() {
            return Err(err);
        }
        self.ensure_connected()?;
        self.pictures
            .lock()
            .await
            .get(jid)
            .cloned()
            .map(Some)
            .ok_or_else(|| ProtoError::NotFound(format!("profile picture of {jid}")))
    }
}
