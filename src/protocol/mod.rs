//! Narrow capability interface over the messaging-protocol library.
//!
//! The session layer never talks to the wire protocol directly. It asks a
//! [`ClientFactory`] for a per-instance [`ProtocolClient`] together with the
//! ordered stream of [`ProtocolEvent`]s that client produces.

pub mod mock;

use crate::types::{Contact, EventFilter, GroupInfo, InstanceId, ProfilePicture};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("stream closed")]
    StreamClosed,
    #[error("client is not connected")]
    NotConnected,
    #[error("client is not logged in")]
    NotLoggedIn,
    #[error("session was logged out")]
    LoggedOut,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Events emitted by a protocol client, delivered in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// A fresh pairing QR payload. Each one supersedes the previous.
    QrIssued(String),
    /// Pairing completed; carries the identity the device was paired as.
    Paired(String),
    /// Login with stored credentials succeeded.
    Connected,
    StreamClosed,
    /// The pairing was revoked from the phone side.
    LoggedOut,
}

impl ProtocolEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolEvent::QrIssued(_) => "QrIssued",
            ProtocolEvent::Paired(_) => "Paired",
            ProtocolEvent::Connected => "Connected",
            ProtocolEvent::StreamClosed => "StreamClosed",
            ProtocolEvent::LoggedOut => "LoggedOut",
        }
    }
}

/// What the factory needs to build a client for one instance.
#[derive(Debug, Clone)]
pub struct ClientSpec {
    pub instance_id: InstanceId,
    pub token: String,
    /// Identity from a previous pairing. `None` means the client has to pair.
    pub pairing_identity: Option<String>,
    pub events: EventFilter,
}

/// A freshly built client and the receiving end of its event stream.
pub struct ClientParts {
    pub client: Arc<dyn ProtocolClient>,
    pub events: mpsc::Receiver<ProtocolEvent>,
}

#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Opens the connection. Pairing progress is reported through events.
    async fn connect(&self) -> Result<(), ProtoError>;

    async fn disconnect(&self);

    /// Revokes the pairing on the server side.
    async fn logout(&self) -> Result<(), ProtoError>;

    fn is_connected(&self) -> bool;

    fn is_logged_in(&self) -> bool;

    async fn get_contacts(&self) -> Result<Vec<Contact>, ProtoError>;

    async fn get_joined_groups(&self) -> Result<Vec<GroupInfo>, ProtoError>;

    async fn get_profile_picture(&self, jid: &str) -> Result<Option<ProfilePicture>, ProtoError>;
}

#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(&self, spec: &ClientSpec) -> Result<ClientParts, ProtoError>;
}
