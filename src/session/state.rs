use crate::protocol::ProtocolEvent;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Uninitialized,
    Initializing,
    AwaitingPairing,
    Connected,
    Disconnected,
    LoggedOut,
}

impl ConnectionState {
    /// Whether a request waiting for readiness may proceed.
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            ConnectionState::AwaitingPairing | ConnectionState::Connected
        )
    }

    /// Whether initialization has run its course, successfully or not.
    pub fn is_settled(self) -> bool {
        !matches!(
            self,
            ConnectionState::Uninitialized | ConnectionState::Initializing
        )
    }

    /// States in which `connect()` starts a new connection attempt.
    pub fn can_connect(self) -> bool {
        matches!(
            self,
            ConnectionState::Uninitialized | ConnectionState::Disconnected
        )
    }

    /// States in which `disconnect()` has a live stream to close.
    pub fn can_disconnect(self) -> bool {
        matches!(
            self,
            ConnectionState::Initializing
                | ConnectionState::AwaitingPairing
                | ConnectionState::Connected
        )
    }

    /// Applies a protocol event, returning the next state and the durable
    /// write it requires.
    pub fn on_event(self, event: &ProtocolEvent) -> (ConnectionState, Effect) {
        use ConnectionState::*;

        if self == LoggedOut {
            return (LoggedOut, Effect::None);
        }

        match event {
            ProtocolEvent::QrIssued(payload) => match self {
                // A QR after pairing belongs to a superseded attempt.
                Connected => (Connected, Effect::None),
                _ => (AwaitingPairing, Effect::StoreQr(payload.clone())),
            },
            ProtocolEvent::Paired(identity) => (Connected, Effect::StorePairing(identity.clone())),
            ProtocolEvent::Connected => match self {
                Connected => (Connected, Effect::None),
                _ => (Connected, Effect::SetConnected(true)),
            },
            ProtocolEvent::StreamClosed => match self {
                AwaitingPairing => (Disconnected, Effect::ClearQr),
                Initializing | Connected => (Disconnected, Effect::SetConnected(false)),
                other => (other, Effect::None),
            },
            ProtocolEvent::LoggedOut => (LoggedOut, Effect::ClearPairing),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Durable write that accompanies a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    None,
    StoreQr(String),
    ClearQr,
    StorePairing(String),
    SetConnected(bool),
    ClearPairing,
}
