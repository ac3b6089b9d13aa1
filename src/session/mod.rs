//! Per-instance session lifecycle: the registry of live clients, their
//! connection state machine and the coordination of lazy initialization.

pub mod coordinator;
pub mod handle;
pub mod pairing;
pub mod registry;
pub mod state;

pub use coordinator::InitializationCoordinator;
pub use handle::{ClientHandle, Snapshot};
pub use pairing::{PairingFlow, RetryPolicy};
pub use registry::SessionRegistry;
pub use state::ConnectionState;
