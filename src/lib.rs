pub mod config;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod store;
pub mod types;

pub use config::GatewayConfig;
pub use error::{InitError, SessionError};
pub use manager::{InstanceManager, InstanceStatus};
