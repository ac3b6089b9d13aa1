pub mod contact;
pub mod group;
pub mod instance;

pub use contact::{Contact, ProfilePicture};
pub use group::{GroupInfo, GroupParticipant};
pub use instance::{AccountId, EventFilter, EventKind, InstanceId, InstanceRow, NewInstance};
