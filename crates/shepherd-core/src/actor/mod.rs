//! Actor implementations

pub mod fleet;
pub mod host;

pub use fleet::{FleetActor, FleetActorArgs};
pub use host::{HostActor, HostActorArgs};
