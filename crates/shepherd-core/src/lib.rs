//! shepherd-core: Fleet control plane
//!
//! Implements the `FleetActor` and `HostActor` using the kameo framework,
//! the per-deploy state machine, host discovery and the persistence
//! interface the store plugs into.

pub mod actor;
pub mod config;
pub mod control;
pub mod deploy;
pub mod discovery;
pub mod error;
pub mod inventory;
pub mod keys;
pub mod message;
pub mod store;
pub mod writer;

pub use actor::fleet::{FleetActor, FleetActorArgs};
pub use actor::host::{HostActor, HostActorArgs};
pub use config::{DeployPolicy, DiscoveryConfig};
pub use control::{ControlReply, ControlRequest, ControlServer, forward};
pub use deploy::{DeployHandle, wait_finished};
pub use discovery::{Discovery, DiscoveryReport};
pub use error::{CoreError, StoreError};
pub use inventory::Inventory;
pub use keys::KeyRing;
pub use message::{
    DeployGroup, DeployHost, DispatchReport, EventStream, FindHost, HostSeen, HostSeenOutcome,
    ListHosts, RunningDeploys, Subscribe,
};
pub use store::{Collection, Db, FileCollection, MemoryCollection, Record, RecordKind};
pub use writer::spawn_deploy_writer;
