//! shepherd-agent: Per-host playbook executor
//!
//! Answers discovery pings, acknowledges dispatched playbooks and runs them
//! through a single-flight job runner, reporting each outcome on the bus.

pub mod agent;
pub mod config;
pub mod error;

pub use agent::Agent;
pub use config::{AgentConfig, JobConfig};
pub use error::AgentError;
