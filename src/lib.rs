//! Agent execution core.
//!
//! Model-issued tool calls are scheduled by resource key
//! ([`scheduler::ToolScheduler`]), mutating tools either write through behind
//! a checkpoint or stage into a patch set ([`staging::PatchSetStore`]), and
//! [`orchestrator::Orchestrator`] drives the bounded model/tool loop with an
//! optional allowlisted verify phase.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod mcp;
pub mod orchestrator;
pub mod persist;
pub mod project;
pub mod scheduler;
pub mod services;
pub mod staging;
pub mod tools;

pub use config::CoreConfig;
pub use error::{ConfigError, RegistryError, StoreError, ToolError};
pub use services::ProjectServices;
