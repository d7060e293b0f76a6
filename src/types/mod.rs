//! Core types for the courier runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ContextId, TimerId, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for the runtime and event bus

mod config;
mod errors;
mod ids;

pub use config::{Config, EventBusConfig, ObservabilityConfig, RuntimeConfig};
pub use errors::{CodecError, Error, Result};
pub use ids::{ContextId, DeploymentId, HookId, TimerId};

pub(crate) use errors::panic_message;
