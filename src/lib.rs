//! # Procflow
//!
//! Procflow is an embeddable business-process execution core written in Rust.
//! It runs process instances to completion, persists their state, and guarantees
//! that concurrent actors (API callers, timer firings, workers) never race on the
//! same running instance.
//!
//! ## Core Services
//!
//! - **Lock Service**: per-tenant, per-object reentrant mutual exclusion with bounded wait
//! - **Transaction Coordinator**: thread-bound transactions with synchronization hooks
//! - **Recorder / Event Bus**: persistence mutations paired with synchronous domain events
//! - **Scheduler**: durable job descriptors and triggers, duplicate-free firing, misfire recovery
//! - **Flow-Node State Machine**: drives tasks, gateways and events from one stable state to the next
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use procflow::{EngineBuilder, ProcessDefinition, Vars};
//!
//! let engine = EngineBuilder::new().build()?;
//! engine.launch();
//!
//! let definition = ProcessDefinition::from_json(json_str)?;
//! let definition_id = engine.deploy(1, &definition)?;
//! engine.enable_process_definition(1, definition_id)?;
//! let pid = engine.start_process(1, definition_id, None, Vars::new())?;
//! ```

mod builder;
mod common;
mod config;
mod engine;
mod error;
pub mod events;
pub mod expression;
pub mod flownode;
pub mod lock;
pub mod model;
pub mod recorder;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod transaction;
mod utils;
mod workflow;

use std::sync::Arc;

use parking_lot::RwLock;

pub use builder::EngineBuilder;
pub use common::Vars;
pub use config::*;
pub use engine::{Engine, Work, WorkKind, WorkService};
pub use error::{FailureKind, ProcflowError};
pub use flownode::{FlowNodeState, TransitionOutcome};
pub use model::*;
pub use runtime::{ChannelEvent, ChannelOptions};

/// Result type alias for Procflow operations.
pub type Result<T> = std::result::Result<T, ProcflowError>;

/// Tenant identifier. Every lock, job and entity is scoped by tenant.
pub type TenantId = u64;

/// User identifier, resolved by the identity collaborator.
pub type UserId = u64;

/// Thread-safe shared lock wrapper using Arc<RwLock<T>>.
pub(crate) type ShareLock<T> = Arc<RwLock<T>>;
