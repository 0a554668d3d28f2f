//! Farmhand Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Filesystem or subprocesses
//! - Runtime specifics
//!
//! Everything here describes what a render worker receives from the manager,
//! what it produces while executing, and what it persists locally.

pub mod error;
pub mod event;
pub mod ids;
pub mod marker;
pub mod result;
pub mod status;
pub mod task;
pub mod update;
pub mod worker;

// Re-export commonly used types
pub use error::CoreError;
pub use event::{ExecutionEvent, OutputStream};
pub use ids::{JobId, TaskId, WorkerId};
pub use marker::PersistedTaskMarker;
pub use result::{CommandResult, LogRange, TaskResult};
pub use status::{CommandOutcome, ExecutionState, TaskStatus, WorkerActivity};
pub use task::{Command, Settings, Task};
pub use update::TaskUpdate;
pub use worker::{Heartbeat, KeepRunning, SessionToken, WorkerRegistration};
