//! Farmhand render worker.
//!
//! The worker registers with a manager, polls for tasks, runs each task's
//! commands in order and reports progress and the final status back. A
//! durable marker lets a restarted worker settle a task it was running when
//! it died instead of losing or double-reporting it.

pub mod backoff;
pub mod client;
pub mod config;
pub mod credentials;
pub mod executor;
pub mod heartbeat;
pub mod pusher;
pub mod runner;
pub mod session;
pub mod shutdown;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ClientError, HttpManagerApi, ManagerApi, ManagerClient};
pub use config::{Config, ConfigError};
pub use credentials::{CredentialsError, WorkerIdentity};
pub use executor::TaskExecutor;
pub use runner::{CommandRegistry, CommandRunner, CommandType, ValidationError};
pub use session::{Connectivity, WorkerSession};
pub use store::{StateStore, StoreError};
pub use worker::{Worker, WorkerError};
