//! Process-lifetime worker context.
//!
//! A single [`WorkerSession`] is created at startup and shared as an
//! `Arc` between the worker loop, the manager client and the heartbeat
//! task. It is the only place that knows which task, if any, is active.

use std::sync::{Mutex, RwLock};

use farmhand_core::{SessionToken, TaskId};
use tracing::{info, warn};

use crate::credentials::WorkerIdentity;

/// Reachability of the manager as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Healthy,
    /// Recent calls failed transiently; the worker keeps retrying.
    Degraded,
}

/// Shared worker state.
#[derive(Debug)]
pub struct WorkerSession {
    identity: WorkerIdentity,
    token: RwLock<Option<SessionToken>>,
    connectivity: RwLock<Connectivity>,
    active_task: Mutex<Option<TaskId>>,
}

impl WorkerSession {
    pub fn new(identity: WorkerIdentity) -> Self {
        Self {
            identity,
            token: RwLock::new(None),
            connectivity: RwLock::new(Connectivity::Healthy),
            active_task: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn token(&self) -> Option<SessionToken> {
        self.token.read().ok().and_then(|t| t.clone())
    }

    pub fn set_token(&self, token: SessionToken) {
        if let Ok(mut guard) = self.token.write() {
            *guard = Some(token);
        }
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
            .read()
            .map(|c| *c)
            .unwrap_or(Connectivity::Degraded)
    }

    /// Update connectivity, logging transitions only.
    pub fn set_connectivity(&self, next: Connectivity) {
        let Ok(mut guard) = self.connectivity.write() else {
            return;
        };
        if *guard == next {
            return;
        }
        *guard = next;
        match next {
            Connectivity::Healthy => info!("Manager reachable again"),
            Connectivity::Degraded => warn!("Manager unreachable, retrying with backoff"),
        }
    }

    /// Mark `task_id` as the active task.
    ///
    /// Fails with the currently active task if there is one.
    pub fn claim(&self, task_id: TaskId) -> Result<(), TaskId> {
        let mut guard = match self.active_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(active) => Err(active.clone()),
            None => {
                *guard = Some(task_id);
                Ok(())
            }
        }
    }

    /// Forget the active task.
    pub fn release(&self) -> Option<TaskId> {
        match self.active_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub fn active_task(&self) -> Option<TaskId> {
        match self.active_task.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
