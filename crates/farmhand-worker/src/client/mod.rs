//! Manager client.
//!
//! [`ManagerApi`] is the raw transport, one call per method and no retries.
//! [`ManagerClient`] wraps it with the session and the retry policy and is
//! what the rest of the worker talks to.

mod http;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use farmhand_core::{
    CoreError, Heartbeat, KeepRunning, SessionToken, Task, TaskId, TaskUpdate,
    WorkerRegistration,
};
use serde_json::Value;

use crate::backoff::{wait, Backoff, RetryPolicy};
use crate::session::{Connectivity, WorkerSession};

pub use http::HttpManagerApi;

/// Errors talking to the manager.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network trouble or a server-side failure; worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The manager refused the request. Retrying will not help.
    #[error("rejected by manager (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("cannot decode manager response: {0}")]
    Decode(String),

    /// The manager handed out a task whose payload is malformed. The task
    /// is ours now and has to be reported failed.
    #[error("task {task_id} has an invalid payload: {reason}")]
    InvalidTask { task_id: TaskId, reason: String },

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ClientError>,
    },

    #[error("interrupted by shutdown")]
    Interrupted,

    #[error("task {0} is still active")]
    TaskStillActive(TaskId),

    #[error("not registered with the manager")]
    NotRegistered,
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// The manager gave a definitive answer that the request is not wanted.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// Short machine-friendly name, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Rejected { .. } => "rejected",
            Self::Decode(_) => "decode",
            Self::InvalidTask { .. } => "invalid_task",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Interrupted => "interrupted",
            Self::TaskStillActive(_) => "task_still_active",
            Self::NotRegistered => "not_registered",
        }
    }
}

/// Parse a task document handed out by the manager.
pub(crate) fn parse_task(value: Value) -> Result<Task, ClientError> {
    Task::from_json(value).map_err(|e| match e {
        CoreError::MalformedTask { task_id, reason } => ClientError::InvalidTask { task_id, reason },
        other => ClientError::Decode(other.to_string()),
    })
}

/// Raw manager operations.
#[async_trait]
pub trait ManagerApi: Send + Sync {
    async fn register(&self, registration: &WorkerRegistration)
        -> Result<SessionToken, ClientError>;

    /// Ask for work. `None` means there is nothing for this worker right now.
    async fn poll_task(&self, token: &SessionToken) -> Result<Option<Task>, ClientError>;

    async fn push_update(&self, token: &SessionToken, update: &TaskUpdate)
        -> Result<(), ClientError>;

    async fn heartbeat(&self, token: &SessionToken, heartbeat: &Heartbeat)
        -> Result<(), ClientError>;

    async fn may_keep_running(
        &self,
        token: &SessionToken,
        task_id: &TaskId,
    ) -> Result<KeepRunning, ClientError>;

    async fn sign_off(&self, token: &SessionToken) -> Result<(), ClientError>;
}

/// Session-aware manager client with retry.
#[derive(Clone)]
pub struct ManagerClient {
    api: Arc<dyn ManagerApi>,
    session: Arc<WorkerSession>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl ManagerClient {
    pub fn new(
        api: Arc<dyn ManagerApi>,
        session: Arc<WorkerSession>,
        policy: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            api,
            session,
            policy,
            shutdown,
        }
    }

    pub fn session(&self) -> &Arc<WorkerSession> {
        &self.session
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Register and store the session token.
    pub async fn register(&self) -> Result<SessionToken, ClientError> {
        let registration = self.session.identity().registration();
        let token = self
            .with_retry("register", || self.api.register(&registration))
            .await?;
        self.session.set_token(token.clone());
        Ok(token)
    }

    /// Ask the manager for a task.
    ///
    /// Refused while the session still has an active task.
    pub async fn poll_task(&self) -> Result<Option<Task>, ClientError> {
        if let Some(active) = self.session.active_task() {
            return Err(ClientError::TaskStillActive(active));
        }
        let token = self.token()?;
        self.with_retry("poll_task", || self.api.poll_task(&token))
            .await
    }

    /// Deliver `update`, retrying transient failures with the same sequence
    /// number.
    pub async fn push_update(&self, update: &TaskUpdate) -> Result<(), ClientError> {
        let token = self.token()?;
        self.with_retry("push_update", || self.api.push_update(&token, update))
            .await
    }

    /// Deliver `update` with a single attempt.
    ///
    /// Not interrupted by shutdown: this is the final report made while
    /// shutting down, and the caller bounds it with the grace period.
    pub async fn push_update_once(&self, update: &TaskUpdate) -> Result<(), ClientError> {
        let token = self.token()?;
        self.unguarded(self.api.push_update(&token, update)).await
    }

    /// Send one heartbeat describing the session's current state.
    pub async fn heartbeat(&self) -> Result<(), ClientError> {
        let token = self.token()?;
        let heartbeat = Heartbeat::new(
            self.session.identity().worker_id.clone(),
            self.session.active_task(),
        );
        self.once(self.api.heartbeat(&token, &heartbeat)).await
    }

    pub async fn may_keep_running(&self, task_id: &TaskId) -> Result<KeepRunning, ClientError> {
        let token = self.token()?;
        self.once(self.api.may_keep_running(&token, task_id)).await
    }

    /// Sent after shutdown was requested, so it is not interrupted by it.
    pub async fn sign_off(&self) -> Result<(), ClientError> {
        let token = self.token()?;
        self.unguarded(self.api.sign_off(&token)).await
    }

    fn token(&self) -> Result<SessionToken, ClientError> {
        self.session.token().ok_or(ClientError::NotRegistered)
    }

    /// One attempt, abandoned as soon as shutdown is requested.
    async fn once<T>(
        &self,
        call: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(ClientError::Interrupted),
            result = call => result,
        };
        self.observe(&result);
        result
    }

    async fn unguarded<T>(
        &self,
        call: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        let result = call.await;
        self.observe(&result);
        result
    }

    /// Run `call` until it succeeds, fails definitively, runs out of attempts
    /// or shutdown is requested.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut backoff = Backoff::new(self.policy);
        loop {
            if self.shutdown.is_cancelled() {
                return Err(ClientError::Interrupted);
            }
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(ClientError::Interrupted),
                result = call() => result,
            };
            self.observe(&result);

            match result {
                Ok(value) => {
                    if backoff.attempts() > 0 {
                        debug!(op, attempts = backoff.attempts() + 1, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() => match backoff.on_failure() {
                    Some(delay) => {
                        warn!(
                            op,
                            attempt = backoff.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            kind = e.kind(),
                            error = %e,
                            "Manager call failed, retrying"
                        );
                        if !wait(delay, &self.shutdown).await {
                            return Err(ClientError::Interrupted);
                        }
                    }
                    None => {
                        warn!(op, attempts = backoff.attempts(), error = %e, "Giving up on manager call");
                        return Err(ClientError::RetriesExhausted {
                            attempts: backoff.attempts(),
                            last: Box::new(e),
                        });
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn observe<T>(&self, result: &Result<T, ClientError>) {
        match result {
            Ok(_) => self.session.set_connectivity(Connectivity::Healthy),
            Err(e) if e.is_transient() => self.session.set_connectivity(Connectivity::Degraded),
            Err(_) => {}
        }
    }
}
