//! HTTP transport for the manager API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use farmhand_core::{
    Heartbeat, KeepRunning, SessionToken, Task, TaskId, TaskUpdate, WorkerRegistration,
};

use super::{parse_task, ClientError, ManagerApi};

#[derive(Debug, Serialize, Deserialize)]
struct RegisterResponse {
    token: String,
}

/// [`ManagerApi`] over HTTP/JSON.
#[derive(Debug, Clone)]
pub struct HttpManagerApi {
    inner: reqwest::Client,
    base_url: String,
}

impl HttpManagerApi {
    /// Create a client for the manager at `base_url`.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let inner = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("farmhand-worker/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            inner,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Map a transport-level failure.
fn transport_error(e: reqwest::Error) -> ClientError {
    if e.is_decode() {
        ClientError::Decode(e.to_string())
    } else {
        ClientError::Transient(e.to_string())
    }
}

/// Map a non-success status to an error.
async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        status.canonical_reason().unwrap_or("").to_string()
    } else {
        body
    };

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(ClientError::Transient(format!("HTTP {}: {}", status.as_u16(), message)))
    } else {
        Err(ClientError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let bytes = response.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
}

#[async_trait]
impl ManagerApi for HttpManagerApi {
    async fn register(
        &self,
        registration: &WorkerRegistration,
    ) -> Result<SessionToken, ClientError> {
        let url = self.url("/register-worker");
        debug!(url = %url, worker_id = %registration.worker_id, "Registering");

        let response = self
            .inner
            .post(&url)
            .json(registration)
            .send()
            .await
            .map_err(transport_error)?;
        let body: RegisterResponse = decode(check(response).await?).await?;
        Ok(SessionToken::new(body.token))
    }

    async fn poll_task(&self, token: &SessionToken) -> Result<Option<Task>, ClientError> {
        let response = self
            .inner
            .post(self.url("/task"))
            .bearer_auth(token.as_str())
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::NO_CONTENT => return Ok(None),
            // The manager wants a status change first; treated as "no work".
            StatusCode::LOCKED => {
                debug!("Manager requested a status change, no task handed out");
                return Ok(None);
            }
            _ => {}
        }

        let value: serde_json::Value = decode(check(response).await?).await?;
        parse_task(value).map(Some)
    }

    async fn push_update(
        &self,
        token: &SessionToken,
        update: &TaskUpdate,
    ) -> Result<(), ClientError> {
        let url = self.url(&format!("/tasks/{}/update", update.task_id));
        debug!(url = %url, seq = update.seq, "Pushing task update");

        let response = self
            .inner
            .post(&url)
            .bearer_auth(token.as_str())
            .json(update)
            .send()
            .await
            .map_err(transport_error)?;
        check(response).await?;
        Ok(())
    }

    async fn heartbeat(
        &self,
        token: &SessionToken,
        heartbeat: &Heartbeat,
    ) -> Result<(), ClientError> {
        let response = self
            .inner
            .post(self.url("/heartbeat"))
            .bearer_auth(token.as_str())
            .json(heartbeat)
            .send()
            .await
            .map_err(transport_error)?;
        check(response).await?;
        Ok(())
    }

    async fn may_keep_running(
        &self,
        token: &SessionToken,
        task_id: &TaskId,
    ) -> Result<KeepRunning, ClientError> {
        let response = self
            .inner
            .get(self.url(&format!("/may-i-run/{}", task_id)))
            .bearer_auth(token.as_str())
            .send()
            .await
            .map_err(transport_error)?;
        decode(check(response).await?).await
    }

    async fn sign_off(&self, token: &SessionToken) -> Result<(), ClientError> {
        let response = self
            .inner
            .post(self.url("/sign-off"))
            .bearer_auth(token.as_str())
            .send()
            .await
            .map_err(transport_error)?;
        check(response).await?;
        Ok(())
    }
}
