//! Worker identity, loaded once at startup.
//!
//! The id and secret are created on first start and kept in the state
//! directory so the manager recognises the same worker across restarts.

use std::fmt;
use std::path::Path;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use farmhand_core::{WorkerId, WorkerRegistration};

use crate::store::write_atomic;

/// Errors loading or creating the credentials file. Fatal at startup.
#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("cannot access credentials file: {0}")]
    Io(#[from] std::io::Error),

    #[error("credentials file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct StoredCredentials {
    worker_id: WorkerId,
    secret: String,
}

/// Who this worker is. Immutable for the lifetime of the process.
#[derive(Clone, PartialEq)]
pub struct WorkerIdentity {
    pub worker_id: WorkerId,
    pub secret: String,
    pub nickname: String,
    pub supported_task_types: Vec<String>,
}

impl fmt::Debug for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerIdentity")
            .field("worker_id", &self.worker_id)
            .field("nickname", &self.nickname)
            .field("supported_task_types", &self.supported_task_types)
            .finish_non_exhaustive()
    }
}

impl WorkerIdentity {
    /// Identity with a fresh id and secret. Mostly useful in tests.
    pub fn generate(nickname: impl Into<String>, supported_task_types: Vec<String>) -> Self {
        Self {
            worker_id: WorkerId::generate(),
            secret: generate_secret(),
            nickname: nickname.into(),
            supported_task_types,
        }
    }

    /// Read the credentials file, creating it on first start.
    pub async fn load_or_create(
        path: &Path,
        nickname: impl Into<String>,
        supported_task_types: Vec<String>,
    ) -> Result<Self, CredentialsError> {
        let nickname = nickname.into();
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let stored: StoredCredentials = serde_json::from_slice(&bytes)?;
                Ok(Self {
                    worker_id: stored.worker_id,
                    secret: stored.secret,
                    nickname,
                    supported_task_types,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate(nickname, supported_task_types);
                let stored = StoredCredentials {
                    worker_id: identity.worker_id.clone(),
                    secret: identity.secret.clone(),
                };
                write_atomic(path, &serde_json::to_vec_pretty(&stored)?).await?;
                info!(
                    worker_id = %identity.worker_id,
                    path = %path.display(),
                    "Created new worker credentials"
                );
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Registration document sent to the manager.
    pub fn registration(&self) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: self.worker_id.clone(),
            secret: self.secret.clone(),
            nickname: self.nickname.clone(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            supported_task_types: self.supported_task_types.clone(),
        }
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_created_once_then_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let first = WorkerIdentity::load_or_create(&path, "node-01", vec!["sleep".into()])
            .await
            .unwrap();
        let second = WorkerIdentity::load_or_create(&path, "node-01", vec!["sleep".into()])
            .await
            .unwrap();

        assert_eq!(first.worker_id, second.worker_id);
        assert_eq!(first.secret, second.secret);
        assert!(first.secret.len() >= 40);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let err = WorkerIdentity::load_or_create(&path, "n", vec![]).await.unwrap_err();
        assert!(matches!(err, CredentialsError::Corrupt(_)));
    }

    #[test]
    fn test_debug_hides_secret() {
        let identity = WorkerIdentity::generate("n", vec![]);
        assert!(!format!("{:?}", identity).contains(&identity.secret));
    }

    #[test]
    fn test_registration_carries_task_types() {
        let identity = WorkerIdentity::generate("n", vec!["blender-render".into()]);
        let registration = identity.registration();
        assert_eq!(registration.supported_task_types, vec!["blender-render"]);
        assert_eq!(registration.platform, std::env::consts::OS);
    }
}
