//! Heartbeat loop.
//!
//! Runs as its own tokio task next to task execution. A failed heartbeat only
//! changes the delay before the next one; it never touches the running task.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{wait, Backoff};
use crate::client::{ClientError, ManagerClient};

/// Start sending heartbeats every `interval` until `shutdown` fires.
pub fn spawn_heartbeat(
    client: ManagerClient,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_heartbeat_loop(client, interval, shutdown))
}

async fn run_heartbeat_loop(client: ManagerClient, interval: Duration, shutdown: CancellationToken) {
    let mut backoff = Backoff::new(client.policy());
    let mut delay = interval;

    loop {
        if !wait(delay, &shutdown).await {
            break;
        }

        match client.heartbeat().await {
            Ok(()) => {
                debug!(active_task = ?client.session().active_task(), "Heartbeat sent");
                backoff.reset();
                delay = interval;
            }
            Err(ClientError::Interrupted) => break,
            Err(e) if e.is_rejection() => {
                // Keep going; the manager may accept us again after a restart.
                warn!(error = %e, kind = e.kind(), "Heartbeat rejected");
                delay = interval;
            }
            Err(e) => {
                delay = backoff.next_delay().min(interval);
                warn!(
                    error = %e,
                    kind = e.kind(),
                    retry_in_ms = delay.as_millis() as u64,
                    "Heartbeat failed"
                );
            }
        }
    }

    info!("Heartbeat loop stopped");
}
