//! Ordered delivery of one task's updates.
//!
//! Updates arrive already sequenced. The pusher sends them strictly in
//! order: update N+1 is not attempted before N has been acknowledged, and a
//! failed update is retried with its own sequence number, never skipped.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use farmhand_core::{TaskId, TaskUpdate};

use crate::backoff::{wait, Backoff};
use crate::client::{ClientError, ManagerClient};

/// What the pusher left behind when it stopped.
#[derive(Debug, Default)]
pub struct PusherReport {
    /// Updates not acknowledged, in sequence order.
    pub backlog: Vec<TaskUpdate>,
    /// Set when the manager said the task is no longer ours.
    pub rejected: bool,
    pub delivered: usize,
}

/// Handle to a running pusher task.
pub struct UpdatePusher {
    tx: mpsc::UnboundedSender<TaskUpdate>,
    finishing: CancellationToken,
    handle: JoinHandle<PusherReport>,
}

impl UpdatePusher {
    /// Start delivering updates for `task_id`.
    ///
    /// `claim_lost` is cancelled if the manager rejects an update. The
    /// pusher stops retrying when `shutdown` fires.
    pub fn spawn(
        client: ManagerClient,
        task_id: TaskId,
        claim_lost: CancellationToken,
        shutdown: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let finishing = shutdown.child_token();
        let handle = tokio::spawn(run(client, task_id, rx, claim_lost, finishing.clone()));
        Self {
            tx,
            finishing,
            handle,
        }
    }

    /// Queue `update` for delivery. Returns `false` if the pusher has stopped.
    pub fn push(&self, update: TaskUpdate) -> bool {
        self.tx.send(update).is_ok()
    }

    /// Stop accepting updates and wait for the pusher to finish.
    ///
    /// Queued updates are still delivered while the manager is reachable; on
    /// the first exhausted retry round the rest is handed back as backlog.
    pub async fn finish(self) -> PusherReport {
        let Self {
            tx,
            finishing,
            handle,
        } = self;
        drop(tx);
        finishing.cancel();
        match handle.await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Update pusher task failed");
                PusherReport::default()
            }
        }
    }
}

async fn run(
    client: ManagerClient,
    task_id: TaskId,
    mut rx: mpsc::UnboundedReceiver<TaskUpdate>,
    claim_lost: CancellationToken,
    finishing: CancellationToken,
) -> PusherReport {
    let mut queue: VecDeque<TaskUpdate> = VecDeque::new();
    let mut report = PusherReport::default();
    let mut backoff = Backoff::new(client.policy());

    loop {
        while let Ok(update) = rx.try_recv() {
            queue.push_back(update);
        }

        if queue.is_empty() {
            // Nothing pending: wait for more, or stop once the input closed.
            tokio::select! {
                biased;
                next = rx.recv() => match next {
                    Some(update) => queue.push_back(update),
                    None => break,
                },
                _ = finishing.cancelled() => break,
            }
            continue;
        }
        let update = &queue[0];

        match client.push_update(update).await {
            Ok(()) => {
                debug!(task_id = %task_id, seq = update.seq, "Update acknowledged");
                queue.pop_front();
                report.delivered += 1;
                backoff.reset();
            }
            Err(e) if e.is_rejection() => {
                warn!(
                    task_id = %task_id,
                    seq = update.seq,
                    error = %e,
                    "Manager rejected update, task is no longer ours"
                );
                report.rejected = true;
                claim_lost.cancel();
                break;
            }
            Err(ClientError::Interrupted) => break,
            Err(e) => {
                if finishing.is_cancelled() {
                    break;
                }
                let delay = backoff.next_delay();
                warn!(
                    task_id = %task_id,
                    seq = update.seq,
                    kind = e.kind(),
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Update not delivered, will retry"
                );
                if !wait(delay, &finishing).await {
                    break;
                }
            }
        }
    }

    while let Ok(update) = rx.try_recv() {
        queue.push_back(update);
    }
    report.backlog = queue.into();
    if !report.backlog.is_empty() {
        info!(
            task_id = %task_id,
            pending = report.backlog.len(),
            "Update pusher stopped with undelivered updates"
        );
    }
    report
}
