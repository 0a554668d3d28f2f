//! The worker loop.
//!
//! ```text
//! idle ──poll──▶ claimed ──marker saved──▶ executing ──▶ reporting ──ack──▶ idle
//! ```
//!
//! The loop is the only writer of the task marker and the only place that
//! hands out sequence numbers. Numbers are reserved in blocks that are
//! persisted before use, so an update sent after a restart can never reuse a
//! number that already reached the manager with different content.

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use farmhand_core::marker::SEQ_BLOCK;
use farmhand_core::{
    CommandResult, ExecutionEvent, PersistedTaskMarker, Task, TaskId, TaskResult, TaskStatus,
    TaskUpdate,
};

use crate::backoff::{wait, Backoff};
use crate::client::{ClientError, ManagerApi, ManagerClient};
use crate::config::Config;
use crate::credentials::WorkerIdentity;
use crate::executor::TaskExecutor;
use crate::heartbeat::spawn_heartbeat;
use crate::pusher::UpdatePusher;
use crate::runner::{CommandRegistry, CommandRunner};
use crate::session::WorkerSession;
use crate::store::{StateStore, StoreError};

const SHUTDOWN_REASON: &str = "worker shutting down";

/// Errors that stop the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("task marker store failed: {0}")]
    Store(#[from] StoreError),

    #[error("manager refused registration: {0}")]
    Registration(#[source] ClientError),
}

/// How delivering a task's final updates ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportOutcome {
    Acknowledged,
    /// The manager no longer considers the task ours.
    Rejected,
    /// Not delivered before shutdown; the marker keeps it for the next start.
    Pending,
}

/// Why execution ended without a normal result.
enum Execution {
    Finished { result: TaskResult, rest: Batch },
    ClaimLost,
    StoreFailed(StoreError),
}

/// Hands out sequence numbers for one task.
#[derive(Debug, Default)]
struct Sequencer {
    next: u64,
}

impl Sequencer {
    /// Next sequence number, reserving a new block in the marker first when
    /// the current one is used up.
    async fn next(
        &mut self,
        marker: &mut PersistedTaskMarker,
        store: &StateStore,
    ) -> Result<u64, StoreError> {
        if self.next >= marker.seq_reserved {
            marker.reserve(marker.seq_reserved + SEQ_BLOCK);
            store.save(marker).await?;
            debug!(task_id = %marker.task_id, seq_reserved = marker.seq_reserved, "Reserved sequence block");
        }
        let seq = self.next;
        self.next += 1;
        Ok(seq)
    }

    fn peek(&self) -> u64 {
        self.next
    }
}

/// Update content collected between flushes.
#[derive(Debug, Default)]
struct Batch {
    task_status: Option<TaskStatus>,
    activity: Option<String>,
    current_command_idx: Option<usize>,
    log: String,
    command_results: Vec<CommandResult>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.task_status.is_none()
            && self.activity.is_none()
            && self.log.is_empty()
            && self.command_results.is_empty()
    }

    fn take(&mut self, task_id: &TaskId, seq: u64) -> TaskUpdate {
        let batch = std::mem::take(self);
        TaskUpdate {
            task_id: task_id.clone(),
            seq,
            task_status: batch.task_status,
            activity: batch.activity,
            current_command_idx: batch.current_command_idx,
            log: batch.log,
            command_results: batch.command_results,
        }
    }
}

/// The worker: registration, recovery, polling, execution and reporting.
pub struct Worker {
    config: Config,
    client: ManagerClient,
    executor: TaskExecutor,
    store: StateStore,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        config: Config,
        api: Arc<dyn ManagerApi>,
        identity: WorkerIdentity,
        shutdown: CancellationToken,
    ) -> Self {
        let store = StateStore::new(&config.state_dir, &identity.worker_id);
        let session = Arc::new(WorkerSession::new(identity));
        let client = ManagerClient::new(api, session, config.retry_policy(), shutdown.clone());
        let registry = CommandRegistry::with_builtin(config.command_timeout);
        let executor = TaskExecutor::new(CommandRunner::new(registry), config.max_output_bytes);
        Self {
            config,
            client,
            executor,
            store,
            shutdown,
        }
    }

    /// Replace the command types this worker can run.
    pub fn with_registry(mut self, registry: CommandRegistry) -> Self {
        self.executor = TaskExecutor::new(CommandRunner::new(registry), self.config.max_output_bytes);
        self
    }

    pub fn session(&self) -> &Arc<WorkerSession> {
        self.client.session()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run until shutdown or a fatal error.
    pub async fn run(&self) -> Result<(), WorkerError> {
        // Read before any network call, so a corrupt marker stops us early.
        let marker = self.store.load().await?;

        if !self.register().await? {
            info!("Shutdown requested before registration completed");
            return Ok(());
        }

        let stop_heartbeat = self.shutdown.child_token();
        let heartbeat = spawn_heartbeat(
            self.client.clone(),
            self.config.heartbeat_interval,
            stop_heartbeat.clone(),
        );

        let result = self.serve(marker).await;
        if let Err(e) = &result {
            error!(error = %e, "Worker stopping after fatal error");
        }

        stop_heartbeat.cancel();
        if let Err(e) = heartbeat.await {
            warn!(error = %e, "Heartbeat task failed");
        }
        self.sign_off().await;
        result
    }

    /// Register, retrying until it works. Returns `false` on shutdown.
    async fn register(&self) -> Result<bool, WorkerError> {
        let identity = self.session().identity();
        info!(
            worker_id = %identity.worker_id,
            nickname = %identity.nickname,
            manager = %self.config.manager_url,
            "Registering with manager"
        );

        loop {
            match self.client.register().await {
                Ok(_) => {
                    info!(worker_id = %identity.worker_id, "Registered");
                    return Ok(true);
                }
                Err(ClientError::Interrupted) => return Ok(false),
                Err(e) if e.is_rejection() => return Err(WorkerError::Registration(e)),
                Err(e) => {
                    warn!(error = %e, kind = e.kind(), "Registration failed, will retry");
                    if !wait(self.config.backoff_ceiling, &self.shutdown).await {
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn serve(&self, marker: Option<PersistedTaskMarker>) -> Result<(), WorkerError> {
        if let Some(marker) = marker {
            self.recover(marker).await?;
        }

        while !self.shutdown.is_cancelled() {
            match self.client.poll_task().await {
                Ok(Some(task)) => self.run_task(task).await?,
                Err(ClientError::InvalidTask { task_id, reason }) => {
                    self.fail_invalid_task(task_id, reason).await?
                }
                Ok(None) => {
                    debug!("No task available");
                    if !wait(self.config.poll_interval, &self.shutdown).await {
                        break;
                    }
                }
                Err(ClientError::Interrupted) => break,
                Err(e) => {
                    warn!(error = %e, kind = e.kind(), "Polling for a task failed");
                    if !wait(self.config.poll_interval, &self.shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("Worker loop stopped");
        Ok(())
    }

    /// Settle the task a previous process was responsible for.
    async fn recover(&self, mut marker: PersistedTaskMarker) -> Result<(), WorkerError> {
        let (status, reason) = marker.recovery_status();
        let seq = marker.recovery_seq();
        let task_id = marker.task_id.clone();
        warn!(
            task_id = %task_id,
            last_status = %marker.status,
            report_status = %status,
            seq,
            "Found task marker from a previous run, reporting it"
        );

        if marker.final_seq.is_none() {
            marker.finish(status, Some(reason.clone()), seq);
            self.store.save(&marker).await?;
        }

        if let Err(active) = self.session().claim(task_id.clone()) {
            warn!(task_id = %task_id, active_task = %active, "Session already had an active task");
        }
        let update = TaskUpdate::recovered(task_id.clone(), seq, status, Some(&reason));
        let outcome = self.report(&task_id, vec![update]).await;
        self.settle(&task_id, outcome).await
    }

    /// Claim a task whose payload could not be parsed and report it failed.
    async fn fail_invalid_task(&self, task_id: TaskId, reason: String) -> Result<(), WorkerError> {
        if let Err(active) = self.session().claim(task_id.clone()) {
            warn!(task_id = %task_id, active_task = %active, "Refusing a task while another is active");
            return Ok(());
        }
        let reason = format!("invalid task payload: {}", reason);
        warn!(task_id = %task_id, reason = %reason, "Task claimed with an invalid payload");

        let mut marker = PersistedTaskMarker::claimed(task_id.clone());
        marker.finish(TaskStatus::Failed, Some(reason.clone()), 0);
        if let Err(e) = self.store.save(&marker).await {
            self.abort_fatal(&task_id, Vec::new(), 0, &e).await;
            return Err(e.into());
        }

        let update = TaskUpdate::recovered(task_id.clone(), 0, TaskStatus::Failed, Some(&reason));
        let outcome = self.report(&task_id, vec![update]).await;
        self.settle(&task_id, outcome).await
    }

    /// Claim, execute and report one task.
    async fn run_task(&self, task: Task) -> Result<(), WorkerError> {
        let task_id = task.id.clone();
        if let Err(active) = self.session().claim(task_id.clone()) {
            warn!(task_id = %task_id, active_task = %active, "Refusing a task while another is active");
            return Ok(());
        }
        info!(
            task_id = %task_id,
            job_id = %task.job_id,
            name = %task.name,
            commands = task.commands.len(),
            "Task claimed"
        );

        let mut marker = PersistedTaskMarker::claimed(task_id.clone());
        if let Err(e) = self.store.save(&marker).await {
            self.abort_fatal(&task_id, Vec::new(), 0, &e).await;
            return Err(e.into());
        }

        let mut seqs = Sequencer::default();
        let claim_lost = CancellationToken::new();
        let pusher = UpdatePusher::spawn(
            self.client.clone(),
            task_id.clone(),
            claim_lost.clone(),
            &self.shutdown,
        );

        let execution = self
            .execute(task, &mut marker, &mut seqs, &pusher, &claim_lost)
            .await;

        match execution {
            Execution::Finished { result, rest } => {
                self.report_result(result, rest, marker, seqs, pusher).await
            }
            Execution::ClaimLost => {
                pusher.finish().await;
                warn!(task_id = %task_id, "Task abandoned, the manager gave it to someone else");
                self.settle(&task_id, ReportOutcome::Rejected).await
            }
            Execution::StoreFailed(e) => {
                let report = pusher.finish().await;
                self.abort_fatal(&task_id, report.backlog, seqs.peek(), &e).await;
                Err(e.into())
            }
        }
    }

    /// Run the executor and turn its events into sequenced updates.
    async fn execute(
        &self,
        task: Task,
        marker: &mut PersistedTaskMarker,
        seqs: &mut Sequencer,
        pusher: &UpdatePusher,
        claim_lost: &CancellationToken,
    ) -> Execution {
        let task_id = task.id.clone();
        let exec_cancel = self.shutdown.child_token();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let executor = self.executor.clone();
        let cancel = exec_cancel.clone();
        let mut exec = tokio::spawn(async move { executor.execute(&task, events_tx, &cancel).await });

        let mut batch = Batch {
            task_status: Some(TaskStatus::Active),
            activity: Some("Task started".to_string()),
            ..Batch::default()
        };
        let mut store_error: Option<StoreError> = None;
        if let Err(e) = self.flush(&task_id, &mut batch, marker, seqs, pusher).await {
            store_error = Some(e);
            exec_cancel.cancel();
        }

        let mut push_tick = interval_at(
            Instant::now() + self.config.push_interval,
            self.config.push_interval,
        );
        push_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cancel_check = interval_at(
            Instant::now() + self.config.cancel_check_interval,
            self.config.cancel_check_interval,
        );
        cancel_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut cancel_reason: Option<String> = None;
        let mut lost = false;

        let joined = loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled(), if cancel_reason.is_none() => {
                    info!(task_id = %task_id, "Shutdown requested, cancelling task");
                    cancel_reason = Some(SHUTDOWN_REASON.to_string());
                    exec_cancel.cancel();
                }

                _ = claim_lost.cancelled(), if !lost => {
                    lost = true;
                    exec_cancel.cancel();
                }

                Some(event) = events_rx.recv() => {
                    if apply_event(&mut batch, event, self.config.max_batch_bytes) {
                        if let Err(e) = self.flush(&task_id, &mut batch, marker, seqs, pusher).await {
                            store_error.get_or_insert(e);
                            exec_cancel.cancel();
                        }
                    }
                }

                joined = &mut exec => break joined,

                _ = push_tick.tick() => {
                    if let Err(e) = self.flush(&task_id, &mut batch, marker, seqs, pusher).await {
                        store_error.get_or_insert(e);
                        exec_cancel.cancel();
                    }
                }

                _ = cancel_check.tick(), if cancel_reason.is_none() => {
                    match self.client.may_keep_running(&task_id).await {
                        Ok(answer) if !answer.may_keep_running => {
                            let reason = answer
                                .reason
                                .unwrap_or_else(|| "canceled by manager".to_string());
                            info!(task_id = %task_id, reason = %reason, "Manager asked to stop the task");
                            cancel_reason = Some(reason);
                            exec_cancel.cancel();
                        }
                        Ok(_) => {}
                        Err(e) => debug!(task_id = %task_id, error = %e, "Cancel check failed, ignoring"),
                    }
                }
            }
        };

        // The executor has returned; whatever it sent is already queued.
        while let Ok(event) = events_rx.try_recv() {
            apply_event(&mut batch, event, usize::MAX);
        }

        if let Some(e) = store_error {
            return Execution::StoreFailed(e);
        }
        if lost {
            return Execution::ClaimLost;
        }

        let mut result = match joined {
            Ok(result) => result,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Executor task failed");
                TaskResult {
                    task_id: task_id.clone(),
                    status: TaskStatus::Failed,
                    reason: Some(format!("executor failed: {}", e)),
                    command_results: Vec::new(),
                    not_run: Vec::new(),
                }
            }
        };
        if result.status == TaskStatus::Canceled {
            if let Some(reason) = cancel_reason {
                result.reason = Some(reason);
            }
        }
        Execution::Finished {
            result,
            rest: batch,
        }
    }

    /// Hand the batch to the pusher under the next sequence number.
    async fn flush(
        &self,
        task_id: &TaskId,
        batch: &mut Batch,
        marker: &mut PersistedTaskMarker,
        seqs: &mut Sequencer,
        pusher: &UpdatePusher,
    ) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let seq = seqs.next(marker, &self.store).await?;
        let update = batch.take(task_id, seq);
        debug!(
            task_id = %task_id,
            seq,
            log_bytes = update.log.len(),
            results = update.command_results.len(),
            "Queued task update"
        );
        if !pusher.push(update) {
            debug!(task_id = %task_id, seq, "Update pusher already stopped");
        }
        Ok(())
    }

    /// Persist the terminal status, then deliver it after any backlog.
    async fn report_result(
        &self,
        result: TaskResult,
        mut rest: Batch,
        mut marker: PersistedTaskMarker,
        mut seqs: Sequencer,
        pusher: UpdatePusher,
    ) -> Result<(), WorkerError> {
        let task_id = result.task_id.clone();

        let final_seq = match seqs.next(&mut marker, &self.store).await {
            Ok(seq) => seq,
            Err(e) => {
                let report = pusher.finish().await;
                self.abort_fatal(&task_id, report.backlog, seqs.peek(), &e).await;
                return Err(e.into());
            }
        };
        marker.finish(result.status, result.reason.clone(), final_seq);
        if let Err(e) = self.store.save(&marker).await {
            let report = pusher.finish().await;
            self.abort_fatal(&task_id, report.backlog, final_seq, &e).await;
            return Err(e.into());
        }

        let terminal = TaskUpdate::terminal(&result, final_seq);
        let mut update = rest.take(&task_id, final_seq);
        update.task_status = terminal.task_status;
        update.activity = terminal.activity;

        let report = pusher.finish().await;
        if report.rejected {
            warn!(task_id = %task_id, "Task abandoned, the manager gave it to someone else");
            return self.settle(&task_id, ReportOutcome::Rejected).await;
        }

        info!(
            task_id = %task_id,
            status = %result.status,
            seq = final_seq,
            delivered = report.delivered,
            backlog = report.backlog.len(),
            "Reporting task result"
        );
        let mut updates = report.backlog;
        updates.push(update);
        let outcome = self.report(&task_id, updates).await;
        self.settle(&task_id, outcome).await
    }

    /// Deliver `updates` in order. Keeps trying until they are acknowledged,
    /// the manager rejects them, or shutdown.
    async fn report(&self, task_id: &TaskId, updates: Vec<TaskUpdate>) -> ReportOutcome {
        let mut pending: VecDeque<TaskUpdate> = updates.into();
        let mut backoff = Backoff::new(self.client.policy());

        while let Some(update) = pending.front() {
            match self.client.push_update(update).await {
                Ok(()) => {
                    pending.pop_front();
                    backoff.reset();
                }
                Err(e) if e.is_rejection() => {
                    warn!(task_id = %task_id, seq = update.seq, error = %e, "Manager rejected task report");
                    return ReportOutcome::Rejected;
                }
                Err(ClientError::Interrupted) => return self.last_attempt(task_id, pending).await,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        task_id = %task_id,
                        seq = update.seq,
                        kind = e.kind(),
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Task report not delivered, holding it"
                    );
                    if !wait(delay, &self.shutdown).await {
                        return self.last_attempt(task_id, pending).await;
                    }
                }
            }
        }
        ReportOutcome::Acknowledged
    }

    /// One bounded attempt to deliver `pending` while shutting down.
    async fn last_attempt(
        &self,
        task_id: &TaskId,
        pending: impl IntoIterator<Item = TaskUpdate>,
    ) -> ReportOutcome {
        let client = &self.client;
        let attempt = async move {
            for update in pending {
                client.push_update_once(&update).await?;
            }
            Ok::<(), ClientError>(())
        };

        match tokio::time::timeout(self.config.shutdown_grace, attempt).await {
            Ok(Ok(())) => ReportOutcome::Acknowledged,
            Ok(Err(e)) if e.is_rejection() => ReportOutcome::Rejected,
            Ok(Err(e)) => {
                warn!(task_id = %task_id, error = %e, "Final report failed, kept for next start");
                ReportOutcome::Pending
            }
            Err(_) => {
                warn!(
                    task_id = %task_id,
                    grace_ms = self.config.shutdown_grace.as_millis() as u64,
                    "Final report timed out, kept for next start"
                );
                ReportOutcome::Pending
            }
        }
    }

    /// Release the task; drop the marker unless the report is still owed.
    async fn settle(&self, task_id: &TaskId, outcome: ReportOutcome) -> Result<(), WorkerError> {
        match outcome {
            ReportOutcome::Acknowledged => {
                info!(task_id = %task_id, "Task report acknowledged");
                self.store.clear().await?;
            }
            ReportOutcome::Rejected => {
                self.store.clear().await?;
            }
            ReportOutcome::Pending => {}
        }
        self.session().release();
        Ok(())
    }

    /// Best-effort failure report when the marker can no longer be written.
    async fn abort_fatal(
        &self,
        task_id: &TaskId,
        mut backlog: Vec<TaskUpdate>,
        seq: u64,
        error: &StoreError,
    ) {
        error!(task_id = %task_id, error = %error, "Cannot persist task marker");
        let reason = format!("worker state store failed: {}", error);
        backlog.push(TaskUpdate::recovered(
            task_id.clone(),
            seq,
            TaskStatus::Failed,
            Some(&reason),
        ));
        self.last_attempt(task_id, backlog).await;
        self.session().release();
    }

    async fn sign_off(&self) {
        match tokio::time::timeout(self.config.shutdown_grace, self.client.sign_off()).await {
            Ok(Ok(())) => info!("Signed off"),
            Ok(Err(e)) => warn!(error = %e, "Sign-off failed"),
            Err(_) => warn!("Sign-off timed out"),
        }
    }
}

/// Fold an execution event into the batch. Returns `true` when the batch
/// should be flushed right away.
fn apply_event(batch: &mut Batch, event: ExecutionEvent, max_batch_bytes: usize) -> bool {
    match event {
        ExecutionEvent::CommandStarted { index, name } => {
            batch.current_command_idx = Some(index);
            batch.activity = Some(format!("Running command #{} ({})", index, name));
            false
        }
        ExecutionEvent::Output { line, .. } => {
            batch.log.push_str(&line);
            batch.log.push('\n');
            batch.log.len() >= max_batch_bytes
        }
        ExecutionEvent::CommandFinished(result) => {
            batch.command_results.push(result);
            true
        }
    }
}
