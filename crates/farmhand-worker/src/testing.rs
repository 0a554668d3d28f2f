//! In-memory manager for tests.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use farmhand_core::{
    Heartbeat, KeepRunning, OutputStream, SessionToken, Settings, Task, TaskId, TaskStatus,
    TaskUpdate, WorkerRegistration,
};

use crate::client::{parse_task, ClientError, ManagerApi};
use crate::runner::{CommandType, Completion, OutputSink, ValidationError};

const TOKEN: &str = "fake-token";

/// A failure to inject into the next call of some kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    Rejected,
    /// The call takes effect but the answer is lost on the way back.
    AckLost,
}

impl Fault {
    fn into_error(self) -> ClientError {
        match self {
            Self::Transient | Self::AckLost => ClientError::Transient("injected".to_string()),
            Self::Rejected => ClientError::Rejected {
                status: 409,
                message: "injected".to_string(),
            },
        }
    }
}

/// A call as seen by the manager, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Register,
    Poll,
    Push { task_id: TaskId, seq: u64 },
    Heartbeat,
    MayKeepRunning(TaskId),
    SignOff,
}

#[derive(Default)]
struct FakeState {
    tasks: VecDeque<Value>,
    register_faults: VecDeque<Fault>,
    poll_faults: VecDeque<Fault>,
    push_faults: VecDeque<Fault>,
    heartbeat_faults: VecDeque<Fault>,
    rejected_tasks: HashSet<TaskId>,
    canceled_tasks: HashSet<TaskId>,
    cancel_check_delay: Duration,
    heartbeat_delay: Duration,
    calls: Vec<Call>,
    push_attempts: Vec<TaskUpdate>,
    heartbeats: Vec<(tokio::time::Instant, Heartbeat)>,
    /// Accepted updates per task, keyed by sequence number.
    accepted: BTreeMap<TaskId, BTreeMap<u64, TaskUpdate>>,
}

/// Scripted [`ManagerApi`]. Deduplicates pushes on `(task, seq)` the way the
/// real manager does, and records every call.
#[derive(Default)]
pub struct FakeManager {
    state: Mutex<FakeState>,
}

impl FakeManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn queue_task(&self, task: Task) {
        let doc = serde_json::to_value(&task).unwrap();
        self.queue_task_document(doc);
    }

    /// Hand out `doc` as-is on a later poll.
    pub fn queue_task_document(&self, doc: Value) {
        self.lock().tasks.push_back(doc);
    }

    pub fn inject_register_faults(&self, faults: impl IntoIterator<Item = Fault>) {
        self.lock().register_faults.extend(faults);
    }

    pub fn inject_poll_faults(&self, faults: impl IntoIterator<Item = Fault>) {
        self.lock().poll_faults.extend(faults);
    }

    pub fn inject_push_faults(&self, faults: impl IntoIterator<Item = Fault>) {
        self.lock().push_faults.extend(faults);
    }

    pub fn inject_heartbeat_faults(&self, faults: impl IntoIterator<Item = Fault>) {
        self.lock().heartbeat_faults.extend(faults);
    }

    /// Refuse every update for `task_id`, as if it was reassigned.
    pub fn reject_updates_for(&self, task_id: TaskId) {
        self.lock().rejected_tasks.insert(task_id);
    }

    /// Answer "no" when the worker asks whether it may keep running `task_id`.
    pub fn cancel_task(&self, task_id: TaskId) {
        self.lock().canceled_tasks.insert(task_id);
    }

    /// Make every may-keep-running answer take `delay`.
    pub fn delay_cancel_checks(&self, delay: Duration) {
        self.lock().cancel_check_delay = delay;
    }

    /// Make every heartbeat take `delay` to be answered.
    pub fn delay_heartbeats(&self, delay: Duration) {
        self.lock().heartbeat_delay = delay;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn poll_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Poll))
            .count()
    }

    pub fn sign_off_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::SignOff))
            .count()
    }

    /// Every push that reached the manager, including failed and repeated ones.
    pub fn push_attempts(&self) -> Vec<TaskUpdate> {
        self.lock().push_attempts.clone()
    }

    pub fn heartbeats(&self) -> Vec<(tokio::time::Instant, Heartbeat)> {
        self.lock().heartbeats.clone()
    }

    /// Accepted updates for `task_id`, ordered by sequence number.
    pub fn accepted_updates(&self, task_id: &TaskId) -> Vec<TaskUpdate> {
        self.lock()
            .accepted
            .get(task_id)
            .map(|updates| updates.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn accepted_seqs(&self, task_id: &TaskId) -> Vec<u64> {
        self.accepted_updates(task_id).iter().map(|u| u.seq).collect()
    }

    /// Terminal status the manager recorded for `task_id`.
    pub fn final_status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.accepted_updates(task_id)
            .iter()
            .filter_map(|u| u.task_status)
            .filter(|s| s.is_terminal())
            .last()
    }

    fn check_token(token: &SessionToken) -> Result<(), ClientError> {
        if token.as_str() == TOKEN {
            Ok(())
        } else {
            Err(ClientError::Rejected {
                status: 401,
                message: "bad token".to_string(),
            })
        }
    }
}

#[async_trait]
impl ManagerApi for FakeManager {
    async fn register(
        &self,
        _registration: &WorkerRegistration,
    ) -> Result<SessionToken, ClientError> {
        let mut state = self.lock();
        state.calls.push(Call::Register);
        if let Some(fault) = state.register_faults.pop_front() {
            return Err(fault.into_error());
        }
        Ok(SessionToken::new(TOKEN))
    }

    async fn poll_task(&self, token: &SessionToken) -> Result<Option<Task>, ClientError> {
        Self::check_token(token)?;
        let mut state = self.lock();
        state.calls.push(Call::Poll);
        if let Some(fault) = state.poll_faults.pop_front() {
            return Err(fault.into_error());
        }
        state.tasks.pop_front().map(parse_task).transpose()
    }

    async fn push_update(
        &self,
        token: &SessionToken,
        update: &TaskUpdate,
    ) -> Result<(), ClientError> {
        Self::check_token(token)?;
        let mut state = self.lock();
        state.calls.push(Call::Push {
            task_id: update.task_id.clone(),
            seq: update.seq,
        });
        state.push_attempts.push(update.clone());
        let fault = state.push_faults.pop_front();
        if let Some(fault @ (Fault::Transient | Fault::Rejected)) = fault {
            return Err(fault.into_error());
        }
        if state.rejected_tasks.contains(&update.task_id) {
            return Err(Fault::Rejected.into_error());
        }
        state
            .accepted
            .entry(update.task_id.clone())
            .or_default()
            .entry(update.seq)
            .or_insert_with(|| update.clone());
        match fault {
            Some(fault) => Err(fault.into_error()),
            None => Ok(()),
        }
    }

    async fn heartbeat(
        &self,
        token: &SessionToken,
        heartbeat: &Heartbeat,
    ) -> Result<(), ClientError> {
        Self::check_token(token)?;
        let delay = self.lock().heartbeat_delay;
        tokio::time::sleep(delay).await;
        let mut state = self.lock();
        state.calls.push(Call::Heartbeat);
        if let Some(fault) = state.heartbeat_faults.pop_front() {
            return Err(fault.into_error());
        }
        state
            .heartbeats
            .push((tokio::time::Instant::now(), heartbeat.clone()));
        Ok(())
    }

    async fn may_keep_running(
        &self,
        token: &SessionToken,
        task_id: &TaskId,
    ) -> Result<KeepRunning, ClientError> {
        Self::check_token(token)?;
        let (delay, canceled) = {
            let mut state = self.lock();
            state.calls.push(Call::MayKeepRunning(task_id.clone()));
            (state.cancel_check_delay, state.canceled_tasks.contains(task_id))
        };
        tokio::time::sleep(delay).await;
        if canceled {
            Ok(KeepRunning::no("task was canceled by the manager"))
        } else {
            Ok(KeepRunning::yes())
        }
    }

    async fn sign_off(&self, token: &SessionToken) -> Result<(), ClientError> {
        Self::check_token(token)?;
        self.lock().calls.push(Call::SignOff);
        Ok(())
    }
}

/// Command type that prints `working` and exits with its `code` setting.
pub struct Exit;

#[async_trait]
impl CommandType for Exit {
    fn name(&self) -> &'static str {
        "exit"
    }

    fn validate(&self, _settings: &Settings) -> Result<(), ValidationError> {
        Ok(())
    }

    async fn execute(
        &self,
        settings: &Settings,
        sink: &OutputSink,
        _cancel: &CancellationToken,
    ) -> Completion {
        sink.line(OutputStream::Stdout, "working");
        match settings.get("code").and_then(|c| c.as_i64()).unwrap_or(0) {
            0 => Completion::ok(),
            code => Completion::exited(code as i32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replayed_push_does_not_change_state() {
        let fake = FakeManager::new();
        let token = SessionToken::new(TOKEN);
        let task_id = TaskId::new("t1");

        let mut first = TaskUpdate::new(task_id.clone(), 4);
        first.task_status = Some(TaskStatus::Failed);
        fake.push_update(&token, &first).await.unwrap();

        let mut replay = first.clone();
        replay.task_status = Some(TaskStatus::Completed);
        fake.push_update(&token, &replay).await.unwrap();

        assert_eq!(fake.accepted_seqs(&task_id), vec![4]);
        assert_eq!(fake.final_status(&task_id), Some(TaskStatus::Failed));
        assert_eq!(fake.push_attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_faults_are_consumed_in_order() {
        let fake = FakeManager::new();
        let token = SessionToken::new(TOKEN);
        fake.inject_poll_faults([Fault::Transient, Fault::Rejected]);

        assert!(fake.poll_task(&token).await.unwrap_err().is_transient());
        assert!(fake.poll_task(&token).await.unwrap_err().is_rejection());
        assert_eq!(fake.poll_task(&token).await.unwrap(), None);
        assert_eq!(fake.poll_count(), 3);
    }

    #[tokio::test]
    async fn test_ack_lost_push_is_still_recorded() {
        let fake = FakeManager::new();
        let token = SessionToken::new(TOKEN);
        let task_id = TaskId::new("t1");
        fake.inject_push_faults([Fault::AckLost]);

        let update = TaskUpdate::new(task_id.clone(), 0);
        assert!(fake.push_update(&token, &update).await.unwrap_err().is_transient());
        assert_eq!(fake.accepted_seqs(&task_id), vec![0]);
        fake.push_update(&token, &update).await.unwrap();
        assert_eq!(fake.accepted_seqs(&task_id), vec![0]);
    }
}
