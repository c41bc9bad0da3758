// Master-side record of one remote worker: declared capacity, role, the
// set of tasks in flight on it, its session send handle and liveness
// bookkeeping for the heartbeat loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use forge_common::error::TransportError;
use forge_common::letter::{CancelKind, CancelLetter, Letter, WorkerRole};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::task::{TaskGroup, TaskKind, TaskRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Online,
    Waiting,
    Offline,
    /// Reported by the worker itself (WSC notify) while its units are not
    /// ready; the session stays up but no new tasks are offered.
    Pending,
}

#[derive(Debug)]
struct Meta {
    state: WorkerState,
    state_since: Instant,
    sender: Option<mpsc::Sender<Letter>>,
    session: CancellationToken,
}

#[derive(Debug)]
pub struct Worker {
    ident: String,
    role: WorkerRole,
    max: u32,
    meta: Mutex<Meta>,
    in_proc: Mutex<TaskGroup>,

    // Heartbeat sequence expected next, and when the last one arrived.
    hb_expected: AtomicU64,
    hb_last: Mutex<Instant>,

    /// Bumped on every session adoption; a session loop only reports the
    /// disconnect of its own generation.
    generation: AtomicU64,
}

pub type WorkerRef = Arc<Worker>;

impl Worker {
    pub fn new(
        ident: impl Into<String>,
        role: WorkerRole,
        max: u32,
        sender: mpsc::Sender<Letter>,
        session: CancellationToken,
    ) -> WorkerRef {
        Arc::new(Self {
            ident: ident.into(),
            role,
            max,
            meta: Mutex::new(Meta {
                state: WorkerState::Online,
                state_since: Instant::now(),
                sender: Some(sender),
                session,
            }),
            in_proc: Mutex::new(TaskGroup::new()),
            hb_expected: AtomicU64::new(0),
            hb_last: Mutex::new(Instant::now()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn state(&self) -> WorkerState {
        self.meta.lock().unwrap().state
    }

    pub fn set_state(&self, state: WorkerState) {
        let mut meta = self.meta.lock().unwrap();
        if meta.state != state {
            meta.state = state;
            meta.state_since = Instant::now();
        }
    }

    /// How long the worker has been in its current state.
    pub fn state_duration(&self) -> Duration {
        self.meta.lock().unwrap().state_since.elapsed()
    }

    pub fn is_online(&self) -> bool {
        self.state() == WorkerState::Online
    }

    pub fn is_merger(&self) -> bool {
        self.role == WorkerRole::Merger
    }

    pub fn num_of_task_proc(&self) -> usize {
        self.in_proc.lock().unwrap().num_of_tasks()
    }

    /// Online, below its declared capacity and not self-reported pending.
    pub fn is_able_to_accept(&self) -> bool {
        self.is_online() && self.num_of_task_proc() < self.max as usize
    }

    pub fn search_task(&self, tid: &str) -> Option<TaskRef> {
        self.in_proc.lock().unwrap().get(tid)
    }

    pub fn in_proc_tasks(&self) -> Vec<TaskRef> {
        self.in_proc.lock().unwrap().to_vec()
    }

    pub fn remove_task(&self, tid: &str) {
        self.in_proc.lock().unwrap().remove(tid);
    }

    pub fn remove_tasks_where(&self, predicate: impl Fn(&TaskRef) -> bool) {
        self.in_proc.lock().unwrap().remove_where(predicate);
    }

    /// Queue a letter onto the session's serialized send path.
    pub async fn send(&self, letter: Letter) -> Result<(), TransportError> {
        let sender = self.meta.lock().unwrap().sender.clone();
        let sender = sender.ok_or(TransportError::ConnectionClosed)?;
        sender
            .send(letter)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Dispatch a task: send its wire form and record it in flight.
    pub async fn assign(&self, task: &TaskRef) -> Result<(), TransportError> {
        self.send(task.to_letter()).await?;
        self.in_proc.lock().unwrap().insert(task.clone());
        Ok(())
    }

    /// Cancel a task in flight on this worker. No-op if the task is not
    /// present; the Cancel command is sent either way it is found.
    pub async fn cancel(&self, tid: &str) -> Result<(), TransportError> {
        let task = self.in_proc.lock().unwrap().remove(tid);
        if let Some(task) = task {
            let kind = match task.kind() {
                TaskKind::Single { .. } => CancelKind::Single,
                TaskKind::Post { .. } => CancelKind::Post,
            };
            self.send(Letter::Cancel(CancelLetter::new(tid, kind))).await?;
        }
        Ok(())
    }

    /// Install a fresh session after a reconnect: new send handle, stopped
    /// previous loop, reset heartbeat sequence.
    pub fn adopt_session(&self, sender: mpsc::Sender<Letter>, session: CancellationToken) {
        let mut meta = self.meta.lock().unwrap();
        meta.session.cancel();
        meta.session = session;
        meta.sender = Some(sender);
        drop(meta);

        self.hb_expected.store(0, Ordering::SeqCst);
        *self.hb_last.lock().unwrap() = Instant::now();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn session_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn session_token(&self) -> CancellationToken {
        self.meta.lock().unwrap().session.clone()
    }

    pub fn drop_sender(&self) {
        self.meta.lock().unwrap().sender = None;
    }

    /// Account one heartbeat. Returns true when the sequence matched and
    /// the clock was advanced; a mismatched sequence is dropped.
    pub fn heartbeat(&self, seq: u64) -> bool {
        let expected = self.hb_expected.load(Ordering::SeqCst);
        if seq != expected {
            return false;
        }
        self.hb_expected.store(expected + 1, Ordering::SeqCst);
        *self.hb_last.lock().unwrap() = Instant::now();
        true
    }

    pub fn heartbeat_elapsed(&self) -> Duration {
        self.hb_last.lock().unwrap().elapsed()
    }
}
