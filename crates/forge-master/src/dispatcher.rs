// The dispatcher: a priority wait-area of pending tasks, per-kind worker
// selection and the single cooperative loop that assigns tasks to workers.
// All state-changing paths run under one dispatch mutex, which is what
// makes task-to-worker assignment at-most-once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use forge_common::error::DispatchError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::task::{TaskRef, TaskState};
use crate::tracker::TaskTracker;
use crate::worker::WorkerRef;
use crate::worker_room::WorkerRoom;

/// Commands the job master feeds the dispatcher over its endpoint channel.
#[derive(Debug)]
pub enum DispatchCmd {
    Dispatch(TaskRef),
    Cancel(String),
}

/// One queue of the wait-area: a task kind with a priority and a capacity.
#[derive(Debug, Clone, Copy)]
pub struct WaitAreaSpec {
    pub kind: &'static str,
    pub pri: u8,
    pub cap: usize,
}

struct WaitQueue {
    kind: &'static str,
    pri: u8,
    cap: usize,
    tasks: std::collections::VecDeque<TaskRef>,
}

/// Priority multi-queue of tasks waiting for an eligible worker.
/// FIFO within one kind; across kinds the lowest priority number wins.
pub struct WaitArea {
    queues: Mutex<Vec<WaitQueue>>,
    /// Raised on enqueue, cleared when a sweep finds the area empty.
    event: AtomicBool,
}

impl WaitArea {
    pub fn new(mut specs: Vec<WaitAreaSpec>) -> Self {
        specs.sort_by_key(|s| s.pri);
        Self {
            queues: Mutex::new(
                specs
                    .into_iter()
                    .map(|s| WaitQueue {
                        kind: s.kind,
                        pri: s.pri,
                        cap: s.cap,
                        tasks: std::collections::VecDeque::new(),
                    })
                    .collect(),
            ),
            event: AtomicBool::new(false),
        }
    }

    pub fn enqueue(&self, task: TaskRef) -> Result<(), DispatchError> {
        let mut queues = self.queues.lock().unwrap();
        let kind = task.kind().name();
        let queue = queues
            .iter_mut()
            .find(|q| q.kind == kind)
            .ok_or_else(|| DispatchError::UnknownKind(kind.to_string()))?;

        if queue.tasks.len() >= queue.cap {
            return Err(DispatchError::AreaFull(kind.to_string()));
        }
        queue.tasks.push_back(task);
        self.event.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn dequeue(&self) -> Result<TaskRef, DispatchError> {
        let mut queues = self.queues.lock().unwrap();
        for queue in queues.iter_mut() {
            if let Some(task) = queue.tasks.pop_front() {
                return Ok(task);
            }
        }
        Err(DispatchError::AreaEmpty)
    }

    /// Peek the highest-priority task, discarding stale heads that are no
    /// longer tracked.
    pub fn peek_tracked(&self, tracker: &TaskTracker) -> Option<TaskRef> {
        let mut queues = self.queues.lock().unwrap();
        for queue in queues.iter_mut() {
            while let Some(head) = queue.tasks.front() {
                if tracker.is_in_track(head.id()) {
                    return Some(head.clone());
                }
                queue.tasks.pop_front();
            }
        }
        self.event.store(false, Ordering::SeqCst);
        None
    }

    pub fn has_event(&self) -> bool {
        self.event.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.queues.lock().unwrap().iter().map(|q| q.tasks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<TaskRef> {
        let queues = self.queues.lock().unwrap();
        queues.iter().flat_map(|q| q.tasks.iter().cloned()).collect()
    }
}

/// Picks a worker for one task kind out of the current online set.
pub type WorkerSelector = Arc<dyn Fn(&[WorkerRef]) -> Option<WorkerRef> + Send + Sync>;

/// Single-task selection: online, accepting, NORMAL role, fewest in-proc
/// tasks (first found wins ties).
pub fn via_overhead(workers: &[WorkerRef]) -> Option<WorkerRef> {
    workers
        .iter()
        .filter(|w| w.is_online() && w.is_able_to_accept() && !w.is_merger())
        .min_by_key(|w| w.num_of_task_proc())
        .cloned()
}

/// Post-task selection: the unique online MERGER worker.
pub fn the_merger(workers: &[WorkerRef]) -> Option<WorkerRef> {
    workers.iter().find(|w| w.is_online() && w.is_merger()).cloned()
}

pub struct Dispatcher {
    area: WaitArea,
    tracker: Arc<TaskTracker>,
    room: Arc<WorkerRoom>,
    /// Guards `_dispatch`, `redispatch` and `cancel`.
    dispatch_lock: tokio::sync::Mutex<()>,
    selectors: Mutex<HashMap<&'static str, WorkerSelector>>,
    /// Task state notifications towards the job master.
    notify_tx: mpsc::Sender<(String, TaskState)>,
}

impl Dispatcher {
    pub fn new(
        tracker: Arc<TaskTracker>,
        room: Arc<WorkerRoom>,
        notify_tx: mpsc::Sender<(String, TaskState)>,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            area: WaitArea::new(vec![
                WaitAreaSpec { kind: "Post", pri: 0, cap: 128 },
                WaitAreaSpec { kind: "Single", pri: 1, cap: 128 },
            ]),
            tracker,
            room,
            dispatch_lock: tokio::sync::Mutex::new(()),
            selectors: Mutex::new(HashMap::new()),
            notify_tx,
        });

        dispatcher.add_selector("Single", Arc::new(via_overhead));
        dispatcher.add_selector("Post", Arc::new(the_merger));
        dispatcher
    }

    /// Install the worker-selection strategy for a task kind. A later
    /// registration replaces an earlier one.
    pub fn add_selector(&self, kind: &'static str, selector: WorkerSelector) {
        self.selectors.lock().unwrap().insert(kind, selector);
    }

    fn select_worker(&self, task: &TaskRef) -> Option<WorkerRef> {
        let selector = self.selectors.lock().unwrap().get(task.kind().name()).cloned()?;
        let workers = self.room.get_workers();
        selector(&workers)
    }

    /// Accept a task for dispatch. A task already in track only gets its
    /// reference count bumped.
    pub fn dispatch(&self, task: TaskRef) -> Result<(), DispatchError> {
        if self.tracker.is_in_track(task.id()) {
            if let Some(existing) = self.tracker.get_task(task.id()) {
                existing.add_ref();
            }
            return Ok(());
        }

        self.tracker.track(&task);
        tracing::debug!("task {} queued for dispatch", task.id());
        if let Err(e) = self.area.enqueue(task.clone()) {
            self.tracker.untrack(task.id());
            return Err(e);
        }
        Ok(())
    }

    /// The dispatch loop: wake every second, try to place the
    /// highest-priority waiting task on an eligible worker.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }

            if !self.area.has_event() {
                continue;
            }
            self.dispatch_step().await;
        }
    }

    pub(crate) async fn dispatch_step(&self) {
        let Some(peeked) = self.area.peek_tracked(&self.tracker) else {
            return;
        };

        // No eligible worker is not an error; the task stays queued.
        if self.select_worker(&peeked).is_none() {
            return;
        }

        let _guard = self.dispatch_lock.lock().await;

        let Ok(task) = self.area.dequeue() else { return };
        let Some(worker) = self.select_worker(&task) else {
            let _ = self.area.enqueue(task);
            return;
        };

        match worker.assign(&task).await {
            Ok(()) => {
                self.tracker
                    .on_worker(task.id(), Some(worker.ident().to_string()));
                if let Err(e) = task.state_change(TaskState::InProc) {
                    tracing::warn!("task {} not movable to IN_PROC: {e}", task.id());
                }
                tracing::info!("task {} dispatched to worker {}", task.id(), worker.ident());
            }
            Err(e) => {
                tracing::warn!(
                    "dispatch of {} to {} failed: {e}; requeueing",
                    task.id(),
                    worker.ident()
                );
                let _ = self.area.enqueue(task);
            }
        }
    }

    /// Put a previously assigned task back into the wait-area.
    /// Returns false when the task cannot return to PREPARE (it is then
    /// untracked and given up on).
    pub async fn redispatch(&self, task: &TaskRef) -> bool {
        tracing::info!("redispatch task {}", task.id());
        let _guard = self.dispatch_lock.lock().await;

        self.tracker.on_worker(task.id(), None);
        if task.state_change(TaskState::Prepare).is_err() {
            self.tracker.untrack(task.id());
            return false;
        }

        if let Err(e) = self.area.enqueue(task.clone()) {
            tracing::error!("requeue of {} failed: {e}", task.id());
            self.tracker.untrack(task.id());
            return false;
        }

        // Clients observe the fallback to PREPARE between the task's
        // IN_PROC episodes.
        let _ = self
            .notify_tx
            .send((task.id().to_string(), TaskState::Prepare))
            .await;
        true
    }

    /// Cancel a task: tell the assigned worker (when live), mark the task
    /// failed and drop it from tracking.
    pub async fn cancel(&self, taskid: &str) {
        let _guard = self.dispatch_lock.lock().await;

        let Some(task) = self.tracker.get_task(taskid) else {
            self.tracker.untrack(taskid);
            return;
        };

        if let Some(ident) = self.tracker.which_worker(taskid) {
            if let Some(worker) = self.room.get_worker(&ident) {
                if worker.is_online() {
                    if let Err(e) = worker.cancel(taskid).await {
                        tracing::warn!("cancel of {taskid} on {ident} failed: {e}");
                    }
                }
            }
        }

        let _ = task.state_change(TaskState::Failure);
        self.tracker.untrack(taskid);
        tracing::info!("task {taskid} cancelled");
    }

    /// Redispatch policy when a worker is gone for good: Single tasks go
    /// back to the wait-area, a lost Post task is unrecoverable (only one
    /// merger) and is reported failed to the job master.
    pub async fn worker_lost_redispatch(&self, worker: &WorkerRef) {
        let tasks = worker.in_proc_tasks();

        for task in &tasks {
            self.tracker.on_worker(task.id(), None);
        }

        for task in tasks {
            match task.kind() {
                crate::task::TaskKind::Single { .. } => {
                    self.redispatch(&task).await;
                }
                crate::task::TaskKind::Post { .. } => {
                    let _ = self
                        .notify_tx
                        .send((task.id().to_string(), TaskState::Failure))
                        .await;
                }
            }
        }
    }

    /// Bridge between the event router and the job master: terminal states
    /// release the worker slot and the track entry before the job master
    /// hears about them.
    pub async fn on_task_state_changed(&self, taskid: &str, state: TaskState) {
        if matches!(state, TaskState::Finished | TaskState::Failure) {
            if let Some(ident) = self.tracker.which_worker(taskid) {
                if let Some(worker) = self.room.get_worker(&ident) {
                    worker.remove_task(taskid);
                }
            }
            self.tracker.untrack(taskid);
        }

        let _ = self.notify_tx.send((taskid.to_string(), state)).await;
    }

    /// React to room membership: a worker whose grace window expired gets
    /// its in-flight tasks redispatched or failed.
    pub async fn run_room_events(
        self: Arc<Self>,
        mut rx: tokio::sync::broadcast::Receiver<crate::worker_room::RoomEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = rx.recv() => {
                    match event {
                        Ok(crate::worker_room::RoomEvent::Disconn(worker)) => {
                            self.worker_lost_redispatch(&worker).await;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("room event stream lagged by {n}");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    /// Consume commands from the job master's side of the endpoint pair.
    pub async fn run_endpoint(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<DispatchCmd>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                cmd = rx.recv() => {
                    match cmd {
                        Some(DispatchCmd::Dispatch(task)) => {
                            if let Err(e) = self.dispatch(task) {
                                tracing::error!("dispatch refused: {e}");
                            }
                        }
                        Some(DispatchCmd::Cancel(taskid)) => self.cancel(&taskid).await,
                        None => return,
                    }
                }
            }
        }
    }

    pub fn tasks_in_wait(&self) -> Vec<TaskRef> {
        self.area.all()
    }

    pub fn task_state(&self, taskid: &str) -> Option<TaskState> {
        self.tracker.get_task(taskid).map(|t| t.state())
    }

    pub fn is_task_exists(&self, taskid: &str) -> bool {
        self.tracker.is_in_track(taskid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_router::EventRouter;
    use crate::task::{Task, TaskKind};
    use crate::worker::Worker;
    use forge_common::letter::{Letter, WorkerRole};
    use forge_common::recipe::Build;

    fn build() -> Build {
        Build {
            cmd: vec!["make".into()],
            output: "o".into(),
        }
    }

    fn single(id: &str) -> TaskRef {
        Task::new(
            id,
            "sn",
            "v",
            TaskKind::Single {
                build: build(),
                need_post: false,
                post_target: None,
            },
            1,
        )
    }

    fn post(id: &str) -> TaskRef {
        Task::new(
            id,
            "",
            "v",
            TaskKind::Post {
                fragments: vec![],
                merge: build(),
            },
            1,
        )
    }

    fn fixture() -> (
        Arc<Dispatcher>,
        Arc<TaskTracker>,
        Arc<WorkerRoom>,
        mpsc::Receiver<(String, TaskState)>,
    ) {
        let tracker = Arc::new(TaskTracker::new());
        let room = WorkerRoom::new(Duration::from_secs(300), EventRouter::new());
        let (tx, rx) = mpsc::channel(64);
        let dispatcher = Dispatcher::new(tracker.clone(), room.clone(), tx);
        (dispatcher, tracker, room, rx)
    }

    fn online_worker(
        room: &Arc<WorkerRoom>,
        ident: &str,
        role: WorkerRole,
        max: u32,
    ) -> (WorkerRef, mpsc::Receiver<Letter>) {
        let (tx, rx) = mpsc::channel(64);
        let worker = Worker::new(ident, role, max, tx, CancellationToken::new());
        room.install_for_test(worker.clone());
        (worker, rx)
    }

    #[test]
    fn test_wait_area_fifo_and_priority() {
        let area = WaitArea::new(vec![
            WaitAreaSpec { kind: "Post", pri: 0, cap: 4 },
            WaitAreaSpec { kind: "Single", pri: 1, cap: 4 },
        ]);

        let s1 = single("1_A");
        let s2 = single("1_B");
        let p1 = post("1_P");
        area.enqueue(s1.clone()).unwrap();
        area.enqueue(s2.clone()).unwrap();
        area.enqueue(p1.clone()).unwrap();

        // Post wins across kinds, FIFO within a kind.
        assert_eq!(area.dequeue().unwrap().id(), "1_P");
        assert_eq!(area.dequeue().unwrap().id(), "1_A");
        assert_eq!(area.dequeue().unwrap().id(), "1_B");
        assert!(matches!(area.dequeue(), Err(DispatchError::AreaEmpty)));
    }

    #[test]
    fn test_wait_area_full() {
        let area = WaitArea::new(vec![WaitAreaSpec { kind: "Single", pri: 1, cap: 1 }]);
        area.enqueue(single("1_A")).unwrap();
        assert!(matches!(
            area.enqueue(single("1_B")),
            Err(DispatchError::AreaFull(_))
        ));
    }

    #[test]
    fn test_wait_area_unknown_kind() {
        let area = WaitArea::new(vec![WaitAreaSpec { kind: "Single", pri: 1, cap: 1 }]);
        assert!(matches!(
            area.enqueue(post("1_P")),
            Err(DispatchError::UnknownKind(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_tracked_task_only_bumps_refs() {
        let (dispatcher, tracker, _room, _rx) = fixture();
        let task = single("1_A");

        dispatcher.dispatch(task.clone()).unwrap();
        assert_eq!(task.refs(), 1);
        assert_eq!(dispatcher.tasks_in_wait().len(), 1);

        dispatcher.dispatch(task.clone()).unwrap();
        assert_eq!(task.refs(), 2);
        assert_eq!(dispatcher.tasks_in_wait().len(), 1);
        assert!(tracker.is_in_track("1_A"));
    }

    #[tokio::test]
    async fn test_dispatch_step_assigns_to_least_loaded_normal() {
        let (dispatcher, tracker, room, _rx) = fixture();
        let (w1, mut w1_rx) = online_worker(&room, "w1", WorkerRole::Normal, 4);
        let (w2, _w2_rx) = online_worker(&room, "w2", WorkerRole::Normal, 4);
        let (_m, _m_rx) = online_worker(&room, "m1", WorkerRole::Merger, 4);

        // Pre-load w2 so w1 is the least loaded.
        w2.assign(&single("0_X")).await.unwrap();

        let task = single("1_A");
        dispatcher.dispatch(task.clone()).unwrap();
        dispatcher.dispatch_step().await;

        assert_eq!(tracker.which_worker("1_A"), Some("w1".into()));
        assert_eq!(task.state(), TaskState::InProc);
        assert!(matches!(w1_rx.recv().await, Some(Letter::NewTask(_))));
        assert_eq!(w1.num_of_task_proc(), 1);
    }

    #[tokio::test]
    async fn test_post_task_goes_to_merger_only() {
        let (dispatcher, tracker, room, _rx) = fixture();
        let (_w1, _w1_rx) = online_worker(&room, "w1", WorkerRole::Normal, 4);

        let task = post("1_P");
        dispatcher.dispatch(task.clone()).unwrap();
        dispatcher.dispatch_step().await;

        // No merger online: the task stays waitable.
        assert_eq!(tracker.which_worker("1_P"), None);
        assert_eq!(dispatcher.tasks_in_wait().len(), 1);

        let (_m, mut m_rx) = online_worker(&room, "m1", WorkerRole::Merger, 4);
        dispatcher.dispatch_step().await;
        assert_eq!(tracker.which_worker("1_P"), Some("m1".into()));
        assert!(matches!(m_rx.recv().await, Some(Letter::PostTask(_))));
    }

    #[tokio::test]
    async fn test_redispatch_returns_task_to_area() {
        let (dispatcher, tracker, room, _rx) = fixture();
        let (_w1, _w1_rx) = online_worker(&room, "w1", WorkerRole::Normal, 4);

        let task = single("1_A");
        dispatcher.dispatch(task.clone()).unwrap();
        dispatcher.dispatch_step().await;
        assert_eq!(task.state(), TaskState::InProc);

        assert!(dispatcher.redispatch(&task).await);
        assert_eq!(task.state(), TaskState::Prepare);
        assert_eq!(tracker.which_worker("1_A"), None);
        assert_eq!(dispatcher.tasks_in_wait().len(), 1);
    }

    #[tokio::test]
    async fn test_redispatch_of_failed_task_untracks() {
        let (dispatcher, tracker, _room, _rx) = fixture();
        let task = single("1_A");
        dispatcher.dispatch(task.clone()).unwrap();
        task.state_change(TaskState::Failure).unwrap();

        assert!(!dispatcher.redispatch(&task).await);
        assert!(!tracker.is_in_track("1_A"));
    }

    #[tokio::test]
    async fn test_cancel_notifies_worker_and_fails_task() {
        let (dispatcher, tracker, room, _rx) = fixture();
        let (_w1, mut w1_rx) = online_worker(&room, "w1", WorkerRole::Normal, 4);

        let task = single("1_A");
        dispatcher.dispatch(task.clone()).unwrap();
        dispatcher.dispatch_step().await;
        let _ = w1_rx.recv().await; // NewTask

        dispatcher.cancel("1_A").await;
        assert_eq!(task.state(), TaskState::Failure);
        assert!(!tracker.is_in_track("1_A"));
        assert!(matches!(w1_rx.recv().await, Some(Letter::Cancel(_))));
    }

    #[tokio::test]
    async fn test_worker_lost_single_redispatched_post_reported_failed() {
        let (dispatcher, tracker, room, mut notify_rx) = fixture();
        let (w1, _w1_rx) = online_worker(&room, "w1", WorkerRole::Normal, 4);
        let (m1, _m1_rx) = online_worker(&room, "m1", WorkerRole::Merger, 4);

        let s = single("1_A");
        let p = post("1_P");
        dispatcher.dispatch(s.clone()).unwrap();
        dispatcher.dispatch(p.clone()).unwrap();
        dispatcher.dispatch_step().await;
        dispatcher.dispatch_step().await;
        assert_eq!(tracker.which_worker("1_A"), Some("w1".into()));
        assert_eq!(tracker.which_worker("1_P"), Some("m1".into()));

        dispatcher.worker_lost_redispatch(&w1).await;
        assert_eq!(s.state(), TaskState::Prepare);
        assert_eq!(dispatcher.tasks_in_wait().len(), 1);
        // The fallback to PREPARE is visible to the job master.
        assert_eq!(
            notify_rx.recv().await.unwrap(),
            ("1_A".to_string(), TaskState::Prepare)
        );

        dispatcher.worker_lost_redispatch(&m1).await;
        let (tid, state) = notify_rx.recv().await.unwrap();
        assert_eq!(tid, "1_P");
        assert_eq!(state, TaskState::Failure);
    }

    #[tokio::test]
    async fn test_terminal_state_releases_worker_and_track() {
        let (dispatcher, tracker, room, mut notify_rx) = fixture();
        let (w1, _w1_rx) = online_worker(&room, "w1", WorkerRole::Normal, 4);

        let task = single("1_A");
        dispatcher.dispatch(task.clone()).unwrap();
        dispatcher.dispatch_step().await;

        task.state_change(TaskState::Finished).unwrap();
        dispatcher.on_task_state_changed("1_A", TaskState::Finished).await;

        assert_eq!(w1.num_of_task_proc(), 0);
        assert!(!tracker.is_in_track("1_A"));
        assert_eq!(
            notify_rx.recv().await.unwrap(),
            ("1_A".to_string(), TaskState::Finished)
        );
    }
}
