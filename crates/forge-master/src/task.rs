// Tasks are the unit of work the master hands to one worker: a Single task
// runs one build recipe, a Post task merges the outputs of its siblings.

use chrono::{DateTime, Utc};
use forge_common::error::ProtocolError;
use forge_common::letter::{
    Letter, NewTaskContent, NewTaskHeader, NewTaskLetter, PostTaskContent, PostTaskHeader,
    PostTaskLetter, StateCode, TaskExtra,
};
use forge_common::recipe::Build;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Longest task id that still fits the binary frame's task-id slot.
pub const TASK_ID_MAX_LEN: usize = forge_common::letter::BinaryLetter::TASK_ID_FIELD_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Prepare,
    InProc,
    Finished,
    Failure,
}

impl TaskState {
    /// Transition topology. Failure is terminal; Finished may return to
    /// Prepare for a redispatch.
    pub fn can_move_to(self, to: TaskState) -> bool {
        use TaskState::*;
        match self {
            Prepare => matches!(to, Prepare | InProc | Failure),
            InProc => matches!(to, InProc | Prepare | Finished | Failure),
            Finished => matches!(to, Prepare | Finished | Failure),
            Failure => matches!(to, Failure),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Prepare => "PREPARE",
            TaskState::InProc => "IN_PROC",
            TaskState::Finished => "FIN",
            TaskState::Failure => "FAIL",
        }
    }
}

impl From<StateCode> for TaskState {
    fn from(code: StateCode) -> Self {
        match code {
            StateCode::Prepare => TaskState::Prepare,
            StateCode::InProc => TaskState::InProc,
            StateCode::Finished => TaskState::Finished,
            StateCode::Failure => TaskState::Failure,
        }
    }
}

/// What a task asks a worker to do.
#[derive(Debug, Clone)]
pub enum TaskKind {
    Single {
        build: Build,
        need_post: bool,
        /// Merge slot the result belongs to, when part of a build set.
        post_target: Option<String>,
    },
    Post {
        fragments: Vec<String>,
        merge: Build,
    },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Single { .. } => "Single",
            TaskKind::Post { .. } => "Post",
        }
    }
}

#[derive(Debug)]
struct TaskCell {
    state: TaskState,
    refs: u32,
    last_update: DateTime<Utc>,
}

/// One unit of work. Shared between the owning job, the wait-area and the
/// assigned worker's in-proc set; state mutations go through `state_change`
/// which enforces the transition topology.
#[derive(Debug)]
pub struct Task {
    id: String,
    sn: String,
    vsn: String,
    kind: TaskKind,
    /// Unique id of the owning job; back-reference only, the job is the owner.
    job_uid: u64,
    cell: Mutex<TaskCell>,
}

pub type TaskRef = Arc<Task>;

impl Task {
    pub fn new(
        id: impl Into<String>,
        sn: impl Into<String>,
        vsn: impl Into<String>,
        kind: TaskKind,
        job_uid: u64,
    ) -> TaskRef {
        Arc::new(Self {
            id: id.into(),
            sn: sn.into(),
            vsn: vsn.into(),
            kind,
            job_uid,
            cell: Mutex::new(TaskCell {
                state: TaskState::Prepare,
                refs: 1,
                last_update: Utc::now(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sn(&self) -> &str {
        &self.sn
    }

    pub fn vsn(&self) -> &str {
        &self.vsn
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn job_uid(&self) -> u64 {
        self.job_uid
    }

    pub fn state(&self) -> TaskState {
        self.cell.lock().unwrap().state
    }

    /// Apply a state transition. Transitions outside the topology are
    /// rejected with an error and leave the task untouched; a transition to
    /// the current state is accepted as a no-op.
    pub fn state_change(&self, to: TaskState) -> Result<(), ProtocolError> {
        let mut cell = self.cell.lock().unwrap();
        if !cell.state.can_move_to(to) {
            return Err(ProtocolError::InvalidTransition {
                from: cell.state.as_str(),
                to: to.as_str(),
            });
        }
        cell.state = to;
        cell.last_update = Utc::now();
        Ok(())
    }

    pub fn refs(&self) -> u32 {
        self.cell.lock().unwrap().refs
    }

    pub fn add_ref(&self) {
        self.cell.lock().unwrap().refs += 1;
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.cell.lock().unwrap().last_update
    }

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    pub fn is_failure(&self) -> bool {
        self.state() == TaskState::Failure
    }

    /// Task id without the owning job's unique-id prefix.
    pub fn trimmed_id(&self) -> &str {
        match self.id.split_once('_') {
            Some((_, rest)) if !rest.is_empty() => rest,
            _ => &self.id,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.id.len() <= TASK_ID_MAX_LEN
            && !self.id.contains(' ')
            && !self.sn.contains(' ')
            && !self.vsn.contains(' ')
    }

    /// Wire form dispatched to the chosen worker.
    pub fn to_letter(&self) -> Letter {
        match &self.kind {
            TaskKind::Single {
                build,
                need_post,
                post_target,
            } => Letter::NewTask(NewTaskLetter {
                header: NewTaskHeader {
                    tid: self.id.clone(),
                    parent: self.vsn.clone(),
                    need_post: *need_post,
                },
                content: NewTaskContent {
                    sn: self.sn.clone(),
                    vsn: self.vsn.clone(),
                    datetime: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                    extra: TaskExtra {
                        cmds: build.cmd.clone(),
                        result_path: build.output.clone(),
                        post_target: post_target.clone(),
                    },
                },
            }),
            TaskKind::Post { fragments, merge } => Letter::PostTask(PostTaskLetter {
                header: PostTaskHeader {
                    ident: self.id.clone(),
                    version: self.vsn.clone(),
                    output: merge.output.clone(),
                },
                content: PostTaskContent {
                    cmds: merge.cmd.clone(),
                    fragments: fragments.clone(),
                },
            }),
        }
    }
}

/// Keyed task container used for a worker's in-proc set.
#[derive(Debug, Default)]
pub struct TaskGroup {
    tasks: BTreeMap<String, TaskRef>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: TaskRef) {
        self.tasks.entry(task.id().to_string()).or_insert(task);
    }

    pub fn remove(&mut self, id: &str) -> Option<TaskRef> {
        self.tasks.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<TaskRef> {
        self.tasks.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn to_vec(&self) -> Vec<TaskRef> {
        self.tasks.values().cloned().collect()
    }

    /// Number of tasks counting toward a worker's capacity. Post tasks do
    /// not occupy a build slot.
    pub fn num_of_tasks(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| matches!(t.kind(), TaskKind::Single { .. }))
            .count()
    }

    pub fn remove_where(&mut self, predicate: impl Fn(&TaskRef) -> bool) {
        self.tasks.retain(|_, t| !predicate(t));
    }
}
