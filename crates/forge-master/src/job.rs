// A job is an externally requested build bound to a recipe: its identity,
// the info map supplied by the requester and the tasks binding produced.

use std::collections::BTreeMap;

use crate::task::{TaskRef, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    InProcessing,
    Done,
}

#[derive(Debug)]
pub struct Job {
    pub jobid: String,
    /// Allocated by the job master at dispatch time, strictly increasing
    /// across all jobs ever bound.
    pub unique_id: u64,
    pub cmd_id: String,
    /// Requester-supplied info (sn, vsn, flags). Immutable after bind.
    info: BTreeMap<String, String>,
    /// Tasks ordered by identifier.
    tasks: BTreeMap<String, TaskRef>,
    /// Artifact URL, set when the job's result is stored.
    pub job_result: Option<String>,
    pub state: JobState,
}

impl Job {
    pub fn new(
        jobid: impl Into<String>,
        cmd_id: impl Into<String>,
        info: BTreeMap<String, String>,
    ) -> Self {
        Self {
            jobid: jobid.into(),
            unique_id: 0,
            cmd_id: cmd_id.into(),
            info,
            tasks: BTreeMap::new(),
            job_result: None,
            state: JobState::Pending,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.jobid.is_empty() && !self.cmd_id.is_empty()
    }

    pub fn get_info(&self, key: &str) -> Option<&str> {
        self.info.get(key).map(|s| s.as_str())
    }

    pub fn infos(&self) -> &BTreeMap<String, String> {
        &self.info
    }

    pub fn add_task(&mut self, task: TaskRef) {
        self.tasks.entry(task.id().to_string()).or_insert(task);
    }

    pub fn get_task(&self, taskid: &str) -> Option<&TaskRef> {
        self.tasks.get(taskid)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskRef> {
        self.tasks.values()
    }

    pub fn num_of_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// True when every task of the job reached Finished.
    pub fn is_fin(&self) -> bool {
        self.tasks.values().all(|t| t.state() == TaskState::Finished)
    }
}
