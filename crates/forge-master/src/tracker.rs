// Authoritative task-id -> (task, assigned worker) registry.
// Lookup only: the tracker holds weak task references and never drives a
// task's lifecycle. All writers are serialized through the dispatch mutex.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use crate::task::{Task, TaskRef};

#[derive(Default)]
struct Entry {
    task: Weak<Task>,
    worker: Option<String>,
}

#[derive(Default)]
pub struct TaskTracker {
    entries: Mutex<HashMap<String, Entry>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, task: &TaskRef) {
        self.entries.lock().unwrap().insert(
            task.id().to_string(),
            Entry {
                task: std::sync::Arc::downgrade(task),
                worker: None,
            },
        );
    }

    pub fn untrack(&self, taskid: &str) {
        self.entries.lock().unwrap().remove(taskid);
    }

    pub fn is_in_track(&self, taskid: &str) -> bool {
        self.entries.lock().unwrap().contains_key(taskid)
    }

    /// Record (or clear) the worker a task is assigned to.
    pub fn on_worker(&self, taskid: &str, worker: Option<String>) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(taskid) {
            entry.worker = worker;
        }
    }

    pub fn which_worker(&self, taskid: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap()
            .get(taskid)
            .and_then(|e| e.worker.clone())
    }

    pub fn get_task(&self, taskid: &str) -> Option<TaskRef> {
        self.entries
            .lock()
            .unwrap()
            .get(taskid)
            .and_then(|e| e.task.upgrade())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
