use crate::services::sender::TransferTask;
use std::sync::Arc;
use tracing::debug;

/// Transfer tasks started by a dispatcher and not yet observed as done.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Vec<Arc<dyn TransferTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: Arc<dyn TransferTask>) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Drops every finished task. Returns how many were removed.
    pub fn reap(&mut self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|task| {
            let done = task.is_done();
            if done {
                debug!("Reaped finished task for session {}", task.uuid());
            }
            !done
        });
        before - self.tasks.len()
    }

    /// Asks every unfinished task to stop. Returns how many were asked.
    pub fn cancel_running(&self) -> usize {
        let mut cancelled = 0;
        for task in self.tasks.iter().filter(|t| !t.is_done()) {
            task.cancel();
            cancelled += 1;
        }
        cancelled
    }

    pub fn cancel_by_uuid(&self, uuid: &str) -> bool {
        match self.tasks.iter().find(|t| t.matches_uuid(uuid)) {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }
}
