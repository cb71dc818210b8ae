//! Transactional task scheduling.
//!
//! The spatial core never talks to clients directly. Anything client facing
//! is packaged as a [`Task`] and handed to a [`TaskScheduler`], which runs it
//! exactly once on behalf of an [`Identity`].

use std::thread::JoinHandle;

use crossbeam_channel::{Sender, unbounded};

use crate::types::Identity;

/// Errors reported by scheduled work.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("session closed for {0}")]
    SessionClosed(Identity),
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// A unit of work scheduled against a session.
pub type Task = Box<dyn FnOnce() -> Result<(), TaskError> + Send + 'static>;

/// Runs tasks with exactly-once semantics against a session's state.
pub trait TaskScheduler: Send + Sync {
    fn schedule_transaction(&self, task: Task, identity: &Identity);
}

/// Runs each task immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl TaskScheduler for InlineScheduler {
    fn schedule_transaction(&self, task: Task, identity: &Identity) {
        run_task(task, identity);
    }
}

/// Runs tasks in FIFO order on a dedicated delivery thread, so slow sessions
/// never stall the caller.
pub struct QueuedScheduler {
    tx: Option<Sender<(Identity, Task)>>,
    worker: Option<JoinHandle<()>>,
}

impl QueuedScheduler {
    pub fn new() -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<(Identity, Task)>();
        let worker = std::thread::Builder::new()
            .name("task-scheduler".into())
            .spawn(move || {
                while let Ok((identity, task)) = rx.recv() {
                    run_task(task, &identity);
                }
                tracing::debug!("task scheduler drained");
            })?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }
}

impl TaskScheduler for QueuedScheduler {
    fn schedule_transaction(&self, task: Task, identity: &Identity) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send((identity.clone(), task)).is_err() {
            tracing::warn!(%identity, "task scheduler stopped, dropping task");
        }
    }
}

impl Drop for QueuedScheduler {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish what is queued and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("task scheduler thread panicked");
            }
        }
    }
}

fn run_task(task: Task, identity: &Identity) {
    if let Err(err) = task() {
        tracing::warn!(%identity, error = %err, "scheduled task failed");
    }
}
