//! Registry of spawned background tasks, drained once per sync cycle.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::task::{JoinError, JoinHandle};

/// A spawned task together with the identifier it was registered under.
#[derive(Debug)]
pub struct TrackedTask<T> {
    pub key: String,
    pub handle: JoinHandle<T>,
}

/// Append-only task set drained by the sync loop.
///
/// Callbacks append, the loop drains; a drained task is never handed out twice.
#[derive(Debug)]
pub struct TaskRegistry<T> {
    tasks: Mutex<Vec<TrackedTask<T>>>,
}

impl<T> Default for TaskRegistry<T> {
    fn default() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl<T> TaskRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. Several tasks may share a key.
    pub fn track(&self, key: impl Into<String>, handle: JoinHandle<T>) {
        self.lock().push(TrackedTask {
            key: key.into(),
            handle,
        });
    }

    /// Spawn and register a task only if no task is registered under `key`.
    ///
    /// Returns `true` when the task was spawned.
    pub fn track_unique<F>(&self, key: &str, spawn: F) -> bool
    where
        F: FnOnce() -> JoinHandle<T>,
    {
        let mut tasks = self.lock();
        if tasks.iter().any(|task| task.key == key) {
            return false;
        }
        tasks.push(TrackedTask {
            key: key.to_owned(),
            handle: spawn(),
        });
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().iter().any(|task| task.key == key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove every registered task, leaving the registry empty.
    pub fn drain(&self) -> Vec<TrackedTask<T>> {
        std::mem::take(&mut *self.lock())
    }

    /// Abort and forget every registered task.
    pub fn abort_all(&self) {
        for task in self.drain() {
            task.handle.abort();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TrackedTask<T>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Await every task in registration order.
///
/// Tasks not yet joined when the returned future is dropped are aborted, so
/// cancelling a drain never leaves detached work behind.
pub async fn join_all<T>(tasks: Vec<TrackedTask<T>>) -> Vec<(String, Result<T, JoinError>)> {
    let mut pending = AbortOnDrop(tasks.into_iter().collect());
    let mut results = Vec::with_capacity(pending.0.len());
    while let Some(task) = pending.0.front_mut() {
        let result = (&mut task.handle).await;
        if let Some(task) = pending.0.pop_front() {
            results.push((task.key, result));
        }
    }
    results
}

struct AbortOnDrop<T>(VecDeque<TrackedTask<T>>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        for task in &self.0 {
            task.handle.abort();
        }
    }
}
