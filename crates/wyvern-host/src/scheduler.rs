//! Delayed task scheduler
//!
//! Backs the `host_schedule_task` / `host_cancel_task` surface. Tasks are
//! keyed `(plugin_id, task_id)`; re-scheduling an existing key replaces the
//! pending task. Fired tasks are delivered through a sink the manager wires
//! to the owning plugin's `on_task` export.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use wyvern_core::PluginId;

/// Delivery callback for fired tasks: `(plugin_id, task_id, data)`.
pub type TaskSink = Arc<dyn Fn(PluginId, String, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

struct TaskEntry {
    handle: JoinHandle<()>,
    generation: u64,
}

struct SchedulerInner {
    tasks: Mutex<HashMap<(PluginId, String), TaskEntry>>,
    sink: TaskSink,
    runtime: Handle,
    shutdown: CancellationToken,
    generation: Mutex<u64>,
}

/// Per-plugin delayed tasks. Cheap to clone into host-call closures; all
/// clones share one task table.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    /// Must be called from within a tokio runtime; fired tasks are spawned
    /// onto it. `shutdown` aborts every pending task when cancelled.
    pub fn new(sink: TaskSink, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                tasks: Mutex::new(HashMap::new()),
                sink,
                runtime: Handle::current(),
                shutdown,
                generation: Mutex::new(0),
            }),
        }
    }

    /// Schedule `data` for delivery after `delay`, replacing any pending
    /// task with the same id. Returns false once the scheduler is shut down.
    pub fn schedule(&self, plugin: PluginId, task_id: String, delay: Duration, data: Vec<u8>) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }

        let generation = {
            let mut generation = self.inner.generation.lock();
            *generation += 1;
            *generation
        };

        let key = (plugin, task_id);
        let inner = Arc::clone(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let task_key = key.clone();
        let handle = self.inner.runtime.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            (inner.sink)(task_key.0.clone(), task_key.1.clone(), data).await;

            // Remove our own entry unless a reschedule replaced it.
            let mut tasks = inner.tasks.lock();
            if tasks.get(&task_key).is_some_and(|e| e.generation == generation) {
                tasks.remove(&task_key);
            }
        });

        let replaced = self
            .inner
            .tasks
            .lock()
            .insert(key, TaskEntry { handle, generation });
        if let Some(old) = replaced {
            old.handle.abort();
        }
        true
    }

    /// Cancel one pending task. Returns whether anything was pending.
    pub fn cancel(&self, plugin: &PluginId, task_id: &str) -> bool {
        let key = (plugin.clone(), task_id.to_string());
        match self.inner.tasks.lock().remove(&key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending task owned by `plugin`.
    pub fn cancel_all(&self, plugin: &PluginId) {
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|(owner, task_id), entry| {
            if owner == plugin {
                debug!(plugin = %owner, task = %task_id, "cancelling pending task");
                entry.handle.abort();
                false
            } else {
                true
            }
        });
    }

    /// Pending task count across all plugins.
    pub fn pending(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Abort every pending task. Scheduling afterwards is rejected once the
    /// shared shutdown token is cancelled.
    pub fn shutdown(&self) {
        for (_, entry) in self.inner.tasks.lock().drain() {
            entry.handle.abort();
        }
    }
}
