//! Instance pool
//!
//! A bounded set of warm instances for one plugin, for workloads where a
//! single serialized instance cannot keep up with event bursts. Slots are
//! handed out as RAII guards: dropping a guard returns the slot, so a
//! panicking caller can never leak one.

use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use wyvern_core::{PluginError, PluginResult};

use crate::instance::Instance;

struct PoolState {
    idle: Vec<Instance>,
    closed: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    notify: Notify,
    size: usize,
}

/// Fixed-size pool of interchangeable instances of one plugin.
pub struct InstancePool {
    shared: Arc<PoolShared>,
}

impl InstancePool {
    /// Build a pool over pre-constructed instances. The pool size is fixed
    /// at the number handed in.
    pub fn new(instances: Vec<Instance>) -> Self {
        let size = instances.len();
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    idle: instances,
                    closed: false,
                }),
                notify: Notify::new(),
                size,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Idle instances currently in the pool.
    pub fn available(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Take an instance without waiting.
    pub fn try_acquire(&self) -> PluginResult<PooledInstance> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(PluginError::PoolClosed);
        }
        match state.idle.pop() {
            Some(instance) => Ok(PooledInstance {
                instance: Some(instance),
                shared: Arc::clone(&self.shared),
            }),
            None => Err(PluginError::PoolExhausted),
        }
    }

    /// Take an instance, waiting until one is free or `deadline` expires.
    pub async fn acquire(&self, deadline: Duration) -> PluginResult<PooledInstance> {
        let expires = Instant::now() + deadline;
        loop {
            let notified = self.shared.notify.notified();
            match self.try_acquire() {
                Ok(guard) => return Ok(guard),
                Err(PluginError::PoolExhausted) => {}
                Err(e) => return Err(e),
            }

            let remaining = expires.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PluginError::Timeout {
                    limit_ms: deadline.as_millis() as u64,
                });
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => {
                    return Err(PluginError::Timeout {
                        limit_ms: deadline.as_millis() as u64,
                    });
                }
            }
        }
    }

    /// Return a slot to the pool. Equivalent to dropping the guard.
    pub fn release(&self, instance: PooledInstance) {
        drop(instance);
    }

    /// Acquire a slot, run `f` with the guard, and return the slot on every
    /// exit path: the guard's drop runs even when the callback's future is
    /// dropped mid-poll or panics.
    pub async fn with_instance<F, Fut, T>(&self, deadline: Duration, f: F) -> PluginResult<T>
    where
        F: FnOnce(PooledInstance) -> Fut,
        Fut: Future<Output = PluginResult<T>>,
    {
        let guard = self.acquire(deadline).await?;
        f(guard).await
    }

    /// Close the pool: no further acquires, all idle instances destroyed.
    /// In-flight guards destroy their instances on release. Idempotent.
    pub fn close(&self) {
        let drained = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        drop(drained);
        self.shared.notify.notify_waiters();
    }
}

impl Drop for InstancePool {
    fn drop(&mut self) {
        self.close();
    }
}

/// A pool slot. Derefs to the instance; dropping it returns the slot (or
/// destroys the instance when the pool has closed).
pub struct PooledInstance {
    instance: Option<Instance>,
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for PooledInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledInstance").finish_non_exhaustive()
    }
}

impl Deref for PooledInstance {
    type Target = Instance;

    fn deref(&self) -> &Instance {
        self.instance
            .as_ref()
            .expect("pooled instance present until drop")
    }
}

impl Drop for PooledInstance {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };
        let mut state = self.shared.state.lock();
        if state.closed {
            drop(instance);
        } else {
            state.idle.push(instance);
            self.shared.notify.notify_one();
        }
    }
}
