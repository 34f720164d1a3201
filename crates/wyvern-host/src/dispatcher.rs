//! Event dispatcher
//!
//! Priority-ordered fan-out of game events to subscribed handlers. The
//! subscription list is snapshotted under a read lock and released before
//! any handler runs, so handlers are free to call back into the manager.
//! One broken handler never silences the rest of the chain.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use wyvern_core::{EventResult, EventType, PluginError, PluginId, PluginResult, Priority};

/// Future returned by one handler invocation.
pub type HandlerFuture = BoxFuture<'static, PluginResult<EventResult>>;

/// An event handler: receives the neutral payload and the remaining
/// deadline, returns the guest's verdict. Implementations derive their own
/// per-plugin deadline by flooring against the plugin's execution limit.
pub type Handler = Arc<dyn Fn(Vec<u8>, Duration) -> HandlerFuture + Send + Sync>;

/// The binding of a handler to an event at a priority.
#[derive(Clone)]
pub struct Subscription {
    pub plugin_id: PluginId,
    pub priority: Priority,
    /// Skip this handler when the event is already cancelled.
    pub ignore_cancelled: bool,
    pub handler: Handler,
}

/// Identifies one subscription. Dropping the token does not unsubscribe;
/// removal is explicit via the `unsubscribe` family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

#[derive(Clone)]
struct Entry {
    token: SubscriptionToken,
    sub: Subscription,
}

/// Aggregate outcome of one dispatch.
#[derive(Debug, Default)]
pub struct DispatchResult {
    /// Final cancellation verdict. Non-cancellable events never set this.
    pub cancelled: bool,
    /// Merged modifications; for the same key the highest-priority writer
    /// wins (handlers run in ascending priority, last write sticks).
    pub modifications: HashMap<String, String>,
    /// Handlers that ran to completion.
    pub handlers: usize,
    /// Per-handler failures; the fan-out continued past each one.
    pub errors: Vec<(PluginId, PluginError)>,
    pub duration: Duration,
}

/// Per-event dispatch counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EventStats {
    pub total: u64,
    pub cancelled: u64,
    pub total_duration: Duration,
}

/// Routes events to subscribed plugin handlers in priority order.
#[derive(Default)]
pub struct Dispatcher {
    subscriptions: RwLock<HashMap<EventType, Vec<Entry>>>,
    // Counters live under their own lock so recording them cannot stall a
    // concurrent dispatch snapshotting the subscription map.
    stats: Mutex<HashMap<EventType, EventStats>>,
    next_token: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. The per-event list is re-sorted stably by
    /// ascending priority, so equal priorities keep insertion order.
    pub fn subscribe(&self, event: EventType, sub: Subscription) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut subs = self.subscriptions.write();
        let list = subs.entry(event).or_default();
        list.push(Entry { token, sub });
        list.sort_by_key(|e| e.sub.priority);
        token
    }

    /// Remove every subscription owned by `plugin`.
    pub fn unsubscribe(&self, plugin: &PluginId) {
        let mut subs = self.subscriptions.write();
        for list in subs.values_mut() {
            list.retain(|e| e.sub.plugin_id != *plugin);
        }
    }

    /// Remove `plugin`'s subscriptions for one event.
    pub fn unsubscribe_event(&self, plugin: &PluginId, event: EventType) {
        let mut subs = self.subscriptions.write();
        if let Some(list) = subs.get_mut(&event) {
            list.retain(|e| e.sub.plugin_id != *plugin);
        }
    }

    /// Remove a single subscription by token.
    pub fn unsubscribe_token(&self, token: SubscriptionToken) {
        let mut subs = self.subscriptions.write();
        for list in subs.values_mut() {
            list.retain(|e| e.token != token);
        }
    }

    pub fn has_subscribers(&self, event: EventType) -> bool {
        self.subscriber_count(event) > 0
    }

    pub fn subscriber_count(&self, event: EventType) -> usize {
        self.subscriptions
            .read()
            .get(&event)
            .map_or(0, |list| list.len())
    }

    /// Fan `event` out to its handlers in ascending priority.
    ///
    /// A handler is skipped when the result is already cancelled and the
    /// subscription opted out with `ignore_cancelled`. Handler errors are
    /// recorded and the chain continues; an errored handler contributes
    /// neither cancellation nor modifications. Monitor-tier handlers run
    /// last and their mutations are suppressed.
    pub async fn dispatch(
        &self,
        event: EventType,
        payload: &[u8],
        deadline: Duration,
        cancel: CancellationToken,
    ) -> DispatchResult {
        let entries: Vec<Entry> = self
            .subscriptions
            .read()
            .get(&event)
            .cloned()
            .unwrap_or_default();

        let mut result = DispatchResult::default();
        if entries.is_empty() {
            return result;
        }

        let start = Instant::now();
        let event_id = Uuid::new_v4();

        for entry in &entries {
            if cancel.is_cancelled() {
                debug!(event = %event, event_id = %event_id, "dispatch cancelled");
                break;
            }
            if result.cancelled && entry.sub.ignore_cancelled {
                continue;
            }
            let remaining = deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                debug!(event = %event, event_id = %event_id, "dispatch deadline exhausted");
                break;
            }

            let future = (entry.sub.handler)(payload.to_vec(), remaining);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(event = %event, event_id = %event_id, "dispatch cancelled mid-handler");
                    break;
                }
                outcome = future => outcome,
            };

            match outcome {
                Err(e) => {
                    error!(
                        plugin = %entry.sub.plugin_id,
                        event = %event,
                        event_id = %event_id,
                        op = "dispatch",
                        error = %e,
                        "event handler error"
                    );
                    result.errors.push((entry.sub.plugin_id.clone(), e));
                }
                Ok(handler_result) => {
                    result.handlers += 1;
                    if entry.sub.priority.is_monitor() {
                        if handler_result.cancelled || !handler_result.modifications.is_empty() {
                            debug!(
                                plugin = %entry.sub.plugin_id,
                                event = %event,
                                "monitor handler mutations suppressed"
                            );
                        }
                        continue;
                    }
                    if handler_result.cancelled && event.is_cancellable() {
                        result.cancelled = true;
                    }
                    result.modifications.extend(handler_result.modifications);
                }
            }
        }

        result.duration = start.elapsed();

        let mut stats = self.stats.lock();
        let entry = stats.entry(event).or_default();
        entry.total += 1;
        if result.cancelled {
            entry.cancelled += 1;
        }
        entry.total_duration += result.duration;

        result
    }

    pub fn stats(&self, event: EventType) -> Option<EventStats> {
        self.stats.lock().get(&event).copied()
    }

    pub fn all_stats(&self) -> HashMap<EventType, EventStats> {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        self.stats.lock().clear();
    }
}
