//! Plugin lifecycle states and per-instance metrics.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::events::EventType;

/// Lifecycle of one plugin instance.
///
/// `Unloaded → Loading → Loaded → Enabling → Enabled → Disabling → Disabled`,
/// with `Disabled → Enabling` allowed again. `Error` is a dead end until the
/// plugin is explicitly unloaded and reloaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Enabling,
    Enabled,
    Disabling,
    Disabled,
    Error,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginState::Unloaded => "unloaded",
            PluginState::Loading => "loading",
            PluginState::Loaded => "loaded",
            PluginState::Enabling => "enabling",
            PluginState::Enabled => "enabled",
            PluginState::Disabling => "disabling",
            PluginState::Disabled => "disabled",
            PluginState::Error => "error",
        }
    }

    /// Whether guest calls are accepted in this state.
    pub fn is_callable(&self) -> bool {
        matches!(self, PluginState::Loaded | PluginState::Enabled)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-instance execution metrics. Safe for concurrent use; readers take a
/// [`MetricsSnapshot`].
#[derive(Debug, Default)]
pub struct Metrics {
    inner: RwLock<MetricsInner>,
}

#[derive(Debug, Default, Clone)]
struct MetricsInner {
    total_calls: u64,
    total_execution: Duration,
    average_execution: Duration,
    max_execution: Duration,
    last_execution: Duration,
    memory_usage_bytes: u64,
    peak_memory_bytes: u64,
    events_handled: HashMap<EventType, u64>,
    events_cancelled: HashMap<EventType, u64>,
    error_count: u64,
    last_error: Option<String>,
    last_error_at: Option<SystemTime>,
}

/// Point-in-time copy of a [`Metrics`] record, safe to export.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub total_execution: Duration,
    pub average_execution: Duration,
    pub max_execution: Duration,
    pub last_execution: Duration,
    pub memory_usage_bytes: u64,
    pub peak_memory_bytes: u64,
    pub events_handled: HashMap<EventType, u64>,
    pub events_cancelled: HashMap<EventType, u64>,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_error_at: Option<SystemTime>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self, duration: Duration) {
        let mut inner = self.inner.write();
        inner.total_calls += 1;
        inner.total_execution += duration;
        inner.last_execution = duration;
        if duration > inner.max_execution {
            inner.max_execution = duration;
        }
        inner.average_execution = inner.total_execution / inner.total_calls as u32;
    }

    pub fn record_event(&self, event: EventType, cancelled: bool) {
        let mut inner = self.inner.write();
        *inner.events_handled.entry(event).or_insert(0) += 1;
        if cancelled {
            *inner.events_cancelled.entry(event).or_insert(0) += 1;
        }
    }

    pub fn record_error(&self, error: impl fmt::Display) {
        let mut inner = self.inner.write();
        inner.error_count += 1;
        inner.last_error = Some(error.to_string());
        inner.last_error_at = Some(SystemTime::now());
    }

    pub fn record_memory(&self, bytes: u64) {
        let mut inner = self.inner.write();
        inner.memory_usage_bytes = bytes;
        if bytes > inner.peak_memory_bytes {
            inner.peak_memory_bytes = bytes;
        }
    }

    pub fn error_count(&self) -> u64 {
        self.inner.read().error_count
    }

    /// Deep copy of the current values. Maps are cloned under the lock so a
    /// snapshot never shows a half-updated pair.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().clone();
        MetricsSnapshot {
            total_calls: inner.total_calls,
            total_execution: inner.total_execution,
            average_execution: inner.average_execution,
            max_execution: inner.max_execution,
            last_execution: inner.last_execution,
            memory_usage_bytes: inner.memory_usage_bytes,
            peak_memory_bytes: inner.peak_memory_bytes,
            events_handled: inner.events_handled,
            events_cancelled: inner.events_cancelled,
            error_count: inner.error_count,
            last_error: inner.last_error,
            last_error_at: inner.last_error_at,
        }
    }
}
