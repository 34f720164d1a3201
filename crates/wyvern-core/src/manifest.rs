//! Plugin manifests
//!
//! The declarative `plugin.toml` every plugin ships: identity, entry point,
//! event subscriptions, dependencies and resource limits. Validation is
//! collect-all: a broken manifest reports every problem at once.

use std::fmt;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult, ValidationErrors};
use crate::events::{EventSubscription, EventType, Priority};

static PLUGIN_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)+$").expect("plugin id regex is valid")
});

/// Unique identifier of a loaded plugin, e.g. `acme.teleport_pads`.
///
/// Lowercase dotted segments, at least one dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(pub String);

impl PluginId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id matches the required shape.
    pub fn is_valid(id: &str) -> bool {
        PLUGIN_ID_RE.is_match(id)
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PluginId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PluginId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Semantic version, ordered lexicographically by (major, minor, patch).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A dependency on another plugin. Non-optional dependencies must be present
/// in the discovered set or the owning plugin fails to load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: String,
    #[serde(default)]
    pub version: Version,
    #[serde(default)]
    pub optional: bool,
}

/// Per-plugin resource budgets. Zero means "inherit the host default"; the
/// effective value is additionally floored against the global ceiling
/// (see [`crate::config::HostConfig::effective_limits`]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_memory_mb: u64,
    pub max_execution_ms: u64,
    pub max_fuel: u64,
}

impl ResourceLimits {
    /// Sensible defaults for a plugin that declares nothing.
    pub fn standard() -> Self {
        Self {
            max_memory_mb: 64,
            max_execution_ms: 100,
            max_fuel: 1_000_000,
        }
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb * 1024 * 1024
    }
}

/// A plugin's `plugin.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub id: String,
    pub name: String,
    pub version: Version,
    pub description: String,
    pub authors: Vec<String>,
    pub website: String,
    pub license: String,

    pub api_version: Version,
    /// Path of the WASM file, relative to the plugin directory.
    pub entry_point: String,

    pub events: Vec<EventSubscription>,
    pub dependencies: Vec<Dependency>,
    pub load_before: Vec<String>,
    pub load_after: Vec<String>,
    pub limits: ResourceLimits,
}

impl Manifest {
    /// Parse a manifest from TOML text. Parse failures are reported as
    /// [`PluginError::ManifestInvalid`]; semantic problems come from
    /// [`Manifest::validate`].
    pub fn from_toml(text: &str) -> PluginResult<Self> {
        toml::from_str(text).map_err(|e| PluginError::ManifestInvalid {
            field: "manifest".to_string(),
            reason: e.to_string(),
        })
    }

    /// Read and parse `plugin.toml`, then validate it.
    pub fn load(path: &Path) -> PluginResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let manifest = Self::from_toml(&text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the manifest, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.id.is_empty() {
            errors.push("id", "plugin id is required");
        } else if !PluginId::is_valid(&self.id) {
            errors.push(
                "id",
                format!(
                    "invalid plugin id {:?}: must be lowercase dotted segments",
                    self.id
                ),
            );
        }
        if self.name.is_empty() {
            errors.push("name", "plugin name is required");
        }
        if self.entry_point.is_empty() {
            errors.push("entry_point", "entry point is required");
        }

        for sub in &self.events {
            if sub.event_type().is_none() {
                errors.push("events", format!("unknown event type {:?}", sub.event));
            }
            if sub.priority < Priority::LOWEST || sub.priority > Priority::MONITOR {
                errors.push(
                    "events",
                    format!(
                        "priority {} for {:?} outside allowed band [{}, {}]",
                        sub.priority,
                        sub.event,
                        Priority::LOWEST,
                        Priority::MONITOR
                    ),
                );
            }
        }

        for dep in &self.dependencies {
            if dep.id == self.id {
                errors.push("dependencies", "plugin cannot depend on itself");
            }
        }

        for after in &self.load_after {
            let hard = self
                .dependencies
                .iter()
                .any(|d| !d.optional && d.id == *after);
            if hard {
                errors.push(
                    "load_after",
                    format!("{after:?} is already a hard dependency"),
                );
            }
        }

        errors.into_result()
    }

    /// Whether this plugin subscribed to `event`.
    pub fn subscribed_to(&self, event: EventType) -> bool {
        self.events.iter().any(|s| s.event_type() == Some(event))
    }

    /// Declared priority for `event`, or `NORMAL` when not subscribed.
    pub fn priority_for(&self, event: EventType) -> Priority {
        self.events
            .iter()
            .find(|s| s.event_type() == Some(event))
            .map(|s| s.priority)
            .unwrap_or(Priority::NORMAL)
    }

    pub fn plugin_id(&self) -> PluginId {
        PluginId(self.id.clone())
    }
}
