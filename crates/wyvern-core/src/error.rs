//! Error taxonomy for the plugin host.

use std::fmt;

use thiserror::Error;

use crate::manifest::PluginId;
use crate::state::PluginState;

/// Result alias used throughout the host.
pub type PluginResult<T> = Result<T, PluginError>;

/// Everything that can go wrong between discovering a plugin and calling
/// into it.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The manifest could not be parsed at all.
    #[error("invalid manifest: {field}: {reason}")]
    ManifestInvalid { field: String, reason: String },

    /// The manifest parsed but failed semantic validation.
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    /// Dependency resolution failed for the discovered set.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// The WASM module failed to compile or link.
    #[error("failed to compile module: {reason}")]
    ModuleCompile { reason: String },

    /// A required export is absent from the module.
    #[error("missing required export: {name}")]
    MissingExport { name: String },

    /// The guest trapped during execution.
    #[error("plugin trapped ({kind}): {message}")]
    Trap { kind: TrapKind, message: String },

    /// The guest exceeded its execution deadline.
    #[error("plugin call timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("plugin {0} is not enabled")]
    NotEnabled(PluginId),

    #[error("plugin {0} not found")]
    NotFound(PluginId),

    #[error("plugin {0} already loaded")]
    AlreadyLoaded(PluginId),

    /// A lifecycle transition was requested from an incompatible state.
    #[error("plugin {id}: cannot {op} in state {state}")]
    InvalidState {
        id: PluginId,
        op: &'static str,
        state: PluginState,
    },

    #[error("instance pool exhausted")]
    PoolExhausted,

    #[error("instance pool is closed")]
    PoolClosed,

    #[error("storage {op}: {cause}")]
    Storage { op: &'static str, cause: String },

    #[error("bridge {op}: {cause}")]
    Bridge { op: &'static str, cause: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PluginError {
    pub fn storage(op: &'static str, cause: impl fmt::Display) -> Self {
        PluginError::Storage {
            op,
            cause: cause.to_string(),
        }
    }

    pub fn bridge(op: &'static str, cause: impl fmt::Display) -> Self {
        PluginError::Bridge {
            op,
            cause: cause.to_string(),
        }
    }
}

/// Classification of guest traps reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    OutOfMemory,
    FuelExhausted,
    MemoryBounds,
    DivideByZero,
    Unreachable,
    Other,
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrapKind::OutOfMemory => "oom",
            TrapKind::FuelExhausted => "fuel",
            TrapKind::MemoryBounds => "memory_bounds",
            TrapKind::DivideByZero => "divide",
            TrapKind::Unreachable => "unreachable",
            TrapKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// A single manifest validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// All validation failures for one manifest, reported together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    /// `Ok(())` when no failure was recorded.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => f.write_str("no validation errors"),
            [single] => write!(f, "validation: {single}"),
            many => {
                write!(f, "{} validation errors:", many.len())?;
                for err in many {
                    write!(f, "\n  - {err}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ValidationErrors {}

/// A non-optional dependency pointing at a plugin that was not discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDependency {
    pub plugin: PluginId,
    pub dependency: String,
}

impl fmt::Display for MissingDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "plugin {} requires missing dependency {}",
            self.plugin, self.dependency
        )
    }
}

/// Dependency resolution failures. Missing dependencies are collected, one
/// entry per violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("{}", format_missing(.0))]
    Missing(Vec<MissingDependency>),

    #[error("circular dependency among: {}", format_cycle(.0))]
    Cycle(Vec<PluginId>),
}

fn format_missing(violations: &[MissingDependency]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_cycle(members: &[PluginId]) -> String {
    members
        .iter()
        .map(PluginId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
