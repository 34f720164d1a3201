//! Core types for the Wyvern plugin host.
//!
//! Wyvern runs WebAssembly plugins inside a voxel-game server. This crate
//! holds everything the runtime layer builds on:
//! - Plugin manifests, versions and resource limits
//! - The closed event enumeration and priority model
//! - Dependency-ordered load resolution
//! - Per-plugin persistent key-value storage
//! - Per-instance metrics
//! - The `GameBridge` traits through which plugins reach the game world
//!
//! The WASM runtime itself (instances, pools, the event dispatcher and the
//! plugin manager) lives in `wyvern-host`.

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod manifest;
pub mod resolver;
pub mod state;
pub mod storage;

pub use bridge::{BlockPos, GameBridge, ItemStack, Player, Position, World};
pub use config::HostConfig;
pub use error::{
    MissingDependency, PluginError, PluginResult, ResolveError, TrapKind, ValidationError,
    ValidationErrors,
};
pub use events::{EventResult, EventSubscription, EventType, Priority};
pub use manifest::{Dependency, Manifest, PluginId, ResourceLimits, Version};
pub use resolver::resolve_load_order;
pub use state::{Metrics, MetricsSnapshot, PluginState};
pub use storage::{FileStorage, MemoryStorage, Storage};
