//! Wyvern WASM plugin runtime
//!
//! Runs voxel-server plugins inside wasmtime sandboxes:
//! - Per-plugin memory caps, fuel budgets and call deadlines
//! - Serialized guest calls with timeout-safe abandonment
//! - Priority-ordered event dispatch with cancellation semantics
//! - A JSON host-call surface scoped to the owning plugin
//! - Lifecycle orchestration (discover → resolve → load → enable →
//!   disable → unload) that survives individual plugin failures
//!
//! The manager is the public entry point:
//!
//! ```no_run
//! use std::sync::Arc;
//! use wyvern_core::{EventType, HostConfig};
//! use wyvern_host::PluginManager;
//! # use wyvern_core::{GameBridge, Player, World};
//! # struct Server;
//! # impl GameBridge for Server {
//! #     fn player(&self, _: &str) -> Option<Arc<dyn Player>> { None }
//! #     fn players(&self) -> Vec<Arc<dyn Player>> { Vec::new() }
//! #     fn world(&self, _: &str) -> Option<Arc<dyn World>> { None }
//! #     fn default_world(&self) -> Arc<dyn World> { unimplemented!() }
//! #     fn broadcast(&self, _: &str) {}
//! # }
//!
//! # async fn boot() -> wyvern_core::PluginResult<()> {
//! let manager = PluginManager::new(HostConfig::default(), Arc::new(Server))?;
//! manager.load_all().await?;
//! manager.enable_all().await;
//!
//! let result = manager.dispatch(EventType::PlayerChat, br#"{"message":"hi"}"#).await;
//! if !result.cancelled {
//!     // deliver the chat message
//! }
//! # Ok(())
//! # }
//! ```

pub mod dispatcher;
pub mod engine;
pub mod hostcall;
pub mod instance;
pub mod manager;
pub mod pool;
pub mod scheduler;

pub use dispatcher::{
    DispatchResult, Dispatcher, EventStats, Handler, HandlerFuture, Subscription,
    SubscriptionToken,
};
pub use engine::PluginEngine;
pub use hostcall::{HostCallRegistry, HostContext};
pub use instance::{Instance, StoreCtx};
pub use manager::{LoadedPlugin, PluginManager};
pub use pool::{InstancePool, PooledInstance};
pub use scheduler::{TaskScheduler, TaskSink};
