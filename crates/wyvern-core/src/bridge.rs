//! Game server bridge
//!
//! The narrow interface through which plugins reach the game world. The
//! server implements these traits; the host never talks to the game any
//! other way. Implementations must be thread-safe: host calls run on
//! whichever thread is currently executing the guest.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::PluginResult;

/// A position in a world.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// An integer block coordinate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

/// An item stack handed to a player.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemStack {
    pub item_type: String,
    pub count: i32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// An online player.
pub trait Player: Send + Sync {
    fn uuid(&self) -> String;
    fn name(&self) -> String;
    fn position(&self) -> Position;
    fn world_name(&self) -> String;
    fn health(&self) -> f32;
    fn game_mode(&self) -> i32;

    fn send_message(&self, message: &str);
    fn teleport(&self, position: Position, world: &str) -> PluginResult<()>;
    fn kick(&self, reason: &str);
    fn set_health(&self, health: f32);
    fn set_game_mode(&self, mode: i32);
    fn give_item(&self, item: &ItemStack) -> PluginResult<()>;
}

/// A loaded world.
pub trait World: Send + Sync {
    fn name(&self) -> String;
    /// Block type and properties at `pos`.
    fn block(&self, pos: BlockPos) -> (String, HashMap<String, String>);
    fn set_block(
        &self,
        pos: BlockPos,
        block_type: &str,
        properties: &HashMap<String, String>,
    ) -> PluginResult<()>;
}

/// Entry point into the game server.
pub trait GameBridge: Send + Sync {
    fn player(&self, uuid: &str) -> Option<Arc<dyn Player>>;
    fn players(&self) -> Vec<Arc<dyn Player>>;
    fn world(&self, name: &str) -> Option<Arc<dyn World>>;
    fn default_world(&self) -> Arc<dyn World>;
    fn broadcast(&self, message: &str);
}
