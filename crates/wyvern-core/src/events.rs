//! Game event model
//!
//! The closed enumeration of events plugins can subscribe to, handler
//! priorities, and the result a guest returns from handling an event.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Game events routed to plugins.
///
/// The set is closed: a manifest naming anything else fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PlayerJoin,
    PlayerQuit,
    PlayerChat,
    PlayerMove,
    PlayerTeleport,
    PlayerJump,
    PlayerSprint,
    PlayerSneak,
    PlayerDeath,
    PlayerRespawn,
    PlayerHurt,
    PlayerHeal,
    PlayerAttackEntity,
    BlockBreak,
    BlockPlace,
    BlockInteract,
    ItemUse,
    ItemUseOnBlock,
    ItemUseOnEntity,
    ItemConsume,
    ItemDrop,
    ItemPickup,
    EntitySpawn,
    EntityDespawn,
    Command,
    SignEdit,
    ServerTransfer,
}

impl EventType {
    pub const ALL: [EventType; 27] = [
        EventType::PlayerJoin,
        EventType::PlayerQuit,
        EventType::PlayerChat,
        EventType::PlayerMove,
        EventType::PlayerTeleport,
        EventType::PlayerJump,
        EventType::PlayerSprint,
        EventType::PlayerSneak,
        EventType::PlayerDeath,
        EventType::PlayerRespawn,
        EventType::PlayerHurt,
        EventType::PlayerHeal,
        EventType::PlayerAttackEntity,
        EventType::BlockBreak,
        EventType::BlockPlace,
        EventType::BlockInteract,
        EventType::ItemUse,
        EventType::ItemUseOnBlock,
        EventType::ItemUseOnEntity,
        EventType::ItemConsume,
        EventType::ItemDrop,
        EventType::ItemPickup,
        EventType::EntitySpawn,
        EventType::EntityDespawn,
        EventType::Command,
        EventType::SignEdit,
        EventType::ServerTransfer,
    ];

    /// Wire name, as used in manifests and in the guest envelope.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PlayerJoin => "player_join",
            EventType::PlayerQuit => "player_quit",
            EventType::PlayerChat => "player_chat",
            EventType::PlayerMove => "player_move",
            EventType::PlayerTeleport => "player_teleport",
            EventType::PlayerJump => "player_jump",
            EventType::PlayerSprint => "player_sprint",
            EventType::PlayerSneak => "player_sneak",
            EventType::PlayerDeath => "player_death",
            EventType::PlayerRespawn => "player_respawn",
            EventType::PlayerHurt => "player_hurt",
            EventType::PlayerHeal => "player_heal",
            EventType::PlayerAttackEntity => "player_attack_entity",
            EventType::BlockBreak => "block_break",
            EventType::BlockPlace => "block_place",
            EventType::BlockInteract => "block_interact",
            EventType::ItemUse => "item_use",
            EventType::ItemUseOnBlock => "item_use_on_block",
            EventType::ItemUseOnEntity => "item_use_on_entity",
            EventType::ItemConsume => "item_consume",
            EventType::ItemDrop => "item_drop",
            EventType::ItemPickup => "item_pickup",
            EventType::EntitySpawn => "entity_spawn",
            EventType::EntityDespawn => "entity_despawn",
            EventType::Command => "command",
            EventType::SignEdit => "sign_edit",
            EventType::ServerTransfer => "server_transfer",
        }
    }

    /// Whether handlers may veto this event. Non-cancellable events ignore
    /// the cancelled flag a guest returns.
    pub fn is_cancellable(&self) -> bool {
        !matches!(
            self,
            EventType::PlayerQuit
                | EventType::PlayerJump
                | EventType::PlayerSprint
                | EventType::PlayerSneak
                | EventType::PlayerRespawn
                | EventType::EntitySpawn
                | EventType::EntityDespawn
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| UnknownEvent(s.to_string()))
    }
}

/// Error returned when parsing an event name that is not in the enumeration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type {0:?}")]
pub struct UnknownEvent(pub String);

/// Handler priority. Lower priorities run first; `MONITOR` handlers run
/// last and observe the final outcome without mutating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOWEST: Priority = Priority(-200);
    pub const LOW: Priority = Priority(-100);
    pub const NORMAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(100);
    pub const HIGHEST: Priority = Priority(200);
    pub const MONITOR: Priority = Priority(300);

    /// True for priorities in the monitor tier (observation only).
    pub fn is_monitor(&self) -> bool {
        *self >= Priority::MONITOR
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One event subscription declared in a manifest.
///
/// The event name is kept as written so that manifest validation can report
/// unknown names instead of failing mid-parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub event: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub ignore_cancelled: bool,
}

impl EventSubscription {
    pub fn new(event: EventType, priority: Priority) -> Self {
        Self {
            event: event.as_str().to_string(),
            priority,
            ignore_cancelled: false,
        }
    }

    /// The parsed event, or `None` when the name is not in the enumeration.
    pub fn event_type(&self) -> Option<EventType> {
        self.event.parse().ok()
    }
}

/// What a guest handler returned for one event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventResult {
    /// Whether the handler vetoed the event.
    pub cancelled: bool,
    /// Amendments to fields the host agreed are mutable (e.g. chat
    /// `message`). Unknown keys are ignored by the caller.
    pub modifications: HashMap<String, String>,
}

impl EventResult {
    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            modifications: HashMap::new(),
        }
    }

    /// Parse guest output: byte 0 is the cancelled flag, an optional tail is
    /// a JSON `{string: string}` object of modifications. A malformed tail
    /// yields empty modifications, never an error.
    pub fn from_guest_output(data: &[u8]) -> Self {
        let mut result = EventResult::default();
        let Some((&flag, tail)) = data.split_first() else {
            return result;
        };
        result.cancelled = flag == 1;
        if !tail.is_empty() {
            if let Ok(mods) = serde_json::from_slice::<HashMap<String, String>>(tail) {
                result.modifications = mods;
            }
        }
        result
    }
}
