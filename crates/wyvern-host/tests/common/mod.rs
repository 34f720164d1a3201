//! Shared fixtures: WAT guest modules, a mock game bridge, and plugin
//! directory builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use wasmtime::Linker;

use wyvern_core::{
    BlockPos, EventSubscription, EventType, GameBridge, ItemStack, Manifest, Player, PluginResult,
    Position, Priority, ResourceLimits, World,
};
use wyvern_host::{Instance, PluginEngine, StoreCtx};

/// A guest that accepts every event and returns no output.
pub const GUEST_OK: &str = r#"
(module
  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const 8192))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $len
    i32.add
    global.set $heap
    local.get $ptr)
  (func (export "plugin_init"))
  (func (export "handle_event") (param i32 i32) (result i64)
    i64.const 0))
"#;

/// A guest that cancels every event when the envelope starts with "play"
/// (i.e. a player_* event name), proving the envelope reached it intact.
/// Returns ptr 1024, len 1 packed: 1024<<32|1 = 4398046511105.
pub const GUEST_CANCEL: &str = r#"
(module
  (memory (export "memory") 2)
  (data (i32.const 1024) "\01")
  (global $heap (mut i32) (i32.const 8192))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $len
    i32.add
    global.set $heap
    local.get $ptr)
  (func (export "plugin_init"))
  (func (export "handle_event") (param $ptr i32) (param $len i32) (result i64)
    (if (result i64)
        (i32.eq (i32.load (local.get $ptr)) (i32.const 0x79616c70))
        (then (i64.const 4398046511105))
        (else (i64.const 0)))))
"#;

/// A guest answering `<0x00>{"message":"hello"}` (20 bytes at 1024).
pub const GUEST_MODIFY_HELLO: &str = r#"
(module
  (memory (export "memory") 2)
  (data (i32.const 1024) "\00{\22message\22:\22hello\22}")
  (global $heap (mut i32) (i32.const 8192))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $len
    i32.add
    global.set $heap
    local.get $ptr)
  (func (export "plugin_init"))
  (func (export "handle_event") (param i32 i32) (result i64)
    i64.const 4398046511124))
"#;

/// A guest answering `<0x00>{"message":"world"}`.
pub const GUEST_MODIFY_WORLD: &str = r#"
(module
  (memory (export "memory") 2)
  (data (i32.const 1024) "\00{\22message\22:\22world\22}")
  (global $heap (mut i32) (i32.const 8192))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $len
    i32.add
    global.set $heap
    local.get $ptr)
  (func (export "plugin_init"))
  (func (export "handle_event") (param i32 i32) (result i64)
    i64.const 4398046511124))
"#;

/// A guest that echoes its input back: output slice == input slice.
pub const GUEST_ECHO: &str = r#"
(module
  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const 8192))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $len
    i32.add
    global.set $heap
    local.get $ptr)
  (func (export "plugin_init"))
  (func (export "handle_event") (param $ptr i32) (param $len i32) (result i64)
    (i64.or
      (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
      (i64.extend_i32_u (local.get $len)))))
"#;

/// A guest whose handle_event spins forever; `ping` still works.
pub const GUEST_LOOP: &str = r#"
(module
  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const 8192))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $len
    i32.add
    global.set $heap
    local.get $ptr)
  (func (export "plugin_init"))
  (func (export "handle_event") (param i32 i32) (result i64)
    (loop $spin (br $spin))
    i64.const 0)
  (func (export "ping") (param i32 i32) (result i64)
    i64.const 0))
"#;

/// A guest that traps with `unreachable` on every event.
pub const GUEST_TRAP: &str = r#"
(module
  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const 8192))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $len
    i32.add
    global.set $heap
    local.get $ptr)
  (func (export "plugin_init"))
  (func (export "handle_event") (param i32 i32) (result i64)
    unreachable))
"#;

/// A guest whose plugin_init traps.
pub const GUEST_BAD_INIT: &str = r#"
(module
  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const 8192))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $len
    i32.add
    global.set $heap
    local.get $ptr)
  (func (export "plugin_init")
    unreachable)
  (func (export "handle_event") (param i32 i32) (result i64)
    i64.const 0))
"#;

/// A guest missing the required handle_event export.
pub const GUEST_NO_HANDLER: &str = r#"
(module
  (memory (export "memory") 2)
  (func (export "alloc") (param i32) (result i32)
    i32.const 8192)
  (func (export "plugin_init")))
"#;

/// A guest whose on_enable traps; enabling it must fail into Error state.
pub const GUEST_BAD_ENABLE: &str = r#"
(module
  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const 8192))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $len
    i32.add
    global.set $heap
    local.get $ptr)
  (func (export "plugin_init"))
  (func (export "on_enable")
    unreachable)
  (func (export "handle_event") (param i32 i32) (result i64)
    i64.const 0))
"#;

/// A guest exercising host calls: every event broadcasts `{"message":"hi"}`
/// (16 bytes at 1024) and stores `{"key":"k","value":"v1"}` (24 bytes at
/// 1100); `query` returns the host_get_online_players response verbatim.
pub const GUEST_BRIDGE: &str = r#"
(module
  (import "env" "host_broadcast" (func $broadcast (param i32 i32) (result i32)))
  (import "env" "host_storage_set" (func $storage_set (param i32 i32) (result i32)))
  (import "env" "host_get_online_players" (func $players (result i64)))
  (memory (export "memory") 4)
  (data (i32.const 1024) "{\22message\22:\22hi\22}")
  (data (i32.const 1100) "{\22key\22:\22k\22,\22value\22:\22v1\22}")
  (global $heap (mut i32) (i32.const 8192))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $len
    i32.add
    global.set $heap
    local.get $ptr)
  (func (export "plugin_init"))
  (func (export "handle_event") (param i32 i32) (result i64)
    (drop (call $broadcast (i32.const 1024) (i32.const 16)))
    (drop (call $storage_set (i32.const 1100) (i32.const 24)))
    i64.const 0)
  (func (export "query") (param i32 i32) (result i64)
    call $players))
"#;

/// Limits generous enough that only the wall-clock deadline can fire.
pub fn lenient_limits(max_execution_ms: u64) -> ResourceLimits {
    ResourceLimits {
        max_memory_mb: 64,
        max_execution_ms,
        max_fuel: 1_000_000_000_000,
    }
}

pub fn manifest_for(id: &str, events: &[(EventType, Priority, bool)]) -> Manifest {
    Manifest {
        id: id.to_string(),
        name: id.to_string(),
        entry_point: "plugin.wasm".to_string(),
        events: events
            .iter()
            .map(|(event, priority, ignore_cancelled)| EventSubscription {
                event: event.as_str().to_string(),
                priority: *priority,
                ignore_cancelled: *ignore_cancelled,
            })
            .collect(),
        ..Default::default()
    }
}

/// Engine with a running epoch ticker; keep the token alive for the test.
pub fn engine_with_ticker(tick_ms: u64) -> (PluginEngine, CancellationToken) {
    let engine = PluginEngine::new(tick_ms).unwrap();
    let token = CancellationToken::new();
    engine.start_epoch_ticker(token.clone());
    (engine, token)
}

/// Build an instance over `wat` with no host imports.
pub fn instance_from_wat(
    engine: &PluginEngine,
    wat: &str,
    manifest: Manifest,
    limits: ResourceLimits,
) -> PluginResult<Instance> {
    let module = engine.compile(&manifest.id, wat.as_bytes())?;
    let linker: Linker<StoreCtx> = Linker::new(engine.engine());
    Instance::new(engine, &module, &linker, Arc::new(manifest), limits)
}

/// Write a plugin directory (`plugin.toml` + WAT entry point) under `root`.
pub fn write_plugin(root: &Path, id: &str, wat: &str, extra_toml: &str) {
    let dir = root.join(id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("plugin.wasm"), wat).unwrap();
    fs::write(
        dir.join("plugin.toml"),
        format!("id = \"{id}\"\nname = \"{id}\"\nentry_point = \"plugin.wasm\"\n{extra_toml}"),
    )
    .unwrap();
}

pub struct MockPlayer {
    pub uuid: String,
    pub name: String,
    pub messages: Mutex<Vec<String>>,
}

impl MockPlayer {
    pub fn new(uuid: &str, name: &str) -> Arc<Self> {
        Arc::new(Self {
            uuid: uuid.to_string(),
            name: name.to_string(),
            messages: Mutex::new(Vec::new()),
        })
    }
}

impl Player for MockPlayer {
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn position(&self) -> Position {
        Position { x: 0.0, y: 64.0, z: 0.0 }
    }

    fn world_name(&self) -> String {
        "overworld".to_string()
    }

    fn health(&self) -> f32 {
        20.0
    }

    fn game_mode(&self) -> i32 {
        0
    }

    fn send_message(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }

    fn teleport(&self, _position: Position, _world: &str) -> PluginResult<()> {
        Ok(())
    }

    fn kick(&self, _reason: &str) {}

    fn set_health(&self, _health: f32) {}

    fn set_game_mode(&self, _mode: i32) {}

    fn give_item(&self, _item: &ItemStack) -> PluginResult<()> {
        Ok(())
    }
}

pub struct MockWorld {
    pub name: String,
}

impl World for MockWorld {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn block(&self, _pos: BlockPos) -> (String, HashMap<String, String>) {
        ("stone".to_string(), HashMap::new())
    }

    fn set_block(
        &self,
        _pos: BlockPos,
        _block_type: &str,
        _properties: &HashMap<String, String>,
    ) -> PluginResult<()> {
        Ok(())
    }
}

pub struct MockBridge {
    pub broadcasts: Mutex<Vec<String>>,
    pub players: Vec<Arc<MockPlayer>>,
    pub world: Arc<MockWorld>,
}

impl MockBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            broadcasts: Mutex::new(Vec::new()),
            players: vec![MockPlayer::new("u-1", "steve")],
            world: Arc::new(MockWorld {
                name: "overworld".to_string(),
            }),
        })
    }
}

impl GameBridge for MockBridge {
    fn player(&self, uuid: &str) -> Option<Arc<dyn Player>> {
        self.players
            .iter()
            .find(|p| p.uuid == uuid)
            .map(|p| Arc::clone(p) as Arc<dyn Player>)
    }

    fn players(&self) -> Vec<Arc<dyn Player>> {
        self.players
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn Player>)
            .collect()
    }

    fn world(&self, name: &str) -> Option<Arc<dyn World>> {
        (self.world.name == name).then(|| Arc::clone(&self.world) as Arc<dyn World>)
    }

    fn default_world(&self) -> Arc<dyn World> {
        Arc::clone(&self.world) as Arc<dyn World>
    }

    fn broadcast(&self, message: &str) {
        self.broadcasts.lock().push(message.to_string());
    }
}

/// A guest that schedules task `t1` (10 ms) on every event; when the task
/// fires, `on_task` records `fired=yes` in storage.
pub const GUEST_TASK: &str = r#"
(module
  (import "env" "host_schedule_task" (func $sched (param i32 i32) (result i32)))
  (import "env" "host_storage_set" (func $sset (param i32 i32) (result i32)))
  (memory (export "memory") 4)
  (data (i32.const 1024) "{\22task_id\22:\22t1\22,\22delay_ms\22:10,\22data\22:\22x\22}")
  (data (i32.const 1100) "{\22key\22:\22fired\22,\22value\22:\22yes\22}")
  (global $heap (mut i32) (i32.const 8192))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $len
    i32.add
    global.set $heap
    local.get $ptr)
  (func (export "plugin_init"))
  (func (export "handle_event") (param i32 i32) (result i64)
    (drop (call $sched (i32.const 1024) (i32.const 41)))
    i64.const 0)
  (func (export "on_task") (param i32 i32) (result i64)
    (drop (call $sset (i32.const 1100) (i32.const 29)))
    i64.const 0))
"#;
