//! Host-call surface
//!
//! The fixed set of functions guests may import from module `"env"`. Every
//! binding closes over the owning plugin's id, the game bridge, storage and
//! the task scheduler, so storage and scheduling are automatically scoped
//! to the calling plugin.
//!
//! Contract: requests are JSON documents in guest memory (`ptr`, `len`).
//! Calls with a JSON response write it through the guest's `alloc` export
//! and return `ptr << 32 | len`; `0` means "no response / failed silently".
//! Error responses are `{"error": "..."}`. Action calls return `1`/`0`.
//! Effects go through the bridge verbatim; nothing is retried.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use wasmtime::{Caller, Linker};

use wyvern_core::{
    BlockPos, GameBridge, ItemStack, PluginError, PluginId, PluginResult, Player, Position,
    Storage,
};

use crate::instance::StoreCtx;
use crate::scheduler::TaskScheduler;

/// Everything a host call can touch, bound per plugin at instance creation.
#[derive(Clone)]
pub struct HostContext {
    pub plugin_id: PluginId,
    pub bridge: Arc<dyn GameBridge>,
    pub storage: Arc<dyn Storage>,
    pub scheduler: TaskScheduler,
}

#[derive(Debug, Deserialize)]
struct LogRequest {
    #[serde(default)]
    level: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    player_uuid: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct PlayerRequest {
    player_uuid: String,
}

#[derive(Debug, Serialize)]
struct PlayerResponse {
    uuid: String,
    name: String,
    world_name: String,
    position: Position,
    game_mode: i32,
    health: f32,
}

#[derive(Debug, Serialize)]
struct PlayersResponse {
    players: Vec<PlayerResponse>,
}

#[derive(Debug, Deserialize)]
struct TeleportRequest {
    player_uuid: String,
    position: Position,
    #[serde(default)]
    world_name: String,
}

#[derive(Debug, Deserialize)]
struct KickRequest {
    player_uuid: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct SetHealthRequest {
    player_uuid: String,
    health: f32,
}

#[derive(Debug, Deserialize)]
struct SetGamemodeRequest {
    player_uuid: String,
    gamemode: i32,
}

#[derive(Debug, Deserialize)]
struct GiveItemRequest {
    uuid: String,
    item_type: String,
    count: i32,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct GetBlockRequest {
    world_name: String,
    position: BlockPos,
}

#[derive(Debug, Serialize)]
struct BlockResponse {
    block_type: String,
    position: BlockPos,
    properties: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SetBlockRequest {
    world_name: String,
    position: BlockPos,
    block_type: String,
    #[serde(default)]
    properties: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct StorageKeyRequest {
    key: String,
}

#[derive(Debug, Deserialize)]
struct StorageSetRequest {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct ScheduleTaskRequest {
    task_id: String,
    delay_ms: u64,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct CancelTaskRequest {
    task_id: String,
}

/// Binds the host-call surface into a linker for one plugin.
pub struct HostCallRegistry;

impl HostCallRegistry {
    /// Register every host function under module `"env"`, each closing over
    /// `context`.
    pub fn bind(linker: &mut Linker<StoreCtx>, context: HostContext) -> PluginResult<()> {
        let ctx = context.clone();
        wrap(linker, "host_log", move |mut caller: Caller<'_, StoreCtx>, ptr: u32, len: u32| {
            let Some(req) = parse_request::<LogRequest>(&mut caller, ptr, len) else {
                return;
            };
            match req.level.as_str() {
                "debug" => debug!(plugin = %ctx.plugin_id, "{}", req.message),
                "warn" => warn!(plugin = %ctx.plugin_id, "{}", req.message),
                "error" => error!(plugin = %ctx.plugin_id, "{}", req.message),
                _ => info!(plugin = %ctx.plugin_id, "{}", req.message),
            }
        })?;

        let ctx = context.clone();
        wrap(linker, "host_broadcast", move |mut caller: Caller<'_, StoreCtx>, ptr: u32, len: u32| -> u32 {
            let Some(req) = parse_request::<BroadcastRequest>(&mut caller, ptr, len) else {
                return 0;
            };
            ctx.bridge.broadcast(&req.message);
            1
        })?;

        let ctx = context.clone();
        wrap(linker, "host_send_message", move |mut caller: Caller<'_, StoreCtx>, ptr: u32, len: u32| -> u32 {
            let Some(req) = parse_request::<SendMessageRequest>(&mut caller, ptr, len) else {
                return 0;
            };
            match ctx.bridge.player(&req.player_uuid) {
                Some(player) => {
                    player.send_message(&req.message);
                    1
                }
                None => 0,
            }
        })?;

        let ctx = context.clone();
        wrap(linker, "host_get_player", move |mut caller: Caller<'_, StoreCtx>, ptr: u32, len: u32| -> u64 {
            let Some(req) = parse_request::<PlayerRequest>(&mut caller, ptr, len) else {
                return write_error(&mut caller, "failed to parse request");
            };
            match ctx.bridge.player(&req.player_uuid) {
                Some(player) => write_json(&mut caller, &player_response(player.as_ref())),
                None => write_error(&mut caller, "player not found"),
            }
        })?;

        let ctx = context.clone();
        linker
            .func_wrap("env", "host_get_online_players", {
                move |mut caller: Caller<'_, StoreCtx>| -> u64 {
                    let players = ctx
                        .bridge
                        .players()
                        .iter()
                        .map(|p| player_response(p.as_ref()))
                        .collect();
                    write_json(&mut caller, &PlayersResponse { players })
                }
            })
            .map_err(|e| PluginError::Internal(e.to_string()))?;

        let ctx = context.clone();
        wrap(linker, "host_teleport_player", move |mut caller: Caller<'_, StoreCtx>, ptr: u32, len: u32| -> u32 {
            let Some(req) = parse_request::<TeleportRequest>(&mut caller, ptr, len) else {
                return 0;
            };
            let Some(player) = ctx.bridge.player(&req.player_uuid) else {
                return 0;
            };
            match player.teleport(req.position, &req.world_name) {
                Ok(()) => 1,
                Err(e) => {
                    warn!(plugin = %ctx.plugin_id, op = "teleport", error = %e, "bridge call failed");
                    0
                }
            }
        })?;

        let ctx = context.clone();
        wrap(linker, "host_kick_player", move |mut caller: Caller<'_, StoreCtx>, ptr: u32, len: u32| -> u32 {
            let Some(req) = parse_request::<KickRequest>(&mut caller, ptr, len) else {
                return 0;
            };
            match ctx.bridge.player(&req.player_uuid) {
                Some(player) => {
                    player.kick(&req.reason);
                    1
                }
                None => 0,
            }
        })?;

        let ctx = context.clone();
        wrap(linker, "host_set_player_health", move |mut caller: Caller<'_, StoreCtx>, ptr: u32, len: u32| -> u32 {
            let Some(req) = parse_request::<SetHealthRequest>(&mut caller, ptr, len) else {
                return 0;
            };
            match ctx.bridge.player(&req.player_uuid) {
                Some(player) => {
                    player.set_health(req.health);
                    1
                }
                None => 0,
            }
        })?;

        let ctx = context.clone();
        wrap(linker, "host_set_player_gamemode", move |mut caller: Caller<'_, StoreCtx>, ptr: u32, len: u32| -> u32 {
            let Some(req) = parse_request::<SetGamemodeRequest>(&mut caller, ptr, len) else {
                return 0;
            };
            match ctx.bridge.player(&req.player_uuid) {
                Some(player) => {
                    player.set_game_mode(req.gamemode);
                    1
                }
                None => 0,
            }
        })?;

        let ctx = context.clone();
        wrap(linker, "host_give_item", move |mut caller: Caller<'_, StoreCtx>, ptr: u32, len: u32| -> u32 {
            let Some(req) = parse_request::<GiveItemRequest>(&mut caller, ptr, len) else {
                return 0;
            };
            let Some(player) = ctx.bridge.player(&req.uuid) else {
                return 0;
            };
            let item = ItemStack {
                item_type: req.item_type,
                count: req.count,
                metadata: req.metadata,
            };
            match player.give_item(&item) {
                Ok(()) => 1,
                Err(e) => {
                    warn!(plugin = %ctx.plugin_id, op = "give_item", error = %e, "bridge call failed");
                    0
                }
            }
        })?;

        let ctx = context.clone();
        wrap(linker, "host_get_block", move |mut caller: Caller<'_, StoreCtx>, ptr: u32, len: u32| -> u64 {
            let Some(req) = parse_request::<GetBlockRequest>(&mut caller, ptr, len) else {
                return write_error(&mut caller, "failed to parse request");
            };
            let world = ctx
                .bridge
                .world(&req.world_name)
                .unwrap_or_else(|| ctx.bridge.default_world());
            let (block_type, properties) = world.block(req.position);
            write_json(
                &mut caller,
                &BlockResponse {
                    block_type,
                    position: req.position,
                    properties,
                },
            )
        })?;

        let ctx = context.clone();
        wrap(linker, "host_set_block", move |mut caller: Caller<'_, StoreCtx>, ptr: u32, len: u32| -> u32 {
            let Some(req) = parse_request::<SetBlockRequest>(&mut caller, ptr, len) else {
                return 0;
            };
            let world = ctx
                .bridge
                .world(&req.world_name)
                .unwrap_or_else(|| ctx.bridge.default_world());
            match world.set_block(req.position, &req.block_type, &req.properties) {
                Ok(()) => 1,
                Err(e) => {
                    warn!(plugin = %ctx.plugin_id, op = "set_block", error = %e, "bridge call failed");
                    0
                }
            }
        })?;

        let ctx = context.clone();
        wrap(linker, "host_storage_get", move |mut caller: Caller<'_, StoreCtx>, ptr: u32, len: u32| -> u64 {
            let Some(req) = parse_request::<StorageKeyRequest>(&mut caller, ptr, len) else {
                return 0;
            };
            match ctx.storage.get(&ctx.plugin_id, &req.key) {
                Ok(Some(value)) => write_guest(&mut caller, &value),
                Ok(None) => 0,
                Err(e) => {
                    warn!(plugin = %ctx.plugin_id, op = "storage_get", error = %e, "storage failed");
                    0
                }
            }
        })?;

        let ctx = context.clone();
        wrap(linker, "host_storage_set", move |mut caller: Caller<'_, StoreCtx>, ptr: u32, len: u32| -> u32 {
            let Some(req) = parse_request::<StorageSetRequest>(&mut caller, ptr, len) else {
                return 0;
            };
            match ctx
                .storage
                .set(&ctx.plugin_id, &req.key, req.value.into_bytes())
            {
                Ok(()) => 1,
                Err(e) => {
                    warn!(plugin = %ctx.plugin_id, op = "storage_set", error = %e, "storage failed");
                    0
                }
            }
        })?;

        let ctx = context.clone();
        wrap(linker, "host_storage_delete", move |mut caller: Caller<'_, StoreCtx>, ptr: u32, len: u32| -> u32 {
            let Some(req) = parse_request::<StorageKeyRequest>(&mut caller, ptr, len) else {
                return 0;
            };
            match ctx.storage.delete(&ctx.plugin_id, &req.key) {
                Ok(()) => 1,
                Err(e) => {
                    warn!(plugin = %ctx.plugin_id, op = "storage_delete", error = %e, "storage failed");
                    0
                }
            }
        })?;

        let ctx = context.clone();
        wrap(linker, "host_schedule_task", move |mut caller: Caller<'_, StoreCtx>, ptr: u32, len: u32| -> u32 {
            let Some(req) = parse_request::<ScheduleTaskRequest>(&mut caller, ptr, len) else {
                return 0;
            };
            let scheduled = ctx.scheduler.schedule(
                ctx.plugin_id.clone(),
                req.task_id,
                std::time::Duration::from_millis(req.delay_ms),
                req.data.into_bytes(),
            );
            scheduled as u32
        })?;

        let ctx = context;
        wrap(linker, "host_cancel_task", move |mut caller: Caller<'_, StoreCtx>, ptr: u32, len: u32| -> u32 {
            let Some(req) = parse_request::<CancelTaskRequest>(&mut caller, ptr, len) else {
                return 0;
            };
            ctx.scheduler.cancel(&ctx.plugin_id, &req.task_id) as u32
        })?;

        Ok(())
    }
}

/// Register one `(ptr, len)`-shaped host function under `"env"`.
fn wrap<R>(
    linker: &mut Linker<StoreCtx>,
    name: &str,
    func: impl Fn(Caller<'_, StoreCtx>, u32, u32) -> R + Send + Sync + 'static,
) -> PluginResult<()>
where
    R: wasmtime::WasmRet,
{
    linker
        .func_wrap("env", name, func)
        .map(|_| ())
        .map_err(|e| PluginError::Internal(e.to_string()))
}

fn pack(ptr: u32, len: u32) -> u64 {
    (u64::from(ptr) << 32) | u64::from(len)
}

fn read_guest(caller: &mut Caller<'_, StoreCtx>, ptr: u32, len: u32) -> Option<Vec<u8>> {
    let memory = caller.get_export("memory")?.into_memory()?;
    let data = memory.data(&mut *caller);
    let start = ptr as usize;
    let end = start.checked_add(len as usize)?;
    data.get(start..end).map(<[u8]>::to_vec)
}

fn parse_request<T: DeserializeOwned>(
    caller: &mut Caller<'_, StoreCtx>,
    ptr: u32,
    len: u32,
) -> Option<T> {
    let bytes = read_guest(caller, ptr, len)?;
    serde_json::from_slice(&bytes).ok()
}

/// Write `bytes` into guest memory via the guest's `alloc` export and return
/// the packed slice, or `0` when the guest cannot receive it.
fn write_guest(caller: &mut Caller<'_, StoreCtx>, bytes: &[u8]) -> u64 {
    let Ok(len) = u32::try_from(bytes.len()) else {
        return 0;
    };
    if len == 0 {
        return 0;
    }
    let Some(memory) = caller.get_export("memory").and_then(|e| e.into_memory()) else {
        return 0;
    };
    let Some(alloc) = caller.get_export("alloc").and_then(|e| e.into_func()) else {
        return 0;
    };
    let Ok(alloc) = alloc.typed::<u32, u32>(&*caller) else {
        return 0;
    };
    let Ok(ptr) = alloc.call(&mut *caller, len) else {
        return 0;
    };
    if ptr == 0 {
        return 0;
    }
    if memory.write(&mut *caller, ptr as usize, bytes).is_err() {
        return 0;
    }
    pack(ptr, len)
}

fn write_json<T: Serialize>(caller: &mut Caller<'_, StoreCtx>, value: &T) -> u64 {
    match serde_json::to_vec(value) {
        Ok(bytes) => write_guest(caller, &bytes),
        Err(_) => 0,
    }
}

fn write_error(caller: &mut Caller<'_, StoreCtx>, message: &str) -> u64 {
    write_json(caller, &serde_json::json!({ "error": message }))
}

fn player_response(player: &dyn Player) -> PlayerResponse {
    PlayerResponse {
        uuid: player.uuid(),
        name: player.name(),
        world_name: player.world_name(),
        position: player.position(),
        game_mode: player.game_mode(),
        health: player.health(),
    }
}
