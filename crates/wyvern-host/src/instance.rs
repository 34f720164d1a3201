//! Plugin instance
//!
//! One compiled module living in its own store, with its own linear memory,
//! fuel budget and lifecycle state. Guest calls are serialized: the store
//! sits behind a mutex taken on a blocking thread, so at most one call is
//! ever in flight per instance and a non-reentrant module is safe.
//!
//! Deadlines are enforced twice. The host abandons the call at the deadline
//! and returns a timeout; the store's epoch deadline then traps the runaway
//! guest within a tick, releasing the instance for the next call.
//!
//! ## Guest ABI
//!
//! Required exports: `memory`, `alloc(len: u32) -> u32`, `plugin_init()`,
//! `handle_event(ptr: u32, len: u32) -> u64`. Optional: `on_enable()`,
//! `on_disable()`, `on_task(ptr, len) -> u64`. Byte-slice returns are
//! packed `ptr << 32 | len`; `0` means "no output".

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};
use wasmtime::{Linker, Memory, Module, Store, Trap, TypedFunc};

use wyvern_core::{
    EventResult, EventType, Manifest, Metrics, MetricsSnapshot, PluginError, PluginId,
    PluginResult, PluginState, ResourceLimits, TrapKind,
};

use crate::engine::PluginEngine;

/// Store data for one instance. Host-call closures carry their own context;
/// the store only needs the resource limiter and the owning id for logs.
pub struct StoreCtx {
    pub plugin_id: PluginId,
    limits: StoreLimits,
}

/// Caps enforced by wasmtime when the guest grows memory or tables.
struct StoreLimits {
    max_memory_bytes: usize,
    max_table_elements: usize,
}

impl wasmtime::ResourceLimiter for StoreLimits {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        let cap = maximum.map_or(self.max_memory_bytes, |m| m.min(self.max_memory_bytes));
        Ok(desired <= cap)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        let cap = maximum.map_or(self.max_table_elements, |m| m.min(self.max_table_elements));
        Ok(desired <= cap)
    }
}

struct InstanceInner {
    store: Store<StoreCtx>,
    instance: wasmtime::Instance,
    memory: Memory,
    alloc: TypedFunc<u32, u32>,
    plugin_init: TypedFunc<(), ()>,
    handle_event: TypedFunc<(u32, u32), u64>,
    on_enable: Option<TypedFunc<(), ()>>,
    on_disable: Option<TypedFunc<(), ()>>,
    on_task: Option<TypedFunc<(u32, u32), u64>>,
}

/// A single loaded plugin module plus its live state and metrics.
pub struct Instance {
    id: PluginId,
    manifest: Arc<Manifest>,
    limits: ResourceLimits,
    epoch_tick_ms: u64,
    state: RwLock<PluginState>,
    metrics: Arc<Metrics>,
    inner: Arc<Mutex<Option<InstanceInner>>>,
    last_call: Mutex<Option<Instant>>,
    call_count: AtomicU64,
    error_count: AtomicU64,
    fuel_consumed: AtomicU64,
    has_on_enable: bool,
    has_on_disable: bool,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Instance {
    /// Instantiate `module` with `linker`'s host functions and the given
    /// effective limits. Verifies the required exports and runs the module
    /// start function under the init deadline. The new instance is `Loaded`.
    pub fn new(
        engine: &PluginEngine,
        module: &Module,
        linker: &Linker<StoreCtx>,
        manifest: Arc<Manifest>,
        limits: ResourceLimits,
    ) -> PluginResult<Self> {
        for name in ["plugin_init", "handle_event", "alloc", "memory"] {
            if module.get_export(name).is_none() {
                return Err(PluginError::MissingExport {
                    name: name.to_string(),
                });
            }
        }

        let id = manifest.plugin_id();
        let epoch_tick_ms = engine.epoch_tick().as_millis() as u64;

        let mut store = Store::new(
            engine.engine(),
            StoreCtx {
                plugin_id: id.clone(),
                limits: StoreLimits {
                    max_memory_bytes: limits.max_memory_bytes() as usize,
                    max_table_elements: 10_000,
                },
            },
        );
        store.limiter(|ctx| &mut ctx.limits);
        store
            .set_fuel(limits.max_fuel)
            .map_err(|e| PluginError::Internal(e.to_string()))?;
        store.set_epoch_deadline(engine.epoch_ticks_for(init_deadline(&limits)));

        let instance = linker.instantiate(&mut store, module).map_err(|e| {
            if e.downcast_ref::<Trap>().is_some() {
                map_guest_error(e, limits.max_execution_ms)
            } else {
                PluginError::ModuleCompile {
                    reason: e.to_string(),
                }
            }
        })?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| PluginError::MissingExport {
                name: "memory".to_string(),
            })?;
        let alloc = typed_export(&instance, &mut store, "alloc")?;
        let plugin_init = typed_export(&instance, &mut store, "plugin_init")?;
        let handle_event = typed_export(&instance, &mut store, "handle_event")?;
        let on_enable = optional_export(&instance, &mut store, module, "on_enable")?;
        let on_disable = optional_export(&instance, &mut store, module, "on_disable")?;
        let on_task = optional_export(&instance, &mut store, module, "on_task")?;

        let has_on_enable = on_enable.is_some();
        let has_on_disable = on_disable.is_some();

        Ok(Self {
            id,
            manifest,
            limits,
            epoch_tick_ms,
            state: RwLock::new(PluginState::Loaded),
            metrics: Arc::new(Metrics::new()),
            inner: Arc::new(Mutex::new(Some(InstanceInner {
                store,
                instance,
                memory,
                alloc,
                plugin_init,
                handle_event,
                on_enable,
                on_disable,
                on_task,
            }))),
            last_call: Mutex::new(None),
            call_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            fuel_consumed: AtomicU64::new(0),
            has_on_enable,
            has_on_disable,
        })
    }

    pub fn id(&self) -> &PluginId {
        &self.id
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    pub fn state(&self) -> PluginState {
        *self.state.read()
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == PluginState::Enabled
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn fuel_consumed(&self) -> u64 {
        self.fuel_consumed.load(Ordering::Relaxed)
    }

    pub fn last_call(&self) -> Option<Instant> {
        *self.last_call.lock()
    }

    /// Call an exported guest function with `input`, bounded by `deadline`.
    ///
    /// Fails with `NotEnabled` unless the instance is `Loaded` or `Enabled`.
    pub async fn call(
        &self,
        function: &str,
        input: &[u8],
        deadline: Duration,
    ) -> PluginResult<Vec<u8>> {
        if !self.state().is_callable() {
            return Err(PluginError::NotEnabled(self.id.clone()));
        }
        self.invoke(function, input, deadline).await
    }

    /// Run `plugin_init` under the init deadline (10x the call budget).
    pub async fn initialize(&self) -> PluginResult<()> {
        self.call("plugin_init", &[], init_deadline(&self.limits))
            .await
            .map(|_| ())
    }

    /// Deliver an event to the guest, or `None` when it is not subscribed.
    ///
    /// The guest receives the envelope `<event_name>\0<payload>` through its
    /// `handle_event` export and answers with a cancelled byte plus optional
    /// modifications (see [`EventResult::from_guest_output`]).
    pub async fn handle_event(
        &self,
        event: EventType,
        payload: &[u8],
        deadline: Duration,
    ) -> PluginResult<Option<EventResult>> {
        if !self.manifest.subscribed_to(event) {
            return Ok(None);
        }

        let name = event.as_str().as_bytes();
        let mut envelope = Vec::with_capacity(name.len() + 1 + payload.len());
        envelope.extend_from_slice(name);
        envelope.push(0);
        envelope.extend_from_slice(payload);

        let output = self.call("handle_event", &envelope, deadline).await?;
        let result = EventResult::from_guest_output(&output);
        self.metrics.record_event(event, result.cancelled);
        Ok(Some(result))
    }

    /// Enable the plugin. Valid from `Loaded` or `Disabled`; a failing
    /// `on_enable` leaves the plugin in `Error` until it is unloaded.
    pub async fn enable(&self) -> PluginResult<()> {
        {
            let mut state = self.state.write();
            match *state {
                PluginState::Enabled => return Ok(()),
                PluginState::Loaded | PluginState::Disabled => *state = PluginState::Enabling,
                other => {
                    return Err(PluginError::InvalidState {
                        id: self.id.clone(),
                        op: "enable",
                        state: other,
                    });
                }
            }
        }

        if self.has_on_enable {
            if let Err(e) = self.invoke("on_enable", &[], init_deadline(&self.limits)).await {
                *self.state.write() = PluginState::Error;
                return Err(e);
            }
        }

        *self.state.write() = PluginState::Enabled;
        info!(plugin = %self.id, "plugin enabled");
        Ok(())
    }

    /// Disable the plugin. `on_disable` is best-effort: a failure is logged,
    /// never propagated.
    pub async fn disable(&self) -> PluginResult<()> {
        {
            let mut state = self.state.write();
            match *state {
                PluginState::Disabled => return Ok(()),
                PluginState::Enabled => *state = PluginState::Disabling,
                other => {
                    return Err(PluginError::InvalidState {
                        id: self.id.clone(),
                        op: "disable",
                        state: other,
                    });
                }
            }
        }

        self.run_on_disable().await;
        *self.state.write() = PluginState::Disabled;
        info!(plugin = %self.id, "plugin disabled");
        Ok(())
    }

    /// Tear the instance down. Runs best-effort `on_disable` when enabled,
    /// then destroys the engine instance. Valid from any state.
    pub async fn unload(&self) {
        let was_enabled = {
            let mut state = self.state.write();
            let enabled = *state == PluginState::Enabled;
            if enabled {
                *state = PluginState::Disabling;
            }
            enabled
        };
        if was_enabled {
            self.run_on_disable().await;
        }

        let inner = Arc::clone(&self.inner);
        let _ = tokio::task::spawn_blocking(move || {
            *inner.lock() = None;
        })
        .await;

        *self.state.write() = PluginState::Unloaded;
        info!(plugin = %self.id, "plugin unloaded");
    }

    async fn run_on_disable(&self) {
        if !self.has_on_disable {
            return;
        }
        let deadline = Duration::from_millis(self.limits.max_execution_ms);
        if let Err(e) = self.invoke("on_disable", &[], deadline).await {
            warn!(plugin = %self.id, error = %e, "on_disable failed");
        }
    }

    /// Run a guest function without a state check. Lifecycle hooks go
    /// through here while the instance is `Enabling`/`Disabling`.
    async fn invoke(
        &self,
        function: &str,
        input: &[u8],
        deadline: Duration,
    ) -> PluginResult<Vec<u8>> {
        *self.last_call.lock() = Some(Instant::now());
        self.call_count.fetch_add(1, Ordering::Relaxed);

        let limit_ms = deadline.as_millis() as u64;
        let ticks = (limit_ms).div_ceil(self.epoch_tick_ms) + 1;
        let fuel = self.limits.max_fuel;
        let inner = Arc::clone(&self.inner);
        let id = self.id.clone();
        let function = function.to_string();
        let input = input.to_vec();

        let start = Instant::now();
        let join = tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock();
            let Some(inner) = guard.as_mut() else {
                return Err(PluginError::NotEnabled(id));
            };
            inner.run(&function, &input, fuel, ticks, limit_ms)
        });

        let outcome = match tokio::time::timeout(deadline, join).await {
            // The blocking call keeps running until the epoch deadline traps
            // it; its result is discarded and the instance stays usable.
            Err(_) => Err(PluginError::Timeout { limit_ms }),
            Ok(Err(join_err)) => Err(PluginError::Internal(join_err.to_string())),
            Ok(Ok(result)) => result,
        };

        match outcome {
            Ok((output, fuel_used, memory_bytes)) => {
                self.fuel_consumed.fetch_add(fuel_used, Ordering::Relaxed);
                self.metrics.record_call(start.elapsed());
                self.metrics.record_memory(memory_bytes);
                Ok(output)
            }
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_error(&e);
                Err(e)
            }
        }
    }
}

impl InstanceInner {
    /// Execute one guest call on the current (blocking) thread.
    fn run(
        &mut self,
        function: &str,
        input: &[u8],
        fuel: u64,
        ticks: u64,
        limit_ms: u64,
    ) -> PluginResult<(Vec<u8>, u64, u64)> {
        self.store
            .set_fuel(fuel)
            .map_err(|e| PluginError::Internal(e.to_string()))?;
        self.store.set_epoch_deadline(ticks);

        let output = match function {
            "plugin_init" => {
                let func = self.plugin_init.clone();
                self.call_unit(func, limit_ms)?
            }
            "on_enable" => {
                let func = self.require(&self.on_enable, "on_enable")?;
                self.call_unit(func, limit_ms)?
            }
            "on_disable" => {
                let func = self.require(&self.on_disable, "on_disable")?;
                self.call_unit(func, limit_ms)?
            }
            "handle_event" => {
                let func = self.handle_event.clone();
                self.call_bytes(func, input, limit_ms)?
            }
            "on_task" => {
                let func = self.require(&self.on_task, "on_task")?;
                self.call_bytes(func, input, limit_ms)?
            }
            name => {
                let func = self
                    .instance
                    .get_typed_func::<(u32, u32), u64>(&mut self.store, name)
                    .map_err(|_| PluginError::MissingExport {
                        name: name.to_string(),
                    })?;
                self.call_bytes(func, input, limit_ms)?
            }
        };

        let fuel_left = self.store.get_fuel().unwrap_or(0);
        let memory_bytes = self.memory.data_size(&self.store) as u64;
        Ok((output, fuel.saturating_sub(fuel_left), memory_bytes))
    }

    fn require<T: Clone>(&self, func: &Option<T>, name: &str) -> PluginResult<T> {
        func.clone().ok_or_else(|| PluginError::MissingExport {
            name: name.to_string(),
        })
    }

    fn call_unit(&mut self, func: TypedFunc<(), ()>, limit_ms: u64) -> PluginResult<Vec<u8>> {
        func.call(&mut self.store, ())
            .map_err(|e| map_guest_error(e, limit_ms))?;
        Ok(Vec::new())
    }

    fn call_bytes(
        &mut self,
        func: TypedFunc<(u32, u32), u64>,
        input: &[u8],
        limit_ms: u64,
    ) -> PluginResult<Vec<u8>> {
        let (ptr, len) = self.write_input(input, limit_ms)?;
        let packed = func
            .call(&mut self.store, (ptr, len))
            .map_err(|e| map_guest_error(e, limit_ms))?;
        self.read_output(packed)
    }

    fn write_input(&mut self, input: &[u8], limit_ms: u64) -> PluginResult<(u32, u32)> {
        if input.is_empty() {
            return Ok((0, 0));
        }
        let len = u32::try_from(input.len())
            .map_err(|_| PluginError::Internal("guest input exceeds 4 GiB".to_string()))?;
        let ptr = self
            .alloc
            .call(&mut self.store, len)
            .map_err(|e| map_guest_error(e, limit_ms))?;
        if ptr == 0 {
            return Err(PluginError::Trap {
                kind: TrapKind::OutOfMemory,
                message: "guest allocator returned null".to_string(),
            });
        }
        self.memory
            .write(&mut self.store, ptr as usize, input)
            .map_err(|e| PluginError::Trap {
                kind: TrapKind::MemoryBounds,
                message: e.to_string(),
            })?;
        Ok((ptr, len))
    }

    fn read_output(&self, packed: u64) -> PluginResult<Vec<u8>> {
        if packed == 0 {
            return Ok(Vec::new());
        }
        let ptr = (packed >> 32) as usize;
        let len = (packed & 0xffff_ffff) as usize;
        if len == 0 {
            return Ok(Vec::new());
        }
        let data = self.memory.data(&self.store);
        let end = ptr
            .checked_add(len)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| PluginError::Trap {
                kind: TrapKind::MemoryBounds,
                message: "guest returned out-of-bounds slice".to_string(),
            })?;
        Ok(data[ptr..end].to_vec())
    }
}

fn typed_export<Params, Results>(
    instance: &wasmtime::Instance,
    store: &mut Store<StoreCtx>,
    name: &str,
) -> PluginResult<TypedFunc<Params, Results>>
where
    Params: wasmtime::WasmParams,
    Results: wasmtime::WasmResults,
{
    instance
        .get_typed_func::<Params, Results>(store, name)
        .map_err(|e| PluginError::ModuleCompile {
            reason: format!("export {name}: {e}"),
        })
}

fn optional_export<Params, Results>(
    instance: &wasmtime::Instance,
    store: &mut Store<StoreCtx>,
    module: &Module,
    name: &str,
) -> PluginResult<Option<TypedFunc<Params, Results>>>
where
    Params: wasmtime::WasmParams,
    Results: wasmtime::WasmResults,
{
    if module.get_export(name).is_none() {
        return Ok(None);
    }
    typed_export(instance, store, name).map(Some)
}

/// Lifecycle hooks and `plugin_init` run under ten times the call budget.
fn init_deadline(limits: &ResourceLimits) -> Duration {
    Duration::from_millis(limits.max_execution_ms.saturating_mul(10))
}

/// Classify an engine-reported failure. Epoch interrupts become timeouts;
/// every other trap keeps its kind.
fn map_guest_error(err: wasmtime::Error, limit_ms: u64) -> PluginError {
    let Some(trap) = err.downcast_ref::<Trap>() else {
        return PluginError::Trap {
            kind: TrapKind::Other,
            message: err.to_string(),
        };
    };
    let kind = match trap {
        Trap::Interrupt => return PluginError::Timeout { limit_ms },
        Trap::OutOfFuel => TrapKind::FuelExhausted,
        Trap::MemoryOutOfBounds | Trap::TableOutOfBounds => TrapKind::MemoryBounds,
        Trap::IntegerDivisionByZero | Trap::IntegerOverflow => TrapKind::DivideByZero,
        Trap::UnreachableCodeReached => TrapKind::Unreachable,
        _ => TrapKind::Other,
    };
    PluginError::Trap {
        kind,
        message: trap.to_string(),
    }
}
