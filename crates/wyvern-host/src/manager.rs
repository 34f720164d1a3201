//! Plugin manager
//!
//! Orchestrates the whole plugin lifecycle: discovers plugin directories,
//! resolves a dependency order, compiles and instantiates each module,
//! wires subscriptions into the dispatcher, and routes game events. Every
//! per-plugin failure is contained: one broken plugin never stops the rest
//! from loading, and the process never exits because of a plugin fault.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wasmtime::Linker;

use wyvern_core::{
    EventResult, EventType, FileStorage, GameBridge, HostConfig, Manifest, PluginError, PluginId,
    PluginResult, Storage, resolve_load_order,
};

use crate::dispatcher::{DispatchResult, Dispatcher, Handler, Subscription, SubscriptionToken};
use crate::engine::PluginEngine;
use crate::hostcall::{HostCallRegistry, HostContext};
use crate::instance::Instance;
use crate::pool::InstancePool;
use crate::scheduler::{TaskScheduler, TaskSink};

/// A plugin currently held by the manager.
pub struct LoadedPlugin {
    pub manifest: Arc<Manifest>,
    pub instance: Arc<Instance>,
    pub tokens: Vec<SubscriptionToken>,
    pub loaded_at: SystemTime,
    pub directory: PathBuf,
}

#[derive(Default)]
struct PluginTable {
    plugins: HashMap<PluginId, Arc<LoadedPlugin>>,
    load_order: Vec<PluginId>,
}

/// Owns every loaded plugin and the machinery around them.
///
/// Public methods are safe to call from any thread. Construct inside a
/// tokio runtime: the manager spawns the engine epoch ticker and scheduled
/// tasks onto it.
pub struct PluginManager {
    config: HostConfig,
    engine: PluginEngine,
    dispatcher: Dispatcher,
    storage: Arc<dyn Storage>,
    bridge: Arc<dyn GameBridge>,
    scheduler: TaskScheduler,
    table: RwLock<PluginTable>,
    root: CancellationToken,
    epoch_ticker: Mutex<Option<JoinHandle<()>>>,
}

impl PluginManager {
    /// Create a manager with file-backed storage under `config.data_dir`.
    pub fn new(config: HostConfig, bridge: Arc<dyn GameBridge>) -> PluginResult<Arc<Self>> {
        let storage = Arc::new(FileStorage::open(&config.data_dir)?);
        Self::with_storage(config, bridge, storage)
    }

    /// Create a manager over an explicit storage backend.
    pub fn with_storage(
        config: HostConfig,
        bridge: Arc<dyn GameBridge>,
        storage: Arc<dyn Storage>,
    ) -> PluginResult<Arc<Self>> {
        let engine = PluginEngine::new(config.epoch_tick_ms)?;
        let root = CancellationToken::new();

        let manager = Arc::new_cyclic(|weak: &Weak<PluginManager>| {
            // Scheduled tasks hold only a weak back-reference so a dropped
            // manager tears down cleanly despite the closure cycle.
            let sink: TaskSink = {
                let weak = weak.clone();
                Arc::new(move |plugin, task_id, data| {
                    let weak = weak.clone();
                    async move {
                        if let Some(manager) = weak.upgrade() {
                            manager.deliver_task(plugin, task_id, data).await;
                        }
                    }
                    .boxed()
                })
            };
            let scheduler = TaskScheduler::new(sink, root.child_token());

            PluginManager {
                config,
                engine,
                dispatcher: Dispatcher::new(),
                storage,
                bridge,
                scheduler,
                table: RwLock::new(PluginTable::default()),
                root,
                epoch_ticker: Mutex::new(None),
            }
        });

        let ticker = manager
            .engine
            .start_epoch_ticker(manager.root.child_token());
        *manager.epoch_ticker.lock() = Some(ticker);

        Ok(manager)
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Discover and load every enabled plugin in dependency order.
    ///
    /// Creates the plugin directory (and returns early) when it does not
    /// exist yet. Manifest and load failures are logged and skipped; other
    /// plugins still load. Returns the number of plugins loaded.
    pub async fn load_all(&self) -> PluginResult<usize> {
        let plugin_dir = self.config.plugin_dir.clone();
        if !plugin_dir.exists() {
            info!(path = %plugin_dir.display(), "creating plugin directory");
            tokio::fs::create_dir_all(&plugin_dir).await?;
            return Ok(0);
        }

        let mut manifests: Vec<Manifest> = Vec::new();
        let mut directories: HashMap<String, PathBuf> = HashMap::new();

        let mut entries = tokio::fs::read_dir(&plugin_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let dir = entry.path();
            let manifest_path = dir.join("plugin.toml");

            let manifest = match self.read_manifest(&manifest_path).await {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(path = %manifest_path.display(), error = %e, "failed to load manifest");
                    continue;
                }
            };

            if !dir.join(&manifest.entry_point).exists() {
                warn!(
                    plugin = %manifest.id,
                    entry_point = %manifest.entry_point,
                    "entry point not found"
                );
                continue;
            }
            if !self.config.is_plugin_enabled(&manifest.id) {
                debug!(plugin = %manifest.id, "plugin disabled by config");
                continue;
            }
            if directories.contains_key(&manifest.id) {
                warn!(plugin = %manifest.id, path = %dir.display(), "duplicate plugin id; skipping");
                continue;
            }

            directories.insert(manifest.id.clone(), dir);
            manifests.push(manifest);
        }

        let order: Vec<Manifest> = resolve_load_order(&manifests)?
            .into_iter()
            .cloned()
            .collect();

        let mut loaded = 0;
        for manifest in order {
            let Some(dir) = directories.get(&manifest.id).cloned() else {
                continue;
            };
            let id = manifest.id.clone();
            match self.load_plugin(manifest, &dir).await {
                Ok(()) => loaded += 1,
                Err(e) => error!(plugin = %id, error = %e, "failed to load plugin"),
            }
        }

        info!(count = loaded, "plugins loaded");
        Ok(loaded)
    }

    async fn read_manifest(&self, path: &Path) -> PluginResult<Manifest> {
        let text = tokio::fs::read_to_string(path).await?;
        let manifest = Manifest::from_toml(&text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load one plugin from `dir`. Compiles the entry point, verifies the
    /// required exports, runs `plugin_init` under the init deadline, and
    /// registers the manifest's subscriptions. On any failure the partially
    /// constructed instance is destroyed; nothing leaks.
    pub async fn load_plugin(&self, manifest: Manifest, dir: &Path) -> PluginResult<()> {
        let id = manifest.plugin_id();
        if self.table.read().plugins.contains_key(&id) {
            return Err(PluginError::AlreadyLoaded(id));
        }

        let wasm_path = dir.join(&manifest.entry_point);
        let bytes = tokio::fs::read(&wasm_path).await?;
        let module = self.engine.compile(&manifest.id, &bytes)?;

        let limits = self.config.effective_limits(manifest.limits);
        let manifest = Arc::new(manifest);

        let mut linker = Linker::new(self.engine.engine());
        HostCallRegistry::bind(
            &mut linker,
            HostContext {
                plugin_id: id.clone(),
                bridge: Arc::clone(&self.bridge),
                storage: Arc::clone(&self.storage),
                scheduler: self.scheduler.clone(),
            },
        )?;

        let instance = Arc::new(Instance::new(
            &self.engine,
            &module,
            &linker,
            Arc::clone(&manifest),
            limits,
        )?);

        // Dropping the instance on failure destroys the engine instance.
        instance.initialize().await?;

        let mut tokens = Vec::new();
        for sub in &manifest.events {
            let Some(event) = sub.event_type() else {
                continue;
            };
            let handler = self.handler_for(Arc::clone(&instance), event, limits.max_execution_ms);
            tokens.push(self.dispatcher.subscribe(
                event,
                Subscription {
                    plugin_id: id.clone(),
                    priority: sub.priority,
                    ignore_cancelled: sub.ignore_cancelled,
                    handler,
                },
            ));
        }

        let loaded = Arc::new(LoadedPlugin {
            manifest: Arc::clone(&manifest),
            instance,
            tokens,
            loaded_at: SystemTime::now(),
            directory: dir.to_path_buf(),
        });

        {
            let mut table = self.table.write();
            if table.plugins.contains_key(&id) {
                drop(table);
                // Lost a concurrent load race; roll our subscriptions back.
                for token in &loaded.tokens {
                    self.dispatcher.unsubscribe_token(*token);
                }
                return Err(PluginError::AlreadyLoaded(id));
            }
            table.plugins.insert(id.clone(), loaded);
            table.load_order.push(id.clone());
        }

        info!(plugin = %id, version = %manifest.version, "plugin loaded");
        Ok(())
    }

    fn handler_for(&self, instance: Arc<Instance>, event: EventType, limit_ms: u64) -> Handler {
        Arc::new(move |payload: Vec<u8>, deadline: Duration| {
            let instance = Arc::clone(&instance);
            async move {
                if !instance.state().is_callable() {
                    // A disabled plugin sits the event out; not an error.
                    return Ok(EventResult::default());
                }
                let deadline = deadline.min(Duration::from_millis(limit_ms));
                match instance.handle_event(event, &payload, deadline).await? {
                    Some(result) => Ok(result),
                    None => Ok(EventResult::default()),
                }
            }
            .boxed()
        })
    }

    /// Build a pool of warm instances for one loaded plugin, for workloads
    /// that outrun a single serialized instance. `size` 0 means the
    /// configured `pool_size`. Pool instances share the plugin's limits and
    /// host-call bindings but none of its linear memory.
    pub async fn build_pool(&self, id: &PluginId, size: usize) -> PluginResult<InstancePool> {
        let loaded = self
            .get_plugin(id)
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        let size = if size == 0 { self.config.pool_size } else { size };

        let wasm_path = loaded.directory.join(&loaded.manifest.entry_point);
        let bytes = tokio::fs::read(&wasm_path).await?;
        let module = self.engine.compile(&loaded.manifest.id, &bytes)?;
        let limits = self.config.effective_limits(loaded.manifest.limits);

        let mut linker = Linker::new(self.engine.engine());
        HostCallRegistry::bind(
            &mut linker,
            HostContext {
                plugin_id: id.clone(),
                bridge: Arc::clone(&self.bridge),
                storage: Arc::clone(&self.storage),
                scheduler: self.scheduler.clone(),
            },
        )?;

        let mut instances = Vec::with_capacity(size);
        for _ in 0..size {
            let instance = Instance::new(
                &self.engine,
                &module,
                &linker,
                Arc::clone(&loaded.manifest),
                limits,
            )?;
            instance.initialize().await?;
            instances.push(instance);
        }
        Ok(InstancePool::new(instances))
    }

    pub fn get_plugin(&self, id: &PluginId) -> Option<Arc<LoadedPlugin>> {
        self.table.read().plugins.get(id).cloned()
    }

    /// Loaded plugins in load order.
    pub fn plugins(&self) -> Vec<Arc<LoadedPlugin>> {
        let table = self.table.read();
        table
            .load_order
            .iter()
            .filter_map(|id| table.plugins.get(id).cloned())
            .collect()
    }

    pub fn load_order(&self) -> Vec<PluginId> {
        self.table.read().load_order.clone()
    }

    pub async fn enable(&self, id: &PluginId) -> PluginResult<()> {
        let loaded = self
            .get_plugin(id)
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        loaded.instance.enable().await
    }

    pub async fn disable(&self, id: &PluginId) -> PluginResult<()> {
        let loaded = self
            .get_plugin(id)
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        loaded.instance.disable().await
    }

    /// Unload one plugin: unsubscribe its handlers, cancel its tasks,
    /// destroy its instance, and forget it.
    pub async fn unload(&self, id: &PluginId) -> PluginResult<()> {
        let loaded = {
            let mut table = self.table.write();
            let Some(loaded) = table.plugins.remove(id) else {
                return Err(PluginError::NotFound(id.clone()));
            };
            table.load_order.retain(|p| p != id);
            loaded
        };

        self.dispatcher.unsubscribe(id);
        self.scheduler.cancel_all(id);
        loaded.instance.unload().await;
        Ok(())
    }

    /// Enable every plugin in load order; failures are logged and skipped.
    pub async fn enable_all(&self) {
        for id in self.load_order() {
            if let Err(e) = self.enable(&id).await {
                error!(plugin = %id, error = %e, "failed to enable plugin");
            }
        }
    }

    /// Disable in reverse load order so dependents stop before their
    /// dependencies.
    pub async fn disable_all(&self) {
        let mut order = self.load_order();
        order.reverse();
        for id in order {
            if let Err(e) = self.disable(&id).await {
                error!(plugin = %id, error = %e, "failed to disable plugin");
            }
        }
    }

    /// Dispatch an event under the global execution deadline.
    pub async fn dispatch(&self, event: EventType, payload: &[u8]) -> DispatchResult {
        let deadline = Duration::from_millis(self.config.global_limits.max_execution_ms);
        self.dispatch_with_deadline(event, payload, deadline).await
    }

    /// Dispatch with an explicit deadline. Cancellation flows root →
    /// dispatch → handler: shutting the manager down aborts the fan-out.
    pub async fn dispatch_with_deadline(
        &self,
        event: EventType,
        payload: &[u8],
        deadline: Duration,
    ) -> DispatchResult {
        self.dispatcher
            .dispatch(event, payload, deadline, self.root.child_token())
            .await
    }

    /// Deliver a fired scheduled task to the owning plugin's `on_task`
    /// export.
    async fn deliver_task(&self, plugin: PluginId, task_id: String, data: Vec<u8>) {
        let Some(loaded) = self.get_plugin(&plugin) else {
            debug!(plugin = %plugin, task = %task_id, "task fired for unloaded plugin");
            return;
        };
        let deadline = Duration::from_millis(loaded.instance.limits().max_execution_ms);
        match loaded.instance.call("on_task", &data, deadline).await {
            Ok(_) => {}
            Err(PluginError::MissingExport { .. }) => {
                debug!(plugin = %plugin, task = %task_id, "plugin has no on_task export");
            }
            Err(e) => {
                warn!(plugin = %plugin, task = %task_id, op = "task", error = %e, "scheduled task failed");
            }
        }
    }

    /// Shut everything down: cancel background work, disable in reverse
    /// order, unload every plugin, close storage. Idempotent.
    pub async fn shutdown(&self) {
        if self.root.is_cancelled() {
            return;
        }
        self.root.cancel();
        self.scheduler.shutdown();

        self.disable_all().await;

        let ids: Vec<PluginId> = {
            let table = self.table.read();
            table.load_order.iter().rev().cloned().collect()
        };
        for id in ids {
            if let Err(e) = self.unload(&id).await {
                error!(plugin = %id, error = %e, "failed to unload plugin during shutdown");
            }
        }

        if let Some(ticker) = self.epoch_ticker.lock().take() {
            ticker.abort();
        }
        if let Err(e) = self.storage.close() {
            error!(error = %e, "failed to close storage");
        }
        info!("plugin manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }
}
