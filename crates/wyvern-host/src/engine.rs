//! Engine wrapper
//!
//! One shared wasmtime engine for every plugin: fuel metering for
//! instruction budgets, epoch interruption for wall-clock deadlines. The
//! epoch ticker advances the engine clock so abandoned calls trap instead
//! of running forever.

use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use wasmtime::{Config, Engine, Module, OptLevel};

use wyvern_core::{PluginError, PluginResult};

pub struct PluginEngine {
    engine: Engine,
    epoch_tick: Duration,
}

impl PluginEngine {
    pub fn new(epoch_tick_ms: u64) -> PluginResult<Self> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        config.cranelift_opt_level(OptLevel::Speed);
        config.parallel_compilation(true);

        let engine = Engine::new(&config)
            .map_err(|e| PluginError::Internal(format!("failed to create engine: {e}")))?;

        Ok(Self {
            engine,
            epoch_tick: Duration::from_millis(epoch_tick_ms.max(1)),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn epoch_tick(&self) -> Duration {
        self.epoch_tick
    }

    /// Epoch ticks covering `deadline`, rounded up with one tick of slack so
    /// the host-side timeout fires before the engine trap does.
    pub fn epoch_ticks_for(&self, deadline: Duration) -> u64 {
        (deadline.as_millis() as u64).div_ceil(self.epoch_tick.as_millis() as u64) + 1
    }

    /// Compile a module from binary (or WAT) bytes.
    pub fn compile(&self, name: &str, bytes: &[u8]) -> PluginResult<Module> {
        let start = Instant::now();
        let module = Module::new(&self.engine, bytes).map_err(|e| PluginError::ModuleCompile {
            reason: e.to_string(),
        })?;
        debug!(
            module = name,
            size_bytes = bytes.len(),
            compile_ms = start.elapsed().as_millis() as u64,
            "compiled module"
        );
        Ok(module)
    }

    /// Advance the engine epoch until `shutdown` fires. Every live store's
    /// deadline is measured in these ticks.
    pub fn start_epoch_ticker(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let tick = self.epoch_tick;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("epoch ticker stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        engine.increment_epoch();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_wat() {
        let engine = PluginEngine::new(10).unwrap();
        let module = engine
            .compile("answer", br#"(module (func (export "answer") (result i32) i32.const 42))"#)
            .unwrap();
        assert!(module.get_export("answer").is_some());
    }

    #[test]
    fn rejects_garbage() {
        let engine = PluginEngine::new(10).unwrap();
        let err = engine.compile("bad", b"\x01\x02\x03").unwrap_err();
        assert!(matches!(err, PluginError::ModuleCompile { .. }));
    }

    #[test]
    fn tick_budget_covers_deadline() {
        let engine = PluginEngine::new(10).unwrap();
        assert_eq!(engine.epoch_ticks_for(Duration::from_millis(100)), 11);
        assert_eq!(engine.epoch_ticks_for(Duration::from_millis(95)), 11);
        assert_eq!(engine.epoch_ticks_for(Duration::from_millis(5)), 2);
    }

    #[tokio::test]
    async fn ticker_stops_on_shutdown() {
        let engine = PluginEngine::new(1).unwrap();
        let token = CancellationToken::new();
        let handle = engine.start_epoch_ticker(token.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        handle.await.unwrap();
    }
}
