//! End-to-end dispatch through real WASM guests: cancellation semantics,
//! modification merging, deadline enforcement, host-call effects.

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use wyvern_core::{
    EventType, GameBridge, HostConfig, MemoryStorage, PluginError, PluginId, ResourceLimits,
    Storage,
};
use wyvern_host::PluginManager;

fn test_config(root: &Path) -> HostConfig {
    HostConfig {
        plugin_dir: root.join("plugins"),
        data_dir: root.join("data"),
        default_limits: lenient_limits(50),
        global_limits: ResourceLimits {
            max_memory_mb: 256,
            max_execution_ms: 1000,
            max_fuel: 1_000_000_000_000,
        },
        epoch_tick_ms: 5,
        ..Default::default()
    }
}

fn build_manager(config: HostConfig) -> (Arc<PluginManager>, Arc<MockBridge>, Arc<MemoryStorage>) {
    let bridge = MockBridge::new();
    let storage = Arc::new(MemoryStorage::new());
    let manager = PluginManager::with_storage(
        config,
        Arc::clone(&bridge) as Arc<dyn GameBridge>,
        Arc::clone(&storage) as Arc<dyn Storage>,
    )
    .unwrap();
    (manager, bridge, storage)
}

fn chat_event(priority: i32, ignore_cancelled: bool) -> String {
    format!(
        "\n[[events]]\nevent = \"player_chat\"\npriority = {priority}\nignore_cancelled = {ignore_cancelled}\n"
    )
}

#[tokio::test]
async fn cancellation_skips_opted_out_handlers() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plugins = config.plugin_dir.clone();
    fs::create_dir_all(&plugins).unwrap();

    write_plugin(&plugins, "p.canceller", GUEST_CANCEL, &chat_event(0, false));
    // Skipped once the event is cancelled.
    write_plugin(&plugins, "p.skipped", GUEST_MODIFY_WORLD, &chat_event(100, true));
    // Still fires on cancelled events.
    write_plugin(&plugins, "p.fires", GUEST_MODIFY_HELLO, &chat_event(200, false));

    let (manager, _, _) = build_manager(config);
    manager.load_all().await.unwrap();
    manager.enable_all().await;

    let result = manager.dispatch(EventType::PlayerChat, b"{}").await;
    assert!(result.cancelled);
    assert_eq!(result.handlers, 2);
    assert!(result.errors.is_empty());
    // Only the non-skipped modifier contributed.
    assert_eq!(result.modifications["message"], "hello");

    let skipped = manager.get_plugin(&PluginId::from("p.skipped")).unwrap();
    assert_eq!(skipped.instance.call_count(), 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn modification_merge_is_last_writer_wins() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plugins = config.plugin_dir.clone();
    fs::create_dir_all(&plugins).unwrap();

    write_plugin(&plugins, "p.hello", GUEST_MODIFY_HELLO, &chat_event(0, false));
    write_plugin(&plugins, "p.world", GUEST_MODIFY_WORLD, &chat_event(100, false));

    let (manager, _, _) = build_manager(config);
    manager.load_all().await.unwrap();
    manager.enable_all().await;

    let result = manager.dispatch(EventType::PlayerChat, b"{}").await;
    assert!(!result.cancelled);
    assert_eq!(result.handlers, 2);
    assert_eq!(result.modifications["message"], "world");
    manager.shutdown().await;
}

#[tokio::test]
async fn handler_timeout_is_isolated_and_counted_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plugins = config.plugin_dir.clone();
    fs::create_dir_all(&plugins).unwrap();

    write_plugin(
        &plugins,
        "p.spin",
        GUEST_LOOP,
        &format!("{}\n[limits]\nmax_execution_ms = 50\n", chat_event(0, false)),
    );
    write_plugin(&plugins, "p.after", GUEST_CANCEL, &chat_event(100, false));

    let (manager, _, _) = build_manager(config);
    manager.load_all().await.unwrap();
    manager.enable_all().await;

    let result = manager.dispatch(EventType::PlayerChat, b"{}").await;
    // The stuck handler timed out; the next one still ran.
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].0, PluginId::from("p.spin"));
    assert!(matches!(
        result.errors[0].1,
        PluginError::Timeout { limit_ms: 50 }
    ));
    assert!(result.cancelled);

    let spin = manager.get_plugin(&PluginId::from("p.spin")).unwrap();
    assert_eq!(spin.instance.error_count(), 1);

    // Give the epoch deadline time to trap the abandoned call, then verify
    // the instance still answers.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let output = spin
        .instance
        .call("ping", b"", Duration::from_millis(200))
        .await
        .unwrap();
    assert!(output.is_empty());
    assert_eq!(spin.instance.error_count(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn trapping_handler_does_not_silence_others() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plugins = config.plugin_dir.clone();
    fs::create_dir_all(&plugins).unwrap();

    write_plugin(&plugins, "p.trap", GUEST_TRAP, &chat_event(0, false));
    write_plugin(&plugins, "p.after", GUEST_CANCEL, &chat_event(100, false));

    let (manager, _, _) = build_manager(config);
    manager.load_all().await.unwrap();
    manager.enable_all().await;

    let result = manager.dispatch(EventType::PlayerChat, b"{}").await;
    assert_eq!(result.errors.len(), 1);
    assert!(matches!(result.errors[0].1, PluginError::Trap { .. }));
    // The errored handler contributed no cancellation; the next one did.
    assert!(result.cancelled);
    assert_eq!(result.handlers, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn disabled_plugin_sits_events_out() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plugins = config.plugin_dir.clone();
    fs::create_dir_all(&plugins).unwrap();

    write_plugin(&plugins, "p.veto", GUEST_CANCEL, &chat_event(0, false));

    let (manager, _, _) = build_manager(config);
    manager.load_all().await.unwrap();

    let id = PluginId::from("p.veto");
    manager.enable(&id).await.unwrap();
    let result = manager.dispatch(EventType::PlayerChat, b"{}").await;
    assert!(result.cancelled);

    manager.disable(&id).await.unwrap();
    let result = manager.dispatch(EventType::PlayerChat, b"{}").await;
    assert!(!result.cancelled);

    let veto = manager.get_plugin(&id).unwrap();
    assert_eq!(veto.instance.call_count(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn host_calls_reach_bridge_and_storage() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plugins = config.plugin_dir.clone();
    fs::create_dir_all(&plugins).unwrap();

    write_plugin(
        &plugins,
        "p.bridge",
        GUEST_BRIDGE,
        "\n[[events]]\nevent = \"player_join\"\npriority = 0\n",
    );

    let (manager, bridge, storage) = build_manager(config);
    manager.load_all().await.unwrap();
    manager.enable_all().await;

    let result = manager.dispatch(EventType::PlayerJoin, b"{}").await;
    assert!(result.errors.is_empty());
    assert_eq!(result.handlers, 1);

    assert_eq!(bridge.broadcasts.lock().as_slice(), &["hi".to_string()]);
    assert_eq!(
        storage
            .get(&PluginId::from("p.bridge"), "k")
            .unwrap()
            .as_deref(),
        Some(b"v1".as_slice())
    );

    // The response-writing path: the guest returns the raw JSON the host
    // wrote for host_get_online_players.
    let loaded = manager.get_plugin(&PluginId::from("p.bridge")).unwrap();
    let output = loaded
        .instance
        .call("query", b"", Duration::from_millis(200))
        .await
        .unwrap();
    let text = String::from_utf8(output).unwrap();
    assert!(text.contains("\"players\""), "unexpected response: {text}");
    assert!(text.contains("steve"), "unexpected response: {text}");
    manager.shutdown().await;
}

#[tokio::test]
async fn scheduled_tasks_fire_into_on_task() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plugins = config.plugin_dir.clone();
    fs::create_dir_all(&plugins).unwrap();

    write_plugin(
        &plugins,
        "p.task",
        GUEST_TASK,
        "\n[[events]]\nevent = \"player_join\"\npriority = 0\n",
    );

    let (manager, _, storage) = build_manager(config);
    manager.load_all().await.unwrap();
    manager.enable_all().await;

    let result = manager.dispatch(EventType::PlayerJoin, b"{}").await;
    assert!(result.errors.is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        storage
            .get(&PluginId::from("p.task"), "fired")
            .unwrap()
            .as_deref(),
        Some(b"yes".as_slice())
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn dispatch_stats_accumulate() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plugins = config.plugin_dir.clone();
    fs::create_dir_all(&plugins).unwrap();

    write_plugin(&plugins, "p.veto", GUEST_CANCEL, &chat_event(0, false));

    let (manager, _, _) = build_manager(config);
    manager.load_all().await.unwrap();
    manager.enable_all().await;

    manager.dispatch(EventType::PlayerChat, b"{}").await;
    manager.dispatch(EventType::PlayerChat, b"{}").await;

    let stats = manager.dispatcher().stats(EventType::PlayerChat).unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.cancelled, 2);
    assert!(stats.total_duration > Duration::ZERO);
    manager.shutdown().await;
}
