//! Lifecycle tests for the local plugin manager

use parking_lot::Mutex;
use plexus_bus::{DeliveryMode, Message};
use plexus_contracts::{ServiceContract, ServiceMethod};
use plexus_core::{ErrorKind, PluginCapabilities, PluginState, Version};
use plexus_plugin_api::testing::{write_artifact, MockPlugin, MockPluginBuilder, MockProbe};
use plexus_runtime::{
    LifecycleEvent, LoadOptions, PluginManager, ReloadOptions, RuntimeConfig,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

struct Host {
    _dir: TempDir,
    plugins: PathBuf,
    manager: PluginManager,
}

fn host() -> Host {
    let dir = tempfile::tempdir().unwrap();
    let plugins = dir.path().join("plugins");
    std::fs::create_dir_all(&plugins).unwrap();
    let config = RuntimeConfig {
        staging_dir: Some(dir.path().join("staging")),
        ..RuntimeConfig::default()
    }
    .with_search_path(&plugins);
    let manager = PluginManager::standalone(config).unwrap();
    Host {
        _dir: dir,
        plugins,
        manager,
    }
}

/// Write the artifact for `builder` into `dir` and register its factory
fn install(manager: &PluginManager, dir: &Path, builder: MockPluginBuilder) -> PathBuf {
    let path = write_artifact(dir, builder.metadata()).unwrap();
    let id = builder.metadata().id.clone();
    manager.register_static(id, builder.factory());
    path
}

fn contract(name: &str, version: Version) -> ServiceContract {
    ServiceContract::builder(name, version)
        .method(ServiceMethod::builder("get").build())
        .build()
        .unwrap()
}

fn record_transitions(manager: &PluginManager) -> Arc<Mutex<Vec<(String, PluginState, PluginState)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    manager.registry().add_observer(Arc::new(move |e: &LifecycleEvent| {
        sink.lock().push((e.plugin_id.clone(), e.from, e.to));
    }));
    seen
}

#[tokio::test]
async fn test_local_load_happy_path() {
    let host = host();
    install(&host.manager, &host.plugins, MockPlugin::builder("com.example.alpha"));
    let seen = record_transitions(&host.manager);

    let handle = host.manager.load_plugin("com.example.alpha").await.unwrap();
    assert_eq!(handle.state(), PluginState::Running);

    let states: Vec<PluginState> = seen.lock().iter().map(|(_, _, to)| *to).collect();
    assert_eq!(
        states,
        vec![
            PluginState::Loading,
            PluginState::Loaded,
            PluginState::Initializing,
            PluginState::Running
        ]
    );
    assert_eq!(seen.lock()[0].1, PluginState::Unloaded);

    let handle = host.manager.get_plugin("com.example.alpha").unwrap();
    let reply = handle
        .execute_command("hello", json!({ "name": "World" }))
        .await
        .unwrap();
    assert_eq!(
        reply,
        json!({ "message": "Hello, World!", "plugin": "com.example.alpha" })
    );

    let metrics = host.manager.metrics();
    assert_eq!(metrics.loads, 1);
    assert_eq!(metrics.initializations, 1);
}

#[tokio::test]
async fn test_load_twice_is_rejected() {
    let host = host();
    install(&host.manager, &host.plugins, MockPlugin::builder("com.example.alpha"));
    host.manager.load_plugin("com.example.alpha").await.unwrap();

    let err = host.manager.load_plugin("com.example.alpha").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyLoaded);
    assert_eq!(host.manager.registry().len(), 1);
}

#[tokio::test]
async fn test_unknown_plugin_not_found() {
    let host = host();
    let err = host.manager.load_plugin("com.example.nowhere").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PluginNotFound);
}

#[tokio::test]
async fn test_load_all_orders_dependencies() {
    let host = host();
    let probe_b = MockProbe::default();
    install(
        &host.manager,
        &host.plugins,
        MockPlugin::builder("com.example.b")
            .dependency("com.example.a")
            .probe(probe_b.clone()),
    );
    install(&host.manager, &host.plugins, MockPlugin::builder("com.example.a"));

    let report = host.manager.load_all().await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.loaded, vec!["com.example.a", "com.example.b"]);
    assert_eq!(
        probe_b.dependency_states().get("com.example.a"),
        Some(&Some(PluginState::Running))
    );
}

#[tokio::test]
async fn test_load_all_rejects_cycles() {
    let host = host();
    install(
        &host.manager,
        &host.plugins,
        MockPlugin::builder("com.example.x").dependency("com.example.y"),
    );
    install(
        &host.manager,
        &host.plugins,
        MockPlugin::builder("com.example.y").dependency("com.example.x"),
    );

    let err = host.manager.load_all().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircularDependency);
    assert_eq!(
        err.details(),
        Some("com.example.x -> com.example.y -> com.example.x")
    );
    assert!(host.manager.registry().is_empty());
}

#[tokio::test]
async fn test_missing_dependency_is_named() {
    let host = host();
    install(
        &host.manager,
        &host.plugins,
        MockPlugin::builder("com.example.b").dependency("com.example.absent"),
    );

    let err = host.manager.load_plugin("com.example.b").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyMissing);
    assert!(err.message().contains("com.example.absent"));
    assert!(!host.manager.registry().contains("com.example.b"));

    let report = host.manager.load_all().await.unwrap();
    assert!(report.loaded.is_empty());
    assert_eq!(
        report.failed.get("com.example.b").map(|e| e.kind()),
        Some(ErrorKind::DependencyMissing)
    );
}

#[tokio::test]
async fn test_initialize_failure_keeps_record_in_error() {
    let host = host();
    install(
        &host.manager,
        &host.plugins,
        MockPlugin::builder("com.example.broken").fail_initialize(),
    );

    let err = host.manager.load_plugin("com.example.broken").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InitializationFailed);

    let record = host.manager.registry().record("com.example.broken").unwrap();
    assert_eq!(record.state(), PluginState::Error);
    assert_eq!(
        record.last_error().map(|e| e.kind()),
        Some(ErrorKind::InitializationFailed)
    );
    assert_eq!(host.manager.metrics().initialization_failures, 1);

    host.manager.unload_plugin("com.example.broken").await.unwrap();
    assert!(host.manager.registry().is_empty());
}

#[tokio::test]
async fn test_stop_releases_host_registrations() {
    let host = host();
    let probe = MockProbe::default();
    install(
        &host.manager,
        &host.plugins,
        MockPlugin::builder("com.example.svc")
            .contract(contract("com.example.svc", Version::new(1, 2, 0)))
            .subscribe("demo.tick")
            .probe(probe.clone()),
    );
    host.manager.load_plugin("com.example.svc").await.unwrap();

    let contracts = host.manager.contracts();
    let resolved = contracts
        .resolve("com.example.svc", &Version::new(1, 0, 0))
        .unwrap();
    assert_eq!(resolved.version, Version::new(1, 2, 0));
    assert_eq!(
        contracts
            .resolve("com.example.svc", &Version::new(2, 0, 0))
            .unwrap_err()
            .kind(),
        ErrorKind::IncompatibleVersion
    );
    assert!(host.manager.bus().requests().contains("com.example.svc.get"));

    host.manager.stop_plugin("com.example.svc").await.unwrap();
    assert!(contracts.is_empty());
    assert!(!host.manager.bus().requests().contains("com.example.svc.get"));
    assert!(host
        .manager
        .bus()
        .subscriptions()
        .for_subscriber("com.example.svc")
        .is_empty());
    assert_eq!(probe.prepare_call_count(), 1);
    assert_eq!(probe.shutdown_call_count(), 1);

    // Stopping again is a no-op.
    host.manager.stop_plugin("com.example.svc").await.unwrap();
    assert_eq!(probe.shutdown_call_count(), 1);

    let err = host
        .manager
        .execute_command("com.example.svc", "hello", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateError);
}

#[tokio::test]
async fn test_pause_requires_support() {
    let host = host();
    install(&host.manager, &host.plugins, MockPlugin::builder("com.example.plain"));
    install(
        &host.manager,
        &host.plugins,
        MockPlugin::builder("com.example.pausable").pausable(),
    );
    host.manager.load_all().await.unwrap();

    let err = host.manager.pause_plugin("com.example.plain").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
    assert_eq!(
        host.manager.registry().record("com.example.plain").unwrap().state(),
        PluginState::Running
    );

    host.manager.pause_plugin("com.example.pausable").await.unwrap();
    let health = host.manager.health_check("com.example.pausable").await.unwrap();
    assert!(health.is_degraded());
    host.manager.resume_plugin("com.example.pausable").await.unwrap();
    assert!(host
        .manager
        .health_check("com.example.pausable")
        .await
        .unwrap()
        .is_healthy());
}

#[tokio::test]
async fn test_load_unload_load_reaches_running_again() {
    let host = host();
    let probe = MockProbe::default();
    install(
        &host.manager,
        &host.plugins,
        MockPlugin::builder("com.example.alpha").probe(probe.clone()),
    );

    host.manager.load_plugin("com.example.alpha").await.unwrap();
    host.manager.unload_plugin("com.example.alpha").await.unwrap();
    assert!(host.manager.get_plugin("com.example.alpha").is_none());

    let handle = host.manager.load_plugin("com.example.alpha").await.unwrap();
    assert_eq!(handle.state(), PluginState::Running);
    assert_eq!(probe.instances_created(), 2);
    assert_eq!(probe.init_call_count(), 2);
    assert_eq!(host.manager.metrics().unloads, 1);
}

#[tokio::test]
async fn test_restart_uses_fresh_instance() {
    let host = host();
    let probe = MockProbe::default();
    install(
        &host.manager,
        &host.plugins,
        MockPlugin::builder("com.example.alpha").probe(probe.clone()),
    );
    host.manager.load_plugin("com.example.alpha").await.unwrap();
    let first = host.manager.registry().record("com.example.alpha").unwrap().generation();

    host.manager.restart_plugin("com.example.alpha").await.unwrap();
    let record = host.manager.registry().record("com.example.alpha").unwrap();
    assert_eq!(record.state(), PluginState::Running);
    assert!(record.generation() > first);
    assert_eq!(probe.instances_created(), 2);
}

#[tokio::test]
async fn test_hot_reload_switches_delivery_to_new_instance() {
    let host = host();
    let probe = MockProbe::default();
    let v1 = MockPlugin::builder("com.example.hot")
        .hot_reload()
        .subscribe("demo.tick")
        .probe(probe.clone());
    install(&host.manager, &host.plugins, v1.clone());
    host.manager.load_plugin("com.example.hot").await.unwrap();

    let bus = host.manager.bus().clone();
    let tick = |n: u64| Message::new("demo.tick", "com.example.sender", json!({ "n": n }));
    bus.publish_async(tick(1), DeliveryMode::Broadcast, vec![]).await.unwrap();

    let next = tempfile::tempdir().unwrap();
    let v2 = v1.version(Version::new(1, 0, 1));
    let path = install(&host.manager, next.path(), v2);

    let outcome = host
        .manager
        .reload_plugin("com.example.hot", ReloadOptions::from_artifact(&path))
        .await
        .unwrap();
    assert_eq!(outcome.from, Version::new(1, 0, 0));
    assert_eq!(outcome.to, Version::new(1, 0, 1));

    bus.publish_async(tick(2), DeliveryMode::Broadcast, vec![]).await.unwrap();

    let received = probe.received();
    assert_eq!(
        received,
        vec![
            (Version::new(1, 0, 0), json!({ "n": 1 })),
            (Version::new(1, 0, 1), json!({ "n": 2 })),
        ]
    );
    assert_eq!(probe.shutdowns(), vec![Version::new(1, 0, 0)]);

    let record = host.manager.registry().record("com.example.hot").unwrap();
    assert_eq!(record.state(), PluginState::Running);
    assert_eq!(record.version(), Version::new(1, 0, 1));
    assert_eq!(record.artifact_path(), path);
    assert_eq!(
        host.manager
            .bus()
            .subscriptions()
            .for_subscriber("com.example.hot")
            .len(),
        1
    );
    assert_eq!(host.manager.metrics().reloads, 1);
}

#[tokio::test]
async fn test_hot_reload_failure_keeps_previous_instance() {
    let host = host();
    let probe = MockProbe::default();
    let v1 = MockPlugin::builder("com.example.hot")
        .hot_reload()
        .pausable()
        .subscribe("demo.tick")
        .contract(contract("com.example.hot.svc", Version::new(1, 0, 0)))
        .probe(probe.clone());
    install(&host.manager, &host.plugins, v1.clone());
    host.manager.load_plugin("com.example.hot").await.unwrap();

    let next = tempfile::tempdir().unwrap();
    let path = install(
        &host.manager,
        next.path(),
        v1.version(Version::new(1, 0, 1)).fail_initialize(),
    );

    let err = host
        .manager
        .reload_plugin("com.example.hot", ReloadOptions::from_artifact(&path))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InitializationFailed);

    let record = host.manager.registry().record("com.example.hot").unwrap();
    assert_eq!(record.state(), PluginState::Running);
    assert_eq!(record.version(), Version::new(1, 0, 0));
    assert!(probe.shutdowns().is_empty());
    assert!(host
        .manager
        .contracts()
        .resolve("com.example.hot.svc", &Version::new(1, 0, 0))
        .is_ok());

    host.manager
        .bus()
        .publish_async(
            Message::new("demo.tick", "com.example.sender", json!(7)),
            DeliveryMode::Broadcast,
            vec![],
        )
        .await
        .unwrap();
    assert_eq!(probe.received(), vec![(Version::new(1, 0, 0), json!(7))]);
    assert!(host
        .manager
        .health_check("com.example.hot")
        .await
        .unwrap()
        .is_healthy());
    assert_eq!(host.manager.metrics().reload_failures, 1);
}

#[tokio::test]
async fn test_reload_requires_capability() {
    let host = host();
    install(&host.manager, &host.plugins, MockPlugin::builder("com.example.cold"));
    host.manager.load_plugin("com.example.cold").await.unwrap();

    let err = host
        .manager
        .reload_plugin("com.example.cold", ReloadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
    assert!(host.manager.enable_hot_reload("com.example.cold").is_err());
}

#[tokio::test]
async fn test_reload_from_loaded_starts_plugin() {
    let host = host();
    let probe = MockProbe::default();
    let v1 = MockPlugin::builder("com.example.idle")
        .hot_reload()
        .contract(contract("com.example.idle.svc", Version::new(1, 0, 0)))
        .probe(probe.clone());
    install(&host.manager, &host.plugins, v1.clone());
    host.manager
        .load_plugin_with("com.example.idle", LoadOptions::load_only())
        .await
        .unwrap();
    let record = host.manager.registry().record("com.example.idle").unwrap();
    assert_eq!(record.state(), PluginState::Loaded);

    let next = tempfile::tempdir().unwrap();
    let path = install(&host.manager, next.path(), v1.version(Version::new(1, 0, 1)));
    let outcome = host
        .manager
        .reload_plugin("com.example.idle", ReloadOptions::from_artifact(&path))
        .await
        .unwrap();
    assert_eq!(outcome.to, Version::new(1, 0, 1));

    assert_eq!(record.state(), PluginState::Running);
    assert_eq!(record.version(), Version::new(1, 0, 1));
    assert_eq!(probe.initialized(), vec![Version::new(1, 0, 1)]);
    assert!(probe.shutdowns().is_empty());
    assert!(host
        .manager
        .contracts()
        .resolve("com.example.idle.svc", &Version::new(1, 0, 0))
        .is_ok());
    host.manager
        .execute_command("com.example.idle", "hello", json!({}))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_reload_from_stopped_starts_plugin() {
    let host = host();
    let probe = MockProbe::default();
    let v1 = MockPlugin::builder("com.example.idle")
        .hot_reload()
        .subscribe("demo.tick")
        .probe(probe.clone());
    install(&host.manager, &host.plugins, v1.clone());
    host.manager.load_plugin("com.example.idle").await.unwrap();
    host.manager.stop_plugin("com.example.idle").await.unwrap();
    let record = host.manager.registry().record("com.example.idle").unwrap();
    assert_eq!(record.state(), PluginState::Stopped);

    let next = tempfile::tempdir().unwrap();
    let path = install(&host.manager, next.path(), v1.version(Version::new(1, 0, 1)));
    host.manager
        .reload_plugin("com.example.idle", ReloadOptions::from_artifact(&path))
        .await
        .unwrap();

    assert_eq!(record.state(), PluginState::Running);
    assert_eq!(probe.initialized(), vec![Version::new(1, 0, 0), Version::new(1, 0, 1)]);
    assert_eq!(probe.shutdowns(), vec![Version::new(1, 0, 0)]);

    host.manager
        .bus()
        .publish_async(
            Message::new("demo.tick", "com.example.sender", json!(3)),
            DeliveryMode::Broadcast,
            vec![],
        )
        .await
        .unwrap();
    assert_eq!(probe.received(), vec![(Version::new(1, 0, 1), json!(3))]);
}

#[tokio::test]
async fn test_failed_idle_reload_keeps_state() {
    let host = host();
    let v1 = MockPlugin::builder("com.example.idle").hot_reload();
    install(&host.manager, &host.plugins, v1.clone());
    host.manager
        .load_plugin_with("com.example.idle", LoadOptions::load_only())
        .await
        .unwrap();

    let next = tempfile::tempdir().unwrap();
    let path = install(
        &host.manager,
        next.path(),
        v1.version(Version::new(1, 0, 1)).fail_initialize(),
    );
    let err = host
        .manager
        .reload_plugin("com.example.idle", ReloadOptions::from_artifact(&path))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InitializationFailed);

    let record = host.manager.registry().record("com.example.idle").unwrap();
    assert_eq!(record.state(), PluginState::Loaded);
    assert_eq!(record.version(), Version::new(1, 0, 0));
    assert_eq!(host.manager.metrics().reload_failures, 1);
}

#[tokio::test]
async fn test_reload_can_forbid_contract_minor_increase() {
    let host = host();
    let v1 = MockPlugin::builder("com.example.svc")
        .hot_reload()
        .contract(contract("com.example.svc", Version::new(1, 0, 0)));
    install(&host.manager, &host.plugins, v1);
    host.manager.load_plugin("com.example.svc").await.unwrap();

    let next = tempfile::tempdir().unwrap();
    let v2 = MockPlugin::builder("com.example.svc")
        .hot_reload()
        .version(Version::new(1, 1, 0))
        .contract(contract("com.example.svc", Version::new(1, 1, 0)));
    let path = install(&host.manager, next.path(), v2);

    let options = ReloadOptions {
        artifact: Some(path.clone()),
        forbid_contract_minor_increase: true,
        config: None,
    };
    let err = host
        .manager
        .reload_plugin("com.example.svc", options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IncompatibleVersion);
    let current = host
        .manager
        .contracts()
        .resolve("com.example.svc", &Version::new(1, 0, 0))
        .unwrap();
    assert_eq!(current.version, Version::new(1, 0, 0));

    host.manager
        .reload_plugin("com.example.svc", ReloadOptions::from_artifact(&path))
        .await
        .unwrap();
    let current = host
        .manager
        .contracts()
        .resolve("com.example.svc", &Version::new(1, 0, 0))
        .unwrap();
    assert_eq!(current.version, Version::new(1, 1, 0));
    assert!(host.manager.bus().requests().contains("com.example.svc.get"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_supported_events_reach_handle_event() {
    let host = host();
    let probe = MockProbe::default();
    install(
        &host.manager,
        &host.plugins,
        MockPlugin::builder("com.example.listener")
            .supported_event("demo.changed")
            .probe(probe.clone()),
    );
    host.manager.load_plugin("com.example.listener").await.unwrap();

    let report = host
        .manager
        .bus()
        .publish_async(
            Message::new("demo.changed", "com.example.sender", json!({})),
            DeliveryMode::Broadcast,
            vec![],
        )
        .await
        .unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(
        probe.events(),
        vec![(Version::new(1, 0, 0), "demo.changed".to_string())]
    );
}

#[tokio::test]
async fn test_force_error_and_snapshot() {
    let host = host();
    install(&host.manager, &host.plugins, MockPlugin::builder("com.example.a"));
    install(
        &host.manager,
        &host.plugins,
        MockPlugin::builder("com.example.b").hot_reload(),
    );
    host.manager.load_all().await.unwrap();

    host.manager
        .force_error("com.example.a", plexus_core::PluginError::execution_failed("wedged"))
        .await
        .unwrap();

    let snapshot = host.manager.snapshot();
    assert_eq!(snapshot.by_state.get("error"), Some(&1));
    assert_eq!(snapshot.by_state.get("running"), Some(&1));
    let b = snapshot
        .plugins
        .iter()
        .find(|p| p.id == "com.example.b")
        .unwrap();
    assert!(b.hot_reload_enabled);
    let a = snapshot
        .plugins
        .iter()
        .find(|p| p.id == "com.example.a")
        .unwrap();
    assert!(a.last_error.as_deref().unwrap_or_default().contains("wedged"));

    let health = host.manager.health_check_all().await;
    assert_eq!(health.keys().collect::<Vec<_>>(), vec!["com.example.b"]);

    host.manager.shutdown().await;
    assert!(host.manager.registry().is_empty());
}

#[tokio::test]
async fn test_load_without_initialize() {
    let host = host();
    let path = install(
        &host.manager,
        &host.plugins,
        MockPlugin::builder("com.example.alpha"),
    );
    let handle = host
        .manager
        .load_from_path(&path, LoadOptions::load_only().with_config(json!({ "level": 2 })))
        .await
        .unwrap();
    assert_eq!(handle.state(), PluginState::Loaded);
    assert!(!handle
        .metadata()
        .capabilities
        .contains(PluginCapabilities::HOT_RELOAD));
    assert!(!handle.record().hot_reload_enabled());

    host.manager.initialize_plugin("com.example.alpha").await.unwrap();
    assert_eq!(handle.state(), PluginState::Running);
    assert_eq!(
        host.manager.registry().record("com.example.alpha").unwrap().config(),
        json!({ "level": 2 })
    );
}
