mod common;

use common::*;
use plexus::prelude::*;
use plexus::recovery::CircuitState;
use plexus::remote::UpdatePolicy;
use plexus::{LoadStrategy, UnifiedLoadOptions};
use plexus_core::ErrorKind;
use plexus_plugin_api::testing::{MockPlugin, MockProbe};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PID: &str = "com.example.alpha";

#[tokio::test]
async fn test_local_load_publishes_lifecycle() {
    let host = host(None, UpdatePolicy::CheckOnly);
    host.install_local(&MockPlugin::builder(PID));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    host.manager
        .subscribe_lifecycle("test.observer", move |event| {
            let _ = tx.send(event);
        })
        .unwrap();

    let handle = host
        .manager
        .load_plugin(PID, UnifiedLoadOptions::default())
        .await
        .unwrap();
    assert_eq!(handle.state(), PluginState::Running);
    assert_eq!(handle.record().source(), PluginSource::Local);

    let reply = host
        .manager
        .execute_command(PID, "hello", json!({"name": "Plexus"}))
        .await
        .unwrap();
    assert_eq!(reply, json!({"message": "Hello, Plexus!", "plugin": PID}));

    let states: Vec<PluginState> = host
        .manager
        .bus()
        .events()
        .history_of::<PluginLifecycleEvent>()
        .into_iter()
        .map(|e| e.to)
        .collect();
    assert_eq!(
        states,
        vec![
            PluginState::Loading,
            PluginState::Loaded,
            PluginState::Initializing,
            PluginState::Running
        ]
    );

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.plugin_id, PID);
    assert_eq!(first.to, PluginState::Loading);

    let err = host
        .manager
        .load_plugin(PID, UnifiedLoadOptions::default())
        .await
        .unwrap_err();
    assert!(err.is(ErrorKind::AlreadyLoaded));

    host.manager.shutdown().await;
}

#[tokio::test]
async fn test_signed_install_then_cache_hit() {
    let server = MockServer::start().await;
    let key = keypair();
    let plugin = MockPlugin::builder(PID);
    mount_catalog(&server, vec![entry(&plugin, true)]).await;
    mount_download(&server, &plugin, Some(1)).await;
    mount_signature(&server, &plugin, &key).await;

    let host = host(Some(&server), UpdatePolicy::CheckOnly);
    host.trust(&key);
    host.register(&plugin);

    let handle = host.manager.install_plugin(PID, None).await.unwrap();
    assert_eq!(handle.state(), PluginState::Running);
    assert_eq!(
        handle.record().source(),
        PluginSource::Remote {
            repository: "main".to_string()
        }
    );

    let again = host.manager.install_plugin(PID, None).await.unwrap();
    assert_eq!(again.version(), Version::new(1, 0, 0));

    let installed = host.manager.pipeline().installed().get(PID).unwrap();
    assert_eq!(installed.version, Version::new(1, 0, 0));
    assert_eq!(installed.source, "main");

    let metrics = host.manager.pipeline().metrics();
    assert_eq!(metrics.network_fetches, 1);
    assert_eq!(metrics.cache_hits, 1);

    host.manager.shutdown().await;
}

#[tokio::test]
async fn test_corrupt_cache_entry_refetched_on_load() {
    let server = MockServer::start().await;
    let plugin = MockPlugin::builder(PID);
    mount_catalog(&server, vec![entry(&plugin, false)]).await;
    mount_download(&server, &plugin, Some(2)).await;

    let host = host(Some(&server), UpdatePolicy::CheckOnly);
    host.register(&plugin);

    let handle = host.manager.install_plugin(PID, None).await.unwrap();
    let cached = handle.record().artifact_path();
    host.manager.unload_plugin(PID).await.unwrap();
    std::fs::write(&cached, b"tampered").unwrap();

    let before = host.manager.pipeline().metrics();
    let handle = host
        .manager
        .load_plugin(PID, UnifiedLoadOptions::with_strategy(LoadStrategy::RemoteOnly))
        .await
        .unwrap();
    assert_eq!(handle.state(), PluginState::Running);

    let after = host.manager.pipeline().metrics();
    assert_eq!(after.cache_invalidations - before.cache_invalidations, 1);
    assert_eq!(after.network_fetches - before.network_fetches, 1);
    assert_eq!(std::fs::read(&cached).unwrap(), artifact_bytes(&plugin));

    host.manager.shutdown().await;
}

#[tokio::test]
async fn test_prefer_remote_falls_back_to_local() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/catalog"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let host = host(Some(&server), UpdatePolicy::CheckOnly);
    host.install_local(&MockPlugin::builder(PID));

    let handle = host
        .manager
        .load_plugin(PID, UnifiedLoadOptions::with_strategy(LoadStrategy::PreferRemote))
        .await
        .unwrap();
    assert_eq!(handle.record().source(), PluginSource::Local);
    assert!(host.manager.pipeline().installed().get(PID).is_none());

    host.manager.shutdown().await;
}

#[tokio::test]
async fn test_local_only_never_contacts_repositories() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let host = host(Some(&server), UpdatePolicy::CheckOnly);
    let err = host
        .manager
        .load_plugin(PID, UnifiedLoadOptions::with_strategy(LoadStrategy::LocalOnly))
        .await
        .unwrap_err();
    assert!(err.is(ErrorKind::PluginNotFound));

    host.manager.shutdown().await;
}

#[tokio::test]
async fn test_best_version_prefers_newer_remote() {
    let server = MockServer::start().await;
    let remote = MockPlugin::builder(PID).version(Version::new(1, 2, 0));
    mount_catalog(&server, vec![entry(&remote, false)]).await;
    mount_download(&server, &remote, Some(1)).await;

    let host = host(Some(&server), UpdatePolicy::CheckOnly);
    host.install_local(&MockPlugin::builder(PID));
    host.register(&remote);

    let handle = host
        .manager
        .load_plugin(PID, UnifiedLoadOptions::with_strategy(LoadStrategy::BestVersion))
        .await
        .unwrap();
    assert_eq!(handle.version(), Version::new(1, 2, 0));
    assert!(matches!(handle.record().source(), PluginSource::Remote { .. }));

    host.manager.shutdown().await;
}

#[tokio::test]
async fn test_best_version_tie_goes_to_local() {
    let server = MockServer::start().await;
    let plugin = MockPlugin::builder(PID);
    mount_catalog(&server, vec![entry(&plugin, false)]).await;
    mount_download(&server, &plugin, Some(0)).await;

    let host = host(Some(&server), UpdatePolicy::CheckOnly);
    host.install_local(&plugin);

    let handle = host
        .manager
        .load_plugin(PID, UnifiedLoadOptions::with_strategy(LoadStrategy::BestVersion))
        .await
        .unwrap();
    assert_eq!(handle.version(), Version::new(1, 0, 0));
    assert_eq!(handle.record().source(), PluginSource::Local);

    host.manager.shutdown().await;
}

#[tokio::test]
async fn test_requested_version_must_match_local() {
    let host = host(None, UpdatePolicy::CheckOnly);
    host.install_local(&MockPlugin::builder(PID));

    let err = host
        .manager
        .load_plugin(
            PID,
            UnifiedLoadOptions::with_strategy(LoadStrategy::LocalOnly).version(Version::new(2, 0, 0)),
        )
        .await
        .unwrap_err();
    assert!(err.is(ErrorKind::PluginNotFound));
    assert!(host.manager.get_plugin(PID).is_none());

    host.manager.shutdown().await;
}

#[tokio::test]
async fn test_uninstall_clears_ledger_and_cache() {
    let server = MockServer::start().await;
    let plugin = MockPlugin::builder(PID);
    mount_catalog(&server, vec![entry(&plugin, false)]).await;
    mount_download(&server, &plugin, Some(1)).await;

    let host = host(Some(&server), UpdatePolicy::CheckOnly);
    host.register(&plugin);
    host.manager.install_plugin(PID, None).await.unwrap();
    assert_eq!(host.manager.pipeline().cache().entries().len(), 1);

    let removed = host.manager.uninstall_plugin(PID).await.unwrap().unwrap();
    assert_eq!(removed.version, Version::new(1, 0, 0));
    assert!(host.manager.get_plugin(PID).is_none());
    assert!(host.manager.pipeline().installed().get(PID).is_none());
    assert!(host.manager.pipeline().cache().entries().is_empty());

    host.manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_unloads_everything() {
    let probe = MockProbe::default();
    let host = host(None, UpdatePolicy::CheckOnly);
    host.install_local(&MockPlugin::builder(PID).probe(probe.clone()));
    host.manager.start().unwrap();

    host.manager
        .load_plugin(PID, UnifiedLoadOptions::default())
        .await
        .unwrap();
    host.manager.shutdown().await;

    assert_eq!(probe.shutdowns(), vec![Version::new(1, 0, 0)]);
    assert!(host.manager.list_plugins().is_empty());
    assert!(host.manager.start().is_err());
}

#[tokio::test]
async fn test_missing_plugins_do_not_block_installs() {
    let server = MockServer::start().await;
    let plugin = MockPlugin::builder(PID);
    mount_catalog(&server, vec![entry(&plugin, false)]).await;
    mount_download(&server, &plugin, Some(1)).await;

    let host = host(Some(&server), UpdatePolicy::CheckOnly);
    host.register(&plugin);

    for _ in 0..8 {
        let err = host
            .manager
            .load_plugin(
                "com.example.missing",
                UnifiedLoadOptions::with_strategy(LoadStrategy::RemoteOnly),
            )
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::PluginNotFound), "{err}");
    }

    let handle = host.manager.install_plugin(PID, None).await.unwrap();
    assert_eq!(handle.state(), PluginState::Running);

    host.manager.shutdown().await;
}

#[tokio::test]
async fn test_failing_plugin_does_not_open_breaker_for_others() {
    let server = MockServer::start().await;
    let good = MockPlugin::builder(PID);
    let broken = MockPlugin::builder("com.example.broken");
    mount_catalog(&server, vec![entry(&good, false), entry(&broken, false)]).await;
    mount_download(&server, &good, Some(1)).await;
    Mock::given(method("GET"))
        .and(path("/plugin/com.example.broken/1.0.0/download"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let host = host(Some(&server), UpdatePolicy::CheckOnly);
    host.register(&good);
    host.register(&broken);

    for _ in 0..6 {
        assert!(host.manager.install_plugin("com.example.broken", None).await.is_err());
    }
    let broken_breaker = format!("{}:com.example.broken", plexus::REMOTE_ACQUIRE);
    let breakers = host.manager.status().breakers;
    let (_, metrics) = breakers
        .iter()
        .find(|(name, _)| *name == broken_breaker)
        .unwrap();
    assert_eq!(metrics.state, CircuitState::Open);

    let handle = host.manager.install_plugin(PID, None).await.unwrap();
    assert_eq!(handle.state(), PluginState::Running);

    host.manager.shutdown().await;
}
