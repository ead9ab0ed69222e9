#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use plexus::config::HostConfig;
use plexus::recovery::RetryPolicy;
use plexus::remote::{
    DetachedSignature, PublisherCertificate, RemoteConfig, RemotePluginMetadata, Repository,
    SignatureAlgorithm, TrustLevel, UpdatePolicy,
};
use plexus::runtime::RuntimeConfig;
use plexus::UnifiedManager;
use plexus_plugin_api::testing::{write_artifact, MockPluginBuilder};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const PUBLISHER: &str = "example";

pub struct Host {
    pub dir: TempDir,
    pub plugins: PathBuf,
    pub manager: Arc<UnifiedManager>,
}

pub fn host_config(dir: &Path, server: Option<&MockServer>, policy: UpdatePolicy) -> HostConfig {
    let mut remote = RemoteConfig::default().with_cache_dir(dir.join("cache"));
    remote.url_policy.allowed_schemes = vec!["http".to_string()];
    remote.download.retry_delay = Duration::from_millis(5);
    remote.download.max_retries = 1;
    remote.updates.policy = policy;

    let mut config = HostConfig {
        runtime: RuntimeConfig {
            staging_dir: Some(dir.join("staging")),
            ..RuntimeConfig::default()
        }
        .with_search_path(dir.join("plugins")),
        remote,
        ..HostConfig::default()
    };
    config.recovery.retry = RetryPolicy::new(1);
    if let Some(server) = server {
        config
            .repositories
            .push(Repository::new("main", &server.uri()).unwrap());
    }
    config
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn host(server: Option<&MockServer>, policy: UpdatePolicy) -> Host {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let plugins = dir.path().join("plugins");
    std::fs::create_dir_all(&plugins).unwrap();
    let manager = Arc::new(UnifiedManager::new(host_config(dir.path(), server, policy)).unwrap());
    Host {
        dir,
        plugins,
        manager,
    }
}

impl Host {
    /// Make `builder` instantiable by id
    pub fn register(&self, builder: &MockPluginBuilder) {
        let id = builder.metadata().id.clone();
        self.manager.local().register_static(id, builder.clone().factory());
    }

    /// Register `builder` and drop its artifact into the local search path
    pub fn install_local(&self, builder: &MockPluginBuilder) -> PathBuf {
        self.register(builder);
        write_artifact(&self.plugins, builder.metadata()).unwrap()
    }

    pub fn trust(&self, key: &Ed25519KeyPair) {
        self.manager
            .pipeline()
            .trust_store()
            .trust(&PublisherCertificate::new(
                PUBLISHER,
                SignatureAlgorithm::Ed25519,
                key.public_key().as_ref(),
                TrustLevel::Verified,
                365,
            ))
            .unwrap();
    }
}

pub fn keypair() -> Ed25519KeyPair {
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
    Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap()
}

pub fn artifact_bytes(builder: &MockPluginBuilder) -> Vec<u8> {
    let metadata = builder.metadata();
    format!("\x7fELF {} {}", metadata.id, metadata.version).into_bytes()
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Catalog entry describing `builder`'s artifact
pub fn entry(builder: &MockPluginBuilder, signed: bool) -> Value {
    let bytes = artifact_bytes(builder);
    let mut entry = RemotePluginMetadata::new(builder.metadata().clone());
    entry.checksum = Some(hex::encode(digest(&bytes)));
    entry.size = Some(bytes.len() as u64);
    entry.signed = signed;
    entry.publisher_id = signed.then(|| PUBLISHER.to_string());
    serde_json::to_value(entry).unwrap()
}

pub async fn mount_catalog(server: &MockServer, entries: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path("/catalog"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "plugins": entries })))
        .mount(server)
        .await;
}

/// Serve `builder`'s artifact, expecting exactly `downloads` requests when given
pub async fn mount_download(server: &MockServer, builder: &MockPluginBuilder, downloads: Option<u64>) {
    let metadata = builder.metadata();
    let mock = Mock::given(method("GET"))
        .and(path(format!("/plugin/{}/{}/download", metadata.id, metadata.version)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(artifact_bytes(builder)));
    match downloads {
        Some(n) => mock.expect(n).mount(server).await,
        None => mock.mount(server).await,
    }
}

pub async fn mount_signature(server: &MockServer, builder: &MockPluginBuilder, key: &Ed25519KeyPair) {
    let metadata = builder.metadata();
    let d = digest(&artifact_bytes(builder));
    let signature = DetachedSignature {
        publisher_id: PUBLISHER.to_string(),
        algorithm: SignatureAlgorithm::Ed25519,
        signature: BASE64.encode(key.sign(&d).as_ref()),
        checksum: Some(hex::encode(d)),
        signed_at: Utc::now(),
        certificate: None,
    };
    Mock::given(method("GET"))
        .and(path(format!("/plugin/{}/{}/signature", metadata.id, metadata.version)))
        .respond_with(ResponseTemplate::new(200).set_body_json(signature))
        .expect(1)
        .mount(server)
        .await;
}
