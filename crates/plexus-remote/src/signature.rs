//! Publisher trust store and detached signature verification
//!
//! A publisher certificate is a JSON document stored as
//! `trust/<publisher-id>.crt`. It carries the publisher's public key, the
//! signature algorithm, a validity window and a trust level. Certificates may
//! be issued by another publisher: a signature may embed such a certificate,
//! and it is accepted when its issuer is in the trust store and the issuer's
//! key signs the certificate's canonical bytes.
//!
//! Artifacts are signed over the 32-byte SHA-256 digest of their bytes.

use crate::config::SecurityConfig;
use crate::fs::{read_json, write_json};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use plexus_core::{ErrorKind, PluginError, Result};
use ring::signature::{self, UnparsedPublicKey, VerificationAlgorithm};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const EXPIRY_WARNING_DAYS: i64 = 30;

/// How much a publisher is trusted, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Known but not trusted
    Untrusted,
    /// Community publisher
    Community,
    /// Identity verified publisher
    Verified,
    /// Official publisher
    Official,
}

/// Supported signature algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureAlgorithm {
    /// RSA PKCS#1 v1.5 with SHA-256; key is a DER `RSAPublicKey`
    RsaPkcs1Sha256,
    /// RSA-PSS with SHA-256; key is a DER `RSAPublicKey`
    RsaPssSha256,
    /// ECDSA P-256 with SHA-256, ASN.1 signature; key is an uncompressed point
    EcdsaP256Sha256,
    /// ECDSA P-384 with SHA-384, ASN.1 signature; key is an uncompressed point
    EcdsaP384Sha384,
    /// Ed25519; key is the raw 32-byte public key
    Ed25519,
}

impl SignatureAlgorithm {
    fn verification(self) -> &'static dyn VerificationAlgorithm {
        match self {
            SignatureAlgorithm::RsaPkcs1Sha256 => &signature::RSA_PKCS1_2048_8192_SHA256,
            SignatureAlgorithm::RsaPssSha256 => &signature::RSA_PSS_2048_8192_SHA256,
            SignatureAlgorithm::EcdsaP256Sha256 => &signature::ECDSA_P256_SHA256_ASN1,
            SignatureAlgorithm::EcdsaP384Sha384 => &signature::ECDSA_P384_SHA384_ASN1,
            SignatureAlgorithm::Ed25519 => &signature::ED25519,
        }
    }

    /// Verify `sig` over `message` with `public_key`
    pub fn verify(self, public_key: &[u8], message: &[u8], sig: &[u8]) -> bool {
        UnparsedPublicKey::new(self.verification(), public_key)
            .verify(message, sig)
            .is_ok()
    }
}

/// A trusted publisher's certificate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherCertificate {
    /// Publisher id
    pub publisher_id: String,
    /// Algorithm the publisher signs with
    pub algorithm: SignatureAlgorithm,
    /// Base64 public key
    pub public_key: String,
    /// Trust level
    pub trust_level: TrustLevel,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
    /// Revoked certificates never validate
    #[serde(default)]
    pub revoked: bool,
    /// Issuing publisher, when not self-issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Base64 issuer signature over [`signing_bytes`](Self::signing_bytes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_signature: Option<String>,
}

impl PublisherCertificate {
    /// Self-issued certificate valid from now for `days`
    pub fn new(
        publisher_id: impl Into<String>,
        algorithm: SignatureAlgorithm,
        public_key: &[u8],
        trust_level: TrustLevel,
        days: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            publisher_id: publisher_id.into(),
            algorithm,
            public_key: BASE64.encode(public_key),
            trust_level,
            not_before: now,
            not_after: now + ChronoDuration::days(days),
            revoked: false,
            issuer: None,
            issuer_signature: None,
        }
    }

    /// Decoded public key
    pub fn key_bytes(&self) -> Result<Vec<u8>> {
        BASE64.decode(&self.public_key).map_err(|e| {
            PluginError::invalid_format(format!(
                "Invalid public key for publisher '{}': {e}",
                self.publisher_id
            ))
        })
    }

    /// Canonical bytes an issuer signs
    pub fn signing_bytes(&self) -> Vec<u8> {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.publisher_id,
            serde_json::to_string(&self.algorithm).unwrap_or_default(),
            self.public_key,
            serde_json::to_string(&self.trust_level).unwrap_or_default(),
            self.not_before.to_rfc3339(),
            self.not_after.to_rfc3339(),
        )
        .into_bytes()
    }

    /// Whether `at` falls inside the validity window
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }
}

/// Detached signature document published next to an artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetachedSignature {
    /// Signing publisher
    pub publisher_id: String,
    /// Algorithm used
    pub algorithm: SignatureAlgorithm,
    /// Base64 signature over the artifact's SHA-256 digest
    pub signature: String,
    /// Lowercase hex SHA-256 the signer saw
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Signing time
    pub signed_at: DateTime<Utc>,
    /// Signer certificate when it is not in the trust store directly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<PublisherCertificate>,
}

/// Verification outcome level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    /// Signature verified
    Passed,
    /// Verified, with a caveat
    Warning,
    /// Signature did not verify
    Failed,
    /// Signer is not acceptable
    Blocked,
}

impl fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValidationLevel::Passed => "passed",
            ValidationLevel::Warning => "warning",
            ValidationLevel::Failed => "failed",
            ValidationLevel::Blocked => "blocked",
        })
    }
}

/// Outcome of verifying one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    /// Outcome
    pub level: ValidationLevel,
    /// Summary
    pub message: String,
    /// Supporting facts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
    /// When verification ran
    pub timestamp: DateTime<Utc>,
}

impl ValidationRecord {
    fn new(level: ValidationLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            details: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    fn detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }

    /// Record for an artifact that was not required to be signed
    pub fn unsigned() -> Self {
        Self::new(ValidationLevel::Warning, "Artifact is not signed")
    }

    /// Whether the artifact may be used
    pub fn is_acceptable(&self) -> bool {
        matches!(self.level, ValidationLevel::Passed | ValidationLevel::Warning)
    }

    /// Turn an unacceptable record into an error
    pub fn into_result(self) -> Result<Self> {
        let kind = match self.level {
            ValidationLevel::Passed | ValidationLevel::Warning => return Ok(self),
            ValidationLevel::Failed => ErrorKind::SignatureInvalid,
            ValidationLevel::Blocked => ErrorKind::UntrustedSource,
        };
        let mut err = PluginError::new(kind, &self.message);
        if !self.details.is_empty() {
            err = err.with_details(self.details.join("; "));
        }
        Err(err)
    }
}

/// Trusted publisher certificates under `trust/`
#[derive(Debug)]
pub struct TrustStore {
    dir: PathBuf,
    cache_time: std::time::Duration,
    cache: RwLock<HashMap<String, (Option<PublisherCertificate>, Instant)>>,
}

impl TrustStore {
    /// Open the store in `dir`, creating it if needed
    pub fn open(dir: impl Into<PathBuf>, cache_time: std::time::Duration) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            cache_time,
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn path_for(&self, publisher_id: &str) -> Result<PathBuf> {
        if publisher_id.is_empty()
            || publisher_id
                .chars()
                .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
            || publisher_id.starts_with('.')
        {
            return Err(PluginError::invalid_argument(format!(
                "Invalid publisher id '{publisher_id}'"
            )));
        }
        Ok(self.dir.join(format!("{publisher_id}.crt")))
    }

    /// Store directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Trust a publisher
    pub fn trust(&self, certificate: &PublisherCertificate) -> Result<()> {
        let path = self.path_for(&certificate.publisher_id)?;
        write_json(&path, certificate)?;
        self.cache.write().remove(&certificate.publisher_id);
        info!(publisher = %certificate.publisher_id, level = ?certificate.trust_level, "Publisher trusted");
        Ok(())
    }

    /// Stop trusting a publisher
    pub fn remove(&self, publisher_id: &str) -> Result<bool> {
        let path = self.path_for(publisher_id)?;
        self.cache.write().remove(publisher_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Mark a publisher's certificate revoked
    pub fn revoke(&self, publisher_id: &str) -> Result<()> {
        let mut cert = self
            .certificate(publisher_id)?
            .ok_or_else(|| PluginError::not_found(format!("Publisher '{publisher_id}'")))?;
        cert.revoked = true;
        self.trust(&cert)?;
        warn!(publisher = %publisher_id, "Publisher certificate revoked");
        Ok(())
    }

    /// A publisher's certificate, cached for the configured time
    pub fn certificate(&self, publisher_id: &str) -> Result<Option<PublisherCertificate>> {
        if let Some((cert, at)) = self.cache.read().get(publisher_id) {
            if at.elapsed() < self.cache_time {
                return Ok(cert.clone());
            }
        }
        let cert: Option<PublisherCertificate> = read_json(&self.path_for(publisher_id)?)?;
        self.cache
            .write()
            .insert(publisher_id.to_string(), (cert.clone(), Instant::now()));
        Ok(cert)
    }

    /// Ids of all trusted publishers
    pub fn publishers(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("crt") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Verifies detached signatures against a [`TrustStore`]
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    store: Arc<TrustStore>,
    config: SecurityConfig,
}

impl SignatureVerifier {
    /// Verifier over `store`
    pub fn new(store: Arc<TrustStore>, config: SecurityConfig) -> Self {
        Self { store, config }
    }

    /// The trust store
    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.store
    }

    /// Verify on a blocking worker
    pub async fn verify_async(
        &self,
        digest: [u8; 32],
        signature: DetachedSignature,
        expected_publisher: Option<String>,
    ) -> Result<ValidationRecord> {
        let verifier = self.clone();
        tokio::task::spawn_blocking(move || {
            verifier.verify(&digest, &signature, expected_publisher.as_deref())
        })
        .await
        .map_err(|e| PluginError::threading(format!("Signature verification task failed: {e}")))
    }

    /// Verify `signature` over an artifact with SHA-256 `digest`
    pub fn verify(
        &self,
        digest: &[u8; 32],
        signature: &DetachedSignature,
        expected_publisher: Option<&str>,
    ) -> ValidationRecord {
        let now = Utc::now();
        let publisher = signature.publisher_id.as_str();

        if let Some(expected) = expected_publisher {
            if expected != publisher {
                return ValidationRecord::new(ValidationLevel::Blocked, "Signed by an unexpected publisher")
                    .detail(format!("expected: {expected}"))
                    .detail(format!("signer: {publisher}"));
            }
        }

        let cert = match self.signer_certificate(signature, now) {
            Ok(cert) => cert,
            Err(record) => return record,
        };

        if cert.revoked {
            return ValidationRecord::new(ValidationLevel::Blocked, "Publisher certificate is revoked")
                .detail(format!("publisher: {publisher}"));
        }
        if cert.trust_level < self.config.minimum_trust_level {
            return ValidationRecord::new(ValidationLevel::Blocked, "Publisher trust level too low")
                .detail(format!("level: {:?}", cert.trust_level))
                .detail(format!("minimum: {:?}", self.config.minimum_trust_level));
        }
        if !cert.is_valid_at(now) {
            return ValidationRecord::new(ValidationLevel::Failed, "Publisher certificate is not valid now")
                .detail(format!("not_before: {}", cert.not_before))
                .detail(format!("not_after: {}", cert.not_after));
        }
        if cert.algorithm != signature.algorithm {
            return ValidationRecord::new(ValidationLevel::Failed, "Signature algorithm does not match certificate")
                .detail(format!("certificate: {:?}", cert.algorithm))
                .detail(format!("signature: {:?}", signature.algorithm));
        }

        let max_age = ChronoDuration::from_std(self.config.signature_max_age)
            .unwrap_or_else(|_| ChronoDuration::days(365));
        if now - signature.signed_at > max_age {
            return ValidationRecord::new(ValidationLevel::Failed, "Signature is too old")
                .detail(format!("signed_at: {}", signature.signed_at));
        }

        let digest_hex = hex::encode(digest);
        if let Some(checksum) = &signature.checksum {
            if !checksum.eq_ignore_ascii_case(&digest_hex) {
                return ValidationRecord::new(ValidationLevel::Failed, "Signed checksum does not match artifact")
                    .detail(format!("signed: {checksum}"))
                    .detail(format!("actual: {digest_hex}"));
            }
        }

        let (key, sig) = match (cert.key_bytes(), BASE64.decode(&signature.signature)) {
            (Ok(key), Ok(sig)) => (key, sig),
            (Err(e), _) => {
                return ValidationRecord::new(ValidationLevel::Failed, "Certificate key is malformed")
                    .detail(e.message().to_string())
            }
            (_, Err(e)) => {
                return ValidationRecord::new(ValidationLevel::Failed, "Signature is malformed")
                    .detail(e.to_string())
            }
        };

        if !signature.algorithm.verify(&key, digest, &sig) {
            warn!(publisher = %publisher, "Artifact signature did not verify");
            return ValidationRecord::new(ValidationLevel::Failed, "Signature does not verify")
                .detail(format!("publisher: {publisher}"))
                .detail(format!("sha256: {digest_hex}"));
        }

        debug!(publisher = %publisher, "Artifact signature verified");
        if cert.not_after - now < ChronoDuration::days(EXPIRY_WARNING_DAYS) {
            return ValidationRecord::new(ValidationLevel::Warning, "Signature verified; certificate expires soon")
                .detail(format!("not_after: {}", cert.not_after));
        }
        ValidationRecord::new(ValidationLevel::Passed, "Signature verified")
            .detail(format!("publisher: {publisher}"))
    }

    /// The signer's certificate: from the store, or an embedded one issued
    /// by a publisher in the store
    fn signer_certificate(
        &self,
        signature: &DetachedSignature,
        now: DateTime<Utc>,
    ) -> std::result::Result<PublisherCertificate, ValidationRecord> {
        let lookup = |id: &str| {
            self.store.certificate(id).map_err(|e| {
                ValidationRecord::new(ValidationLevel::Blocked, "Trust store lookup failed")
                    .detail(e.to_string())
            })
        };

        if let Some(cert) = lookup(&signature.publisher_id)? {
            return Ok(cert);
        }
        let Some(leaf) = signature.certificate.clone() else {
            return Err(ValidationRecord::new(ValidationLevel::Blocked, "Publisher is not trusted")
                .detail(format!("publisher: {}", signature.publisher_id)));
        };
        if leaf.publisher_id != signature.publisher_id {
            return Err(ValidationRecord::new(
                ValidationLevel::Blocked,
                "Embedded certificate belongs to another publisher",
            ));
        }

        let (Some(issuer_id), Some(issuer_sig)) = (&leaf.issuer, &leaf.issuer_signature) else {
            return Err(ValidationRecord::new(ValidationLevel::Blocked, "Publisher is not trusted")
                .detail(format!("publisher: {}", signature.publisher_id)));
        };
        let Some(issuer) = lookup(issuer_id)? else {
            return Err(ValidationRecord::new(ValidationLevel::Blocked, "Certificate issuer is not trusted")
                .detail(format!("issuer: {issuer_id}")));
        };
        if issuer.revoked || !issuer.is_valid_at(now) {
            return Err(ValidationRecord::new(ValidationLevel::Blocked, "Certificate issuer is not valid")
                .detail(format!("issuer: {issuer_id}")));
        }
        let verified = match (issuer.key_bytes(), BASE64.decode(issuer_sig)) {
            (Ok(key), Ok(sig)) => issuer.algorithm.verify(&key, &leaf.signing_bytes(), &sig),
            _ => false,
        };
        if !verified {
            return Err(ValidationRecord::new(ValidationLevel::Failed, "Certificate chain does not verify")
                .detail(format!("issuer: {issuer_id}")));
        }
        // A leaf never carries more trust than its issuer.
        let mut leaf = leaf;
        leaf.trust_level = leaf.trust_level.min(issuer.trust_level);
        Ok(leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;
    use ring::signature::{EcdsaKeyPair, Ed25519KeyPair, KeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
    use sha2::{Digest, Sha256};
    use std::time::Duration;

    fn digest(bytes: &[u8]) -> [u8; 32] {
        Sha256::digest(bytes).into()
    }

    fn ed25519() -> Ed25519KeyPair {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap()
    }

    fn setup(level: TrustLevel) -> (tempfile::TempDir, SignatureVerifier, Ed25519KeyPair) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TrustStore::open(dir.path().join("trust"), Duration::from_secs(60)).unwrap());
        let key = ed25519();
        store
            .trust(&PublisherCertificate::new(
                "example",
                SignatureAlgorithm::Ed25519,
                key.public_key().as_ref(),
                level,
                365,
            ))
            .unwrap();
        (dir, SignatureVerifier::new(store, SecurityConfig::default()), key)
    }

    fn sign(key: &Ed25519KeyPair, artifact: &[u8]) -> DetachedSignature {
        let d = digest(artifact);
        DetachedSignature {
            publisher_id: "example".to_string(),
            algorithm: SignatureAlgorithm::Ed25519,
            signature: BASE64.encode(key.sign(&d).as_ref()),
            checksum: Some(hex::encode(d)),
            signed_at: Utc::now(),
            certificate: None,
        }
    }

    #[test]
    fn test_valid_signature_passes() {
        let (_dir, verifier, key) = setup(TrustLevel::Verified);
        let record = verifier.verify(&digest(b"artifact"), &sign(&key, b"artifact"), Some("example"));
        assert_eq!(record.level, ValidationLevel::Passed);
        assert!(record.into_result().is_ok());
    }

    #[test]
    fn test_tampered_artifact_fails() {
        let (_dir, verifier, key) = setup(TrustLevel::Verified);
        let mut sig = sign(&key, b"artifact");
        sig.checksum = None;
        let record = verifier.verify(&digest(b"tampered"), &sig, None);
        assert_eq!(record.level, ValidationLevel::Failed);
        assert_eq!(record.into_result().unwrap_err().kind(), ErrorKind::SignatureInvalid);
    }

    #[test]
    fn test_unknown_and_revoked_publishers_blocked() {
        let (_dir, verifier, key) = setup(TrustLevel::Verified);
        let mut sig = sign(&key, b"artifact");
        sig.publisher_id = "stranger".to_string();
        let record = verifier.verify(&digest(b"artifact"), &sig, None);
        assert_eq!(record.level, ValidationLevel::Blocked);
        assert_eq!(record.into_result().unwrap_err().kind(), ErrorKind::UntrustedSource);

        verifier.trust_store().revoke("example").unwrap();
        let record = verifier.verify(&digest(b"artifact"), &sign(&key, b"artifact"), None);
        assert_eq!(record.level, ValidationLevel::Blocked);
    }

    #[test]
    fn test_trust_level_below_minimum_blocked() {
        let (_dir, verifier, key) = setup(TrustLevel::Untrusted);
        let record = verifier.verify(&digest(b"a"), &sign(&key, b"a"), None);
        assert_eq!(record.level, ValidationLevel::Blocked);
    }

    #[test]
    fn test_old_signature_fails() {
        let (_dir, verifier, key) = setup(TrustLevel::Verified);
        let mut sig = sign(&key, b"a");
        sig.signed_at = Utc::now() - ChronoDuration::days(400);
        assert_eq!(verifier.verify(&digest(b"a"), &sig, None).level, ValidationLevel::Failed);
    }

    #[test]
    fn test_ecdsa_p256() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TrustStore::open(dir.path(), Duration::from_secs(60)).unwrap());
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng).unwrap();
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref(), &rng).unwrap();
        store
            .trust(&PublisherCertificate::new(
                "ec-pub",
                SignatureAlgorithm::EcdsaP256Sha256,
                key.public_key().as_ref(),
                TrustLevel::Official,
                365,
            ))
            .unwrap();

        let d = digest(b"payload");
        let sig = DetachedSignature {
            publisher_id: "ec-pub".to_string(),
            algorithm: SignatureAlgorithm::EcdsaP256Sha256,
            signature: BASE64.encode(key.sign(&rng, &d).unwrap().as_ref()),
            checksum: None,
            signed_at: Utc::now(),
            certificate: None,
        };
        let verifier = SignatureVerifier::new(store, SecurityConfig::default());
        assert_eq!(verifier.verify(&d, &sig, None).level, ValidationLevel::Passed);
    }

    #[test]
    fn test_embedded_certificate_chains_to_store() {
        let (_dir, verifier, root) = setup(TrustLevel::Official);
        let leaf_key = ed25519();
        let mut leaf = PublisherCertificate::new(
            "team",
            SignatureAlgorithm::Ed25519,
            leaf_key.public_key().as_ref(),
            TrustLevel::Official,
            365,
        );
        leaf.issuer = Some("example".to_string());
        leaf.issuer_signature = Some(BASE64.encode(root.sign(&leaf.signing_bytes()).as_ref()));

        let d = digest(b"x");
        let sig = DetachedSignature {
            publisher_id: "team".to_string(),
            algorithm: SignatureAlgorithm::Ed25519,
            signature: BASE64.encode(leaf_key.sign(&d).as_ref()),
            checksum: None,
            signed_at: Utc::now(),
            certificate: Some(leaf.clone()),
        };
        assert_eq!(verifier.verify(&d, &sig, None).level, ValidationLevel::Passed);

        // Forged issuer signature
        let mut forged = sig.clone();
        let mut bad_leaf = leaf;
        bad_leaf.issuer_signature = Some(BASE64.encode(leaf_key.sign(b"nope").as_ref()));
        forged.certificate = Some(bad_leaf);
        assert_eq!(verifier.verify(&d, &forged, None).level, ValidationLevel::Failed);
    }

    #[test]
    fn test_publishers_listing() {
        let (_dir, verifier, _) = setup(TrustLevel::Community);
        assert_eq!(verifier.trust_store().publishers().unwrap(), vec!["example"]);
        assert!(verifier.trust_store().remove("example").unwrap());
        assert!(verifier.trust_store().certificate("example").unwrap().is_none());
        assert!(verifier.trust_store().path_for("../etc").is_err());
    }
}
