//! Registry transport.
//!
//! [`RegistryTransport`] is the narrow push/resolve surface the publisher
//! and the lifecycle controller need. [`OciRegistry`] speaks the
//! distribution protocol through the `oci-distribution` crate;
//! [`MemoryRegistry`] keeps everything in maps and counts writes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};

use forge_core::digest::Digest;
use forge_core::error::{ForgeError, PublishFailure, Result};

use super::image::{Blob, INDEX_MEDIA_TYPE};
use super::reference::Repository;

/// Push and resolve primitives over a registry.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Upload a blob. Pushing content that already exists is a no-op.
    async fn push_blob(&self, repository: &Repository, blob: &Blob) -> Result<()>;

    /// Upload a manifest under its digest, or under `tag` when given.
    async fn push_manifest(
        &self,
        repository: &Repository,
        manifest: &Blob,
        tag: Option<&str>,
    ) -> Result<Digest>;

    /// Upload an image index; same as a manifest push.
    async fn push_index(
        &self,
        repository: &Repository,
        index: &Blob,
        tag: Option<&str>,
    ) -> Result<Digest> {
        self.push_manifest(repository, index, tag).await
    }

    /// Resolve a tag or digest to the manifest digest the registry serves.
    async fn resolve_digest(&self, repository: &Repository, reference: &str) -> Result<Digest>;
}

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if not set.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();

        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// A registry reached over the OCI distribution protocol.
pub struct OciRegistry {
    client: Client,
    auth: RegistryAuth,
}

impl OciRegistry {
    /// Create a registry client with anonymous authentication.
    pub fn new() -> Self {
        Self::with_auth(RegistryAuth::anonymous())
    }

    /// Create a registry client with the given authentication.
    pub fn with_auth(auth: RegistryAuth) -> Self {
        Self::with_protocol(auth, ClientProtocol::Https)
    }

    /// Plain HTTP, for local registries.
    pub fn insecure(auth: RegistryAuth) -> Self {
        Self::with_protocol(auth, ClientProtocol::Http)
    }

    fn with_protocol(auth: RegistryAuth, protocol: ClientProtocol) -> Self {
        let config = ClientConfig {
            protocol,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    fn reference(repository: &Repository, reference: &str) -> Reference {
        if reference.starts_with("sha256:") {
            Reference::with_digest(
                repository.registry.clone(),
                repository.path.clone(),
                reference.to_string(),
            )
        } else {
            Reference::with_tag(
                repository.registry.clone(),
                repository.path.clone(),
                reference.to_string(),
            )
        }
    }

    async fn authenticate(&self, repository: &Repository, reference: &Reference) -> Result<()> {
        self.client
            .auth(reference, &self.auth.to_oci_auth(), RegistryOperation::Push)
            .await
            .map_err(|e| publish_error(repository, "Failed to authenticate", e))?;
        Ok(())
    }
}

impl Default for OciRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a distribution error onto the publish failure taxonomy.
fn classify(err: &OciDistributionError) -> PublishFailure {
    match err {
        OciDistributionError::AuthenticationFailure(_)
        | OciDistributionError::UnauthorizedError { .. } => PublishFailure::Unauthorized,
        OciDistributionError::ImageManifestNotFoundError(_) => PublishFailure::NotFound,
        OciDistributionError::ServerError { code, .. } if *code >= 500 => PublishFailure::Transient,
        OciDistributionError::ServerError { code: 404, .. } => PublishFailure::NotFound,
        OciDistributionError::ServerError { code: 401 | 403, .. } => PublishFailure::Unauthorized,
        OciDistributionError::RequestError(e) if e.is_timeout() || e.is_connect() => {
            PublishFailure::Transient
        }
        OciDistributionError::IoError(_) => PublishFailure::Transient,
        _ => PublishFailure::Rejected,
    }
}

fn publish_error(repository: &Repository, action: &str, err: OciDistributionError) -> ForgeError {
    ForgeError::PublishError {
        registry: repository.registry.clone(),
        kind: classify(&err),
        message: format!("{} {}: {}", action, repository.name(), err),
    }
}

/// Content type header value, with the concrete header type inferred at the call site.
fn content_type<T: std::str::FromStr>(media_type: &str) -> Option<T> {
    media_type.parse().ok()
}

#[async_trait]
impl RegistryTransport for OciRegistry {
    async fn push_blob(&self, repository: &Repository, blob: &Blob) -> Result<()> {
        let reference = Self::reference(repository, &blob.digest.to_string());
        self.authenticate(repository, &reference).await?;
        tracing::debug!(
            repository = %repository.name(),
            digest = %blob.digest,
            size = blob.size(),
            "Pushing blob"
        );
        self.client
            .push_blob(&reference, &blob.data, &blob.digest.to_string())
            .await
            .map_err(|e| publish_error(repository, "Failed to push blob to", e))?;
        Ok(())
    }

    async fn push_manifest(
        &self,
        repository: &Repository,
        manifest: &Blob,
        tag: Option<&str>,
    ) -> Result<Digest> {
        let target = tag
            .map(str::to_string)
            .unwrap_or_else(|| manifest.digest.to_string());
        let reference = Self::reference(repository, &target);
        self.authenticate(repository, &reference).await?;

        let header = content_type(&manifest.media_type).ok_or_else(|| ForgeError::PublishError {
            registry: repository.registry.clone(),
            kind: PublishFailure::Rejected,
            message: format!("invalid media type '{}'", manifest.media_type),
        })?;
        tracing::debug!(
            repository = %repository.name(),
            reference = %target,
            media_type = %manifest.media_type,
            "Pushing manifest"
        );
        self.client
            .push_manifest_raw(&reference, manifest.data.clone(), header)
            .await
            .map_err(|e| publish_error(repository, "Failed to push manifest to", e))?;
        Ok(manifest.digest.clone())
    }

    async fn resolve_digest(&self, repository: &Repository, reference: &str) -> Result<Digest> {
        let oci_ref = Self::reference(repository, reference);
        let digest = self
            .client
            .fetch_manifest_digest(&oci_ref, &self.auth.to_oci_auth())
            .await
            .map_err(|e| publish_error(repository, "Failed to resolve", e))?;
        Digest::parse(&digest)
    }
}

/// An in-memory registry.
///
/// Every push is counted, including pushes of content already present, so
/// tests can assert that a no-op update issued no writes at all. Failures
/// can be scripted per call to exercise retries. Like a real registry it
/// refuses manifests whose blobs or child manifests were not pushed first.
/// A `subject` may refer to content that does not exist yet.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    blobs: DashMap<(String, Digest), Vec<u8>>,
    manifests: DashMap<(String, Digest), Blob>,
    tags: DashMap<(String, String), Digest>,
    writes: AtomicUsize,
    reads: AtomicUsize,
    scripted_failures: Mutex<Vec<PublishFailure>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next pushes with the given failures, in order.
    pub fn fail_next(&self, failures: &[PublishFailure]) {
        if let Ok(mut scripted) = self.scripted_failures.lock() {
            scripted.extend_from_slice(failures);
        }
    }

    /// Number of push calls served or failed so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of resolve calls so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn has_blob(&self, repository: &Repository, digest: &Digest) -> bool {
        self.blobs.contains_key(&(repository.name(), digest.clone()))
    }

    pub fn blob(&self, repository: &Repository, digest: &Digest) -> Option<Vec<u8>> {
        self.blobs
            .get(&(repository.name(), digest.clone()))
            .map(|data| data.clone())
    }

    pub fn manifest(&self, repository: &Repository, digest: &Digest) -> Option<Blob> {
        self.manifests
            .get(&(repository.name(), digest.clone()))
            .map(|m| m.clone())
    }

    /// Manifests stored in `repository` with the given media type.
    pub fn manifests_of_type(&self, repository: &Repository, media_type: &str) -> Vec<Blob> {
        let name = repository.name();
        let mut found: Vec<Blob> = self
            .manifests
            .iter()
            .filter(|entry| entry.key().0 == name && entry.value().media_type == media_type)
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| a.digest.cmp(&b.digest));
        found
    }

    /// Image indexes stored in `repository`.
    pub fn indexes(&self, repository: &Repository) -> Vec<Blob> {
        self.manifests_of_type(repository, INDEX_MEDIA_TYPE)
    }

    /// Drop a manifest, as a registry garbage collection would.
    pub fn delete_manifest(&self, repository: &Repository, digest: &Digest) {
        let name = repository.name();
        self.manifests.remove(&(name.clone(), digest.clone()));
        self.tags.retain(|(repo, _), target| !(repo == &name && *target == *digest));
    }

    /// First descriptor of `manifest` naming content this repository lacks.
    fn missing_reference(&self, name: &str, manifest: &Blob) -> Option<String> {
        let document: serde_json::Value = serde_json::from_slice(&manifest.data).ok()?;
        let digests = |value: &serde_json::Value| -> Vec<Digest> {
            let descriptors: Vec<&serde_json::Value> = match value {
                serde_json::Value::Array(items) => items.iter().collect(),
                serde_json::Value::Object(_) => vec![value],
                _ => Vec::new(),
            };
            descriptors
                .into_iter()
                .filter_map(|d| d["digest"].as_str())
                .filter_map(|d| Digest::parse(d).ok())
                .collect()
        };

        let blobs = ["config", "layers", "blobs"]
            .iter()
            .flat_map(|key| digests(&document[*key]));
        for digest in blobs {
            if !self.blobs.contains_key(&(name.to_string(), digest.clone())) {
                return Some(format!("blob {}", digest));
            }
        }
        for digest in digests(&document["manifests"]) {
            if !self.manifests.contains_key(&(name.to_string(), digest.clone())) {
                return Some(format!("manifest {}", digest));
            }
        }
        None
    }

    fn begin_write(&self, repository: &Repository) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let failure = match self.scripted_failures.lock() {
            Ok(mut scripted) if !scripted.is_empty() => Some(scripted.remove(0)),
            _ => None,
        };
        match failure {
            Some(kind) => Err(ForgeError::PublishError {
                registry: repository.registry.clone(),
                kind,
                message: format!("scripted {} failure", kind),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RegistryTransport for MemoryRegistry {
    async fn push_blob(&self, repository: &Repository, blob: &Blob) -> Result<()> {
        self.begin_write(repository)?;
        self.blobs
            .insert((repository.name(), blob.digest.clone()), blob.data.clone());
        Ok(())
    }

    async fn push_manifest(
        &self,
        repository: &Repository,
        manifest: &Blob,
        tag: Option<&str>,
    ) -> Result<Digest> {
        self.begin_write(repository)?;
        let name = repository.name();
        if let Some(missing) = self.missing_reference(&name, manifest) {
            return Err(ForgeError::PublishError {
                registry: repository.registry.clone(),
                kind: PublishFailure::Rejected,
                message: format!("{} refers to unknown {}", manifest.digest, missing),
            });
        }
        self.manifests
            .insert((name.clone(), manifest.digest.clone()), manifest.clone());
        if let Some(tag) = tag {
            self.tags
                .insert((name, tag.to_string()), manifest.digest.clone());
        }
        Ok(manifest.digest.clone())
    }

    async fn resolve_digest(&self, repository: &Repository, reference: &str) -> Result<Digest> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let name = repository.name();
        let found = match Digest::parse(reference) {
            Ok(digest) => self
                .manifests
                .contains_key(&(name.clone(), digest.clone()))
                .then_some(digest),
            Err(_) => self
                .tags
                .get(&(name.clone(), reference.to_string()))
                .map(|d| d.clone()),
        };
        found.ok_or_else(|| ForgeError::PublishError {
            registry: repository.registry.clone(),
            kind: PublishFailure::NotFound,
            message: format!("{}@{} not found", name, reference),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::image::MANIFEST_MEDIA_TYPE;

    fn repo() -> Repository {
        Repository::parse("registry.example.com/forge/base").unwrap()
    }

    #[test]
    fn test_registry_auth_anonymous() {
        let auth = RegistryAuth::anonymous();
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Anonymous));
    }

    #[test]
    fn test_registry_auth_basic() {
        let auth = RegistryAuth::basic("user", "pass");
        assert_eq!(auth.username.as_deref(), Some("user"));
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Basic(_, _)));
    }

    #[test]
    fn test_oci_reference_by_digest_and_tag() {
        let digest = Digest::of(b"x").to_string();
        let by_digest = OciRegistry::reference(&repo(), &digest);
        assert_eq!(by_digest.digest(), Some(digest.as_str()));
        let by_tag = OciRegistry::reference(&repo(), "latest");
        assert_eq!(by_tag.tag(), Some("latest"));
        assert_eq!(by_tag.registry(), "registry.example.com");
        assert_eq!(by_tag.repository(), "forge/base");
    }

    #[test]
    fn test_classify_errors() {
        assert_eq!(
            classify(&OciDistributionError::AuthenticationFailure("denied".into())),
            PublishFailure::Unauthorized
        );
        assert_eq!(
            classify(&OciDistributionError::ImageManifestNotFoundError("gone".into())),
            PublishFailure::NotFound
        );
        assert_eq!(
            classify(&OciDistributionError::ServerError {
                code: 503,
                url: "u".into(),
                message: "busy".into()
            }),
            PublishFailure::Transient
        );
        assert_eq!(
            classify(&OciDistributionError::ServerError {
                code: 400,
                url: "u".into(),
                message: "bad".into()
            }),
            PublishFailure::Rejected
        );
    }

    #[tokio::test]
    async fn test_memory_registry_push_and_resolve() {
        let registry = MemoryRegistry::new();
        let manifest = Blob::new(MANIFEST_MEDIA_TYPE, b"{}".to_vec());
        let digest = registry
            .push_manifest(&repo(), &manifest, Some("latest"))
            .await
            .unwrap();
        assert_eq!(digest, manifest.digest);
        assert_eq!(registry.resolve_digest(&repo(), "latest").await.unwrap(), digest);
        assert_eq!(
            registry.resolve_digest(&repo(), &digest.to_string()).await.unwrap(),
            digest
        );
        assert_eq!(registry.writes(), 1);

        registry.delete_manifest(&repo(), &digest);
        let err = registry.resolve_digest(&repo(), "latest").await.unwrap_err();
        assert!(matches!(
            err,
            ForgeError::PublishError {
                kind: PublishFailure::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_memory_registry_rejects_dangling_references() {
        let registry = MemoryRegistry::new();
        let layer = Blob::new("application/octet-stream", b"layer".to_vec());
        let config = Blob::new("application/octet-stream", b"config".to_vec());
        let manifest = Blob::new(
            MANIFEST_MEDIA_TYPE,
            serde_json::to_vec(&serde_json::json!({
                "config": config.descriptor(),
                "layers": [layer.descriptor()],
            }))
            .unwrap(),
        );
        let index = Blob::new(
            INDEX_MEDIA_TYPE,
            serde_json::to_vec(&serde_json::json!({ "manifests": [manifest.descriptor()] }))
                .unwrap(),
        );

        // index before its manifest
        let err = registry.push_index(&repo(), &index, None).await.unwrap_err();
        assert!(matches!(
            err,
            ForgeError::PublishError {
                kind: PublishFailure::Rejected,
                ..
            }
        ));
        // manifest before its layer
        registry.push_blob(&repo(), &config).await.unwrap();
        let err = registry.push_manifest(&repo(), &manifest, None).await.unwrap_err();
        assert!(err.to_string().contains(&layer.digest.to_string()));

        registry.push_blob(&repo(), &layer).await.unwrap();
        registry.push_manifest(&repo(), &manifest, None).await.unwrap();
        registry.push_index(&repo(), &index, Some("latest")).await.unwrap();
        assert_eq!(
            registry.resolve_digest(&repo(), "latest").await.unwrap(),
            index.digest
        );
    }

    #[tokio::test]
    async fn test_memory_registry_scripted_failures() {
        let registry = MemoryRegistry::new();
        registry.fail_next(&[PublishFailure::Transient]);
        let blob = Blob::new("application/octet-stream", b"data".to_vec());
        assert!(registry.push_blob(&repo(), &blob).await.unwrap_err().is_transient());
        registry.push_blob(&repo(), &blob).await.unwrap();
        assert!(registry.has_blob(&repo(), &blob.digest));
        assert_eq!(registry.writes(), 2);
    }
}
