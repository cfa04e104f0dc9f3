//! Publishing built images.
//!
//! Content is pushed in dependency order: blobs, then per-arch manifests,
//! then SBOM artifacts, and the image index last. Until the index lands
//! nothing refers to the new images, so a failure part-way leaves only
//! unreferenced content behind.

use std::future::Future;

use futures::future::try_join_all;

use forge_core::config::RetryConfig;
use forge_core::digest::Digest;
use forge_core::error::Result;

use crate::oci::image::{artifact_manifest, empty_config, ArchImage, Blob};
use crate::oci::reference::Repository;
use crate::oci::registry::RegistryTransport;
use crate::pipeline::BuildArtifacts;
use crate::rootfs::{Layer, LAYER_MEDIA_TYPE};
use crate::sbom::{INDEX_SBOM_KEY, SPDX_MEDIA_TYPE};

/// Pushes build artifacts to a registry with bounded retries.
pub struct Publisher<'a> {
    registry: &'a dyn RegistryTransport,
    retry: &'a RetryConfig,
    attach_sboms: bool,
}

impl<'a> Publisher<'a> {
    pub fn new(registry: &'a dyn RegistryTransport, retry: &'a RetryConfig) -> Self {
        Self {
            registry,
            retry,
            attach_sboms: true,
        }
    }

    /// Whether SBOMs are pushed as artifacts referring to their images.
    pub fn attach_sboms(mut self, attach: bool) -> Self {
        self.attach_sboms = attach;
        self
    }

    /// Push everything and return the digest of the image index.
    pub async fn publish(&self, repository: &Repository, build: &BuildArtifacts) -> Result<Digest> {
        tracing::info!(
            repository = %repository,
            images = build.images.len(),
            "Publishing image"
        );

        try_join_all(
            build
                .images
                .iter()
                .map(|image| self.push_image(repository, image)),
        )
        .await?;

        if self.attach_sboms {
            self.push_sboms(repository, build).await?;
        }

        let tag = repository.tag.as_deref();
        let digest = self
            .with_retry("push index", move || {
                self.registry.push_index(repository, &build.index, tag)
            })
            .await?;

        tracing::info!(
            repository = %repository,
            digest = %digest,
            "Published image index"
        );
        Ok(digest)
    }

    async fn push_image(&self, repository: &Repository, image: &ArchImage) -> Result<()> {
        let layers: Vec<Blob> = image.layers.iter().map(layer_blob).collect();
        let blobs = std::iter::once(&image.config).chain(layers.iter());
        try_join_all(blobs.map(|blob| self.push_blob(repository, blob))).await?;

        let manifest = &image.manifest;
        self.with_retry("push manifest", move || {
            self.registry.push_manifest(repository, manifest, None)
        })
        .await?;
        tracing::debug!(
            arch = %image.arch,
            digest = %image.manifest.digest,
            "Pushed architecture image"
        );
        Ok(())
    }

    async fn push_sboms(&self, repository: &Repository, build: &BuildArtifacts) -> Result<()> {
        self.push_blob(repository, &empty_config()).await?;

        let mut artifacts = Vec::new();
        for (key, sbom) in &build.sboms {
            let subject = if key == INDEX_SBOM_KEY {
                &build.index
            } else {
                match build.images.iter().find(|image| image.arch.as_str() == key) {
                    Some(image) => &image.manifest,
                    None => continue,
                }
            };
            artifacts.push((sbom, artifact_manifest(SPDX_MEDIA_TYPE, sbom, subject)?));
        }

        try_join_all(artifacts.iter().map(|(sbom, manifest)| async move {
            self.push_blob(repository, sbom).await?;
            self.with_retry("push sbom", move || {
                self.registry.push_manifest(repository, manifest, None)
            })
            .await
        }))
        .await?;
        tracing::debug!(count = artifacts.len(), "Attached SBOMs");
        Ok(())
    }

    async fn push_blob(&self, repository: &Repository, blob: &Blob) -> Result<()> {
        self.with_retry("push blob", move || self.registry.push_blob(repository, blob))
            .await
    }

    /// Run `op`, retrying transient failures with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient registry error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn layer_blob(layer: &Layer) -> Blob {
    Blob {
        media_type: LAYER_MEDIA_TYPE.to_string(),
        digest: layer.digest.clone(),
        data: layer.data.clone(),
    }
}
