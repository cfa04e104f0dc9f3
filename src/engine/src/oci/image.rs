//! OCI image, index and artifact documents.
//!
//! Documents are built as `serde_json::Value` objects and serialized once;
//! the serialized bytes are what gets digested and pushed, so object keys
//! are always emitted in sorted order and identical inputs produce
//! identical digests.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use forge_core::arch::Architecture;
use forge_core::digest::Digest;
use forge_core::error::Result;
use forge_core::manifest::Manifest;

use crate::builddate::format_rfc3339;
use crate::resolve::ResolvedPackage;
use crate::rootfs::{Layer, LAYER_MEDIA_TYPE};

pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const EMPTY_MEDIA_TYPE: &str = "application/vnd.oci.empty.v1+json";

/// `PATH` for images whose manifest does not set one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Serialized content with its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub media_type: String,
    pub digest: Digest,
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(media_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            media_type: media_type.into(),
            digest: Digest::of(&data),
            data,
        }
    }

    fn from_json(media_type: &str, value: &Value) -> Result<Self> {
        Ok(Self::new(media_type, serde_json::to_vec(value)?))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// OCI content descriptor.
    pub fn descriptor(&self) -> Value {
        descriptor(&self.media_type, &self.digest, self.size())
    }
}

fn descriptor(media_type: &str, digest: &Digest, size: u64) -> Value {
    json!({
        "mediaType": media_type,
        "digest": digest.to_string(),
        "size": size
    })
}

fn platform(arch: Architecture) -> Value {
    let mut platform = json!({
        "architecture": arch.oci_architecture(),
        "os": "linux"
    });
    if let Some(variant) = arch.oci_variant() {
        platform["variant"] = json!(variant);
    }
    platform
}

/// The image of one architecture.
#[derive(Debug, Clone)]
pub struct ArchImage {
    pub arch: Architecture,
    pub config: Blob,
    pub layers: Vec<Layer>,
    pub manifest: Blob,
    /// Packages installed in this image
    pub packages: Vec<ResolvedPackage>,
}

impl ArchImage {
    pub fn digest(&self) -> &Digest {
        &self.manifest.digest
    }
}

/// Build the config and manifest of one architecture's image.
pub fn build_arch_image(
    manifest: &Manifest,
    arch: Architecture,
    layers: Vec<Layer>,
    build_date: &DateTime<Utc>,
    packages: Vec<ResolvedPackage>,
) -> Result<ArchImage> {
    let created = format_rfc3339(build_date);

    let mut environment: BTreeMap<String, String> = manifest.environment.clone();
    environment
        .entry("PATH".to_string())
        .or_insert_with(|| DEFAULT_PATH.to_string());
    let env: Vec<String> = environment
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let mut runtime = json!({ "Env": env });
    let entrypoint = manifest.entrypoint_argv();
    if !entrypoint.is_empty() {
        runtime["Entrypoint"] = json!(entrypoint);
    }
    let cmd = manifest.cmd_argv();
    if !cmd.is_empty() {
        runtime["Cmd"] = json!(cmd);
    }
    if let Some(work_dir) = &manifest.work_dir {
        runtime["WorkingDir"] = json!(work_dir);
    }
    if let Some(user) = &manifest.accounts.run_as {
        runtime["User"] = json!(user);
    }

    let mut config = json!({
        "architecture": arch.oci_architecture(),
        "os": "linux",
        "created": created,
        "config": runtime,
        "rootfs": {
            "type": "layers",
            "diff_ids": layers.iter().map(|l| l.diff_id.to_string()).collect::<Vec<_>>()
        },
        "history": layers.iter().map(|_| json!({
            "created": created,
            "created_by": "forge",
            "comment": "packages installed from declarative manifest"
        })).collect::<Vec<_>>()
    });
    if let Some(variant) = arch.oci_variant() {
        config["variant"] = json!(variant);
    }
    let config = Blob::from_json(CONFIG_MEDIA_TYPE, &config)?;

    let mut image_manifest = json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_MEDIA_TYPE,
        "config": config.descriptor(),
        "layers": layers
            .iter()
            .map(|l| descriptor(LAYER_MEDIA_TYPE, &l.digest, l.size()))
            .collect::<Vec<_>>()
    });
    if !manifest.annotations.is_empty() {
        image_manifest["annotations"] = json!(manifest.annotations);
    }
    let image_manifest = Blob::from_json(MANIFEST_MEDIA_TYPE, &image_manifest)?;

    tracing::debug!(
        arch = %arch,
        digest = %image_manifest.digest,
        config = %config.digest,
        "Built architecture image"
    );

    Ok(ArchImage {
        arch,
        config,
        layers,
        manifest: image_manifest,
        packages,
    })
}

/// Build the image index over `images`, in the order given.
pub fn build_index(images: &[ArchImage], annotations: &BTreeMap<String, String>) -> Result<Blob> {
    let manifests: Vec<Value> = images
        .iter()
        .map(|image| {
            let mut entry = image.manifest.descriptor();
            entry["platform"] = platform(image.arch);
            entry
        })
        .collect();

    let mut index = json!({
        "schemaVersion": 2,
        "mediaType": INDEX_MEDIA_TYPE,
        "manifests": manifests
    });
    if !annotations.is_empty() {
        index["annotations"] = json!(annotations);
    }
    Blob::from_json(INDEX_MEDIA_TYPE, &index)
}

/// The empty config blob artifacts point at.
pub fn empty_config() -> Blob {
    Blob::new(EMPTY_MEDIA_TYPE, b"{}".to_vec())
}

/// An artifact manifest carrying `payload` and referring to `subject`.
pub fn artifact_manifest(artifact_type: &str, payload: &Blob, subject: &Blob) -> Result<Blob> {
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_MEDIA_TYPE,
        "artifactType": artifact_type,
        "config": empty_config().descriptor(),
        "layers": [payload.descriptor()],
        "subject": subject.descriptor()
    });
    Blob::from_json(MANIFEST_MEDIA_TYPE, &manifest)
}
