//! The build pipeline.
//!
//! Resolution runs for every architecture concurrently and must succeed
//! everywhere before the build date is fixed. Assembly then fans out again,
//! one task per architecture, and all images are joined before the index is
//! built. The first failure aborts the remaining tasks.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tokio::task::JoinSet;

use forge_core::arch::Architecture;
use forge_core::error::{ForgeError, Result};
use forge_core::manifest::Manifest;

use crate::builddate::{format_rfc3339, resolve_build_date};
use crate::index::PackageSource;
use crate::oci::image::{build_arch_image, build_index, ArchImage, Blob};
use crate::resolve::{resolve_packages, ResolvedPackage};
use crate::rootfs::RootfsAssembler;
use crate::sbom::{generate_sboms, SbomSet};

/// Everything a successful build produced, ready to publish.
#[derive(Debug, Clone)]
pub struct BuildArtifacts {
    pub build_date: DateTime<Utc>,
    /// Per-architecture images, in architecture order
    pub images: Vec<ArchImage>,
    pub index: Blob,
    pub sboms: SbomSet,
}

/// Build every architecture of `manifest` against `source`.
///
/// `manifest` is expected to have provider defaults applied already.
pub async fn build(source: Arc<dyn PackageSource>, manifest: &Manifest) -> Result<BuildArtifacts> {
    let archs = if manifest.archs.is_empty() {
        vec![Architecture::Amd64]
    } else {
        manifest.archs.clone()
    };
    tracing::info!(
        archs = ?archs.iter().map(|a| a.as_str()).collect::<Vec<_>>(),
        packages = manifest.contents.packages.len(),
        "Starting build"
    );

    let resolved = try_join_all(archs.iter().map(|&arch| {
        let source = source.clone();
        async move {
            let packages = resolve_packages(&*source, manifest, arch).await?;
            Ok::<_, ForgeError>((arch, packages))
        }
    }))
    .await?;

    let build_date = resolve_build_date(resolved.iter().map(|(_, packages)| packages.as_slice()));
    tracing::info!(build_date = %format_rfc3339(&build_date), "Resolved build date");

    let manifest = Arc::new(manifest.clone());
    let mut join_set = JoinSet::new();
    for (arch, packages) in resolved {
        let source = source.clone();
        let manifest = manifest.clone();
        join_set.spawn(async move {
            let image = build_arch(source, manifest, arch, packages, build_date)
                .await
                .map_err(|e| ForgeError::build(arch.as_str(), e))?;
            Ok::<_, ForgeError>((arch, image))
        });
    }

    let mut images = BTreeMap::new();
    while let Some(joined) = join_set.join_next().await {
        let joined = joined
            .map_err(|e| ForgeError::AssemblyError(format!("build task failed: {}", e)))
            .and_then(|result| result);
        match joined {
            Ok((arch, image)) => {
                images.insert(arch, image);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Architecture build failed, aborting build");
                join_set.abort_all();
                return Err(e);
            }
        }
    }
    let images: Vec<ArchImage> = images.into_values().collect();

    let index = build_index(&images, &manifest.annotations)?;
    let sboms = generate_sboms(&images, &index, &build_date)?;
    tracing::info!(
        digest = %index.digest,
        images = images.len(),
        "Built image index"
    );

    Ok(BuildArtifacts {
        build_date,
        images,
        index,
        sboms,
    })
}

async fn build_arch(
    source: Arc<dyn PackageSource>,
    manifest: Arc<Manifest>,
    arch: Architecture,
    packages: Vec<ResolvedPackage>,
    build_date: DateTime<Utc>,
) -> Result<ArchImage> {
    let payloads = try_join_all(packages.iter().map(|package| source.fetch_package(package))).await?;
    tracing::debug!(arch = %arch, packages = payloads.len(), "Fetched packages");

    let contents: Vec<(ResolvedPackage, Vec<u8>)> = packages.into_iter().zip(payloads).collect();
    tokio::task::spawn_blocking(move || {
        let layers = RootfsAssembler::new(&manifest, build_date).build_layers(&contents)?;
        let packages = contents.into_iter().map(|(package, _)| package).collect();
        build_arch_image(&manifest, arch, layers, &build_date, packages)
    })
    .await
    .map_err(|e| ForgeError::AssemblyError(format!("assembly task failed: {}", e)))?
}
