//! Forge Engine - reproducible multi-arch OCI image builds.
//!
//! Resolves APK packages per architecture, assembles deterministic root
//! filesystems, builds an OCI image index with one SBOM per architecture,
//! publishes it to a registry and tracks the result for an orchestration
//! layer through [`BuildController`].

#![allow(clippy::result_large_err)]

pub mod builddate;
pub mod index;
pub mod lifecycle;
pub mod oci;
pub mod pipeline;
pub mod publish;
pub mod resolve;
pub mod rootfs;
pub mod sbom;
pub mod version;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

// Re-export common types
pub use builddate::{format_rfc3339, resolve_build_date};
pub use index::{HttpPackageSource, IndexEntry, MemorySource, PackageIndex, PackageSource};
pub use lifecycle::{BuildController, BuildOutcome, BuildRecord, Plan};
pub use oci::{MemoryRegistry, OciRegistry, RegistryAuth, RegistryTransport, Repository};
pub use pipeline::{build, BuildArtifacts};
pub use publish::Publisher;
pub use resolve::{PackageResolver, ResolvedPackage};
pub use rootfs::{FsTree, Layer, RootfsAssembler};
pub use sbom::{SbomSet, SPDX_MEDIA_TYPE};

/// Forge Engine version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
