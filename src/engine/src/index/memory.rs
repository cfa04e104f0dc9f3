//! In-memory package source.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use forge_core::arch::Architecture;
use forge_core::error::{ForgeError, ResolutionFailure, Result};

use super::{IndexEntry, PackageIndex, PackageSource};
use crate::resolve::ResolvedPackage;

/// A package source backed by maps, for tests and offline builds.
///
/// Packages are registered per architecture with their index record and
/// `.apk` payload. An architecture can be marked unreachable to simulate a
/// repository outage for that architecture alone.
#[derive(Debug, Default)]
pub struct MemorySource {
    entries: DashMap<Architecture, Vec<IndexEntry>>,
    payloads: DashMap<(Architecture, String, String), Vec<u8>>,
    unreachable: DashSet<Architecture>,
    index_fetches: AtomicUsize,
    package_fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a package for `arch`.
    pub fn add_package(&self, arch: Architecture, entry: IndexEntry, payload: Vec<u8>) {
        let key = (
            arch,
            entry.repository.clone(),
            format!("{}-{}.apk", entry.name, entry.version),
        );
        self.payloads.insert(key, payload);
        self.entries.entry(arch).or_default().push(entry);
    }

    /// Make every index fetch for `arch` fail.
    pub fn set_unreachable(&self, arch: Architecture) {
        self.unreachable.insert(arch);
    }

    /// Number of index fetches served so far.
    pub fn index_fetches(&self) -> usize {
        self.index_fetches.load(Ordering::SeqCst)
    }

    /// Number of package downloads served so far.
    pub fn package_fetches(&self) -> usize {
        self.package_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PackageSource for MemorySource {
    async fn fetch_index(
        &self,
        repositories: &[String],
        _keyring: &[String],
        arch: Architecture,
    ) -> Result<PackageIndex> {
        self.index_fetches.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.contains(&arch) {
            return Err(ForgeError::ResolutionError {
                kind: ResolutionFailure::Unreachable,
                message: format!("repositories unreachable for {}", arch),
            });
        }

        let entries = self
            .entries
            .get(&arch)
            .map(|entries| {
                // Keep the caller's repository order, like a merged remote index
                repositories
                    .iter()
                    .flat_map(|repo| entries.iter().filter(move |e| &e.repository == repo))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(PackageIndex { entries })
    }

    async fn fetch_package(&self, package: &ResolvedPackage) -> Result<Vec<u8>> {
        self.package_fetches.fetch_add(1, Ordering::SeqCst);
        let key = (
            package.arch,
            package.repository.clone(),
            package.file_name(),
        );
        self.payloads
            .get(&key)
            .map(|payload| payload.clone())
            .ok_or_else(|| ForgeError::FetchError {
                url: format!(
                    "{}/{}/{}",
                    package.repository,
                    package.arch.apk_name(),
                    package.file_name()
                ),
                message: "package not found".to_string(),
            })
    }
}
