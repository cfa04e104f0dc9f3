//! Package repository indexes.
//!
//! Repositories publish an `APKINDEX.tar.gz` per architecture. Each index
//! is a list of package records; the `t:` field carries the package build
//! time that feeds the image build date.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐   fetch_index    ┌──────────────────────────┐
//! │   PackageResolver  │ ───────────────▶ │  PackageSource (trait)   │
//! └────────────────────┘                  │  ├── HttpPackageSource   │
//! ┌────────────────────┐   fetch_package  │  └── MemorySource        │
//! │  RootfsAssembler   │ ───────────────▶ │                          │
//! └────────────────────┘                  └──────────────────────────┘
//! ```

pub mod archive;
mod http;
mod memory;

use async_trait::async_trait;

use forge_core::arch::Architecture;
use forge_core::error::{ForgeError, Result};

use crate::resolve::ResolvedPackage;

pub use archive::Keyring;
pub use http::HttpPackageSource;
pub use memory::MemorySource;

/// One package record from a repository index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexEntry {
    /// Package name (`P:`)
    pub name: String,
    /// Package version (`V:`)
    pub version: String,
    /// Architecture as written in the index (`A:`)
    pub arch: String,
    /// Compressed package size (`S:`)
    pub size: u64,
    /// Installed size (`I:`)
    pub installed_size: u64,
    /// Description (`T:`)
    pub description: String,
    /// Upstream URL (`U:`)
    pub url: String,
    /// License (`L:`)
    pub license: String,
    /// Origin (source package) name (`o:`)
    pub origin: String,
    /// Maintainer (`m:`)
    pub maintainer: String,
    /// Build time in seconds since the epoch (`t:`)
    pub build_time: Option<i64>,
    /// Source commit (`c:`)
    pub commit: String,
    /// Control segment checksum, `Q1` + base64 SHA-1 (`C:`)
    pub checksum: String,
    /// Dependencies (`D:`), `!name` marks a conflict
    pub depends: Vec<String>,
    /// Provided names (`p:`), optionally `name=version`
    pub provides: Vec<String>,
    /// Install-if conditions (`i:`)
    pub install_if: Vec<String>,
    /// Priority among providers of the same name (`k:`)
    pub provider_priority: u64,
    /// Repository the record was read from
    pub repository: String,
}

/// The merged index of one or more repositories for one architecture.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageIndex {
    pub entries: Vec<IndexEntry>,
}

impl PackageIndex {
    /// Parse APKINDEX text.
    ///
    /// Records are separated by blank lines; every line is `K:value`.
    pub fn parse_apkindex(text: &str, repository: &str) -> Result<Self> {
        let mut entries = Vec::new();
        let mut current = IndexEntry {
            repository: repository.to_string(),
            ..Default::default()
        };
        let mut has_fields = false;

        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                if has_fields {
                    entries.push(finish_entry(current, repository)?);
                    current = IndexEntry {
                        repository: repository.to_string(),
                        ..Default::default()
                    };
                    has_fields = false;
                }
                continue;
            }

            let (key, value) = line.split_once(':').ok_or_else(|| ForgeError::FetchError {
                url: repository.to_string(),
                message: format!("APKINDEX line {}: missing ':' in '{}'", line_no + 1, line),
            })?;
            has_fields = true;
            match key {
                "P" => current.name = value.to_string(),
                "V" => current.version = value.to_string(),
                "A" => current.arch = value.to_string(),
                "S" => current.size = value.parse().unwrap_or(0),
                "I" => current.installed_size = value.parse().unwrap_or(0),
                "T" => current.description = value.to_string(),
                "U" => current.url = value.to_string(),
                "L" => current.license = value.to_string(),
                "o" => current.origin = value.to_string(),
                "m" => current.maintainer = value.to_string(),
                "t" => current.build_time = value.parse().ok(),
                "c" => current.commit = value.to_string(),
                "C" => current.checksum = value.to_string(),
                "D" => current.depends = split_words(value),
                "p" => current.provides = split_words(value),
                "i" => current.install_if = split_words(value),
                "k" => current.provider_priority = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        if has_fields {
            entries.push(finish_entry(current, repository)?);
        }

        Ok(Self { entries })
    }

    /// Concatenate indexes, keeping repository order.
    pub fn merge(indexes: Vec<PackageIndex>) -> Self {
        Self {
            entries: indexes.into_iter().flat_map(|i| i.entries).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn finish_entry(entry: IndexEntry, repository: &str) -> Result<IndexEntry> {
    if entry.name.is_empty() || entry.version.is_empty() {
        return Err(ForgeError::FetchError {
            url: repository.to_string(),
            message: format!(
                "APKINDEX record without name or version (P:{} V:{})",
                entry.name, entry.version
            ),
        });
    }
    Ok(entry)
}

fn split_words(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

/// Where package indexes and package payloads come from.
#[async_trait]
pub trait PackageSource: Send + Sync {
    /// Fetch, verify and merge the indexes of `repositories` for `arch`.
    async fn fetch_index(
        &self,
        repositories: &[String],
        keyring: &[String],
        arch: Architecture,
    ) -> Result<PackageIndex>;

    /// Download the `.apk` payload of a resolved package.
    async fn fetch_package(&self, package: &ResolvedPackage) -> Result<Vec<u8>>;

    /// Drop cached indexes so the next build sees current repository state.
    fn refresh(&self) {}
}
