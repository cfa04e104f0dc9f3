use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::arch::Architecture;
use crate::error::{ForgeError, Result};
use crate::manifest::Manifest;

/// Provider-level configuration.
///
/// Holds the defaults applied to every manifest the controller builds, plus
/// publishing behaviour. Constructed once and handed to the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Repositories added to every manifest
    pub repositories: Vec<String>,

    /// Keyring entries added to every manifest
    pub keyring: Vec<String>,

    /// Architectures used when a manifest declares none
    #[serde(deserialize_with = "crate::arch::deserialize_list")]
    pub archs: Vec<Architecture>,

    /// Packages added to every manifest
    pub packages: Vec<String>,

    /// Annotations added to every image (manifest annotations win)
    pub annotations: BTreeMap<String, String>,

    /// Registry retry policy
    pub retry: RetryConfig,

    /// Publishing options
    pub publish: PublishConfig,
}

impl ProviderConfig {
    /// Parse configuration from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| ForgeError::ConfigError(e.to_string()))
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ForgeError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Merge provider defaults into a manifest.
    ///
    /// Repositories, keyring entries and packages are unions with the
    /// defaults first. Architectures and annotations declared by the
    /// manifest replace the defaults; an empty manifest list never
    /// suppresses them. When neither side names an architecture the
    /// build targets `amd64`.
    pub fn apply(&self, manifest: &Manifest) -> Manifest {
        let mut merged = manifest.clone();

        merged.contents.repositories =
            union(&self.repositories, &manifest.contents.repositories);
        merged.contents.keyring = union(&self.keyring, &manifest.contents.keyring);
        merged.contents.packages = union(&self.packages, &manifest.contents.packages);

        if merged.archs.is_empty() {
            merged.archs = if self.archs.is_empty() {
                vec![Architecture::Amd64]
            } else {
                self.archs.clone()
            };
        }

        let mut annotations = self.annotations.clone();
        annotations.extend(manifest.annotations.clone());
        merged.annotations = annotations;

        tracing::debug!(
            repositories = merged.contents.repositories.len(),
            packages = merged.contents.packages.len(),
            archs = merged.archs.len(),
            "Applied provider defaults"
        );
        merged
    }
}

fn union(defaults: &[String], values: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = defaults.to_vec();
    for value in values {
        if !merged.contains(value) {
            merged.push(value.clone());
        }
    }
    merged
}

/// Bounded exponential backoff for transient registry errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first (1 disables retries)
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    pub initial_backoff_ms: u64,

    /// Upper bound for a single delay in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        std::time::Duration::from_millis(millis)
    }
}

/// Publishing options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Push each SBOM as an artifact referring to its image manifest
    pub attach_sboms: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self { attach_sboms: true }
    }
}
