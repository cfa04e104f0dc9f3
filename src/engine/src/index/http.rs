//! Package source backed by remote APK repositories.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::try_join_all;

use forge_core::arch::Architecture;
use forge_core::error::{ForgeError, ResolutionFailure, Result};

use super::archive::{read_signed_index, Keyring};
use super::{PackageIndex, PackageSource};
use crate::resolve::ResolvedPackage;

/// Fetches indexes and packages over HTTP(S).
///
/// Verified indexes are cached per `(repository, arch)` until
/// [`PackageSource::refresh`] is called, so the architectures of one build
/// and repeated plans against the same repositories share downloads.
pub struct HttpPackageSource {
    http: reqwest::Client,
    indexes: DashMap<(String, Architecture), PackageIndex>,
    keys: DashMap<String, String>,
}

impl HttpPackageSource {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self {
            http,
            indexes: DashMap::new(),
            keys: DashMap::new(),
        }
    }

    /// Load the keyring; entries are URLs or local file paths.
    async fn load_keyring(&self, locations: &[String]) -> Result<Keyring> {
        let mut keyring = Keyring::new();
        for location in locations {
            let pem = match self.keys.get(location) {
                Some(pem) => pem.clone(),
                None => {
                    let pem = self.fetch_key(location).await?;
                    self.keys.insert(location.clone(), pem.clone());
                    pem
                }
            };
            keyring.add_pem(location, &pem)?;
        }
        Ok(keyring)
    }

    async fn fetch_key(&self, location: &str) -> Result<String> {
        if is_remote(location) {
            tracing::debug!(url = %location, "Fetching signing key");
            let bytes = self.get(location).await.map_err(|e| unreachable(location, e))?;
            Ok(String::from_utf8_lossy(&bytes).to_string())
        } else {
            let path = location.strip_prefix("file://").unwrap_or(location);
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| unreachable(location, format!("Failed to read key: {}", e)))
        }
    }

    async fn fetch_repository(
        &self,
        repository: &str,
        keyring: &Keyring,
        arch: Architecture,
    ) -> Result<PackageIndex> {
        let key = (repository.to_string(), arch);
        if let Some(cached) = self.indexes.get(&key) {
            tracing::debug!(repository, arch = %arch, "Using cached index");
            return Ok(cached.clone());
        }

        let url = format!(
            "{}/{}/APKINDEX.tar.gz",
            repository.trim_end_matches('/'),
            arch.apk_name()
        );
        tracing::debug!(url = %url, "Fetching APKINDEX");
        let data = self.get(&url).await.map_err(|e| unreachable(&url, e))?;

        let text = read_signed_index(&data, keyring, repository)?;
        let index = PackageIndex::parse_apkindex(&text, repository)?;
        tracing::info!(repository, arch = %arch, packages = index.len(), "Loaded repository index");

        self.indexes.insert(key, index.clone());
        Ok(index)
    }

    async fn get(&self, url: &str) -> std::result::Result<Vec<u8>, String> {
        if !is_remote(url) {
            let path = url.strip_prefix("file://").unwrap_or(url);
            return tokio::fs::read(path)
                .await
                .map_err(|e| format!("Failed to read {}: {}", path, e));
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("server returned {}", response.status()));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| format!("Failed to read response: {}", e))
    }
}

impl Default for HttpPackageSource {
    fn default() -> Self {
        Self::new()
    }
}

fn is_remote(location: &str) -> bool {
    location.starts_with("https://") || location.starts_with("http://")
}

fn unreachable(location: &str, message: String) -> ForgeError {
    ForgeError::ResolutionError {
        kind: ResolutionFailure::Unreachable,
        message: format!("{}: {}", location, message),
    }
}

#[async_trait]
impl PackageSource for HttpPackageSource {
    async fn fetch_index(
        &self,
        repositories: &[String],
        keyring: &[String],
        arch: Architecture,
    ) -> Result<PackageIndex> {
        let keyring = self.load_keyring(keyring).await?;
        let indexes = try_join_all(
            repositories
                .iter()
                .map(|repository| self.fetch_repository(repository, &keyring, arch)),
        )
        .await?;
        Ok(PackageIndex::merge(indexes))
    }

    async fn fetch_package(&self, package: &ResolvedPackage) -> Result<Vec<u8>> {
        let url = format!(
            "{}/{}/{}",
            package.repository.trim_end_matches('/'),
            package.arch.apk_name(),
            package.file_name()
        );
        tracing::debug!(url = %url, "Downloading package");
        self.get(&url)
            .await
            .map_err(|message| ForgeError::FetchError { url, message })
    }

    fn refresh(&self) {
        self.indexes.clear();
        self.keys.clear();
    }
}
