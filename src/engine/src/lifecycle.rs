//! Build lifecycle.
//!
//! [`BuildController`] is the entry point an orchestration layer drives. It
//! owns no state itself: the caller persists the [`BuildRecord`] returned
//! from `create`/`update` and hands it back for `plan`, `read`, `update` and
//! `destroy`. A record is only ever produced by a fully successful publish.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use forge_core::config::ProviderConfig;
use forge_core::digest::Digest;
use forge_core::error::{ForgeError, PublishFailure, Result};
use forge_core::manifest::Manifest;

use crate::index::PackageSource;
use crate::oci::reference::{parse_pinned, Repository};
use crate::oci::registry::RegistryTransport;
use crate::pipeline;
use crate::publish::Publisher;
use crate::sbom::SbomSet;

/// Persisted state of a published build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Content hash of the manifest after provider defaults were applied
    pub manifest_hash: Digest,
    /// Target repository as given, normalized
    pub repository: String,
    /// Digest of the published image index
    pub digest: Digest,
    /// `<repository>@sha256:<hex>`
    pub image_ref: String,
    /// SBOM digests keyed like the SBOM set
    #[serde(default)]
    pub sboms: BTreeMap<String, Digest>,
}

/// What `update` would do for a given record and configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Nothing has been built yet
    Create,
    /// The record is stale
    Rebuild { reason: String },
    /// The record still describes the configuration
    NoOp,
}

/// Result of `create` or `update`.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub record: BuildRecord,
    /// SBOM documents, when a build ran
    pub sboms: Option<SbomSet>,
}

impl BuildOutcome {
    /// The digest-pinned image reference.
    pub fn image_ref(&self) -> &str {
        &self.record.image_ref
    }

    /// Whether this invocation built and published anything.
    pub fn rebuilt(&self) -> bool {
        self.sboms.is_some()
    }
}

/// Drives builds for an orchestration layer.
pub struct BuildController {
    config: ProviderConfig,
    source: Arc<dyn PackageSource>,
    registry: Arc<dyn RegistryTransport>,
}

impl BuildController {
    pub fn new(
        config: ProviderConfig,
        source: Arc<dyn PackageSource>,
        registry: Arc<dyn RegistryTransport>,
    ) -> Self {
        Self {
            config,
            source,
            registry,
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Decide whether `record` still matches `manifest` published to `repository`.
    pub fn plan(
        &self,
        record: Option<&BuildRecord>,
        manifest: &Manifest,
        repository: &str,
    ) -> Result<Plan> {
        let Some(record) = record else {
            return Ok(Plan::Create);
        };
        let hash = self.config.apply(manifest).content_hash()?;
        let repository = Repository::parse(repository)?.to_string();

        if record.manifest_hash != hash {
            return Ok(Plan::Rebuild {
                reason: format!("manifest changed ({} -> {})", record.manifest_hash, hash),
            });
        }
        if record.repository != repository {
            return Ok(Plan::Rebuild {
                reason: format!("repository changed ({} -> {})", record.repository, repository),
            });
        }
        Ok(Plan::NoOp)
    }

    /// Build `manifest` and publish it to `repository`.
    pub async fn create(&self, manifest: &Manifest, repository: &str) -> Result<BuildOutcome> {
        let repository = Repository::parse(repository)?;
        let merged = self.config.apply(manifest);
        merged.validate()?;
        let manifest_hash = merged.content_hash()?;

        self.source.refresh();
        let build = pipeline::build(self.source.clone(), &merged).await?;

        let digest = Publisher::new(&*self.registry, &self.config.retry)
            .attach_sboms(self.config.publish.attach_sboms)
            .publish(&repository, &build)
            .await?;

        let record = BuildRecord {
            manifest_hash,
            repository: repository.to_string(),
            image_ref: repository.pinned(&digest),
            digest,
            sboms: build
                .sboms
                .iter()
                .map(|(key, sbom)| (key.clone(), sbom.digest.clone()))
                .collect(),
        };
        tracing::info!(
            image = %record.image_ref,
            sboms = record.sboms.len(),
            "Build published"
        );
        Ok(BuildOutcome {
            record,
            sboms: Some(build.sboms),
        })
    }

    /// Check a record. Without `verify` the recorded digest is trusted;
    /// with it the registry must still serve the recorded index.
    pub async fn read(&self, record: &BuildRecord, verify: bool) -> Result<BuildRecord> {
        if !verify {
            return Ok(record.clone());
        }

        let (repository, digest) = parse_pinned(&record.image_ref)?;
        match self
            .registry
            .resolve_digest(&repository, &digest.to_string())
            .await
        {
            Ok(resolved) if resolved == record.digest => {
                tracing::debug!(image = %record.image_ref, "Recorded digest verified");
                Ok(record.clone())
            }
            Ok(resolved) => Err(ForgeError::DriftError {
                reference: record.image_ref.clone(),
                message: format!("registry serves {}", resolved),
            }),
            Err(ForgeError::PublishError {
                kind: PublishFailure::NotFound,
                message,
                ..
            }) => {
                tracing::warn!(image = %record.image_ref, "Recorded digest no longer resolves");
                Err(ForgeError::DriftError {
                    reference: record.image_ref.clone(),
                    message,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Rebuild when the manifest or repository changed, otherwise return
    /// the recorded result without touching the registry.
    pub async fn update(
        &self,
        previous: &BuildRecord,
        manifest: &Manifest,
        repository: &str,
    ) -> Result<BuildOutcome> {
        match self.plan(Some(previous), manifest, repository)? {
            Plan::NoOp => {
                tracing::info!(image = %previous.image_ref, "Configuration unchanged");
                Ok(BuildOutcome {
                    record: previous.clone(),
                    sboms: None,
                })
            }
            Plan::Rebuild { reason } => {
                tracing::info!(reason = %reason, "Rebuilding image");
                self.create(manifest, repository).await
            }
            Plan::Create => self.create(manifest, repository).await,
        }
    }

    /// Forget a build. Published content stays in the registry.
    pub fn destroy(&self, record: BuildRecord) -> Result<()> {
        tracing::info!(image = %record.image_ref, "Discarding build record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::registry::MemoryRegistry;
    use crate::testutil::{wolfi_manifest, wolfi_source};
    use forge_core::arch::Architecture;

    const REPO: &str = "registry.example.com/forge/base";

    fn controller(registry: Arc<MemoryRegistry>) -> BuildController {
        BuildController::new(
            ProviderConfig::default(),
            Arc::new(wolfi_source(&[Architecture::Amd64])),
            registry,
        )
    }

    fn manifest(packages: &[&str]) -> Manifest {
        Manifest::parse(&wolfi_manifest(packages, &["amd64"])).unwrap()
    }

    #[test]
    fn test_plan_decisions() {
        let controller = controller(Arc::new(MemoryRegistry::new()));
        let base = manifest(&["wolfi-baselayout"]);
        let record = BuildRecord {
            manifest_hash: ProviderConfig::default().apply(&base).content_hash().unwrap(),
            repository: Repository::parse(REPO).unwrap().to_string(),
            digest: Digest::of(b"index"),
            image_ref: format!("{}@{}", REPO, Digest::of(b"index")),
            sboms: BTreeMap::new(),
        };

        assert_eq!(controller.plan(None, &base, REPO).unwrap(), Plan::Create);
        assert_eq!(controller.plan(Some(&record), &base, REPO).unwrap(), Plan::NoOp);
        assert!(matches!(
            controller
                .plan(Some(&record), &manifest(&["wolfi-baselayout", "git"]), REPO)
                .unwrap(),
            Plan::Rebuild { .. }
        ));
        assert!(matches!(
            controller
                .plan(Some(&record), &base, "registry.example.com/forge/other")
                .unwrap(),
            Plan::Rebuild { .. }
        ));
    }

    #[tokio::test]
    async fn test_create_then_read() {
        let registry = Arc::new(MemoryRegistry::new());
        let controller = controller(registry.clone());
        let outcome = controller
            .create(&manifest(&["wolfi-baselayout"]), REPO)
            .await
            .unwrap();

        assert!(outcome.rebuilt());
        assert!(outcome
            .image_ref()
            .starts_with("registry.example.com/forge/base@sha256:"));
        assert_eq!(
            outcome.record.sboms.keys().collect::<Vec<_>>(),
            vec!["amd64", "index"]
        );

        let verified = controller.read(&outcome.record, true).await.unwrap();
        assert_eq!(verified, outcome.record);
    }

    #[test]
    fn test_record_serde() {
        let record = BuildRecord {
            manifest_hash: Digest::of(b"manifest"),
            repository: REPO.to_string(),
            digest: Digest::of(b"index"),
            image_ref: format!("{}@{}", REPO, Digest::of(b"index")),
            sboms: BTreeMap::from([("amd64".to_string(), Digest::of(b"sbom"))]),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"digest\":\"sha256:"));
        let parsed: BuildRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
