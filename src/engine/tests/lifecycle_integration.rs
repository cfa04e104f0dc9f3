//! Integration test: the create/read/update/destroy contract.
//!
//! Uses the in-memory fixture repository and registry, so failures can be
//! injected per architecture and every registry write is counted.

use std::sync::Arc;

use forge_core::{
    Architecture, ForgeError, Manifest, ProviderConfig, PublishFailure, ResolutionFailure,
    RetryConfig,
};
use forge_engine::testutil::{wolfi_manifest, wolfi_packages, wolfi_source};
use forge_engine::{
    BuildController, MemoryRegistry, MemorySource, Plan, RegistryTransport, Repository,
};

const REPO: &str = "registry.example.com/forge/base:latest";

fn fast_config() -> ProviderConfig {
    ProviderConfig {
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        },
        ..ProviderConfig::default()
    }
}

fn controller(source: MemorySource, registry: &Arc<MemoryRegistry>) -> BuildController {
    BuildController::new(fast_config(), Arc::new(source), registry.clone())
}

fn manifest(packages: &[&str], archs: &[&str]) -> Manifest {
    Manifest::parse(&wolfi_manifest(packages, archs)).unwrap()
}

fn repo() -> Repository {
    Repository::parse(REPO).unwrap()
}

#[tokio::test]
async fn test_create_publishes_index_and_sboms() {
    let registry = Arc::new(MemoryRegistry::new());
    let controller = controller(
        wolfi_source(&[Architecture::Amd64, Architecture::Arm64]),
        &registry,
    );

    let outcome = controller
        .create(&manifest(&["wolfi-baselayout"], &["amd64", "arm64"]), REPO)
        .await
        .unwrap();

    let expected_ref = format!("registry.example.com/forge/base@{}", outcome.record.digest);
    assert_eq!(outcome.image_ref(), expected_ref);
    assert_eq!(
        outcome.sboms.as_ref().unwrap().keys().collect::<Vec<_>>(),
        vec!["amd64", "arm64", "index"]
    );
    assert_eq!(registry.indexes(&repo()).len(), 1);
    assert_eq!(
        registry.resolve_digest(&repo(), "latest").await.unwrap(),
        outcome.record.digest
    );
}

#[tokio::test]
async fn test_unreachable_arch_publishes_nothing() {
    let source = wolfi_source(&[Architecture::Amd64, Architecture::Arm64]);
    source.set_unreachable(Architecture::Arm64);
    let registry = Arc::new(MemoryRegistry::new());
    let controller = controller(source, &registry);

    let err = controller
        .create(&manifest(&["wolfi-baselayout"], &["amd64", "arm64"]), REPO)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ForgeError::ResolutionError {
            kind: ResolutionFailure::Unreachable,
            ..
        }
    ));
    assert_eq!(registry.writes(), 0);
    assert!(registry.indexes(&repo()).is_empty());
}

#[tokio::test]
async fn test_unknown_package_is_resolution_error() {
    let registry = Arc::new(MemoryRegistry::new());
    let controller = controller(wolfi_source(&[Architecture::Amd64]), &registry);

    let err = controller
        .create(&manifest(&["does-not-exist"], &["amd64"]), REPO)
        .await
        .unwrap_err();
    match err {
        ForgeError::ResolutionError {
            kind: ResolutionFailure::Unsatisfiable,
            message,
        } => assert!(message.contains("does-not-exist")),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(registry.writes(), 0);
}

#[tokio::test]
async fn test_assembly_failure_on_one_arch_publishes_nothing() {
    let source = wolfi_source(&[Architecture::Amd64]);
    for package in wolfi_packages() {
        let (entry, payload) = package.build(Architecture::Arm64);
        let payload = if entry.name == "wolfi-baselayout" {
            payload[..payload.len() / 2].to_vec()
        } else {
            payload
        };
        source.add_package(Architecture::Arm64, entry, payload);
    }
    let registry = Arc::new(MemoryRegistry::new());
    let controller = controller(source, &registry);

    let err = controller
        .create(&manifest(&["wolfi-baselayout"], &["amd64", "arm64"]), REPO)
        .await
        .unwrap_err();
    match err {
        ForgeError::BuildError { arch, source } => {
            assert_eq!(arch, "arm64");
            assert!(matches!(*source, ForgeError::AssemblyError(_)));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(registry.indexes(&repo()).is_empty());
}

#[tokio::test]
async fn test_unchanged_update_is_noop() {
    let source = Arc::new(wolfi_source(&[Architecture::Amd64]));
    let registry = Arc::new(MemoryRegistry::new());
    let controller = BuildController::new(fast_config(), source.clone(), registry.clone());
    let desired = manifest(&["wolfi-baselayout"], &["amd64"]);

    let created = controller.create(&desired, REPO).await.unwrap();
    let writes = registry.writes();
    let fetches = source.index_fetches();

    assert_eq!(
        controller.plan(Some(&created.record), &desired, REPO).unwrap(),
        Plan::NoOp
    );
    let updated = controller
        .update(&created.record, &desired, REPO)
        .await
        .unwrap();

    assert!(!updated.rebuilt());
    assert_eq!(updated.record, created.record);
    assert_eq!(registry.writes(), writes);
    assert_eq!(source.index_fetches(), fetches);
}

#[tokio::test]
async fn test_changed_manifest_rebuilds() {
    let registry = Arc::new(MemoryRegistry::new());
    let controller = controller(wolfi_source(&[Architecture::Amd64]), &registry);

    let created = controller
        .create(&manifest(&["wolfi-baselayout"], &["amd64"]), REPO)
        .await
        .unwrap();
    let desired = manifest(&["wolfi-baselayout", "git"], &["amd64"]);
    assert!(matches!(
        controller.plan(Some(&created.record), &desired, REPO).unwrap(),
        Plan::Rebuild { .. }
    ));

    let updated = controller
        .update(&created.record, &desired, REPO)
        .await
        .unwrap();
    assert!(updated.rebuilt());
    assert_ne!(updated.record.digest, created.record.digest);
    assert_ne!(updated.record.manifest_hash, created.record.manifest_hash);
}

#[tokio::test]
async fn test_changed_repository_rebuilds() {
    let registry = Arc::new(MemoryRegistry::new());
    let controller = controller(wolfi_source(&[Architecture::Amd64]), &registry);
    let desired = manifest(&["wolfi-baselayout"], &["amd64"]);

    let created = controller.create(&desired, REPO).await.unwrap();
    let other = "registry.example.com/forge/other";
    let updated = controller
        .update(&created.record, &desired, other)
        .await
        .unwrap();

    assert!(updated.rebuilt());
    // same content, new home
    assert_eq!(updated.record.digest, created.record.digest);
    assert!(updated
        .image_ref()
        .starts_with("registry.example.com/forge/other@sha256:"));
}

#[tokio::test]
async fn test_read_detects_drift() {
    let registry = Arc::new(MemoryRegistry::new());
    let controller = controller(wolfi_source(&[Architecture::Amd64]), &registry);
    let created = controller
        .create(&manifest(&["wolfi-baselayout"], &["amd64"]), REPO)
        .await
        .unwrap();

    assert_eq!(
        controller.read(&created.record, true).await.unwrap(),
        created.record
    );

    registry.delete_manifest(&repo(), &created.record.digest);

    // trusted reads never consult the registry
    let reads = registry.reads();
    assert!(controller.read(&created.record, false).await.is_ok());
    assert_eq!(registry.reads(), reads);

    let err = controller.read(&created.record, true).await.unwrap_err();
    match err {
        ForgeError::DriftError { reference, .. } => {
            assert_eq!(reference, created.record.image_ref);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_destroy_leaves_registry_untouched() {
    let registry = Arc::new(MemoryRegistry::new());
    let controller = controller(wolfi_source(&[Architecture::Amd64]), &registry);
    let created = controller
        .create(&manifest(&["wolfi-baselayout"], &["amd64"]), REPO)
        .await
        .unwrap();
    let (writes, reads) = (registry.writes(), registry.reads());

    controller.destroy(created.record.clone()).unwrap();

    assert_eq!(registry.writes(), writes);
    assert_eq!(registry.reads(), reads);
    assert!(registry.manifest(&repo(), &created.record.digest).is_some());
}

#[tokio::test]
async fn test_provider_defaults_merge() {
    let registry = Arc::new(MemoryRegistry::new());
    let config = ProviderConfig {
        repositories: vec![forge_engine::testutil::TEST_REPOSITORY.to_string()],
        archs: vec![Architecture::Amd64, Architecture::Arm64],
        packages: vec!["wolfi-baselayout".to_string()],
        ..fast_config()
    };
    let controller = BuildController::new(
        config,
        Arc::new(wolfi_source(&[Architecture::Amd64, Architecture::Arm64])),
        registry.clone(),
    );

    // the manifest lists neither repositories nor architectures
    let desired = Manifest::parse("contents:\n  packages:\n    - ca-certificates-bundle\n").unwrap();
    let outcome = controller.create(&desired, REPO).await.unwrap();

    let sboms = outcome.sboms.unwrap();
    assert_eq!(
        sboms.keys().collect::<Vec<_>>(),
        vec!["amd64", "arm64", "index"]
    );
    let doc: serde_json::Value = serde_json::from_slice(&sboms["amd64"].data).unwrap();
    let names: Vec<&str> = doc["packages"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|p| p["name"].as_str())
        .collect();
    assert!(names.contains(&"wolfi-baselayout"));
    assert!(names.contains(&"ca-certificates-bundle"));
}

#[tokio::test]
async fn test_transient_registry_errors_are_retried() {
    let registry = Arc::new(MemoryRegistry::new());
    registry.fail_next(&[PublishFailure::Transient, PublishFailure::Transient]);
    let controller = controller(wolfi_source(&[Architecture::Amd64]), &registry);

    let outcome = controller
        .create(&manifest(&["wolfi-baselayout"], &["amd64"]), REPO)
        .await
        .unwrap();
    assert_eq!(registry.indexes(&repo()).len(), 1);
    assert!(registry.manifest(&repo(), &outcome.record.digest).is_some());
}

#[tokio::test]
async fn test_unauthorized_is_fatal() {
    let registry = Arc::new(MemoryRegistry::new());
    registry.fail_next(&[PublishFailure::Unauthorized]);
    let controller = controller(wolfi_source(&[Architecture::Amd64]), &registry);

    let err = controller
        .create(&manifest(&["wolfi-baselayout"], &["amd64"]), REPO)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ForgeError::PublishError {
            kind: PublishFailure::Unauthorized,
            ..
        }
    ));
    assert!(registry.indexes(&repo()).is_empty());
}
