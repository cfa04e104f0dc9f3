//! Integration test: reproducible builds end to end.
//!
//! Drives [`BuildController`] against the in-memory fixture repository and
//! registry, then inspects what was published.

use std::io::Read;
use std::sync::Arc;

use flate2::read::GzDecoder;
use serde_json::Value;

use forge_core::{Architecture, Digest, Manifest, ProviderConfig};
use forge_engine::testutil::{wolfi_manifest, wolfi_source};
use forge_engine::{BuildController, MemoryRegistry, Repository};

const REPO: &str = "registry.example.com/forge/base:latest";

struct Harness {
    registry: Arc<MemoryRegistry>,
    controller: BuildController,
}

fn harness(config: ProviderConfig, archs: &[Architecture]) -> Harness {
    let registry = Arc::new(MemoryRegistry::new());
    let controller =
        BuildController::new(config, Arc::new(wolfi_source(archs)), registry.clone());
    Harness {
        registry,
        controller,
    }
}

fn manifest(packages: &[&str], archs: &[&str]) -> Manifest {
    Manifest::parse(&wolfi_manifest(packages, archs)).unwrap()
}

fn created(sbom: &[u8]) -> String {
    let doc: Value = serde_json::from_slice(sbom).unwrap();
    doc["creationInfo"]["created"].as_str().unwrap().to_string()
}

async fn build_digest(packages: &[&str]) -> Digest {
    let h = harness(ProviderConfig::default(), &[Architecture::Amd64, Architecture::Arm64]);
    h.controller
        .create(&manifest(packages, &["amd64", "arm64"]), REPO)
        .await
        .unwrap()
        .record
        .digest
}

#[tokio::test]
async fn test_same_manifest_same_digest() {
    let first = build_digest(&["wolfi-baselayout", "ca-certificates-bundle"]).await;
    let second = build_digest(&["wolfi-baselayout", "ca-certificates-bundle"]).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_package_order_does_not_matter() {
    let first = build_digest(&["wolfi-baselayout", "ca-certificates-bundle"]).await;
    let second = build_digest(&["ca-certificates-bundle", "wolfi-baselayout"]).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_adding_git_changes_digest() {
    let base = build_digest(&["wolfi-baselayout"]).await;
    let with_git = build_digest(&["wolfi-baselayout", "git"]).await;
    assert_ne!(base, with_git);
}

#[tokio::test]
async fn test_build_date_from_provider_pinned_baselayout() {
    let cases = [
        ("wolfi-baselayout=20230201-r0", "1970-01-01T00:00:00Z"),
        ("wolfi-baselayout=20230201-r3", "2023-06-06T21:13:45Z"),
    ];

    let mut digests = Vec::new();
    for (pin, expected) in cases {
        let config = ProviderConfig {
            packages: vec![pin.to_string()],
            ..ProviderConfig::default()
        };
        let h = harness(config, &[Architecture::Amd64]);
        let outcome = h
            .controller
            .create(&manifest(&["ca-certificates-bundle"], &["amd64"]), REPO)
            .await
            .unwrap();
        let sboms = outcome.sboms.unwrap();

        assert_eq!(created(&sboms["amd64"].data), expected, "{}", pin);
        assert_eq!(created(&sboms["index"].data), expected, "{}", pin);

        // the same pin reproduces the same digest
        let again = harness(
            ProviderConfig {
                packages: vec![pin.to_string()],
                ..ProviderConfig::default()
            },
            &[Architecture::Amd64],
        );
        let second = again
            .controller
            .create(&manifest(&["ca-certificates-bundle"], &["amd64"]), REPO)
            .await
            .unwrap();
        assert_eq!(second.record.digest, outcome.record.digest);
        digests.push(outcome.record.digest);
    }
    // the build date is part of every layer and config
    assert_ne!(digests[0], digests[1]);
}

#[tokio::test]
async fn test_later_package_moves_build_date_forward() {
    let h = harness(ProviderConfig::default(), &[Architecture::Amd64]);
    let outcome = h
        .controller
        .create(&manifest(&["wolfi-baselayout", "git"], &["amd64"]), REPO)
        .await
        .unwrap();
    let sboms = outcome.sboms.unwrap();
    // git was built after wolfi-baselayout
    assert_eq!(created(&sboms["amd64"].data), "2023-06-17T11:06:40Z");
}

#[tokio::test]
async fn test_postgres_data_dir_override() {
    let yaml = format!(
        "{}paths:\n  - path: /var/lib/postgresql/data\n    type: directory\n    uid: 70\n    gid: 70\n    permissions: 777\n",
        wolfi_manifest(&["postgresql-11-oci-entrypoint"], &["amd64"])
    );
    let h = harness(ProviderConfig::default(), &[Architecture::Amd64]);
    let outcome = h
        .controller
        .create(&Manifest::parse(&yaml).unwrap(), REPO)
        .await
        .unwrap();

    let repo = Repository::parse(REPO).unwrap();
    let index = h.registry.manifest(&repo, &outcome.record.digest).unwrap();
    let index: Value = serde_json::from_slice(&index.data).unwrap();
    let image_digest = Digest::parse(index["manifests"][0]["digest"].as_str().unwrap()).unwrap();
    let image = h.registry.manifest(&repo, &image_digest).unwrap();
    let image: Value = serde_json::from_slice(&image.data).unwrap();
    let layer_digest = Digest::parse(image["layers"][0]["digest"].as_str().unwrap()).unwrap();
    let layer = h.registry.blob(&repo, &layer_digest).unwrap();

    let mut tar_bytes = Vec::new();
    GzDecoder::new(layer.as_slice())
        .read_to_end(&mut tar_bytes)
        .unwrap();
    let mut archive = tar::Archive::new(tar_bytes.as_slice());
    let mut found = Vec::new();
    for entry in archive.entries().unwrap() {
        let entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
        if path == "var/lib/postgresql" || path == "var/lib/postgresql/data" {
            let header = entry.header();
            found.push((
                path,
                header.uid().unwrap(),
                header.gid().unwrap(),
                header.mode().unwrap() & 0o7777,
            ));
        }
    }

    assert_eq!(
        found,
        vec![
            ("var/lib/postgresql".to_string(), 0, 0, 0o755),
            ("var/lib/postgresql/data".to_string(), 70, 70, 0o777),
        ]
    );
}
