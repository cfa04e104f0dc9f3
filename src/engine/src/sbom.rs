//! Software bills of materials.
//!
//! One SPDX 2.3 JSON document per architecture lists every installed
//! package, plus one document for the image index listing the per-arch
//! images. All documents carry the build date as `created`, so they are as
//! reproducible as the images they describe.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use forge_core::digest::Digest;
use forge_core::error::{ForgeError, Result};

use crate::builddate::format_rfc3339;
use crate::oci::image::{ArchImage, Blob};
use crate::resolve::ResolvedPackage;

pub const SPDX_MEDIA_TYPE: &str = "application/spdx+json";

/// Key of the index document in an [`SbomSet`].
pub const INDEX_SBOM_KEY: &str = "index";

const NAMESPACE_BASE: &str = "https://spdx.org/spdxdocs/forge";

/// SBOM documents keyed by architecture (`amd64`, `arm64`, ...) plus `index`.
pub type SbomSet = BTreeMap<String, Blob>;

/// SPDX identifiers allow letters, digits, `.` and `-` only.
fn spdx_id(prefix: &str, name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '-' })
        .collect();
    format!("SPDXRef-{}-{}", prefix, sanitized)
}

fn creation_info(build_date: &DateTime<Utc>) -> Value {
    json!({
        "created": format_rfc3339(build_date),
        "creators": [format!("Tool: forge-{}", env!("CARGO_PKG_VERSION"))],
        "licenseListVersion": "3.22"
    })
}

fn purl(package: &ResolvedPackage) -> String {
    format!(
        "pkg:apk/{}@{}?arch={}",
        package.name,
        package.version,
        package.arch.apk_name()
    )
}

fn package_entry(package: &ResolvedPackage) -> Value {
    let mut entry = json!({
        "SPDXID": spdx_id("Package", &format!("{}-{}", package.name, package.version)),
        "name": package.name,
        "versionInfo": package.version,
        "downloadLocation": "NOASSERTION",
        "filesAnalyzed": false,
        "supplier": "NOASSERTION",
        "externalRefs": [{
            "referenceCategory": "PACKAGE-MANAGER",
            "referenceType": "purl",
            "referenceLocator": purl(package)
        }]
    });
    if !package.repository.is_empty() {
        entry["sourceInfo"] = json!(format!("repository {}", package.repository));
    }
    if !package.license.is_empty() {
        entry["licenseDeclared"] = json!(package.license);
    }
    if !package.origin.is_empty() && package.origin != package.name {
        entry["originator"] = json!(format!("Organization: {}", package.origin));
    }
    if !package.url.is_empty() {
        entry["homepage"] = json!(package.url);
    }
    if !package.description.is_empty() {
        entry["description"] = json!(package.description);
    }
    entry
}

fn image_entry(id: &str, name: &str, digest: &Digest) -> Value {
    json!({
        "SPDXID": id,
        "name": name,
        "versionInfo": digest.to_string(),
        "downloadLocation": "NOASSERTION",
        "filesAnalyzed": false,
        "supplier": "NOASSERTION",
        "primaryPackagePurpose": "CONTAINER"
    })
}

fn relationship(element: &str, kind: &str, related: &str) -> Value {
    json!({
        "spdxElementId": element,
        "relationshipType": kind,
        "relatedSpdxElement": related
    })
}

fn serialize(document: &Value) -> Result<Blob> {
    let data = serde_json::to_vec_pretty(document)
        .map_err(|e| ForgeError::SbomError(e.to_string()))?;
    Ok(Blob::new(SPDX_MEDIA_TYPE, data))
}

/// SBOM of one architecture's image.
pub fn arch_sbom(image: &ArchImage, build_date: &DateTime<Utc>) -> Result<Blob> {
    let mut packages: Vec<&ResolvedPackage> = image.packages.iter().collect();
    packages.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));

    let image_id = spdx_id("Image", &image.digest().hex()[..12]);
    let mut entries = vec![image_entry(&image_id, image.arch.as_str(), image.digest())];
    let mut relationships = vec![relationship("SPDXRef-DOCUMENT", "DESCRIBES", &image_id)];
    for package in &packages {
        let entry = package_entry(package);
        if let Some(id) = entry["SPDXID"].as_str() {
            relationships.push(relationship(&image_id, "CONTAINS", id));
        }
        entries.push(entry);
    }

    let document = json!({
        "SPDXID": "SPDXRef-DOCUMENT",
        "spdxVersion": "SPDX-2.3",
        "dataLicense": "CC0-1.0",
        "name": format!("sbom-{}", image.arch),
        "documentNamespace": format!("{}/{}", NAMESPACE_BASE, image.digest().hex()),
        "creationInfo": creation_info(build_date),
        "packages": entries,
        "relationships": relationships
    });
    serialize(&document)
}

/// SBOM of the image index, listing each architecture's image.
pub fn index_sbom(index: &Blob, images: &[ArchImage], build_date: &DateTime<Utc>) -> Result<Blob> {
    let index_id = spdx_id("ImageIndex", &index.digest.hex()[..12]);
    let mut entries = vec![image_entry(&index_id, INDEX_SBOM_KEY, &index.digest)];
    let mut relationships = vec![relationship("SPDXRef-DOCUMENT", "DESCRIBES", &index_id)];

    let mut sorted: Vec<&ArchImage> = images.iter().collect();
    sorted.sort_by_key(|image| image.arch.as_str());
    for image in sorted {
        let image_id = spdx_id("Image", &image.digest().hex()[..12]);
        entries.push(image_entry(&image_id, image.arch.as_str(), image.digest()));
        relationships.push(relationship(&index_id, "VARIANT_OF", &image_id));
    }

    let document = json!({
        "SPDXID": "SPDXRef-DOCUMENT",
        "spdxVersion": "SPDX-2.3",
        "dataLicense": "CC0-1.0",
        "name": "sbom-index",
        "documentNamespace": format!("{}/{}", NAMESPACE_BASE, index.digest.hex()),
        "creationInfo": creation_info(build_date),
        "packages": entries,
        "relationships": relationships
    });
    serialize(&document)
}

/// Generate the full SBOM set for a build.
pub fn generate_sboms(
    images: &[ArchImage],
    index: &Blob,
    build_date: &DateTime<Utc>,
) -> Result<SbomSet> {
    let mut set = SbomSet::new();
    for image in images {
        set.insert(image.arch.to_string(), arch_sbom(image, build_date)?);
    }
    set.insert(INDEX_SBOM_KEY.to_string(), index_sbom(index, images, build_date)?);
    tracing::debug!(documents = set.len(), "Generated SBOMs");
    Ok(set)
}
