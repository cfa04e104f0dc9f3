//! Package payload extraction.

use base64::Engine;

use forge_core::error::{ForgeError, Result};

use super::tree::{normalize, FsNode, FsTree, NodeKind};
use crate::index::archive::{gzip_members, tar_entries, GzipMember};
use crate::resolve::ResolvedPackage;

/// Unpack an `.apk` payload into `tree`.
///
/// The control segment (`.PKGINFO`, install scripts) and any signature
/// segment are metadata and never reach the filesystem. When the index
/// recorded a `Q1` checksum the control segment must match it.
pub fn extract_package(tree: &mut FsTree, package: &ResolvedPackage, payload: &[u8]) -> Result<()> {
    let members = gzip_members(payload).map_err(|e| {
        ForgeError::AssemblyError(format!(
            "Failed to decompress {}: {}",
            package.file_name(),
            e
        ))
    })?;
    if members.is_empty() {
        return Err(ForgeError::AssemblyError(format!(
            "{} is empty",
            package.file_name()
        )));
    }

    let mut control_seen = false;
    for member in &members {
        let entries = tar_entries(&member.decoded).map_err(|e| {
            ForgeError::AssemblyError(format!("Failed to read {}: {}", package.file_name(), e))
        })?;

        if entries.iter().any(|e| e.path == ".PKGINFO") {
            verify_control_checksum(package, member)?;
            control_seen = true;
        }

        for entry in entries {
            let Some(path) = normalize(&entry.path) else {
                continue;
            };
            if path.starts_with('.') && !path.contains('/') {
                continue;
            }

            let mode = entry.mode & 0o7777;
            let uid = entry.uid as u32;
            let gid = entry.gid as u32;
            let kind = match entry.kind {
                tar::EntryType::Directory => NodeKind::Directory,
                tar::EntryType::Regular | tar::EntryType::Continuous => {
                    NodeKind::File(entry.data.into())
                }
                tar::EntryType::Symlink => NodeKind::Symlink(entry.link_name.unwrap_or_default()),
                tar::EntryType::Link => match entry.link_name.as_deref().and_then(normalize) {
                    Some(target) => NodeKind::Hardlink(target),
                    None => continue,
                },
                other => {
                    tracing::debug!(
                        package = %package.name,
                        path = %path,
                        kind = ?other,
                        "Skipping unsupported entry type"
                    );
                    continue;
                }
            };

            if matches!(kind, NodeKind::Directory) {
                if let Some(existing) = tree.get_mut(&path) {
                    if existing.is_dir() {
                        existing.mode = mode;
                        existing.uid = uid;
                        existing.gid = gid;
                        continue;
                    }
                }
            }
            tree.insert(
                &path,
                FsNode {
                    kind,
                    mode,
                    uid,
                    gid,
                },
            );
        }
    }

    if !control_seen && package.checksum.starts_with("Q1") {
        return Err(ForgeError::AssemblyError(format!(
            "{} has no control segment",
            package.file_name()
        )));
    }

    tracing::debug!(package = %package.name, version = %package.version, "Extracted package");
    Ok(())
}

fn verify_control_checksum(package: &ResolvedPackage, control: &GzipMember<'_>) -> Result<()> {
    let Some(expected) = package.checksum.strip_prefix("Q1") else {
        return Ok(());
    };
    let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, control.raw);
    let actual = base64::engine::general_purpose::STANDARD.encode(digest.as_ref());
    if actual != expected {
        return Err(ForgeError::AssemblyError(format!(
            "checksum mismatch for {}: index has Q1{}, payload is Q1{}",
            package.file_name(),
            expected,
            actual
        )));
    }
    Ok(())
}
