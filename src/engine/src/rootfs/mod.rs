//! Root filesystem assembly.
//!
//! Packages are extracted in resolution order into an in-memory tree,
//! declared accounts are merged into the account databases, and explicit
//! path entries are applied last, overriding whatever the packages laid
//! down. The tree is then serialized as a single deterministic layer.

pub mod accounts;
pub mod apk;
pub mod layer;
pub mod tree;

use chrono::{DateTime, Utc};

use forge_core::error::{ForgeError, Result};
use forge_core::manifest::{Manifest, PathEntry, PathKind};

use crate::resolve::ResolvedPackage;

pub use layer::{create_layer, Layer, LAYER_MEDIA_TYPE};
pub use tree::{FsNode, FsTree, NodeKind};

/// Builds the root filesystem of one architecture.
pub struct RootfsAssembler<'a> {
    manifest: &'a Manifest,
    build_date: DateTime<Utc>,
}

impl<'a> RootfsAssembler<'a> {
    pub fn new(manifest: &'a Manifest, build_date: DateTime<Utc>) -> Self {
        Self {
            manifest,
            build_date,
        }
    }

    /// Extract `packages` (with their payloads) and apply accounts and paths.
    pub fn assemble(&self, packages: &[(ResolvedPackage, Vec<u8>)]) -> Result<FsTree> {
        let mut tree = FsTree::new();
        for (package, payload) in packages {
            apk::extract_package(&mut tree, package, payload)?;
        }

        accounts::apply_accounts(&mut tree, &self.manifest.accounts)?;
        let ids = accounts::id_table(&tree);
        if let Some(run_as) = &self.manifest.accounts.run_as {
            accounts::check_run_as(&ids, run_as)?;
        }

        for entry in &self.manifest.paths {
            if !ids.has_uid(entry.uid) {
                return Err(ForgeError::AssemblyError(format!(
                    "path {}: uid {} is not defined in /etc/passwd",
                    entry.path, entry.uid
                )));
            }
            if !ids.has_gid(entry.gid) {
                return Err(ForgeError::AssemblyError(format!(
                    "path {}: gid {} is not defined in /etc/group",
                    entry.path, entry.gid
                )));
            }
            apply_path(&mut tree, entry)?;
        }

        tracing::debug!(
            packages = packages.len(),
            entries = tree.len(),
            "Assembled root filesystem"
        );
        Ok(tree)
    }

    /// Assemble and serialize into the image's layers.
    pub fn build_layers(&self, packages: &[(ResolvedPackage, Vec<u8>)]) -> Result<Vec<Layer>> {
        let tree = self.assemble(packages)?;
        Ok(vec![create_layer(&tree, &self.build_date)?])
    }
}

/// Apply one explicit path entry. Later entries win over earlier ones and
/// over package contents; parents that do not exist are created as
/// `root:root 0755` while existing parents keep their metadata.
pub fn apply_path(tree: &mut FsTree, entry: &PathEntry) -> Result<()> {
    let (uid, gid) = (entry.uid, entry.gid);
    match entry.kind {
        PathKind::Directory => {
            let existing_mode = tree
                .get(&entry.path)
                .filter(|node| node.is_dir())
                .map(|node| node.mode);
            let mode = entry.permissions.or(existing_mode).unwrap_or(0o755);
            match tree.get_mut(&entry.path).filter(|node| node.is_dir()) {
                Some(node) => {
                    node.uid = uid;
                    node.gid = gid;
                    node.mode = mode;
                }
                None => tree.insert(&entry.path, FsNode::directory(mode, uid, gid)),
            }
        }
        PathKind::EmptyFile => {
            let mode = entry.permissions.unwrap_or(0o644);
            tree.insert(&entry.path, FsNode::file(Vec::new(), mode, uid, gid));
        }
        PathKind::Symlink => {
            let target = entry.source.clone().unwrap_or_default();
            tree.insert(
                &entry.path,
                FsNode {
                    kind: NodeKind::Symlink(target),
                    mode: 0o777,
                    uid,
                    gid,
                },
            );
        }
        PathKind::Hardlink => {
            let source = entry.source.as_deref().unwrap_or_default();
            let target = tree::normalize(source).ok_or_else(|| {
                ForgeError::AssemblyError(format!("path {}: invalid source", entry.path))
            })?;
            let mode = match tree.get(&target) {
                Some(node) if matches!(node.kind, NodeKind::File(_)) => node.mode,
                _ => {
                    return Err(ForgeError::AssemblyError(format!(
                        "path {}: hardlink source {} is not a regular file",
                        entry.path, source
                    )))
                }
            };
            tree.insert(
                &entry.path,
                FsNode {
                    kind: NodeKind::Hardlink(target),
                    mode: entry.permissions.unwrap_or(mode),
                    uid,
                    gid,
                },
            );
        }
        PathKind::Permissions => {
            let node = tree.get_mut(&entry.path).ok_or_else(|| {
                ForgeError::AssemblyError(format!(
                    "path {}: cannot change permissions of a missing path",
                    entry.path
                ))
            })?;
            node.uid = uid;
            node.gid = gid;
            if let Some(mode) = entry.permissions {
                node.mode = mode;
            }
        }
    }
    tracing::trace!(path = %entry.path, kind = ?entry.kind, "Applied path entry");
    Ok(())
}
