//! Deterministic tar.gz layer creation.
//!
//! Entries are written in path order with the build date as mtime, no
//! user or group names, and a gzip header without timestamp or file name.
//! Hardlinks follow every other entry so their targets exist on unpack.
//! The same tree and date always produce byte-identical layers.

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;

use forge_core::digest::Digest;
use forge_core::error::{ForgeError, Result};

use super::tree::{FsNode, FsTree, NodeKind};

pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// A compressed filesystem layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Compressed layer bytes
    pub data: Vec<u8>,
    /// Digest of the compressed bytes (the blob digest)
    pub digest: Digest,
    /// Digest of the uncompressed tar (the config `rootfs.diff_ids` entry)
    pub diff_id: Digest,
}

impl Layer {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Write `tree` as a single gzip-compressed tar layer.
pub fn create_layer(tree: &FsTree, build_date: &DateTime<Utc>) -> Result<Layer> {
    let mtime = build_date.timestamp().max(0) as u64;
    let mut builder = tar::Builder::new(Vec::new());

    let (links, rest): (Vec<_>, Vec<_>) = tree
        .iter()
        .partition(|(_, node)| matches!(node.kind, NodeKind::Hardlink(_)));
    for (path, node) in rest.into_iter().chain(links) {
        append_node(&mut builder, path, node, mtime).map_err(|e| {
            ForgeError::AssemblyError(format!("Failed to add {} to layer: {}", path, e))
        })?;
    }

    let tar_bytes = builder
        .into_inner()
        .map_err(|e| ForgeError::AssemblyError(format!("Failed to finalize layer: {}", e)))?;
    let diff_id = Digest::of(&tar_bytes);

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    std::io::Write::write_all(&mut encoder, &tar_bytes)
        .map_err(|e| ForgeError::AssemblyError(format!("Failed to compress layer: {}", e)))?;
    let data = encoder
        .finish()
        .map_err(|e| ForgeError::AssemblyError(format!("Failed to compress layer: {}", e)))?;
    let digest = Digest::of(&data);

    tracing::debug!(
        digest = %digest,
        entries = tree.len(),
        size = data.len(),
        "Created layer"
    );

    Ok(Layer {
        data,
        digest,
        diff_id,
    })
}

fn append_node<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    node: &FsNode,
    mtime: u64,
) -> std::io::Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_mode(node.mode);
    header.set_uid(node.uid as u64);
    header.set_gid(node.gid as u64);
    header.set_mtime(mtime);

    match &node.kind {
        NodeKind::Directory => {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, format!("{}/", path), std::io::empty())
        }
        NodeKind::File(data) => {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, path, &data[..])
        }
        NodeKind::Symlink(target) => {
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, path, target)
        }
        NodeKind::Hardlink(target) => {
            header.set_entry_type(tar::EntryType::Link);
            header.set_size(0);
            builder.append_link(&mut header, path, target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::archive::tar_entries;
    use std::io::Read;

    fn sample_tree() -> FsTree {
        let mut tree = FsTree::new();
        tree.insert("/usr/bin/git", FsNode::file(b"elf".to_vec(), 0o755, 0, 0));
        tree.insert(
            "/var/lib/postgresql/data",
            FsNode::directory(0o777, 70, 70),
        );
        tree.insert(
            "/bin/sh",
            FsNode {
                kind: NodeKind::Symlink("/usr/bin/busybox".to_string()),
                mode: 0o777,
                uid: 0,
                gid: 0,
            },
        );
        tree
    }

    fn unpack(layer: &Layer) -> Vec<crate::index::archive::TarEntry> {
        let mut tar_bytes = Vec::new();
        flate2::read::GzDecoder::new(layer.data.as_slice())
            .read_to_end(&mut tar_bytes)
            .unwrap();
        assert_eq!(Digest::of(&tar_bytes), layer.diff_id);
        tar_entries(&tar_bytes).unwrap()
    }

    #[test]
    fn test_layer_is_deterministic() {
        let date = DateTime::<Utc>::from_timestamp(1686086025, 0).unwrap();
        let a = create_layer(&sample_tree(), &date).unwrap();
        let b = create_layer(&sample_tree(), &date).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.digest, Digest::of(&a.data));
    }

    #[test]
    fn test_build_date_changes_digest() {
        let a = create_layer(&sample_tree(), &DateTime::<Utc>::default()).unwrap();
        let date = DateTime::<Utc>::from_timestamp(1686086025, 0).unwrap();
        let b = create_layer(&sample_tree(), &date).unwrap();
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn test_entries_sorted_with_metadata() {
        let date = DateTime::<Utc>::from_timestamp(1686086025, 0).unwrap();
        let layer = create_layer(&sample_tree(), &date).unwrap();
        let entries = unpack(&layer);

        let paths: Vec<&str> = entries
            .iter()
            .map(|e| e.path.trim_end_matches('/'))
            .collect();
        assert_eq!(
            paths,
            vec![
                "bin",
                "bin/sh",
                "usr",
                "usr/bin",
                "usr/bin/git",
                "var",
                "var/lib",
                "var/lib/postgresql",
                "var/lib/postgresql/data",
            ]
        );

        let data = entries
            .iter()
            .find(|e| e.path.trim_end_matches('/') == "var/lib/postgresql/data")
            .unwrap();
        assert_eq!(data.kind, tar::EntryType::Directory);
        assert_eq!((data.uid, data.gid, data.mode), (70, 70, 0o777));

        let sh = entries.iter().find(|e| e.path == "bin/sh").unwrap();
        assert_eq!(sh.link_name.as_deref(), Some("/usr/bin/busybox"));
    }

    #[test]
    fn test_hardlinks_unpack_after_targets() {
        let mut tree = FsTree::new();
        tree.insert("/usr/bin/git", FsNode::file(b"elf".to_vec(), 0o755, 0, 0));
        tree.insert(
            "/usr/bin/a",
            FsNode {
                kind: NodeKind::Hardlink("usr/bin/git".to_string()),
                mode: 0o755,
                uid: 0,
                gid: 0,
            },
        );
        let layer = create_layer(&tree, &DateTime::<Utc>::default()).unwrap();

        let entries = unpack(&layer);
        let paths: Vec<&str> = entries
            .iter()
            .map(|e| e.path.trim_end_matches('/'))
            .collect();
        assert_eq!(paths, vec!["usr", "usr/bin", "usr/bin/git", "usr/bin/a"]);

        let dir = tempfile::tempdir().unwrap();
        tar::Archive::new(flate2::read::GzDecoder::new(layer.data.as_slice()))
            .unpack(dir.path())
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("usr/bin/a")).unwrap(), b"elf");
    }

    #[test]
    fn test_gzip_header_has_no_timestamp() {
        let layer = create_layer(&sample_tree(), &DateTime::<Utc>::default()).unwrap();
        // MTIME occupies bytes 4..8 of the gzip header
        assert_eq!(&layer.data[4..8], &[0, 0, 0, 0]);
        // FLG carries no file name; XFL 0 is the default compression level
        assert_eq!(layer.data[3], 0);
        assert_eq!(layer.data[8], 0);
    }

    #[test]
    fn test_tar_headers_are_normalized() {
        let date = DateTime::<Utc>::from_timestamp(1686086025, 0).unwrap();
        let layer = create_layer(&sample_tree(), &date).unwrap();
        let mut tar_bytes = Vec::new();
        flate2::read::GzDecoder::new(layer.data.as_slice())
            .read_to_end(&mut tar_bytes)
            .unwrap();

        let mut archive = tar::Archive::new(tar_bytes.as_slice());
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert!(header.as_ustar().is_some());
            assert_eq!(header.mtime().unwrap(), 1686086025);
            assert_eq!(header.username_bytes(), Some(&b""[..]));
            assert_eq!(header.groupname_bytes(), Some(&b""[..]));
        }
        // two zero blocks close the archive
        assert_eq!(tar_bytes.len() % 512, 0);
        assert!(tar_bytes[tar_bytes.len() - 1024..].iter().all(|b| *b == 0));
    }
}
