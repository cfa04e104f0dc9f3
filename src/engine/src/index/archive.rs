//! APK archive plumbing shared by indexes and packages.
//!
//! Both `APKINDEX.tar.gz` and `.apk` files are concatenations of gzip
//! members, each member holding a tar stream. The first member may be a
//! signature segment whose only entry is `.SIGN.RSA.<key>` (SHA-1) or
//! `.SIGN.RSA256.<key>` (SHA-256), signing the raw bytes of the members
//! that follow.

use std::collections::BTreeMap;
use std::io::Read;

use base64::Engine;
use ring::signature::{self, UnparsedPublicKey};

use forge_core::error::{ForgeError, ResolutionFailure, Result};

/// One gzip member: its compressed bytes and decompressed tar stream.
#[derive(Debug)]
pub struct GzipMember<'a> {
    pub raw: &'a [u8],
    pub decoded: Vec<u8>,
}

/// Split a concatenated gzip file into members.
pub fn gzip_members(data: &[u8]) -> std::io::Result<Vec<GzipMember<'_>>> {
    let mut members = Vec::new();
    let mut rest: &[u8] = data;
    while !rest.is_empty() {
        let before = rest.len();
        let mut decoded = Vec::new();
        {
            let mut decoder = flate2::bufread::GzDecoder::new(&mut rest);
            decoder.read_to_end(&mut decoded)?;
        }
        let consumed = before - rest.len();
        if consumed == 0 {
            break;
        }
        let start = data.len() - before;
        members.push(GzipMember {
            raw: &data[start..start + consumed],
            decoded,
        });
    }
    Ok(members)
}

/// A tar entry read fully into memory.
#[derive(Debug, Clone)]
pub struct TarEntry {
    pub path: String,
    pub kind: tar::EntryType,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub link_name: Option<String>,
    pub data: Vec<u8>,
}

/// Read every entry of an uncompressed tar stream.
pub fn tar_entries(stream: &[u8]) -> std::io::Result<Vec<TarEntry>> {
    let mut archive = tar::Archive::new(stream);
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().to_string();
        let header = entry.header();
        let kind = header.entry_type();
        let mode = header.mode()?;
        let uid = header.uid()?;
        let gid = header.gid()?;
        let link_name = entry
            .link_name()?
            .map(|p| p.to_string_lossy().to_string());
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        entries.push(TarEntry {
            path,
            kind,
            mode,
            uid,
            gid,
            link_name,
            data,
        });
    }
    Ok(entries)
}

/// Trusted RSA public keys, by file name.
///
/// Index signatures name their key by file name, so a keyring entry
/// `https://packages.wolfi.dev/os/wolfi-signing.rsa.pub` is stored as
/// `wolfi-signing.rsa.pub`.
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    keys: BTreeMap<String, Vec<u8>>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a PEM `PUBLIC KEY` (SubjectPublicKeyInfo) under `location`'s file name.
    pub fn add_pem(&mut self, location: &str, pem: &str) -> Result<()> {
        let name = key_name(location);
        let body: String = pem
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .map(str::trim)
            .collect();
        let der = base64::engine::general_purpose::STANDARD
            .decode(body.as_bytes())
            .map_err(|e| unreachable_key(location, format!("invalid PEM: {}", e)))?;
        let spki = spki::SubjectPublicKeyInfoRef::try_from(der.as_slice())
            .map_err(|e| unreachable_key(location, format!("invalid public key: {}", e)))?;
        let rsa_key = spki.subject_public_key.raw_bytes().to_vec();
        self.keys.insert(name, rsa_key);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    fn verify(&self, name: &str, sha256: bool, message: &[u8], sig: &[u8]) -> bool {
        let Some(key) = self.keys.get(name) else {
            return false;
        };
        let alg: &'static dyn signature::VerificationAlgorithm = if sha256 {
            &signature::RSA_PKCS1_2048_8192_SHA256
        } else {
            &signature::RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY
        };
        UnparsedPublicKey::new(alg, key).verify(message, sig).is_ok()
    }
}

/// File name of a keyring location (URL or path).
pub fn key_name(location: &str) -> String {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(location)
        .to_string()
}

fn unreachable_key(location: &str, message: String) -> ForgeError {
    ForgeError::ResolutionError {
        kind: ResolutionFailure::Unreachable,
        message: format!("keyring entry {}: {}", location, message),
    }
}

/// Verify a downloaded `APKINDEX.tar.gz` and return the `APKINDEX` text.
///
/// With a non-empty keyring the archive must carry a signature made by one
/// of its keys. With an empty keyring signatures are not checked.
pub fn read_signed_index(data: &[u8], keyring: &Keyring, repository: &str) -> Result<String> {
    let members = gzip_members(data).map_err(|e| ForgeError::FetchError {
        url: repository.to_string(),
        message: format!("Failed to decompress APKINDEX: {}", e),
    })?;

    let mut signature: Option<(String, bool, Vec<u8>)> = None;
    let mut index_text: Option<String> = None;
    let mut signed_from = 0;

    for (i, member) in members.iter().enumerate() {
        let entries = tar_entries(&member.decoded).map_err(|e| ForgeError::FetchError {
            url: repository.to_string(),
            message: format!("Failed to read APKINDEX tar: {}", e),
        })?;
        for entry in entries {
            if let Some(name) = entry.path.strip_prefix(".SIGN.RSA256.") {
                if i == 0 {
                    signature = Some((name.to_string(), true, entry.data));
                    signed_from = 1;
                }
            } else if let Some(name) = entry.path.strip_prefix(".SIGN.RSA.") {
                if i == 0 {
                    signature = Some((name.to_string(), false, entry.data));
                    signed_from = 1;
                }
            } else if entry.path == "APKINDEX" {
                index_text = Some(String::from_utf8_lossy(&entry.data).to_string());
            }
        }
    }

    if !keyring.is_empty() {
        let (name, sha256, sig) = signature.ok_or_else(|| ForgeError::ResolutionError {
            kind: ResolutionFailure::Unsigned,
            message: format!("index of {} is not signed", repository),
        })?;
        let signed: Vec<u8> = members[signed_from..]
            .iter()
            .flat_map(|m| m.raw.iter().copied())
            .collect();
        if !keyring.verify(&name, sha256, &signed, &sig) {
            return Err(ForgeError::ResolutionError {
                kind: ResolutionFailure::Unsigned,
                message: format!(
                    "index of {} is signed by '{}' which is not a trusted key",
                    repository, name
                ),
            });
        }
        tracing::debug!(repository, key = %name, "Verified index signature");
    } else {
        tracing::warn!(repository, "No keyring configured, index signature not checked");
    }

    index_text.ok_or_else(|| ForgeError::FetchError {
        url: repository.to_string(),
        message: "archive has no APKINDEX entry".to_string(),
    })
}
