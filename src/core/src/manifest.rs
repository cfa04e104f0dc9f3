//! Declarative image manifest.
//!
//! A manifest lists the packages to install, where they come from, the
//! accounts and path overrides to apply, and the architectures to build.
//! It is immutable once parsed and identified by [`Manifest::content_hash`].
//!
//! ```yaml
//! contents:
//!   repositories:
//!     - https://packages.wolfi.dev/os
//!   keyring:
//!     - https://packages.wolfi.dev/os/wolfi-signing.rsa.pub
//!   packages:
//!     - wolfi-baselayout
//!     - tzdata=2023c-r0
//! accounts:
//!   groups:
//!     - groupname: nonroot
//!       gid: 65532
//!   users:
//!     - username: nonroot
//!       uid: 65532
//!       gid: 65532
//!   run-as: 65532
//! paths:
//!   - path: /var/lib/app
//!     type: directory
//!     uid: 65532
//!     gid: 65532
//!     permissions: 755
//! archs:
//!   - x86_64
//!   - aarch64
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::arch::Architecture;
use crate::digest::Digest;
use crate::error::{ForgeError, Result};

/// Parsed image manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Manifest {
    /// Package sources and package list
    #[serde(default)]
    pub contents: Contents,

    /// Image entrypoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Entrypoint>,

    /// Default command (whitespace separated)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,

    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,

    /// Environment variables
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Users, groups and the run-as identity
    #[serde(default)]
    pub accounts: Accounts,

    /// Explicit path entries, applied in order after package extraction
    #[serde(default)]
    pub paths: Vec<PathEntry>,

    /// Architectures to build (`all` expands to every supported one)
    #[serde(default, deserialize_with = "crate::arch::deserialize_list")]
    pub archs: Vec<Architecture>,

    /// Annotations for the image index and manifests
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Package sources and package list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Contents {
    /// Repository base URLs
    #[serde(default)]
    pub repositories: Vec<String>,

    /// Trusted signing keys (URLs or local paths)
    #[serde(default)]
    pub keyring: Vec<String>,

    /// Package constraints (`name`, `name=1.2-r0`, `name>=1.2`)
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Image entrypoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Entrypoint {
    /// Command line (whitespace separated)
    #[serde(default)]
    pub command: String,
}

/// Accounts to create in the image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Accounts {
    #[serde(default)]
    pub users: Vec<User>,

    #[serde(default)]
    pub groups: Vec<Group>,

    /// User the image runs as (name or uid)
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub run_as: Option<String>,
}

/// A user account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct User {
    pub username: String,
    pub uid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homedir: Option<String>,
}

/// A group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Group {
    pub groupname: String,
    pub gid: u32,
    #[serde(default)]
    pub members: Vec<String>,
}

/// Kind of explicit path entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathKind {
    Directory,
    EmptyFile,
    Hardlink,
    Symlink,
    /// Only change ownership and mode of an existing path
    Permissions,
}

/// An explicit filesystem entry with owner/mode overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathEntry {
    pub path: String,

    #[serde(rename = "type")]
    pub kind: PathKind,

    /// Link target for `hardlink` and `symlink`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default)]
    pub uid: u32,

    #[serde(default)]
    pub gid: u32,

    /// Mode bits. Written in octal notation (`755`), as YAML would read it.
    #[serde(default, deserialize_with = "octal_mode", skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
}

impl Manifest {
    /// Parse a YAML manifest.
    pub fn parse(text: &str) -> Result<Self> {
        let manifest: Manifest =
            serde_yaml::from_str(text).map_err(|e| ForgeError::ParseError(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        for package in &self.contents.packages {
            if package.trim().is_empty() {
                return Err(ForgeError::ParseError("empty package entry".to_string()));
            }
        }
        for entry in &self.paths {
            if !entry.path.starts_with('/') {
                return Err(ForgeError::ParseError(format!(
                    "path '{}' must be absolute",
                    entry.path
                )));
            }
            let needs_source = matches!(entry.kind, PathKind::Hardlink | PathKind::Symlink);
            if needs_source && entry.source.as_deref().map_or(true, str::is_empty) {
                return Err(ForgeError::ParseError(format!(
                    "path '{}' of type {:?} requires a source",
                    entry.path, entry.kind
                )));
            }
        }
        for user in &self.accounts.users {
            if user.username.is_empty() {
                return Err(ForgeError::ParseError("user without username".to_string()));
            }
        }
        Ok(())
    }

    /// Canonical form used for hashing.
    ///
    /// Packages, repositories, keyring entries and architectures are sets:
    /// they are sorted and deduplicated. Users are ordered by uid and groups
    /// by gid. Path entries keep their order since they apply sequentially.
    pub fn canonical(&self) -> Manifest {
        let mut canonical = self.clone();
        sort_dedup(&mut canonical.contents.repositories);
        sort_dedup(&mut canonical.contents.keyring);
        for package in canonical.contents.packages.iter_mut() {
            *package = package.trim().to_string();
        }
        sort_dedup(&mut canonical.contents.packages);
        canonical.archs.sort();
        canonical.archs.dedup();
        canonical
            .accounts
            .users
            .sort_by(|a, b| (a.uid, &a.username).cmp(&(b.uid, &b.username)));
        canonical
            .accounts
            .groups
            .sort_by(|a, b| (a.gid, &a.groupname).cmp(&(b.gid, &b.groupname)));
        for group in canonical.accounts.groups.iter_mut() {
            sort_dedup(&mut group.members);
        }
        canonical
    }

    /// Content hash over the canonical JSON serialization.
    ///
    /// Semantically equal manifests hash equally regardless of list order
    /// or YAML formatting.
    pub fn content_hash(&self) -> Result<Digest> {
        let bytes = serde_json::to_vec(&self.canonical())?;
        Ok(Digest::of(&bytes))
    }

    /// Entrypoint split into argv.
    pub fn entrypoint_argv(&self) -> Vec<String> {
        self.entrypoint
            .as_ref()
            .map(|e| split_command(&e.command))
            .unwrap_or_default()
    }

    /// Cmd split into argv.
    pub fn cmd_argv(&self) -> Vec<String> {
        self.cmd.as_deref().map(split_command).unwrap_or_default()
    }
}

fn sort_dedup(values: &mut Vec<String>) {
    values.sort();
    values.dedup();
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<serde_yaml::Value> = Option::deserialize(deserializer)?;
    match value {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a user name or uid, got {:?}",
            other
        ))),
    }
}

/// Read a mode the way people write it: `755`, `"0755"` or `"0o755"`.
///
/// A YAML integer whose decimal digits are all octal digits is taken as
/// octal notation; anything else is used as the numeric mode itself.
fn octal_mode<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<serde_yaml::Value> = Option::deserialize(deserializer)?;
    let mode = match value {
        None | Some(serde_yaml::Value::Null) => return Ok(None),
        Some(serde_yaml::Value::Number(n)) => {
            let n = n
                .as_u64()
                .ok_or_else(|| serde::de::Error::custom("permissions must be positive"))?;
            let decimal = n.to_string();
            if decimal.chars().all(|c| ('0'..='7').contains(&c)) {
                u32::from_str_radix(&decimal, 8).map_err(serde::de::Error::custom)?
            } else {
                u32::try_from(n).map_err(serde::de::Error::custom)?
            }
        }
        Some(serde_yaml::Value::String(s)) => {
            let digits = s.trim().trim_start_matches("0o");
            u32::from_str_radix(digits, 8)
                .map_err(|e| serde::de::Error::custom(format!("invalid mode '{}': {}", s, e)))?
        }
        Some(other) => {
            return Err(serde::de::Error::custom(format!(
                "invalid permissions {:?}",
                other
            )))
        }
    };
    if mode > 0o7777 {
        return Err(serde::de::Error::custom(format!(
            "permissions {:o} out of range",
            mode
        )));
    }
    Ok(Some(mode))
}
