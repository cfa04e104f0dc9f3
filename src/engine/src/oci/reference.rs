//! Target repository references.
//!
//! Parses `ttl.sh/forge/base` or `ghcr.io/org/image:tag` into structured
//! components. A build publishes into a repository; the result is pinned
//! as `<repository>@sha256:<hex>`.

use forge_core::digest::Digest;
use forge_core::error::{ForgeError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// A registry repository, optionally with the tag the index is published under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Repository {
    /// Registry hostname (e.g., "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "org/image")
    pub path: String,
    /// Tag to point at the published index
    pub tag: Option<String>,
}

impl Repository {
    /// Parse a repository string.
    ///
    /// Supports formats:
    /// - `image` → docker.io/library/image
    /// - `org/image` → docker.io/org/image
    /// - `ghcr.io/org/image` → ghcr.io/org/image
    /// - `localhost:5000/image:dev` → localhost:5000/image, tag `dev`
    ///
    /// Digest references are rejected: a build target must be writable.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ForgeError::ConfigError("Empty repository".to_string()));
        }
        if reference.contains('@') {
            return Err(ForgeError::ConfigError(format!(
                "Repository '{}' must not contain a digest",
                reference
            )));
        }

        // Tag separator is the last colon after the last slash
        let last_segment_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match reference[last_segment_start..].rfind(':') {
            Some(colon) => {
                let split = last_segment_start + colon;
                let tag = &reference[split + 1..];
                if last_segment_start == 0 && tag.chars().all(|c| c.is_ascii_digit()) {
                    // `host:5000` without a path is a registry, not a tag
                    (reference, None)
                } else {
                    (&reference[..split], Some(tag.to_string()))
                }
            }
            None => (reference, None),
        };

        if let Some(tag) = &tag {
            if tag.is_empty() {
                return Err(ForgeError::ConfigError(format!(
                    "Empty tag in repository '{}'",
                    reference
                )));
            }
        }

        let (registry, path) = split_registry_path(name)?;
        Ok(Self {
            registry,
            path,
            tag,
        })
    }

    /// `registry/path`, without tag.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.path)
    }

    /// Digest-pinned reference: `registry/path@sha256:<hex>`.
    pub fn pinned(&self, digest: &Digest) -> String {
        format!("{}@{}", self.name(), digest)
    }
}

impl std::fmt::Display for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}:{}", self.name(), tag),
            None => write!(f, "{}", self.name()),
        }
    }
}

fn split_registry_path(name: &str) -> Result<(String, String)> {
    // The first component is a registry when it looks like a hostname
    if let Some(slash) = name.find('/') {
        let first = &name[..slash];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            let path = &name[slash + 1..];
            if path.is_empty() {
                return Err(ForgeError::ConfigError(format!(
                    "Empty repository path in '{}'",
                    name
                )));
            }
            return Ok((first.to_string(), path.to_string()));
        }
    }

    let path = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), path))
}

/// Split a pinned reference `registry/path@sha256:<hex>`.
pub fn parse_pinned(reference: &str) -> Result<(Repository, Digest)> {
    let (name, digest) = reference.rsplit_once('@').ok_or_else(|| {
        ForgeError::ConfigError(format!("Reference '{}' is not digest-pinned", reference))
    })?;
    Ok((Repository::parse(name)?, Digest::parse(digest)?))
}
