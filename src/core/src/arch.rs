//! Target architectures.
//!
//! Manifests may name architectures either the way APK repositories do
//! (`x86_64`, `aarch64`) or the way OCI platforms do (`amd64`, `arm64`).
//! Both spellings parse to the same [`Architecture`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ForgeError, Result};

/// A CPU architecture an image can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Architecture {
    Amd64,
    Arm64,
    ArmV6,
    ArmV7,
    I386,
    Ppc64le,
    S390x,
    Riscv64,
}

impl Architecture {
    /// Every supported architecture, in canonical order.
    pub const ALL: [Architecture; 8] = [
        Architecture::Amd64,
        Architecture::Arm64,
        Architecture::ArmV6,
        Architecture::ArmV7,
        Architecture::I386,
        Architecture::Ppc64le,
        Architecture::S390x,
        Architecture::Riscv64,
    ];

    /// Parse either spelling of an architecture name.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim() {
            "amd64" | "x86_64" => Ok(Self::Amd64),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            "arm/v6" | "armhf" => Ok(Self::ArmV6),
            "arm/v7" | "armv7" => Ok(Self::ArmV7),
            "386" | "x86" | "i386" => Ok(Self::I386),
            "ppc64le" => Ok(Self::Ppc64le),
            "s390x" => Ok(Self::S390x),
            "riscv64" => Ok(Self::Riscv64),
            other => Err(ForgeError::ParseError(format!(
                "unknown architecture '{}'",
                other
            ))),
        }
    }

    /// Expand a list of names, where `all` stands for every architecture.
    ///
    /// The result is sorted and deduplicated.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<Self>> {
        let mut archs = Vec::new();
        for name in names {
            if name.as_ref().trim() == "all" {
                archs.extend_from_slice(&Self::ALL);
            } else {
                archs.push(Self::parse(name.as_ref())?);
            }
        }
        archs.sort();
        archs.dedup();
        Ok(archs)
    }

    /// Directory name used by APK repositories (`<repo>/<arch>/APKINDEX.tar.gz`).
    pub fn apk_name(&self) -> &'static str {
        match self {
            Self::Amd64 => "x86_64",
            Self::Arm64 => "aarch64",
            Self::ArmV6 => "armhf",
            Self::ArmV7 => "armv7",
            Self::I386 => "x86",
            Self::Ppc64le => "ppc64le",
            Self::S390x => "s390x",
            Self::Riscv64 => "riscv64",
        }
    }

    /// OCI platform `architecture` field.
    pub fn oci_architecture(&self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
            Self::ArmV6 | Self::ArmV7 => "arm",
            Self::I386 => "386",
            Self::Ppc64le => "ppc64le",
            Self::S390x => "s390x",
            Self::Riscv64 => "riscv64",
        }
    }

    /// OCI platform `variant` field, if the architecture has one.
    pub fn oci_variant(&self) -> Option<&'static str> {
        match self {
            Self::ArmV6 => Some("v6"),
            Self::ArmV7 => Some("v7"),
            _ => None,
        }
    }

    /// Key used in SBOM maps and logs (`amd64`, `arm64`, `arm/v7`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
            Self::ArmV6 => "arm/v6",
            Self::ArmV7 => "arm/v7",
            Self::I386 => "386",
            Self::Ppc64le => "ppc64le",
            Self::S390x => "s390x",
            Self::Riscv64 => "riscv64",
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Architecture {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Architecture {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Architecture {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Deserialize an architecture list, expanding `all`.
pub fn deserialize_list<'de, D>(deserializer: D) -> std::result::Result<Vec<Architecture>, D::Error>
where
    D: Deserializer<'de>,
{
    let names: Vec<String> = Vec::deserialize(deserializer)?;
    Architecture::parse_list(&names).map_err(serde::de::Error::custom)
}
