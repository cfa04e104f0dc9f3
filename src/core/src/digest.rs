//! Content digests (`sha256:<hex>`).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::error::{ForgeError, Result};

const SHA256_PREFIX: &str = "sha256:";

/// A SHA-256 content digest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(String);

impl Digest {
    /// Digest of a byte slice.
    pub fn of(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// Parse `sha256:<64 hex>`. A bare 64-character hex string is accepted too.
    pub fn parse(s: &str) -> Result<Self> {
        let hex_part = s.strip_prefix(SHA256_PREFIX).unwrap_or(s);
        if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ForgeError::SerializationError(format!(
                "Invalid digest '{}': expected sha256:<64 hex chars>",
                s
            )));
        }
        Ok(Self(hex_part.to_ascii_lowercase()))
    }

    /// The hex part, without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", SHA256_PREFIX, self.0)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_digest_of_bytes() {
        let digest = Digest::of(b"hello");
        assert_eq!(digest.hex(), HELLO);
        assert_eq!(digest.to_string(), format!("sha256:{}", HELLO));
    }

    #[test]
    fn test_parse_prefixed_and_bare() {
        assert_eq!(Digest::parse(&format!("sha256:{}", HELLO)).unwrap(), Digest::of(b"hello"));
        assert_eq!(Digest::parse(HELLO).unwrap(), Digest::of(b"hello"));
    }

    #[test]
    fn test_parse_rejects_short() {
        assert!(Digest::parse("sha256:abc").is_err());
        assert!(Digest::parse(&"z".repeat(64)).is_err());
    }

    #[test]
    fn test_serde_uses_prefixed_form() {
        let json = serde_json::to_string(&Digest::of(b"hello")).unwrap();
        assert_eq!(json, format!("\"sha256:{}\"", HELLO));
    }
}
