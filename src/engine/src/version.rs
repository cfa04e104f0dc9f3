//! APK version ordering and package constraints.
//!
//! Versions look like `1.2.3a_rc1_p2-r4`: dot-separated numbers, an
//! optional letter, zero or more `_suffix[N]` parts and a `-rN` revision.
//! Pre-release suffixes (`_alpha`, `_beta`, `_pre`, `_rc`) sort before the
//! plain version, post-release ones (`_cvs`, `_svn`, `_git`, `_hg`, `_p`)
//! after it.

use std::cmp::Ordering;
use std::fmt;

use forge_core::error::{ForgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Suffix {
    Alpha,
    Beta,
    Pre,
    Rc,
    None,
    Cvs,
    Svn,
    Git,
    Hg,
    P,
}

impl Suffix {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "alpha" => Some(Self::Alpha),
            "beta" => Some(Self::Beta),
            "pre" => Some(Self::Pre),
            "rc" => Some(Self::Rc),
            "cvs" => Some(Self::Cvs),
            "svn" => Some(Self::Svn),
            "git" => Some(Self::Git),
            "hg" => Some(Self::Hg),
            "p" => Some(Self::P),
            _ => None,
        }
    }
}

/// A parsed APK package version.
#[derive(Debug, Clone)]
pub struct ApkVersion {
    raw: String,
    numbers: Vec<u64>,
    letter: Option<char>,
    suffixes: Vec<(Suffix, u64)>,
    revision: u64,
    /// Anything that did not fit the grammar, compared as text
    trailing: String,
}

impl ApkVersion {
    /// Parse a version. Parsing never fails: unrecognised tails are kept
    /// and compared lexicographically after the structured parts.
    pub fn parse(s: &str) -> Self {
        let raw = s.trim().to_string();
        let (body, revision, rev_ok) = match raw.rfind("-r") {
            Some(pos) => match raw[pos + 2..].parse::<u64>() {
                Ok(rev) => (&raw[..pos], rev, true),
                Err(_) => (raw.as_str(), 0, false),
            },
            None => (raw.as_str(), 0, true),
        };
        // Commit hashes (`~abc123`) do not take part in ordering
        let body = body.split('~').next().unwrap_or(body);

        let mut rest = body;
        let mut numbers = Vec::new();
        loop {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                break;
            }
            numbers.push(digits.parse::<u64>().unwrap_or(u64::MAX));
            rest = &rest[digits.len()..];
            match rest.strip_prefix('.') {
                Some(r) if r.starts_with(|c: char| c.is_ascii_digit()) => rest = r,
                _ => break,
            }
        }

        let mut letter = None;
        if let Some(c) = rest.chars().next() {
            if c.is_ascii_lowercase() {
                letter = Some(c);
                rest = &rest[1..];
            }
        }

        let mut suffixes = Vec::new();
        while let Some(r) = rest.strip_prefix('_') {
            let name: String = r.chars().take_while(|c| c.is_ascii_lowercase()).collect();
            let Some(kind) = Suffix::parse(&name) else {
                break;
            };
            let r = &r[name.len()..];
            let digits: String = r.chars().take_while(|c| c.is_ascii_digit()).collect();
            suffixes.push((kind, digits.parse::<u64>().unwrap_or(0)));
            rest = &r[digits.len()..];
        }

        let mut trailing = rest.to_string();
        if !rev_ok {
            trailing = raw.clone();
        }

        Self {
            raw,
            numbers,
            letter,
            suffixes,
            revision,
            trailing,
        }
    }

    /// The version as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn cmp_suffixes(&self, other: &Self) -> Ordering {
        let len = self.suffixes.len().max(other.suffixes.len());
        for i in 0..len {
            let a = self.suffixes.get(i).copied().unwrap_or((Suffix::None, 0));
            let b = other.suffixes.get(i).copied().unwrap_or((Suffix::None, 0));
            match a.cmp(&b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl Ord for ApkVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.numbers
            .cmp(&other.numbers)
            .then_with(|| self.letter.cmp(&other.letter))
            .then_with(|| self.cmp_suffixes(other))
            .then_with(|| self.trailing.cmp(&other.trailing))
            .then_with(|| self.revision.cmp(&other.revision))
    }
}

impl PartialOrd for ApkVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ApkVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ApkVersion {}

impl fmt::Display for ApkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Version comparison operators accepted in constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOp {
    Eq,
    Ge,
    Le,
    Gt,
    Lt,
    /// Prefix match (`tzdata~2023`)
    Fuzzy,
}

impl VersionOp {
    fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Fuzzy => "~",
        }
    }
}

/// A requirement on a package name, optionally bounded by version.
///
/// Used both for manifest package entries and for index dependencies
/// (`so:libc.so.6`, `cmd:sh`, `busybox>=1.36`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub name: String,
    pub version: Option<(VersionOp, ApkVersion)>,
}

impl Constraint {
    /// Parse `name`, `name=ver`, `name>=ver`, `name<ver`, `name~ver`.
    ///
    /// A repository pin (`name@edge`) is accepted and ignored.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s.find(|c| matches!(c, '=' | '<' | '>' | '~'));
        let (name, version) = match split {
            None => (s, None),
            Some(pos) => {
                let (name, spec) = s.split_at(pos);
                let (op, ver) = if let Some(v) = spec.strip_prefix(">=") {
                    (VersionOp::Ge, v)
                } else if let Some(v) = spec.strip_prefix("<=") {
                    (VersionOp::Le, v)
                } else if let Some(v) = spec.strip_prefix("=~") {
                    (VersionOp::Fuzzy, v)
                } else if let Some(v) = spec.strip_prefix('>') {
                    (VersionOp::Gt, v)
                } else if let Some(v) = spec.strip_prefix('<') {
                    (VersionOp::Lt, v)
                } else if let Some(v) = spec.strip_prefix('~') {
                    (VersionOp::Fuzzy, v)
                } else {
                    (VersionOp::Eq, &spec[1..])
                };
                if ver.is_empty() {
                    return Err(ForgeError::ParseError(format!(
                        "constraint '{}' has an operator but no version",
                        s
                    )));
                }
                (name, Some((op, ApkVersion::parse(ver))))
            }
        };
        let name = name.split('@').next().unwrap_or(name).trim();
        if name.is_empty() {
            return Err(ForgeError::ParseError(format!(
                "constraint '{}' has no package name",
                s
            )));
        }
        Ok(Self {
            name: name.to_string(),
            version,
        })
    }

    /// Whether `version` satisfies this constraint.
    pub fn matches(&self, version: &ApkVersion) -> bool {
        let Some((op, wanted)) = &self.version else {
            return true;
        };
        match op {
            VersionOp::Eq => version == wanted,
            VersionOp::Ge => version >= wanted,
            VersionOp::Le => version <= wanted,
            VersionOp::Gt => version > wanted,
            VersionOp::Lt => version < wanted,
            VersionOp::Fuzzy => fuzzy_match(version.as_str(), wanted.as_str()),
        }
    }
}

/// `wanted` is a prefix of `version` ending on a component boundary.
fn fuzzy_match(version: &str, wanted: &str) -> bool {
    match version.strip_prefix(wanted) {
        Some(rest) => !rest.starts_with(|c: char| c.is_ascii_digit()),
        None => false,
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some((op, v)) => write!(f, "{}{}{}", self.name, op.symbol(), v),
            None => f.write_str(&self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> ApkVersion {
        ApkVersion::parse(s)
    }

    #[test]
    fn test_revision_ordering() {
        assert!(v("20230201-r0") < v("20230201-r3"));
        assert!(v("2.37-r6") > v("2.37-r5"));
    }

    #[test]
    fn test_numeric_ordering() {
        assert!(v("1.10") > v("1.9"));
        assert!(v("1.2") < v("1.2.1"));
        assert!(v("2023") < v("20230506"));
    }

    #[test]
    fn test_letter_ordering() {
        assert!(v("2023c-r0") > v("2023b-r0"));
        assert!(v("2023a") > v("2023"));
    }

    #[test]
    fn test_suffix_ordering() {
        assert!(v("1.0_rc1") < v("1.0"));
        assert!(v("1.0_alpha") < v("1.0_beta"));
        assert!(v("1.0_p1") > v("1.0"));
        assert!(v("1.0_rc2") > v("1.0_rc1"));
    }

    #[test]
    fn test_equal_versions() {
        assert_eq!(v("1.0-r0"), v("1.0-r0"));
        assert_eq!(v("1.0"), v("1.0-r0"));
    }

    #[test]
    fn test_constraint_parse() {
        let c = Constraint::parse("wolfi-baselayout=20230201-r0").unwrap();
        assert_eq!(c.name, "wolfi-baselayout");
        assert!(matches!(c.version, Some((VersionOp::Eq, _))));

        let c = Constraint::parse("busybox>=1.36").unwrap();
        assert!(matches!(c.version, Some((VersionOp::Ge, _))));

        let c = Constraint::parse("tzdata").unwrap();
        assert!(c.version.is_none());

        let c = Constraint::parse("so:libc.so.6").unwrap();
        assert_eq!(c.name, "so:libc.so.6");
    }

    #[test]
    fn test_constraint_parse_errors() {
        assert!(Constraint::parse("=1.0").is_err());
        assert!(Constraint::parse("git=").is_err());
    }

    #[test]
    fn test_constraint_ignores_repository_pin() {
        let c = Constraint::parse("git@edge").unwrap();
        assert_eq!(c.name, "git");
    }

    #[test]
    fn test_constraint_matches() {
        let eq = Constraint::parse("tzdata=2023c-r0").unwrap();
        assert!(eq.matches(&v("2023c-r0")));
        assert!(!eq.matches(&v("2023c-r1")));

        let ge = Constraint::parse("tzdata>=2023b").unwrap();
        assert!(ge.matches(&v("2023c-r0")));
        assert!(!ge.matches(&v("2023a-r0")));

        let lt = Constraint::parse("tzdata<2023b").unwrap();
        assert!(lt.matches(&v("2023a-r9")));

        let fuzzy = Constraint::parse("glibc~2.37").unwrap();
        assert!(fuzzy.matches(&v("2.37-r6")));
        assert!(!fuzzy.matches(&v("2.38-r0")));

        let fuzzy = Constraint::parse("glibc~2.3").unwrap();
        assert!(fuzzy.matches(&v("2.3-r1")));
        assert!(fuzzy.matches(&v("2.3.1-r0")));
        assert!(!fuzzy.matches(&v("2.37-r6")));
        assert!(!fuzzy.matches(&v("2.30-r0")));
    }

    #[test]
    fn test_constraint_display() {
        assert_eq!(Constraint::parse("git>=2.40").unwrap().to_string(), "git>=2.40");
        assert_eq!(Constraint::parse("git").unwrap().to_string(), "git");
    }
}
