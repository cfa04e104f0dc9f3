//! Reproducible build date.
//!
//! Every timestamp a build writes (layer mtimes, image config `created`,
//! SBOM `created`) is the latest package build time across all
//! architectures, or the Unix epoch when no package records one. The same
//! frozen package sets therefore always produce the same date, and adding a
//! newer package can only move it forward.

use chrono::{DateTime, Utc};

use crate::resolve::ResolvedPackage;

/// The Unix epoch, used when no package carries a build time.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

/// Compute the build date for a set of per-architecture package sets.
pub fn resolve_build_date<'a, I>(package_sets: I) -> DateTime<Utc>
where
    I: IntoIterator<Item = &'a [ResolvedPackage]>,
{
    package_sets
        .into_iter()
        .flat_map(|set| set.iter())
        .filter_map(|package| package.build_time)
        .max()
        .unwrap_or_else(epoch)
}

/// RFC 3339 form with second precision and a `Z` suffix.
pub fn format_rfc3339(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
