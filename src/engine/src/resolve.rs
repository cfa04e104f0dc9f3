//! Package resolution.
//!
//! Turns the manifest's package constraints into a concrete, frozen set of
//! packages for one architecture. Resolution is a pure function of the
//! constraints and the index: the highest version satisfying every
//! constraint wins, ties between repositories go to the lexicographically
//! smallest repository URL, and virtual names (`so:`, `cmd:`, paths) go to
//! the provider with the highest `k:` priority, then the smallest name.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};

use forge_core::arch::Architecture;
use forge_core::error::{ForgeError, Result};
use forge_core::manifest::Manifest;

use crate::index::{IndexEntry, PackageIndex, PackageSource};
use crate::version::{ApkVersion, Constraint};

/// A package version bound to an architecture, with provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: String,
    pub arch: Architecture,
    /// Repository the package is downloaded from
    pub repository: String,
    /// Build time recorded in the repository index
    pub build_time: Option<DateTime<Utc>>,
    /// Index checksum of the package control segment
    pub checksum: String,
    pub size: u64,
    pub license: String,
    /// Source package name
    pub origin: String,
    pub url: String,
    pub description: String,
}

impl ResolvedPackage {
    fn from_entry(entry: &IndexEntry, arch: Architecture) -> Self {
        Self {
            name: entry.name.clone(),
            version: entry.version.clone(),
            arch,
            repository: entry.repository.clone(),
            build_time: entry
                .build_time
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
            checksum: entry.checksum.clone(),
            size: entry.size,
            license: entry.license.clone(),
            origin: entry.origin.clone(),
            url: entry.url.clone(),
            description: entry.description.clone(),
        }
    }

    /// File name of the package inside its repository architecture directory.
    pub fn file_name(&self) -> String {
        format!("{}-{}.apk", self.name, self.version)
    }
}

/// A provider of a virtual name.
struct Provider<'a> {
    entry: &'a IndexEntry,
    version: Option<ApkVersion>,
}

/// Resolves constraints against one architecture's index.
pub struct PackageResolver<'a> {
    arch: Architecture,
    by_name: BTreeMap<&'a str, Vec<&'a IndexEntry>>,
    providers: BTreeMap<String, Vec<Provider<'a>>>,
}

impl<'a> PackageResolver<'a> {
    pub fn new(index: &'a PackageIndex, arch: Architecture) -> Self {
        let mut by_name: BTreeMap<&str, Vec<&IndexEntry>> = BTreeMap::new();
        let mut providers: BTreeMap<String, Vec<Provider<'a>>> = BTreeMap::new();

        for entry in &index.entries {
            by_name.entry(entry.name.as_str()).or_default().push(entry);
            for provided in &entry.provides {
                let (name, version) = match provided.split_once('=') {
                    Some((n, v)) => (n, Some(ApkVersion::parse(v))),
                    None => (provided.as_str(), None),
                };
                providers
                    .entry(name.to_string())
                    .or_default()
                    .push(Provider { entry, version });
            }
        }

        Self {
            arch,
            by_name,
            providers,
        }
    }

    /// Resolve `packages` (manifest constraint strings) and their dependencies.
    ///
    /// The result is sorted by package name.
    pub fn resolve(&self, packages: &[String]) -> Result<Vec<ResolvedPackage>> {
        let mut requested: BTreeMap<String, Vec<Constraint>> = BTreeMap::new();
        for package in packages {
            let constraint = Constraint::parse(package)?;
            requested
                .entry(constraint.name.clone())
                .or_default()
                .push(constraint);
        }

        let mut state = Selection::default();

        for (name, constraints) in &requested {
            if let Some(selected) = state.satisfied_by(name, constraints) {
                tracing::trace!(package = %name, by = %selected, "Already provided");
                continue;
            }
            let entry = self.choose(name, constraints)?;
            state.select(entry, "manifest")?;
        }

        while let Some((dependency, required_by)) = state.queue.pop_front() {
            if let Some(conflict) = dependency.strip_prefix('!') {
                let constraint = Constraint::parse(conflict)?;
                state.conflicts.push((constraint, required_by));
                continue;
            }
            let constraint = Constraint::parse(&dependency)?;
            let constraints = std::slice::from_ref(&constraint);
            if let Some(selected) = self.check_selected(&state, &constraint, &required_by)? {
                tracing::trace!(dependency = %constraint, by = %selected, "Dependency satisfied");
                continue;
            }
            let entry = self.choose(&constraint.name, constraints).map_err(|_| {
                ForgeError::unsatisfiable(format!(
                    "{} ({}) requires {} which no package in the index satisfies",
                    required_by, self.arch, constraint
                ))
            })?;
            state.select(entry, &required_by)?;
        }

        for (conflict, declared_by) in &state.conflicts {
            if let Some(entry) = state.selected.get(&conflict.name) {
                if conflict.matches(&ApkVersion::parse(&entry.version)) {
                    return Err(ForgeError::unsatisfiable(format!(
                        "{} conflicts with {}-{} ({})",
                        declared_by, entry.name, entry.version, self.arch
                    )));
                }
            }
        }

        Ok(state
            .selected
            .values()
            .map(|entry| ResolvedPackage::from_entry(entry, self.arch))
            .collect())
    }

    /// Check whether a dependency is already met by the selection.
    ///
    /// Returns the satisfying package name, `None` when nothing selected
    /// provides the name, or an error when the name is taken by a version
    /// that does not satisfy the constraint.
    fn check_selected(
        &self,
        state: &Selection<'a>,
        constraint: &Constraint,
        required_by: &str,
    ) -> Result<Option<String>> {
        if let Some(entry) = state.selected.get(&constraint.name) {
            if constraint.matches(&ApkVersion::parse(&entry.version)) {
                return Ok(Some(entry.name.clone()));
            }
            return Err(ForgeError::unsatisfiable(format!(
                "{} requires {} but {}-{} is selected ({})",
                required_by, constraint, entry.name, entry.version, self.arch
            )));
        }
        Ok(state.satisfied_by(&constraint.name, std::slice::from_ref(constraint)))
    }

    /// Pick the best index entry for `name` satisfying every constraint.
    fn choose(&self, name: &str, constraints: &[Constraint]) -> Result<&'a IndexEntry> {
        if let Some(candidates) = self.by_name.get(name) {
            let best = candidates
                .iter()
                .copied()
                .filter(|e| {
                    let version = ApkVersion::parse(&e.version);
                    constraints.iter().all(|c| c.matches(&version))
                })
                .max_by(|a, b| {
                    ApkVersion::parse(&a.version)
                        .cmp(&ApkVersion::parse(&b.version))
                        .then_with(|| b.repository.cmp(&a.repository))
                });
            return best.ok_or_else(|| {
                let mut available: Vec<&str> =
                    candidates.iter().map(|e| e.version.as_str()).collect();
                available.sort();
                available.dedup();
                ForgeError::unsatisfiable(format!(
                    "no version of {} satisfies {} for {} (available: {})",
                    name,
                    describe(constraints),
                    self.arch,
                    available.join(", ")
                ))
            });
        }

        let providers = self.providers.get(name).ok_or_else(|| {
            ForgeError::unsatisfiable(format!("package {} not found for {}", name, self.arch))
        })?;
        providers
            .iter()
            .filter(|p| {
                let version = p
                    .version
                    .clone()
                    .unwrap_or_else(|| ApkVersion::parse(&p.entry.version));
                constraints.iter().all(|c| c.matches(&version))
            })
            .max_by(|a, b| {
                a.entry
                    .provider_priority
                    .cmp(&b.entry.provider_priority)
                    .then_with(|| b.entry.name.cmp(&a.entry.name))
                    .then_with(|| {
                        ApkVersion::parse(&a.entry.version)
                            .cmp(&ApkVersion::parse(&b.entry.version))
                    })
            })
            .map(|p| p.entry)
            .ok_or_else(|| {
                ForgeError::unsatisfiable(format!(
                    "no provider of {} satisfies {} for {}",
                    name,
                    describe(constraints),
                    self.arch
                ))
            })
    }
}

fn describe(constraints: &[Constraint]) -> String {
    constraints
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Working state of one resolution.
#[derive(Default)]
struct Selection<'a> {
    selected: BTreeMap<String, &'a IndexEntry>,
    /// Virtual name -> (providing package, provided version)
    provided: BTreeMap<String, Vec<(String, Option<ApkVersion>)>>,
    queue: VecDeque<(String, String)>,
    conflicts: Vec<(Constraint, String)>,
}

impl<'a> Selection<'a> {
    fn select(&mut self, entry: &'a IndexEntry, required_by: &str) -> Result<()> {
        if let Some(existing) = self.selected.get(&entry.name) {
            if existing.version == entry.version {
                return Ok(());
            }
            return Err(ForgeError::unsatisfiable(format!(
                "{} needs {}-{} but {}-{} is already selected",
                required_by, entry.name, entry.version, existing.name, existing.version
            )));
        }
        tracing::debug!(
            package = %entry.name,
            version = %entry.version,
            required_by,
            "Selected package"
        );
        self.selected.insert(entry.name.clone(), entry);
        for provided in &entry.provides {
            let (name, version) = match provided.split_once('=') {
                Some((n, v)) => (n, Some(ApkVersion::parse(v))),
                None => (provided.as_str(), None),
            };
            self.provided
                .entry(name.to_string())
                .or_default()
                .push((entry.name.clone(), version));
        }
        for dependency in &entry.depends {
            self.queue
                .push_back((dependency.clone(), format!("{}-{}", entry.name, entry.version)));
        }
        Ok(())
    }

    /// A selected package providing `name` in a satisfying version.
    fn satisfied_by(&self, name: &str, constraints: &[Constraint]) -> Option<String> {
        if let Some(entry) = self.selected.get(name) {
            let version = ApkVersion::parse(&entry.version);
            if constraints.iter().all(|c| c.matches(&version)) {
                return Some(entry.name.clone());
            }
            return None;
        }
        self.provided.get(name).and_then(|providers| {
            providers
                .iter()
                .find(|(_, version)| {
                    constraints.iter().all(|c| match (&c.version, version) {
                        (None, _) => true,
                        (Some(_), Some(v)) => c.matches(v),
                        (Some(_), None) => false,
                    })
                })
                .map(|(package, _)| package.clone())
        })
    }
}

/// Fetch the index for `arch` and resolve the manifest's packages against it.
pub async fn resolve_packages(
    source: &dyn PackageSource,
    manifest: &Manifest,
    arch: Architecture,
) -> Result<Vec<ResolvedPackage>> {
    let index = source
        .fetch_index(
            &manifest.contents.repositories,
            &manifest.contents.keyring,
            arch,
        )
        .await?;
    tracing::debug!(arch = %arch, entries = index.len(), "Fetched package index");

    let resolved = PackageResolver::new(&index, arch).resolve(&manifest.contents.packages)?;
    tracing::info!(arch = %arch, packages = resolved.len(), "Resolved packages");
    Ok(resolved)
}
