// src/resolver/mod.rs

//! Dependency resolution
//!
//! Turns the installed state, the package index and a list of requests into
//! a [`ResolutionGraph`]. Every installed package that is not being removed
//! is part of the target state; it keeps its version unless some constraint
//! forces it to move.
//!
//! The search is chronological backtracking over an explicit stack of
//! decision frames. Each frame holds one package name and its ordered
//! candidate list; the next undecided name is always the alphabetically
//! first name that is required but not yet assigned, which keeps the result
//! independent of request order.

pub mod graph;

pub use graph::{Action, Node, ResolutionGraph};

use crate::error::{Error, Requirement, Result, Unsatisfiable};
use crate::index::{ConflictDecl, DependencyConstraint, Package, PackageIndex};
use crate::state::{InstalledRecord, InstalledState};
use crate::version::{PackageVersion, VersionConstraint};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// A requested change to the installed state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Install {
        name: String,
        constraint: VersionConstraint,
    },
    Remove {
        name: String,
        cascade: bool,
    },
    UpdateOne(String),
    UpdateAll,
}

impl Request {
    pub fn install(name: impl Into<String>) -> Self {
        Request::Install {
            name: name.into(),
            constraint: VersionConstraint::Any,
        }
    }

    pub fn install_matching(name: impl Into<String>, constraint: VersionConstraint) -> Self {
        Request::Install {
            name: name.into(),
            constraint,
        }
    }

    pub fn remove(name: impl Into<String>) -> Self {
        Request::Remove {
            name: name.into(),
            cascade: false,
        }
    }

    pub fn remove_cascade(name: impl Into<String>) -> Self {
        Request::Remove {
            name: name.into(),
            cascade: true,
        }
    }

    pub fn update(name: impl Into<String>) -> Self {
        Request::UpdateOne(name.into())
    }

    /// Parse `name` or `name@constraint`
    pub fn parse_install(spec: &str) -> Result<Self> {
        let (name, constraint) = match spec.split_once('@') {
            Some((name, constraint)) => (name.trim(), VersionConstraint::parse(constraint)?),
            None => (spec.trim(), VersionConstraint::Any),
        };
        if name.is_empty() {
            return Err(Error::InvalidRequest(format!("missing package name in '{}'", spec)));
        }
        Ok(Request::install_matching(name, constraint))
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Install { name, constraint } if constraint.is_any() => write!(f, "install {}", name),
            Request::Install { name, constraint } => write!(f, "install {}@{}", name, constraint),
            Request::Remove { name, cascade: false } => write!(f, "remove {}", name),
            Request::Remove { name, cascade: true } => write!(f, "remove {} (cascade)", name),
            Request::UpdateOne(name) => write!(f, "update {}", name),
            Request::UpdateAll => f.write_str("update all"),
        }
    }
}

/// Resolve `requests` against the installed state and index
pub fn resolve(
    installed: &InstalledState,
    index: &PackageIndex,
    requests: &[Request],
) -> Result<ResolutionGraph> {
    Resolver::new(installed, index).resolve(requests)
}

/// Requests folded by kind
#[derive(Debug, Default)]
struct RequestSet {
    installs: BTreeMap<String, Vec<VersionConstraint>>,
    removes: BTreeMap<String, bool>,
    updates: BTreeSet<String>,
    update_all: bool,
}

impl RequestSet {
    fn is_unpinned(&self, name: &str) -> bool {
        self.update_all || self.updates.contains(name)
    }
}

#[derive(Debug, Clone, Copy)]
enum Origin<'a> {
    Index(&'a Package),
    Installed(&'a InstalledRecord),
}

/// One version that could be assigned to a name
#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    version: &'a PackageVersion,
    dependencies: &'a [DependencyConstraint],
    conflicts: &'a [ConflictDecl],
    origin: Origin<'a>,
}

impl<'a> Candidate<'a> {
    fn from_package(package: &'a Package) -> Self {
        Self {
            version: &package.version,
            dependencies: &package.dependencies,
            conflicts: &package.conflicts,
            origin: Origin::Index(package),
        }
    }

    fn from_record(record: &'a InstalledRecord) -> Self {
        Self {
            version: &record.version,
            dependencies: &record.dependencies,
            conflicts: &record.conflicts,
            origin: Origin::Installed(record),
        }
    }
}

/// Decision frame on the search stack
struct Frame<'a> {
    name: String,
    candidates: Vec<Candidate<'a>>,
    /// Next candidate to try
    next: usize,
}

/// Why a candidate was refused
#[derive(Debug)]
enum Rejection {
    /// A request or an assigned package constrains this name differently
    Requirement,
    /// The candidate needs a version of an assigned package it cannot have
    Dependency(DependencyConstraint),
    /// The candidate needs a package that is being removed
    RemovedDependency(String),
    Conflict {
        package: String,
        conflicts_with: String,
    },
}

/// Backtracking resolver over borrowed state and index
pub struct Resolver<'a> {
    installed: &'a InstalledState,
    index: &'a PackageIndex,
}

impl<'a> Resolver<'a> {
    pub fn new(installed: &'a InstalledState, index: &'a PackageIndex) -> Self {
        Self { installed, index }
    }

    pub fn resolve(&self, requests: &[Request]) -> Result<ResolutionGraph> {
        info!(
            "Resolving {} request(s) against {} installed package(s)",
            requests.len(),
            self.installed.len()
        );

        let set = self.collect_requests(requests)?;
        let removed = self.removal_set(&set)?;

        let mut roots: BTreeSet<String> = self
            .installed
            .names()
            .filter(|name| !removed.contains(*name))
            .map(str::to_string)
            .collect();
        roots.extend(set.installs.keys().cloned());

        let assigned = self.search(&set, &removed, &roots)?;
        let graph = self.build_graph(&assigned, &set, &removed)?;

        debug!(
            "Resolution complete: {} node(s), {} orphan proposal(s)",
            graph.len(),
            graph.orphans().len()
        );
        Ok(graph)
    }

    fn collect_requests(&self, requests: &[Request]) -> Result<RequestSet> {
        let mut set = RequestSet::default();

        for request in requests {
            match request {
                Request::Install { name, constraint } => {
                    if name.is_empty() {
                        return Err(Error::InvalidRequest("empty package name".to_string()));
                    }
                    set.installs
                        .entry(name.clone())
                        .or_default()
                        .push(constraint.clone());
                }
                Request::Remove { name, cascade } => {
                    if !self.installed.contains(name) {
                        return Err(Error::NotInstalled(name.clone()));
                    }
                    let entry = set.removes.entry(name.clone()).or_insert(false);
                    *entry |= *cascade;
                }
                Request::UpdateOne(name) => {
                    if !self.installed.contains(name) {
                        return Err(Error::NotInstalled(name.clone()));
                    }
                    set.updates.insert(name.clone());
                }
                Request::UpdateAll => set.update_all = true,
            }
        }

        for name in set.removes.keys() {
            if set.installs.contains_key(name) {
                return Err(Error::InvalidRequest(format!(
                    "{} is requested for both install and removal",
                    name
                )));
            }
            if set.updates.contains(name) {
                return Err(Error::InvalidRequest(format!(
                    "{} is requested for both update and removal",
                    name
                )));
            }
        }

        Ok(set)
    }

    /// Removal targets plus, for cascading removals, their transitive
    /// dependents
    fn removal_set(&self, set: &RequestSet) -> Result<BTreeSet<String>> {
        let mut removed: BTreeSet<String> = set.removes.keys().cloned().collect();

        let mut queue: Vec<String> = set
            .removes
            .iter()
            .filter(|(_, cascade)| **cascade)
            .map(|(name, _)| name.clone())
            .collect();
        while let Some(name) = queue.pop() {
            for dependent in self.installed.dependents(&name) {
                if removed.insert(dependent.name.clone()) {
                    debug!("Cascading removal of {} to {}", name, dependent.name);
                    queue.push(dependent.name.clone());
                }
            }
        }

        for (name, cascade) in &set.removes {
            if *cascade {
                continue;
            }
            let dependents: Vec<String> = self
                .installed
                .dependents(name)
                .into_iter()
                .filter(|r| !removed.contains(&r.name))
                .map(|r| r.name.clone())
                .collect();
            if !dependents.is_empty() {
                return Err(Error::RemovalBlocked {
                    package: name.clone(),
                    dependents,
                });
            }
        }

        if let Some(name) = set.installs.keys().find(|n| removed.contains(*n)) {
            return Err(Error::InvalidRequest(format!(
                "{} is requested for install but removed by a cascading removal",
                name
            )));
        }

        Ok(removed)
    }

    /// Ordered candidates for a name
    ///
    /// Installed packages not being updated try their installed version
    /// first. Everything else goes highest version first. The installed
    /// record stands in for its own version even when the index no longer
    /// offers it.
    fn candidates_for(&self, name: &str, set: &RequestSet) -> Vec<Candidate<'a>> {
        let installed = self.installed.get(name);
        let mut candidates: Vec<Candidate<'a>> = Vec::new();
        let mut seen: Vec<&PackageVersion> = Vec::new();

        let pinned = installed.is_some() && !set.is_unpinned(name);
        if let (true, Some(record)) = (pinned, installed) {
            candidates.push(Candidate::from_record(record));
            seen.push(&record.version);
        }

        for package in self.index.candidates(name) {
            // Equal versions from lower-ranked repositories are the same identity
            if seen.contains(&&package.version) {
                continue;
            }
            seen.push(&package.version);
            match installed {
                Some(record) if record.version == package.version => {
                    candidates.push(Candidate::from_record(record));
                }
                _ => candidates.push(Candidate::from_package(package)),
            }
        }

        if let Some(record) = installed {
            if !seen.contains(&&record.version) {
                candidates.push(Candidate::from_record(record));
                candidates.sort_by(|a, b| b.version.cmp(a.version));
            }
        }

        candidates
    }

    /// Names that must be assigned given the current partial assignment
    fn required(
        &self,
        roots: &BTreeSet<String>,
        assigned: &BTreeMap<String, Candidate<'a>>,
        removed: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        let mut required = roots.clone();
        for candidate in assigned.values() {
            for dep in candidate.dependencies {
                if !dep.optional && !removed.contains(&dep.name) {
                    required.insert(dep.name.clone());
                }
            }
        }
        required
    }

    /// Check a candidate against requests and the partial assignment
    fn check(
        &self,
        name: &str,
        candidate: &Candidate<'a>,
        assigned: &BTreeMap<String, Candidate<'a>>,
        set: &RequestSet,
        removed: &BTreeSet<String>,
    ) -> Option<Rejection> {
        if let Some(constraints) = set.installs.get(name) {
            if constraints.iter().any(|c| !c.matches(candidate.version)) {
                return Some(Rejection::Requirement);
            }
        }

        // Optional dependencies constrain the version when the package is present
        for other in assigned.values() {
            if other
                .dependencies
                .iter()
                .any(|d| d.name == name && !d.constraint.matches(candidate.version))
            {
                return Some(Rejection::Requirement);
            }
        }

        for dep in candidate.dependencies {
            if removed.contains(&dep.name) {
                if !dep.optional {
                    return Some(Rejection::RemovedDependency(dep.name.clone()));
                }
                continue;
            }
            if let Some(target) = assigned.get(&dep.name) {
                if !dep.constraint.matches(target.version) {
                    return Some(Rejection::Dependency(dep.clone()));
                }
            }
        }

        for (other_name, other) in assigned {
            if candidate
                .conflicts
                .iter()
                .any(|c| c.matches(other_name, other.version))
            {
                return Some(Rejection::Conflict {
                    package: format!("{}@{}", name, candidate.version),
                    conflicts_with: format!("{}@{}", other_name, other.version),
                });
            }
            if other.conflicts.iter().any(|c| c.matches(name, candidate.version)) {
                return Some(Rejection::Conflict {
                    package: format!("{}@{}", other_name, other.version),
                    conflicts_with: format!("{}@{}", name, candidate.version),
                });
            }
        }

        None
    }

    fn search(
        &self,
        set: &RequestSet,
        removed: &BTreeSet<String>,
        roots: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Candidate<'a>>> {
        let mut stack: Vec<Frame<'a>> = Vec::new();
        let mut assigned: BTreeMap<String, Candidate<'a>> = BTreeMap::new();
        let mut failure: Option<Error> = None;

        loop {
            let required = self.required(roots, &assigned, removed);
            let Some(name) = required.into_iter().find(|n| !assigned.contains_key(n)) else {
                break;
            };
            let candidates = self.candidates_for(&name, set);
            debug!("Deciding {} ({} candidate(s))", name, candidates.len());
            stack.push(Frame {
                name,
                candidates,
                next: 0,
            });

            // Advance the top frame, popping exhausted frames
            loop {
                let Some(depth) = stack.len().checked_sub(1) else {
                    return Err(failure.unwrap_or_else(|| {
                        Error::InvalidRequest("no consistent assignment".to_string())
                    }));
                };

                let found = {
                    let frame = &stack[depth];
                    (frame.next..frame.candidates.len()).find(|&i| {
                        self.check(&frame.name, &frame.candidates[i], &assigned, set, removed)
                            .is_none()
                    })
                };

                match found {
                    Some(i) => {
                        let frame = &mut stack[depth];
                        frame.next = i + 1;
                        let candidate = frame.candidates[i];
                        debug!("Selected {}@{}", frame.name, candidate.version);
                        assigned.insert(frame.name.clone(), candidate);
                        break;
                    }
                    None => {
                        if failure.is_none() {
                            failure = Some(self.exhausted(
                                &stack[depth],
                                &stack[..depth],
                                &assigned,
                                set,
                                removed,
                                roots,
                            ));
                        }
                        debug!("No candidate left for {}, backtracking", stack[depth].name);
                        stack.pop();
                        if let Some(previous) = stack.last() {
                            assigned.remove(&previous.name);
                        }
                    }
                }
            }
        }

        Ok(assigned)
    }

    /// Error describing why a frame ran out of candidates
    fn exhausted(
        &self,
        frame: &Frame<'a>,
        below: &[Frame<'a>],
        assigned: &BTreeMap<String, Candidate<'a>>,
        set: &RequestSet,
        removed: &BTreeSet<String>,
        roots: &BTreeSet<String>,
    ) -> Error {
        let rejections: Vec<(Candidate<'a>, Rejection)> = frame
            .candidates
            .iter()
            .filter_map(|c| {
                self.check(&frame.name, c, assigned, set, removed)
                    .map(|r| (*c, r))
            })
            .collect();

        let all_conflicts = !rejections.is_empty()
            && rejections
                .iter()
                .all(|(_, r)| matches!(r, Rejection::Conflict { .. }));

        let first = rejections.into_iter().next();
        match first {
            Some((_, Rejection::Conflict { package, conflicts_with })) if all_conflicts => {
                Error::Conflict {
                    package,
                    conflicts_with,
                }
            }
            Some((candidate, Rejection::Dependency(dep))) => {
                let mut chain = self.chain_to(&frame.name, below, assigned, roots);
                chain.push(format!("{}@{}", frame.name, candidate.version));
                let extra = Requirement {
                    chain,
                    name: dep.name.clone(),
                    constraint: dep.constraint.clone(),
                };
                self.unsatisfiable(&dep.name, below, assigned, set, roots, Some(extra))
            }
            Some((_, Rejection::RemovedDependency(dep))) => Error::RemovalBlocked {
                package: dep,
                dependents: vec![frame.name.clone()],
            },
            _ => self.unsatisfiable(&frame.name, below, assigned, set, roots, None),
        }
    }

    fn unsatisfiable(
        &self,
        name: &str,
        frames: &[Frame<'a>],
        assigned: &BTreeMap<String, Candidate<'a>>,
        set: &RequestSet,
        roots: &BTreeSet<String>,
        extra: Option<Requirement>,
    ) -> Error {
        let mut requirements: Vec<Requirement> = set
            .installs
            .get(name)
            .into_iter()
            .flatten()
            .map(|constraint| Requirement {
                chain: Vec::new(),
                name: name.to_string(),
                constraint: constraint.clone(),
            })
            .collect();

        for frame in frames {
            let Some(holder) = assigned.get(&frame.name) else {
                continue;
            };
            for dep in holder.dependencies.iter().filter(|d| d.name == name) {
                requirements.push(Requirement {
                    chain: self.chain_to(&frame.name, frames, assigned, roots),
                    name: name.to_string(),
                    constraint: dep.constraint.clone(),
                });
            }
        }
        requirements.extend(extra);

        Error::Unsatisfiable(Unsatisfiable {
            package: name.to_string(),
            requirements,
            available: self.available(name),
        })
    }

    /// Path of assigned packages from a root down to `holder`, inclusive
    fn chain_to(
        &self,
        holder: &str,
        frames: &[Frame<'a>],
        assigned: &BTreeMap<String, Candidate<'a>>,
        roots: &BTreeSet<String>,
    ) -> Vec<String> {
        let mut chain = Vec::new();
        let mut visited = BTreeSet::new();
        let mut current = holder.to_string();

        while let Some(candidate) = assigned.get(&current) {
            if !visited.insert(current.clone()) {
                break;
            }
            chain.push(format!("{}@{}", current, candidate.version));
            if roots.contains(&current) {
                break;
            }
            // Whoever was decided first and depends on it pulled it in
            let parent = frames.iter().map(|f| &f.name).find(|n| {
                **n != current
                    && assigned
                        .get(*n)
                        .is_some_and(|c| c.dependencies.iter().any(|d| d.name == current))
            });
            match parent {
                Some(parent) => current = parent.clone(),
                None => break,
            }
        }

        chain.reverse();
        chain
    }

    /// Every version of a name that could have been chosen
    fn available(&self, name: &str) -> Vec<PackageVersion> {
        let mut versions = self.index.versions(name);
        if let Some(record) = self.installed.get(name) {
            if !versions.contains(&record.version) {
                versions.push(record.version.clone());
                versions.sort_by(|a, b| b.cmp(a));
            }
        }
        versions
    }

    fn build_graph(
        &self,
        assigned: &BTreeMap<String, Candidate<'a>>,
        set: &RequestSet,
        removed: &BTreeSet<String>,
    ) -> Result<ResolutionGraph> {
        let mut graph = ResolutionGraph::new(self.installed.generation());

        let names: BTreeSet<&String> = assigned.keys().chain(removed.iter()).collect();
        for name in names {
            let installed = self.installed.get(name);

            let node = if removed.contains(name) {
                let record = installed.ok_or_else(|| Error::NotInstalled(name.clone()))?;
                Node {
                    name: name.clone(),
                    version: record.version.clone(),
                    action: Action::Remove,
                    package: None,
                    installed: Some(record.clone()),
                    explicit: record.explicit,
                    promote: false,
                    dependencies: Vec::new(),
                }
            } else {
                let candidate = assigned
                    .get(name)
                    .ok_or_else(|| Error::InvalidRequest(format!("{} was never resolved", name)))?;
                let action = match installed {
                    None => Action::Install,
                    Some(record) => match candidate.version.cmp(&record.version) {
                        Ordering::Equal => Action::Keep,
                        Ordering::Greater => Action::Upgrade,
                        Ordering::Less => Action::Downgrade,
                    },
                };
                let package = match candidate.origin {
                    Origin::Index(package) => Some(package.clone()),
                    Origin::Installed(_) => None,
                };
                let requested = set.installs.contains_key(name);
                let was_explicit = installed.is_some_and(|r| r.explicit);

                if action != Action::Keep {
                    info!(
                        "{} {} {}",
                        action,
                        name,
                        match installed {
                            Some(record) => format!("{} -> {}", record.version, candidate.version),
                            None => candidate.version.to_string(),
                        }
                    );
                }

                Node {
                    name: name.clone(),
                    version: candidate.version.clone(),
                    action,
                    package,
                    installed: installed.cloned(),
                    explicit: was_explicit || requested,
                    promote: requested && installed.is_some() && !was_explicit,
                    dependencies: Vec::new(),
                }
            };
            graph.add_node(node)?;
        }

        let mut edges = Vec::new();
        for (idx, node) in graph.nodes().iter().enumerate() {
            let dependencies: &[DependencyConstraint] = if node.is_removed() {
                node.installed
                    .as_ref()
                    .map(|r| r.dependencies.as_slice())
                    .unwrap_or(&[])
            } else {
                assigned
                    .get(&node.name)
                    .map(|c| c.dependencies)
                    .unwrap_or(&[])
            };
            for dep in dependencies {
                let Some(target) = graph.index_of(&dep.name) else {
                    continue;
                };
                // A surviving package never points at a removed one
                if !node.is_removed() && graph.node(target).is_removed() {
                    continue;
                }
                edges.push((idx, target));
            }
        }
        for (from, to) in edges {
            graph.add_edge(from, to);
        }

        graph.check_acyclic()?;

        if set.update_all || !set.removes.is_empty() {
            let orphans = find_orphans(&graph);
            if !orphans.is_empty() {
                info!("Orphaned packages proposed for removal: {}", orphans.join(", "));
            }
            graph.set_orphans(orphans);
        }

        Ok(graph)
    }
}

/// Non-explicit packages nothing surviving depends on, to a fixpoint
fn find_orphans(graph: &ResolutionGraph) -> Vec<String> {
    let mut orphans: BTreeSet<String> = BTreeSet::new();

    loop {
        let mut changed = false;
        for (idx, node) in graph.nodes().iter().enumerate() {
            if node.is_removed() || node.explicit || orphans.contains(&node.name) {
                continue;
            }
            let needed = graph.dependents(idx).into_iter().any(|d| {
                let dependent = graph.node(d);
                !dependent.is_removed() && !orphans.contains(&dependent.name)
            });
            if !needed {
                orphans.insert(node.name.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    orphans.into_iter().collect()
}
