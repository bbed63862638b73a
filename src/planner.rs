// src/planner.rs

//! Turn a resolution graph into an ordered list of transaction steps
//!
//! Plan layout:
//! 1. every `Fetch`, dependencies first (these may be prefetched concurrently)
//! 2. every pure removal, dependents first: `RemoveFiles`, `RecordRemoval`
//! 3. per install-side package, dependencies first: `Unpack`, `LinkFiles`,
//!    `RemoveFiles` (files an update no longer ships), `RecordInstall`
//!
//! Orderings use Kahn's algorithm with ties broken by package name.

use crate::error::{Error, Result};
use crate::filesystem;
use crate::index::{ArchiveRef, ManifestEntry, PackageId};
use crate::resolver::{Action, ResolutionGraph};
use crate::state::InstalledRecord;
use crate::version::PackageVersion;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info};

/// One unit of work in a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    /// Download the archive into staging and verify its checksum
    Fetch {
        package: PackageId,
        archive: ArchiveRef,
    },
    /// Unpack the staged archive and verify it against the manifest
    Unpack {
        package: PackageId,
        files: Vec<ManifestEntry>,
    },
    /// Copy unpacked files under the install root
    LinkFiles {
        package: PackageId,
        files: Vec<ManifestEntry>,
    },
    /// Delete files from the install root
    RemoveFiles {
        package: PackageId,
        files: Vec<ManifestEntry>,
    },
    /// Write (or replace) the installed record
    RecordInstall {
        record: InstalledRecord,
        previous: Option<InstalledRecord>,
    },
    /// Delete the installed record
    RecordRemoval { record: InstalledRecord },
}

impl Step {
    /// Short stable name, stored in the journal
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Fetch { .. } => "fetch",
            Step::Unpack { .. } => "unpack",
            Step::LinkFiles { .. } => "link_files",
            Step::RemoveFiles { .. } => "remove_files",
            Step::RecordInstall { .. } => "record_install",
            Step::RecordRemoval { .. } => "record_removal",
        }
    }

    /// Package the step belongs to
    pub fn package(&self) -> PackageId {
        match self {
            Step::Fetch { package, .. }
            | Step::Unpack { package, .. }
            | Step::LinkFiles { package, .. }
            | Step::RemoveFiles { package, .. } => package.clone(),
            Step::RecordInstall { record, .. } | Step::RecordRemoval { record } => record.id(),
        }
    }

    /// True for steps that mutate the installed-state store
    pub fn is_record_step(&self) -> bool {
        matches!(self, Step::RecordInstall { .. } | Step::RecordRemoval { .. })
    }

    /// True for steps whose output lives in the staging directory
    pub fn is_staging_step(&self) -> bool {
        matches!(self, Step::Fetch { .. } | Step::Unpack { .. })
    }

    pub fn describe(&self) -> String {
        format!("{} {}", self.kind(), self.package())
    }
}

/// Per-package summary of what a plan does
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageChange {
    pub name: String,
    pub action: Action,
    pub from: Option<PackageVersion>,
    pub to: Option<PackageVersion>,
    /// Explicit flag set on an already-installed package
    pub promote: bool,
}

/// Ordered steps plus the context the executor needs
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub steps: Vec<Step>,
    /// State generation the plan was computed against
    pub generation: i64,
    pub changes: Vec<PackageChange>,
    pub orphans: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

/// Build the step list for a graph
pub fn plan(graph: &ResolutionGraph) -> Result<Plan> {
    let mut plan = Plan {
        generation: graph.generation(),
        orphans: graph.orphans().to_vec(),
        ..Plan::default()
    };

    if !graph.has_changes() {
        debug!("Nothing to do");
        return Ok(plan);
    }

    let manifests = normalized_manifests(graph)?;
    check_file_ownership(graph, &manifests)?;

    let surviving: Vec<usize> = (0..graph.len())
        .filter(|&i| !graph.node(i).is_removed())
        .collect();
    let removed: Vec<usize> = (0..graph.len())
        .filter(|&i| graph.node(i).is_removed())
        .collect();

    // Dependencies before dependents
    let install_order = kahn(graph, &surviving, |n| {
        graph
            .node(n)
            .dependencies
            .iter()
            .copied()
            .filter(|d| !graph.node(*d).is_removed())
            .collect()
    })?;

    // Dependents before dependencies
    let removal_order = kahn(graph, &removed, |n| {
        graph
            .dependents(n)
            .into_iter()
            .filter(|d| graph.node(*d).is_removed())
            .collect()
    })?;

    for &idx in &install_order {
        let node = graph.node(idx);
        if !node.action.is_install_side() {
            continue;
        }
        let package = node.package.as_ref().ok_or_else(|| {
            Error::InvalidRequest(format!("{} has no package to install", node.name))
        })?;
        plan.steps.push(Step::Fetch {
            package: node.id(),
            archive: package.archive.clone(),
        });
    }

    for &idx in &removal_order {
        let node = graph.node(idx);
        let record = node
            .installed
            .clone()
            .ok_or_else(|| Error::NotInstalled(node.name.clone()))?;
        if !record.files.is_empty() {
            plan.steps.push(Step::RemoveFiles {
                package: node.id(),
                files: record.files.clone(),
            });
        }
        plan.steps.push(Step::RecordRemoval { record });
    }

    for &idx in &install_order {
        let node = graph.node(idx);
        match node.action {
            Action::Install | Action::Upgrade | Action::Downgrade => {
                let package = node.package.as_ref().ok_or_else(|| {
                    Error::InvalidRequest(format!("{} has no package to install", node.name))
                })?;
                let files = manifests.get(&idx).cloned().unwrap_or_default();

                plan.steps.push(Step::Unpack {
                    package: node.id(),
                    files: files.clone(),
                });
                plan.steps.push(Step::LinkFiles {
                    package: node.id(),
                    files: files.clone(),
                });

                if let Some(previous) = &node.installed {
                    let shipped: HashSet<&str> = files.iter().map(|f| f.path.as_str()).collect();
                    let stale: Vec<ManifestEntry> = previous
                        .files
                        .iter()
                        .filter(|f| !shipped.contains(f.path.as_str()))
                        .cloned()
                        .collect();
                    if !stale.is_empty() {
                        plan.steps.push(Step::RemoveFiles {
                            package: node.id(),
                            files: stale,
                        });
                    }
                }

                let mut record = InstalledRecord::from_package(package, node.explicit);
                record.files = files;
                plan.steps.push(Step::RecordInstall {
                    record,
                    previous: node.installed.clone(),
                });
            }
            Action::Keep if node.promote => {
                let previous = node
                    .installed
                    .clone()
                    .ok_or_else(|| Error::NotInstalled(node.name.clone()))?;
                let mut record = previous.clone();
                record.explicit = true;
                plan.steps.push(Step::RecordInstall {
                    record,
                    previous: Some(previous),
                });
            }
            Action::Keep | Action::Remove => {}
        }
    }

    plan.changes = graph
        .changes()
        .map(|node| PackageChange {
            name: node.name.clone(),
            action: node.action,
            from: node.installed.as_ref().map(|r| r.version.clone()),
            to: if node.is_removed() {
                None
            } else {
                Some(node.version.clone())
            },
            promote: node.promote,
        })
        .collect();

    info!(
        "Planned {} step(s) for {} package change(s)",
        plan.steps.len(),
        plan.changes.len()
    );
    Ok(plan)
}

/// Manifest of every install-side node with validated, relative paths
fn normalized_manifests(graph: &ResolutionGraph) -> Result<BTreeMap<usize, Vec<ManifestEntry>>> {
    let mut manifests = BTreeMap::new();

    for (idx, node) in graph.nodes().iter().enumerate() {
        if !node.action.is_install_side() {
            continue;
        }
        let Some(package) = &node.package else {
            continue;
        };

        let mut seen = BTreeSet::new();
        let mut files = Vec::with_capacity(package.files.len());
        for entry in &package.files {
            let path = filesystem::relative_path(&entry.path).map_err(|e| {
                Error::CorruptArchive {
                    package: node.id().to_string(),
                    reason: e.to_string(),
                }
            })?;
            let path = path.to_string_lossy().into_owned();
            if !seen.insert(path.clone()) {
                return Err(Error::CorruptArchive {
                    package: node.id().to_string(),
                    reason: format!("duplicate manifest entry {}", path),
                });
            }
            files.push(ManifestEntry::new(path, entry.sha256.clone(), entry.mode));
        }
        manifests.insert(idx, files);
    }

    Ok(manifests)
}

/// A path may only move to a new owner when its old owner is removed
/// outright
fn check_file_ownership(
    graph: &ResolutionGraph,
    manifests: &BTreeMap<usize, Vec<ManifestEntry>>,
) -> Result<()> {
    let mut owners: BTreeMap<&str, usize> = BTreeMap::new();

    // Current owners that survive the transaction keep their claim
    for (idx, node) in graph.nodes().iter().enumerate() {
        if node.is_removed() {
            continue;
        }
        if let Some(record) = &node.installed {
            for file in &record.files {
                owners.entry(file.path.as_str()).or_insert(idx);
            }
        }
    }

    for (&idx, files) in manifests {
        let node = graph.node(idx);
        for file in files {
            match owners.get(file.path.as_str()) {
                Some(&owner) if owner != idx => {
                    let other = graph.node(owner);
                    return Err(Error::Conflict {
                        package: node.id().to_string(),
                        conflicts_with: format!("{} (file {})", other.id(), file.path),
                    });
                }
                Some(_) => {}
                None => {
                    owners.insert(file.path.as_str(), idx);
                }
            }
        }
    }

    Ok(())
}

/// Kahn's algorithm over `members`, ties broken by name
///
/// `before(n)` lists the members that must precede `n`.
fn kahn<F>(graph: &ResolutionGraph, members: &[usize], before: F) -> Result<Vec<usize>>
where
    F: Fn(usize) -> Vec<usize>,
{
    let member_set: BTreeSet<usize> = members.iter().copied().collect();
    let mut pending: BTreeMap<usize, usize> = BTreeMap::new();
    let mut successors: BTreeMap<usize, Vec<usize>> = BTreeMap::new();

    for &n in members {
        let preds: BTreeSet<usize> = before(n)
            .into_iter()
            .filter(|p| member_set.contains(p) && *p != n)
            .collect();
        pending.insert(n, preds.len());
        for p in preds {
            successors.entry(p).or_default().push(n);
        }
    }

    let mut ready: BTreeSet<(&str, usize)> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(&n, _)| (graph.node(n).name.as_str(), n))
        .collect();

    let mut order = Vec::with_capacity(members.len());
    while let Some((_, n)) = ready.pop_first() {
        order.push(n);
        for &succ in successors.get(&n).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(count) = pending.get_mut(&succ) {
                *count -= 1;
                if *count == 0 {
                    ready.insert((graph.node(succ).name.as_str(), succ));
                }
            }
        }
    }

    if order.len() != members.len() {
        let cycle: Vec<String> = members
            .iter()
            .filter(|n| !order.contains(n))
            .map(|&n| graph.node(n).name.clone())
            .collect();
        return Err(Error::CyclicDependency { cycle });
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{DependencyConstraint, Package, PackageIndex};
    use crate::resolver::{Request, resolve};
    use crate::state::InstalledState;
    use crate::version::VersionConstraint;

    fn pkg(name: &str, version: &str, deps: &[&str], files: &[&str]) -> Package {
        Package {
            name: name.to_string(),
            version: PackageVersion::parse(version).unwrap(),
            repository: "core".to_string(),
            description: None,
            dependencies: deps
                .iter()
                .map(|d| DependencyConstraint::new(*d, VersionConstraint::Any))
                .collect(),
            conflicts: Vec::new(),
            files: files
                .iter()
                .map(|f| ManifestEntry::new(*f, format!("sum-{}", f), 0o644))
                .collect(),
            size: 0,
            archive: ArchiveRef {
                location: format!("{}-{}.tar.gz", name, version),
                checksum: "archive-sum".to_string(),
            },
        }
    }

    fn index(packages: Vec<Package>) -> PackageIndex {
        let mut index = PackageIndex::new();
        index.add_repository("core", packages);
        index
    }

    fn installed(packages: &[(Package, bool)]) -> InstalledState {
        InstalledState::from_records(
            packages
                .iter()
                .map(|(p, explicit)| InstalledRecord::from_package(p, *explicit)),
            0,
        )
    }

    fn rendered(plan: &Plan) -> Vec<String> {
        plan.steps
            .iter()
            .map(|s| format!("{}:{}", s.kind(), s.package().name))
            .collect()
    }

    fn position(plan: &Plan, kind: &str, name: &str) -> usize {
        plan.steps
            .iter()
            .position(|s| s.kind() == kind && s.package().name == name)
            .unwrap()
    }

    #[test]
    fn test_install_orders_dependencies_first() {
        let idx = index(vec![
            pkg("a", "1.0", &[], &["usr/lib/liba.so"]),
            pkg("b", "2.0", &["a"], &["usr/bin/b"]),
        ]);
        let graph = resolve(&InstalledState::default(), &idx, &[Request::install("b")]).unwrap();
        let plan = plan(&graph).unwrap();

        assert_eq!(
            rendered(&plan),
            vec![
                "fetch:a",
                "fetch:b",
                "unpack:a",
                "link_files:a",
                "record_install:a",
                "unpack:b",
                "link_files:b",
                "record_install:b",
            ]
        );
        assert_eq!(plan.changes.len(), 2);
    }

    #[test]
    fn test_cascade_removal_orders_dependents_first() {
        let a = pkg("a", "1.0", &[], &["usr/lib/liba.so"]);
        let b = pkg("b", "1.0", &["a"], &["usr/bin/b"]);
        let state = installed(&[(a, true), (b, false)]);

        let graph = resolve(&state, &index(vec![]), &[Request::remove_cascade("a")]).unwrap();
        let plan = plan(&graph).unwrap();

        assert_eq!(
            rendered(&plan),
            vec![
                "remove_files:b",
                "record_removal:b",
                "remove_files:a",
                "record_removal:a",
            ]
        );
    }

    #[test]
    fn test_upgrade_removes_only_dropped_files() {
        let old = pkg("a", "1.0", &[], &["usr/bin/a", "usr/share/a/old.dat"]);
        let state = installed(&[(old.clone(), true)]);
        let idx = index(vec![old, pkg("a", "2.0", &[], &["usr/bin/a", "usr/share/a/new.dat"])]);

        let graph = resolve(&state, &idx, &[Request::update("a")]).unwrap();
        let plan = plan(&graph).unwrap();

        assert_eq!(
            rendered(&plan),
            vec![
                "fetch:a",
                "unpack:a",
                "link_files:a",
                "remove_files:a",
                "record_install:a",
            ]
        );
        match &plan.steps[3] {
            Step::RemoveFiles { files, .. } => {
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].path, "usr/share/a/old.dat");
            }
            other => panic!("unexpected step {:?}", other),
        }
        match &plan.steps[4] {
            Step::RecordInstall { record, previous } => {
                assert_eq!(record.version.to_string(), "2.0");
                assert_eq!(previous.as_ref().unwrap().version.to_string(), "1.0");
                assert!(record.explicit);
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_promotion_is_a_single_record_step() {
        let a = pkg("a", "1.0", &[], &["usr/bin/a"]);
        let state = installed(&[(a.clone(), false)]);
        let graph = resolve(&state, &index(vec![a]), &[Request::install("a")]).unwrap();
        let plan = plan(&graph).unwrap();

        assert_eq!(rendered(&plan), vec!["record_install:a"]);
        match &plan.steps[0] {
            Step::RecordInstall { record, .. } => assert!(record.explicit),
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_empty_graph_gives_empty_plan() {
        let plan = plan(&ResolutionGraph::new(0)).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_file_owned_by_other_package_is_a_conflict() {
        let a = pkg("a", "1.0", &[], &["usr/bin/tool"]);
        let state = installed(&[(a.clone(), true)]);
        let idx = index(vec![a, pkg("b", "1.0", &[], &["/usr/bin/tool"])]);

        let graph = resolve(&state, &idx, &[Request::install("b")]).unwrap();
        match plan(&graph) {
            Err(Error::Conflict { package, conflicts_with }) => {
                assert_eq!(package, "b@1.0");
                assert!(conflicts_with.contains("usr/bin/tool"));
            }
            other => panic!("expected Conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_unsafe_manifest_path_rejected() {
        let idx = index(vec![pkg("evil", "1.0", &[], &["../etc/passwd"])]);
        let graph = resolve(&InstalledState::default(), &idx, &[Request::install("evil")]).unwrap();
        assert!(matches!(plan(&graph), Err(Error::CorruptArchive { .. })));
    }

    #[test]
    fn test_install_never_precedes_dependency() {
        let idx = index(vec![
            pkg("base", "1.0", &[], &[]),
            pkg("lib", "1.0", &["base"], &[]),
            pkg("app", "1.0", &["lib", "base"], &[]),
            pkg("tool", "1.0", &["base"], &[]),
        ]);
        let graph = resolve(
            &InstalledState::default(),
            &idx,
            &[Request::install("app"), Request::install("tool")],
        )
        .unwrap();
        let plan = plan(&graph).unwrap();

        for node in graph.nodes() {
            for &dep in &node.dependencies {
                let dep_name = &graph.node(dep).name;
                for kind in ["fetch", "unpack", "link_files", "record_install"] {
                    assert!(position(&plan, kind, dep_name) < position(&plan, kind, &node.name));
                }
            }
        }
    }
}
