// src/report.rs

//! Structured result of a transaction, for the CLI to render
//!
//! The library never formats reports for humans; it hands out this value
//! and the binary prints it as text or JSON.

use crate::db::models::JournalStatus;
use crate::error::Error;
use crate::planner::{PackageChange, Plan, Step};
use crate::resolver::Action;
use crate::transaction::{CompensationFailure, Execution};
use crate::version::PackageVersion;
use serde::Serialize;
use std::cmp::Ordering;

/// What happened to one package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Dry run: nothing was changed
    Planned,
    Applied,
    RolledBack,
    /// Rollback did not complete; the package may be half-applied
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageReport {
    pub name: String,
    pub action: Action,
    pub from: Option<PackageVersion>,
    pub to: Option<PackageVersion>,
    pub promote: bool,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub seq: i64,
    pub kind: String,
    pub package: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
}

impl From<&Error> for ErrorReport {
    fn from(error: &Error) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// Everything a caller needs to tell the user about a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionReport {
    pub journal_id: Option<i64>,
    pub status: String,
    pub dry_run: bool,
    pub packages: Vec<PackageReport>,
    /// Non-explicit packages nothing depends on any more; never removed
    /// automatically
    pub orphans: Vec<String>,
    pub steps_total: usize,
    pub steps_committed: usize,
    pub steps_skipped: usize,
    pub failed_step: Option<StepReport>,
    pub error: Option<ErrorReport>,
    pub compensation_failures: Vec<CompensationFailure>,
}

impl TransactionReport {
    /// Report for a plan that was not executed
    pub fn planned(plan: &Plan) -> Self {
        Self {
            journal_id: None,
            status: if plan.is_empty() { "nothing_to_do" } else { "planned" }.to_string(),
            dry_run: true,
            packages: package_reports(&plan.changes, Outcome::Planned),
            orphans: plan.orphans.clone(),
            steps_total: plan.steps.len(),
            steps_committed: 0,
            steps_skipped: 0,
            failed_step: None,
            error: None,
            compensation_failures: Vec::new(),
        }
    }

    /// Report for an executed plan
    pub fn executed(plan: &Plan, execution: &Execution) -> Self {
        let mut report = Self::from_execution(execution);
        report.packages = package_reports(&plan.changes, outcome_of(execution.status));
        report.orphans = plan.orphans.clone();
        report
    }

    /// Report for a journal run without its plan (recovery)
    ///
    /// Package changes are reconstructed from the record steps.
    pub fn from_execution(execution: &Execution) -> Self {
        let changes = changes_from_steps(&execution.steps);
        Self {
            journal_id: Some(execution.journal_id),
            status: execution.status.as_str().to_string(),
            dry_run: false,
            packages: package_reports(&changes, outcome_of(execution.status)),
            orphans: Vec::new(),
            steps_total: execution.steps.len(),
            steps_committed: execution.committed.len(),
            steps_skipped: execution.skipped.len(),
            failed_step: execution.failed.as_ref().map(|f| StepReport {
                seq: f.seq,
                kind: f.step.kind().to_string(),
                package: f.step.package().to_string(),
            }),
            error: execution.error.as_ref().map(ErrorReport::from),
            compensation_failures: execution.compensation_failures.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

fn outcome_of(status: JournalStatus) -> Outcome {
    match status {
        JournalStatus::Committed => Outcome::Applied,
        JournalStatus::RolledBack => Outcome::RolledBack,
        _ => Outcome::Unknown,
    }
}

fn package_reports(changes: &[PackageChange], outcome: Outcome) -> Vec<PackageReport> {
    changes
        .iter()
        .map(|c| PackageReport {
            name: c.name.clone(),
            action: c.action,
            from: c.from.clone(),
            to: c.to.clone(),
            promote: c.promote,
            outcome,
        })
        .collect()
}

fn changes_from_steps(steps: &[Step]) -> Vec<PackageChange> {
    let mut changes: Vec<PackageChange> = steps
        .iter()
        .filter_map(|step| match step {
            Step::RecordInstall { record, previous } => {
                let (action, promote) = match previous {
                    None => (Action::Install, false),
                    Some(p) => match record.version.cmp(&p.version) {
                        Ordering::Greater => (Action::Upgrade, false),
                        Ordering::Less => (Action::Downgrade, false),
                        Ordering::Equal => (Action::Keep, record.explicit && !p.explicit),
                    },
                };
                Some(PackageChange {
                    name: record.name.clone(),
                    action,
                    from: previous.as_ref().map(|p| p.version.clone()),
                    to: Some(record.version.clone()),
                    promote,
                })
            }
            Step::RecordRemoval { record } => Some(PackageChange {
                name: record.name.clone(),
                action: Action::Remove,
                from: Some(record.version.clone()),
                to: None,
                promote: false,
            }),
            _ => None,
        })
        .collect();
    changes.sort_by(|a, b| a.name.cmp(&b.name));
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ArchiveRef, Package};
    use crate::state::InstalledRecord;

    fn record(name: &str, version: &str, explicit: bool) -> InstalledRecord {
        let package = Package {
            name: name.to_string(),
            version: PackageVersion::parse(version).unwrap(),
            repository: "core".to_string(),
            description: None,
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            files: Vec::new(),
            size: 0,
            archive: ArchiveRef {
                location: String::new(),
                checksum: String::new(),
            },
        };
        InstalledRecord::from_package(&package, explicit)
    }

    #[test]
    fn test_changes_rebuilt_from_record_steps() {
        let steps = vec![
            Step::RecordRemoval {
                record: record("old", "1.0", false),
            },
            Step::RecordInstall {
                record: record("lib", "2.0", false),
                previous: Some(record("lib", "1.0", false)),
            },
            Step::RecordInstall {
                record: record("app", "1.0", true),
                previous: Some(record("app", "1.0", false)),
            },
        ];

        let changes = changes_from_steps(&steps);
        let summary: Vec<(&str, Action, bool)> = changes
            .iter()
            .map(|c| (c.name.as_str(), c.action, c.promote))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("app", Action::Keep, true),
                ("lib", Action::Upgrade, false),
                ("old", Action::Remove, false),
            ]
        );
    }

    #[test]
    fn test_planned_report_serializes() {
        let plan = Plan::default();
        let report = TransactionReport::planned(&plan);
        assert_eq!(report.status, "nothing_to_do");
        assert!(report.is_success());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["dry_run"], true);
        assert!(json["packages"].as_array().unwrap().is_empty());
    }
}
