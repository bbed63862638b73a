// src/transaction/journal.rs

//! Write-ahead journal persisted in the `journals` and `journal_steps` tables

use crate::db;
use crate::db::models::{Journal, JournalStatus, JournalStep, StepStatus};
use crate::error::{Error, Result};
use crate::planner::{Plan, Step};
use rusqlite::Connection;
use tracing::{debug, info};

/// One journal step with its decoded payload
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub row: JournalStep,
    pub step: Step,
}

impl JournalEntry {
    pub fn seq(&self) -> i64 {
        self.row.seq
    }

    pub fn status(&self) -> StepStatus {
        self.row.status
    }
}

/// A journal and all of its steps, in plan order
#[derive(Debug, Clone)]
pub struct TransactionJournal {
    pub journal: Journal,
    pub entries: Vec<JournalEntry>,
}

/// Where a journal stands, judged from its step statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Only committed and pending steps: execution can continue
    Forward,
    /// A step was interrupted or failed: the journal must be rolled back
    Rollback,
}

impl TransactionJournal {
    /// Persist a new journal with every step pending
    ///
    /// The journal row and all step rows are written in one SQLite
    /// transaction, before any step runs.
    pub fn create(conn: &mut Connection, plan: &Plan, description: &str) -> Result<Self> {
        let (journal, entries) = db::transaction(conn, |tx| {
            let mut journal = Journal::new(description.to_string(), plan.generation);
            let journal_id = journal.insert(tx)?;

            let mut entries = Vec::with_capacity(plan.steps.len());
            for (seq, step) in plan.steps.iter().enumerate() {
                let package = step.package();
                let mut row = JournalStep::new(
                    journal_id,
                    seq as i64,
                    step.kind().to_string(),
                    package.name,
                    package.version.to_string(),
                    serde_json::to_string(step)?,
                );
                row.insert(tx)?;
                entries.push(JournalEntry {
                    row,
                    step: step.clone(),
                });
            }
            Ok((journal, entries))
        })?;

        info!(
            "Created journal {} with {} step(s)",
            journal.id.unwrap_or_default(),
            entries.len()
        );
        Ok(Self { journal, entries })
    }

    /// Load a journal and decode its steps
    ///
    /// Anything unreadable is reported as `JournalCorruption`.
    pub fn load(conn: &Connection, journal_id: i64) -> Result<Self> {
        let journal = Journal::find_by_id(conn, journal_id)
            .map_err(|e| corruption(journal_id, format!("unreadable journal: {}", e)))?
            .ok_or_else(|| Error::NotFound(format!("Journal {} not found", journal_id)))?;

        let rows = JournalStep::find_by_journal(conn, journal_id)
            .map_err(|e| corruption(journal_id, format!("unreadable steps: {}", e)))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let step: Step = serde_json::from_str(&row.payload).map_err(|e| {
                corruption(journal_id, format!("step {} has an unreadable payload: {}", row.seq, e))
            })?;
            if step.kind() != row.kind {
                return Err(corruption(
                    journal_id,
                    format!("step {} is recorded as {} but holds {}", row.seq, row.kind, step.kind()),
                ));
            }
            entries.push(JournalEntry { row, step });
        }

        let loaded = Self { journal, entries };
        loaded.validate()?;
        debug!("Loaded journal {} ({} steps)", journal_id, loaded.entries.len());
        Ok(loaded)
    }

    pub fn id(&self) -> i64 {
        self.journal.id.unwrap_or_default()
    }

    pub fn status(&self) -> JournalStatus {
        self.journal.status
    }

    pub fn steps(&self) -> Vec<Step> {
        self.entries.iter().map(|e| e.step.clone()).collect()
    }

    /// Check sequence numbers and the order of step statuses
    ///
    /// Valid journals read as: settled steps (committed, compensated or
    /// compensation_failed), at most one in_progress or failed step, then
    /// pending steps.
    pub fn validate(&self) -> Result<()> {
        let id = self.id();
        let mut seen_open = false;
        let mut seen_pending = false;

        for (expected, entry) in self.entries.iter().enumerate() {
            if entry.seq() != expected as i64 {
                return Err(corruption(
                    id,
                    format!("step sequence gap: expected {}, found {}", expected, entry.seq()),
                ));
            }

            match entry.status() {
                StepStatus::Committed | StepStatus::Compensated | StepStatus::CompensationFailed => {
                    if seen_open || seen_pending {
                        return Err(corruption(
                            id,
                            format!("step {} is {} after an unfinished step", expected, entry.status().as_str()),
                        ));
                    }
                }
                StepStatus::InProgress | StepStatus::Failed => {
                    if seen_open || seen_pending {
                        return Err(corruption(
                            id,
                            format!("step {} is {} out of order", expected, entry.status().as_str()),
                        ));
                    }
                    seen_open = true;
                }
                StepStatus::Pending => seen_pending = true,
            }
        }
        Ok(())
    }

    /// Whether the journal can continue forward or must be rolled back
    pub fn progress(&self) -> Progress {
        let needs_rollback = self.entries.iter().any(|e| {
            matches!(
                e.status(),
                StepStatus::InProgress
                    | StepStatus::Failed
                    | StepStatus::Compensated
                    | StepStatus::CompensationFailed
            )
        });
        if needs_rollback {
            Progress::Rollback
        } else {
            Progress::Forward
        }
    }

    /// Set the journal's status
    pub fn finish(&mut self, conn: &Connection, status: JournalStatus, error: Option<String>) -> Result<()> {
        self.journal.update_status(conn, status, error)?;
        info!("Journal {} is now {}", self.id(), status.as_str());
        Ok(())
    }
}

/// Mark a step and persist it immediately
pub fn mark(conn: &Connection, row: &mut JournalStep, status: StepStatus, error: Option<String>) -> Result<()> {
    row.update_status(conn, status, error)?;
    debug!("Step {} of journal {} -> {}", row.seq, row.journal_id, status.as_str());
    Ok(())
}

fn corruption(journal_id: i64, reason: String) -> Error {
    Error::JournalCorruption(format!("journal {}: {}", journal_id, reason))
}

/// Journals that still need processing, oldest first
pub fn active_journals(conn: &Connection) -> Result<Vec<Journal>> {
    Journal::find_by_status(conn, JournalStatus::Active)
}

/// Refuse to continue while a failed rollback is unacknowledged
pub fn ensure_no_failed_rollback(conn: &Connection) -> Result<()> {
    let failed = Journal::find_by_status(conn, JournalStatus::RollbackFailed)?;
    if let Some(journal) = failed.first() {
        return Err(Error::JournalCorruption(format!(
            "rollback of journal {} ({}) failed: {}; inspect the system, then run journal-clear {}",
            journal.id.unwrap_or_default(),
            journal.description,
            journal.error.as_deref().unwrap_or("unknown error"),
            journal.id.unwrap_or_default()
        )));
    }
    Ok(())
}

/// Operator acknowledgement of a failed rollback
pub fn clear(conn: &Connection, journal_id: i64) -> Result<()> {
    let mut journal = Journal::find_by_id(conn, journal_id)?
        .ok_or_else(|| Error::NotFound(format!("Journal {} not found", journal_id)))?;
    if journal.status != JournalStatus::RollbackFailed {
        return Err(Error::InvalidRequest(format!(
            "journal {} is {}, only rollback_failed journals can be cleared",
            journal_id,
            journal.status.as_str()
        )));
    }
    let error = journal.error.clone();
    journal.update_status(conn, JournalStatus::Cleared, error)?;
    info!("Cleared journal {}", journal_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ArchiveRef, PackageId};
    use crate::version::PackageVersion;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> Connection {
        let path = dir.path().join("state.db");
        db::init(&path).unwrap();
        db::open(&path).unwrap()
    }

    fn fetch(name: &str) -> Step {
        Step::Fetch {
            package: PackageId::new(name, PackageVersion::parse("1.0").unwrap()),
            archive: ArchiveRef {
                location: format!("{}.tar.gz", name),
                checksum: "sum".to_string(),
            },
        }
    }

    fn plan(steps: Vec<Step>) -> Plan {
        Plan {
            steps,
            generation: 4,
            ..Plan::default()
        }
    }

    #[test]
    fn test_create_and_load() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_db(&dir);

        let created = TransactionJournal::create(&mut conn, &plan(vec![fetch("a"), fetch("b")]), "install b").unwrap();
        let loaded = TransactionJournal::load(&conn, created.id()).unwrap();

        assert_eq!(loaded.status(), JournalStatus::Active);
        assert_eq!(loaded.journal.state_generation, 4);
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.entries[1].step, fetch("b"));
        assert!(loaded.entries.iter().all(|e| e.status() == StepStatus::Pending));
        assert_eq!(loaded.progress(), Progress::Forward);
    }

    #[test]
    fn test_interrupted_step_requires_rollback() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_db(&dir);

        let mut journal = TransactionJournal::create(&mut conn, &plan(vec![fetch("a"), fetch("b")]), "t").unwrap();
        mark(&conn, &mut journal.entries[0].row, StepStatus::Committed, None).unwrap();
        mark(&conn, &mut journal.entries[1].row, StepStatus::InProgress, None).unwrap();

        let loaded = TransactionJournal::load(&conn, journal.id()).unwrap();
        assert_eq!(loaded.progress(), Progress::Rollback);
    }

    #[test]
    fn test_out_of_order_statuses_are_corruption() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_db(&dir);

        let mut journal = TransactionJournal::create(&mut conn, &plan(vec![fetch("a"), fetch("b")]), "t").unwrap();
        mark(&conn, &mut journal.entries[1].row, StepStatus::Committed, None).unwrap();

        assert!(matches!(
            TransactionJournal::load(&conn, journal.id()),
            Err(Error::JournalCorruption(_))
        ));
    }

    #[test]
    fn test_bad_payload_is_corruption() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_db(&dir);

        let journal = TransactionJournal::create(&mut conn, &plan(vec![fetch("a")]), "t").unwrap();
        conn.execute(
            "UPDATE journal_steps SET payload = 'not json' WHERE journal_id = ?1",
            [journal.id()],
        )
        .unwrap();

        assert!(matches!(
            TransactionJournal::load(&conn, journal.id()),
            Err(Error::JournalCorruption(_))
        ));
    }

    #[test]
    fn test_failed_rollback_blocks_until_cleared() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_db(&dir);

        let mut journal = TransactionJournal::create(&mut conn, &plan(vec![fetch("a")]), "t").unwrap();
        ensure_no_failed_rollback(&conn).unwrap();

        journal
            .finish(&conn, JournalStatus::RollbackFailed, Some("disk full".to_string()))
            .unwrap();
        assert!(matches!(
            ensure_no_failed_rollback(&conn),
            Err(Error::JournalCorruption(_))
        ));

        clear(&conn, journal.id()).unwrap();
        ensure_no_failed_rollback(&conn).unwrap();
        assert!(matches!(clear(&conn, journal.id()), Err(Error::InvalidRequest(_))));
    }
}
