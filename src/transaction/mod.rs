// src/transaction/mod.rs

//! Transaction executor
//!
//! A plan is written to the journal in full before the first step runs.
//! Steps then run one at a time: each is marked `in_progress` before it
//! starts and `committed` once it finished. Record steps change the installed
//! state and mark themselves committed in the same SQLite transaction.
//!
//! When a step fails (or the transaction is cancelled) the steps already
//! committed, plus the failed one, are compensated in reverse order. A
//! compensation that fails is recorded and the journal ends in
//! `rollback_failed`, which blocks further sessions until an operator
//! clears it.
//!
//! After a crash, [`Executor::recover`] picks up every active journal: a
//! journal with an interrupted step is rolled back, any other journal
//! resumes at its first pending step.

pub mod journal;
mod steps;

pub use journal::{JournalEntry, Progress, TransactionJournal};
pub use steps::Staging;

use crate::config::Config;
use crate::db;
use crate::db::models::{JournalStatus, StepStatus};
use crate::error::{Error, Result};
use crate::planner::{Plan, Step};
use crate::repository::ArchiveFetcher;
use crate::state;
use rayon::prelude::*;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use steps::StepContext;
use tracing::{debug, error, info, warn};

/// Cooperative cancellation, checked between steps
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The step that stopped a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedStep {
    pub seq: i64,
    pub step: Step,
}

/// A compensation that could not be completed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompensationFailure {
    pub seq: i64,
    pub step: String,
    pub error: String,
}

/// Outcome of running (or recovering) one journal
#[derive(Debug)]
pub struct Execution {
    pub journal_id: i64,
    pub status: JournalStatus,
    pub steps: Vec<Step>,
    /// Steps this run applied, by sequence number
    pub committed: Vec<i64>,
    /// Steps whose post-state already held
    pub skipped: Vec<i64>,
    pub failed: Option<FailedStep>,
    pub error: Option<Error>,
    /// Steps undone during rollback
    pub compensated: Vec<i64>,
    pub compensation_failures: Vec<CompensationFailure>,
}

impl Execution {
    fn new(journal: &TransactionJournal) -> Self {
        Self {
            journal_id: journal.id(),
            status: journal.status(),
            steps: journal.steps(),
            committed: Vec::new(),
            skipped: Vec::new(),
            failed: None,
            error: None,
            compensated: Vec::new(),
            compensation_failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JournalStatus::Committed
    }
}

/// Applies plans against the filesystem and the installed-state store
pub struct Executor<'a> {
    conn: &'a mut Connection,
    config: &'a Config,
    fetcher: &'a dyn ArchiveFetcher,
    cancel: CancelToken,
}

impl<'a> Executor<'a> {
    pub fn new(conn: &'a mut Connection, config: &'a Config, fetcher: &'a dyn ArchiveFetcher) -> Self {
        Self {
            conn,
            config,
            fetcher,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Journal and run a plan
    ///
    /// Errors returned here happened before anything was changed (stale
    /// state, database failures while writing the journal). Step failures
    /// are reported in the returned `Execution`.
    pub fn execute(&mut self, plan: &Plan, description: &str) -> Result<Execution> {
        let found = state::current_generation(self.conn)?;
        if found != plan.generation {
            return Err(Error::StaleState {
                expected: plan.generation,
                found,
            });
        }

        let mut journal = TransactionJournal::create(self.conn, plan, description)?;
        info!("Executing journal {}: {}", journal.id(), description);
        self.run_forward(&mut journal)
    }

    /// Finish every active journal left behind by an earlier process
    pub fn recover(&mut self) -> Result<Vec<Execution>> {
        let mut executions = Vec::new();
        for pending in journal::active_journals(self.conn)? {
            let id = pending.id.unwrap_or_default();
            warn!("Recovering unfinished journal {} ({})", id, pending.description);
            executions.push(self.resume(id)?);
        }
        Ok(executions)
    }

    /// Resume or roll back one active journal
    pub fn resume(&mut self, journal_id: i64) -> Result<Execution> {
        let mut journal = TransactionJournal::load(self.conn, journal_id)?;
        if journal.status() != JournalStatus::Active {
            return Err(Error::InvalidRequest(format!(
                "journal {} is {}, not active",
                journal_id,
                journal.status().as_str()
            )));
        }

        match journal.progress() {
            Progress::Forward => {
                info!("Resuming journal {}", journal_id);
                self.run_forward(&mut journal)
            }
            Progress::Rollback => {
                info!("Rolling back interrupted journal {}", journal_id);
                let mut execution = Execution::new(&journal);
                let open = journal
                    .entries
                    .iter()
                    .position(|e| matches!(e.status(), StepStatus::InProgress | StepStatus::Failed));
                if let Some(pos) = open {
                    let entry = &mut journal.entries[pos];
                    if entry.status() == StepStatus::InProgress {
                        journal::mark(
                            self.conn,
                            &mut entry.row,
                            StepStatus::Failed,
                            Some("interrupted".to_string()),
                        )?;
                    }
                    execution.failed = Some(FailedStep {
                        seq: entry.seq(),
                        step: entry.step.clone(),
                    });
                }
                execution.error = Some(Error::StepExecution {
                    step: execution
                        .failed
                        .as_ref()
                        .map(|f| f.step.describe())
                        .unwrap_or_else(|| "rollback".to_string()),
                    reason: "interrupted before completion".to_string(),
                });
                self.rollback(&mut journal, &mut execution)?;
                Ok(execution)
            }
        }
    }

    fn staging(&self, journal: &TransactionJournal) -> Staging {
        Staging::new(self.config.staging_dir(journal.id()))
    }

    /// Fetch every pending archive concurrently
    ///
    /// Returns the outcome per step sequence number for the archives this
    /// pass fetched; archives already staged are left alone.
    fn prefetch(&self, journal: &TransactionJournal, staging: &Staging) -> HashMap<i64, std::result::Result<(), String>> {
        let wanted: Vec<(i64, &Step)> = journal
            .entries
            .iter()
            .filter(|e| e.status() == StepStatus::Pending)
            .filter(|e| matches!(e.step, Step::Fetch { .. }))
            .map(|e| (e.seq(), &e.step))
            .collect();
        if wanted.len() < 2 {
            return HashMap::new();
        }

        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.fetch_workers.max(1))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                warn!("Prefetch disabled, could not start worker pool: {}", e);
                return HashMap::new();
            }
        };

        let fetcher = self.fetcher;
        debug!("Prefetching {} archive(s) with {} worker(s)", wanted.len(), pool.current_num_threads());
        pool.install(|| {
            wanted
                .par_iter()
                .filter_map(|(seq, step)| match step {
                    Step::Fetch { package, archive } => {
                        let path = staging.archive_path(package);
                        if crate::filesystem::file_matches(&path, &archive.checksum).unwrap_or(false) {
                            return None;
                        }
                        let outcome = steps::fetch_archive(fetcher, staging, package, archive)
                            .map_err(|e| e.to_string());
                        Some((*seq, outcome))
                    }
                    _ => None,
                })
                .collect()
        })
    }

    fn run_forward(&mut self, journal: &mut TransactionJournal) -> Result<Execution> {
        let mut execution = Execution::new(journal);
        let staging = self.staging(journal);
        let root = self.config.root.clone();
        let journal_id = journal.id();

        let prefetched = if self.cancel.is_cancelled() {
            HashMap::new()
        } else {
            self.prefetch(journal, &staging)
        };

        for pos in 0..journal.entries.len() {
            let entry = &journal.entries[pos];
            let seq = entry.seq();
            let step = entry.step.clone();
            let ctx = StepContext {
                root: &root,
                staging: &staging,
                fetcher: self.fetcher,
                seq,
            };

            if entry.status() == StepStatus::Committed {
                // Replay: only re-apply when the post-state no longer holds.
                // Staging output only matters while a later step consumes it.
                let satisfied = if step.is_staging_step() && !self.staging_output_needed(journal, pos, &ctx)? {
                    true
                } else {
                    steps::is_applied(self.conn, &ctx, &step)?
                };
                if satisfied {
                    debug!("Step {} ({}) already applied", seq, step.describe());
                    execution.skipped.push(seq);
                    continue;
                }
                warn!("Re-applying committed step {} ({})", seq, step.describe());
            } else if self.cancel.is_cancelled() {
                info!("Transaction {} cancelled before step {}", journal_id, seq);
                execution.error = Some(Error::Cancelled);
                self.rollback(journal, &mut execution)?;
                return Ok(execution);
            } else {
                journal::mark(self.conn, &mut journal.entries[pos].row, StepStatus::InProgress, None)?;

                if let Some(Ok(())) = prefetched.get(&seq) {
                    debug!("Step {} ({}) was prefetched", seq, step.describe());
                } else if steps::is_applied(self.conn, &ctx, &step)? {
                    debug!("Step {} ({}) post-state already holds", seq, step.describe());
                    self.commit(journal, pos, None)?;
                    execution.skipped.push(seq);
                    continue;
                }
            }

            let outcome = match prefetched.get(&seq) {
                Some(Err(reason)) => Err(Error::Fetch {
                    package: step.package().to_string(),
                    reason: reason.clone(),
                }),
                Some(Ok(())) => Ok(()),
                None => steps::apply_files(&ctx, &step),
            };

            let outcome = outcome.and_then(|()| {
                if step.is_record_step() {
                    self.commit(journal, pos, Some(&step))
                } else {
                    self.commit(journal, pos, None)
                }
            });

            match outcome {
                Ok(()) => {
                    info!("Committed step {} ({})", seq, step.describe());
                    execution.committed.push(seq);
                }
                Err(e) => {
                    error!("Step {} ({}) failed: {}", seq, step.describe(), e);
                    journal::mark(
                        self.conn,
                        &mut journal.entries[pos].row,
                        StepStatus::Failed,
                        Some(e.to_string()),
                    )?;
                    execution.failed = Some(FailedStep { seq, step });
                    execution.error = Some(e);
                    self.rollback(journal, &mut execution)?;
                    return Ok(execution);
                }
            }
        }

        journal.finish(self.conn, JournalStatus::Committed, None)?;
        execution.status = JournalStatus::Committed;
        if let Err(e) = staging.remove() {
            warn!("Failed to remove staging {}: {}", staging.dir().display(), e);
        }
        info!(
            "Journal {} committed ({} applied, {} already in place)",
            journal_id,
            execution.committed.len(),
            execution.skipped.len()
        );
        Ok(execution)
    }

    /// Whether a later step of the same package still reads what the
    /// staging step at `pos` produced
    ///
    /// Unpack and link steps consume staging. A pending consumer needs it,
    /// and so does a committed link whose files are no longer in place.
    fn staging_output_needed(&self, journal: &TransactionJournal, pos: usize, ctx: &StepContext<'_>) -> Result<bool> {
        let package = journal.entries[pos].step.package();
        for later in &journal.entries[pos + 1..] {
            if !matches!(later.step, Step::Unpack { .. } | Step::LinkFiles { .. }) || later.step.package() != package {
                continue;
            }
            if later.status() != StepStatus::Committed {
                return Ok(true);
            }
            if matches!(later.step, Step::LinkFiles { .. }) && !steps::is_applied(&*self.conn, ctx, &later.step)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Mark a step committed, applying a record step's store mutation in
    /// the same SQLite transaction
    fn commit(&mut self, journal: &mut TransactionJournal, pos: usize, record: Option<&Step>) -> Result<()> {
        let journal_id = journal.id();
        let row = &mut journal.entries[pos].row;
        db::transaction(self.conn, |tx| {
            if let Some(step) = record {
                steps::apply_record(tx, step, journal_id)?;
            }
            row.update_status(tx, StepStatus::Committed, None)
        })
    }

    /// Compensate settled and failed steps in reverse order
    fn rollback(&mut self, journal: &mut TransactionJournal, execution: &mut Execution) -> Result<()> {
        let staging = self.staging(journal);
        let root = self.config.root.clone();

        for pos in (0..journal.entries.len()).rev() {
            let status = journal.entries[pos].status();
            if status == StepStatus::CompensationFailed {
                // Failed in an earlier pass; the journal cannot end rolled back
                let entry = &journal.entries[pos];
                warn!("Step {} ({}) was left uncompensated", entry.seq(), entry.step.describe());
                execution.compensation_failures.push(CompensationFailure {
                    seq: entry.seq(),
                    step: entry.step.describe(),
                    error: entry
                        .row
                        .error
                        .clone()
                        .unwrap_or_else(|| "compensation failed".to_string()),
                });
                continue;
            }
            let needs_undo = match status {
                StepStatus::Committed => true,
                // A failed record step rolled back with its SQLite transaction
                StepStatus::Failed => !journal.entries[pos].step.is_record_step(),
                _ => false,
            };
            if !needs_undo {
                continue;
            }

            let seq = journal.entries[pos].seq();
            let step = journal.entries[pos].step.clone();
            let ctx = StepContext {
                root: &root,
                staging: &staging,
                fetcher: self.fetcher,
                seq,
            };

            let result = if step.is_record_step() {
                let row = &mut journal.entries[pos].row;
                db::transaction(self.conn, |tx| {
                    steps::compensate_record(tx, &step)?;
                    row.update_status(tx, StepStatus::Compensated, None)
                })
            } else {
                steps::compensate_files(&ctx, &step).and_then(|()| {
                    if status == StepStatus::Committed {
                        journal::mark(self.conn, &mut journal.entries[pos].row, StepStatus::Compensated, None)
                    } else {
                        Ok(())
                    }
                })
            };

            match result {
                Ok(()) => {
                    debug!("Compensated step {} ({})", seq, step.describe());
                    execution.compensated.push(seq);
                }
                Err(e) => {
                    error!("Compensation of step {} ({}) failed: {}", seq, step.describe(), e);
                    let reason = e.to_string();
                    if let Err(mark_err) = journal::mark(
                        self.conn,
                        &mut journal.entries[pos].row,
                        StepStatus::CompensationFailed,
                        Some(reason.clone()),
                    ) {
                        error!("Could not record compensation failure: {}", mark_err);
                    }
                    execution.compensation_failures.push(CompensationFailure {
                        seq,
                        step: step.describe(),
                        error: reason,
                    });
                }
            }
        }

        let original = execution
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "rolled back".to_string());

        if execution.compensation_failures.is_empty() {
            journal.finish(self.conn, JournalStatus::RolledBack, Some(original))?;
            execution.status = JournalStatus::RolledBack;
            if let Err(e) = staging.remove() {
                warn!("Failed to remove staging {}: {}", staging.dir().display(), e);
            }
        } else {
            let detail = format!(
                "{}; {} compensation(s) failed",
                original,
                execution.compensation_failures.len()
            );
            journal.finish(self.conn, JournalStatus::RollbackFailed, Some(detail))?;
            execution.status = JournalStatus::RollbackFailed;
            error!(
                "Rollback of journal {} incomplete; staging kept at {}",
                journal.id(),
                staging.dir().display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Journal;
    use crate::filesystem::sha256_bytes;
    use crate::index::{ArchiveRef, DependencyConstraint, ManifestEntry, PackageId};
    use crate::repository::LocalFetcher;
    use crate::state::{InstalledRecord, InstalledState};
    use crate::version::{PackageVersion, VersionConstraint};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::fs;
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Config, Connection) {
        let config = Config::rooted(dir.path());
        db::init(&config.db_path).unwrap();
        let conn = db::open(&config.db_path).unwrap();
        (config, conn)
    }

    fn fetch_plan(dir: &TempDir, generation: i64) -> Plan {
        let archive = dir.path().join("a-1.0.tar.gz");
        std::fs::write(&archive, b"bytes").unwrap();
        Plan {
            steps: vec![Step::Fetch {
                package: PackageId::new("a", PackageVersion::parse("1.0").unwrap()),
                archive: ArchiveRef {
                    location: archive.display().to_string(),
                    checksum: crate::filesystem::sha256_bytes(b"bytes"),
                },
            }],
            generation,
            ..Plan::default()
        }
    }

    #[test]
    fn test_stale_plan_is_refused() {
        let dir = TempDir::new().unwrap();
        let (config, mut conn) = setup(&dir);
        let plan = fetch_plan(&dir, 7);

        let mut executor = Executor::new(&mut conn, &config, &LocalFetcher);
        match executor.execute(&plan, "stale") {
            Err(Error::StaleState { expected, found }) => {
                assert_eq!(expected, 7);
                assert_eq!(found, 0);
            }
            other => panic!("expected StaleState, got {:?}", other),
        }
        assert!(Journal::list_all(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let (config, mut conn) = setup(&dir);
        let plan = fetch_plan(&dir, 0);

        let cancel = CancelToken::new();
        cancel.cancel();
        let execution = Executor::new(&mut conn, &config, &LocalFetcher)
            .with_cancel(cancel)
            .execute(&plan, "cancelled")
            .unwrap();

        assert_eq!(execution.status, JournalStatus::RolledBack);
        assert!(matches!(execution.error, Some(Error::Cancelled)));
        assert!(execution.committed.is_empty());
    }

    #[test]
    fn test_fetch_only_plan_commits_and_cleans_staging() {
        let dir = TempDir::new().unwrap();
        let (config, mut conn) = setup(&dir);
        let plan = fetch_plan(&dir, 0);

        let execution = Executor::new(&mut conn, &config, &LocalFetcher)
            .execute(&plan, "fetch")
            .unwrap();

        assert!(execution.is_success());
        assert_eq!(execution.committed, vec![0]);
        assert!(!config.staging_dir(execution.journal_id).exists());
    }

    #[test]
    fn test_resumed_rollback_keeps_earlier_compensation_failures() {
        let dir = TempDir::new().unwrap();
        let (config, mut conn) = setup(&dir);
        let fetch = |name: &str| Step::Fetch {
            package: PackageId::new(name, PackageVersion::parse("1.0").unwrap()),
            archive: ArchiveRef {
                location: dir.path().join(format!("{}.tar.gz", name)).display().to_string(),
                checksum: sha256_bytes(name.as_bytes()),
            },
        };
        let plan = Plan {
            steps: vec![fetch("a"), fetch("b"), fetch("c"), fetch("d")],
            ..Plan::default()
        };

        // Crash after compensating step 1 failed, before the journal was finished
        let mut tj = TransactionJournal::create(&mut conn, &plan, "t").unwrap();
        journal::mark(&conn, &mut tj.entries[0].row, StepStatus::Committed, None).unwrap();
        journal::mark(
            &conn,
            &mut tj.entries[1].row,
            StepStatus::CompensationFailed,
            Some("disk full".to_string()),
        )
        .unwrap();
        journal::mark(&conn, &mut tj.entries[2].row, StepStatus::Failed, Some("boom".to_string())).unwrap();

        let execution = Executor::new(&mut conn, &config, &LocalFetcher)
            .resume(tj.id())
            .unwrap();

        assert_eq!(execution.status, JournalStatus::RollbackFailed);
        assert_eq!(execution.compensation_failures.len(), 1);
        assert_eq!(execution.compensation_failures[0].seq, 1);
        assert_eq!(execution.compensation_failures[0].error, "disk full");
        assert_eq!(execution.compensated, vec![2, 0]);

        let row = Journal::find_by_id(&conn, tj.id()).unwrap().unwrap();
        assert_eq!(row.status, JournalStatus::RollbackFailed);
        assert!(matches!(
            journal::ensure_no_failed_rollback(&conn),
            Err(Error::JournalCorruption(_))
        ));
    }

    fn gzip_archive(path: &str, data: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&builder.into_inner().unwrap()).unwrap();
        encoder.finish().unwrap()
    }

    /// Fetch, unpack, link and record `a` (which needs `b`) and `b`, in
    /// the order the planner emits them
    fn install_plan(repo: &Path) -> Plan {
        fs::create_dir_all(repo).unwrap();
        let version = PackageVersion::parse("1.0").unwrap();
        let packages = [("a", "usr/bin/a", b"a1"), ("b", "usr/lib/libb.so", b"b1")];

        let mut fetches = Vec::new();
        let mut installs = Vec::new();
        for (name, path, data) in packages {
            let archive = gzip_archive(path, data);
            let location = repo.join(format!("{}-1.0.tar.gz", name));
            fs::write(&location, &archive).unwrap();

            let id = PackageId::new(name, version.clone());
            let files = vec![ManifestEntry::new(path, sha256_bytes(data), 0o644)];
            let dependencies = if name == "a" {
                vec![DependencyConstraint::new("b", VersionConstraint::parse(">=1.0").unwrap())]
            } else {
                Vec::new()
            };
            let record = InstalledRecord {
                name: name.to_string(),
                version: version.clone(),
                repository: Some("main".to_string()),
                explicit: name == "a",
                installed_at: "2024-01-01 00:00:00".to_string(),
                files: files.clone(),
                dependencies,
                conflicts: Vec::new(),
            };

            fetches.push(Step::Fetch {
                package: id.clone(),
                archive: ArchiveRef {
                    location: location.display().to_string(),
                    checksum: sha256_bytes(&archive),
                },
            });
            installs.push(vec![
                Step::Unpack {
                    package: id.clone(),
                    files: files.clone(),
                },
                Step::LinkFiles { package: id, files },
                Step::RecordInstall { record, previous: None },
            ]);
        }

        // b first: a depends on it
        let mut steps = fetches;
        steps.extend(installs.pop().unwrap());
        steps.extend(installs.pop().unwrap());
        Plan {
            steps,
            ..Plan::default()
        }
    }

    /// Apply the first `k` steps the way the executor does, then stop
    fn run_prefix(conn: &mut Connection, config: &Config, tj: &mut TransactionJournal, k: usize) {
        let staging = Staging::new(config.staging_dir(tj.id()));
        let mut executor = Executor::new(conn, config, &LocalFetcher);
        for pos in 0..k {
            let step = tj.entries[pos].step.clone();
            let ctx = StepContext {
                root: &config.root,
                staging: &staging,
                fetcher: &LocalFetcher,
                seq: tj.entries[pos].seq(),
            };
            steps::apply_files(&ctx, &step).unwrap();
            let record = step.is_record_step().then_some(&step);
            executor.commit(tj, pos, record).unwrap();
        }
    }

    type Snapshot = (i64, Vec<(String, String, bool, Vec<String>)>, Vec<Option<Vec<u8>>>);

    fn snapshot(conn: &Connection, root: &Path) -> Snapshot {
        let state = InstalledState::load(conn).unwrap();
        let records = state
            .records()
            .map(|r| {
                (
                    r.name.clone(),
                    r.version.to_string(),
                    r.explicit,
                    r.files.iter().map(|f| f.path.clone()).collect(),
                )
            })
            .collect();
        let files = ["usr/bin/a", "usr/lib/libb.so"]
            .iter()
            .map(|p| fs::read(root.join(p)).ok())
            .collect();
        (state.generation(), records, files)
    }

    #[test]
    fn test_resume_after_any_committed_prefix_matches_uninterrupted_run() {
        let reference = {
            let dir = TempDir::new().unwrap();
            let (config, mut conn) = setup(&dir);
            let plan = install_plan(&dir.path().join("repo"));
            let execution = Executor::new(&mut conn, &config, &LocalFetcher)
                .execute(&plan, "install a")
                .unwrap();
            assert!(execution.is_success());
            snapshot(&conn, &config.root)
        };
        assert_eq!(reference.1.len(), 2);
        assert_eq!(reference.2, vec![Some(b"a1".to_vec()), Some(b"b1".to_vec())]);

        let total = install_plan(&TempDir::new().unwrap().path().join("repo")).steps.len();
        for k in 1..=total {
            let dir = TempDir::new().unwrap();
            let (config, mut conn) = setup(&dir);
            let plan = install_plan(&dir.path().join("repo"));
            let mut tj = TransactionJournal::create(&mut conn, &plan, "install a").unwrap();
            run_prefix(&mut conn, &config, &mut tj, k);

            let execution = Executor::new(&mut conn, &config, &LocalFetcher)
                .resume(tj.id())
                .unwrap();
            assert!(execution.is_success(), "k = {}: {:?}", k, execution.error);
            assert_eq!(execution.skipped.len(), k, "k = {}", k);
            assert_eq!(execution.committed.len(), total - k, "k = {}", k);
            assert_eq!(snapshot(&conn, &config.root), reference, "k = {}", k);
        }
    }

    #[test]
    fn test_replay_does_not_refetch_consumed_archives() {
        let dir = TempDir::new().unwrap();
        let (config, mut conn) = setup(&dir);
        let repo = dir.path().join("repo");
        let plan = install_plan(&repo);

        let execution = Executor::new(&mut conn, &config, &LocalFetcher)
            .execute(&plan, "install a")
            .unwrap();
        assert!(execution.is_success());
        let before = snapshot(&conn, &config.root);

        // Finished but never marked so; staging is gone and so is the repository
        let mut row = Journal::find_by_id(&conn, execution.journal_id).unwrap().unwrap();
        row.update_status(&conn, JournalStatus::Active, None).unwrap();
        fs::remove_dir_all(&repo).unwrap();

        let replayed = Executor::new(&mut conn, &config, &LocalFetcher)
            .resume(execution.journal_id)
            .unwrap();
        assert!(replayed.is_success(), "{:?}", replayed.error);
        assert_eq!(replayed.skipped.len(), plan.steps.len());
        assert!(replayed.committed.is_empty());
        assert_eq!(snapshot(&conn, &config.root), before);
    }

    #[test]
    fn test_cancel_after_committed_steps_rolls_back() {
        let dir = TempDir::new().unwrap();
        let (config, mut conn) = setup(&dir);
        let plan = install_plan(&dir.path().join("repo"));

        // b is fully installed when the cancellation lands
        let mut tj = TransactionJournal::create(&mut conn, &plan, "install a").unwrap();
        run_prefix(&mut conn, &config, &mut tj, 5);
        assert!(config.root.join("usr/lib/libb.so").is_file());

        let cancel = CancelToken::new();
        cancel.cancel();
        let execution = Executor::new(&mut conn, &config, &LocalFetcher)
            .with_cancel(cancel)
            .resume(tj.id())
            .unwrap();

        assert_eq!(execution.status, JournalStatus::RolledBack);
        assert!(matches!(execution.error, Some(Error::Cancelled)));
        assert_eq!(execution.compensated, vec![4, 3, 2, 1, 0]);
        assert!(execution.compensation_failures.is_empty());

        let (_, records, files) = snapshot(&conn, &config.root);
        assert!(records.is_empty());
        assert_eq!(files, vec![None, None]);
        assert!(!config.root.join("usr").exists());
        assert!(!config.staging_dir(tj.id()).exists());

        let loaded = TransactionJournal::load(&conn, tj.id()).unwrap();
        assert!(loaded.entries[..5].iter().all(|e| e.status() == StepStatus::Compensated));
        assert!(loaded.entries[5..].iter().all(|e| e.status() == StepStatus::Pending));
    }
}
