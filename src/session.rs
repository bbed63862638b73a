// src/session.rs

//! A locked session against one installed-state store
//!
//! A `Session` owns the exclusive state lock for its whole lifetime and
//! threads one explicit [`Config`] through resolve, plan and execute. Opening
//! a session recovers any journal a crashed process left behind.

use crate::config::Config;
use crate::db;
use crate::db::models::Journal;
use crate::error::{Error, Result};
use crate::filesystem;
use crate::index::PackageIndex;
use crate::planner::{self, Plan};
use crate::report::TransactionReport;
use crate::repository::{ArchiveFetcher, HttpFetcher};
use crate::resolver::{self, Request, ResolutionGraph};
use crate::state::{InstalledState, StateLock};
use crate::transaction::{CancelToken, Executor, journal};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use tracing::{info, warn};

/// Problem found by [`Session::verify`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileIssue {
    pub package: String,
    pub path: String,
    pub problem: FileProblem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileProblem {
    Missing,
    Modified,
    /// Content intact, permission bits differ from the manifest
    ModeChanged,
}

pub struct Session {
    config: Config,
    conn: Connection,
    fetcher: Box<dyn ArchiveFetcher>,
    cancel: CancelToken,
    recovered: Vec<TransactionReport>,
    _lock: StateLock,
}

impl Session {
    /// Create the database and working directories
    pub fn init(config: &Config) -> Result<()> {
        db::init(&config.db_path)?;
        fs::create_dir_all(config.transactions_dir())?;
        info!("Initialized pkgmgr state at {}", config.db_path.display());
        Ok(())
    }

    /// Lock the store, recover unfinished journals and refuse to continue
    /// after a failed rollback
    pub fn open(config: Config) -> Result<Self> {
        let mut session = Self::open_unchecked(config)?;
        journal::ensure_no_failed_rollback(&session.conn)?;
        session.recovered = session.recover()?;
        journal::ensure_no_failed_rollback(&session.conn)?;
        Ok(session)
    }

    /// Lock the store without recovery; for inspecting and clearing journals
    pub fn open_unchecked(config: Config) -> Result<Self> {
        let lock = StateLock::acquire(&config.lock_path())?;
        let conn = db::open(&config.db_path)?;
        let fetcher: Box<dyn ArchiveFetcher> = Box::new(HttpFetcher::new()?);

        Ok(Self {
            config,
            conn,
            fetcher,
            cancel: CancelToken::new(),
            recovered: Vec::new(),
            _lock: lock,
        })
    }

    pub fn with_fetcher(mut self, fetcher: Box<dyn ArchiveFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Token that cancels the running transaction between steps
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Reports for journals recovered when the session was opened
    pub fn recovered(&self) -> &[TransactionReport] {
        &self.recovered
    }

    /// Resume or roll back every active journal
    pub fn recover(&mut self) -> Result<Vec<TransactionReport>> {
        let mut executor = Executor::new(&mut self.conn, &self.config, self.fetcher.as_ref())
            .with_cancel(self.cancel.clone());
        let executions = executor.recover()?;
        Ok(executions.iter().map(TransactionReport::from_execution).collect())
    }

    pub fn installed(&self) -> Result<InstalledState> {
        InstalledState::load(&self.conn)
    }

    pub fn load_index(&self) -> Result<PackageIndex> {
        PackageIndex::load(&self.conn, self.config.repository_order)
    }

    pub fn resolve(&self, requests: &[Request]) -> Result<ResolutionGraph> {
        let installed = self.installed()?;
        let index = self.load_index()?;
        resolver::resolve(&installed, &index, requests)
    }

    pub fn plan(&self, requests: &[Request]) -> Result<Plan> {
        planner::plan(&self.resolve(requests)?)
    }

    /// Execute a plan under a new journal
    pub fn apply(&mut self, plan: &Plan, description: &str) -> Result<TransactionReport> {
        journal::ensure_no_failed_rollback(&self.conn)?;
        if plan.is_empty() {
            return Ok(TransactionReport::planned(plan));
        }

        let mut executor = Executor::new(&mut self.conn, &self.config, self.fetcher.as_ref())
            .with_cancel(self.cancel.clone());
        let execution = executor.execute(plan, description)?;
        Ok(TransactionReport::executed(plan, &execution))
    }

    /// Resolve, plan and (unless `dry_run`) execute
    ///
    /// Resolution and planning errors are returned before anything changes;
    /// execution failures are described by the report.
    pub fn run(&mut self, requests: &[Request], dry_run: bool) -> Result<TransactionReport> {
        let plan = self.plan(requests)?;
        if dry_run {
            return Ok(TransactionReport::planned(&plan));
        }
        let description = requests
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        self.apply(&plan, &description)
    }

    /// Compare installed files with their recorded checksums
    pub fn verify(&self, name: Option<&str>) -> Result<Vec<FileIssue>> {
        let installed = self.installed()?;
        let records: Vec<_> = match name {
            Some(name) => vec![
                installed
                    .get(name)
                    .ok_or_else(|| Error::NotInstalled(name.to_string()))?,
            ],
            None => installed.records().collect(),
        };

        let mut issues = Vec::new();
        for record in records {
            for file in &record.files {
                let path = filesystem::join_relative(&self.config.root, &file.path)?;
                let problem = if !path.exists() {
                    Some(FileProblem::Missing)
                } else if !filesystem::file_matches(&path, &file.sha256)? {
                    Some(FileProblem::Modified)
                } else if filesystem::file_mode(&path)? != Some(file.mode & 0o7777) {
                    Some(FileProblem::ModeChanged)
                } else {
                    None
                };
                if let Some(problem) = problem {
                    issues.push(FileIssue {
                        package: record.name.clone(),
                        path: file.path.clone(),
                        problem,
                    });
                }
            }
        }
        Ok(issues)
    }

    /// Remove staging directories no unfinished journal refers to
    ///
    /// Returns the number of directories removed.
    pub fn clean(&self) -> Result<usize> {
        let dir = self.config.transactions_dir();
        if !dir.is_dir() {
            return Ok(0);
        }

        let keep: HashSet<String> = Journal::list_all(&self.conn)?
            .into_iter()
            .filter(|j| !j.status.is_terminal())
            .filter_map(|j| j.id.map(|id| id.to_string()))
            .collect();

        let mut removed = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep.contains(&name) {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {}", entry.path().display(), e),
            }
        }
        info!("Removed {} stale staging director(ies)", removed);
        Ok(removed)
    }

    /// All journals, newest first
    pub fn history(&self) -> Result<Vec<Journal>> {
        Journal::list_all(&self.conn)
    }

    /// Acknowledge a failed rollback after manual repair
    pub fn clear_journal(&self, journal_id: i64) -> Result<()> {
        journal::clear(&self.conn, journal_id)
    }
}
