// src/lib.rs

//! pkgmgr: dependency resolution and transaction engine
//!
//! Resolves requested package changes against an installed state and a
//! package index, orders the resulting work into steps and applies them
//! with a write-ahead journal so an interrupted run can be resumed or
//! rolled back.
//!
//! # Architecture
//!
//! - Database-first: installed state, journals and repositories live in SQLite
//! - Resolver: backtracking constraint search producing a target graph
//! - Planner: dependency-ordered fetch/unpack/link/record steps
//! - Executor: journaled, compensating step execution
//! - File-level tracking: SHA-256 hashes for every installed file

pub mod archive;
pub mod config;
pub mod db;
mod error;
pub mod filesystem;
pub mod index;
pub mod planner;
pub mod report;
pub mod repository;
pub mod resolver;
pub mod session;
pub mod state;
pub mod transaction;
pub mod version;

pub use config::{Config, RepositoryOrder};
pub use error::{Error, Requirement, Result, Unsatisfiable};
pub use index::{ArchiveRef, ConflictDecl, DependencyConstraint, ManifestEntry, Package, PackageId, PackageIndex};
pub use planner::{Plan, Step, plan};
pub use report::TransactionReport;
pub use resolver::{Action, Request, ResolutionGraph, resolve};
pub use session::Session;
pub use state::{InstalledRecord, InstalledState};
pub use transaction::{CancelToken, Execution, Executor};
pub use version::{PackageVersion, VersionConstraint};
