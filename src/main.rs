// src/main.rs

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use pkgmgr::config::{DEFAULT_CACHE_DIR, DEFAULT_DB_PATH, DEFAULT_FETCH_WORKERS, DEFAULT_ROOT};
use pkgmgr::report::{ErrorReport, TransactionReport};
use pkgmgr::repository::{self, SyncOutcome};
use pkgmgr::session::FileProblem;
use pkgmgr::{Config, Request, RepositoryOrder, Session};
use serde_json::json;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

#[derive(Parser)]
#[command(name = "pkgmgr")]
#[command(author, version, about = "Package manager with dependency resolution and crash-safe transactions", long_about = None)]
struct Cli {
    /// Database path
    #[arg(short, long, global = true, env = "PKGMGR_DB_PATH", default_value = DEFAULT_DB_PATH)]
    db_path: PathBuf,

    /// Install root directory
    #[arg(short, long, global = true, env = "PKGMGR_ROOT", default_value = DEFAULT_ROOT)]
    root: PathBuf,

    /// Archive cache and staging directory
    #[arg(long, global = true, env = "PKGMGR_CACHE_DIR", default_value = DEFAULT_CACHE_DIR)]
    cache_dir: PathBuf,

    /// Concurrent archive downloads
    #[arg(short, long, global = true, env = "PKGMGR_JOBS", default_value_t = DEFAULT_FETCH_WORKERS)]
    jobs: usize,

    /// Tie-break between repositories offering the same version (declaration, priority)
    #[arg(long, global = true, env = "PKGMGR_REPO_ORDER", default_value = "declaration")]
    repo_order: RepositoryOrder,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn config(&self) -> Config {
        Config::default()
            .with_db_path(&self.db_path)
            .with_root(&self.root)
            .with_cache_dir(&self.cache_dir)
            .with_fetch_workers(self.jobs)
            .with_repository_order(self.repo_order)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the pkgmgr database
    Init,
    /// Install packages (`name` or `name@constraint`)
    Install {
        #[arg(required = true)]
        packages: Vec<String>,
        /// Show the plan without changing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove installed packages
    Remove {
        #[arg(required = true)]
        packages: Vec<String>,
        /// Also remove packages that depend on them
        #[arg(long)]
        cascade: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Update installed packages from repositories
    Update {
        /// Package name (updates all if omitted)
        package: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// List installed packages
    List {
        /// Substring filter on package names
        pattern: Option<String>,
    },
    /// Show installed and available versions of a package
    Info { package: String },
    /// Search repository packages by name or description
    Search { pattern: String },
    /// Add a new repository
    RepoAdd {
        name: String,
        url: String,
        /// Priority (higher = preferred with --repo-order priority)
        #[arg(short, long, default_value_t = 0)]
        priority: i32,
        /// Disable repository after adding
        #[arg(long)]
        disabled: bool,
    },
    /// List repositories
    RepoList {
        /// Include disabled repositories
        #[arg(short, long)]
        all: bool,
    },
    /// Remove a repository
    RepoRemove { name: String },
    /// Enable a repository
    RepoEnable { name: String },
    /// Disable a repository
    RepoDisable { name: String },
    /// Synchronize repository metadata
    RepoSync {
        /// Repository name (syncs all enabled if omitted)
        name: Option<String>,
        /// Sync even if metadata hasn't expired
        #[arg(short, long)]
        force: bool,
    },
    /// Remove staging directories no unfinished transaction needs
    Clean,
    /// Show transaction history
    History,
    /// Resume or roll back interrupted transactions
    Recover,
    /// Acknowledge a failed rollback after manual repair
    JournalClear { journal_id: i64 },
    /// Verify installed files match their recorded checksums
    Verify { package: Option<String> },
    /// Show dependencies of an installed package
    Depends { package: String },
    /// Show installed packages that depend on a package
    Rdepends { package: String },
    /// Generate shell completion scripts
    Completions { shell: Shell },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            if cli.json {
                let report = match e.downcast_ref::<pkgmgr::Error>() {
                    Some(error) => ErrorReport::from(error),
                    None => ErrorReport {
                        kind: "other".to_string(),
                        message: format!("{:#}", e),
                    },
                };
                println!("{}", json!({ "error": report }));
            } else {
                eprintln!("Error: {:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}

/// Returns false when the command ran but did not succeed
fn run(cli: &Cli) -> Result<bool> {
    let config = cli.config();

    match &cli.command {
        Commands::Init => {
            info!("Initializing pkgmgr database at: {}", config.db_path.display());
            Session::init(&config)?;
            println!("Database initialized successfully at: {}", config.db_path.display());
            Ok(true)
        }
        Commands::Install { packages, dry_run } => {
            let requests = packages
                .iter()
                .map(|p| Request::parse_install(p))
                .collect::<pkgmgr::Result<Vec<_>>>()?;
            transact(cli, config, &requests, *dry_run)
        }
        Commands::Remove {
            packages,
            cascade,
            dry_run,
        } => {
            let requests: Vec<Request> = packages
                .iter()
                .map(|p| {
                    if *cascade {
                        Request::remove_cascade(p.as_str())
                    } else {
                        Request::remove(p.as_str())
                    }
                })
                .collect();
            transact(cli, config, &requests, *dry_run)
        }
        Commands::Update { package, dry_run } => {
            let request = match package {
                Some(name) => Request::update(name.as_str()),
                None => Request::UpdateAll,
            };
            transact(cli, config, &[request], *dry_run)
        }
        Commands::List { pattern } => {
            let session = Session::open_unchecked(config)?;
            let installed = session.installed()?;
            let records: Vec<_> = installed
                .records()
                .filter(|r| pattern.as_deref().is_none_or(|p| r.name.contains(p)))
                .collect();

            if cli.json {
                let rows: Vec<_> = records
                    .iter()
                    .map(|r| json!({ "name": r.name, "version": r.version, "explicit": r.explicit }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if records.is_empty() {
                println!("No packages found.");
            } else {
                println!("Installed packages:");
                for record in &records {
                    let marker = if record.explicit { "" } else { " (dependency)" };
                    println!("  {} {}{}", record.name, record.version, marker);
                }
                println!("\nTotal: {} package(s)", records.len());
            }
            Ok(true)
        }
        Commands::Info { package } => {
            let session = Session::open_unchecked(config)?;
            let installed = session.installed()?;
            let index = session.load_index()?;
            let record = installed.get(package);
            let available = index.candidates(package);

            if record.is_none() && available.is_empty() {
                return Err(pkgmgr::Error::NotFound(format!("Package '{}'", package)).into());
            }

            if cli.json {
                let available: Vec<_> = available
                    .iter()
                    .map(|p| json!({ "version": p.version, "repository": p.repository }))
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "name": package,
                        "installed": record,
                        "available": available,
                    }))?
                );
                return Ok(true);
            }

            println!("Package: {}", package);
            match record {
                Some(record) => {
                    println!("  Installed: {} ({})", record.version, record.installed_at);
                    println!("  Explicit: {}", if record.explicit { "yes" } else { "no" });
                    if let Some(repo) = &record.repository {
                        println!("  Repository: {}", repo);
                    }
                    println!("  Files: {}", record.files.len());
                }
                None => println!("  Installed: no"),
            }
            if let Some(description) = available.iter().find_map(|p| p.description.as_ref()) {
                println!("  Description: {}", description);
            }
            if !available.is_empty() {
                println!("  Available:");
                for candidate in available {
                    println!("    {} [{}]", candidate.version, candidate.repository);
                }
            }
            Ok(true)
        }
        Commands::Search { pattern } => {
            let session = Session::open_unchecked(config)?;
            let packages = repository::search_packages(session.conn(), pattern)?;

            if cli.json {
                let rows: Vec<_> = packages
                    .iter()
                    .map(|p| json!({ "name": p.name, "version": p.version, "description": p.description }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if packages.is_empty() {
                println!("No packages found matching '{}'", pattern);
            } else {
                println!("Found {} package(s) matching '{}':", packages.len(), pattern);
                for pkg in &packages {
                    print!("  {} {}", pkg.name, pkg.version);
                    if let Some(desc) = &pkg.description {
                        print!(" - {}", desc);
                    }
                    println!();
                }
            }
            Ok(true)
        }
        Commands::RepoAdd {
            name,
            url,
            priority,
            disabled,
        } => {
            let session = Session::open(config)?;
            let repo = repository::add_repository(
                session.conn(),
                name.clone(),
                url.clone(),
                !disabled,
                *priority,
            )?;
            println!("Added repository: {} ({})", repo.name, repo.url);
            Ok(true)
        }
        Commands::RepoList { all } => {
            let session = Session::open_unchecked(config)?;
            let repos = if *all {
                pkgmgr::db::models::Repository::list_all(session.conn())?
            } else {
                pkgmgr::db::models::Repository::list_enabled(session.conn())?
            };

            if cli.json {
                let rows: Vec<_> = repos
                    .iter()
                    .map(|r| {
                        json!({
                            "name": r.name,
                            "url": r.url,
                            "enabled": r.enabled,
                            "priority": r.priority,
                            "last_sync": r.last_sync,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if repos.is_empty() {
                println!("No repositories configured.");
            } else {
                println!("Repositories:");
                for repo in &repos {
                    let status = if repo.enabled { "enabled" } else { "disabled" };
                    println!(
                        "  {} (priority {}, {}) {}",
                        repo.name, repo.priority, status, repo.url
                    );
                    if let Some(last_sync) = &repo.last_sync {
                        println!("    Last sync: {}", last_sync);
                    }
                }
            }
            Ok(true)
        }
        Commands::RepoRemove { name } => {
            let session = Session::open(config)?;
            repository::remove_repository(session.conn(), name)?;
            println!("Removed repository: {}", name);
            Ok(true)
        }
        Commands::RepoEnable { name } => {
            let session = Session::open(config)?;
            repository::set_repository_enabled(session.conn(), name, true)?;
            println!("Enabled repository: {}", name);
            Ok(true)
        }
        Commands::RepoDisable { name } => {
            let session = Session::open(config)?;
            repository::set_repository_enabled(session.conn(), name, false)?;
            println!("Disabled repository: {}", name);
            Ok(true)
        }
        Commands::RepoSync { name, force } => {
            let mut session = Session::open(config)?;
            let outcomes =
                repository::sync_repositories(session.conn_mut(), name.as_deref(), *force)?;
            let ok = !outcomes
                .iter()
                .any(|o| matches!(o, SyncOutcome::Failed { .. }));

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcomes)?);
            } else if outcomes.is_empty() {
                println!("No enabled repositories to sync.");
            } else {
                for outcome in &outcomes {
                    match outcome {
                        SyncOutcome::Synced {
                            repository,
                            packages,
                        } => println!("  {}: synchronized {} package(s)", repository, packages),
                        SyncOutcome::UpToDate { repository } => {
                            println!("  {}: up to date", repository)
                        }
                        SyncOutcome::Failed { repository, error } => {
                            println!("  {}: FAILED - {}", repository, error)
                        }
                    }
                }
            }
            Ok(ok)
        }
        Commands::Clean => {
            let session = Session::open(config)?;
            let removed = session.clean()?;
            if cli.json {
                println!("{}", json!({ "removed": removed }));
            } else {
                println!("Removed {} staging director(ies)", removed);
            }
            Ok(true)
        }
        Commands::History => {
            let session = Session::open_unchecked(config)?;
            let journals = session.history()?;

            if cli.json {
                let rows: Vec<_> = journals
                    .iter()
                    .map(|j| {
                        json!({
                            "id": j.id,
                            "description": j.description,
                            "status": j.status.as_str(),
                            "created_at": j.created_at,
                            "finished_at": j.finished_at,
                            "error": j.error,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if journals.is_empty() {
                println!("No transaction history.");
            } else {
                println!("Transaction history:");
                for journal in &journals {
                    let timestamp = journal
                        .finished_at
                        .as_deref()
                        .or(journal.created_at.as_deref())
                        .unwrap_or("pending");
                    println!(
                        "  [{}] {} - {} ({})",
                        journal.id.unwrap_or_default(),
                        timestamp,
                        journal.description,
                        journal.status.as_str()
                    );
                    if let Some(error) = &journal.error {
                        println!("      {}", error);
                    }
                }
                println!("\nTotal: {} transaction(s)", journals.len());
            }
            Ok(true)
        }
        Commands::Recover => {
            let mut session = Session::open_unchecked(config)?;
            let reports = session.recover()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else if reports.is_empty() {
                println!("No interrupted transactions.");
            } else {
                for report in &reports {
                    print_report(report);
                }
            }
            Ok(reports.iter().all(TransactionReport::is_success))
        }
        Commands::JournalClear { journal_id } => {
            let session = Session::open_unchecked(config)?;
            session.clear_journal(*journal_id)?;
            println!("Cleared journal {}", journal_id);
            Ok(true)
        }
        Commands::Verify { package } => {
            let session = Session::open(config)?;
            let issues = session.verify(package.as_deref())?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&issues)?);
            } else if issues.is_empty() {
                println!("All files verified.");
            } else {
                for issue in &issues {
                    let problem = match issue.problem {
                        FileProblem::Missing => "missing",
                        FileProblem::Modified => "modified",
                        FileProblem::ModeChanged => "mode changed",
                    };
                    println!("  {}: {} ({})", issue.package, issue.path, problem);
                }
                println!("\n{} problem(s) found", issues.len());
            }
            Ok(issues.is_empty())
        }
        Commands::Depends { package } => {
            let session = Session::open_unchecked(config)?;
            let installed = session.installed()?;
            let record = installed
                .get(package)
                .ok_or_else(|| pkgmgr::Error::NotInstalled(package.clone()))?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&record.dependencies)?);
            } else if record.dependencies.is_empty() {
                println!("{} has no dependencies", package);
            } else {
                println!("Dependencies of {}:", package);
                for dep in &record.dependencies {
                    let status = match installed.get(&dep.name) {
                        Some(r) if dep.constraint.matches(&r.version) => {
                            format!("installed {}", r.version)
                        }
                        Some(r) => format!("installed {} (does not match)", r.version),
                        None if dep.optional => "optional, not installed".to_string(),
                        None => "not installed".to_string(),
                    };
                    println!("  {} {} [{}]", dep.name, dep.constraint, status);
                }
            }
            Ok(true)
        }
        Commands::Rdepends { package } => {
            let session = Session::open_unchecked(config)?;
            let installed = session.installed()?;
            let dependents: Vec<&str> = installed
                .dependents(package)
                .iter()
                .map(|r| r.name.as_str())
                .collect();

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&dependents)?);
            } else if dependents.is_empty() {
                println!("No installed packages depend on {}", package);
            } else {
                println!("Packages that depend on {}:", package);
                for name in &dependents {
                    println!("  {}", name);
                }
            }
            Ok(true)
        }
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "pkgmgr", &mut io::stdout());
            Ok(true)
        }
    }
}

/// Resolve, plan and apply; print the report
fn transact(cli: &Cli, config: Config, requests: &[Request], dry_run: bool) -> Result<bool> {
    let mut session = Session::open(config)?;
    for report in session.recovered() {
        info!(
            "Recovered journal {}: {}",
            report.journal_id.unwrap_or_default(),
            report.status
        );
    }

    let report = session.run(requests, dry_run)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(report.is_success())
}

fn print_report(report: &TransactionReport) {
    if report.status == "nothing_to_do" {
        println!("Nothing to do.");
        return;
    }

    match report.journal_id {
        Some(id) => println!("Transaction {}: {}", id, report.status),
        None => println!("Planned transaction ({} steps):", report.steps_total),
    }

    for pkg in &report.packages {
        let versions = match (&pkg.from, &pkg.to) {
            (Some(from), Some(to)) if from != to => format!("{} -> {}", from, to),
            (_, Some(to)) => to.to_string(),
            (Some(from), None) => from.to_string(),
            (None, None) => String::new(),
        };
        let promote = if pkg.promote { " (marked explicit)" } else { "" };
        println!("  {:<10} {} {}{}", pkg.action.as_str(), pkg.name, versions, promote);
    }

    if !report.orphans.is_empty() {
        println!("No longer required: {}", report.orphans.join(", "));
    }

    if report.journal_id.is_some() {
        println!(
            "Steps: {} total, {} committed, {} already applied",
            report.steps_total, report.steps_committed, report.steps_skipped
        );
    }
    if let Some(step) = &report.failed_step {
        println!("Failed at step {} ({} {})", step.seq, step.kind, step.package);
    }
    if let Some(error) = &report.error {
        println!("Error: {}", error.message);
    }
    for failure in &report.compensation_failures {
        println!(
            "Rollback failed at step {} ({}): {}",
            failure.seq, failure.step, failure.error
        );
    }
}
