// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn name_arg(help: &'static str) -> Arg {
    Arg::new("name").required(true).help(help)
}

fn dry_run_arg() -> Arg {
    Arg::new("dry_run")
        .long("dry-run")
        .action(ArgAction::SetTrue)
        .help("Show the plan without changing anything")
}

fn build_cli() -> Command {
    Command::new("pkgmgr")
        .version(env!("CARGO_PKG_VERSION"))
        .author("pkgmgr Contributors")
        .about("Package manager with dependency resolution and crash-safe transactions")
        .subcommand_required(true)
        .arg(
            Arg::new("db_path")
                .short('d')
                .long("db-path")
                .value_name("PATH")
                .global(true)
                .default_value("/var/lib/pkgmgr/pkgmgr.db")
                .help("Database path [env: PKGMGR_DB_PATH]"),
        )
        .arg(
            Arg::new("root")
                .short('r')
                .long("root")
                .global(true)
                .default_value("/")
                .help("Install root directory [env: PKGMGR_ROOT]"),
        )
        .arg(
            Arg::new("cache_dir")
                .long("cache-dir")
                .global(true)
                .default_value("/var/cache/pkgmgr")
                .help("Archive cache and staging directory [env: PKGMGR_CACHE_DIR]"),
        )
        .arg(
            Arg::new("jobs")
                .short('j')
                .long("jobs")
                .global(true)
                .default_value("4")
                .help("Concurrent archive downloads [env: PKGMGR_JOBS]"),
        )
        .arg(
            Arg::new("repo_order")
                .long("repo-order")
                .global(true)
                .value_parser(["declaration", "priority"])
                .default_value("declaration")
                .help("Tie-break between repositories offering the same version [env: PKGMGR_REPO_ORDER]"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Print machine-readable JSON"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Enable debug logging"),
        )
        .subcommand(Command::new("init").about("Initialize the pkgmgr database"))
        .subcommand(
            Command::new("install")
                .about("Install packages (name or name@constraint)")
                .arg(Arg::new("packages").required(true).num_args(1..))
                .arg(dry_run_arg()),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove installed packages")
                .arg(Arg::new("packages").required(true).num_args(1..))
                .arg(
                    Arg::new("cascade")
                        .long("cascade")
                        .action(ArgAction::SetTrue)
                        .help("Also remove packages that depend on them"),
                )
                .arg(dry_run_arg()),
        )
        .subcommand(
            Command::new("update")
                .about("Update installed packages from repositories")
                .arg(Arg::new("package").help("Package name (updates all if omitted)"))
                .arg(dry_run_arg()),
        )
        .subcommand(
            Command::new("list")
                .about("List installed packages")
                .arg(Arg::new("pattern").help("Substring filter on package names")),
        )
        .subcommand(
            Command::new("info")
                .about("Show installed and available versions of a package")
                .arg(Arg::new("package").required(true)),
        )
        .subcommand(
            Command::new("search")
                .about("Search repository packages by name or description")
                .arg(Arg::new("pattern").required(true).help("Search pattern")),
        )
        .subcommand(
            Command::new("repo-add")
                .about("Add a new repository")
                .arg(name_arg("Repository name"))
                .arg(Arg::new("url").required(true).help("Repository URL or directory"))
                .arg(
                    Arg::new("priority")
                        .short('p')
                        .long("priority")
                        .default_value("0")
                        .help("Priority (higher = preferred with --repo-order priority)"),
                )
                .arg(
                    Arg::new("disabled")
                        .long("disabled")
                        .action(ArgAction::SetTrue)
                        .help("Disable repository after adding"),
                ),
        )
        .subcommand(
            Command::new("repo-list").about("List repositories").arg(
                Arg::new("all")
                    .short('a')
                    .long("all")
                    .action(ArgAction::SetTrue)
                    .help("Include disabled repositories"),
            ),
        )
        .subcommand(
            Command::new("repo-remove")
                .about("Remove a repository")
                .arg(name_arg("Repository name")),
        )
        .subcommand(
            Command::new("repo-enable")
                .about("Enable a repository")
                .arg(name_arg("Repository name")),
        )
        .subcommand(
            Command::new("repo-disable")
                .about("Disable a repository")
                .arg(name_arg("Repository name")),
        )
        .subcommand(
            Command::new("repo-sync")
                .about("Synchronize repository metadata")
                .arg(Arg::new("name").help("Repository name (syncs all enabled if omitted)"))
                .arg(
                    Arg::new("force")
                        .short('f')
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Sync even if metadata hasn't expired"),
                ),
        )
        .subcommand(
            Command::new("clean").about("Remove staging directories no unfinished transaction needs"),
        )
        .subcommand(Command::new("history").about("Show transaction history"))
        .subcommand(Command::new("recover").about("Resume or roll back interrupted transactions"))
        .subcommand(
            Command::new("journal-clear")
                .about("Acknowledge a failed rollback after manual repair")
                .arg(Arg::new("journal_id").required(true).help("Journal ID")),
        )
        .subcommand(
            Command::new("verify")
                .about("Verify installed files match their recorded checksums")
                .arg(Arg::new("package").help("Package name to verify (optional)")),
        )
        .subcommand(
            Command::new("depends")
                .about("Show dependencies of an installed package")
                .arg(Arg::new("package").required(true)),
        )
        .subcommand(
            Command::new("rdepends")
                .about("Show installed packages that depend on a package")
                .arg(Arg::new("package").required(true)),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("pkgmgr.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
