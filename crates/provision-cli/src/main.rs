mod cmd;
mod output;
mod root;
mod signal;

use clap::{Parser, Subcommand};
use cmd::{
    backup::BackupSubcommand, ledger::LedgerSubcommand, plan::PlanSubcommand, run::RunExit,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "provision",
    about = "Run ordered, idempotent provisioning plans with backup and rollback",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .provision/ or .git/)
    #[arg(long, global = true, env = "PROVISION_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .provision/ with a default config and a sample plan
    Init,

    /// Execute a plan
    Run {
        /// Plan name (in .provision/plans/) or path to a plan file
        plan: String,

        /// Validate and print the execution order without running anything
        #[arg(long)]
        dry_run: bool,

        /// Re-run steps the ledger already records as done
        #[arg(long)]
        force: bool,

        /// Leave completed steps in place when a step fails
        #[arg(long)]
        no_cleanup_on_error: bool,

        /// Only run steps in this category (plus their dependencies)
        #[arg(long)]
        category: Option<String>,
    },

    /// Inspect and validate plans
    Plan {
        #[command(subcommand)]
        subcommand: PlanSubcommand,
    },

    /// Inspect or reset the completed-step ledger
    Ledger {
        #[command(subcommand)]
        subcommand: LedgerSubcommand,
    },

    /// Run a plan's read-only host checks
    Diagnose {
        plan: String,

        /// Only run checks in this category
        #[arg(long)]
        category: Option<String>,
    },

    /// Show the host facts steps are gated on
    Facts,

    /// List or restore backup snapshots
    Backup {
        #[command(subcommand)]
        subcommand: BackupSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Run {
            plan,
            dry_run,
            force,
            no_cleanup_on_error,
            category,
        } => cmd::run::run(
            &root,
            &plan,
            cmd::run::RunFlags {
                dry_run,
                force,
                no_cleanup_on_error,
                category,
            },
            cli.json,
        ),
        Commands::Plan { subcommand } => cmd::plan::run(&root, subcommand, cli.json),
        Commands::Ledger { subcommand } => cmd::ledger::run(&root, subcommand, cli.json),
        Commands::Diagnose { plan, category } => {
            cmd::diagnose::run(&root, &plan, category.as_deref(), cli.json)
        }
        Commands::Facts => cmd::facts::run(cli.json),
        Commands::Backup { subcommand } => cmd::backup::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        if let Some(exit) = e.downcast_ref::<RunExit>() {
            if exit.is_error() {
                eprintln!("error: {exit}");
            }
            std::process::exit(exit.exit_code());
        }
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
