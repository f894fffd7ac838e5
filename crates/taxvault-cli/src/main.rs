//! taxvault - designated-account ledger CLI
//!
//! Operates directly on the `SQLite` database named in the configuration
//! file (or `--database`).

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use taxvault_core::config::TaxvaultConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// taxvault - designated-account ledger
#[derive(Parser, Debug)]
#[command(name = "taxvault")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "taxvault.toml")]
    config: PathBuf,

    /// Database path (overrides the configuration file)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to `[log] level`
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the database and apply the schema
    Init,

    /// Write and read journals
    Journal(commands::journal::JournalCommand),

    /// Verify an organisation's journal hash chain
    VerifyChain {
        /// Organisation identifier
        #[arg(long)]
        org: String,
    },

    /// Evaluate the designated-account policy without touching storage
    Policy(commands::policy::PolicyCommand),

    /// Designated account operations
    Account(commands::account::AccountCommand),

    /// Payroll and POS contributions
    Contribution(commands::contribution::ContributionCommand),

    /// Reconciliation
    Reconcile(commands::reconcile::ReconcileCommand),
}

fn load_config(cli: &Cli) -> Result<TaxvaultConfig> {
    let mut config = if cli.config.exists() {
        TaxvaultConfig::from_file(&cli.config)
            .with_context(|| format!("failed to load {}", cli.config.display()))?
    } else {
        TaxvaultConfig::default()
    };
    if let Some(path) = &cli.database {
        config.database.path.clone_from(path);
    }
    Ok(config)
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    // Initialize logging
    let level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let ctx = commands::Context::new(config, cli.json);

    let code = match cli.command {
        Commands::Init => commands::init(&ctx),
        Commands::Journal(cmd) => commands::journal::run(&ctx, &cmd),
        Commands::VerifyChain { org } => commands::journal::verify_chain(&ctx, &org),
        Commands::Policy(cmd) => commands::policy::run(&ctx, &cmd),
        Commands::Account(cmd) => commands::account::run(&ctx, &cmd),
        Commands::Contribution(cmd) => commands::contribution::run(&ctx, &cmd),
        Commands::Reconcile(cmd) => commands::reconcile::run(&ctx, &cmd),
    }?;

    Ok(ExitCode::from(code))
}
