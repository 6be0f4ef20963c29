//! charter - constitutional audit ledger
//!
//! Writer and independent auditor CLI for the Charter hash-chained ledger.

use std::path::PathBuf;

use anyhow::{Context, Result};
use charter_core::config::LedgerConfig;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// charter - constitutional audit ledger
#[derive(Parser, Debug)]
#[command(name = "charter")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "charter.toml", env = "CHARTER_CONFIG")]
    config: PathBuf,

    /// Path to the ledger database (overrides `ledger.database`)
    #[arg(long, env = "CHARTER_DB")]
    db: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    // === Writing ===
    /// Create the ledger database if it does not exist
    Init,

    /// Append one event
    Append(commands::ledger::AppendArgs),

    /// Log a ceremonial skip of sequence numbers
    Skip(commands::ledger::SkipArgs),

    // === Reading ===
    /// Print events as JSON Lines
    Read(commands::ledger::RangeArgs),

    /// Show the chain tail
    Tail,

    /// Show ledger statistics
    Stats,

    /// Print recorded clock drift observations
    Drift,

    /// Write a range to an export file
    Export(commands::ledger::ExportArgs),

    // === Auditing ===
    /// Verify chain integrity
    Verify(commands::audit::VerifyArgs),

    /// Verify chain integrity and signatures against trusted keys
    Audit(commands::audit::AuditArgs),

    /// Generate an Ed25519 signing key
    Keygen(commands::keys::KeygenArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let mut config = if cli.config.exists() {
        LedgerConfig::from_file(&cli.config)
            .with_context(|| format!("failed to load config {}", cli.config.display()))?
    } else {
        LedgerConfig::default()
    };
    if let Some(db) = cli.db {
        config.ledger.database = db;
    }

    match cli.command {
        Commands::Init => commands::ledger::init(&config),
        Commands::Append(args) => commands::ledger::append(&config, &args),
        Commands::Skip(args) => commands::ledger::skip(&config, &args),
        Commands::Read(args) => commands::ledger::read(&config, &args),
        Commands::Tail => commands::ledger::tail(&config),
        Commands::Stats => commands::ledger::stats(&config),
        Commands::Drift => commands::ledger::drift(&config),
        Commands::Export(args) => commands::ledger::export(&config, &args),
        Commands::Verify(args) => {
            // 0=valid, 1=error, 2=chain break
            // std::process::exit bypasses anyhow so the code is exact.
            let exit_code = commands::audit::run_verify(&config, &args);
            std::process::exit(i32::from(exit_code));
        },
        Commands::Audit(args) => {
            // 0=passed, 1=error, 2=audit failed
            let exit_code = commands::audit::run_audit(&config, &args);
            std::process::exit(i32::from(exit_code));
        },
        Commands::Keygen(args) => commands::keys::keygen(&args),
    }
}
