//! Writer-side and read commands.
//!
//! - `charter init` - create the database
//! - `charter append <type> [--payload <json>] [--key <file>]` - append one event
//! - `charter skip <count> --reason <text>` - log skipped sequence numbers
//! - `charter read [--start] [--end]` - events as JSON Lines
//! - `charter tail`, `charter stats`, `charter drift` - store state
//! - `charter export [--output <file>]` - JSON Lines export for auditors

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use charter_core::canonical::parse_json_strict;
use charter_core::config::LedgerConfig;
use charter_core::crypto::Ed25519Signer;
use charter_core::event::EventDraft;
use charter_core::time::SystemClock;
use charter_core::toolkit::export_range_paged;
use clap::Args;
use tracing::info;

use super::{open_ledger, open_reader, print_json, print_json_line, read_file};

/// Arguments for `charter append`.
#[derive(Debug, Args)]
pub struct AppendArgs {
    /// Event type, e.g. `motion.filed`
    pub event_type: String,

    /// Payload as JSON text
    #[arg(long, default_value = "{}", conflicts_with = "payload_file")]
    pub payload: String,

    /// Read the payload from a JSON file
    #[arg(long)]
    pub payload_file: Option<PathBuf>,

    /// Acting agent, also the signing identity when `--key` is given
    #[arg(long)]
    pub agent_id: Option<String>,

    /// File holding the writer's hex Ed25519 seed
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// File holding a witness's hex Ed25519 seed
    #[arg(long, requires = "witness_id")]
    pub witness_key: Option<PathBuf>,

    /// Identity of the witness
    #[arg(long)]
    pub witness_id: Option<String>,

    /// Reject the append unless the chain head still has this hash
    #[arg(long)]
    pub expect_prev: Option<String>,
}

/// Arguments for `charter skip`.
#[derive(Debug, Args)]
pub struct SkipArgs {
    /// Number of sequence numbers to skip
    pub count: u64,

    /// Why the numbers are skipped
    #[arg(long)]
    pub reason: String,
}

/// A sequence range.
#[derive(Debug, Args)]
pub struct RangeArgs {
    /// First sequence (inclusive, defaults to 1, or to the range start of an
    /// export file)
    #[arg(long)]
    pub start: Option<u64>,

    /// Last sequence (inclusive, defaults to the end of the ledger)
    #[arg(long)]
    pub end: Option<u64>,

    /// Events per page (defaults to `ledger.page_size`)
    #[arg(long)]
    pub page_size: Option<usize>,
}

impl RangeArgs {
    /// Resolved `(start, end, page_size)` for the database.
    pub fn resolve(&self, config: &LedgerConfig) -> (u64, u64, usize) {
        self.resolve_from(config, 1)
    }

    /// Resolved `(start, end, page_size)`, starting at `default_start` when
    /// `--start` is absent.
    pub fn resolve_from(&self, config: &LedgerConfig, default_start: u64) -> (u64, u64, usize) {
        (
            self.start.unwrap_or(default_start),
            self.end.unwrap_or(u64::MAX),
            self.page_size.unwrap_or(config.ledger.page_size).max(1),
        )
    }
}

/// Arguments for `charter export`.
#[derive(Debug, Args)]
pub struct ExportArgs {
    #[command(flatten)]
    pub range: RangeArgs,

    /// Output file (stdout if omitted)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Execute `charter init`.
pub fn init(config: &LedgerConfig) -> Result<()> {
    let ledger = open_ledger(config)?;
    let tail = ledger.tail().context("failed to read chain tail")?;
    println!(
        "ledger ready at {} (next sequence {})",
        config.ledger.database.display(),
        tail.next_sequence
    );
    Ok(())
}

/// Execute `charter append`.
pub fn append(config: &LedgerConfig, args: &AppendArgs) -> Result<()> {
    let payload_text = match &args.payload_file {
        Some(path) => read_file(path)?,
        None => args.payload.clone(),
    };
    let payload = parse_json_strict(&payload_text).context("payload is not valid JSON")?;

    let signer = args
        .key
        .as_ref()
        .map(|path| load_signer(path, args.agent_id.as_deref()))
        .transpose()?;

    let mut draft = EventDraft::new(&args.event_type, payload, &SystemClock);
    if let Some(agent_id) = &args.agent_id {
        draft = draft.with_agent_id(agent_id.as_str());
    }
    if let Some(signer) = &signer {
        draft = draft.sign(signer).context("failed to sign event")?;
    }
    if let (Some(path), Some(witness_id)) = (&args.witness_key, &args.witness_id) {
        let witness = Ed25519Signer::from_seed_hex(witness_id.as_str(), &read_file(path)?)
            .with_context(|| format!("invalid witness key {}", path.display()))?;
        draft = draft.witness(&witness).context("failed to witness event")?;
    }
    if let Some(prev) = &args.expect_prev {
        draft = draft.linked_to(prev.as_str());
    }

    let ledger = open_ledger(config)?;
    let event = ledger.append(draft).context("append rejected")?;
    print_json_line(&event)
}

fn load_signer(path: &std::path::Path, agent_id: Option<&str>) -> Result<Ed25519Signer> {
    let Some(key_id) = agent_id else {
        bail!("--key requires --agent-id to name the signing identity");
    };
    Ed25519Signer::from_seed_hex(key_id, &read_file(path)?)
        .with_context(|| format!("invalid signing key {}", path.display()))
}

/// Execute `charter skip`.
pub fn skip(config: &LedgerConfig, args: &SkipArgs) -> Result<()> {
    let ledger = open_ledger(config)?;
    let skip = ledger
        .record_sequence_skip(args.count, &args.reason)
        .context("failed to record skip")?;
    print_json_line(&skip)
}

/// Execute `charter read`.
pub fn read(config: &LedgerConfig, args: &RangeArgs) -> Result<()> {
    let (start, end, page_size) = args.resolve(config);
    let reader = open_reader(config)?;
    for event in reader.read_range(start, end, page_size) {
        print_json_line(&event.context("failed to read event")?)?;
    }
    Ok(())
}

/// Execute `charter tail`.
pub fn tail(config: &LedgerConfig) -> Result<()> {
    let tail = open_reader(config)?
        .tail()
        .context("failed to read chain tail")?;
    print_json(&tail)
}

/// Execute `charter stats`.
pub fn stats(config: &LedgerConfig) -> Result<()> {
    let stats = open_reader(config)?
        .stats()
        .context("failed to gather statistics")?;
    print_json(&stats)
}

/// Execute `charter drift`.
pub fn drift(config: &LedgerConfig) -> Result<()> {
    let observations = open_reader(config)?
        .drift_observations()
        .context("failed to read drift observations")?;
    for observation in &observations {
        print_json_line(observation)?;
    }
    Ok(())
}

/// Execute `charter export`.
pub fn export(config: &LedgerConfig, args: &ExportArgs) -> Result<()> {
    let (start, end, page_size) = args.range.resolve(config);
    let reader = open_reader(config)?;

    let written = match &args.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            export_range_paged(&reader, start, end, page_size, file)?
        },
        None => {
            let mut stdout = std::io::stdout().lock();
            let written = export_range_paged(&reader, start, end, page_size, &mut stdout)?;
            stdout.flush().context("failed to flush stdout")?;
            written
        },
    };

    info!(written, "export complete");
    if let Some(path) = &args.output {
        eprintln!("exported {written} events to {}", path.display());
    }
    Ok(())
}
