//! Verification commands.
//!
//! Both commands read either the configured database (read-only) or an
//! export file, and trust nothing but the bytes they read.
//!
//! - `charter verify [--export <file>]` - chain integrity only
//! - `charter audit --keys <file> [--export <file>]` - chain integrity plus
//!   writer and witness signatures, judged by an audit policy
//!
//! # Exit Codes
//!
//! - 0: Chain valid / audit passed
//! - 1: Error (unreadable source, bad key file, etc.)
//! - 2: Chain break / audit failed

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use charter_core::config::LedgerConfig;
use charter_core::toolkit::{AuditClient, AuditPolicy, AuditReport, ExportFile, TrustedKeys};
use charter_core::verify::{ChainVerifier, VerificationReport};
use clap::Args;
use serde::Serialize;

use super::ledger::RangeArgs;
use super::{open_reader, print_json};

/// Exit codes for verification commands.
pub mod exit_codes {
    /// Chain valid or audit passed.
    pub const SUCCESS: u8 = 0;
    /// The check could not run.
    pub const ERROR: u8 = 1;
    /// A chain break or a failed audit.
    pub const FAILED: u8 = 2;
}

/// Arguments for `charter verify`.
#[derive(Debug, Args)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub range: RangeArgs,

    /// Verify this export file instead of the database
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, default_value = "false")]
    pub json: bool,
}

/// Arguments for `charter audit`.
#[derive(Debug, Args)]
pub struct AuditArgs {
    #[command(flatten)]
    pub range: RangeArgs,

    /// Audit this export file instead of the database
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Trusted key file (defaults to `audit.trusted_keys`)
    #[arg(long)]
    pub keys: Option<PathBuf>,

    /// Do not fail the audit on sequence gaps
    #[arg(long)]
    pub allow_gaps: bool,

    /// Fail the audit on any event without a valid writer signature
    #[arg(long)]
    pub require_signatures: bool,

    /// Output format (text or json)
    #[arg(long, default_value = "false")]
    pub json: bool,
}

/// Error response for JSON output.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
}

/// Execute `charter verify`.
pub fn run_verify(config: &LedgerConfig, args: &VerifyArgs) -> u8 {
    let result = match &args.export {
        Some(path) => open_export(path).and_then(|export| {
            let (start, end, page_size) = args.range.resolve_from(config, export.range_start());
            let verifier = ChainVerifier::new().with_page_size(page_size);
            Ok(verifier.verify_range(&export, start, end)?)
        }),
        None => open_reader(config).and_then(|reader| {
            let (start, end, page_size) = args.range.resolve(config);
            let verifier = ChainVerifier::new().with_page_size(page_size);
            Ok(verifier.verify_range(&reader, start, end)?)
        }),
    };

    match result {
        Ok(report) => {
            let code = if report.is_valid {
                exit_codes::SUCCESS
            } else {
                exit_codes::FAILED
            };
            if args.json {
                emit(print_json(&report), code)
            } else {
                print_chain_report(&report);
                code
            }
        },
        Err(e) => output_error(args.json, "verify_error", &e),
    }
}

/// Execute `charter audit`.
pub fn run_audit(config: &LedgerConfig, args: &AuditArgs) -> u8 {
    match audit(config, args) {
        Ok(report) => {
            let code = if report.passed {
                exit_codes::SUCCESS
            } else {
                exit_codes::FAILED
            };
            if args.json {
                emit(print_json(&report), code)
            } else {
                print_audit_report(&report);
                code
            }
        },
        Err(e) => output_error(args.json, "audit_error", &e),
    }
}

fn audit(config: &LedgerConfig, args: &AuditArgs) -> Result<AuditReport> {
    let keys_path = args
        .keys
        .as_ref()
        .or(config.audit.trusted_keys.as_ref())
        .ok_or_else(|| anyhow!("no trusted key file: pass --keys or set audit.trusted_keys"))?;
    let keys = TrustedKeys::from_file(keys_path)
        .with_context(|| format!("failed to load trusted keys {}", keys_path.display()))?;

    let configured = config.audit_policy();
    let policy = AuditPolicy {
        allow_gaps: args.allow_gaps || configured.allow_gaps,
        require_signatures: args.require_signatures || configured.require_signatures,
    };
    let client = AuditClient::new(keys).with_policy(policy);

    match &args.export {
        Some(path) => {
            let export = open_export(path)?;
            let (start, end, page_size) = args.range.resolve_from(config, export.range_start());
            Ok(client
                .with_page_size(page_size)
                .audit(&export, start, end)?)
        },
        None => {
            let (start, end, page_size) = args.range.resolve(config);
            Ok(client
                .with_page_size(page_size)
                .audit(&open_reader(config)?, start, end)?)
        },
    }
}

fn open_export(path: &Path) -> Result<ExportFile> {
    ExportFile::open(path).with_context(|| format!("failed to open export {}", path.display()))
}

fn print_chain_report(report: &VerificationReport) {
    match (report.first_sequence, report.last_sequence) {
        (Some(first), Some(last)) => println!(
            "checked {} events ({first}..={last})",
            report.events_checked
        ),
        _ => println!("checked 0 events"),
    }
    for gap in &report.gaps {
        println!("gap: {}..={} ({} missing)", gap.start, gap.end, gap.len());
    }
    match &report.first_break {
        None => println!("chain: VALID"),
        Some(first_break) => {
            println!(
                "chain: BROKEN at sequence {} ({:?})",
                first_break.sequence, first_break.kind
            );
            if let Some(expected) = &first_break.expected_hash {
                println!("  expected: {expected}");
            }
            if let Some(actual) = &first_break.actual_hash {
                println!("  actual:   {actual}");
            }
        },
    }
}

fn print_audit_report(report: &AuditReport) {
    print_chain_report(&report.chain);
    for verdict in &report.signatures {
        println!(
            "  #{:<8} signer={:?} witness={:?}",
            verdict.sequence, verdict.signer, verdict.witness
        );
    }
    if report.passed {
        println!("audit: PASSED");
    } else {
        println!("audit: FAILED");
        for failure in &report.failures {
            println!("  - {failure}");
        }
    }
}

fn emit(printed: Result<()>, code: u8) -> u8 {
    match printed {
        Ok(()) => code,
        Err(e) => output_error(true, "output_error", &e),
    }
}

fn output_error(json_output: bool, code: &str, error: &anyhow::Error) -> u8 {
    if json_output {
        let error = ErrorResponse {
            code: code.to_string(),
            message: format!("{error:#}"),
        };
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&error).unwrap_or_else(|_| "{}".to_string())
        );
    } else {
        eprintln!("Error: {error:#}");
    }
    exit_codes::ERROR
}
