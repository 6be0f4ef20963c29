//! Key generation.
//!
//! `charter keygen <id> --out <file>` writes a hex Ed25519 seed for a writer
//! or witness and prints the matching trusted key file entry. The seed file
//! stays with the signer; only the printed public key goes to auditors.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use charter_core::crypto::Ed25519Signer;
use clap::{Args, ValueEnum};
use rand::RngCore;
use rand::rngs::OsRng;

/// Which table of the trusted key file the key belongs in.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KeyRole {
    /// Event writer (`[signers]`).
    Signer,
    /// Witness (`[witnesses]`).
    Witness,
}

/// Arguments for `charter keygen`.
#[derive(Debug, Args)]
pub struct KeygenArgs {
    /// Identity the key signs as
    pub id: String,

    /// Seed output file
    #[arg(short, long)]
    pub out: PathBuf,

    /// Role of the key
    #[arg(long, value_enum, default_value = "signer")]
    pub role: KeyRole,

    /// Overwrite an existing seed file
    #[arg(long)]
    pub force: bool,
}

/// Execute `charter keygen`.
pub fn keygen(args: &KeygenArgs) -> Result<()> {
    if args.out.exists() && !args.force {
        bail!(
            "{} already exists (use --force to overwrite)",
            args.out.display()
        );
    }

    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    let signer = Ed25519Signer::from_seed(args.id.as_str(), seed);

    write_secret(&args.out, &hex::encode(seed))
        .with_context(|| format!("failed to write {}", args.out.display()))?;

    let table = match args.role {
        KeyRole::Signer => "signers",
        KeyRole::Witness => "witnesses",
    };
    println!("[{table}]");
    println!("{} = \"{}\"", args.id, signer.public_key_hex());
    Ok(())
}

fn write_secret(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    writeln!(file, "{contents}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keygen_writes_loadable_seed() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("clerk.key");
        let args = KeygenArgs {
            id: "clerk-1".to_string(),
            out: out.clone(),
            role: KeyRole::Signer,
            force: false,
        };

        keygen(&args).unwrap();
        let seed = std::fs::read_to_string(&out).unwrap();
        assert!(Ed25519Signer::from_seed_hex("clerk-1", &seed).is_ok());

        assert!(keygen(&args).is_err());
    }
}
