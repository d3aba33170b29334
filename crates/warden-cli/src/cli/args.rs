use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "warden",
    version,
    about = "Offline operator CLI for warden-core policy bundles"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Bundle lifecycle: validate, sign, verify
    Bundle(BundleArgs),
    /// Simulate one request against a bundle and print the decision
    Check(super::commands::check::CheckArgs),
}

#[derive(Parser)]
pub struct BundleArgs {
    #[command(subcommand)]
    pub cmd: BundleCmd,
}

#[derive(Subcommand)]
pub enum BundleCmd {
    /// Parse, size-guard, and semantically validate a bundle (no signature check unless --secret is given)
    Validate(super::commands::bundle_validate::ValidateArgs),
    /// Compute and write back an HMAC-SHA256 signature
    Sign(super::commands::bundle_sign::SignArgs),
    /// Verify a bundle's HMAC-SHA256 signature
    Verify(super::commands::bundle_verify::VerifyArgs),
}

/// Reads a secret from `--secret`, or failing that from the file at
/// `--secret-file`, trimming a single trailing newline the way a shell
/// heredoc or `printf` without `-n` tends to leave behind.
pub fn resolve_secret(secret: &Option<String>, secret_file: &Option<PathBuf>) -> anyhow::Result<Vec<u8>> {
    if let Some(s) = secret {
        return Ok(s.as_bytes().to_vec());
    }
    if let Some(path) = secret_file {
        let mut bytes = std::fs::read(path)?;
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
        }
        return Ok(bytes);
    }
    anyhow::bail!("must specify --secret or --secret-file")
}
