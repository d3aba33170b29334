//! `warden bundle verify` - verify a bundle's HMAC-SHA256 signature without
//! otherwise installing it anywhere.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use warden_core::errors::LoaderError;
use warden_core::loader::{load_bundle, LoaderConfig, PolicySource};

use crate::cli::args::resolve_secret;
use crate::exit_codes;

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Bundle file (JSON)
    pub bundle: PathBuf,

    /// Shared HMAC secret
    #[arg(long, conflicts_with = "secret_file")]
    pub secret: Option<String>,

    /// Read the shared HMAC secret from a file
    #[arg(long, conflicts_with = "secret")]
    pub secret_file: Option<PathBuf>,

    /// Quiet mode - only exit code, no output
    #[arg(long, short)]
    pub quiet: bool,
}

pub fn cmd_verify(args: VerifyArgs) -> i32 {
    match run_verify(&args) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            if !args.quiet {
                eprintln!("error: {e:#}");
            }
            if e.downcast_ref::<LoaderError>()
                .is_some_and(|le| matches!(le, LoaderError::SignatureVerificationFailed))
            {
                exit_codes::POLICY_REJECTED
            } else {
                exit_codes::USAGE_ERROR
            }
        }
    }
}

fn run_verify(args: &VerifyArgs) -> Result<()> {
    let secret = resolve_secret(&args.secret, &args.secret_file)?;
    let base_dir = args.bundle.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));

    let config = LoaderConfig {
        base_dir,
        secret: Some(secret),
        ..LoaderConfig::default()
    };
    let source = PolicySource::Path(args.bundle.clone());
    let bundle = load_bundle(&source, &config).with_context(|| format!("{}", args.bundle.display()))?;

    if !args.quiet {
        println!("signature valid");
        println!("  version: {}", bundle.version);
    }

    Ok(())
}
