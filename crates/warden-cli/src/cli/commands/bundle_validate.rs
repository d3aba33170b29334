//! `warden bundle validate` - parse, size-guard, and semantically validate a
//! policy bundle, optionally verifying its signature.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use warden_core::loader::{load_bundle, LoaderConfig, PolicySource};

use crate::cli::args::resolve_secret;
use crate::exit_codes;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Bundle file (JSON)
    pub bundle: PathBuf,

    /// Base directory the bundle path must resolve within
    #[arg(long)]
    pub base_dir: Option<PathBuf>,

    /// Shared HMAC secret to verify the signature with (otherwise signature is not checked)
    #[arg(long, conflicts_with = "secret_file")]
    pub secret: Option<String>,

    /// Read the shared HMAC secret from a file
    #[arg(long, conflicts_with = "secret")]
    pub secret_file: Option<PathBuf>,
}

pub fn cmd_validate(args: ValidateArgs) -> i32 {
    match run_validate(&args) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_codes::POLICY_REJECTED
        }
    }
}

fn run_validate(args: &ValidateArgs) -> Result<()> {
    let secret = if args.secret.is_some() || args.secret_file.is_some() {
        Some(resolve_secret(&args.secret, &args.secret_file)?)
    } else {
        None
    };

    let base_dir = args
        .base_dir
        .clone()
        .or_else(|| args.bundle.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));

    let config = LoaderConfig {
        base_dir,
        secret,
        ..LoaderConfig::default()
    };
    let source = PolicySource::Path(args.bundle.clone());
    let bundle = load_bundle(&source, &config).with_context(|| format!("{}", args.bundle.display()))?;

    println!("bundle is valid");
    println!("  version:     {}", bundle.version);
    println!("  rules:       {}", bundle.rules.len());
    println!("  generated_at: {}", bundle.generated_at);
    println!("  expires_at:   {}", bundle.expires_at);
    println!("  signed:       {}", bundle.signature.is_some());

    Ok(())
}
