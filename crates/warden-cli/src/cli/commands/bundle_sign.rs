//! `warden bundle sign` - compute and write back an HMAC-SHA256 signature.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use warden_core::schema::PolicyBundle;

use crate::cli::args::resolve_secret;
use crate::exit_codes;

#[derive(Args, Debug)]
pub struct SignArgs {
    /// Bundle file (JSON)
    pub bundle: PathBuf,

    /// Shared HMAC secret
    #[arg(long, conflicts_with = "secret_file")]
    pub secret: Option<String>,

    /// Read the shared HMAC secret from a file
    #[arg(long, conflicts_with = "secret")]
    pub secret_file: Option<PathBuf>,

    /// Output file (required unless --in-place)
    #[arg(long, short)]
    pub out: Option<PathBuf>,

    /// Modify input file in place
    #[arg(long, conflicts_with = "out")]
    pub in_place: bool,
}

pub fn cmd_sign(args: SignArgs) -> i32 {
    match run_sign(args) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_codes::USAGE_ERROR
        }
    }
}

fn run_sign(args: SignArgs) -> Result<()> {
    let output_path = if args.in_place {
        args.bundle.clone()
    } else if let Some(out) = args.out.clone() {
        out
    } else {
        anyhow::bail!("must specify --out <PATH> or --in-place");
    };

    let secret = resolve_secret(&args.secret, &args.secret_file)?;

    let text = fs::read_to_string(&args.bundle)
        .with_context(|| format!("failed to read bundle: {}", args.bundle.display()))?;
    let bundle: PolicyBundle = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse bundle JSON: {}", args.bundle.display()))?;

    let signed = warden_core::loader::sign_bundle(&bundle, &secret)?;
    let signature = signed
        .get("signature")
        .and_then(serde_json::Value::as_str)
        .expect("just signed");

    let output_json = serde_json::to_string_pretty(&signed)?;
    fs::write(&output_path, output_json)
        .with_context(|| format!("failed to write output: {}", output_path.display()))?;

    println!("Signed bundle:");
    println!("  Input:  {}", args.bundle.display());
    println!("  Output: {}", output_path.display());
    println!("  signature: {signature}");

    Ok(())
}
