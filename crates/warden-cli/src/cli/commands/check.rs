//! `warden check` - simulate one request against a bundle and print the
//! resulting decision. Runs the evaluator only (no plugins, no resolution
//! callbacks): useful for testing a bundle offline before deploying it
//! behind a live engine.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use warden_core::engine::{CheckParams, Engine, EngineConfig, InitialPolicySource};
use warden_core::loader::{LoaderConfig, PolicySource};
use warden_core::schema::TrustLevel;
use warden_core::value::Value;

use crate::cli::args::resolve_secret;
use crate::exit_codes;

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Bundle file (JSON)
    pub bundle: PathBuf,

    /// Acting agent's id
    #[arg(long)]
    pub agent_id: String,

    /// Tool being invoked
    #[arg(long)]
    pub tool_name: String,

    /// Target environment
    #[arg(long)]
    pub environment: String,

    /// Agent type (e.g. "autonomous", "supervised")
    #[arg(long)]
    pub agent_type: Option<String>,

    /// Agent trust level
    #[arg(long, value_parser = parse_trust_level)]
    pub trust_level: Option<TrustLevel>,

    /// Agent roles (repeatable)
    #[arg(long = "role")]
    pub roles: Vec<String>,

    /// Tool provider identity
    #[arg(long)]
    pub tool_provider: Option<String>,

    /// Tool arguments as a JSON object
    #[arg(long)]
    pub tool_args: Option<String>,

    /// Free-text user input to match `when.matches_regex` / `contains_any` against
    #[arg(long)]
    pub user_input: Option<String>,

    /// Data labels attached to the request (repeatable)
    #[arg(long = "data-label")]
    pub data_labels: Vec<String>,

    /// Shared HMAC secret to verify the bundle's signature with
    #[arg(long, conflicts_with = "secret_file")]
    pub secret: Option<String>,

    /// Read the shared HMAC secret from a file
    #[arg(long, conflicts_with = "secret")]
    pub secret_file: Option<PathBuf>,
}

fn parse_trust_level(s: &str) -> Result<TrustLevel, String> {
    TrustLevel::parse(s).ok_or_else(|| format!("unknown trust level: {s}"))
}

pub fn cmd_check(args: CheckArgs) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e:#}");
            return exit_codes::USAGE_ERROR;
        }
    };
    match runtime.block_on(run_check(&args)) {
        Ok(allowed) => {
            if allowed {
                exit_codes::SUCCESS
            } else {
                exit_codes::POLICY_REJECTED
            }
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_codes::USAGE_ERROR
        }
    }
}

async fn run_check(args: &CheckArgs) -> Result<bool> {
    let tool_args: BTreeMap<String, Value> = match &args.tool_args {
        Some(raw) => {
            let json: serde_json::Value =
                serde_json::from_str(raw).context("--tool-args is not valid JSON")?;
            let serde_json::Value::Object(map) = json else {
                anyhow::bail!("--tool-args must be a JSON object");
            };
            map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()
        }
        None => BTreeMap::new(),
    };

    let secret = if args.secret.is_some() || args.secret_file.is_some() {
        Some(resolve_secret(&args.secret, &args.secret_file)?)
    } else {
        None
    };
    let base_dir = args.bundle.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));

    let mut config = EngineConfig::new(InitialPolicySource::Sync(PolicySource::Path(args.bundle.clone())));
    config.loader_config = LoaderConfig {
        base_dir,
        secret,
        ..LoaderConfig::default()
    };
    let engine = Engine::new(config).await.context("failed to load bundle")?;

    let params = CheckParams {
        agent_id: args.agent_id.clone(),
        tool_name: args.tool_name.clone(),
        tool_args,
        environment: Some(args.environment.clone()),
        agent_type: args.agent_type.clone(),
        trust_level: args.trust_level,
        roles: args.roles.clone(),
        tool_provider: args.tool_provider.clone(),
        user_input: args.user_input.clone(),
        data_labels: args.data_labels.clone(),
        ..Default::default()
    };

    let result = engine.check(params).await.context("check failed")?;
    let rendered = serde_json::to_string_pretty(&result.decision)?;
    println!("{rendered}");

    Ok(result.allowed)
}
