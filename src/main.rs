use anyhow::Result;
use calsync::run::{run, RunContext};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Compute and log the plan without touching calendars or the state store
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let ctx = match RunContext::from_config_file(&args.config, args.dry_run).await {
        Ok((_, ctx)) => ctx,
        Err(err) => {
            error!(%err, "cannot start run");
            return Err(err.into());
        }
    };
    info!(lock = %ctx.lock_path().display(), dry_run = args.dry_run, "state lock held");

    match run(&ctx, Utc::now()).await {
        Ok(summary) if summary.is_partial() => {
            warn!(run_id = %summary.run_id, "run finished with failures");
            Ok(ExitCode::from(2))
        }
        Ok(summary) => {
            info!(run_id = %summary.run_id, "run finished");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            error!(%err, "run failed");
            Err(err.into())
        }
    }
}
