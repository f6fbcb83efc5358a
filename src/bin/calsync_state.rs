use std::path::PathBuf;

use anyhow::{anyhow, Result};
use calsync::config;
use calsync::db;
use calsync::model::Category;
use clap::Parser;

/// Print the stored sync records and recent run history.
#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only show one category (mission, patch, upcoming)
    #[arg(long)]
    category: Option<String>,

    /// Number of past runs to list
    #[arg(long, default_value_t = 5)]
    runs: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let categories = match args.category.as_deref() {
        Some(name) => vec![Category::parse_category(name)
            .ok_or_else(|| anyhow!("unknown category {}", name))?],
        None => Category::ALL.to_vec(),
    };

    let path = cfg.app.state_db_path();
    if !path.exists() {
        println!("No state store at {}", path.display());
        return Ok(());
    }
    let pool = db::init_pool(&path).await?;
    db::run_migrations(&pool).await?;

    for category in categories {
        let mut records: Vec<_> = db::load_records(&pool, category).await?.into_values().collect();
        records.sort_by(|a, b| a.end_time.cmp(&b.end_time));
        println!("[{}] {} record(s)", category, records.len());
        for r in records {
            println!(
                "  {:<24} event={} end={} seen={} missing={}",
                r.source_id,
                r.target_event_id,
                r.end_time.to_rfc3339(),
                r.last_seen_at.to_rfc3339(),
                r.missing_runs
            );
        }
    }

    let runs = db::recent_runs(&pool, args.runs).await?;
    println!("Recent runs:");
    for run in runs {
        println!(
            "  {} started={} finished={}{}",
            run.id,
            run.started_at.to_rfc3339(),
            run.finished_at.to_rfc3339(),
            if run.dry_run { " (dry run)" } else { "" }
        );
        if let Some(categories) = run.summary["categories"].as_array() {
            for c in categories {
                println!("    {}", c);
            }
        }
    }
    Ok(())
}
