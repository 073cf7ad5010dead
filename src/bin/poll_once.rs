//! Run one reconciliation job a single time and print what it emitted.
//!
//! Usage:
//!   cargo run --bin poll_once -- long_term_leader
//!   cargo run --bin poll_once -- listing --force
//!
//! `--force` bypasses the cooldown guard, like the operator's manual poll.
//! Events are printed as JSON lines on stdout; logs go to stderr.

use anyhow::{bail, Context};
use std::path::Path;
use std::sync::Arc;

use warwatch::client::ApiClient;
use warwatch::config::Config;
use warwatch::jobs::{build_schedule, JobDeps, TickOutcome};
use warwatch::sink::MemorySink;
use warwatch::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let force = std::env::args().any(|a| a == "--force");
    let name = std::env::args().skip(1).find(|a| !a.starts_with("--"));

    let config = if Path::new("warwatch.toml").exists() {
        Config::load(Path::new("warwatch.toml")).context("loading warwatch.toml")?
    } else {
        Config::from_env()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let store = Store::open(&config.store.path)
        .await
        .with_context(|| format!("opening store at {}", config.store.path))?;
    let client = Arc::new(ApiClient::from_config(&config.api).context("building API client")?);
    let sink = Arc::new(MemorySink::new());
    let deps = Arc::new(JobDeps {
        client,
        store,
        sink: sink.clone(),
    });
    let (schedule, _scores) = build_schedule(&config, deps);

    let names: Vec<&str> = schedule.iter().map(|s| s.runner.name()).collect();
    let Some(name) = name else {
        bail!("usage: poll_once <job> [--force]; jobs: {}", names.join(", "));
    };
    let Some(job) = schedule.iter().find(|s| s.runner.name() == name) else {
        bail!("unknown job {name:?}; jobs: {}", names.join(", "));
    };

    let outcome = if force {
        job.runner.run_forced().await
    } else {
        job.runner.run_tick().await
    };

    for event in sink.take() {
        println!("{}", serde_json::to_string(&event)?);
    }

    match outcome {
        TickOutcome::Completed(report) => {
            eprintln!("{name}: processed {} emitted {}", report.processed, report.emitted);
        }
        TickOutcome::Skipped { next_due } => {
            eprintln!("{name}: cooldown active until {next_due} (use --force)");
        }
        TickOutcome::Overlapped => eprintln!("{name}: already running"),
        TickOutcome::Failed(e) => bail!("{name} failed: {e}"),
    }
    Ok(())
}
