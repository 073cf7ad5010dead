use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use warwatch::client::ApiClient;
use warwatch::config::Config;
use warwatch::jobs::{build_schedule, JobDeps};
use warwatch::sink::ChannelSink;
use warwatch::store::Store;

const CONFIG_PATH: &str = "warwatch.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = if Path::new(CONFIG_PATH).exists() {
        Config::load(Path::new(CONFIG_PATH)).context("loading warwatch.toml")?
    } else {
        Config::from_env()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("warwatch v{} starting", env!("CARGO_PKG_VERSION"));
    if !config.has_api_keys() {
        warn!("no API keys configured (WARWATCH_API_KEYS), calling anonymously");
    }

    let store = Store::open(&config.store.path)
        .await
        .with_context(|| format!("opening store at {}", config.store.path))?;
    let client = Arc::new(ApiClient::from_config(&config.api).context("building API client")?);
    let (sink, mut events) = ChannelSink::new();

    let deps = Arc::new(JobDeps {
        client,
        store,
        sink: Arc::new(sink),
    });
    let (schedule, _scores) = build_schedule(&config, deps);

    let mut handles = Vec::new();
    for job in schedule {
        if !job.enabled {
            info!(job = job.runner.name(), "job disabled");
            continue;
        }
        handles.push(job.runner.clone().spawn(job.every));
    }
    info!(jobs = handles.len(), "scheduler running");

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                let payload = serde_json::to_string(&event.payload).unwrap_or_default();
                info!(kind = ?event.kind, at = %event.at, payload = %payload, "notification");
            }

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down...");
                for handle in &handles {
                    handle.abort();
                }
                for result in futures::future::join_all(handles).await {
                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            error!(error = %e, "job task ended abnormally");
                        }
                    }
                }
                break;
            }
        }
    }

    Ok(())
}
