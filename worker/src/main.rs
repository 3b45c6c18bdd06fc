//! Daemon that waits for messages to load data into the chunk store.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use data_portal_worker::ProcessQueue;

/// Credentials for the cache, read from a base64-encoded JSON file that
/// the deployment drops for every worker.
#[derive(Debug, Default, Deserialize)]
struct CacheConfig {
    #[serde(default)]
    user: String,
    #[serde(default)]
    passwd: String,
    #[serde(default)]
    ssl_cert: String,
    #[serde(default)]
    ssl_key: String,
}

/// Starts the data loading service.
#[derive(Parser)]
#[command(name = "data-portal-worker", version, about, long_about = None)]
struct Cli {
    /// Path to the config file holding the cache credentials.
    #[arg(short = 'c', long)]
    config_file: Option<PathBuf>,

    /// Set the expiry time of the cache records in seconds.
    #[arg(short = 'e', long, env = "API_CACHE_EXP", default_value_t = 3600)]
    exp: u64,

    /// Host:Port of the cache.
    #[arg(short = 'r', long, env = "API_REDIS_HOST", default_value = "redis://localhost:6379")]
    redis_host: String,

    /// Public url of the REST API, used in status records.
    #[arg(long, env = "API_PROXY", default_value = "http://localhost")]
    proxy: String,

    /// Display debug messages.
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn default_config_file() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("freva")
        .join("data-portal-cluster-config.json")
}

fn read_cache_config(path: &PathBuf) -> CacheConfig {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path.display(), error = %error, "no cache credentials, connecting anonymously");
            return CacheConfig::default();
        }
    };
    base64::decode(raw.trim_ascii())
        .ok()
        .and_then(|decoded| serde_json::from_slice(&decoded).ok())
        .unwrap_or_else(|| {
            warn!(path = %path.display(), "could not decode cache credentials");
            CacheConfig::default()
        })
}

/// Build the cache url from the host flag and the credential file.
fn redis_url(host: &str, config: &CacheConfig) -> String {
    let host = host.split("://").last().unwrap_or(host);
    let scheme = if config.ssl_cert.is_empty() && config.ssl_key.is_empty() {
        "redis"
    } else {
        "rediss"
    };
    let auth = match (config.user.as_str(), config.passwd.as_str()) {
        ("", "") => String::new(),
        (user, passwd) => format!("{user}:{passwd}@"),
    };
    format!("{scheme}://{auth}{host}/0")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("data_portal_worker={level}").parse()?),
        )
        .with_target(false)
        .init();

    let config_file = cli.config_file.unwrap_or_else(default_config_file);
    let cache_config = read_cache_config(&config_file);
    let url = redis_url(&cli.redis_host, &cache_config);
    let queue = ProcessQueue::new(url, cli.exp, cli.proxy);

    tokio::select! {
        result = queue.run_forever() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
    }
    Ok(())
}
