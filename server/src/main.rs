//! freva-rest binary — thin CLI shell over the [`freva_rest`] library crate.

use std::path::PathBuf;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use freva_rest::{api, auth, portal, AppContext, ServerConfig};

/// Run the freva REST API.
#[derive(Parser)]
#[command(name = "freva-rest", version, about, long_about = None)]
struct Cli {
    /// Path to the server configuration file
    #[arg(short = 'c', long, env = "API_CONFIG")]
    config_file: Option<PathBuf>,

    /// The port the api is running on
    #[arg(short = 'p', long, env = "API_PORT", default_value_t = 8080)]
    port: u16,

    /// Turn on debug mode
    #[arg(long)]
    debug: bool,
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

fn main() -> anyhow::Result<()> {
    let workers: usize = std::env::var("API_WORKER")
        .ok()
        .and_then(|w| w.parse().ok())
        .unwrap_or(8);
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()?
        .block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ServerConfig::load(cli.config_file.as_deref(), cli.debug);
    let level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("freva_rest={level}").parse()?),
        )
        .with_target(false)
        .init();

    info!(services = config.api_services.as_str(), "starting freva-rest");
    let ctx = AppContext::new(config);

    let routes = Router::new()
        .route("/databrowser/overview", get(api::overview))
        .route(
            "/databrowser/data-search/{flavour}/{uniq_key}",
            get(api::data_search),
        )
        .route(
            "/databrowser/metadata-search/{flavour}/{uniq_key}",
            get(api::metadata_search),
        )
        .route(
            "/databrowser/extended-search/{flavour}/{uniq_key}",
            get(api::extended_search),
        )
        .route(
            "/databrowser/intake-catalogue/{flavour}/{uniq_key}",
            get(api::intake_catalogue),
        )
        .route("/databrowser/load/{flavour}", get(portal::load_data))
        .route(
            "/databrowser/userdata",
            post(api::post_userdata).delete(api::delete_userdata),
        )
        .route("/data-portal/zarr/{store}/{*key}", get(portal::zarr_key))
        .route("/auth/v2/status", get(auth::get_token_status))
        .route("/auth/v2/userinfo", get(auth::userinfo))
        .route("/auth/v2/token", post(auth::fetch_or_refresh_token))
        .route(
            "/auth/v2/.well-known/openid-configuration",
            get(auth::open_id_config),
        );

    let app = Router::new()
        .nest("/api/freva-nextgen", routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.port)).await?;
    info!(port = cli.port, "http://0.0.0.0:{}", cli.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
