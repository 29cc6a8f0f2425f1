use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use cowrite_server::{EngineConfig, ServerState, server};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
struct Args {
    #[clap(long, default_value = "0.0.0.0:3030")]
    host: SocketAddr,
    #[clap(short, long, default_value = "storage")]
    storage: PathBuf,
    /// Hours of inactivity after which a session is exported and removed.
    #[clap(short, long)]
    expiry_hours: Option<u64>,
    /// Path to a JSON file overriding the default session settings.
    #[clap(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=info,tower_http=info", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut defaults = args
        .config
        .map(|path| {
            serde_json::from_str::<EngineConfig>(
                &std::fs::read_to_string(path).expect("Opening engine config"),
            )
            .expect("Parsing engine config")
        })
        .unwrap_or_default();
    if let Some(hours) = args.expiry_hours {
        defaults.max_session_duration_ms = hours * 60 * 60 * 1_000;
    }

    let state = Arc::new(
        ServerState::new(args.storage, defaults)
            .await
            .expect("Init server state"),
    );

    info!("Starting server on http://{}", args.host);

    let listener = tokio::net::TcpListener::bind(args.host)
        .await
        .expect("Unable to bind to host");
    axum::serve(
        listener,
        server(Arc::clone(&state)).layer(TraceLayer::new_for_http()),
    )
    .with_graceful_shutdown(async { tokio::signal::ctrl_c().await.expect("Listen to ctrlc") })
    .await
    .unwrap();

    info!("Server has shut down");
    state.persist().await;
}
