//! TableSnap command line and HTTP entry point

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tablesnap::cli::{Cli, Command};
use tablesnap::config::Settings;
use tablesnap::routes::create_router;
use tablesnap::state::{AppState, SharedState};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse_args();
    let settings = Settings::load()?;
    let state = Arc::new(AppState::from_settings(&settings).await?);
    let engine = &state.engine;

    match cli.command {
        Command::Serve => serve(Arc::clone(&state), &settings).await?,
        Command::Take { tables } => {
            let version = engine.take(&tables).await?;
            println!("{}", serde_json::json!({ "versionId": version, "tables": tables }));
        }
        Command::Diff { table, output } => {
            let diff = engine.diff_from_previous(&table).await?;
            if diff.is_empty() {
                info!("No changes in {} since the previous snapshot", table);
            }
            write_json(&diff, output.as_deref()).await?;
        }
        Command::Tables { kinds } => {
            for table in engine.list_candidates(&kinds).await? {
                println!("{}", table);
            }
        }
        Command::Metadata { output } => {
            for table in engine.list_candidates(&[]).await? {
                if let Err(e) = engine.schema(&table).await {
                    warn!("Skipping {}: {}", table, e);
                }
            }
            let count = engine.introspector().export_definitions(&output).await?;
            println!("Wrote {} table definitions to {}", count, output.display());
        }
        Command::Versions { table } => {
            let versions = engine.versions(&table).await?;
            write_json(&versions, None).await?;
        }
        Command::Prune { table, keep } => {
            for dropped in engine.prune(&table, keep).await? {
                println!("dropped {}", dropped);
            }
        }
        Command::Clear => {
            let dropped = engine.clear().await?;
            println!("Cleared {} snapshot tables", dropped);
        }
    }

    Ok(())
}

async fn serve(state: SharedState, settings: &Settings) -> anyhow::Result<()> {
    let app = create_router(state, settings);
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("Server listening on http://{}", addr);
    info!("   GET    /api/tables                       - List source tables");
    info!("   GET    /api/tables/{{table}}/schema        - Table schema");
    info!("   POST   /api/snapshots                    - Take a snapshot");
    info!("   GET    /api/snapshots/{{table}}/versions   - Version ledger");
    info!("   GET    /api/snapshots/{{table}}/diff       - Diff against previous");
    info!("   POST   /api/snapshots/{{table}}/prune      - Drop old snapshots");
    info!("   DELETE /api/snapshots                    - Drop all snapshots");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn write_json<T: serde::Serialize>(value: &T, output: Option<&Path>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            tokio::fs::write(path, json).await?;
            info!("Wrote {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tablesnap=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
