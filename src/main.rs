use clap::Parser;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::time::Duration;
use stem_separation_service::config::ServiceConfig;
use stem_separation_service::infrastructure::{separator, storage};
use stem_separation_service::services::worker::BackgroundWorker;
use stem_separation_service::{AppState, create_app};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "GPU stem separation service", long_about = None)]
struct Args {
    /// Bind address, overrides HOST
    #[arg(long)]
    host: Option<String>,

    /// Bind port, overrides PORT
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    // Initialize tracing with EnvFilter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stem_separation_service=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting Stem Separation Service...");

    let mut config = ServiceConfig::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    info!(
        "🎚️  Config: Output={} Max Size={}MB Mode={:?} TTL={}h",
        config.output_dir.display(),
        config.max_file_size / 1024 / 1024,
        config.separation_mode,
        config.job_ttl_hours
    );

    // Setup Infrastructure
    let separator_service = separator::setup_separator(&config).await;
    let storage_service = storage::setup_storage(&config.storage).await;

    let state = AppState::new(config.clone(), separator_service, storage_service);

    let restored = state.registry.rehydrate().await?;
    if restored > 0 {
        info!("♻️  Restored {} finished jobs from {}", restored, config.output_dir.display());
    }

    // Setup Shutdown Channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Start Background Worker
    let worker = BackgroundWorker::new(
        state.separation_service.clone(),
        Duration::from_secs(config.cleanup_interval_secs.max(1)),
        config.ttl(),
        shutdown_rx,
    );
    tokio::spawn(async move {
        worker.run().await;
    });

    let app = create_app(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("✅ Server ready at http://{}", addr);
    info!("📖 Swagger UI: http://{}/swagger-ui", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    info!("🛑 Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, starting graceful shutdown...");
        },
    }
}
