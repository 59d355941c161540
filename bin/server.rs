// Statement Ingest - Web Server
// REST API with Axum over the document pipeline

use anyhow::{Context, Result};
use statement_ingest::api::router;
use statement_ingest::logging::init_logging;
use statement_ingest::{Config, Pipeline};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_logging(&config.logging);

    println!("🌐 Statement Ingest - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let pipeline = Pipeline::from_config(&config)
        .with_context(|| format!("Failed to open database {}", config.database.path.display()))?;
    let database = pipeline.database().clone();
    println!("✓ Database opened: {}", config.database.path.display());
    println!("✓ Uploads stored in: {}", config.storage.upload_dir.display());

    let default_backend = pipeline.registry().default_kind();
    let app = router(pipeline);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.bind))?;

    println!("\n🚀 Server running on http://{}", config.server.bind);
    println!("   API:    http://{}/api/documents", config.server.bind);
    println!("   Health: http://{}/health", config.server.bind);
    println!("\n   Press Ctrl+C to stop\n");
    info!(bind = %config.server.bind, backend = ?default_backend, "Server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // the router (and its pipeline clone) is gone once serve returns
    if !database.close()? {
        warn!("Database still in use at shutdown; left for process exit");
    }
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
