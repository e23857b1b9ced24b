use anyhow::Result;
use std::future::IntoFuture;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tether::app;
use tether::config::{Config, LogFormat};
use tether::events;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    // Tracing comes up before the rest of the configuration so its warnings are visible
    init_tracing(LogFormat::from_value(std::env::var("LOG_FORMAT").ok().as_deref()));

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration");

    let store = app::open_store(&config).await?;
    info!("Database initialized successfully");

    let sink = events::sink_from_config(&config.events)?;
    info!("Publishing events to the {:?} sink", config.events.sink);

    let content = app::default_content_source(&config)?;
    let tether = app::build(&config, store, sink, content)?;

    // Start API server
    let api_addr = format!("{}:{}", config.api_server.host, config.api_server.port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr).await?;
    info!("🚀 API server listening on http://{}", api_addr);
    info!("   - Events API available at http://{}/api/v1/events/...", api_addr);

    // Start redirect server
    let redirect_addr = format!(
        "{}:{}",
        config.redirect_server.host, config.redirect_server.port
    );
    let redirect_listener = tokio::net::TcpListener::bind(&redirect_addr).await?;
    info!("🚀 Redirect server listening on http://{}", redirect_addr);

    // Run both servers concurrently
    tokio::try_join!(
        axum::serve(
            api_listener,
            tether
                .api_router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .into_future(),
        axum::serve(
            redirect_listener,
            tether
                .redirect_router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .into_future(),
    )?;

    info!("Draining pending events...");
    tether.publisher.shutdown().await;
    Ok(())
}
