use axum::{routing::get, Router};
use contact_enrichment::batch::BatchOrchestrator;
use contact_enrichment::config::Config;
use contact_enrichment::data::db::Database;
use contact_enrichment::data::db_storage::EnrichmentStorage;
use contact_enrichment::handlers::{self, AppState};
use contact_enrichment::integrations::generation_client::ChatCompletionsClient;
use contact_enrichment::integrations::research::build_provider;
use contact_enrichment::obs;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

/// Waits for Ctrl-C, then cancels running batches.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown requested, cancelling running batches");
    shutdown.cancel();
}

/// Main entry point for the application.
///
/// Initializes logging, configuration, the database, the research provider and
/// generation client, then serves the HTTP API until Ctrl-C.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    obs::init_tracing();

    let config = Config::from_env()?;

    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");
    let storage = EnrichmentStorage::new(db.pool.clone());

    let provider = build_provider(&config.provider)?;
    let generator = Arc::new(ChatCompletionsClient::new(&config.generation)?);
    tracing::info!("✓ Generation client initialized: {}", generator.model());

    let shutdown = CancellationToken::new();
    let app_state = Arc::new(AppState {
        orchestrator: BatchOrchestrator::new(provider, generator, storage.clone()),
        storage,
        config: config.clone(),
        shutdown: shutdown.clone(),
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limiter configuration"))?,
    );

    let protected_routes = handlers::api_routes().layer(
        ServiceBuilder::new()
            // Request size limit: 5MB max payload
            .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024))
            .layer(GovernorLayer {
                config: governor_conf,
            }),
    );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await?;

    Ok(())
}
