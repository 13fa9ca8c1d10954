use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;

use wellcall_api::config::Config;
use wellcall_api::db::Db;
use wellcall_api::router::build_router;
use wellcall_api::scheduler;
use wellcall_api::state::AppState;
use wellcall_api::telephony::TwilioGateway;
use wellcall_api::voice::ElevenLabsClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    info!("Starting wellcall api");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    let db = Db::new(pool);
    db.run_migrations().await.context("migrations failed")?;
    info!("Database ready");

    let telephony = Arc::new(TwilioGateway::new(&config));
    let voice = Arc::new(ElevenLabsClient::new(&config));

    let state = Arc::new(AppState {
        db: Arc::new(db),
        telephony,
        voice,
        config: Arc::new(config.clone()),
    });

    scheduler::spawn(state.clone());

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .context("failed to bind listen address")?;
    info!(address = %config.bind_address, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown handler");
        return;
    }
    info!("Shutdown signal received");
}
