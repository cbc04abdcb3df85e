use anyhow::Context;
use back_office::{clock, config::Config, routes::app, state::AppState};
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ─── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("back_office=debug,tower_http=info")),
        )
        .with_max_level(Level::TRACE)
        .init();

    // ─── Config ───────────────────────────────────────────────────────────────
    let config = Config::from_env()?;
    let addr = config.server_addr();
    let billing_interval = Duration::from_secs(config.billing_interval_secs.max(1));

    // ─── Database ─────────────────────────────────────────────────────────────
    let db = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(5))
                .connect(url)
                .await
                .context("Failed to connect to Postgres")?;

            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run database migrations")?;

            info!("Database connected and migrations applied ✓");
            Some(pool)
        }
        None => {
            info!("DATABASE_URL not set, using in-memory stores");
            None
        }
    };

    // ─── App State ────────────────────────────────────────────────────────────
    let state = AppState::new(db, config).await?;

    // ─── Recurring billing ────────────────────────────────────────────────────
    let billing_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(billing_interval);
        loop {
            ticker.tick().await;
            let today = clock::today(billing_state.config.default_timezone);
            match billing_state.subscriptions.run_recurring_billing(today).await {
                Ok(report) => info!(
                    "Billing run {}: {} invoiced, {} charged, {} failed, {} churned",
                    today, report.invoiced, report.charged, report.failed, report.churned
                ),
                Err(e) => error!("Billing run {} failed: {}", today, e),
            }
        }
    });

    // ─── Start Server ─────────────────────────────────────────────────────────
    info!("🚀 Back Office API listening on http://{}", addr);
    info!("📖 Swagger UI:  http://{}/docs", addr);
    info!("❤️  Health:      http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app(state)).await.context("Server failed")?;
    Ok(())
}
