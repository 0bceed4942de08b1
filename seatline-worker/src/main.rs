use anyhow::Context;
use seatline_booking::ExpirySweeper;
use seatline_core::BookingStore;
use seatline_store::{app_config::Config, DbClient};
use seatline_worker::run_expiry_worker;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "seatline_worker=debug,seatline_booking=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!(
        "Starting Seatline expiry worker (hold window {}s)",
        config.booking.seat_hold_seconds
    );

    let db = DbClient::new(&config.database)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;

    let store: Arc<dyn BookingStore> = Arc::new(db.store());
    let hold_window = config.booking.seat_hold().context("Invalid hold window")?;
    let sweeper = ExpirySweeper::new(store).with_hold_window(hold_window);

    run_expiry_worker(sweeper, config.sweeper.interval(), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    })
    .await;

    Ok(())
}
