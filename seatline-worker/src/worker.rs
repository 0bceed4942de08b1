use seatline_booking::ExpirySweeper;
use std::future::Future;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

/// Run the hold-expiry sweep every `every` until `shutdown` resolves.
///
/// The first sweep runs immediately. A failed sweep is logged and retried on
/// the next tick. Returns the number of bookings expired over the run.
pub async fn run_expiry_worker<F>(sweeper: ExpirySweeper, every: Duration, shutdown: F) -> usize
where
    F: Future<Output = ()>,
{
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!("Expiry worker started, sweeping every {:?}", every);

    let mut total = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => match sweeper.sweep().await {
                Ok(expired) => total += expired,
                Err(e) => error!("Expiry sweep failed: {}", e),
            },
        }
    }

    info!("Expiry worker stopped after expiring {} holds", total);
    total
}
