use chrono::Duration;
use seatline_core::{BookingResult, BookingStore, Clock, SystemClock};
use seatline_shared::BookingState;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::machine::BookingStateMachine;
use crate::reservation::{lock_booking, DEFAULT_HOLD_WINDOW};

/// Releases seats whose hold window lapsed without payment.
#[derive(Clone)]
pub struct ExpirySweeper {
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    hold_window: Duration,
}

impl ExpirySweeper {
    pub fn new(store: Arc<dyn BookingStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            hold_window: DEFAULT_HOLD_WINDOW,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_hold_window(mut self, hold_window: Duration) -> Self {
        self.hold_window = hold_window;
        self
    }

    /// Expire every stale SEAT_HELD booking and return how many were expired.
    ///
    /// Each booking is expired in its own unit of work under its seat lock, so
    /// a booking that moved on since the candidate scan is left alone. One
    /// failing booking does not stop the sweep.
    pub async fn sweep(&self) -> BookingResult<usize> {
        let now = self.clock.now();
        let candidates = {
            let mut uow = self.store.begin().await?;
            uow.held_since(now - self.hold_window).await?
        };

        if candidates.is_empty() {
            return Ok(0);
        }
        debug!("Found {} expiry candidates", candidates.len());

        let mut expired = 0;
        for candidate in candidates {
            match self.expire_one(candidate.id).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    "Failed to expire booking {}: {}",
                    candidate.booking_reference, e
                ),
            }
        }

        if expired > 0 {
            info!("Expired {} seat holds", expired);
        }
        Ok(expired)
    }

    async fn expire_one(&self, booking_id: Uuid) -> BookingResult<bool> {
        let mut uow = self.store.begin().await?;
        let mut booking = lock_booking(uow.as_mut(), booking_id).await?;
        let now = self.clock.now();

        if booking.state != BookingState::SeatHeld || !booking.is_hold_expired(now, self.hold_window) {
            return Ok(false);
        }

        BookingStateMachine::transition(
            uow.as_mut(),
            &mut booking,
            BookingState::Expired,
            Some("seat hold timed out"),
            now,
        )
        .await?;
        uow.commit().await?;

        info!("Booking {} expired, seat released", booking.booking_reference);
        Ok(true)
    }
}
