use chrono::{DateTime, Duration, Utc};
use seatline_core::{
    BookingError, BookingResult, BookingStore, Clock, StoreError, SystemClock, UnitOfWork,
};
use seatline_shared::{
    Booking, BookingState, BookingStateHistory, PassengerDetails, Payment, PaymentStatus, Refund,
    RefundStatus,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::AuditTrail;
use crate::ledger::SeatLedger;
use crate::machine::BookingStateMachine;
use crate::references::{self, MAX_REFERENCE_ATTEMPTS};

/// How long a seat stays held waiting for payment.
pub const DEFAULT_HOLD_WINDOW: Duration = Duration::minutes(10);

/// A booking together with everything it owns
#[derive(Debug, Clone, Serialize)]
pub struct BookingDetails {
    pub booking: Booking,
    pub hold_expires_at: Option<DateTime<Utc>>,
    pub history: Vec<BookingStateHistory>,
    pub payments: Vec<Payment>,
    pub refunds: Vec<Refund>,
}

/// Drives the create → hold → pay → confirm/cancel → refund workflow.
///
/// Each operation is one unit of work. The booking's seat row is locked
/// before anything about the booking or the seat is read, and every input
/// is re-read from the store under that lock.
#[derive(Clone)]
pub struct ReservationController {
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    hold_window: Duration,
}

impl ReservationController {
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

    pub fn hold_window(&self) -> Duration {
        self.hold_window
    }

    pub fn ledger(&self) -> SeatLedger {
        SeatLedger::new(self.store.clone())
    }

    /// Create an INITIATED booking for a free seat, priced at the flight's fare.
    pub async fn create_booking(
        &self,
        flight_id: Uuid,
        seat_id: Uuid,
        passenger: PassengerDetails,
    ) -> BookingResult<Booking> {
        surface("create_booking", self.create_in_unit(flight_id, seat_id, passenger).await)
    }

    /// INITIATED → SEAT_HELD. Starts the hold window.
    pub async fn hold_seat(&self, booking_id: Uuid) -> BookingResult<Booking> {
        surface("hold_seat", self.hold_in_unit(booking_id).await)
    }

    /// `create_booking` followed by `hold_seat`.
    pub async fn reserve_seat(
        &self,
        flight_id: Uuid,
        seat_id: Uuid,
        passenger: PassengerDetails,
    ) -> BookingResult<Booking> {
        let booking = self.create_booking(flight_id, seat_id, passenger).await?;
        self.hold_seat(booking.id).await
    }

    /// SEAT_HELD → PAYMENT_PENDING with a new PENDING payment.
    ///
    /// A stale hold is expired on the spot and reported as `HoldExpired`.
    pub async fn initiate_payment(
        &self,
        booking_id: Uuid,
        payment_method: &str,
    ) -> BookingResult<(Booking, Payment)> {
        surface(
            "initiate_payment",
            self.initiate_payment_in_unit(booking_id, payment_method).await,
        )
    }

    /// The booking's payment still waiting for a gateway outcome, if any.
    pub async fn pending_payment(&self, booking_id: Uuid) -> BookingResult<Option<Payment>> {
        surface("pending_payment", self.pending_payment_in_unit(booking_id).await)
    }

    /// Settle a PENDING payment. `simulate_failure` stands in for the gateway
    /// verdict: success confirms the booking, failure cancels it.
    pub async fn process_payment(
        &self,
        booking_id: Uuid,
        payment_id: Uuid,
        simulate_failure: bool,
    ) -> BookingResult<(Booking, Payment)> {
        surface(
            "process_payment",
            self.process_payment_in_unit(booking_id, payment_id, simulate_failure).await,
        )
    }

    /// CONFIRMED → CANCELLED
    pub async fn cancel_booking(&self, booking_id: Uuid, reason: &str) -> BookingResult<Booking> {
        surface("cancel_booking", self.cancel_in_unit(booking_id, reason).await)
    }

    /// CANCELLED → REFUNDED, reversing the booking's successful payment.
    pub async fn process_refund(
        &self,
        booking_id: Uuid,
        reason: &str,
    ) -> BookingResult<(Booking, Refund)> {
        surface("process_refund", self.refund_in_unit(booking_id, reason).await)
    }

    pub async fn booking_details(&self, reference: &str) -> BookingResult<BookingDetails> {
        surface("booking_details", self.details_in_unit(reference).await)
    }
}

impl ReservationController {
    async fn create_in_unit(
        &self,
        flight_id: Uuid,
        seat_id: Uuid,
        passenger: PassengerDetails,
    ) -> BookingResult<Booking> {
        let mut uow = self.store.begin().await?;

        let seat = uow
            .lock_seat(seat_id)
            .await?
            .ok_or_else(|| BookingError::not_found("Seat", seat_id))?;
        let flight = uow
            .get_flight(flight_id)
            .await?
            .ok_or_else(|| BookingError::not_found("Flight", flight_id))?;
        if seat.flight_id != flight.id {
            return Err(BookingError::not_found(
                "Seat",
                format!("{} on flight {}", seat.seat_number, flight.flight_number),
            ));
        }

        if !SeatLedger::seat_is_free(uow.as_mut(), seat.id).await? {
            return Err(BookingError::SeatUnavailable {
                seat_id: seat.id,
                seat_number: seat.seat_number,
            });
        }

        let reference = unused_booking_reference(uow.as_mut()).await?;
        let booking = Booking::new(
            reference,
            flight.id,
            seat.id,
            passenger,
            flight.price,
            self.clock.now(),
        );
        uow.insert_booking(&booking).await?;
        uow.commit().await?;

        info!(
            "Booking {} created for seat {} on flight {}",
            booking.booking_reference, seat.seat_number, flight.flight_number
        );
        Ok(booking)
    }

    async fn hold_in_unit(&self, booking_id: Uuid) -> BookingResult<Booking> {
        let mut uow = self.store.begin().await?;
        let mut booking = lock_booking(uow.as_mut(), booking_id).await?;

        BookingStateMachine::ensure_transition(&booking, BookingState::SeatHeld)?;
        // Another booking may have taken the seat since this one was created
        if !SeatLedger::seat_is_free(uow.as_mut(), booking.seat_id).await? {
            let seat = uow
                .get_seat(booking.seat_id)
                .await?
                .ok_or_else(|| BookingError::not_found("Seat", booking.seat_id))?;
            return Err(BookingError::SeatUnavailable {
                seat_id: seat.id,
                seat_number: seat.seat_number,
            });
        }

        let now = self.clock.now();
        BookingStateMachine::transition(uow.as_mut(), &mut booking, BookingState::SeatHeld, None, now)
            .await?;
        uow.commit().await?;

        log_transition(&booking, BookingState::Initiated);
        Ok(booking)
    }

    async fn initiate_payment_in_unit(
        &self,
        booking_id: Uuid,
        payment_method: &str,
    ) -> BookingResult<(Booking, Payment)> {
        let mut uow = self.store.begin().await?;
        let mut booking = lock_booking(uow.as_mut(), booking_id).await?;
        let now = self.clock.now();

        if booking.is_hold_expired(now, self.hold_window) {
            let expired_at = booking
                .hold_expires_at(self.hold_window)
                .unwrap_or(now);
            BookingStateMachine::transition(
                uow.as_mut(),
                &mut booking,
                BookingState::Expired,
                Some("hold window elapsed before payment"),
                now,
            )
            .await?;
            uow.commit().await?;

            log_transition(&booking, BookingState::SeatHeld);
            return Err(BookingError::HoldExpired {
                reference: booking.booking_reference,
                expired_at,
            });
        }

        BookingStateMachine::ensure_transition(&booking, BookingState::PaymentPending)?;

        let method = match payment_method.trim() {
            "" => "MOCK",
            method => method,
        };
        let payment = Payment::new(
            booking.id,
            references::transaction_id(),
            booking.amount,
            method.to_string(),
            now,
        );
        uow.insert_payment(&payment).await?;
        BookingStateMachine::transition(
            uow.as_mut(),
            &mut booking,
            BookingState::PaymentPending,
            None,
            now,
        )
        .await?;
        uow.commit().await?;

        log_transition(&booking, BookingState::SeatHeld);
        Ok((booking, payment))
    }

    async fn pending_payment_in_unit(&self, booking_id: Uuid) -> BookingResult<Option<Payment>> {
        let mut uow = self.store.begin().await?;
        if uow.get_booking(booking_id).await?.is_none() {
            return Err(BookingError::not_found("Booking", booking_id));
        }
        let payments = uow.list_payments(booking_id).await?;
        Ok(payments.into_iter().find(|p| p.status == PaymentStatus::Pending))
    }

    async fn process_payment_in_unit(
        &self,
        booking_id: Uuid,
        payment_id: Uuid,
        simulate_failure: bool,
    ) -> BookingResult<(Booking, Payment)> {
        let mut uow = self.store.begin().await?;
        let mut booking = lock_booking(uow.as_mut(), booking_id).await?;
        let mut payment = uow
            .get_payment(payment_id)
            .await?
            .filter(|p| p.booking_id == booking.id)
            .ok_or_else(|| BookingError::not_found("Payment", payment_id))?;

        if payment.status != PaymentStatus::Pending {
            return Err(BookingError::PaymentNotPending {
                transaction_id: payment.transaction_id,
                status: payment.status,
            });
        }
        if booking.state != BookingState::PaymentPending {
            return Err(BookingError::InvalidState {
                reference: booking.booking_reference,
                operation: "paid",
                required: BookingState::PaymentPending,
                actual: booking.state,
            });
        }

        let now = self.clock.now();
        let success = !simulate_failure;
        payment.settle(success, now);
        uow.update_payment(&payment).await?;

        let (target, reason) = if success {
            (BookingState::Confirmed, None)
        } else {
            (BookingState::Cancelled, Some("payment failed"))
        };
        BookingStateMachine::transition(uow.as_mut(), &mut booking, target, reason, now).await?;
        uow.commit().await?;

        if !success {
            warn!(
                "Payment {} failed for booking {}",
                payment.transaction_id, booking.booking_reference
            );
        }
        log_transition(&booking, BookingState::PaymentPending);
        Ok((booking, payment))
    }

    async fn cancel_in_unit(&self, booking_id: Uuid, reason: &str) -> BookingResult<Booking> {
        let mut uow = self.store.begin().await?;
        let mut booking = lock_booking(uow.as_mut(), booking_id).await?;

        if booking.state != BookingState::Confirmed {
            return Err(BookingError::InvalidState {
                reference: booking.booking_reference,
                operation: "cancelled",
                required: BookingState::Confirmed,
                actual: booking.state,
            });
        }

        let now = self.clock.now();
        BookingStateMachine::transition(
            uow.as_mut(),
            &mut booking,
            BookingState::Cancelled,
            Some(reason),
            now,
        )
        .await?;
        uow.commit().await?;

        log_transition(&booking, BookingState::Confirmed);
        Ok(booking)
    }

    async fn refund_in_unit(&self, booking_id: Uuid, reason: &str) -> BookingResult<(Booking, Refund)> {
        let mut uow = self.store.begin().await?;
        let mut booking = lock_booking(uow.as_mut(), booking_id).await?;

        // Checked before the state so that repeating a refund names the real cause
        let refunds = uow.list_refunds(booking.id).await?;
        if refunds.iter().any(|r| r.status == RefundStatus::Processed) {
            return Err(BookingError::AlreadyRefunded {
                reference: booking.booking_reference,
            });
        }

        if booking.state != BookingState::Cancelled {
            return Err(BookingError::InvalidState {
                reference: booking.booking_reference,
                operation: "refunded",
                required: BookingState::Cancelled,
                actual: booking.state,
            });
        }

        let mut payment = uow
            .list_payments(booking.id)
            .await?
            .into_iter()
            .find(|p| p.status == PaymentStatus::Success)
            .ok_or_else(|| BookingError::NoSuccessfulPayment {
                reference: booking.booking_reference.clone(),
            })?;

        let now = self.clock.now();
        let mut refund = Refund::new(
            booking.id,
            payment.id,
            references::refund_reference(),
            booking.amount,
            reason.trim().to_string(),
            now,
        );
        uow.insert_refund(&refund).await?;

        refund.mark_processed(now);
        uow.update_refund(&refund).await?;

        payment.mark_refunded(now);
        uow.update_payment(&payment).await?;

        BookingStateMachine::transition(
            uow.as_mut(),
            &mut booking,
            BookingState::Refunded,
            Some(reason),
            now,
        )
        .await?;
        uow.commit().await?;

        info!(
            "Refund {} of {} processed for booking {}",
            refund.refund_reference, refund.amount, booking.booking_reference
        );
        log_transition(&booking, BookingState::Cancelled);
        Ok((booking, refund))
    }

    async fn details_in_unit(&self, reference: &str) -> BookingResult<BookingDetails> {
        let mut uow = self.store.begin().await?;
        let booking = uow
            .find_booking_by_reference(reference)
            .await?
            .ok_or_else(|| BookingError::not_found("Booking", reference))?;

        let history = AuditTrail::history(uow.as_mut(), booking.id).await?;
        let payments = uow.list_payments(booking.id).await?;
        let refunds = uow.list_refunds(booking.id).await?;

        Ok(BookingDetails {
            hold_expires_at: booking.hold_expires_at(self.hold_window),
            booking,
            history,
            payments,
            refunds,
        })
    }
}

/// Read the booking, lock its seat, then read the booking again under the
/// lock. The seat never changes, so the first read only locates the lock.
pub(crate) async fn lock_booking(uow: &mut dyn UnitOfWork, booking_id: Uuid) -> BookingResult<Booking> {
    let seat_id = uow
        .get_booking(booking_id)
        .await?
        .ok_or_else(|| BookingError::not_found("Booking", booking_id))?
        .seat_id;

    uow.lock_seat(seat_id).await?;

    uow.get_booking(booking_id)
        .await?
        .ok_or_else(|| BookingError::not_found("Booking", booking_id))
}

async fn unused_booking_reference(uow: &mut dyn UnitOfWork) -> BookingResult<String> {
    for _ in 0..MAX_REFERENCE_ATTEMPTS {
        let candidate = references::booking_reference();
        if uow.find_booking_by_reference(&candidate).await?.is_none() {
            return Ok(candidate);
        }
        warn!("Booking reference {} already taken, generating another", candidate);
    }
    Err(StoreError::Conflict("no unused booking reference found".into()).into())
}

/// Storage backend failures are logged once per operation. Rejections are
/// ordinary results for the caller and are not logged here.
pub(crate) fn surface<T>(operation: &'static str, result: BookingResult<T>) -> BookingResult<T> {
    if let Err(BookingError::Store(e @ StoreError::Backend(_))) = &result {
        error!("{} failed: {}", operation, e);
    }
    result
}

fn log_transition(booking: &Booking, from: BookingState) {
    info!(
        "Booking {} transitioned from {} to {}",
        booking.booking_reference, from, booking.state
    );
}
