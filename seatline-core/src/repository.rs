use async_trait::async_trait;
use chrono::{DateTime, Utc};
use seatline_shared::{
    Booking, BookingState, BookingStateHistory, Flight, Payment, Refund, Seat,
};
use uuid::Uuid;

use crate::StoreResult;

/// Entry point to durable storage. Every read and write happens inside a
/// [`UnitOfWork`] obtained from [`BookingStore::begin`].
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>>;
}

/// One atomic unit. Dropping it without calling [`UnitOfWork::commit`]
/// rolls back every write it staged and releases every lock it took.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Take the exclusive lock on a seat row, blocking until any other
    /// holder finishes. The lock lives until the unit ends.
    async fn lock_seat(&mut self, seat_id: Uuid) -> StoreResult<Option<Seat>>;

    async fn get_flight(&mut self, flight_id: Uuid) -> StoreResult<Option<Flight>>;

    async fn get_seat(&mut self, seat_id: Uuid) -> StoreResult<Option<Seat>>;

    async fn list_seats(&mut self, flight_id: Uuid) -> StoreResult<Vec<Seat>>;

    async fn insert_flight(&mut self, flight: &Flight) -> StoreResult<()>;

    async fn insert_seat(&mut self, seat: &Seat) -> StoreResult<()>;

    async fn get_booking(&mut self, booking_id: Uuid) -> StoreResult<Option<Booking>>;

    async fn find_booking_by_reference(&mut self, reference: &str) -> StoreResult<Option<Booking>>;

    async fn bookings_for_seat(
        &mut self,
        seat_id: Uuid,
        states: &[BookingState],
    ) -> StoreResult<Vec<Booking>>;

    async fn bookings_for_flight(
        &mut self,
        flight_id: Uuid,
        states: &[BookingState],
    ) -> StoreResult<Vec<Booking>>;

    /// SEAT_HELD bookings whose hold began at or before `cutoff`.
    async fn held_since(&mut self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Booking>>;

    async fn insert_booking(&mut self, booking: &Booking) -> StoreResult<()>;

    /// Conditional write: fails with `StoreError::Conflict` unless the stored
    /// booking is still in `expected_state`.
    async fn update_booking(
        &mut self,
        booking: &Booking,
        expected_state: BookingState,
    ) -> StoreResult<()>;

    async fn append_history(&mut self, entry: &BookingStateHistory) -> StoreResult<()>;

    /// History of one booking in the order it was written.
    async fn list_history(&mut self, booking_id: Uuid) -> StoreResult<Vec<BookingStateHistory>>;

    async fn insert_payment(&mut self, payment: &Payment) -> StoreResult<()>;

    async fn update_payment(&mut self, payment: &Payment) -> StoreResult<()>;

    async fn get_payment(&mut self, payment_id: Uuid) -> StoreResult<Option<Payment>>;

    async fn list_payments(&mut self, booking_id: Uuid) -> StoreResult<Vec<Payment>>;

    async fn insert_refund(&mut self, refund: &Refund) -> StoreResult<()>;

    async fn update_refund(&mut self, refund: &Refund) -> StoreResult<()>;

    async fn list_refunds(&mut self, booking_id: Uuid) -> StoreResult<Vec<Refund>>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}
