use seatline_core::{BookingError, BookingResult, BookingStore, StoreResult, UnitOfWork};
use seatline_shared::{BookingState, Seat};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Read-only availability projections.
///
/// Nothing here is cached or counted incrementally: every answer is derived
/// from the bookings currently in a seat-occupying state.
#[derive(Clone)]
pub struct SeatLedger {
    store: Arc<dyn BookingStore>,
}

impl SeatLedger {
    pub fn new(store: Arc<dyn BookingStore>) -> Self {
        Self { store }
    }

    pub async fn is_available(&self, seat_id: Uuid) -> BookingResult<bool> {
        let mut uow = self.store.begin().await?;
        if uow.get_seat(seat_id).await?.is_none() {
            return Err(BookingError::not_found("Seat", seat_id));
        }
        Ok(Self::seat_is_free(uow.as_mut(), seat_id).await?)
    }

    pub async fn available_seats(&self, flight_id: Uuid) -> BookingResult<Vec<Seat>> {
        let mut uow = self.store.begin().await?;
        if uow.get_flight(flight_id).await?.is_none() {
            return Err(BookingError::not_found("Flight", flight_id));
        }
        Ok(Self::free_seats(uow.as_mut(), flight_id).await?)
    }

    /// Flight capacity minus the flight's seat-occupying bookings.
    pub async fn available_seat_count(&self, flight_id: Uuid) -> BookingResult<i64> {
        let mut uow = self.store.begin().await?;
        let flight = uow
            .get_flight(flight_id)
            .await?
            .ok_or_else(|| BookingError::not_found("Flight", flight_id))?;

        let occupied = uow
            .bookings_for_flight(flight_id, &BookingState::SEAT_OCCUPYING)
            .await?
            .len() as i64;
        Ok(i64::from(flight.total_seats) - occupied)
    }

    pub(crate) async fn seat_is_free(uow: &mut dyn UnitOfWork, seat_id: Uuid) -> StoreResult<bool> {
        let occupants = uow
            .bookings_for_seat(seat_id, &BookingState::SEAT_OCCUPYING)
            .await?;
        Ok(occupants.is_empty())
    }

    pub(crate) async fn free_seats(uow: &mut dyn UnitOfWork, flight_id: Uuid) -> StoreResult<Vec<Seat>> {
        let occupied: HashSet<Uuid> = uow
            .bookings_for_flight(flight_id, &BookingState::SEAT_OCCUPYING)
            .await?
            .into_iter()
            .map(|b| b.seat_id)
            .collect();

        let seats = uow.list_seats(flight_id).await?;
        Ok(seats.into_iter().filter(|s| !occupied.contains(&s.id)).collect())
    }
}
