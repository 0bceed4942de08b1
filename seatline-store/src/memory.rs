use async_trait::async_trait;
use chrono::{DateTime, Utc};
use seatline_core::{BookingStore, StoreError, StoreResult, UnitOfWork};
use seatline_shared::{
    Booking, BookingState, BookingStateHistory, Flight, Payment, Refund, RefundStatus, Seat,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;
use uuid::Uuid;

/// In-process store with the same transactional contract as Postgres.
///
/// Seat row locks are per-seat async mutexes held by the unit of work until
/// it ends. Writes are staged inside the unit and applied in one step on
/// commit, after the same uniqueness checks the schema enforces.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    seat_locks: Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
}

#[derive(Default)]
struct Tables {
    flights: HashMap<Uuid, Flight>,
    seats: HashMap<Uuid, Seat>,
    bookings: HashMap<Uuid, Booking>,
    history: Vec<BookingStateHistory>,
    payments: Vec<Payment>,
    refunds: Vec<Refund>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn seat_lock(&self, seat_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.seat_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(seat_id).or_default().clone()
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        Ok(Box::new(MemoryUnitOfWork {
            store: self.clone(),
            staged: Staged::default(),
            seat_guards: HashMap::new(),
        }))
    }
}

#[derive(Default)]
struct Staged {
    flights: HashMap<Uuid, Flight>,
    seats: HashMap<Uuid, Seat>,
    bookings: HashMap<Uuid, Booking>,
    /// State each committed booking must still be in when this unit commits.
    expectations: HashMap<Uuid, BookingState>,
    history: Vec<BookingStateHistory>,
    payments: Vec<Payment>,
    refunds: Vec<Refund>,
}

pub struct MemoryUnitOfWork {
    store: MemoryStore,
    staged: Staged,
    seat_guards: HashMap<Uuid, OwnedMutexGuard<()>>,
}

/// Committed rows overlaid with this unit's staged rows, keeping
/// committed order and appending rows that are new in this unit.
fn overlay<T, F>(committed: &[T], staged: &[T], id: F, keep: impl Fn(&T) -> bool) -> Vec<T>
where
    T: Clone,
    F: Fn(&T) -> Uuid,
{
    let committed_ids: HashSet<Uuid> = committed.iter().map(&id).collect();
    let staged_by_id: HashMap<Uuid, &T> = staged.iter().map(|row| (id(row), row)).collect();

    committed
        .iter()
        .map(|row| staged_by_id.get(&id(row)).copied().unwrap_or(row))
        .chain(staged.iter().filter(|row| !committed_ids.contains(&id(row))))
        .filter(|row| keep(*row))
        .cloned()
        .collect()
}

fn upsert<T, F>(rows: &mut Vec<T>, row: T, id: F)
where
    F: Fn(&T) -> Uuid,
{
    let key = id(&row);
    match rows.iter_mut().find(|existing| id(existing) == key) {
        Some(existing) => *existing = row,
        None => rows.push(row),
    }
}

impl MemoryUnitOfWork {
    fn merged_bookings(&self, keep: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let tables = self.store.tables();
        let mut rows: Vec<Booking> = tables
            .bookings
            .values()
            .filter(|b| !self.staged.bookings.contains_key(&b.id))
            .chain(self.staged.bookings.values())
            .filter(|b| keep(*b))
            .cloned()
            .collect();
        rows.sort_by_key(|b| b.created_at);
        rows
    }

    /// Mirrors the schema's unique constraints and the conditional booking
    /// updates. Runs with the tables locked, right before applying.
    fn check_commit(&self, tables: &Tables) -> StoreResult<()> {
        for (booking_id, expected) in &self.staged.expectations {
            let current = tables.bookings.get(booking_id).map(|b| b.state);
            if current != Some(*expected) {
                return Err(StoreError::Conflict(format!(
                    "booking {} is no longer {}",
                    booking_id, expected
                )));
            }
        }

        for flight in self.staged.flights.values() {
            if tables
                .flights
                .values()
                .any(|f| f.id != flight.id && f.flight_number == flight.flight_number)
            {
                return Err(StoreError::Conflict("flights_flight_number_key".into()));
            }
        }

        for seat in self.staged.seats.values() {
            let clash = tables
                .seats
                .values()
                .chain(self.staged.seats.values())
                .any(|s| s.id != seat.id && s.flight_id == seat.flight_id && s.seat_number == seat.seat_number);
            if clash {
                return Err(StoreError::Conflict("seats_flight_seat_number_key".into()));
            }
        }

        for booking in self.staged.bookings.values() {
            let others = tables
                .bookings
                .values()
                .filter(|b| !self.staged.bookings.contains_key(&b.id))
                .chain(self.staged.bookings.values())
                .filter(|b| b.id != booking.id);

            for other in others {
                if other.booking_reference == booking.booking_reference {
                    return Err(StoreError::Conflict("bookings_booking_reference_key".into()));
                }
                if booking.state.is_seat_occupying()
                    && other.state.is_seat_occupying()
                    && other.seat_id == booking.seat_id
                {
                    return Err(StoreError::Conflict("bookings_one_occupant_per_seat".into()));
                }
            }
        }

        for payment in &self.staged.payments {
            if tables
                .payments
                .iter()
                .chain(self.staged.payments.iter())
                .any(|p| p.id != payment.id && p.transaction_id == payment.transaction_id)
            {
                return Err(StoreError::Conflict("payments_transaction_id_key".into()));
            }
        }

        for refund in &self.staged.refunds {
            let mut others = tables
                .refunds
                .iter()
                .filter(|r| !self.staged.refunds.iter().any(|s| s.id == r.id))
                .chain(self.staged.refunds.iter())
                .filter(|r| r.id != refund.id);

            if others.any(|r| {
                r.refund_reference == refund.refund_reference
                    || (r.booking_id == refund.booking_id
                        && r.status == RefundStatus::Processed
                        && refund.status == RefundStatus::Processed)
            }) {
                return Err(StoreError::Conflict("refunds_unique".into()));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_seat(&mut self, seat_id: Uuid) -> StoreResult<Option<Seat>> {
        if !self.seat_guards.contains_key(&seat_id) {
            debug!("Locking seat row {}", seat_id);
            let guard = self.store.seat_lock(seat_id).lock_owned().await;
            self.seat_guards.insert(seat_id, guard);
        }
        self.get_seat(seat_id).await
    }

    async fn get_flight(&mut self, flight_id: Uuid) -> StoreResult<Option<Flight>> {
        if let Some(flight) = self.staged.flights.get(&flight_id) {
            return Ok(Some(flight.clone()));
        }
        Ok(self.store.tables().flights.get(&flight_id).cloned())
    }

    async fn get_seat(&mut self, seat_id: Uuid) -> StoreResult<Option<Seat>> {
        if let Some(seat) = self.staged.seats.get(&seat_id) {
            return Ok(Some(seat.clone()));
        }
        Ok(self.store.tables().seats.get(&seat_id).cloned())
    }

    async fn list_seats(&mut self, flight_id: Uuid) -> StoreResult<Vec<Seat>> {
        let mut seats: Vec<Seat> = {
            let tables = self.store.tables();
            tables
                .seats
                .values()
                .chain(self.staged.seats.values())
                .filter(|s| s.flight_id == flight_id)
                .cloned()
                .collect()
        };
        seats.sort_by(|a, b| a.seat_number.cmp(&b.seat_number));
        Ok(seats)
    }

    async fn insert_flight(&mut self, flight: &Flight) -> StoreResult<()> {
        self.staged.flights.insert(flight.id, flight.clone());
        Ok(())
    }

    async fn insert_seat(&mut self, seat: &Seat) -> StoreResult<()> {
        self.staged.seats.insert(seat.id, seat.clone());
        Ok(())
    }

    async fn get_booking(&mut self, booking_id: Uuid) -> StoreResult<Option<Booking>> {
        if let Some(booking) = self.staged.bookings.get(&booking_id) {
            return Ok(Some(booking.clone()));
        }
        Ok(self.store.tables().bookings.get(&booking_id).cloned())
    }

    async fn find_booking_by_reference(&mut self, reference: &str) -> StoreResult<Option<Booking>> {
        Ok(self
            .merged_bookings(|b| b.booking_reference == reference)
            .into_iter()
            .next())
    }

    async fn bookings_for_seat(
        &mut self,
        seat_id: Uuid,
        states: &[BookingState],
    ) -> StoreResult<Vec<Booking>> {
        Ok(self.merged_bookings(|b| b.seat_id == seat_id && states.contains(&b.state)))
    }

    async fn bookings_for_flight(
        &mut self,
        flight_id: Uuid,
        states: &[BookingState],
    ) -> StoreResult<Vec<Booking>> {
        Ok(self.merged_bookings(|b| b.flight_id == flight_id && states.contains(&b.state)))
    }

    async fn held_since(&mut self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Booking>> {
        let mut held = self.merged_bookings(|b| {
            b.state == BookingState::SeatHeld && b.seat_held_at.is_some_and(|at| at <= cutoff)
        });
        held.sort_by_key(|b| b.seat_held_at);
        Ok(held)
    }

    async fn insert_booking(&mut self, booking: &Booking) -> StoreResult<()> {
        self.staged.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn update_booking(
        &mut self,
        booking: &Booking,
        expected_state: BookingState,
    ) -> StoreResult<()> {
        let current = self.get_booking(booking.id).await?;
        match current {
            Some(current) if current.state == expected_state => {}
            _ => {
                return Err(StoreError::Conflict(format!(
                    "booking {} is no longer {}",
                    booking.booking_reference, expected_state
                )))
            }
        }

        let committed = self.store.tables().bookings.contains_key(&booking.id);
        if committed {
            // The first expectation is the one checked against committed data
            self.staged.expectations.entry(booking.id).or_insert(expected_state);
        }
        self.staged.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn append_history(&mut self, entry: &BookingStateHistory) -> StoreResult<()> {
        self.staged.history.push(entry.clone());
        Ok(())
    }

    async fn list_history(&mut self, booking_id: Uuid) -> StoreResult<Vec<BookingStateHistory>> {
        let tables = self.store.tables();
        Ok(tables
            .history
            .iter()
            .chain(self.staged.history.iter())
            .filter(|h| h.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn insert_payment(&mut self, payment: &Payment) -> StoreResult<()> {
        self.staged.payments.push(payment.clone());
        Ok(())
    }

    async fn update_payment(&mut self, payment: &Payment) -> StoreResult<()> {
        upsert(&mut self.staged.payments, payment.clone(), |p| p.id);
        Ok(())
    }

    async fn get_payment(&mut self, payment_id: Uuid) -> StoreResult<Option<Payment>> {
        if let Some(payment) = self.staged.payments.iter().find(|p| p.id == payment_id) {
            return Ok(Some(payment.clone()));
        }
        Ok(self
            .store
            .tables()
            .payments
            .iter()
            .find(|p| p.id == payment_id)
            .cloned())
    }

    async fn list_payments(&mut self, booking_id: Uuid) -> StoreResult<Vec<Payment>> {
        let tables = self.store.tables();
        Ok(overlay(&tables.payments, &self.staged.payments, |p| p.id, |p| {
            p.booking_id == booking_id
        }))
    }

    async fn insert_refund(&mut self, refund: &Refund) -> StoreResult<()> {
        self.staged.refunds.push(refund.clone());
        Ok(())
    }

    async fn update_refund(&mut self, refund: &Refund) -> StoreResult<()> {
        upsert(&mut self.staged.refunds, refund.clone(), |r| r.id);
        Ok(())
    }

    async fn list_refunds(&mut self, booking_id: Uuid) -> StoreResult<Vec<Refund>> {
        let tables = self.store.tables();
        Ok(overlay(&tables.refunds, &self.staged.refunds, |r| r.id, |r| {
            r.booking_id == booking_id
        }))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        {
            let mut tables = this.store.tables();
            this.check_commit(&tables)?;

            let staged = this.staged;
            tables.flights.extend(staged.flights);
            tables.seats.extend(staged.seats);
            tables.bookings.extend(staged.bookings);
            tables.history.extend(staged.history);
            for payment in staged.payments {
                upsert(&mut tables.payments, payment, |p| p.id);
            }
            for refund in staged.refunds {
                upsert(&mut tables.refunds, refund, |r| r.id);
            }
        }
        // Seat locks release here, after the writes are visible
        drop(this.seat_guards);
        Ok(())
    }
}
