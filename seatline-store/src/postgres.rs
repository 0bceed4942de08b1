use async_trait::async_trait;
use chrono::{DateTime, Utc};
use seatline_core::{BookingStore, StoreError, StoreResult, UnitOfWork};
use seatline_shared::{
    Booking, BookingState, BookingStateHistory, Flight, Masked, PassengerDetails, Payment,
    Refund, Seat,
};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

/// Postgres-backed store. Each unit of work is one database transaction.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookingStore for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

fn db_err(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            let what = db
                .constraint()
                .map(str::to_string)
                .unwrap_or_else(|| db.message().to_string());
            return StoreError::Conflict(what);
        }
    }
    StoreError::Backend(Box::new(err))
}

fn corrupt(err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

fn state_names(states: &[BookingState]) -> Vec<String> {
    states.iter().map(|s| s.as_str().to_string()).collect()
}

// Internal structs for type-safe querying
#[derive(sqlx::FromRow)]
struct FlightRow {
    id: Uuid,
    flight_number: String,
    origin: String,
    destination: String,
    departure_time: DateTime<Utc>,
    arrival_time: DateTime<Utc>,
    total_seats: i32,
    price: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<FlightRow> for Flight {
    fn from(row: FlightRow) -> Self {
        Flight {
            id: row.id,
            flight_number: row.flight_number,
            origin: row.origin,
            destination: row.destination,
            departure_time: row.departure_time,
            arrival_time: row.arrival_time,
            total_seats: row.total_seats,
            price: row.price,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SeatRow {
    id: Uuid,
    flight_id: Uuid,
    seat_number: String,
    seat_class: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<SeatRow> for Seat {
    type Error = StoreError;

    fn try_from(row: SeatRow) -> Result<Self, Self::Error> {
        Ok(Seat {
            id: row.id,
            flight_id: row.flight_id,
            seat_number: row.seat_number,
            seat_class: row.seat_class.parse().map_err(corrupt)?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    booking_reference: String,
    flight_id: Uuid,
    seat_id: Uuid,
    passenger_name: String,
    passenger_email: String,
    passenger_phone: String,
    state: String,
    amount: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    seat_held_at: Option<DateTime<Utc>>,
    payment_initiated_at: Option<DateTime<Utc>>,
    confirmed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    expired_at: Option<DateTime<Utc>>,
    refunded_at: Option<DateTime<Utc>>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = StoreError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: row.id,
            booking_reference: row.booking_reference,
            flight_id: row.flight_id,
            seat_id: row.seat_id,
            passenger: PassengerDetails {
                name: row.passenger_name,
                email: Masked(row.passenger_email),
                phone: Masked(row.passenger_phone),
            },
            amount: row.amount,
            state: row.state.parse().map_err(corrupt)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            seat_held_at: row.seat_held_at,
            payment_initiated_at: row.payment_initiated_at,
            confirmed_at: row.confirmed_at,
            cancelled_at: row.cancelled_at,
            expired_at: row.expired_at,
            refunded_at: row.refunded_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: Uuid,
    booking_id: Uuid,
    from_state: String,
    to_state: String,
    notes: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for BookingStateHistory {
    type Error = StoreError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(BookingStateHistory {
            id: row.id,
            booking_id: row.booking_id,
            from_state: row.from_state.parse().map_err(corrupt)?,
            to_state: row.to_state.parse().map_err(corrupt)?,
            notes: row.notes,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    booking_id: Uuid,
    transaction_id: String,
    amount: i64,
    status: String,
    payment_method: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = StoreError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            booking_id: row.booking_id,
            transaction_id: row.transaction_id,
            amount: row.amount,
            status: row.status.parse().map_err(corrupt)?,
            payment_method: row.payment_method,
            created_at: row.created_at,
            updated_at: row.updated_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RefundRow {
    id: Uuid,
    booking_id: Uuid,
    payment_id: Uuid,
    refund_reference: String,
    amount: i64,
    status: String,
    reason: String,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<RefundRow> for Refund {
    type Error = StoreError;

    fn try_from(row: RefundRow) -> Result<Self, Self::Error> {
        Ok(Refund {
            id: row.id,
            booking_id: row.booking_id,
            payment_id: row.payment_id,
            refund_reference: row.refund_reference,
            amount: row.amount,
            status: row.status.parse().map_err(corrupt)?,
            reason: row.reason,
            created_at: row.created_at,
            processed_at: row.processed_at,
        })
    }
}

const FLIGHT_COLUMNS: &str = "id, flight_number, origin, destination, departure_time, arrival_time, total_seats, price, created_at, updated_at";
const SEAT_COLUMNS: &str = "id, flight_id, seat_number, seat_class, created_at";
const BOOKING_COLUMNS: &str = "id, booking_reference, flight_id, seat_id, passenger_name, passenger_email, passenger_phone, state, amount, created_at, updated_at, seat_held_at, payment_initiated_at, confirmed_at, cancelled_at, expired_at, refunded_at";
const PAYMENT_COLUMNS: &str = "id, booking_id, transaction_id, amount, status, payment_method, created_at, updated_at, processed_at";
const REFUND_COLUMNS: &str = "id, booking_id, payment_id, refund_reference, amount, status, reason, created_at, processed_at";

fn collect<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_seat(&mut self, seat_id: Uuid) -> StoreResult<Option<Seat>> {
        debug!("Locking seat row {}", seat_id);
        let row = sqlx::query_as::<_, SeatRow>(&format!(
            "SELECT {SEAT_COLUMNS} FROM seats WHERE id = $1 FOR UPDATE"
        ))
        .bind(seat_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.map(Seat::try_from).transpose()
    }

    async fn get_flight(&mut self, flight_id: Uuid) -> StoreResult<Option<Flight>> {
        let row = sqlx::query_as::<_, FlightRow>(&format!(
            "SELECT {FLIGHT_COLUMNS} FROM flights WHERE id = $1"
        ))
        .bind(flight_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        Ok(row.map(Flight::from))
    }

    async fn get_seat(&mut self, seat_id: Uuid) -> StoreResult<Option<Seat>> {
        let row = sqlx::query_as::<_, SeatRow>(&format!(
            "SELECT {SEAT_COLUMNS} FROM seats WHERE id = $1"
        ))
        .bind(seat_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.map(Seat::try_from).transpose()
    }

    async fn list_seats(&mut self, flight_id: Uuid) -> StoreResult<Vec<Seat>> {
        let rows = sqlx::query_as::<_, SeatRow>(&format!(
            "SELECT {SEAT_COLUMNS} FROM seats WHERE flight_id = $1 ORDER BY seat_number"
        ))
        .bind(flight_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;

        collect(rows)
    }

    async fn insert_flight(&mut self, flight: &Flight) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO flights (id, flight_number, origin, destination, departure_time, arrival_time, total_seats, price, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(flight.id)
        .bind(&flight.flight_number)
        .bind(&flight.origin)
        .bind(&flight.destination)
        .bind(flight.departure_time)
        .bind(flight.arrival_time)
        .bind(flight.total_seats)
        .bind(flight.price)
        .bind(flight.created_at)
        .bind(flight.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_seat(&mut self, seat: &Seat) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO seats (id, flight_id, seat_number, seat_class, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(seat.id)
        .bind(seat.flight_id)
        .bind(&seat.seat_number)
        .bind(seat.seat_class.as_str())
        .bind(seat.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_booking(&mut self, booking_id: Uuid) -> StoreResult<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"
        ))
        .bind(booking_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.map(Booking::try_from).transpose()
    }

    async fn find_booking_by_reference(&mut self, reference: &str) -> StoreResult<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE booking_reference = $1"
        ))
        .bind(reference)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.map(Booking::try_from).transpose()
    }

    async fn bookings_for_seat(
        &mut self,
        seat_id: Uuid,
        states: &[BookingState],
    ) -> StoreResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE seat_id = $1 AND state = ANY($2) ORDER BY created_at"
        ))
        .bind(seat_id)
        .bind(state_names(states))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;

        collect(rows)
    }

    async fn bookings_for_flight(
        &mut self,
        flight_id: Uuid,
        states: &[BookingState],
    ) -> StoreResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE flight_id = $1 AND state = ANY($2) ORDER BY created_at"
        ))
        .bind(flight_id)
        .bind(state_names(states))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;

        collect(rows)
    }

    async fn held_since(&mut self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE state = $1 AND seat_held_at <= $2 ORDER BY seat_held_at"
        ))
        .bind(BookingState::SeatHeld.as_str())
        .bind(cutoff)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;

        collect(rows)
    }

    async fn insert_booking(&mut self, booking: &Booking) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bookings (id, booking_reference, flight_id, seat_id, passenger_name, passenger_email, passenger_phone, state, amount, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(booking.id)
        .bind(&booking.booking_reference)
        .bind(booking.flight_id)
        .bind(booking.seat_id)
        .bind(&booking.passenger.name)
        .bind(booking.passenger.email.expose())
        .bind(booking.passenger.phone.expose())
        .bind(booking.state.as_str())
        .bind(booking.amount)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_booking(
        &mut self,
        booking: &Booking,
        expected_state: BookingState,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE bookings
            SET state = $2, updated_at = $3, seat_held_at = $4, payment_initiated_at = $5,
                confirmed_at = $6, cancelled_at = $7, expired_at = $8, refunded_at = $9
            WHERE id = $1 AND state = $10
            "#,
        )
        .bind(booking.id)
        .bind(booking.state.as_str())
        .bind(booking.updated_at)
        .bind(booking.seat_held_at)
        .bind(booking.payment_initiated_at)
        .bind(booking.confirmed_at)
        .bind(booking.cancelled_at)
        .bind(booking.expired_at)
        .bind(booking.refunded_at)
        .bind(expected_state.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "booking {} is no longer {}",
                booking.booking_reference, expected_state
            )));
        }
        Ok(())
    }

    async fn append_history(&mut self, entry: &BookingStateHistory) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO booking_state_history (id, booking_id, from_state, to_state, notes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(entry.booking_id)
        .bind(entry.from_state.as_str())
        .bind(entry.to_state.as_str())
        .bind(&entry.notes)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_history(&mut self, booking_id: Uuid) -> StoreResult<Vec<BookingStateHistory>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            "SELECT id, booking_id, from_state, to_state, notes, created_at FROM booking_state_history WHERE booking_id = $1 ORDER BY seq",
        )
        .bind(booking_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;

        collect(rows)
    }

    async fn insert_payment(&mut self, payment: &Payment) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments (id, booking_id, transaction_id, amount, status, payment_method, created_at, updated_at, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(payment.id)
        .bind(payment.booking_id)
        .bind(&payment.transaction_id)
        .bind(payment.amount)
        .bind(payment.status.as_str())
        .bind(&payment.payment_method)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .bind(payment.processed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_payment(&mut self, payment: &Payment) -> StoreResult<()> {
        sqlx::query(
            "UPDATE payments SET status = $2, updated_at = $3, processed_at = $4 WHERE id = $1",
        )
        .bind(payment.id)
        .bind(payment.status.as_str())
        .bind(payment.updated_at)
        .bind(payment.processed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_payment(&mut self, payment_id: Uuid) -> StoreResult<Option<Payment>> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.map(Payment::try_from).transpose()
    }

    async fn list_payments(&mut self, booking_id: Uuid) -> StoreResult<Vec<Payment>> {
        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE booking_id = $1 ORDER BY seq"
        ))
        .bind(booking_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;

        collect(rows)
    }

    async fn insert_refund(&mut self, refund: &Refund) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO refunds (id, booking_id, payment_id, refund_reference, amount, status, reason, created_at, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(refund.id)
        .bind(refund.booking_id)
        .bind(refund.payment_id)
        .bind(&refund.refund_reference)
        .bind(refund.amount)
        .bind(refund.status.as_str())
        .bind(&refund.reason)
        .bind(refund.created_at)
        .bind(refund.processed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_refund(&mut self, refund: &Refund) -> StoreResult<()> {
        sqlx::query("UPDATE refunds SET status = $2, processed_at = $3 WHERE id = $1")
            .bind(refund.id)
            .bind(refund.status.as_str())
            .bind(refund.processed_at)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_refunds(&mut self, booking_id: Uuid) -> StoreResult<Vec<Refund>> {
        let rows = sqlx::query_as::<_, RefundRow>(&format!(
            "SELECT {REFUND_COLUMNS} FROM refunds WHERE booking_id = $1 ORDER BY seq"
        ))
        .bind(booking_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;

        collect(rows)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        this.tx.commit().await.map_err(db_err)
    }
}
