use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::str::FromStr;

use crate::pii::Masked;

/// Booking status in the lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingState {
    Initiated,
    SeatHeld,
    PaymentPending,
    Confirmed,
    Cancelled,
    Expired,
    Refunded,
}

impl BookingState {
    /// States in which the booking keeps its seat away from everyone else.
    pub const SEAT_OCCUPYING: [BookingState; 3] = [
        BookingState::SeatHeld,
        BookingState::PaymentPending,
        BookingState::Confirmed,
    ];

    pub const ALL: [BookingState; 7] = [
        BookingState::Initiated,
        BookingState::SeatHeld,
        BookingState::PaymentPending,
        BookingState::Confirmed,
        BookingState::Cancelled,
        BookingState::Expired,
        BookingState::Refunded,
    ];

    /// The legal transition table.
    pub fn allowed_transitions(self) -> &'static [BookingState] {
        match self {
            BookingState::Initiated => &[BookingState::SeatHeld],
            BookingState::SeatHeld => &[BookingState::PaymentPending, BookingState::Expired],
            BookingState::PaymentPending => &[BookingState::Confirmed, BookingState::Cancelled],
            BookingState::Confirmed => &[BookingState::Cancelled],
            BookingState::Cancelled => &[BookingState::Refunded],
            BookingState::Expired | BookingState::Refunded => &[],
        }
    }

    pub fn can_transition_to(self, target: BookingState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_seat_occupying(self) -> bool {
        Self::SEAT_OCCUPYING.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingState::Initiated => "INITIATED",
            BookingState::SeatHeld => "SEAT_HELD",
            BookingState::PaymentPending => "PAYMENT_PENDING",
            BookingState::Confirmed => "CONFIRMED",
            BookingState::Cancelled => "CANCELLED",
            BookingState::Expired => "EXPIRED",
            BookingState::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for BookingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BookingState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// Returned when a stored status string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status value: {0}")]
pub struct UnknownVariant(pub String);

/// Contact details captured when a booking is created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassengerDetails {
    pub name: String,
    pub email: Masked<String>,
    pub phone: Masked<String>,
}

impl PassengerDetails {
    pub fn new(name: impl Into<String>, email: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: Masked(email.into()),
            phone: Masked(phone.into()),
        }
    }
}

/// A passenger's claim on one seat of one flight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub booking_reference: String,
    pub flight_id: Uuid,
    pub seat_id: Uuid,
    pub passenger: PassengerDetails,
    pub amount: i64,
    pub state: BookingState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub seat_held_at: Option<DateTime<Utc>>,
    pub payment_initiated_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl Booking {
    pub fn new(
        booking_reference: String,
        flight_id: Uuid,
        seat_id: Uuid,
        passenger: PassengerDetails,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_reference,
            flight_id,
            seat_id,
            passenger,
            amount,
            state: BookingState::Initiated,
            created_at: now,
            updated_at: now,
            seat_held_at: None,
            payment_initiated_at: None,
            confirmed_at: None,
            cancelled_at: None,
            expired_at: None,
            refunded_at: None,
        }
    }

    /// The timestamp slot recording entry into `state`. `Initiated` has none.
    pub fn entered_at_mut(&mut self, state: BookingState) -> Option<&mut Option<DateTime<Utc>>> {
        match state {
            BookingState::Initiated => None,
            BookingState::SeatHeld => Some(&mut self.seat_held_at),
            BookingState::PaymentPending => Some(&mut self.payment_initiated_at),
            BookingState::Confirmed => Some(&mut self.confirmed_at),
            BookingState::Cancelled => Some(&mut self.cancelled_at),
            BookingState::Expired => Some(&mut self.expired_at),
            BookingState::Refunded => Some(&mut self.refunded_at),
        }
    }

    pub fn entered_at(&self, state: BookingState) -> Option<DateTime<Utc>> {
        match state {
            BookingState::Initiated => Some(self.created_at),
            BookingState::SeatHeld => self.seat_held_at,
            BookingState::PaymentPending => self.payment_initiated_at,
            BookingState::Confirmed => self.confirmed_at,
            BookingState::Cancelled => self.cancelled_at,
            BookingState::Expired => self.expired_at,
            BookingState::Refunded => self.refunded_at,
        }
    }

    /// When the current seat hold lapses, if the booking is holding a seat.
    pub fn hold_expires_at(&self, window: Duration) -> Option<DateTime<Utc>> {
        match (self.state, self.seat_held_at) {
            (BookingState::SeatHeld, Some(held_at)) => Some(held_at + window),
            _ => None,
        }
    }

    pub fn is_hold_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.hold_expires_at(window)
            .map(|expires_at| now > expires_at)
            .unwrap_or(false)
    }
}

/// Append-only audit record of one state transition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookingStateHistory {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub from_state: BookingState,
    pub to_state: BookingState,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

impl BookingStateHistory {
    pub fn new(
        booking_id: Uuid,
        from_state: BookingState,
        to_state: BookingState,
        notes: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id,
            from_state,
            to_state,
            notes,
            created_at,
        }
    }
}
