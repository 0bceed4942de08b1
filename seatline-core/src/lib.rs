pub mod clock;
pub mod repository;

use chrono::{DateTime, Utc};
use seatline_shared::{BookingState, PaymentStatus};
use uuid::Uuid;

pub use clock::{Clock, ManualClock, SystemClock};
pub use repository::{BookingStore, UnitOfWork};

/// Failures raised by the persistence collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique constraint was violated, or a conditional write found the
    /// row changed underneath it.
    #[error("Conflicting write: {0}")]
    Conflict(String),
    #[error("Stored value could not be decoded: {0}")]
    Corrupt(String),
    #[error("Storage backend failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Caller-facing failures of the reservation workflow.
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("Seat {seat_number} is no longer available")]
    SeatUnavailable { seat_id: Uuid, seat_number: String },

    #[error("Cannot transition from {from} to {to}. Allowed transitions: {}", describe_states(.from.allowed_transitions()))]
    IllegalTransition { from: BookingState, to: BookingState },

    #[error("Seat hold for booking {reference} expired at {expired_at}")]
    HoldExpired {
        reference: String,
        expired_at: DateTime<Utc>,
    },

    #[error("Only {required} bookings can be {operation}. Booking {reference} is {actual}")]
    InvalidState {
        reference: String,
        operation: &'static str,
        required: BookingState,
        actual: BookingState,
    },

    #[error("Booking {reference} has already been refunded")]
    AlreadyRefunded { reference: String },

    #[error("No successful payment found for booking {reference}")]
    NoSuccessfulPayment { reference: String },

    #[error("Payment {transaction_id} is {status}, only PENDING payments can be processed")]
    PaymentNotPending {
        transaction_id: String,
        status: PaymentStatus,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BookingError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        BookingError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code for the API layer.
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::SeatUnavailable { .. } => "SEAT_UNAVAILABLE",
            BookingError::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            BookingError::HoldExpired { .. } => "HOLD_EXPIRED",
            BookingError::InvalidState { .. } => "INVALID_STATE",
            BookingError::AlreadyRefunded { .. } => "ALREADY_REFUNDED",
            BookingError::NoSuccessfulPayment { .. } => "NO_SUCCESSFUL_PAYMENT",
            BookingError::PaymentNotPending { .. } => "PAYMENT_NOT_PENDING",
            BookingError::NotFound { .. } => "NOT_FOUND",
            BookingError::Store(StoreError::Conflict(_)) => "CONFLICT",
            BookingError::Store(_) => "STORAGE_FAILURE",
        }
    }
}

pub type BookingResult<T> = Result<T, BookingError>;

fn describe_states(states: &[BookingState]) -> String {
    if states.is_empty() {
        return "none".to_string();
    }
    states
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
