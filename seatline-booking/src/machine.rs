use chrono::{DateTime, Utc};
use seatline_core::{BookingError, BookingResult, UnitOfWork};
use seatline_shared::{Booking, BookingState, BookingStateHistory};
use tracing::debug;

use crate::audit::AuditTrail;

/// Guards and applies booking state changes. Nothing else writes a
/// booking's `state` or its history.
pub struct BookingStateMachine;

impl BookingStateMachine {
    pub fn ensure_transition(booking: &Booking, target: BookingState) -> BookingResult<()> {
        if booking.state.can_transition_to(target) {
            Ok(())
        } else {
            Err(BookingError::IllegalTransition {
                from: booking.state,
                to: target,
            })
        }
    }

    /// Move `booking` to `target` inside `uow`.
    ///
    /// Sets the state, stamps the entry timestamp for `target` if it was
    /// never set, and appends one audit record. Both writes belong to `uow`,
    /// so they commit or roll back together. The booking row is updated
    /// only if it is still in the state `booking` was read in.
    pub async fn transition(
        uow: &mut dyn UnitOfWork,
        booking: &mut Booking,
        target: BookingState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> BookingResult<BookingStateHistory> {
        Self::ensure_transition(booking, target)?;

        let from = booking.state;
        let mut next = booking.clone();
        next.state = target;
        next.updated_at = now;
        if let Some(entered_at) = next.entered_at_mut(target) {
            entered_at.get_or_insert(now);
        }

        uow.update_booking(&next, from).await?;
        let entry = AuditTrail::record(uow, &next, from, target, reason, now).await?;

        debug!("Staged {} transition {} -> {}", next.booking_reference, from, target);
        *booking = next;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seatline_shared::PassengerDetails;
    use uuid::Uuid;

    fn booking_in(state: BookingState) -> Booking {
        let mut booking = Booking::new(
            "BK1234ABCD".into(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            PassengerDetails::new("Alan Turing", "alan@example.com", "+440000"),
            100,
            Utc::now(),
        );
        booking.state = state;
        booking
    }

    #[test]
    fn test_invalid_transition() {
        // Cannot go directly from Initiated to Confirmed
        let booking = booking_in(BookingState::Initiated);
        let err = BookingStateMachine::ensure_transition(&booking, BookingState::Confirmed).unwrap_err();
        assert!(matches!(
            err,
            BookingError::IllegalTransition {
                from: BookingState::Initiated,
                to: BookingState::Confirmed
            }
        ));
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for terminal in [BookingState::Expired, BookingState::Refunded] {
            let booking = booking_in(terminal);
            for target in BookingState::ALL {
                assert!(BookingStateMachine::ensure_transition(&booking, target).is_err());
            }
        }
    }
}
