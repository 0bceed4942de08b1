use chrono::{DateTime, Utc};
use seatline_core::{StoreResult, UnitOfWork};
use seatline_shared::{Booking, BookingState, BookingStateHistory};
use uuid::Uuid;

/// Append-only record of every state change a booking has gone through.
///
/// Entries are written only by [`crate::machine::BookingStateMachine`], in
/// the same unit of work as the state change they describe.
pub struct AuditTrail;

impl AuditTrail {
    pub(crate) async fn record(
        uow: &mut dyn UnitOfWork,
        booking: &Booking,
        from: BookingState,
        to: BookingState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<BookingStateHistory> {
        let entry = BookingStateHistory::new(booking.id, from, to, transition_note(from, to, reason), now);
        uow.append_history(&entry).await?;
        Ok(entry)
    }

    /// Entries for one booking, oldest first.
    pub async fn history(
        uow: &mut dyn UnitOfWork,
        booking_id: Uuid,
    ) -> StoreResult<Vec<BookingStateHistory>> {
        uow.list_history(booking_id).await
    }

    /// First recorded pair that breaks the transition table or does not
    /// continue from the previous entry's target.
    pub fn first_inconsistency(
        entries: &[BookingStateHistory],
    ) -> Option<(BookingState, BookingState)> {
        let mut current = BookingState::Initiated;
        for entry in entries {
            if entry.from_state != current || !entry.from_state.can_transition_to(entry.to_state) {
                return Some((entry.from_state, entry.to_state));
            }
            current = entry.to_state;
        }
        None
    }
}

pub fn transition_note(from: BookingState, to: BookingState, reason: Option<&str>) -> String {
    match reason.map(str::trim).filter(|r| !r.is_empty()) {
        Some(reason) => format!("Transitioned from {} to {}: {}", from, to, reason),
        None => format!("Transitioned from {} to {}", from, to),
    }
}
