pub mod audit;
pub mod expiry;
pub mod ledger;
pub mod machine;
pub mod references;
pub mod reservation;

pub use audit::AuditTrail;
pub use expiry::ExpirySweeper;
pub use ledger::SeatLedger;
pub use machine::BookingStateMachine;
pub use reservation::{BookingDetails, ReservationController, DEFAULT_HOLD_WINDOW};
