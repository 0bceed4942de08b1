pub mod booking;
pub mod flight;
pub mod payment;

pub use booking::{Booking, BookingState, BookingStateHistory, PassengerDetails, UnknownVariant};
pub use flight::{Flight, Seat, SeatClass};
pub use payment::{Payment, PaymentStatus, Refund, RefundStatus};
