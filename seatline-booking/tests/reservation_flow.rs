use chrono::{Duration, TimeZone, Utc};
use futures_util::future::join_all;
use seatline_booking::{AuditTrail, ExpirySweeper, ReservationController, DEFAULT_HOLD_WINDOW};
use seatline_core::{BookingError, BookingStore, Clock, ManualClock};
use seatline_shared::{
    Booking, BookingState, Flight, PassengerDetails, PaymentStatus, RefundStatus, Seat, SeatClass,
};
use seatline_store::MemoryStore;
use std::sync::Arc;
use uuid::Uuid;

struct Harness {
    store: Arc<dyn BookingStore>,
    clock: Arc<ManualClock>,
    controller: ReservationController,
    sweeper: ExpirySweeper,
}

fn harness() -> Harness {
    let store: Arc<dyn BookingStore> = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()));
    let controller = ReservationController::new(store.clone()).with_clock(clock.clone());
    let sweeper = ExpirySweeper::new(store.clone()).with_clock(clock.clone());
    Harness {
        store,
        clock,
        controller,
        sweeper,
    }
}

async fn flight_with_seats(
    store: &Arc<dyn BookingStore>,
    number: &str,
    seats: usize,
    price: i64,
) -> (Flight, Vec<Seat>) {
    let departure = Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap();
    let flight = Flight::new(
        number,
        "LHR",
        "JFK",
        departure,
        departure + Duration::hours(8),
        seats as i32,
        price,
    );
    let seats: Vec<Seat> = (0..seats)
        .map(|i| Seat::new(flight.id, format!("{}A", i + 1), SeatClass::Economy))
        .collect();

    let mut uow = store.begin().await.unwrap();
    uow.insert_flight(&flight).await.unwrap();
    for seat in &seats {
        uow.insert_seat(seat).await.unwrap();
    }
    uow.commit().await.unwrap();

    (flight, seats)
}

fn passenger(n: usize) -> PassengerDetails {
    PassengerDetails::new(
        format!("Passenger {}", n),
        format!("passenger{}@example.com", n),
        "+15550100",
    )
}

#[tokio::test]
async fn test_full_booking_lifecycle() {
    let h = harness();
    let (flight, seats) = flight_with_seats(&h.store, "SL204", 1, 100).await;
    let start = h.clock.now();

    let booking = h
        .controller
        .create_booking(flight.id, seats[0].id, passenger(1))
        .await
        .unwrap();
    assert_eq!(booking.state, BookingState::Initiated);
    assert_eq!(booking.amount, 100);
    assert!(booking.booking_reference.starts_with("BK"));
    assert_eq!(booking.booking_reference.len(), 10);

    let held = h.controller.hold_seat(booking.id).await.unwrap();
    assert_eq!(held.state, BookingState::SeatHeld);
    assert_eq!(held.seat_held_at, Some(start));
    assert!(!h.controller.ledger().is_available(seats[0].id).await.unwrap());

    h.clock.advance(Duration::minutes(2));
    let (pending, payment) = h.controller.initiate_payment(booking.id, "CARD").await.unwrap();
    assert_eq!(pending.state, BookingState::PaymentPending);
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.amount, 100);
    assert!(payment.transaction_id.starts_with("TXN"));
    assert_eq!(
        h.controller.pending_payment(booking.id).await.unwrap().map(|p| p.id),
        Some(payment.id)
    );

    let (confirmed, settled) = h
        .controller
        .process_payment(booking.id, payment.id, false)
        .await
        .unwrap();
    assert_eq!(confirmed.state, BookingState::Confirmed);
    assert_eq!(settled.status, PaymentStatus::Success);
    assert!(confirmed.confirmed_at.is_some());
    assert_eq!(confirmed.seat_held_at, Some(start));
    assert!(h.controller.pending_payment(booking.id).await.unwrap().is_none());

    let cancelled = h
        .controller
        .cancel_booking(booking.id, "change of plans")
        .await
        .unwrap();
    assert_eq!(cancelled.state, BookingState::Cancelled);
    assert!(h.controller.ledger().is_available(seats[0].id).await.unwrap());

    let (refunded, refund) = h
        .controller
        .process_refund(booking.id, "customer request")
        .await
        .unwrap();
    assert_eq!(refunded.state, BookingState::Refunded);
    assert_eq!(refund.amount, 100);
    assert_eq!(refund.status, RefundStatus::Processed);
    assert!(refund.refund_reference.starts_with("REF"));

    let again = h.controller.process_refund(booking.id, "customer request").await;
    assert!(matches!(again, Err(BookingError::AlreadyRefunded { .. })));

    let details = h
        .controller
        .booking_details(&booking.booking_reference)
        .await
        .unwrap();
    assert_eq!(details.booking.state, BookingState::Refunded);
    assert_eq!(details.payments.len(), 1);
    assert_eq!(details.payments[0].status, PaymentStatus::Refunded);
    assert_eq!(details.refunds.len(), 1);
    assert_eq!(details.hold_expires_at, None);

    let walk: Vec<(BookingState, BookingState)> = details
        .history
        .iter()
        .map(|e| (e.from_state, e.to_state))
        .collect();
    assert_eq!(
        walk,
        vec![
            (BookingState::Initiated, BookingState::SeatHeld),
            (BookingState::SeatHeld, BookingState::PaymentPending),
            (BookingState::PaymentPending, BookingState::Confirmed),
            (BookingState::Confirmed, BookingState::Cancelled),
            (BookingState::Cancelled, BookingState::Refunded),
        ]
    );
    assert_eq!(AuditTrail::first_inconsistency(&details.history), None);
    assert_eq!(
        details.history[3].notes,
        "Transitioned from CONFIRMED to CANCELLED: change of plans"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_for_one_seat() {
    let h = harness();
    let (flight, seats) = flight_with_seats(&h.store, "SL204", 1, 100).await;
    let seat_id = seats[0].id;

    let attempts = (0..8).map(|n| {
        let controller = h.controller.clone();
        let flight_id = flight.id;
        tokio::spawn(async move { controller.reserve_seat(flight_id, seat_id, passenger(n)).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    let unavailable = results
        .iter()
        .filter(|r| matches!(r, Err(BookingError::SeatUnavailable { .. })))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(unavailable, 7);

    let mut uow = h.store.begin().await.unwrap();
    let occupants = uow
        .bookings_for_seat(seat_id, &BookingState::SEAT_OCCUPYING)
        .await
        .unwrap();
    assert_eq!(occupants.len(), 1);
}

#[tokio::test]
async fn test_second_booking_for_held_seat_is_rejected() {
    let h = harness();
    let (flight, seats) = flight_with_seats(&h.store, "SL204", 1, 100).await;

    h.controller
        .reserve_seat(flight.id, seats[0].id, passenger(1))
        .await
        .unwrap();

    let err = h
        .controller
        .create_booking(flight.id, seats[0].id, passenger(2))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::SeatUnavailable { .. }));
    assert_eq!(err.code(), "SEAT_UNAVAILABLE");
}

#[tokio::test]
async fn test_stale_hold_expires_on_payment_attempt() {
    let h = harness();
    let (flight, seats) = flight_with_seats(&h.store, "SL204", 1, 100).await;

    let held = h
        .controller
        .reserve_seat(flight.id, seats[0].id, passenger(1))
        .await
        .unwrap();
    h.clock.advance(DEFAULT_HOLD_WINDOW + Duration::seconds(1));

    let err = h.controller.initiate_payment(held.id, "CARD").await.unwrap_err();
    match err {
        BookingError::HoldExpired { reference, expired_at } => {
            assert_eq!(reference, held.booking_reference);
            assert_eq!(Some(expired_at), held.hold_expires_at(DEFAULT_HOLD_WINDOW));
        }
        other => panic!("expected HoldExpired, got {other:?}"),
    }

    let details = h
        .controller
        .booking_details(&held.booking_reference)
        .await
        .unwrap();
    assert_eq!(details.booking.state, BookingState::Expired);
    assert!(details.booking.expired_at.is_some());
    assert!(details.payments.is_empty());
    assert!(h.controller.ledger().is_available(seats[0].id).await.unwrap());

    // The seat can be booked again once the hold lapsed
    h.controller
        .reserve_seat(flight.id, seats[0].id, passenger(2))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_hold_is_still_valid_at_the_window_boundary() {
    let h = harness();
    let (flight, seats) = flight_with_seats(&h.store, "SL204", 1, 100).await;

    let held = h
        .controller
        .reserve_seat(flight.id, seats[0].id, passenger(1))
        .await
        .unwrap();
    h.clock.advance(DEFAULT_HOLD_WINDOW);

    assert_eq!(h.sweeper.sweep().await.unwrap(), 0);
    let (pending, _) = h.controller.initiate_payment(held.id, "CARD").await.unwrap();
    assert_eq!(pending.state, BookingState::PaymentPending);
}

#[tokio::test]
async fn test_sweep_expires_stale_holds_once() {
    let h = harness();
    let (flight, seats) = flight_with_seats(&h.store, "SL204", 3, 100).await;

    let stale_a = h
        .controller
        .reserve_seat(flight.id, seats[0].id, passenger(1))
        .await
        .unwrap();
    let stale_b = h
        .controller
        .reserve_seat(flight.id, seats[1].id, passenger(2))
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(5));
    let fresh = h
        .controller
        .reserve_seat(flight.id, seats[2].id, passenger(3))
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(6));
    assert_eq!(h.sweeper.sweep().await.unwrap(), 2);
    assert_eq!(h.sweeper.sweep().await.unwrap(), 0);

    for stale in [&stale_a, &stale_b] {
        let details = h
            .controller
            .booking_details(&stale.booking_reference)
            .await
            .unwrap();
        assert_eq!(details.booking.state, BookingState::Expired);
        assert_eq!(details.history.len(), 2);
        assert_eq!(AuditTrail::first_inconsistency(&details.history), None);
    }

    let fresh = h
        .controller
        .booking_details(&fresh.booking_reference)
        .await
        .unwrap();
    assert_eq!(fresh.booking.state, BookingState::SeatHeld);
    assert!(fresh.hold_expires_at.is_some());
    assert_eq!(h.controller.ledger().available_seat_count(flight.id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_sweep_skips_bookings_that_moved_on() {
    let h = harness();
    let (flight, seats) = flight_with_seats(&h.store, "SL204", 1, 100).await;

    let held = h
        .controller
        .reserve_seat(flight.id, seats[0].id, passenger(1))
        .await
        .unwrap();
    let (_, payment) = h.controller.initiate_payment(held.id, "CARD").await.unwrap();
    h.controller
        .process_payment(held.id, payment.id, false)
        .await
        .unwrap();

    h.clock.advance(Duration::hours(1));
    assert_eq!(h.sweeper.sweep().await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_payment_cancels_and_blocks_refund() {
    let h = harness();
    let (flight, seats) = flight_with_seats(&h.store, "SL204", 1, 100).await;

    let held = h
        .controller
        .reserve_seat(flight.id, seats[0].id, passenger(1))
        .await
        .unwrap();
    let (_, payment) = h.controller.initiate_payment(held.id, "CARD").await.unwrap();

    let (cancelled, failed) = h
        .controller
        .process_payment(held.id, payment.id, true)
        .await
        .unwrap();
    assert_eq!(cancelled.state, BookingState::Cancelled);
    assert_eq!(failed.status, PaymentStatus::Failed);
    assert!(failed.processed_at.is_some());

    let err = h
        .controller
        .process_refund(held.id, "customer request")
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::NoSuccessfulPayment { .. }));

    // The failed attempt rolled back: nothing was refunded or moved
    let details = h
        .controller
        .booking_details(&held.booking_reference)
        .await
        .unwrap();
    assert_eq!(details.booking.state, BookingState::Cancelled);
    assert!(details.refunds.is_empty());
}

#[tokio::test]
async fn test_guards_reject_out_of_order_operations() {
    let h = harness();
    let (flight, seats) = flight_with_seats(&h.store, "SL204", 1, 100).await;

    let booking = h
        .controller
        .create_booking(flight.id, seats[0].id, passenger(1))
        .await
        .unwrap();

    let err = h.controller.initiate_payment(booking.id, "CARD").await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::IllegalTransition {
            from: BookingState::Initiated,
            to: BookingState::PaymentPending
        }
    ));

    let err = h.controller.cancel_booking(booking.id, "").await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::InvalidState {
            required: BookingState::Confirmed,
            actual: BookingState::Initiated,
            ..
        }
    ));

    let err = h.controller.process_refund(booking.id, "").await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::InvalidState {
            required: BookingState::Cancelled,
            ..
        }
    ));

    h.controller.hold_seat(booking.id).await.unwrap();
    let err = h.controller.hold_seat(booking.id).await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::IllegalTransition {
            from: BookingState::SeatHeld,
            to: BookingState::SeatHeld
        }
    ));

    let (_, payment) = h.controller.initiate_payment(booking.id, "").await.unwrap();
    assert_eq!(payment.payment_method, "MOCK");
    h.controller
        .process_payment(booking.id, payment.id, false)
        .await
        .unwrap();
    let err = h
        .controller
        .process_payment(booking.id, payment.id, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::PaymentNotPending {
            status: PaymentStatus::Success,
            ..
        }
    ));

    let history = h
        .controller
        .booking_details(&booking.booking_reference)
        .await
        .unwrap()
        .history;
    assert_eq!(history.len(), 3);
}

#[tokio::test]
async fn test_unknown_entities_are_not_found() {
    let h = harness();
    let (flight, seats) = flight_with_seats(&h.store, "SL204", 1, 100).await;
    let (other_flight, _) = flight_with_seats(&h.store, "SL318", 1, 100).await;

    let err = h
        .controller
        .create_booking(other_flight.id, seats[0].id, passenger(1))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::NotFound { entity: "Seat", .. }));

    let err = h
        .controller
        .create_booking(Uuid::new_v4(), seats[0].id, passenger(1))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::NotFound { entity: "Flight", .. }));

    let err = h
        .controller
        .create_booking(flight.id, Uuid::new_v4(), passenger(1))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::NotFound { entity: "Seat", .. }));

    let err = h.controller.hold_seat(Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");

    let err = h.controller.booking_details("BK00000000").await.unwrap_err();
    assert!(matches!(err, BookingError::NotFound { entity: "Booking", .. }));

    let held = h
        .controller
        .reserve_seat(flight.id, seats[0].id, passenger(1))
        .await
        .unwrap();
    h.controller.initiate_payment(held.id, "CARD").await.unwrap();
    let err = h
        .controller
        .process_payment(held.id, Uuid::new_v4(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::NotFound { entity: "Payment", .. }));
}

#[tokio::test]
async fn test_availability_follows_occupying_states() {
    let h = harness();
    let (flight, seats) = flight_with_seats(&h.store, "SL204", 3, 250).await;
    let ledger = h.controller.ledger();

    assert_eq!(ledger.available_seat_count(flight.id).await.unwrap(), 3);

    // INITIATED does not occupy the seat
    let initiated = h
        .controller
        .create_booking(flight.id, seats[0].id, passenger(1))
        .await
        .unwrap();
    assert_eq!(ledger.available_seat_count(flight.id).await.unwrap(), 3);

    h.controller.hold_seat(initiated.id).await.unwrap();
    let (_, payment) = h.controller.initiate_payment(initiated.id, "CARD").await.unwrap();
    assert_eq!(ledger.available_seat_count(flight.id).await.unwrap(), 2);

    h.controller
        .reserve_seat(flight.id, seats[1].id, passenger(2))
        .await
        .unwrap();
    let free: Vec<Uuid> = ledger
        .available_seats(flight.id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(free, vec![seats[2].id]);
    assert_eq!(ledger.available_seat_count(flight.id).await.unwrap(), 1);

    h.controller
        .process_payment(initiated.id, payment.id, false)
        .await
        .unwrap();
    assert_eq!(ledger.available_seat_count(flight.id).await.unwrap(), 1);

    h.clock.advance(Duration::minutes(15));
    assert_eq!(h.sweeper.sweep().await.unwrap(), 1);
    assert_eq!(ledger.available_seat_count(flight.id).await.unwrap(), 2);

    assert!(matches!(
        ledger.available_seat_count(Uuid::new_v4()).await,
        Err(BookingError::NotFound { entity: "Flight", .. })
    ));
}

#[tokio::test]
async fn test_custom_hold_window() {
    let h = harness();
    let (flight, seats) = flight_with_seats(&h.store, "SL204", 1, 100).await;
    let window = Duration::seconds(30);
    let controller = h.controller.clone().with_hold_window(window);
    let sweeper = h.sweeper.clone().with_hold_window(window);

    let held = controller
        .reserve_seat(flight.id, seats[0].id, passenger(1))
        .await
        .unwrap();
    let details = controller.booking_details(&held.booking_reference).await.unwrap();
    assert_eq!(details.hold_expires_at, held.seat_held_at.map(|t| t + window));

    h.clock.advance(Duration::seconds(31));
    assert_eq!(sweeper.sweep().await.unwrap(), 1);
}

#[tokio::test]
async fn test_hold_on_a_dangling_seat_is_not_found() {
    let h = harness();
    let (flight, _) = flight_with_seats(&h.store, "SL204", 1, 100).await;
    let missing_seat = Uuid::new_v4();
    let now = h.clock.now();

    let mut occupant = Booking::new("BKDEAD0001".into(), flight.id, missing_seat, passenger(1), 100, now);
    occupant.state = BookingState::SeatHeld;
    occupant.seat_held_at = Some(now);
    let waiting = Booking::new("BKDEAD0002".into(), flight.id, missing_seat, passenger(2), 100, now);

    let mut uow = h.store.begin().await.unwrap();
    uow.insert_booking(&occupant).await.unwrap();
    uow.insert_booking(&waiting).await.unwrap();
    uow.commit().await.unwrap();

    let err = h.controller.hold_seat(waiting.id).await.unwrap_err();
    match err {
        BookingError::NotFound { entity, id } => {
            assert_eq!(entity, "Seat");
            assert_eq!(id, missing_seat.to_string());
        }
        other => panic!("expected NotFound, got {other:?}"),
    }
}
