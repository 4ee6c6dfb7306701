use std::path::PathBuf;

use tokio_test::{assert_err, assert_ok};

use super::*;
use super::conflict::validate_span;
use crate::limits::*;

const H: Ms = 3_600_000; // 1 hour in ms
/// 2026-01-01T00:00:00Z
const T0: Ms = 1_767_225_600_000;

fn at(hours: i64) -> Ms {
    T0 + hours * H
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("kitbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name)).unwrap()
}

async fn add_product(engine: &Engine, name: &str, quantity: u32) -> Ulid {
    let id = Ulid::new();
    assert_ok!(
        engine
            .create_product(Product {
                id,
                name: name.into(),
                category: Category::Camera,
                price: 1_500,
                quantity,
                active: true,
            })
            .await
    );
    id
}

async fn add_studio(engine: &Engine, name: &str) -> Ulid {
    let id = Ulid::new();
    assert_ok!(engine.create_studio(Studio { id, name: name.into(), daily_rate: 8_000 }).await);
    id
}

async fn add_staff(engine: &Engine, name: &str) -> Ulid {
    let id = Ulid::new();
    assert_ok!(
        engine
            .create_staff(StaffMember {
                id,
                name: name.into(),
                position: Position::Cameraman,
                active: true,
            })
            .await
    );
    id
}

async fn add_unit(engine: &Engine, serial: &str) -> Ulid {
    let id = Ulid::new();
    assert_ok!(
        engine
            .create_equipment(EquipmentUnit {
                id,
                product_id: None,
                serial_number: serial.into(),
                status: UnitStatus::Available,
            })
            .await
    );
    id
}

fn request(lines: Vec<CartLine>, resources: Vec<Ulid>, start_h: i64, end_h: i64) -> NewBooking {
    NewBooking {
        id: Ulid::new(),
        customer: Customer::named("Khun Malee"),
        span: Span::new(at(start_h), at(end_h)),
        created_by: Some("front-desk".into()),
        lines,
        resources,
    }
}

async fn book(engine: &Engine, lines: Vec<CartLine>, resources: Vec<Ulid>, start_h: i64, end_h: i64) -> Booking {
    assert_ok!(engine.place_booking(request(lines, resources, start_h, end_h), None).await)
}

/// Walk the forward path from draft until `target` is reached.
async fn advance_to(engine: &Engine, id: Ulid, target: BookingStatus) {
    use BookingStatus::*;
    for next in [QuotationSent, PendingDeposit, Approved, Active, Completed] {
        assert_ok!(engine.transition_booking(id, next).await);
        if next == target {
            return;
        }
    }
    panic!("{target} is not on the forward path");
}

// ── Fungible stock ───────────────────────────────────────

#[tokio::test]
async fn camera_scenario_overlap_and_adjacency() {
    let engine = new_engine("camera_scenario.wal");
    let camera = add_product(&engine, "Camera X", 5).await;
    let booking = book(&engine, vec![CartLine::new(camera, 3)], vec![], 10, 18).await;
    advance_to(&engine, booking.id, BookingStatus::Approved).await;

    assert_eq!(assert_ok!(engine.get_available_quantity(camera, at(12), at(20), None).await), 2);
    assert_eq!(assert_ok!(engine.get_booked_quantity(camera, at(12), at(20), None).await), 3);
    // Starts exactly when the booking ends
    assert_eq!(assert_ok!(engine.get_available_quantity(camera, at(18), at(22), None).await), 5);
}

#[tokio::test]
async fn free_windows_show_full_stock() {
    let engine = new_engine("free_windows.wal");
    let camera = add_product(&engine, "Camera X", 4).await;
    assert_eq!(assert_ok!(engine.get_available_quantity(camera, at(0), at(5), None).await), 4);
    assert_eq!(assert_ok!(engine.get_available_quantity(camera, at(100), at(200), None).await), 4);
}

#[tokio::test]
async fn any_ordered_window_gets_an_answer() {
    let engine = new_engine("wide_windows.wal");
    let camera = add_product(&engine, "Camera X", 4).await;
    let studio = add_studio(&engine, "Studio A").await;
    let booking = book(&engine, vec![CartLine::new(camera, 1)], vec![studio], 0, 10).await;

    // Ten years, and a window reaching back before 1970
    let decade = 10 * 366 * 24;
    assert_eq!(assert_ok!(engine.get_booked_quantity(camera, at(-decade), at(decade), None).await), 1);
    assert_eq!(assert_ok!(engine.get_available_quantity(camera, -1_000, 1_000, None).await), 4);
    match assert_ok!(
        engine
            .check_resource_overlap(ResourceKind::Studio, studio, i64::MIN, i64::MAX, None)
            .await
    ) {
        Clearance::Booked(holder) => assert_eq!(holder.id, booking.id),
        other => panic!("expected Booked, got {other:?}"),
    }
    assert_eq!(assert_ok!(engine.list_bookings(at(-decade), at(decade)).await).len(), 1);

    let err = assert_err!(engine.get_booked_quantity(camera, at(5), at(5), None).await);
    assert!(matches!(err, EngineError::InvalidWindow { .. }));
}

#[tokio::test]
async fn exclude_drops_own_booking() {
    let engine = new_engine("exclude_own.wal");
    let camera = add_product(&engine, "Camera X", 5).await;
    let booking = book(&engine, vec![CartLine::new(camera, 2)], vec![], 0, 10).await;

    assert_eq!(assert_ok!(engine.get_booked_quantity(camera, at(0), at(10), None).await), 2);
    assert_eq!(
        assert_ok!(engine.get_booked_quantity(camera, at(0), at(10), Some(booking.id)).await),
        0
    );
}

#[tokio::test]
async fn finished_and_problem_bookings_release_stock() {
    let engine = new_engine("release_stock.wal");
    let camera = add_product(&engine, "Camera X", 2).await;
    let done = book(&engine, vec![CartLine::new(camera, 1)], vec![], 0, 10).await;
    let stuck = book(&engine, vec![CartLine::new(camera, 1)], vec![], 0, 10).await;
    assert_eq!(assert_ok!(engine.get_available_quantity(camera, at(0), at(10), None).await), 0);

    advance_to(&engine, done.id, BookingStatus::Completed).await;
    assert_ok!(engine.transition_booking(stuck.id, BookingStatus::Problem).await);
    assert_eq!(assert_ok!(engine.get_available_quantity(camera, at(0), at(10), None).await), 2);
}

#[tokio::test]
async fn availability_never_negative() {
    let engine = new_engine("never_negative.wal");
    let camera = add_product(&engine, "Camera X", 3).await;
    book(&engine, vec![CartLine::new(camera, 3)], vec![], 0, 10).await;

    let mut shrunk = engine.get_subject(camera).await.unwrap().as_product().cloned().unwrap();
    shrunk.quantity = 1;
    assert_ok!(engine.update_product(shrunk).await);

    assert_eq!(assert_ok!(engine.get_available_quantity(camera, at(0), at(10), None).await), 0);
    let check = assert_ok!(engine.check_availability(camera, at(0), at(10), 1, None).await);
    assert!(!check.ok);
}

#[tokio::test]
async fn repeated_checks_are_stable() {
    let engine = new_engine("stable_checks.wal");
    let camera = add_product(&engine, "Camera X", 5).await;
    book(&engine, vec![CartLine::new(camera, 2)], vec![], 0, 10).await;

    let first = assert_ok!(engine.check_availability(camera, at(2), at(4), 3, None).await);
    let second = assert_ok!(engine.check_availability(camera, at(2), at(4), 3, None).await);
    assert_eq!(first, second);
    assert!(first.ok);
    assert_eq!(first.available, 3);
}

#[tokio::test]
async fn query_rejects_inverted_window() {
    let engine = new_engine("inverted_window.wal");
    let camera = add_product(&engine, "Camera X", 5).await;
    let err = assert_err!(engine.get_available_quantity(camera, at(5), at(5), None).await);
    assert!(matches!(err, EngineError::InvalidWindow { .. }));
}

#[tokio::test]
async fn sold_out_spans_follow_quantity() {
    let engine = new_engine("sold_out.wal");
    let camera = add_product(&engine, "Camera X", 2).await;
    book(&engine, vec![CartLine::new(camera, 1)], vec![], 0, 10).await;
    book(&engine, vec![CartLine::new(camera, 1)], vec![], 4, 12).await;

    let spans = assert_ok!(engine.sold_out_spans(camera, at(0), at(24)).await);
    assert_eq!(spans, vec![Span::new(at(4), at(10))]);
}

// ── Exclusive resources ──────────────────────────────────

#[tokio::test]
async fn studio_conflict_and_self_exclusion() {
    let engine = new_engine("studio_conflict.wal");
    let studio = add_studio(&engine, "Studio A").await;
    let booking = book(&engine, vec![], vec![studio], 10, 18).await;
    advance_to(&engine, booking.id, BookingStatus::Approved).await;

    let clearance = assert_ok!(
        engine
            .check_resource_overlap(ResourceKind::Studio, studio, at(12), at(14), None)
            .await
    );
    match clearance {
        Clearance::Booked(holder) => assert_eq!(holder.id, booking.id),
        other => panic!("expected Booked, got {other:?}"),
    }

    let own = assert_ok!(
        engine
            .check_resource_overlap(ResourceKind::Studio, studio, at(12), at(14), Some(booking.id))
            .await
    );
    assert!(own.is_free());

    let adjacent = assert_ok!(
        engine
            .check_resource_overlap(ResourceKind::Studio, studio, at(18), at(20), None)
            .await
    );
    assert!(adjacent.is_free());
}

#[tokio::test]
async fn maintenance_unit_never_clears() {
    let engine = new_engine("maintenance_unit.wal");
    let unit = add_unit(&engine, "GIM-001").await;
    assert_ok!(engine.set_equipment_status(unit, UnitStatus::Maintenance).await);

    let clearance = assert_ok!(
        engine
            .check_resource_overlap(ResourceKind::Equipment, unit, at(1_000), at(1_001), None)
            .await
    );
    assert_eq!(clearance, Clearance::OutOfService(UnitStatus::Maintenance));
}

#[tokio::test]
async fn overlap_check_rejects_wrong_kind() {
    let engine = new_engine("wrong_kind.wal");
    let studio = add_studio(&engine, "Studio A").await;
    let err = assert_err!(
        engine
            .check_resource_overlap(ResourceKind::Staff, studio, at(0), at(1), None)
            .await
    );
    assert!(matches!(err, EngineError::WrongKind { .. }));
}

#[tokio::test]
async fn staff_overlap_free_booked_and_excluded() {
    let engine = new_engine("staff_overlap.wal");
    let person = add_staff(&engine, "Khun Somchai").await;

    let before = assert_ok!(
        engine
            .check_resource_overlap(ResourceKind::Staff, person, at(10), at(18), None)
            .await
    );
    assert_eq!(before, Clearance::Free);

    let shoot = book(&engine, vec![], vec![person], 10, 18).await;
    let during = assert_ok!(
        engine
            .check_resource_overlap(ResourceKind::Staff, person, at(12), at(14), None)
            .await
    );
    match during {
        Clearance::Booked(holder) => assert_eq!(holder.id, shoot.id),
        other => panic!("expected Booked, got {other:?}"),
    }

    let own = assert_ok!(
        engine
            .check_resource_overlap(ResourceKind::Staff, person, at(12), at(14), Some(shoot.id))
            .await
    );
    assert_eq!(own, Clearance::Free);

    // Back-to-back shifts do not overlap
    let after = assert_ok!(
        engine
            .check_resource_overlap(ResourceKind::Staff, person, at(18), at(20), None)
            .await
    );
    assert_eq!(after, Clearance::Free);
}

#[tokio::test]
async fn second_studio_booking_is_refused() {
    let engine = new_engine("studio_double.wal");
    let studio = add_studio(&engine, "Studio A").await;
    let first = book(&engine, vec![], vec![studio], 10, 18).await;

    let err = assert_err!(engine.place_booking(request(vec![], vec![studio], 12, 14), None).await);
    match err {
        EngineError::Conflict { resource_id, booking_id } => {
            assert_eq!(resource_id, studio);
            assert_eq!(booking_id, first.id);
        }
        other => panic!("expected Conflict, got {other:?}"),
    }

    // Back-to-back is fine
    book(&engine, vec![], vec![studio], 18, 20).await;
}

// ── Cart ─────────────────────────────────────────────────

#[tokio::test]
async fn cart_reports_first_failing_line() {
    let engine = new_engine("cart_first_fail.wal");
    let camera = add_product(&engine, "Camera X", 1).await;
    let light = add_product(&engine, "Light Y", 1).await;
    book(
        &engine,
        vec![CartLine::new(camera, 1), CartLine::new(light, 1)],
        vec![],
        0,
        10,
    )
    .await;

    let lines = [CartLine::new(camera, 1), CartLine::new(light, 1)];
    let err = assert_err!(engine.validate_cart(&lines, Some(at(2)), Some(at(4))).await);
    match err {
        CartRejection::Insufficient { product_id, name, .. } => {
            assert_eq!(product_id, camera);
            assert_eq!(name, "Camera X");
        }
        other => panic!("expected Insufficient, got {other:?}"),
    }

    let reversed = [CartLine::new(light, 1), CartLine::new(camera, 1)];
    let err = assert_err!(engine.validate_cart(&reversed, Some(at(2)), Some(at(4))).await);
    assert!(matches!(err, CartRejection::Insufficient { product_id, .. } if product_id == light));
}

#[tokio::test]
async fn cart_without_dates_is_rejected() {
    let engine = new_engine("cart_no_dates.wal");
    let camera = add_product(&engine, "Camera X", 1).await;
    let lines = [CartLine::new(camera, 1)];
    assert_eq!(
        engine.validate_cart(&lines, None, Some(at(4))).await,
        Err(CartRejection::MissingWindow)
    );
    assert_ok!(engine.validate_cart(&lines, Some(at(0)), Some(at(4))).await);
}

// ── Placement ────────────────────────────────────────────

#[tokio::test]
async fn placement_sums_repeated_lines() {
    let engine = new_engine("sum_lines.wal");
    let camera = add_product(&engine, "Camera X", 3).await;

    let err = assert_err!(
        engine
            .place_booking(
                request(vec![CartLine::new(camera, 2), CartLine::new(camera, 2)], vec![], 0, 5),
                None
            )
            .await
    );
    assert!(matches!(
        err,
        EngineError::InsufficientStock { requested: 4, available: 3, .. }
    ));
}

#[tokio::test]
async fn placement_snapshots_price() {
    let engine = new_engine("price_snapshot.wal");
    let camera = add_product(&engine, "Camera X", 3).await;
    let booking = book(&engine, vec![CartLine::new(camera, 1)], vec![], 0, 5).await;
    assert_eq!(booking.items[0].unit_price, 1_500);
    assert_eq!(booking.status, BookingStatus::Draft);

    let mut repriced = engine.get_subject(camera).await.unwrap().as_product().cloned().unwrap();
    repriced.price = 9_999;
    assert_ok!(engine.update_product(repriced).await);

    let stored = engine.get_booking(booking.id).await.unwrap();
    assert_eq!(stored.items[0].unit_price, 1_500);
}

#[tokio::test]
async fn placement_rejects_bad_requests() {
    let engine = new_engine("bad_requests.wal");
    let studio = add_studio(&engine, "Studio A").await;

    let empty = assert_err!(engine.place_booking(request(vec![], vec![], 0, 5), None).await);
    assert!(matches!(empty, EngineError::EmptyBooking));

    let missing = Ulid::new();
    let unknown = assert_err!(
        engine
            .place_booking(request(vec![CartLine::new(missing, 1)], vec![], 0, 5), None)
            .await
    );
    assert!(matches!(unknown, EngineError::NotFound(id) if id == missing));

    let as_product = assert_err!(
        engine
            .place_booking(request(vec![CartLine::new(studio, 1)], vec![], 0, 5), None)
            .await
    );
    assert!(matches!(as_product, EngineError::WrongKind { .. }));

    let mut nameless = request(vec![], vec![studio], 0, 5);
    nameless.customer = Customer::named("   ");
    assert!(matches!(
        engine.place_booking(nameless, None).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn placement_respects_status_gates() {
    let engine = new_engine("placement_gates.wal");
    let unit = add_unit(&engine, "CAM-001").await;
    let person = add_staff(&engine, "Khun Somchai").await;
    assert_ok!(engine.set_equipment_status(unit, UnitStatus::Lost).await);
    assert_ok!(engine.set_staff_active(person, false).await);

    let lost = assert_err!(engine.place_booking(request(vec![], vec![unit], 0, 5), None).await);
    assert!(matches!(lost, EngineError::OutOfService { status: UnitStatus::Lost, .. }));

    let inactive = assert_err!(engine.place_booking(request(vec![], vec![person], 0, 5), None).await);
    assert!(matches!(inactive, EngineError::Inactive(id) if id == person));
}

#[tokio::test]
async fn stale_revision_reports_concurrent_conflict() {
    let engine = new_engine("stale_revision.wal");
    let camera = add_product(&engine, "Camera X", 1).await;

    let seen = engine.revision();
    assert!(assert_ok!(engine.check_availability(camera, at(0), at(5), 1, None).await).ok);

    // Someone else takes the last unit after our check
    book(&engine, vec![CartLine::new(camera, 1)], vec![], 0, 5).await;

    let err = assert_err!(
        engine
            .place_booking(request(vec![CartLine::new(camera, 1)], vec![], 0, 5), Some(seen))
            .await
    );
    assert!(matches!(err, EngineError::ConcurrentConflict));

    // With a fresh revision the plain shortage is reported
    let err = assert_err!(
        engine
            .place_booking(
                request(vec![CartLine::new(camera, 1)], vec![], 0, 5),
                Some(engine.revision())
            )
            .await
    );
    assert!(matches!(err, EngineError::InsufficientStock { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checkouts_of_last_unit() {
    let engine = Arc::new(new_engine("last_unit_race.wal"));
    let camera = add_product(&engine, "Camera X", 1).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .place_booking(request(vec![CartLine::new(camera, 1)], vec![], 0, 8), None)
                .await
        }));
    }

    let mut placed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => placed += 1,
            Err(EngineError::InsufficientStock { available: 0, .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(placed, 1);
    assert_eq!(assert_ok!(engine.get_booked_quantity(camera, at(0), at(8), None).await), 1);
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn transitions_follow_the_table() {
    let engine = new_engine("transition_table.wal");
    let studio = add_studio(&engine, "Studio A").await;
    let booking = book(&engine, vec![], vec![studio], 0, 5).await;

    let skip = assert_err!(engine.transition_booking(booking.id, BookingStatus::Approved).await);
    assert!(matches!(
        skip,
        EngineError::InvalidTransition { from: BookingStatus::Draft, to: BookingStatus::Approved }
    ));

    advance_to(&engine, booking.id, BookingStatus::Completed).await;
    let after_done = assert_err!(engine.transition_booking(booking.id, BookingStatus::Problem).await);
    assert!(matches!(after_done, EngineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn problem_to_draft_rechecks_stock() {
    let engine = new_engine("problem_recheck.wal");
    let camera = add_product(&engine, "Camera X", 1).await;
    let original = book(&engine, vec![CartLine::new(camera, 1)], vec![], 0, 5).await;
    assert_ok!(engine.transition_booking(original.id, BookingStatus::Problem).await);

    // The freed unit is taken while the first booking sits in problem
    book(&engine, vec![CartLine::new(camera, 1)], vec![], 2, 6).await;

    let err = assert_err!(engine.transition_booking(original.id, BookingStatus::Draft).await);
    assert!(matches!(err, EngineError::InsufficientStock { .. }));
    assert_eq!(
        engine.get_booking(original.id).await.unwrap().status,
        BookingStatus::Problem
    );
}

#[tokio::test]
async fn problem_to_draft_when_free() {
    let engine = new_engine("problem_free.wal");
    let studio = add_studio(&engine, "Studio A").await;
    let booking = book(&engine, vec![], vec![studio], 0, 5).await;
    assert_ok!(engine.transition_booking(booking.id, BookingStatus::Problem).await);
    let revived = assert_ok!(engine.transition_booking(booking.id, BookingStatus::Draft).await);
    assert_eq!(revived.status, BookingStatus::Draft);
}

#[tokio::test]
async fn reschedule_checks_against_others_only() {
    let engine = new_engine("reschedule.wal");
    let studio = add_studio(&engine, "Studio A").await;
    let mine = book(&engine, vec![], vec![studio], 0, 5).await;
    let theirs = book(&engine, vec![], vec![studio], 10, 15).await;

    // Overlapping its own old slot is fine
    let moved = assert_ok!(engine.reschedule_booking(mine.id, at(2), at(8)).await);
    assert_eq!(moved.span, Span::new(at(2), at(8)));

    let err = assert_err!(engine.reschedule_booking(mine.id, at(8), at(12)).await);
    assert!(matches!(err, EngineError::Conflict { booking_id, .. } if booking_id == theirs.id));

    let inverted = assert_err!(engine.reschedule_booking(mine.id, at(8), at(8)).await);
    assert!(matches!(inverted, EngineError::InvalidWindow { .. }));
}

#[tokio::test]
async fn completed_bookings_are_frozen() {
    let engine = new_engine("frozen.wal");
    let studio = add_studio(&engine, "Studio A").await;
    let unit = add_unit(&engine, "CAM-009").await;
    let booking = book(&engine, vec![], vec![studio], 0, 5).await;
    advance_to(&engine, booking.id, BookingStatus::Completed).await;

    assert!(matches!(
        engine.reschedule_booking(booking.id, at(1), at(6)).await,
        Err(EngineError::BookingFrozen(_))
    ));
    assert!(matches!(
        engine.assign_resource(booking.id, unit).await,
        Err(EngineError::BookingFrozen(_))
    ));
}

#[tokio::test]
async fn assignment_gates_and_release() {
    let engine = new_engine("assignment.wal");
    let camera = add_product(&engine, "Camera X", 2).await;
    let unit = add_unit(&engine, "CAM-001").await;
    let person = add_staff(&engine, "Khun Somchai").await;
    let first = book(&engine, vec![CartLine::new(camera, 1)], vec![], 0, 5).await;
    let second = book(&engine, vec![CartLine::new(camera, 1)], vec![], 3, 8).await;

    assert_ok!(engine.assign_resource(first.id, unit).await);
    let dup = assert_err!(engine.assign_resource(first.id, unit).await);
    assert!(matches!(dup, EngineError::AlreadyExists(_)));

    let taken = assert_err!(engine.assign_resource(second.id, unit).await);
    assert!(matches!(taken, EngineError::Conflict { booking_id, .. } if booking_id == first.id));

    assert_ok!(engine.release_resource(first.id, unit).await);
    assert_ok!(engine.assign_resource(second.id, unit).await);

    assert_ok!(engine.set_staff_active(person, false).await);
    assert!(matches!(
        engine.assign_resource(first.id, person).await,
        Err(EngineError::Inactive(_))
    ));

    let not_assigned = assert_err!(engine.release_resource(first.id, person).await);
    assert!(matches!(not_assigned, EngineError::NotFound(_)));
}

#[tokio::test]
async fn maintenance_unit_cannot_be_assigned() {
    let engine = new_engine("assign_maintenance.wal");
    let unit = add_unit(&engine, "LIGHT-001").await;
    let studio = add_studio(&engine, "Studio A").await;
    let booking = book(&engine, vec![], vec![studio], 0, 5).await;
    assert_ok!(engine.set_equipment_status(unit, UnitStatus::Maintenance).await);

    let err = assert_err!(engine.assign_resource(booking.id, unit).await);
    assert!(matches!(err, EngineError::OutOfService { status: UnitStatus::Maintenance, .. }));
}

// ── Catalog ──────────────────────────────────────────────

#[tokio::test]
async fn serial_numbers_are_unique() {
    let engine = new_engine("unique_serial.wal");
    add_unit(&engine, "CAM-001").await;
    let err = assert_err!(
        engine
            .create_equipment(EquipmentUnit {
                id: Ulid::new(),
                product_id: None,
                serial_number: "CAM-001".into(),
                status: UnitStatus::Available,
            })
            .await
    );
    assert!(matches!(err, EngineError::DuplicateSerial(s) if s == "CAM-001"));
}

#[tokio::test]
async fn stock_units_fills_to_quantity() {
    let engine = new_engine("stock_units.wal");
    let camera = add_product(&engine, "Camera X", 3).await;
    add_unit(&engine, "CAM-002").await;

    let created = assert_ok!(engine.stock_units(camera, "CAM").await);
    assert_eq!(created.len(), 3);
    let serials: Vec<String> = engine
        .units_of(camera)
        .await
        .into_iter()
        .map(|u| u.serial_number)
        .collect();
    assert_eq!(serials, vec!["CAM-001", "CAM-003", "CAM-004"]);

    // Already complete
    assert!(assert_ok!(engine.stock_units(camera, "CAM").await).is_empty());
}

#[tokio::test]
async fn duplicate_ids_rejected() {
    let engine = new_engine("duplicate_ids.wal");
    let studio = add_studio(&engine, "Studio A").await;
    let err = assert_err!(
        engine
            .create_studio(Studio { id: studio, name: "Again".into(), daily_rate: 1 })
            .await
    );
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

// ── Reports ──────────────────────────────────────────────

#[tokio::test]
async fn inventory_report_orders_and_counts() {
    let engine = new_engine("inventory.wal");
    let lens = Ulid::new();
    let mic = Ulid::new();
    let retired = Ulid::new();
    for (id, name, category, quantity, active) in [
        (mic, "Rode NTG5", Category::Sound, 4, true),
        (lens, "Sigma 24-70", Category::Lens, 2, true),
        (retired, "Old Tripod", Category::Grip, 9, false),
    ] {
        assert_ok!(
            engine
                .create_product(Product { id, name: name.into(), category, price: 100, quantity, active })
                .await
        );
    }
    let camera = add_product(&engine, "Camera X", 5).await;
    book(&engine, vec![CartLine::new(camera, 2), CartLine::new(mic, 1)], vec![], 0, 10).await;

    let rows = assert_ok!(engine.inventory_report(at(5), at(6)).await);
    let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["Camera X", "Sigma 24-70", "Rode NTG5"]);
    assert_eq!((rows[0].total, rows[0].booked, rows[0].available), (5, 2, 3));
    assert_eq!(rows[2].available, 3);
}

#[tokio::test]
async fn booking_issues_surface_later_problems() {
    let engine = new_engine("booking_issues.wal");
    let camera = add_product(&engine, "Camera X", 2).await;
    let unit = add_unit(&engine, "CAM-001").await;
    let booking = book(&engine, vec![CartLine::new(camera, 2)], vec![unit], 0, 5).await;
    assert!(assert_ok!(engine.booking_issues(booking.id).await).is_empty());

    assert_ok!(engine.set_equipment_status(unit, UnitStatus::Maintenance).await);
    let mut shrunk = engine.get_subject(camera).await.unwrap().as_product().cloned().unwrap();
    shrunk.quantity = 1;
    assert_ok!(engine.update_product(shrunk).await);

    let issues = assert_ok!(engine.booking_issues(booking.id).await);
    assert_eq!(
        issues,
        vec![
            BookingIssue::OutOfService { resource_id: unit, status: UnitStatus::Maintenance },
            BookingIssue::Shortfall { product_id: camera, requested: 2, available: 1 },
        ]
    );
}

#[tokio::test]
async fn quote_counts_started_days_and_studios() {
    let engine = new_engine("quote.wal");
    let camera = add_product(&engine, "Camera X", 2).await;
    let studio = add_studio(&engine, "Studio A").await;
    let booking = book(&engine, vec![CartLine::new(camera, 2)], vec![studio], 0, 30).await;

    let quote = assert_ok!(engine.quote_booking(booking.id).await);
    assert_eq!(quote.days, 2);
    assert_eq!(quote.per_day, 2 * 1_500 + 8_000);
    assert_eq!(quote.total, 2 * (2 * 1_500 + 8_000));
}

#[tokio::test]
async fn list_bookings_filters_and_orders() {
    let engine = new_engine("list_bookings.wal");
    let studio = add_studio(&engine, "Studio A").await;
    let late = book(&engine, vec![], vec![studio], 20, 22).await;
    let early = book(&engine, vec![], vec![studio], 2, 4).await;
    book(&engine, vec![], vec![studio], 40, 42).await;

    let listed = assert_ok!(engine.list_bookings(at(0), at(24)).await);
    let ids: Vec<Ulid> = listed.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![early.id, late.id]);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay_restore.wal");
    let (camera, unit, booking_id) = {
        let engine = Engine::new(path.clone()).unwrap();
        let camera = add_product(&engine, "Camera X", 5).await;
        let unit = add_unit(&engine, "CAM-001").await;
        let booking = book(&engine, vec![CartLine::new(camera, 3)], vec![unit], 0, 10).await;
        advance_to(&engine, booking.id, BookingStatus::Approved).await;
        assert_ok!(engine.reschedule_booking(booking.id, at(2), at(12)).await);
        assert_ok!(engine.set_equipment_status(unit, UnitStatus::Maintenance).await);
        (camera, unit, booking.id)
    };

    let engine = Engine::new(path).unwrap();
    let booking = engine.get_booking(booking_id).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Approved);
    assert_eq!(booking.span, Span::new(at(2), at(12)));
    assert_eq!(assert_ok!(engine.get_available_quantity(camera, at(10), at(11), None).await), 2);
    assert_eq!(
        engine.get_subject(unit).await.and_then(|s| s.unit_status()),
        Some(UnitStatus::Maintenance)
    );
    assert!(engine.revision() > 0);
    // Serial index rebuilt
    let dup = engine
        .create_equipment(EquipmentUnit {
            id: Ulid::new(),
            product_id: None,
            serial_number: "CAM-001".into(),
            status: UnitStatus::Available,
        })
        .await;
    assert!(matches!(dup, Err(EngineError::DuplicateSerial(_))));
}

#[tokio::test]
async fn torn_tail_is_cut_before_new_bookings() {
    use std::io::Write;

    let path = test_wal_path("torn_tail_restart.wal");
    let camera = {
        let engine = Engine::new(path.clone()).unwrap();
        add_product(&engine, "Camera X", 1).await
    };
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0xAB; 3]).unwrap();
    }

    let booking_id = {
        let engine = Engine::new(path.clone()).unwrap();
        let booking = book(&engine, vec![CartLine::new(camera, 1)], vec![], 0, 24).await;
        assert_eq!(assert_ok!(engine.get_booked_quantity(camera, at(0), at(24), None).await), 1);
        booking.id
    };

    let engine = Engine::new(path).unwrap();
    assert!(engine.get_booking(booking_id).await.is_some(), "acknowledged booking lost");
    assert_eq!(assert_ok!(engine.get_booked_quantity(camera, at(0), at(24), None).await), 1);
    let err = assert_err!(
        engine
            .place_booking(request(vec![CartLine::new(camera, 1)], vec![], 2, 4), None)
            .await
    );
    assert!(matches!(err, EngineError::InsufficientStock { .. }));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let (studio, kept) = {
        let engine = Engine::new(path.clone()).unwrap();
        let studio = add_studio(&engine, "Studio A").await;
        let person = add_staff(&engine, "Khun Somchai").await;
        for _ in 0..10 {
            assert_ok!(engine.set_staff_active(person, false).await);
            assert_ok!(engine.set_staff_active(person, true).await);
        }
        let kept = book(&engine, vec![], vec![studio, person], 0, 5).await;
        assert_ok!(engine.transition_booking(kept.id, BookingStatus::Problem).await);

        let before = std::fs::metadata(&path).unwrap().len();
        assert_ok!(engine.compact_wal().await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should shrink: {after} < {before}");
        (studio, kept.id)
    };

    let engine = Engine::new(path).unwrap();
    let booking = engine.get_booking(kept).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Problem);
    // Problem bookings do not hold the studio
    let clearance = assert_ok!(
        engine
            .check_resource_overlap(ResourceKind::Studio, studio, at(0), at(5), None)
            .await
    );
    assert!(clearance.is_free());
}

// ── Limits ───────────────────────────────────────────────

#[test]
fn span_limits() {
    assert!(validate_span(&Span::new(at(0), at(1))).is_ok());
    assert!(matches!(
        validate_span(&Span::new(T0, T0 + MAX_SPAN_DURATION_MS + 1)),
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        validate_span(&Span::new(MAX_VALID_TIMESTAMP_MS, MAX_VALID_TIMESTAMP_MS + 1)),
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn full_ledger_refuses_additions_but_drains() {
    let mut engine = new_engine("full_ledger.wal");
    engine.reservation_cap = 2;
    let studio = add_studio(&engine, "Studio A").await;
    let other = add_studio(&engine, "Studio B").await;
    let first = book(&engine, vec![], vec![studio], 0, 2).await;
    let second = book(&engine, vec![], vec![studio], 4, 6).await;

    let err = assert_err!(engine.place_booking(request(vec![], vec![studio], 8, 10), None).await);
    assert!(matches!(err, EngineError::LimitExceeded(_)));
    let elsewhere = book(&engine, vec![], vec![other], 8, 10).await;
    let err = assert_err!(engine.assign_resource(elsewhere.id, studio).await);
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    // Writers that keep or drop reservations still work at the cap
    assert_ok!(engine.reschedule_booking(second.id, at(5), at(7)).await);
    assert_ok!(engine.transition_booking(second.id, BookingStatus::Problem).await);
    assert_ok!(engine.release_resource(first.id, studio).await);

    book(&engine, vec![], vec![studio], 8, 10).await;
}
