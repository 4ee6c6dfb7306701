use ulid::Ulid;

use crate::model::{BookingStatus, Ms, UnitStatus};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    DuplicateSerial(String),
    WrongKind {
        id: Ulid,
        expected: &'static str,
    },
    InvalidWindow {
        start: Ms,
        end: Ms,
    },
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    InsufficientStock {
        product_id: Ulid,
        requested: u32,
        available: u32,
    },
    /// Exclusive resource already held by another blocking booking.
    Conflict {
        resource_id: Ulid,
        booking_id: Ulid,
    },
    OutOfService {
        resource_id: Ulid,
        status: UnitStatus,
    },
    Inactive(Ulid),
    /// Completed bookings cannot be edited.
    BookingFrozen(Ulid),
    EmptyBooking,
    /// Availability check failed after the caller's snapshot went stale.
    ConcurrentConflict,
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Failures caused by other bookings holding stock or resources.
    pub fn is_availability_failure(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientStock { .. } | EngineError::Conflict { .. }
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::DuplicateSerial(serial) => {
                write!(f, "serial number already registered: {serial}")
            }
            EngineError::WrongKind { id, expected } => write!(f, "{id} is not a {expected}"),
            EngineError::InvalidWindow { start, end } => {
                write!(f, "invalid window [{start}, {end}): end must be after start")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot move booking from {from} to {to}")
            }
            EngineError::InsufficientStock {
                product_id,
                requested,
                available,
            } => write!(
                f,
                "insufficient stock for {product_id}: requested {requested}, available {available}"
            ),
            EngineError::Conflict {
                resource_id,
                booking_id,
            } => write!(f, "resource {resource_id} already booked by {booking_id}"),
            EngineError::OutOfService { resource_id, status } => {
                write!(f, "equipment {resource_id} is {status}")
            }
            EngineError::Inactive(id) => write!(f, "{id} is inactive"),
            EngineError::BookingFrozen(id) => write!(f, "booking {id} is completed"),
            EngineError::EmptyBooking => write!(f, "booking has no items or resources"),
            EngineError::ConcurrentConflict => {
                write!(f, "availability changed concurrently, re-check and retry")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
