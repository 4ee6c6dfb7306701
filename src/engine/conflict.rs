use std::collections::BTreeMap;

use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::model::*;

use super::availability::{Blocker, check_quantity, exclusive_blocker};
use super::EngineError;

/// Write guards held for one commit, keyed (and therefore acquired) in id order.
pub(super) type LedgerGuards = BTreeMap<Ulid, OwnedRwLockWriteGuard<Ledger>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Build a booking window and enforce timestamp limits.
pub(crate) fn booking_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end).ok_or(EngineError::InvalidWindow { start, end })?;
    validate_span(&span)?;
    Ok(span)
}

/// Read-only windows only need to be ordered. Nothing stored lies outside
/// the booking limits, so a wider window just sees no extra reservations.
pub(crate) fn query_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    Span::try_new(start, end).ok_or(EngineError::InvalidWindow { start, end })
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Whether the catalog gates (unit status, staff and product active flags)
/// apply. They guard new attachments only; re-checks of an existing
/// booking look at stock and overlaps alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Gate {
    NewAttachment,
    Existing,
}

pub(super) fn check_product(
    ledger: &Ledger,
    requested: u32,
    span: Span,
    exclude: Option<Ulid>,
    gate: Gate,
) -> Result<(), EngineError> {
    let product = ledger.subject.as_product().ok_or(EngineError::WrongKind {
        id: ledger.id(),
        expected: "product",
    })?;
    if gate == Gate::NewAttachment && !product.active {
        return Err(EngineError::Inactive(product.id));
    }
    let check = check_quantity(product.quantity, ledger, span, requested, exclude);
    if !check.ok {
        return Err(EngineError::InsufficientStock {
            product_id: product.id,
            requested,
            available: check.available,
        });
    }
    Ok(())
}

pub(super) fn check_resource(
    ledger: &Ledger,
    span: Span,
    exclude: Option<Ulid>,
    gate: Gate,
) -> Result<(), EngineError> {
    let resource_id = ledger.id();
    if ledger.subject.resource_kind().is_none() {
        return Err(EngineError::WrongKind {
            id: resource_id,
            expected: "studio, staff member or equipment unit",
        });
    }
    let unit_status = match gate {
        Gate::NewAttachment => {
            if let Subject::Staff(staff) = &ledger.subject
                && !staff.active
            {
                return Err(EngineError::Inactive(resource_id));
            }
            ledger.subject.unit_status()
        }
        Gate::Existing => None,
    };
    match exclusive_blocker(unit_status, ledger, span, exclude) {
        None => Ok(()),
        Some(Blocker::OutOfService(status)) => Err(EngineError::OutOfService { resource_id, status }),
        Some(Blocker::Reserved(r)) => Err(EngineError::Conflict {
            resource_id,
            booking_id: r.booking_id,
        }),
    }
}

/// Refuse to add a reservation to a ledger already holding `cap` of them.
/// Writers that only move or drop reservations skip this.
pub(super) fn check_reservation_room<'a>(
    ledgers: impl IntoIterator<Item = &'a Ledger>,
    cap: usize,
) -> Result<(), EngineError> {
    if ledgers.into_iter().any(|l| l.reservations.len() >= cap) {
        return Err(EngineError::LimitExceeded("too many reservations on ledger"));
    }
    Ok(())
}

/// Check every product total and every resource of a booking against the
/// locked ledgers. Fails on the first line that does not fit.
pub(super) fn check_booking_fits(
    guards: &LedgerGuards,
    products: &[(Ulid, u32)],
    resources: &[Ulid],
    span: Span,
    exclude: Option<Ulid>,
    gate: Gate,
) -> Result<(), EngineError> {
    for (product_id, requested) in products {
        let ledger = guards.get(product_id).ok_or(EngineError::NotFound(*product_id))?;
        check_product(ledger, *requested, span, exclude, gate)?;
    }
    for resource_id in resources {
        let ledger = guards.get(resource_id).ok_or(EngineError::NotFound(*resource_id))?;
        check_resource(ledger, span, exclude, gate)?;
    }
    Ok(())
}
