use std::fmt;

use ulid::Ulid;

use crate::model::*;
use crate::pricing::{self, Quote};

use super::availability::{
    self, Blocker, CartRejection, Clearance, QuantityCheck, cart_window, exclusive_blocker,
    first_conflict,
};
use super::conflict::query_window;
use super::{Engine, EngineError};

/// Something that would stop an existing booking from going out as planned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingIssue {
    OutOfService { resource_id: Ulid, status: UnitStatus },
    InactiveStaff(Ulid),
    Conflict { resource_id: Ulid, booking_id: Ulid },
    Shortfall { product_id: Ulid, requested: u32, available: u32 },
}

impl fmt::Display for BookingIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookingIssue::OutOfService { resource_id, status } => {
                write!(f, "equipment {resource_id} is {status}")
            }
            BookingIssue::InactiveStaff(id) => write!(f, "staff member {id} is inactive"),
            BookingIssue::Conflict { resource_id, booking_id } => {
                write!(f, "{resource_id} is also booked by {booking_id}")
            }
            BookingIssue::Shortfall { product_id, requested, available } => {
                write!(f, "{product_id}: {requested} booked, only {available} free")
            }
        }
    }
}

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let booking = self.get_shared_booking(&id)?;
        let guard = booking.read().await;
        Some(guard.clone())
    }

    pub async fn get_subject(&self, id: Ulid) -> Option<Subject> {
        let ledger = self.get_ledger(&id)?;
        let guard = ledger.read().await;
        Some(guard.subject.clone())
    }

    pub async fn resource_kind(&self, id: Ulid) -> Option<ResourceKind> {
        self.get_subject(id).await.and_then(|s| s.resource_kind())
    }

    /// Equipment units registered against a product, by serial number.
    pub async fn units_of(&self, product_id: Ulid) -> Vec<EquipmentUnit> {
        let ledgers: Vec<_> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        let mut units = Vec::new();
        for ledger in ledgers {
            if let Subject::Equipment(unit) = &ledger.read().await.subject
                && unit.product_id == Some(product_id)
            {
                units.push(unit.clone());
            }
        }
        units.sort_by(|a, b| a.serial_number.cmp(&b.serial_number));
        units
    }

    // ── Fungible stock ───────────────────────────────────────

    pub async fn stock_level(
        &self,
        product_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<StockLevel, EngineError> {
        let window = query_window(start, end)?;
        let ledger = self.get_ledger(&product_id).ok_or(EngineError::NotFound(product_id))?;
        let guard = ledger.read().await;
        let product = guard.subject.as_product().ok_or(EngineError::WrongKind {
            id: product_id,
            expected: "product",
        })?;
        Ok(availability::stock_level(product.quantity, &*guard, window, exclude))
    }

    pub async fn get_booked_quantity(
        &self,
        product_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<u32, EngineError> {
        Ok(self.stock_level(product_id, start, end, exclude).await?.booked)
    }

    pub async fn get_available_quantity(
        &self,
        product_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<u32, EngineError> {
        Ok(self.stock_level(product_id, start, end, exclude).await?.available)
    }

    pub async fn check_availability(
        &self,
        product_id: Ulid,
        start: Ms,
        end: Ms,
        requested: u32,
        exclude: Option<Ulid>,
    ) -> Result<QuantityCheck, EngineError> {
        let level = self.stock_level(product_id, start, end, exclude).await?;
        Ok(QuantityCheck {
            ok: requested <= level.available,
            available: level.available,
        })
    }

    pub async fn sold_out_spans(&self, product_id: Ulid, start: Ms, end: Ms) -> Result<Vec<Span>, EngineError> {
        let window = query_window(start, end)?;
        let ledger = self.get_ledger(&product_id).ok_or(EngineError::NotFound(product_id))?;
        let guard = ledger.read().await;
        let product = guard.subject.as_product().ok_or(EngineError::WrongKind {
            id: product_id,
            expected: "product",
        })?;
        Ok(availability::sold_out_spans(product.quantity, &*guard, window))
    }

    // ── Exclusive resources ──────────────────────────────────

    pub async fn check_resource_overlap(
        &self,
        kind: ResourceKind,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<Clearance, EngineError> {
        let window = query_window(start, end)?;
        let ledger = self.get_ledger(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
        let holder = {
            let guard = ledger.read().await;
            if guard.subject.resource_kind() != Some(kind) {
                return Err(EngineError::WrongKind {
                    id: resource_id,
                    expected: kind.as_str(),
                });
            }
            match exclusive_blocker(guard.subject.unit_status(), &*guard, window, exclude) {
                None => return Ok(Clearance::Free),
                Some(Blocker::OutOfService(status)) => return Ok(Clearance::OutOfService(status)),
                Some(Blocker::Reserved(r)) => r.booking_id,
            }
        };
        // Ledger guard is released before the booking is read.
        let booking = self.get_booking(holder).await.ok_or(EngineError::NotFound(holder))?;
        Ok(Clearance::Booked(booking))
    }

    // ── Cart ─────────────────────────────────────────────────

    /// Checkout pre-check: every line against current stock, first failure wins.
    /// Read-only; `place_booking` repeats the check under write locks.
    pub async fn validate_cart(
        &self,
        lines: &[CartLine],
        start: Option<Ms>,
        end: Option<Ms>,
    ) -> Result<(), CartRejection> {
        cart_window(start, end)?;
        let guards = self.read_ledgers(lines.iter().map(|l| l.product_id)).await;
        availability::validate_cart(lines, start, end, |id| guards.get(&id).map(|g| &**g))
    }

    // ── Reports ──────────────────────────────────────────────

    /// Active products ordered by category then name, with stock over the window.
    pub async fn inventory_report(&self, start: Ms, end: Ms) -> Result<Vec<InventoryRow>, EngineError> {
        let window = query_window(start, end)?;
        let ledgers: Vec<_> = self.ledgers.iter().map(|e| e.value().clone()).collect();

        let mut rows = Vec::new();
        for ledger in ledgers {
            let guard = ledger.read().await;
            let Some(product) = guard.subject.as_product() else { continue };
            if !product.active {
                continue;
            }
            let level = availability::stock_level(product.quantity, &*guard, window, None);
            rows.push(InventoryRow {
                product_id: product.id,
                name: product.name.clone(),
                category: product.category,
                total: level.total,
                booked: level.booked,
                available: level.available,
            });
        }
        rows.sort_by(|a, b| {
            a.category
                .as_str()
                .cmp(b.category.as_str())
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(rows)
    }

    /// Bookings overlapping the window, in start order.
    pub async fn list_bookings(&self, start: Ms, end: Ms) -> Result<Vec<Booking>, EngineError> {
        let window = query_window(start, end)?;
        let bookings: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();

        let mut result = Vec::new();
        for booking in bookings {
            let guard = booking.read().await;
            if guard.span.overlaps(&window) {
                result.push(guard.clone());
            }
        }
        result.sort_by_key(|b| (b.span.start, b.id));
        Ok(result)
    }

    /// Everything currently wrong with a booking, each check excluding the booking itself.
    pub async fn booking_issues(&self, id: Ulid) -> Result<Vec<BookingIssue>, EngineError> {
        let booking = self.get_booking(id).await.ok_or(EngineError::NotFound(id))?;
        let guards = self.read_ledgers(booking.ledger_ids()).await;

        let mut issues = Vec::new();
        for resource_id in &booking.resources {
            let Some(ledger) = guards.get(resource_id) else { continue };
            match &ledger.subject {
                Subject::Equipment(unit) if !unit.status.in_service() => {
                    issues.push(BookingIssue::OutOfService {
                        resource_id: *resource_id,
                        status: unit.status,
                    });
                }
                Subject::Staff(staff) if !staff.active => {
                    issues.push(BookingIssue::InactiveStaff(*resource_id));
                }
                _ => {}
            }
            if let Some(other) = first_conflict(&**ledger, booking.span, Some(id)) {
                issues.push(BookingIssue::Conflict {
                    resource_id: *resource_id,
                    booking_id: other.booking_id,
                });
            }
        }
        for (product_id, requested) in booking.product_totals() {
            let Some(ledger) = guards.get(&product_id) else { continue };
            let Some(product) = ledger.subject.as_product() else { continue };
            let level = availability::stock_level(product.quantity, &**ledger, booking.span, Some(id));
            if requested > level.available {
                issues.push(BookingIssue::Shortfall {
                    product_id,
                    requested,
                    available: level.available,
                });
            }
        }
        Ok(issues)
    }

    /// Price a booking from its item snapshots and its studios' current rates.
    pub async fn quote_booking(&self, id: Ulid) -> Result<Quote, EngineError> {
        let booking = self.get_booking(id).await.ok_or(EngineError::NotFound(id))?;
        let guards = self.read_ledgers(booking.resources.iter().copied()).await;
        let studio_rates: Vec<Minor> = guards
            .values()
            .filter_map(|g| match &g.subject {
                Subject::Studio(s) => Some(s.daily_rate),
                _ => None,
            })
            .collect();
        Ok(pricing::quote(&booking.items, &studio_rates, &booking.span))
    }
}
