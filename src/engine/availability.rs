use ulid::Ulid;

use crate::model::*;

// ── Reservation sources ───────────────────────────────────────────

/// Anything that can list reservations that may touch a window.
/// Implementations may return extra reservations; the aggregators
/// re-apply the overlap and status filters themselves.
pub trait ReservationSource {
    fn candidates(&self, window: Span) -> impl Iterator<Item = &Reservation>;
}

impl ReservationSource for Ledger {
    fn candidates(&self, window: Span) -> impl Iterator<Item = &Reservation> {
        self.overlapping(window)
    }
}

impl ReservationSource for [Reservation] {
    fn candidates(&self, _window: Span) -> impl Iterator<Item = &Reservation> {
        self.iter()
    }
}

fn counts_against(r: &Reservation, window: &Span, exclude: Option<Ulid>) -> bool {
    r.status.is_blocking() && r.span.overlaps(window) && exclude != Some(r.booking_id)
}

// ── Fungible quantity ─────────────────────────────────────────────

/// Sum of units held by blocking reservations overlapping `window`.
/// The reservation whose booking is `exclude` is ignored, so a booking
/// being edited does not compete with itself.
pub fn booked_quantity<S: ReservationSource + ?Sized>(
    source: &S,
    window: Span,
    exclude: Option<Ulid>,
) -> u32 {
    source
        .candidates(window)
        .filter(|r| counts_against(r, &window, exclude))
        .fold(0u32, |acc, r| acc.saturating_add(r.quantity))
}

/// `total - booked`, floored at zero.
pub fn available_quantity<S: ReservationSource + ?Sized>(
    total: u32,
    source: &S,
    window: Span,
    exclude: Option<Ulid>,
) -> u32 {
    total.saturating_sub(booked_quantity(source, window, exclude))
}

pub fn stock_level<S: ReservationSource + ?Sized>(
    total: u32,
    source: &S,
    window: Span,
    exclude: Option<Ulid>,
) -> StockLevel {
    let booked = booked_quantity(source, window, exclude);
    StockLevel {
        total,
        booked,
        available: total.saturating_sub(booked),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantityCheck {
    pub ok: bool,
    pub available: u32,
}

pub fn check_quantity<S: ReservationSource + ?Sized>(
    total: u32,
    source: &S,
    window: Span,
    requested: u32,
    exclude: Option<Ulid>,
) -> QuantityCheck {
    let available = available_quantity(total, source, window, exclude);
    QuantityCheck {
        ok: requested <= available,
        available,
    }
}

// ── Exclusive resources ───────────────────────────────────────────

/// First blocking reservation overlapping `window`, in start order.
pub fn first_conflict<S: ReservationSource + ?Sized>(
    source: &S,
    window: Span,
    exclude: Option<Ulid>,
) -> Option<&Reservation> {
    source
        .candidates(window)
        .find(|r| counts_against(r, &window, exclude))
}

/// Why an exclusive resource cannot be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocker<'a> {
    OutOfService(UnitStatus),
    Reserved(&'a Reservation),
}

/// The status gate runs before any temporal check: a unit in maintenance
/// or lost is blocked for every window.
pub fn exclusive_blocker<'a, S: ReservationSource + ?Sized>(
    unit_status: Option<UnitStatus>,
    source: &'a S,
    window: Span,
    exclude: Option<Ulid>,
) -> Option<Blocker<'a>> {
    if let Some(status) = unit_status
        && !status.in_service()
    {
        return Some(Blocker::OutOfService(status));
    }
    first_conflict(source, window, exclude).map(Blocker::Reserved)
}

/// Result of an exclusive-resource check, with the blocking booking resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clearance {
    Free,
    Booked(Booking),
    OutOfService(UnitStatus),
}

impl Clearance {
    pub fn is_free(&self) -> bool {
        matches!(self, Clearance::Free)
    }
}

// ── Cart validation ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartRejection {
    MissingWindow,
    InvalidWindow { start: Ms, end: Ms },
    UnknownProduct(Ulid),
    Insufficient {
        product_id: Ulid,
        name: String,
        requested: u32,
        available: u32,
    },
}

impl std::fmt::Display for CartRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CartRejection::MissingWindow => write!(f, "select rental dates before checking out"),
            CartRejection::InvalidWindow { start, end } => {
                write!(f, "rental must end after it starts: [{start}, {end})")
            }
            CartRejection::UnknownProduct(id) => write!(f, "unknown product: {id}"),
            CartRejection::Insufficient {
                name,
                requested,
                available,
                ..
            } => write!(f, "only {available} of {name} available, {requested} requested"),
        }
    }
}

impl std::error::Error for CartRejection {}

pub fn cart_window(start: Option<Ms>, end: Option<Ms>) -> Result<Span, CartRejection> {
    let (Some(start), Some(end)) = (start, end) else {
        return Err(CartRejection::MissingWindow);
    };
    Span::try_new(start, end).ok_or(CartRejection::InvalidWindow { start, end })
}

/// Check each line on its own against current stock and stop at the first
/// line that does not fit. Repeated products are not summed here.
pub fn validate_cart<'a, F>(
    lines: &[CartLine],
    start: Option<Ms>,
    end: Option<Ms>,
    lookup: F,
) -> Result<(), CartRejection>
where
    F: Fn(Ulid) -> Option<&'a Ledger>,
{
    let window = cart_window(start, end)?;
    for line in lines {
        let ledger = lookup(line.product_id).ok_or(CartRejection::UnknownProduct(line.product_id))?;
        let product = ledger
            .subject
            .as_product()
            .ok_or(CartRejection::UnknownProduct(line.product_id))?;
        let check = check_quantity(product.quantity, ledger, window, line.quantity, None);
        if !check.ok {
            return Err(CartRejection::Insufficient {
                product_id: product.id,
                name: product.name.clone(),
                requested: line.quantity,
                available: check.available,
            });
        }
    }
    Ok(())
}

// ── Sold-out spans ────────────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Sweep line over quantity-weighted allocations: time ranges where the
/// units held reach `capacity`. Ends sort before starts at the same instant
/// so back-to-back rentals never saturate the boundary.
pub fn saturated_spans(allocs: &[(Span, u32)], capacity: u32) -> Vec<Span> {
    if allocs.is_empty() || capacity == 0 {
        return Vec::new();
    }

    let mut events: Vec<(Ms, i64)> = Vec::with_capacity(allocs.len() * 2);
    for (span, qty) in allocs {
        events.push((span.start, i64::from(*qty)));
        events.push((span.end, -i64::from(*qty)));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let capacity = i64::from(capacity);
    let mut result = Vec::new();
    let mut count: i64 = 0;
    let mut saturated_start: Option<Ms> = None;

    for (time, delta) in &events {
        count += delta;
        if count >= capacity && saturated_start.is_none() {
            saturated_start = Some(*time);
        } else if count < capacity
            && let Some(start) = saturated_start.take()
            && *time > start
        {
            result.push(Span::new(start, *time));
        }
    }

    merge_overlapping(&result)
}

/// Sub-spans of `window` in which no unit of the product is free.
pub fn sold_out_spans<S: ReservationSource + ?Sized>(
    total: u32,
    source: &S,
    window: Span,
) -> Vec<Span> {
    if total == 0 {
        return vec![window];
    }
    let allocs: Vec<(Span, u32)> = source
        .candidates(window)
        .filter(|r| counts_against(r, &window, None))
        .map(|r| (r.span, r.quantity))
        .collect();
    saturated_spans(&allocs, total)
        .into_iter()
        .filter(|s| s.overlaps(&window))
        .map(|s| s.clamp_to(&window))
        .collect()
}
