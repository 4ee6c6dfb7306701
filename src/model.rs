use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC). The only time type.
pub type Ms = i64;

/// Money in minor currency units.
pub type Minor = u64;

pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// The one overlap test: `self.start < other.end && other.start < self.end`.
    /// Back-to-back spans share no instant and do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn clamp_to(&self, window: &Span) -> Span {
        Span::new(self.start.max(window.start), self.end.min(window.end))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

// ── Booking lifecycle ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Draft,
    QuotationSent,
    PendingDeposit,
    Approved,
    Active,
    Completed,
    Problem,
}

/// Statuses whose reservations consume stock and occupy resources.
/// Every availability check in the crate goes through this set.
pub const BLOCKING_STATUSES: [BookingStatus; 5] = [
    BookingStatus::Draft,
    BookingStatus::QuotationSent,
    BookingStatus::PendingDeposit,
    BookingStatus::Approved,
    BookingStatus::Active,
];

impl BookingStatus {
    pub fn is_blocking(self) -> bool {
        BLOCKING_STATUSES.contains(&self)
    }

    /// Linear path draft → … → completed; anything but completed may drop
    /// to problem; problem only resets to draft.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Draft, QuotationSent)
                | (QuotationSent, PendingDeposit)
                | (PendingDeposit, Approved)
                | (Approved, Active)
                | (Active, Completed)
                | (Draft | QuotationSent | PendingDeposit | Approved | Active, Problem)
                | (Problem, Draft)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Draft => "draft",
            BookingStatus::QuotationSent => "quotation_sent",
            BookingStatus::PendingDeposit => "pending_deposit",
            BookingStatus::Approved => "approved",
            BookingStatus::Active => "active",
            BookingStatus::Completed => "completed",
            BookingStatus::Problem => "problem",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "draft" => Ok(BookingStatus::Draft),
            "quotation_sent" => Ok(BookingStatus::QuotationSent),
            "pending_deposit" => Ok(BookingStatus::PendingDeposit),
            "approved" => Ok(BookingStatus::Approved),
            "active" => Ok(BookingStatus::Active),
            "completed" => Ok(BookingStatus::Completed),
            "problem" => Ok(BookingStatus::Problem),
            _ => Err(ParseEnumError { kind: "booking status", value: s.to_string() }),
        }
    }
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Camera,
    Lens,
    Lighting,
    Sound,
    Grip,
    Other,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Camera => "camera",
            Category::Lens => "lens",
            Category::Lighting => "lighting",
            Category::Sound => "sound",
            Category::Grip => "grip",
            Category::Other => "other",
        }
    }
}

impl FromStr for Category {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "camera" => Ok(Category::Camera),
            "lens" => Ok(Category::Lens),
            "lighting" => Ok(Category::Lighting),
            "sound" => Ok(Category::Sound),
            "grip" => Ok(Category::Grip),
            "other" => Ok(Category::Other),
            _ => Err(ParseEnumError { kind: "category", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    Cameraman,
    Sound,
    Lighting,
    Producer,
}

impl FromStr for Position {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cameraman" => Ok(Position::Cameraman),
            "sound" => Ok(Position::Sound),
            "lighting" => Ok(Position::Lighting),
            "producer" => Ok(Position::Producer),
            _ => Err(ParseEnumError { kind: "position", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Available,
    Maintenance,
    Lost,
}

impl UnitStatus {
    /// Maintenance and lost units can never be attached to a booking.
    pub fn in_service(self) -> bool {
        self == UnitStatus::Available
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Available => "available",
            UnitStatus::Maintenance => "maintenance",
            UnitStatus::Lost => "lost",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "available" => Ok(UnitStatus::Available),
            "maintenance" => Ok(UnitStatus::Maintenance),
            "lost" => Ok(UnitStatus::Lost),
            _ => Err(ParseEnumError { kind: "equipment status", value: s.to_string() }),
        }
    }
}

/// Kinds of uniquely identified resources. Products are fungible and not listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Studio,
    Staff,
    Equipment,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Studio => "studio",
            ResourceKind::Staff => "staff",
            ResourceKind::Equipment => "equipment",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "studio" | "studios" => Ok(ResourceKind::Studio),
            "staff" => Ok(ResourceKind::Staff),
            "equipment" => Ok(ResourceKind::Equipment),
            _ => Err(ParseEnumError { kind: "resource kind", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: Ulid,
    pub name: String,
    pub category: Category,
    /// Rental price per day.
    pub price: Minor,
    /// Units owned. Bookings never decrement this.
    pub quantity: u32,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Studio {
    pub id: Ulid,
    pub name: String,
    pub daily_rate: Minor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: Ulid,
    pub name: String,
    pub position: Position,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentUnit {
    pub id: Ulid,
    /// `None` only for units imported without a product.
    pub product_id: Option<Ulid>,
    pub serial_number: String,
    pub status: UnitStatus,
}

/// What a ledger tracks reservations for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Subject {
    Product(Product),
    Studio(Studio),
    Staff(StaffMember),
    Equipment(EquipmentUnit),
}

impl Subject {
    pub fn id(&self) -> Ulid {
        match self {
            Subject::Product(p) => p.id,
            Subject::Studio(s) => s.id,
            Subject::Staff(s) => s.id,
            Subject::Equipment(e) => e.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Subject::Product(p) => &p.name,
            Subject::Studio(s) => &s.name,
            Subject::Staff(s) => &s.name,
            Subject::Equipment(e) => &e.serial_number,
        }
    }

    /// `None` for products.
    pub fn resource_kind(&self) -> Option<ResourceKind> {
        match self {
            Subject::Product(_) => None,
            Subject::Studio(_) => Some(ResourceKind::Studio),
            Subject::Staff(_) => Some(ResourceKind::Staff),
            Subject::Equipment(_) => Some(ResourceKind::Equipment),
        }
    }

    pub fn as_product(&self) -> Option<&Product> {
        match self {
            Subject::Product(p) => Some(p),
            _ => None,
        }
    }

    pub fn unit_status(&self) -> Option<UnitStatus> {
        match self {
            Subject::Equipment(e) => Some(e.status),
            _ => None,
        }
    }
}

// ── Ledgers ──────────────────────────────────────────────────────

/// One booking's claim on one ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub booking_id: Ulid,
    pub span: Span,
    /// Units for products, always 1 for exclusive resources.
    pub quantity: u32,
    pub status: BookingStatus,
}

/// Per-product or per-resource reservation list.
#[derive(Debug, Clone)]
pub struct Ledger {
    pub subject: Subject,
    /// Sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl Ledger {
    pub fn new(subject: Subject) -> Self {
        Self {
            subject,
            reservations: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.subject.id()
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove(&mut self, booking_id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.booking_id == booking_id)?;
        Some(self.reservations.remove(pos))
    }

    /// Replace this ledger's reservation for `booking` with what the booking now claims.
    pub fn sync(&mut self, booking: &Booking) {
        self.remove(booking.id);
        if let Some(reservation) = booking.reservation_on(self.id()) {
            self.insert(reservation);
        }
    }

    /// Reservations whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.overlaps(&query))
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
}

impl Customer {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phone: None,
            email: None,
            address: None,
        }
    }
}

/// What the customer ordered, priced when the booking was placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingItem {
    pub product_id: Ulid,
    pub quantity: u32,
    pub unit_price: Minor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: Ulid,
    pub quantity: u32,
}

impl CartLine {
    pub fn new(product_id: Ulid, quantity: u32) -> Self {
        Self { product_id, quantity }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub customer: Customer,
    pub span: Span,
    pub status: BookingStatus,
    pub created_by: Option<String>,
    pub created_at: Ms,
    pub items: Vec<BookingItem>,
    /// Assigned studios, staff and equipment units.
    pub resources: Vec<Ulid>,
}

impl Booking {
    pub fn quantity_of(&self, product_id: Ulid) -> u32 {
        self.items
            .iter()
            .filter(|i| i.product_id == product_id)
            .map(|i| i.quantity)
            .sum()
    }

    /// Per-product totals, in first-seen order.
    pub fn product_totals(&self) -> Vec<(Ulid, u32)> {
        let mut totals: Vec<(Ulid, u32)> = Vec::new();
        for item in &self.items {
            match totals.iter_mut().find(|(id, _)| *id == item.product_id) {
                Some((_, qty)) => *qty += item.quantity,
                None => totals.push((item.product_id, item.quantity)),
            }
        }
        totals
    }

    /// Every ledger this booking reserves on, sorted and deduplicated.
    pub fn ledger_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self
            .items
            .iter()
            .map(|i| i.product_id)
            .chain(self.resources.iter().copied())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn reservation_on(&self, ledger_id: Ulid) -> Option<Reservation> {
        let quantity = self.quantity_of(ledger_id)
            + u32::from(self.resources.contains(&ledger_id));
        (quantity > 0).then(|| Reservation {
            booking_id: self.id,
            span: self.span,
            quantity,
            status: self.status,
        })
    }
}

/// A booking request before it is committed.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub id: Ulid,
    pub customer: Customer,
    pub span: Span,
    pub created_by: Option<String>,
    pub lines: Vec<CartLine>,
    pub resources: Vec<Ulid>,
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProductCreated(Product),
    ProductUpdated(Product),
    StudioCreated(Studio),
    StaffCreated(StaffMember),
    StaffActiveChanged {
        id: Ulid,
        active: bool,
    },
    EquipmentCreated(EquipmentUnit),
    EquipmentStatusChanged {
        id: Ulid,
        status: UnitStatus,
    },
    /// Carries the whole booking so compaction can emit one event per booking.
    BookingPlaced(Booking),
    BookingStatusChanged {
        id: Ulid,
        status: BookingStatus,
    },
    BookingRescheduled {
        id: Ulid,
        span: Span,
    },
    ResourceAssigned {
        booking_id: Ulid,
        resource_id: Ulid,
    },
    ResourceReleased {
        booking_id: Ulid,
        resource_id: Ulid,
    },
}

impl Event {
    /// Apply a catalog event to the ledger it targets. Booking events are no-ops here.
    pub fn apply_to_subject(&self, subject: &mut Subject) {
        match (self, subject) {
            (Event::ProductUpdated(p), Subject::Product(current)) if p.id == current.id => {
                *current = p.clone();
            }
            (Event::StaffActiveChanged { id, active }, Subject::Staff(s)) if *id == s.id => {
                s.active = *active;
            }
            (Event::EquipmentStatusChanged { id, status }, Subject::Equipment(e)) if *id == e.id => {
                e.status = *status;
            }
            _ => {}
        }
    }

    /// Apply a booking event to the booking it targets. Catalog events are no-ops here.
    pub fn apply_to_booking(&self, booking: &mut Booking) {
        match self {
            Event::BookingStatusChanged { id, status } if *id == booking.id => {
                booking.status = *status;
            }
            Event::BookingRescheduled { id, span } if *id == booking.id => {
                booking.span = *span;
            }
            Event::ResourceAssigned { booking_id, resource_id } if *booking_id == booking.id => {
                if !booking.resources.contains(resource_id) {
                    booking.resources.push(*resource_id);
                }
            }
            Event::ResourceReleased { booking_id, resource_id } if *booking_id == booking.id => {
                booking.resources.retain(|r| r != resource_id);
            }
            _ => {}
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockLevel {
    pub total: u32,
    pub booked: u32,
    pub available: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryRow {
    pub product_id: Ulid,
    pub name: String,
    pub category: Category,
    pub total: u32,
    pub booked: u32,
    pub available: u32,
}
