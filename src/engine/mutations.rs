use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{
    Gate, booking_window, check_booking_fits, check_reservation_room, check_resource, now_ms,
};
use super::{Engine, EngineError, WalCommand, creation_event};

fn check_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::LimitExceeded(what));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_customer(customer: &Customer) -> Result<(), EngineError> {
    check_name(&customer.name, "customer name required")?;
    let optional = [&customer.phone, &customer.email, &customer.address];
    if optional
        .iter()
        .filter_map(|f| f.as_deref())
        .any(|f| f.len() > MAX_CUSTOMER_FIELD_LEN)
    {
        return Err(EngineError::LimitExceeded("customer field too long"));
    }
    Ok(())
}

impl Engine {
    // ── Catalog ──────────────────────────────────────────────

    async fn add_subject(&self, subject: Subject) -> Result<(), EngineError> {
        if self.ledgers.len() >= MAX_LEDGERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many catalog entries"));
        }
        let id = subject.id();
        if self.ledgers.contains_key(&id) || self.bookings.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let _gate = self.commit_gate.read().await;
        self.persist(&creation_event(&subject)).await?;
        self.ledgers.insert(id, Arc::new(RwLock::new(Ledger::new(subject))));
        Ok(())
    }

    pub async fn create_product(&self, product: Product) -> Result<(), EngineError> {
        check_name(&product.name, "product name required")?;
        let id = product.id;
        self.add_subject(Subject::Product(product)).await?;
        info!(%id, "product created");
        Ok(())
    }

    /// Replace a product's catalog fields. Lowering the quantity below what
    /// is already booked is allowed; availability floors at zero.
    pub async fn update_product(&self, product: Product) -> Result<(), EngineError> {
        check_name(&product.name, "product name required")?;
        let id = product.id;
        let ledger = self.get_ledger(&id).ok_or(EngineError::NotFound(id))?;
        let _gate = self.commit_gate.read().await;
        let mut guard = ledger.write_owned().await;
        if guard.subject.as_product().is_none() {
            return Err(EngineError::WrongKind { id, expected: "product" });
        }

        let event = Event::ProductUpdated(product);
        self.persist(&event).await?;
        event.apply_to_subject(&mut guard.subject);
        Ok(())
    }

    pub async fn create_studio(&self, studio: Studio) -> Result<(), EngineError> {
        check_name(&studio.name, "studio name required")?;
        self.add_subject(Subject::Studio(studio)).await
    }

    pub async fn create_staff(&self, staff: StaffMember) -> Result<(), EngineError> {
        check_name(&staff.name, "staff name required")?;
        self.add_subject(Subject::Staff(staff)).await
    }

    pub async fn set_staff_active(&self, id: Ulid, active: bool) -> Result<(), EngineError> {
        let ledger = self.get_ledger(&id).ok_or(EngineError::NotFound(id))?;
        let _gate = self.commit_gate.read().await;
        let mut guard = ledger.write_owned().await;
        if !matches!(guard.subject, Subject::Staff(_)) {
            return Err(EngineError::WrongKind { id, expected: "staff member" });
        }

        let event = Event::StaffActiveChanged { id, active };
        self.persist(&event).await?;
        event.apply_to_subject(&mut guard.subject);
        Ok(())
    }

    pub async fn create_equipment(&self, unit: EquipmentUnit) -> Result<(), EngineError> {
        let serial = unit.serial_number.trim().to_string();
        if serial.is_empty() {
            return Err(EngineError::LimitExceeded("serial number required"));
        }
        if serial.len() > MAX_SERIAL_LEN {
            return Err(EngineError::LimitExceeded("serial number too long"));
        }
        if let Some(product_id) = unit.product_id {
            let ledger = self.get_ledger(&product_id).ok_or(EngineError::NotFound(product_id))?;
            if ledger.read().await.subject.as_product().is_none() {
                return Err(EngineError::WrongKind { id: product_id, expected: "product" });
            }
        }

        let id = unit.id;
        match self.serials.entry(serial.clone()) {
            Entry::Occupied(_) => return Err(EngineError::DuplicateSerial(serial)),
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let unit = EquipmentUnit { serial_number: serial.clone(), ..unit };
        if let Err(e) = self.add_subject(Subject::Equipment(unit)).await {
            self.serials.remove_if(&serial, |_, owner| *owner == id);
            return Err(e);
        }
        Ok(())
    }

    pub async fn set_equipment_status(&self, id: Ulid, status: UnitStatus) -> Result<(), EngineError> {
        let ledger = self.get_ledger(&id).ok_or(EngineError::NotFound(id))?;
        let _gate = self.commit_gate.read().await;
        let mut guard = ledger.write_owned().await;
        if !matches!(guard.subject, Subject::Equipment(_)) {
            return Err(EngineError::WrongKind { id, expected: "equipment unit" });
        }

        let event = Event::EquipmentStatusChanged { id, status };
        self.persist(&event).await?;
        event.apply_to_subject(&mut guard.subject);
        info!(%id, %status, "equipment status changed");
        Ok(())
    }

    /// Create `PREFIX-001`, `PREFIX-002`, … units for a product until its unit
    /// count matches its total quantity. Serials already taken are skipped.
    pub async fn stock_units(&self, product_id: Ulid, prefix: &str) -> Result<Vec<Ulid>, EngineError> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(EngineError::LimitExceeded("serial prefix required"));
        }
        if prefix.len() + 8 > MAX_SERIAL_LEN {
            return Err(EngineError::LimitExceeded("serial prefix too long"));
        }

        let ledger = self.get_ledger(&product_id).ok_or(EngineError::NotFound(product_id))?;
        let quantity = match ledger.read().await.subject.as_product() {
            Some(p) => p.quantity as usize,
            None => return Err(EngineError::WrongKind { id: product_id, expected: "product" }),
        };

        let existing = self.units_of(product_id).await.len();
        let wanted = quantity.saturating_sub(existing);
        if wanted > MAX_UNITS_PER_STOCKING {
            return Err(EngineError::LimitExceeded("too many units to stock at once"));
        }

        let mut created = Vec::with_capacity(wanted);
        let mut n = 0usize;
        while created.len() < wanted {
            n += 1;
            let serial_number = format!("{prefix}-{n:03}");
            if self.serials.contains_key(&serial_number) {
                continue;
            }
            let unit = EquipmentUnit {
                id: Ulid::new(),
                product_id: Some(product_id),
                serial_number,
                status: UnitStatus::Available,
            };
            let id = unit.id;
            match self.create_equipment(unit).await {
                Ok(()) => created.push(id),
                Err(EngineError::DuplicateSerial(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        if !created.is_empty() {
            info!(%product_id, created = created.len(), "stocked equipment units");
        }
        Ok(created)
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Check and commit a new booking in one step. All ledgers it touches
    /// stay write-locked from the check until the event is applied.
    ///
    /// `expected_revision` is the `revision()` the caller saw when it last
    /// checked availability. If the commit-time check fails and the engine
    /// has moved on since, the failure is reported as `ConcurrentConflict`.
    pub async fn place_booking(
        &self,
        request: NewBooking,
        expected_revision: Option<u64>,
    ) -> Result<Booking, EngineError> {
        let result = self.place_booking_inner(request, expected_revision).await;
        metrics::counter!(
            observability::CHECKOUTS_TOTAL,
            "outcome" => observability::checkout_outcome(&result)
        )
        .increment(1);
        match &result {
            Ok(booking) => info!(id = %booking.id, items = booking.items.len(), "booking placed"),
            Err(e) => debug!(error = %e, "booking rejected"),
        }
        result
    }

    async fn place_booking_inner(
        &self,
        request: NewBooking,
        expected_revision: Option<u64>,
    ) -> Result<Booking, EngineError> {
        let NewBooking { id, customer, span, created_by, lines, mut resources } = request;

        booking_window(span.start, span.end)?;
        check_customer(&customer)?;
        if lines.len() > MAX_LINES_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many booking lines"));
        }
        if lines.iter().any(|l| l.quantity == 0 || l.quantity > MAX_LINE_QUANTITY) {
            return Err(EngineError::LimitExceeded("line quantity out of range"));
        }
        let mut seen = std::collections::HashSet::new();
        resources.retain(|r| seen.insert(*r));
        if resources.len() > MAX_RESOURCES_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if lines.is_empty() && resources.is_empty() {
            return Err(EngineError::EmptyBooking);
        }
        if self.bookings.len() >= MAX_BOOKINGS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }
        if self.bookings.contains_key(&id) || self.ledgers.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let _gate = self.commit_gate.read().await;
        let ledger_ids: Vec<Ulid> = lines
            .iter()
            .map(|l| l.product_id)
            .chain(resources.iter().copied())
            .collect();
        let mut guards = self.lock_ledgers(&ledger_ids).await?;
        check_reservation_room(guards.values().map(|g| &**g), self.reservation_cap)?;
        let observed = self.revision();

        let mut items = Vec::with_capacity(lines.len());
        for line in &lines {
            let product = guards
                .get(&line.product_id)
                .and_then(|g| g.subject.as_product())
                .ok_or(EngineError::WrongKind { id: line.product_id, expected: "product" })?;
            items.push(BookingItem {
                product_id: line.product_id,
                quantity: line.quantity,
                unit_price: product.price,
            });
        }

        let booking = Booking {
            id,
            customer,
            span,
            status: BookingStatus::Draft,
            created_by,
            created_at: now_ms(),
            items,
            resources,
        };

        if let Err(e) = check_booking_fits(
            &guards,
            &booking.product_totals(),
            &booking.resources,
            span,
            None,
            Gate::NewAttachment,
        ) {
            return Err(match expected_revision {
                Some(rev) if rev != observed && e.is_availability_failure() => {
                    EngineError::ConcurrentConflict
                }
                _ => e,
            });
        }

        self.persist(&Event::BookingPlaced(booking.clone())).await?;
        for guard in guards.values_mut() {
            guard.sync(&booking);
        }
        self.bookings.insert(id, Arc::new(RwLock::new(booking.clone())));
        Ok(booking)
    }

    pub async fn transition_booking(&self, id: Ulid, next: BookingStatus) -> Result<Booking, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut booking = self.lock_booking(id).await?;
        let from = booking.status;
        if !from.can_transition_to(next) {
            return Err(EngineError::InvalidTransition { from, to: next });
        }

        let mut guards = self.lock_ledgers(&booking.ledger_ids()).await?;
        // Reviving a booking: whatever it held may have been taken meanwhile.
        if !from.is_blocking() && next.is_blocking() {
            check_booking_fits(
                &guards,
                &booking.product_totals(),
                &booking.resources,
                booking.span,
                Some(id),
                Gate::Existing,
            )?;
        }

        let event = Event::BookingStatusChanged { id, status: next };
        self.commit_booking_event(&mut booking, &mut guards, &event).await?;
        info!(%id, %from, to = %next, "booking status changed");
        Ok(booking.clone())
    }

    pub async fn reschedule_booking(&self, id: Ulid, start: Ms, end: Ms) -> Result<Booking, EngineError> {
        let span = booking_window(start, end)?;
        let _gate = self.commit_gate.read().await;
        let mut booking = self.lock_booking(id).await?;
        if booking.status == BookingStatus::Completed {
            return Err(EngineError::BookingFrozen(id));
        }

        let mut guards = self.lock_ledgers(&booking.ledger_ids()).await?;
        if booking.status.is_blocking() {
            check_booking_fits(
                &guards,
                &booking.product_totals(),
                &booking.resources,
                span,
                Some(id),
                Gate::Existing,
            )?;
        }

        let event = Event::BookingRescheduled { id, span };
        self.commit_booking_event(&mut booking, &mut guards, &event).await?;
        info!(%id, start, end, "booking rescheduled");
        Ok(booking.clone())
    }

    /// Attach a studio, staff member or equipment unit to a booking.
    pub async fn assign_resource(&self, booking_id: Ulid, resource_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut booking = self.lock_booking(booking_id).await?;
        if booking.status == BookingStatus::Completed {
            return Err(EngineError::BookingFrozen(booking_id));
        }
        if booking.resources.contains(&resource_id) {
            return Err(EngineError::AlreadyExists(resource_id));
        }
        if booking.resources.len() >= MAX_RESOURCES_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let mut guards = self.lock_ledgers(&[resource_id]).await?;
        if let Some(ledger) = guards.get(&resource_id) {
            check_resource(ledger, booking.span, Some(booking_id), Gate::NewAttachment)?;
            check_reservation_room([&**ledger], self.reservation_cap)?;
        }

        let event = Event::ResourceAssigned { booking_id, resource_id };
        self.commit_booking_event(&mut booking, &mut guards, &event).await?;
        info!(%booking_id, %resource_id, "resource assigned");
        Ok(())
    }

    pub async fn release_resource(&self, booking_id: Ulid, resource_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut booking = self.lock_booking(booking_id).await?;
        if booking.status == BookingStatus::Completed {
            return Err(EngineError::BookingFrozen(booking_id));
        }
        if !booking.resources.contains(&resource_id) {
            return Err(EngineError::NotFound(resource_id));
        }

        let mut guards = self.lock_ledgers(&[resource_id]).await?;
        let event = Event::ResourceReleased { booking_id, resource_id };
        self.commit_booking_event(&mut booking, &mut guards, &event).await?;
        info!(%booking_id, %resource_id, "resource released");
        Ok(())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as one creation event per catalog entry followed by
    /// one placement per booking.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let ledgers: Vec<_> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        let bookings: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();

        let mut events = Vec::with_capacity(ledgers.len() + bookings.len());
        for ledger in ledgers {
            events.push(creation_event(&ledger.read().await.subject));
        }
        for booking in bookings {
            events.push(Event::BookingPlaced(booking.read().await.clone()));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
