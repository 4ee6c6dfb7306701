mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{
    Blocker, CartRejection, Clearance, QuantityCheck, ReservationSource, available_quantity,
    booked_quantity, cart_window, check_quantity, exclusive_blocker, first_conflict,
    merge_overlapping, saturated_spans, sold_out_spans, stock_level, validate_cart,
};
pub use error::EngineError;
pub use queries::BookingIssue;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use conflict::LedgerGuards;

pub type SharedLedger = Arc<RwLock<Ledger>>;
pub type SharedBooking = Arc<RwLock<Booking>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Every append that is already queued when the first one
/// arrives joins the same batch and shares one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Control commands must observe every append queued before them.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        // Nobody in this batch gets an ack, so none of its bytes may survive.
        tracing::error!(error = %e, events = batch.len(), "WAL batch failed, rolling back");
        if let Err(e) = wal.rollback() {
            tracing::error!(error = %e, path = %wal.path().display(), "WAL rollback failed");
        }
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Event routing ────────────────────────────────────────────────

/// Ledger targeted by a catalog update event.
fn subject_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ProductUpdated(p) => Some(p.id),
        Event::StaffActiveChanged { id, .. } | Event::EquipmentStatusChanged { id, .. } => Some(*id),
        _ => None,
    }
}

/// Booking targeted by a booking update event.
fn booking_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingStatusChanged { id, .. } | Event::BookingRescheduled { id, .. } => Some(*id),
        Event::ResourceAssigned { booking_id, .. } | Event::ResourceReleased { booking_id, .. } => {
            Some(*booking_id)
        }
        _ => None,
    }
}

fn creation_event(subject: &Subject) -> Event {
    match subject {
        Subject::Product(p) => Event::ProductCreated(p.clone()),
        Subject::Studio(s) => Event::StudioCreated(s.clone()),
        Subject::Staff(s) => Event::StaffCreated(s.clone()),
        Subject::Equipment(e) => Event::EquipmentCreated(e.clone()),
    }
}

/// In-memory state rebuilt from the WAL before it is shared.
#[derive(Default)]
struct Replay {
    ledgers: HashMap<Ulid, Ledger>,
    bookings: HashMap<Ulid, Booking>,
}

impl Replay {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::ProductCreated(p) => self.add(Subject::Product(p.clone())),
            Event::StudioCreated(s) => self.add(Subject::Studio(s.clone())),
            Event::StaffCreated(s) => self.add(Subject::Staff(s.clone())),
            Event::EquipmentCreated(e) => self.add(Subject::Equipment(e.clone())),
            Event::BookingPlaced(booking) => {
                self.sync(booking, &booking.ledger_ids());
                self.bookings.insert(booking.id, booking.clone());
            }
            other => {
                if let Some(id) = subject_id(other)
                    && let Some(ledger) = self.ledgers.get_mut(&id)
                {
                    other.apply_to_subject(&mut ledger.subject);
                }
                if let Some(id) = booking_id(other)
                    && let Some(mut booking) = self.bookings.remove(&id)
                {
                    let mut touched = booking.ledger_ids();
                    other.apply_to_booking(&mut booking);
                    touched.extend(booking.ledger_ids());
                    self.sync(&booking, &touched);
                    self.bookings.insert(id, booking);
                }
            }
        }
    }

    fn add(&mut self, subject: Subject) {
        self.ledgers.insert(subject.id(), Ledger::new(subject));
    }

    fn sync(&mut self, booking: &Booking, ledger_ids: &[Ulid]) {
        for id in ledger_ids {
            if let Some(ledger) = self.ledgers.get_mut(id) {
                ledger.sync(booking);
            }
        }
    }
}

pub struct Engine {
    pub(super) ledgers: DashMap<Ulid, SharedLedger>,
    pub(super) bookings: DashMap<Ulid, SharedBooking>,
    /// Equipment serial number → unit id.
    pub(super) serials: DashMap<String, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared for their whole check-and-commit; compaction
    /// takes it exclusively so its snapshot cannot miss an acknowledged append.
    pub(super) commit_gate: RwLock<()>,
    /// Bumped once per committed event.
    revision: AtomicU64,
    /// Most reservations a single ledger may hold before new ones are refused.
    pub(super) reservation_cap: usize,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut replay = Replay::default();
        for event in &events {
            replay.apply(event);
        }

        let serials = DashMap::new();
        let ledgers = DashMap::new();
        for (id, ledger) in replay.ledgers {
            if let Subject::Equipment(unit) = &ledger.subject {
                serials.insert(unit.serial_number.clone(), id);
            }
            ledgers.insert(id, Arc::new(RwLock::new(ledger)));
        }
        let bookings = replay
            .bookings
            .into_iter()
            .map(|(id, b)| (id, Arc::new(RwLock::new(b))))
            .collect();

        if !events.is_empty() {
            tracing::debug!(events = events.len(), path = %wal_path.display(), "replayed WAL");
        }

        Ok(Self {
            ledgers,
            bookings,
            serials,
            wal_tx,
            commit_gate: RwLock::new(()),
            revision: AtomicU64::new(events.len() as u64),
            reservation_cap: crate::limits::MAX_RESERVATIONS_PER_LEDGER,
        })
    }

    /// Monotonic counter of committed changes. Pass the value observed at
    /// check time to `place_booking` to detect a stale check.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Durably record an event. Callers apply it to memory afterwards.
    pub(super) async fn persist(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.revision.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Persist a booking event, then apply it to the booking and every locked ledger.
    pub(super) async fn commit_booking_event(
        &self,
        booking: &mut Booking,
        guards: &mut LedgerGuards,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.persist(event).await?;
        event.apply_to_booking(booking);
        for guard in guards.values_mut() {
            guard.sync(booking);
        }
        Ok(())
    }

    pub fn get_ledger(&self, id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.get(id).map(|e| e.value().clone())
    }

    pub(super) fn get_shared_booking(&self, id: &Ulid) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    /// Write-lock ledgers in ascending id order. Every multi-ledger writer
    /// goes through here so lock order is global.
    pub(super) async fn lock_ledgers(&self, ids: &[Ulid]) -> Result<LedgerGuards, EngineError> {
        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guards = BTreeMap::new();
        for id in sorted {
            let ledger = self.get_ledger(&id).ok_or(EngineError::NotFound(id))?;
            guards.insert(id, ledger.write_owned().await);
        }
        Ok(guards)
    }

    /// Read-lock the ledgers that exist, in ascending id order.
    pub(super) async fn read_ledgers(
        &self,
        ids: impl IntoIterator<Item = Ulid>,
    ) -> BTreeMap<Ulid, OwnedRwLockReadGuard<Ledger>> {
        let mut sorted: Vec<Ulid> = ids.into_iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut guards = BTreeMap::new();
        for id in sorted {
            if let Some(ledger) = self.get_ledger(&id) {
                guards.insert(id, ledger.read_owned().await);
            }
        }
        guards
    }

    /// Booking locks are always taken before any ledger lock.
    pub(super) async fn lock_booking(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<Booking>, EngineError> {
        let booking = self.get_shared_booking(&id).ok_or(EngineError::NotFound(id))?;
        Ok(booking.write_owned().await)
    }
}
