mod admission;
mod error;
mod mutations;
mod queries;

pub use admission::{
    Admission, Decision, PRIOR_BOOKINGS_CONSIDERED, days_between, evaluate, extends_streak, find_overlap,
    normalize, parse_date, parse_time,
};
pub use error::{EngineError, Rejection};
pub use queries::BookingFilter;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedAmenityState = Arc<RwLock<AmenityState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// One commit. Its events land in a single WAL entry.
    Append {
        events: Vec<Event>,
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

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then issues a single fsync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { events, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch: Vec<PendingAppend> = vec![(events, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        // Compaction must observe every append queued ahead of it.
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(events, _)| wal.append_buffered(events));
    // Flush even after a failed append so stray buffered bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            let mut batch = vec![(events, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Booking store: one lock per amenity, a WAL for durability, and a notify hub.
///
/// Admission for an amenity runs entirely under that amenity's write lock,
/// so the read-then-insert sequence cannot interleave with another request
/// for the same amenity.
pub struct Engine {
    pub(super) amenities: DashMap<AmenityId, SharedAmenityState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → amenity id
    pub(super) booking_to_amenity: DashMap<Ulid, AmenityId>,
}

/// Apply an event to an amenity's state. Caller holds the lock.
fn apply_to_amenity(state: &mut AmenityState, event: &Event, index: &DashMap<Ulid, AmenityId>) {
    match event {
        Event::BookingRequested {
            id,
            resident_id,
            resident_name,
            resident_email,
            amenity_id,
            date,
            slot,
            created_at,
        } => {
            state.insert_booking(BookingRecord {
                id: *id,
                resident_id: resident_id.clone(),
                resident_name: resident_name.clone(),
                resident_email: resident_email.clone(),
                amenity_id: amenity_id.clone(),
                date: *date,
                slot: *slot,
                status: BookingStatus::Pending,
                created_at: *created_at,
            });
            index.insert(*id, amenity_id.clone());
        }
        Event::BookingConfirmed { id, .. } => {
            if let Some(b) = state.get_mut(*id) {
                b.status = BookingStatus::Confirmed;
            }
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(b) = state.get_mut(*id) {
                b.status = BookingStatus::Cancelled;
            }
        }
        Event::BookingRescheduled { id, slot, .. } => {
            if let Some(mut b) = state.remove_booking(*id) {
                b.slot = *slot;
                state.insert_booking(b);
            }
        }
        Event::BookingDeleted { id, .. } => {
            state.remove_booking(*id);
            index.remove(id);
        }
        Event::ContactUpdated {
            id,
            resident_name,
            resident_email,
            ..
        } => {
            if let Some(b) = state.get_mut(*id) {
                b.resident_name = resident_name.clone();
                b.resident_email = resident_email.clone();
            }
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let booking_to_amenity = DashMap::new();
        let mut replayed: std::collections::HashMap<AmenityId, AmenityState> =
            std::collections::HashMap::new();
        for event in &events {
            let amenity_id = event.amenity_id();
            let state = replayed
                .entry(amenity_id.to_string())
                .or_insert_with(|| AmenityState::new(amenity_id.to_string()));
            apply_to_amenity(state, event, &booking_to_amenity);
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events into {} amenities from {}",
                events.len(),
                replayed.len(),
                wal_path.display()
            );
        }

        let amenities = DashMap::new();
        for (id, state) in replayed {
            if !state.is_empty() {
                amenities.insert(id, Arc::new(RwLock::new(state)));
            }
        }

        Ok(Self {
            amenities,
            wal_tx,
            notify,
            booking_to_amenity,
        })
    }

    /// Write one commit to the WAL via the background group-commit writer.
    async fn wal_append(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_amenity(&self, id: &str) -> Option<SharedAmenityState> {
        self.amenities.get(id).map(|e| e.value().clone())
    }

    pub fn get_amenity_for_booking(&self, booking_id: &Ulid) -> Option<AmenityId> {
        self.booking_to_amenity.get(booking_id).map(|e| e.value().clone())
    }

    pub fn amenity_count(&self) -> usize {
        self.amenities.len()
    }

    /// WAL-append + apply + notify in one call. The events are one commit:
    /// either all of them are logged and applied or none are.
    pub(super) async fn persist_and_apply(
        &self,
        state: &mut AmenityState,
        events: &[Event],
    ) -> Result<(), EngineError> {
        if events.is_empty() {
            return Ok(());
        }
        self.wal_append(events).await?;
        for event in events {
            apply_to_amenity(state, event, &self.booking_to_amenity);
        }
        for event in events {
            self.notify.send(&state.id, event);
        }
        Ok(())
    }

    /// Lookup booking → amenity, acquire the amenity's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(SharedAmenityState, OwnedRwLockWriteGuard<AmenityState>), EngineError> {
        let amenity_id = self
            .get_amenity_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let state = self
            .get_amenity(&amenity_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let guard = state.clone().write_owned().await;
        Ok((state, guard))
    }

    /// Whether `shared` is still the live state for its amenity. An amenity
    /// whose state was retired while a caller waited on its lock must be
    /// looked up again.
    pub(super) fn is_live(&self, amenity_id: &str, shared: &SharedAmenityState) -> bool {
        self.get_amenity(amenity_id)
            .is_some_and(|current| Arc::ptr_eq(&current, shared))
    }

    /// Drop an amenity that holds no bookings. Caller holds its write lock,
    /// so nobody can insert into it between the check and the removal.
    pub(super) fn retire_if_empty(&self, shared: &SharedAmenityState, state: &AmenityState) {
        if state.is_empty()
            && self
                .amenities
                .remove_if(&state.id, |_, current| Arc::ptr_eq(current, shared))
                .is_some()
        {
            tracing::debug!("retired empty amenity {}", state.id);
        }
    }
}
