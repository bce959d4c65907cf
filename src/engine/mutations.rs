use std::sync::Arc;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock, oneshot};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::admission::{Decision, PRIOR_BOOKINGS_CONSIDERED, evaluate, find_overlap, normalize};
use super::{Engine, EngineError, Rejection, SharedAmenityState, WalCommand};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

fn validate_id(field: &str, id: &str) -> Result<(), EngineError> {
    if id.trim().is_empty() {
        return Err(Rejection::InvalidInput(format!("{field} is required")).into());
    }
    if id.len() > MAX_ID_LEN {
        return Err(EngineError::LimitExceeded("identifier too long"));
    }
    Ok(())
}

fn validate_contact(name: &str, email: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(Rejection::InvalidInput("resident_name is required".into()).into());
    }
    if name.len() > MAX_CONTACT_LEN || email.len() > MAX_CONTACT_LEN {
        return Err(EngineError::LimitExceeded("contact field too long"));
    }
    if !is_valid_email(email) {
        return Err(Rejection::InvalidInput(format!("invalid resident_email '{email}'")).into());
    }
    Ok(())
}

impl Engine {
    /// Get the amenity's state, creating it on first booking.
    fn amenity_entry(&self, amenity_id: &str) -> Result<SharedAmenityState, EngineError> {
        if let Some(state) = self.get_amenity(amenity_id) {
            return Ok(state);
        }
        if self.amenities.len() >= MAX_AMENITIES {
            return Err(EngineError::LimitExceeded("too many amenities"));
        }
        let state = self
            .amenities
            .entry(amenity_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(AmenityState::new(amenity_id.to_string()))))
            .value()
            .clone();
        Ok(state)
    }

    /// Write-lock the amenity's live state, creating it if absent.
    async fn lock_amenity(
        &self,
        amenity_id: &str,
    ) -> Result<(SharedAmenityState, OwnedRwLockWriteGuard<AmenityState>), EngineError> {
        loop {
            let shared = self.amenity_entry(amenity_id)?;
            let guard = shared.clone().write_owned().await;
            if self.is_live(amenity_id, &shared) {
                return Ok((shared, guard));
            }
        }
    }

    /// Run admission for `request` and, if accepted, store it as `Pending`.
    ///
    /// A rejected request leaves no trace: if it was the first for its
    /// amenity, the amenity is dropped again.
    pub async fn request_booking(
        &self,
        id: Ulid,
        request: BookingRequest,
    ) -> Result<BookingRecord, EngineError> {
        validate_id("resident_id", &request.resident_id)?;
        validate_id("amenity_id", &request.amenity_id)?;
        validate_contact(&request.resident_name, &request.resident_email)?;
        if self.booking_to_amenity.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let (shared, mut guard) = self.lock_amenity(&request.amenity_id).await?;
        let result = self.admit_locked(id, request, &mut guard).await;
        if result.is_err() {
            self.retire_if_empty(&shared, &guard);
        }
        result
    }

    async fn admit_locked(
        &self,
        id: Ulid,
        request: BookingRequest,
        state: &mut AmenityState,
    ) -> Result<BookingRecord, EngineError> {
        if state.len() >= MAX_BOOKINGS_PER_AMENITY {
            return Err(EngineError::LimitExceeded("too many bookings on amenity"));
        }
        if self.booking_to_amenity.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let prior = state.prior_for_resident(&request.resident_id, request.date, PRIOR_BOOKINGS_CONSIDERED);
        let candidates: Vec<BookingRecord> = state.active_on(request.date).cloned().collect();

        let admission = match evaluate(&request, &prior, &candidates) {
            Decision::Accepted(admission) => admission,
            Decision::Rejected(rejection) => {
                metrics::counter!(
                    crate::observability::ADMISSIONS_TOTAL,
                    "outcome" => rejection.label()
                )
                .increment(1);
                debug!(
                    "rejected booking {id} for {} on {} {}: {rejection}",
                    request.resident_id, request.amenity_id, request.date
                );
                return Err(rejection.into());
            }
        };

        let date = request.date;
        let event = Event::BookingRequested {
            id,
            resident_id: request.resident_id,
            resident_name: request.resident_name,
            resident_email: request.resident_email,
            amenity_id: request.amenity_id,
            date,
            slot: admission.slot(),
            created_at: now_ms(),
        };
        self.persist_and_apply(state, std::slice::from_ref(&event)).await?;
        metrics::counter!(crate::observability::ADMISSIONS_TOTAL, "outcome" => "accepted").increment(1);
        info!("admitted booking {id} on {} {date} {}", state.id, admission.label);

        state.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Apply an allowlisted update: reschedule, contact change, and/or a step
    /// along the status lifecycle. Every part is validated first, then all of
    /// them are written as one WAL entry.
    pub async fn update_booking(
        &self,
        id: Ulid,
        patch: BookingPatch,
    ) -> Result<BookingRecord, EngineError> {
        let (_, mut guard) = self.resolve_booking_write(&id).await?;
        let current = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;

        let mut events = Vec::with_capacity(3);

        if let Some(time) = &patch.time {
            if !current.is_active() {
                return Err(EngineError::NotActive(id));
            }
            let slot = normalize(time)?;
            if slot != current.slot {
                let others: Vec<BookingRecord> = guard
                    .active_on(current.date)
                    .filter(|b| b.id != id)
                    .cloned()
                    .collect();
                if let Some(existing) = find_overlap(&slot, &others) {
                    return Err(Rejection::SlotOverlap(existing.id).into());
                }
                events.push(Event::BookingRescheduled {
                    id,
                    amenity_id: current.amenity_id.clone(),
                    slot,
                });
            }
        }

        if patch.resident_name.is_some() || patch.resident_email.is_some() {
            let name = patch.resident_name.unwrap_or_else(|| current.resident_name.clone());
            let email = patch.resident_email.unwrap_or_else(|| current.resident_email.clone());
            validate_contact(&name, &email)?;
            if name != current.resident_name || email != current.resident_email {
                events.push(Event::ContactUpdated {
                    id,
                    amenity_id: current.amenity_id.clone(),
                    resident_name: name,
                    resident_email: email,
                });
            }
        }

        if let Some(next) = patch.status
            && next != current.status
        {
            if !current.status.can_transition_to(next) {
                return Err(EngineError::InvalidTransition {
                    id,
                    from: current.status,
                    to: next,
                });
            }
            let amenity_id = current.amenity_id.clone();
            events.push(match next {
                BookingStatus::Confirmed => Event::BookingConfirmed { id, amenity_id },
                _ => Event::BookingCancelled { id, amenity_id },
            });
        }

        self.persist_and_apply(&mut guard, &events).await?;
        if !events.is_empty() {
            info!("updated booking {id} ({} changes)", events.len());
        }

        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Move an active booking to another slot on the same day.
    pub async fn reschedule_booking(&self, id: Ulid, time: TimeRange) -> Result<BookingRecord, EngineError> {
        self.update_booking(
            id,
            BookingPatch {
                time: Some(time),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn confirm_booking(&self, id: Ulid) -> Result<BookingRecord, EngineError> {
        self.update_booking(
            id,
            BookingPatch {
                status: Some(BookingStatus::Confirmed),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<BookingRecord, EngineError> {
        self.update_booking(
            id,
            BookingPatch {
                status: Some(BookingStatus::Cancelled),
                ..Default::default()
            },
        )
        .await
    }

    /// Administrative hard delete. Returns the removed record.
    pub async fn delete_booking(&self, id: Ulid) -> Result<BookingRecord, EngineError> {
        let (shared, mut guard) = self.resolve_booking_write(&id).await?;
        let removed = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        let event = Event::BookingDeleted {
            id,
            amenity_id: removed.amenity_id.clone(),
        };
        self.persist_and_apply(&mut guard, std::slice::from_ref(&event)).await?;
        self.retire_if_empty(&shared, &guard);
        info!("deleted booking {id}");
        Ok(removed)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let shared: Vec<SharedAmenityState> = self.amenities.iter().map(|e| e.value().clone()).collect();

        // Hold every read lock until the writer has the snapshot, so no
        // mutation lands between the snapshot and the swap.
        let mut guards = Vec::with_capacity(shared.len());
        for state in &shared {
            guards.push(state.read().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            for b in guard.iter() {
                events.push(Event::BookingRequested {
                    id: b.id,
                    resident_id: b.resident_id.clone(),
                    resident_name: b.resident_name.clone(),
                    resident_email: b.resident_email.clone(),
                    amenity_id: b.amenity_id.clone(),
                    date: b.date,
                    slot: b.slot,
                    created_at: b.created_at,
                });
                match b.status {
                    BookingStatus::Pending => {}
                    BookingStatus::Confirmed => events.push(Event::BookingConfirmed {
                        id: b.id,
                        amenity_id: b.amenity_id.clone(),
                    }),
                    BookingStatus::Cancelled => events.push(Event::BookingCancelled {
                        id: b.id,
                        amenity_id: b.amenity_id.clone(),
                    }),
                }
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        info!("compacted WAL to {count} events");
        Ok(())
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
