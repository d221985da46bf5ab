use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, now_ms, validate_span};
use super::{apply_to_asset, Engine, EngineError, WalCommand};

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn check_opt_len(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    value.map_or(Ok(()), |v| check_len(v, max, what))
}

fn validate_downtime(downtime: &Downtime) -> Result<(), EngineError> {
    check_len(&downtime.description, MAX_TEXT_LEN, "description too long")?;
    if downtime.start < MIN_VALID_TIMESTAMP_MS || downtime.start > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if let Some(end) = downtime.end {
        Span::try_new(downtime.start, end)?;
        if end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
    }
    if downtime.cost_cents.is_some_and(|c| c < 0) {
        return Err(EngineError::LimitExceeded("negative cost"));
    }
    Ok(())
}

impl Engine {
    // ── Users ────────────────────────────────────────────────

    pub async fn create_user(
        &self,
        actor: Actor,
        id: Ulid,
        name: String,
        role: Role,
    ) -> Result<(), EngineError> {
        self.require_manager(actor, "only managers can create users")?;
        check_len(&name, MAX_NAME_LEN, "user name too long")?;
        if self.users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::UserCreated { id, name: name.clone(), role };
        self.wal_append(&event).await?;
        self.users.insert(id, User { id, name, role });
        info!(user = %id, role = role.as_str(), "user created");
        Ok(())
    }

    /// Bookings made by the user are kept as history.
    pub async fn delete_user(&self, actor: Actor, id: Ulid) -> Result<(), EngineError> {
        self.require_manager(actor, "only managers can delete users")?;
        if !self.users.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.wal_append(&Event::UserDeleted { id }).await?;
        self.users.remove(&id);
        Ok(())
    }

    // ── Assets ───────────────────────────────────────────────

    pub async fn create_asset(
        &self,
        actor: Actor,
        id: Ulid,
        name: String,
        number_plate: Option<String>,
        category: AssetCategory,
    ) -> Result<(), EngineError> {
        self.require_manager(actor, "only managers can add assets")?;
        if self.state.len() >= MAX_ASSETS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many assets"));
        }
        check_len(&name, MAX_NAME_LEN, "asset name too long")?;
        check_opt_len(number_plate.as_deref(), MAX_PLATE_LEN, "number plate too long")?;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::AssetCreated {
            id,
            name: name.clone(),
            number_plate: number_plate.clone(),
            category,
        };
        self.wal_append(&event).await?;
        let asset = AssetState::new(id, name, number_plate, category);
        self.state.insert(id, Arc::new(RwLock::new(asset)));
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn update_asset(
        &self,
        actor: Actor,
        id: Ulid,
        patch: AssetPatch,
    ) -> Result<(), EngineError> {
        self.require_manager(actor, "only managers can edit assets")?;
        check_opt_len(patch.name.as_deref(), MAX_NAME_LEN, "asset name too long")?;
        check_opt_len(
            patch.number_plate.as_ref().and_then(|p| p.as_deref()),
            MAX_PLATE_LEN,
            "number plate too long",
        )?;
        let asset = self.get_asset(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = asset.write().await;

        let event = Event::AssetUpdated {
            id,
            name: patch.name.unwrap_or_else(|| guard.name.clone()),
            number_plate: patch.number_plate.unwrap_or_else(|| guard.number_plate.clone()),
            category: patch.category.unwrap_or(guard.category),
        };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Removes the asset together with its bookings and downtimes.
    pub async fn delete_asset(&self, actor: Actor, id: Ulid) -> Result<(), EngineError> {
        self.require_manager(actor, "only managers can remove assets")?;
        let asset = self.get_asset(&id).ok_or(EngineError::NotFound(id))?;
        let guard = asset.write().await;

        let event = Event::AssetDeleted { id };
        self.wal_append(&event).await?;
        self.unmap_children(&guard);
        self.state.remove(&id);
        drop(guard);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    fn initial_status(&self) -> BookingStatus {
        if self.policy.require_approval {
            BookingStatus::Pending
        } else {
            BookingStatus::Approved
        }
    }

    /// Validation shared by single and batch creation. Doesn't touch asset state.
    fn authorize_new_booking(&self, actor: Actor, new: &NewBooking) -> Result<(), EngineError> {
        validate_span(&new.span)?;
        check_opt_len(new.purpose.as_deref(), MAX_TEXT_LEN, "purpose too long")?;
        self.require_owner_or_manager(actor, new.user_id, "cannot book on behalf of another user")?;
        if !self.users.contains_key(&new.user_id) {
            return Err(EngineError::NotFound(new.user_id));
        }
        if self.get_asset_for_entity(&new.id).is_some() {
            return Err(EngineError::AlreadyExists(new.id));
        }
        Ok(())
    }

    fn booking_from(&self, new: NewBooking, now: Ms) -> Booking {
        Booking {
            id: new.id,
            asset_id: new.asset_id,
            user_id: new.user_id,
            span: new.span,
            purpose: new.purpose,
            status: self.initial_status(),
            decided_by: None,
            decided_at: None,
            rejection_reason: None,
            created_at: now,
        }
    }

    /// Create a booking. The asset's write lock is held across the conflict
    /// check and the insert, so concurrent requests for one asset are serialized.
    pub async fn create_booking(&self, actor: Actor, new: NewBooking) -> Result<Booking, EngineError> {
        self.authorize_new_booking(actor, &new)?;
        let asset = self
            .get_asset(&new.asset_id)
            .ok_or(EngineError::NotFound(new.asset_id))?;
        let mut guard = asset.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ASSET {
            return Err(EngineError::LimitExceeded("too many bookings on asset"));
        }

        if let Err(e) = check_no_conflict(&guard, &new.span, None) {
            metrics::counter!(observability::BOOKINGS_REJECTED_TOTAL).increment(1);
            debug!(asset = %new.asset_id, "booking rejected: {e}");
            return Err(e);
        }

        self.claim_entity(new.id, new.asset_id)?;
        let booking = self.booking_from(new, now_ms());
        let event = Event::BookingCreated { booking: booking.clone() };
        if let Err(e) = self.persist_and_apply(booking.asset_id, &mut guard, &event).await {
            self.release_entity(&booking.id);
            return Err(e);
        }
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        Ok(booking)
    }

    /// Create several bookings atomically. All-or-nothing: if any booking
    /// conflicts (with stored state or with another one in the batch), none
    /// are committed. Bookings may span different assets.
    pub async fn batch_create_bookings(
        &self,
        actor: Actor,
        bookings: Vec<NewBooking>,
    ) -> Result<Vec<Booking>, EngineError> {
        if bookings.is_empty() {
            return Ok(Vec::new());
        }
        if bookings.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut seen = HashSet::with_capacity(bookings.len());
        for new in &bookings {
            if !seen.insert(new.id) {
                return Err(EngineError::AlreadyExists(new.id));
            }
            self.authorize_new_booking(actor, new)?;
        }

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut asset_ids: Vec<Ulid> = bookings.iter().map(|b| b.asset_id).collect();
        asset_ids.sort();
        asset_ids.dedup();

        let mut guards = Vec::with_capacity(asset_ids.len());
        let mut guard_index = HashMap::new();
        for aid in &asset_ids {
            let asset = self.get_asset(aid).ok_or(EngineError::NotFound(*aid))?;
            let guard = asset.write_owned().await;
            if guard.bookings.len() >= MAX_BOOKINGS_PER_ASSET {
                return Err(EngineError::LimitExceeded("too many bookings on asset"));
            }
            guard_index.insert(*aid, guards.len());
            guards.push(guard);
        }

        // Phase 1: validate against current state and within the batch.
        let mut by_asset: HashMap<Ulid, Vec<&NewBooking>> = HashMap::new();
        for new in &bookings {
            by_asset.entry(new.asset_id).or_default().push(new);
        }
        for (aid, batch) in &by_asset {
            let guard = &guards[guard_index[aid]];
            for new in batch {
                check_no_conflict(guard, &new.span, None)?;
            }
            for (i, a) in batch.iter().enumerate() {
                if let Some(b) = batch[i + 1..].iter().find(|b| b.span.overlaps(&a.span)) {
                    return Err(EngineError::Conflict { booking_id: b.id, span: b.span });
                }
            }
        }
        drop(by_asset);

        // Phase 2: claim every id, then persist the whole batch as one WAL unit.
        let mut claimed = Vec::with_capacity(bookings.len());
        for new in &bookings {
            if let Err(e) = self.claim_entity(new.id, new.asset_id) {
                claimed.iter().for_each(|id| self.release_entity(id));
                return Err(e);
            }
            claimed.push(new.id);
        }
        let now = now_ms();
        let created: Vec<Booking> = bookings.into_iter().map(|new| self.booking_from(new, now)).collect();
        let events: Vec<Event> = created
            .iter()
            .map(|booking| Event::BookingCreated { booking: booking.clone() })
            .collect();
        if let Err(e) = self.wal_append_all(events.clone()).await {
            claimed.iter().for_each(|id| self.release_entity(id));
            return Err(e);
        }

        // Phase 3: durable, apply.
        for event in &events {
            let Event::BookingCreated { booking } = event else { continue };
            let guard = &mut guards[guard_index[&booking.asset_id]];
            apply_to_asset(guard, event, &self.entity_to_asset);
            self.notify.send(booking.asset_id, event);
        }
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(created.len() as u64);
        Ok(created)
    }

    /// Edit a booking in place. Its own interval is excluded from the conflict check.
    pub async fn update_booking(
        &self,
        actor: Actor,
        id: Ulid,
        patch: BookingPatch,
    ) -> Result<Ulid, EngineError> {
        check_opt_len(
            patch.purpose.as_ref().and_then(|p| p.as_deref()),
            MAX_TEXT_LEN,
            "purpose too long",
        )?;
        let (asset_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        self.require_owner_or_manager(actor, current.user_id, "only the creator or a manager can edit a booking")?;
        if !current.status.is_open() {
            return Err(EngineError::InvalidState { id, status: current.status });
        }

        let span = Span {
            start: patch.start.unwrap_or(current.span.start),
            end: patch.end.unwrap_or(current.span.end),
        };
        let purpose = patch.purpose.unwrap_or_else(|| current.purpose.clone());
        validate_span(&span)?;
        check_no_conflict(&guard, &span, Some(id))?;

        let event = Event::BookingUpdated { id, asset_id, span, purpose };
        self.persist_and_apply(asset_id, &mut guard, &event).await?;
        Ok(asset_id)
    }

    /// Approve or reject a pending booking.
    pub async fn decide_booking(
        &self,
        actor: Actor,
        id: Ulid,
        approve: bool,
        rejection_reason: Option<String>,
    ) -> Result<Ulid, EngineError> {
        self.require_manager(actor, "only managers can approve or reject bookings")?;
        check_opt_len(rejection_reason.as_deref(), MAX_TEXT_LEN, "rejection reason too long")?;
        let (asset_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        if current.status != BookingStatus::Pending {
            return Err(EngineError::InvalidState { id, status: current.status });
        }

        let (status, rejection_reason) = if approve {
            (BookingStatus::Approved, None)
        } else {
            (BookingStatus::Rejected, rejection_reason)
        };
        let decided_by = match actor {
            Actor::User(uid) => Some(uid),
            Actor::System => None,
        };
        let event = Event::BookingDecided {
            id,
            asset_id,
            status,
            decided_by,
            decided_at: now_ms(),
            rejection_reason,
        };
        self.persist_and_apply(asset_id, &mut guard, &event).await?;
        info!(booking = %id, status = status.as_str(), "booking decided");
        Ok(asset_id)
    }

    pub async fn cancel_booking(&self, actor: Actor, id: Ulid) -> Result<Ulid, EngineError> {
        let (asset_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        self.require_owner_or_manager(actor, current.user_id, "only the creator or a manager can cancel a booking")?;
        if !current.status.is_open() {
            return Err(EngineError::InvalidState { id, status: current.status });
        }
        let event = Event::BookingCancelled { id, asset_id };
        self.persist_and_apply(asset_id, &mut guard, &event).await?;
        Ok(asset_id)
    }

    pub async fn delete_booking(&self, actor: Actor, id: Ulid) -> Result<Ulid, EngineError> {
        let (asset_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        self.require_owner_or_manager(actor, current.user_id, "only the creator or a manager can delete a booking")?;
        let event = Event::BookingDeleted { id, asset_id };
        self.persist_and_apply(asset_id, &mut guard, &event).await?;
        Ok(asset_id)
    }

    /// Mark an approved booking whose interval has ended as completed.
    pub async fn complete_booking(&self, id: Ulid, now: Ms) -> Result<Ulid, EngineError> {
        let (asset_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        if current.status != BookingStatus::Approved || current.span.end > now {
            return Err(EngineError::InvalidState { id, status: current.status });
        }
        let event = Event::BookingCompleted { id, asset_id };
        self.persist_and_apply(asset_id, &mut guard, &event).await?;
        Ok(asset_id)
    }

    /// Approved bookings that ended at or before `now`.
    pub fn collect_finished_bookings(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut finished = Vec::new();
        for entry in self.state.iter() {
            let asset = entry.value().clone();
            if let Ok(guard) = asset.try_read() {
                for b in &guard.bookings {
                    if b.status == BookingStatus::Approved && b.span.end <= now {
                        finished.push((b.id, guard.id));
                    }
                }
            }
        }
        finished
    }

    // ── Downtimes ────────────────────────────────────────────

    pub async fn record_downtime(&self, actor: Actor, downtime: Downtime) -> Result<(), EngineError> {
        self.require_manager(actor, "only managers can record downtime")?;
        validate_downtime(&downtime)?;
        if self.get_asset_for_entity(&downtime.id).is_some() {
            return Err(EngineError::AlreadyExists(downtime.id));
        }
        let asset_id = downtime.asset_id;
        let asset = self.get_asset(&asset_id).ok_or(EngineError::NotFound(asset_id))?;
        let mut guard = asset.write().await;
        if guard.downtimes.len() >= MAX_DOWNTIMES_PER_ASSET {
            return Err(EngineError::LimitExceeded("too many downtimes on asset"));
        }
        self.claim_entity(downtime.id, asset_id)?;
        let id = downtime.id;
        let event = Event::DowntimeRecorded { downtime };
        let result = self.persist_and_apply(asset_id, &mut guard, &event).await;
        if result.is_err() {
            self.release_entity(&id);
        }
        result
    }

    pub async fn update_downtime(
        &self,
        actor: Actor,
        id: Ulid,
        patch: DowntimePatch,
    ) -> Result<Ulid, EngineError> {
        self.require_manager(actor, "only managers can edit downtime")?;
        let (asset_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard
            .downtimes
            .iter()
            .find(|d| d.id == id)
            .ok_or(EngineError::NotFound(id))?;
        let downtime = Downtime {
            id,
            asset_id,
            reason: patch.reason.unwrap_or(current.reason),
            description: patch.description.unwrap_or_else(|| current.description.clone()),
            start: patch.start.unwrap_or(current.start),
            end: patch.end.unwrap_or(current.end),
            cost_cents: patch.cost_cents.unwrap_or(current.cost_cents),
        };
        validate_downtime(&downtime)?;
        let event = Event::DowntimeUpdated { downtime };
        self.persist_and_apply(asset_id, &mut guard, &event).await?;
        Ok(asset_id)
    }

    pub async fn delete_downtime(&self, actor: Actor, id: Ulid) -> Result<Ulid, EngineError> {
        self.require_manager(actor, "only managers can remove downtime")?;
        let (asset_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.downtimes.iter().any(|d| d.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::DowntimeDeleted { id, asset_id };
        self.persist_and_apply(asset_id, &mut guard, &event).await?;
        Ok(asset_id)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events: Vec<Event> = self
            .users
            .iter()
            .map(|u| Event::UserCreated {
                id: u.id,
                name: u.name.clone(),
                role: u.role,
            })
            .collect();

        let assets: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for asset in assets {
            let guard = asset.read().await;
            events.push(Event::AssetCreated {
                id: guard.id,
                name: guard.name.clone(),
                number_plate: guard.number_plate.clone(),
                category: guard.category,
            });
            for booking in &guard.bookings {
                events.push(Event::BookingCreated { booking: booking.clone() });
            }
            for downtime in &guard.downtimes {
                events.push(Event::DowntimeRecorded { downtime: downtime.clone() });
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
        info!(events = count, "WAL compacted");
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
