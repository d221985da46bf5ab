mod conflict;
mod error;
mod mutations;
mod queries;
mod status;

pub use conflict::{find_conflict, has_conflict};
pub(crate) use conflict::now_ms;
pub use error::EngineError;
pub use status::classify;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedAssetState = Arc<RwLock<AssetState>>;

/// Per-tenant booking rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingPolicy {
    /// New bookings start as Pending and need a manager decision.
    pub require_approval: bool,
}

// ── Group-commit WAL channel ─────────────────────────────

type AppendAck = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    /// Events committed together: all of them are durable or none are.
    Append {
        events: Vec<Event>,
        response: AppendAck,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch; on failure cut the log back.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                let frames: usize = batch.iter().map(|(events, _)| events.len()).sum();
                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(frames as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                // A compaction queued behind the batch runs only after the batch is durable.
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Vec<Event>, AppendAck)]) -> io::Result<()> {
    let result = batch
        .iter()
        .flat_map(|(events, _)| events)
        .try_for_each(|event| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        tracing::error!("WAL batch failed, rolling back: {e}");
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback failed: {e}");
        }
    }
    result
}

fn respond_batch(batch: Vec<(Vec<Event>, AppendAck)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedAssetState>,
    pub users: DashMap<Ulid, User>,
    pub policy: BookingPolicy,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking/downtime id → asset id. Also the id registry:
    /// an id is claimed here before its creation event is persisted.
    pub(super) entity_to_asset: DashMap<Ulid, Ulid>,
}

/// Apply an event directly to an AssetState (caller holds the lock).
fn apply_to_asset(asset: &mut AssetState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::AssetUpdated { name, number_plate, category, .. } => {
            asset.name = name.clone();
            asset.number_plate = number_plate.clone();
            asset.category = *category;
        }
        Event::BookingCreated { booking } => {
            entity_map.insert(booking.id, booking.asset_id);
            asset.insert_booking(booking.clone());
        }
        Event::BookingUpdated { id, span, purpose, .. } => {
            // Re-insert so the list stays sorted by start.
            if let Some(mut booking) = asset.remove_booking(*id) {
                booking.span = *span;
                booking.purpose = purpose.clone();
                asset.insert_booking(booking);
            }
        }
        Event::BookingDecided { id, status, decided_by, decided_at, rejection_reason, .. } => {
            if let Some(booking) = asset.booking_mut(*id) {
                booking.status = *status;
                booking.decided_by = *decided_by;
                booking.decided_at = Some(*decided_at);
                booking.rejection_reason = rejection_reason.clone();
            }
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(booking) = asset.booking_mut(*id) {
                booking.status = BookingStatus::Cancelled;
            }
        }
        Event::BookingCompleted { id, .. } => {
            if let Some(booking) = asset.booking_mut(*id) {
                booking.status = BookingStatus::Completed;
            }
        }
        Event::BookingDeleted { id, .. } => {
            asset.remove_booking(*id);
            entity_map.remove(id);
        }
        Event::DowntimeRecorded { downtime } => {
            entity_map.insert(downtime.id, downtime.asset_id);
            asset.insert_downtime(downtime.clone());
        }
        Event::DowntimeUpdated { downtime } => {
            asset.remove_downtime(downtime.id);
            asset.insert_downtime(downtime.clone());
        }
        Event::DowntimeDeleted { id, .. } => {
            asset.remove_downtime(*id);
            entity_map.remove(id);
        }
        // Handled at the DashMap level, not here
        Event::AssetCreated { .. }
        | Event::AssetDeleted { .. }
        | Event::UserCreated { .. }
        | Event::UserDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, policy: BookingPolicy) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            users: DashMap::new(),
            policy,
            wal_tx,
            notify,
            entity_to_asset: DashMap::new(),
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds. Never use blocking_write here: this may run inside an async
        // context (lazy tenant creation).
        for event in &events {
            match event {
                Event::UserCreated { id, name, role } => {
                    engine.users.insert(*id, User { id: *id, name: name.clone(), role: *role });
                }
                Event::UserDeleted { id } => {
                    engine.users.remove(id);
                }
                Event::AssetCreated { id, name, number_plate, category } => {
                    let asset = AssetState::new(*id, name.clone(), number_plate.clone(), *category);
                    engine.state.insert(*id, Arc::new(RwLock::new(asset)));
                }
                Event::AssetDeleted { id } => {
                    if let Some((_, asset)) = engine.state.remove(id)
                        && let Ok(guard) = asset.try_read()
                    {
                        engine.unmap_children(&guard);
                    }
                }
                other => {
                    if let Some(asset_id) = event_asset_id(other)
                        && let Some(entry) = engine.state.get(&asset_id)
                    {
                        let asset = entry.clone();
                        drop(entry);
                        if let Ok(mut guard) = asset.try_write() {
                            apply_to_asset(&mut guard, other, &engine.entity_to_asset);
                        }
                    }
                }
            }
        }

        tracing::debug!(
            events = events.len(),
            assets = engine.state.len(),
            users = engine.users.len(),
            "replayed WAL"
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append_all(vec![event.clone()]).await
    }

    /// Write several events as one unit: either all are durable or none are.
    pub(super) async fn wal_append_all(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_asset(&self, id: &Ulid) -> Option<SharedAssetState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_asset_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_asset.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        asset_id: Ulid,
        asset: &mut AssetState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_asset(asset, event, &self.entity_to_asset);
        self.notify.send(asset_id, event);
        Ok(())
    }

    /// Lookup entity → asset, get asset, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<AssetState>), EngineError> {
        let asset_id = self
            .get_asset_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let asset = self
            .get_asset(&asset_id)
            .ok_or(EngineError::NotFound(asset_id))?;
        let guard = asset.write_owned().await;
        Ok((asset_id, guard))
    }

    /// Reserve a new booking/downtime id for `asset_id`. Fails if any entity
    /// in the tenant already holds it, including a creation still in flight.
    pub(super) fn claim_entity(&self, id: Ulid, asset_id: Ulid) -> Result<(), EngineError> {
        match self.entity_to_asset.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(asset_id);
                Ok(())
            }
        }
    }

    pub(super) fn release_entity(&self, id: &Ulid) {
        self.entity_to_asset.remove(id);
    }

    pub(super) fn unmap_children(&self, asset: &AssetState) {
        for b in &asset.bookings {
            self.entity_to_asset.remove(&b.id);
        }
        for d in &asset.downtimes {
            self.entity_to_asset.remove(&d.id);
        }
    }

    // ── Authorization ────────────────────────────────────────

    pub fn role_of(&self, actor: Actor) -> Result<Role, EngineError> {
        match actor {
            Actor::System => Ok(Role::Manager),
            Actor::User(id) => self
                .users
                .get(&id)
                .map(|u| u.role)
                .ok_or(EngineError::UnknownActor(id)),
        }
    }

    pub(super) fn require_manager(&self, actor: Actor, what: &'static str) -> Result<(), EngineError> {
        match self.role_of(actor)? {
            Role::Manager => Ok(()),
            Role::Regular => Err(EngineError::Forbidden(what)),
        }
    }

    /// The owner of a record or any manager.
    pub(super) fn require_owner_or_manager(
        &self,
        actor: Actor,
        owner: Ulid,
        what: &'static str,
    ) -> Result<(), EngineError> {
        match (self.role_of(actor)?, actor) {
            (Role::Manager, _) => Ok(()),
            (Role::Regular, Actor::User(id)) if id == owner => Ok(()),
            _ => Err(EngineError::Forbidden(what)),
        }
    }
}

/// Extract the asset id from an event that targets a single asset.
fn event_asset_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::AssetUpdated { id, .. } => Some(*id),
        Event::BookingCreated { booking } => Some(booking.asset_id),
        Event::BookingUpdated { asset_id, .. }
        | Event::BookingDecided { asset_id, .. }
        | Event::BookingCancelled { asset_id, .. }
        | Event::BookingCompleted { asset_id, .. }
        | Event::BookingDeleted { asset_id, .. }
        | Event::DowntimeDeleted { asset_id, .. } => Some(*asset_id),
        Event::DowntimeRecorded { downtime } | Event::DowntimeUpdated { downtime } => {
            Some(downtime.asset_id)
        }
        Event::AssetCreated { .. }
        | Event::AssetDeleted { .. }
        | Event::UserCreated { .. }
        | Event::UserDeleted { .. } => None,
    }
}
