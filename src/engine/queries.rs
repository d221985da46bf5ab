use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::conflict::{find_conflict, validate_window};
use super::status::{asset_status, in_downtime};
use super::{Engine, EngineError, SharedAssetState};

impl Engine {
    fn assets_snapshot(&self) -> Vec<SharedAssetState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }

    fn assets_in_scope(&self, asset_id: Option<Ulid>) -> Vec<SharedAssetState> {
        match asset_id {
            Some(id) => self.get_asset(&id).into_iter().collect(),
            None => self.assets_snapshot(),
        }
    }

    pub fn list_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        users
    }

    /// All assets with their display status at `now`, ordered by id.
    pub async fn list_assets(&self, now: Ms) -> Result<Vec<AssetInfo>, EngineError> {
        let mut out = Vec::with_capacity(self.state.len());
        for asset in self.assets_snapshot() {
            let guard = asset.read().await;
            out.push(AssetInfo {
                id: guard.id,
                name: guard.name.clone(),
                number_plate: guard.number_plate.clone(),
                category: guard.category,
                status: asset_status(&guard, now)?,
                in_downtime: in_downtime(&guard, now),
            });
        }
        out.sort_by_key(|a| a.id);
        Ok(out)
    }

    pub async fn asset_status(&self, asset_id: Ulid, now: Ms) -> Result<AssetStatus, EngineError> {
        let asset = self.get_asset(&asset_id).ok_or(EngineError::NotFound(asset_id))?;
        let guard = asset.read().await;
        asset_status(&guard, now)
    }

    /// Bookings in any state. Regular users only see their own.
    pub async fn list_bookings(
        &self,
        actor: Actor,
        asset_id: Option<Ulid>,
    ) -> Result<Vec<Booking>, EngineError> {
        let own_only = match (self.role_of(actor)?, actor) {
            (Role::Regular, Actor::User(id)) => Some(id),
            _ => None,
        };
        let mut out = Vec::new();
        for asset in self.assets_in_scope(asset_id) {
            let guard = asset.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| own_only.is_none_or(|uid| b.user_id == uid))
                    .cloned(),
            );
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out)
    }

    /// Active bookings of every user overlapping `window`, for calendar views.
    pub async fn calendar(
        &self,
        actor: Actor,
        asset_id: Option<Ulid>,
        window: Span,
    ) -> Result<Vec<Booking>, EngineError> {
        self.role_of(actor)?;
        validate_window(&window)?;
        let mut out = Vec::new();
        for asset in self.assets_in_scope(asset_id) {
            let guard = asset.read().await;
            out.extend(
                guard
                    .overlapping(&window)
                    .filter(|b| b.status.is_active())
                    .cloned(),
            );
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out)
    }

    /// The first active booking that `span` would collide with, if any.
    pub async fn check_conflict(
        &self,
        asset_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Option<Booking>, EngineError> {
        validate_window(&span)?;
        let asset = self.get_asset(&asset_id).ok_or(EngineError::NotFound(asset_id))?;
        let guard = asset.read().await;
        Ok(find_conflict(asset_id, &span, &guard.bookings, exclude)?.cloned())
    }

    /// Downtimes, most recent first.
    pub async fn list_downtimes(&self, asset_id: Option<Ulid>) -> Vec<Downtime> {
        let mut out = Vec::new();
        for asset in self.assets_in_scope(asset_id) {
            let guard = asset.read().await;
            out.extend(guard.downtimes.iter().cloned());
        }
        out.sort_by(|a, b| b.start.cmp(&a.start).then(a.id.cmp(&b.id)));
        out
    }

    /// Fleet dashboard counts. An asset that is down at `now` is counted only
    /// as in downtime, never as available or booked.
    pub async fn fleet_stats(&self, now: Ms) -> Result<FleetStats, EngineError> {
        let mut stats = FleetStats::default();
        for asset in self.assets_snapshot() {
            let guard = asset.read().await;
            stats.total += 1;
            if in_downtime(&guard, now) {
                stats.in_downtime += 1;
                continue;
            }
            match asset_status(&guard, now)? {
                AssetStatus::Available => stats.available += 1,
                AssetStatus::BookedSoon => stats.booked_soon += 1,
                AssetStatus::BookedNow => stats.booked_now += 1,
            }
        }
        Ok(stats)
    }

    /// Asset count per category, largest first.
    pub async fn fleet_categories(&self) -> Vec<(AssetCategory, usize)> {
        let mut counts: HashMap<AssetCategory, usize> = HashMap::new();
        for asset in self.assets_snapshot() {
            let guard = asset.read().await;
            *counts.entry(guard.category).or_default() += 1;
        }
        let mut out: Vec<_> = counts.into_iter().collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        out
    }
}
