use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
///
/// `start == end` is accepted (an instant); `end < start` is malformed and is
/// rejected by [`Span::try_new`] and [`Span::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start <= end, "Span start must not be after end");
        Self { start, end }
    }

    pub fn try_new(start: Ms, end: Ms) -> Result<Self, MalformedSpan> {
        let span = Self { start, end };
        span.validate()?;
        Ok(span)
    }

    pub fn validate(&self) -> Result<(), MalformedSpan> {
        if self.end < self.start {
            return Err(MalformedSpan { start: self.start, end: self.end });
        }
        Ok(())
    }

    pub fn duration_ms(&self) -> Ms {
        self.end.saturating_sub(self.start)
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// An interval whose end precedes its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MalformedSpan {
    pub start: Ms,
    pub end: Ms,
}

impl std::fmt::Display for MalformedSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "interval end {} is before start {}", self.end, self.start)
    }
}

impl std::error::Error for MalformedSpan {}

// ── Users ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Manager,
    Regular,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Manager => "manager",
            Role::Regular => "regular",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "manager" | "fleet_manager" => Some(Role::Manager),
            "regular" | "regular_user" | "user" => Some(Role::Regular),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub role: Role,
}

/// Who is performing a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// The operator login. Has manager privileges and need not be registered.
    System,
    User(Ulid),
}

impl Actor {
    /// A login name that parses as a ULID is a user; anything else is the operator.
    pub fn from_login(login: &str) -> Self {
        match Ulid::from_string(login) {
            Ok(id) => Actor::User(id),
            Err(_) => Actor::System,
        }
    }
}

// ── Assets ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AssetCategory {
    Sedan,
    Suv,
    Truck,
    Van,
    Hatchback,
    Coupe,
    Other,
}

impl AssetCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetCategory::Sedan => "sedan",
            AssetCategory::Suv => "suv",
            AssetCategory::Truck => "truck",
            AssetCategory::Van => "van",
            AssetCategory::Hatchback => "hatchback",
            AssetCategory::Coupe => "coupe",
            AssetCategory::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sedan" => Some(AssetCategory::Sedan),
            "suv" => Some(AssetCategory::Suv),
            "truck" => Some(AssetCategory::Truck),
            "van" => Some(AssetCategory::Van),
            "hatchback" => Some(AssetCategory::Hatchback),
            "coupe" => Some(AssetCategory::Coupe),
            "other" => Some(AssetCategory::Other),
            _ => None,
        }
    }
}

/// Display status of an asset relative to "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetStatus {
    Available,
    BookedSoon,
    BookedNow,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Available => "available",
            AssetStatus::BookedSoon => "booked_soon",
            AssetStatus::BookedNow => "booked_now",
        }
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Active bookings occupy their interval; rejected and cancelled ones don't.
    pub fn is_active(&self) -> bool {
        !matches!(self, BookingStatus::Rejected | BookingStatus::Cancelled)
    }

    /// Whether the booking can still be edited, decided or cancelled.
    pub fn is_open(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Approved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "approved" => Some(BookingStatus::Approved),
            "rejected" => Some(BookingStatus::Rejected),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub asset_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub purpose: Option<String>,
    pub status: BookingStatus,
    pub decided_by: Option<Ulid>,
    pub decided_at: Option<Ms>,
    pub rejection_reason: Option<String>,
    pub created_at: Ms,
}

// ── Downtimes ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DowntimeReason {
    Maintenance,
    Repair,
    Accident,
    Cleaning,
    Inspection,
    Other,
}

impl DowntimeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DowntimeReason::Maintenance => "maintenance",
            DowntimeReason::Repair => "repair",
            DowntimeReason::Accident => "accident",
            DowntimeReason::Cleaning => "cleaning",
            DowntimeReason::Inspection => "inspection",
            DowntimeReason::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "maintenance" => Some(DowntimeReason::Maintenance),
            "repair" => Some(DowntimeReason::Repair),
            "accident" => Some(DowntimeReason::Accident),
            "cleaning" => Some(DowntimeReason::Cleaning),
            "inspection" => Some(DowntimeReason::Inspection),
            "other" => Some(DowntimeReason::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Downtime {
    pub id: Ulid,
    pub asset_id: Ulid,
    pub reason: DowntimeReason,
    pub description: String,
    pub start: Ms,
    /// `None` = open-ended, the asset stays down until the downtime is closed.
    pub end: Option<Ms>,
    pub cost_cents: Option<i64>,
}

impl Downtime {
    pub fn effective_span(&self) -> Span {
        Span::new(self.start, self.end.unwrap_or(Ms::MAX))
    }

    /// Closed at both ends, matching how "currently down" is shown.
    pub fn is_active_at(&self, now: Ms) -> bool {
        self.start <= now && self.end.is_none_or(|end| now <= end)
    }
}

// ── Per-asset state ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AssetState {
    pub id: Ulid,
    pub name: String,
    pub number_plate: Option<String>,
    pub category: AssetCategory,
    /// All bookings of this asset regardless of status, sorted by `span.start`.
    pub bookings: Vec<Booking>,
    /// Sorted by `start`.
    pub downtimes: Vec<Downtime>,
}

impl AssetState {
    pub fn new(id: Ulid, name: String, number_plate: Option<String>, category: AssetCategory) -> Self {
        Self {
            id,
            name,
            number_plate,
            category,
            bookings: Vec::new(),
            downtimes: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn insert_downtime(&mut self, downtime: Downtime) {
        let pos = self
            .downtimes
            .binary_search_by_key(&downtime.start, |d| d.start)
            .unwrap_or_else(|e| e);
        self.downtimes.insert(pos, downtime);
    }

    pub fn remove_downtime(&mut self, id: Ulid) -> Option<Downtime> {
        let pos = self.downtimes.iter().position(|d| d.id == id)?;
        Some(self.downtimes.remove(pos))
    }

    /// Bookings whose span overlaps the query window, any status.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Spans of bookings that still occupy the asset.
    pub fn active_spans(&self) -> impl Iterator<Item = &Span> {
        self.bookings
            .iter()
            .filter(|b| b.status.is_active())
            .map(|b| &b.span)
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserCreated {
        id: Ulid,
        name: String,
        role: Role,
    },
    UserDeleted {
        id: Ulid,
    },
    AssetCreated {
        id: Ulid,
        name: String,
        number_plate: Option<String>,
        category: AssetCategory,
    },
    AssetUpdated {
        id: Ulid,
        name: String,
        number_plate: Option<String>,
        category: AssetCategory,
    },
    AssetDeleted {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingUpdated {
        id: Ulid,
        asset_id: Ulid,
        span: Span,
        purpose: Option<String>,
    },
    BookingDecided {
        id: Ulid,
        asset_id: Ulid,
        status: BookingStatus,
        decided_by: Option<Ulid>,
        decided_at: Ms,
        rejection_reason: Option<String>,
    },
    BookingCancelled {
        id: Ulid,
        asset_id: Ulid,
    },
    BookingCompleted {
        id: Ulid,
        asset_id: Ulid,
    },
    BookingDeleted {
        id: Ulid,
        asset_id: Ulid,
    },
    DowntimeRecorded {
        downtime: Downtime,
    },
    DowntimeUpdated {
        downtime: Downtime,
    },
    DowntimeDeleted {
        id: Ulid,
        asset_id: Ulid,
    },
}

// ── Mutation inputs ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Ulid,
    pub asset_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub purpose: Option<String>,
}

/// Field-wise update; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetPatch {
    pub name: Option<String>,
    pub number_plate: Option<Option<String>>,
    pub category: Option<AssetCategory>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub purpose: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DowntimePatch {
    pub reason: Option<DowntimeReason>,
    pub description: Option<String>,
    pub start: Option<Ms>,
    pub end: Option<Option<Ms>>,
    pub cost_cents: Option<Option<i64>>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetInfo {
    pub id: Ulid,
    pub name: String,
    pub number_plate: Option<String>,
    pub category: AssetCategory,
    pub status: AssetStatus,
    pub in_downtime: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetStats {
    pub total: usize,
    pub available: usize,
    pub booked_soon: usize,
    pub booked_now: usize,
    pub in_downtime: usize,
}
