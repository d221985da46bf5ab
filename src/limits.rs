use crate::model::Ms;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_ASSETS_PER_TENANT: usize = 100_000;
pub const MAX_USERS_PER_TENANT: usize = 100_000;
pub const MAX_BOOKINGS_PER_ASSET: usize = 50_000;
pub const MAX_DOWNTIMES_PER_ASSET: usize = 10_000;
pub const MAX_BATCH_SIZE: usize = 1_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PLATE_LEN: usize = 32;
pub const MAX_TEXT_LEN: usize = 4_096;

/// 1970-01-01.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// A single booking may not exceed one year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;
/// Calendar and conflict queries may not exceed ten years.
pub const MAX_QUERY_WINDOW_MS: Ms = 3_660 * DAY_MS;

pub const DAY_MS: Ms = 86_400_000;

/// A booking starting within this window after "now" marks the asset as booked soon.
pub const BOOKED_SOON_WINDOW_MS: Ms = 3 * DAY_MS;
