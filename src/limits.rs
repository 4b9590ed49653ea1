use crate::model::Ms;

pub const MAX_AREAS_PER_CONDO: usize = 1_000;
pub const MAX_RESERVATIONS_PER_AREA: usize = 200_000;
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_REASON_LEN: usize = 1_000;
pub const MAX_BLOCK_AREAS: usize = 100;
pub const MAX_BOOKING_HOURS: u32 = 24;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// Widest window a listing may ask for (~1 year).
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_CONDOS: usize = 10_000;
pub const MAX_CONDO_NAME_LEN: usize = 128;
