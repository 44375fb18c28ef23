//! Hard caps on what a single server will accept.

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_GUESTS: usize = 1_000_000;
pub const MAX_RESERVATIONS_PER_ROOM: usize = 100_000;

/// Longest bookable stay.
pub const MAX_STAY_NIGHTS: i64 = 366;
/// Widest window accepted by availability queries.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 3_660;

pub const MIN_VALID_YEAR: i32 = 1970;
pub const MAX_VALID_YEAR: i32 = 2200;

pub const MAX_CODE_LEN: usize = 32;
pub const MAX_TEXT_LEN: usize = 1024;
pub const MAX_NAME_LEN: usize = 256;

/// Largest encoded journal entry. Bigger length headers are treated as corruption.
pub const MAX_EVENT_BYTES: usize = 64 * 1024;
