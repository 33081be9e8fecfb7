use crate::model::Ms;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

pub const MAX_SHIFT_DURATION_MS: Ms = 31 * 24 * 3_600_000;
pub const MAX_SHIFTS_PER_DEVICE: usize = 100_000;
pub const MAX_USER_ID_LEN: usize = 256;

/// Calendar years accepted by day/month queries.
pub const MIN_CALENDAR_YEAR: i32 = 1970;
pub const MAX_CALENDAR_YEAR: i32 = 9999;
