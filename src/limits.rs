//! Hard caps applied at the engine and tenant boundaries.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_STUDIOS_PER_TENANT: usize = 256;
pub const MAX_ROOMS_PER_STUDIO: usize = 128;
pub const MAX_COACHES_PER_TENANT: usize = 4096;
pub const MAX_RULES_PER_OWNER: usize = 256;
pub const MAX_SESSIONS_PER_STUDIO: usize = 1_000_000;
pub const MAX_WAITLIST_ENTRIES: usize = 100_000;
pub const MAX_PACKAGES_PER_CLIENT: usize = 256;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2048;
pub const MAX_REASON_LEN: usize = 1024;

pub const MAX_BATCH_SIZE: usize = 1000;
pub const MAX_CAPACITY: u32 = 10_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Sessions never span more than a day.
pub const MAX_SESSION_DURATION_MS: Ms = 86_400_000;
pub const MIN_SESSION_LENGTH_MS: Ms = 60_000;
/// Waitlist offers stay open at most a week.
pub const MAX_RESPONSE_WINDOW_MS: Ms = 7 * 86_400_000;
/// Refund notice windows reach back at most 90 days.
pub const MAX_REFUND_NOTICE_MS: Ms = 90 * 86_400_000;
/// Time-off requests are capped at one year.
pub const MAX_TIME_OFF_DURATION_MS: Ms = 366 * 86_400_000;
