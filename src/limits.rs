use crate::model::{Ms, DAY_MS, HOUR_MS};

// ── Pages ────────────────────────────────────────────────────────

pub const MAX_PAGES: usize = 10_000;
pub const MAX_SLUG_LEN: usize = 64;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TIMEZONE_LEN: usize = 64;

pub const MAX_SLOT_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_BUFFER_MINUTES: u32 = 24 * 60;
pub const MAX_NOTICE_HOURS: u32 = 24 * 366;
pub const MAX_DAYS_ADVANCE: u32 = 731;

// ── Bookings ─────────────────────────────────────────────────────

/// Pending plus confirmed bookings on one page. Terminal bookings do not count.
pub const MAX_ACTIVE_BOOKINGS_PER_PAGE: usize = 100_000;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_CUSTOM_FIELDS: usize = 32;
pub const MAX_CUSTOM_FIELD_LEN: usize = 1024;

/// Widest window a single reservation may claim.
pub const MAX_RESERVATION_SPAN_MS: Ms = DAY_MS;

// ── Time ─────────────────────────────────────────────────────────

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// Cached slot lists older than this are treated as absent.
pub const CACHE_TTL_MS: Ms = HOUR_MS;

/// Default per-source timeout for busy-interval queries.
pub const DEFAULT_SOURCE_TIMEOUT_MS: u64 = 3_000;

// ── Wire ─────────────────────────────────────────────────────────

pub const MAX_QUERY_LEN: usize = 64 * 1024;
