// ── Operating day ────────────────────────────────────────────────

/// Opening hour (inclusive).
pub const OPEN_HOUR: u32 = 8;
/// Closing hour (exclusive).
pub const CLOSE_HOUR: u32 = 20;
pub const SLOT_MINUTES: u32 = 30;
pub const SLOTS_PER_DAY: usize = ((CLOSE_HOUR - OPEN_HOUR) * 60 / SLOT_MINUTES) as usize;
/// Two hours.
pub const MAX_BOOKING_SLOTS: usize = 4;

pub const OPEN_MINUTE: u32 = OPEN_HOUR * 60;
pub const CLOSE_MINUTE: u32 = CLOSE_HOUR * 60;

// ── Party sizes & identifiers ────────────────────────────────────

pub const MIN_PARTY_SIZE: u32 = 1;
pub const MAX_PARTY_SIZE: u32 = 9;
pub const REQUESTER_ID_DIGITS: usize = 7;
pub const MAX_REQUESTER_LEN: usize = 64;

// ── Backing store layout ─────────────────────────────────────────

/// Columns before `S1` in the Schedule table (date, room_id, room_type).
pub const SLOT_COLUMN_OFFSET: usize = 3;
/// Upper bound on ranges in a single batched read or write.
pub const MAX_BATCH_RANGES: usize = 512;
/// Upper bound on rooms per bucket accepted from a seeded Room table.
pub const MAX_ROOMS_PER_BUCKET: usize = 256;
