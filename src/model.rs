use std::fmt;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::catalog::Bucket;
use crate::limits::*;

/// Unix milliseconds, used for hold bookkeeping.
pub type Ms = i64;

/// 1-based half-hour slot index within the operating day.
pub type Slot = usize;

pub type RoomId = String;

/// Calendar day the schedule is partitioned by. Rendered `dd/mm/yyyy` in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Day(NaiveDate);

impl Day {
    pub const FORMAT: &'static str = "%d/%m/%Y";

    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    /// Parse the store's `dd/mm/yyyy` rendering.
    pub fn parse(s: &str) -> Option<Self> {
        NaiveDate::parse_from_str(s.trim(), Self::FORMAT).ok().map(Self)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(Self::FORMAT))
    }
}

/// Who a hold or booking belongs to.
///
/// Only `Verified` identifiers (exactly seven digits after normalization) are subject to the
/// one-booking-per-day check at hold time; placeholders are checked when they finalize.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Requester {
    Verified(String),
    Placeholder(String),
}

impl Requester {
    pub const PENDING: &'static str = "PENDING";

    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let trimmed = trimmed.strip_suffix(".0").unwrap_or(trimmed);
        let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
        if digits.len() == REQUESTER_ID_DIGITS {
            Requester::Verified(digits)
        } else if trimmed.is_empty() {
            Requester::Placeholder(Self::PENDING.into())
        } else {
            Requester::Placeholder(trimmed.to_string())
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Requester::Verified(id) | Requester::Placeholder(id) => id,
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, Requester::Verified(_))
    }
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Occupancy of one (day, room, slot) cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellState {
    Free,
    Held { owner: String },
    Booked { booking_id: String },
}

impl CellState {
    pub const HOLD_PREFIX: &'static str = "HOLD:";

    /// Decode the stored tag: `""`, `HOLD:<requester>` or a booking id.
    pub fn decode(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            CellState::Free
        } else if let Some(owner) = raw.strip_prefix(Self::HOLD_PREFIX) {
            CellState::Held { owner: owner.to_string() }
        } else {
            CellState::Booked { booking_id: raw.to_string() }
        }
    }

    pub fn encode(&self) -> String {
        match self {
            CellState::Free => String::new(),
            CellState::Held { owner } => format!("{}{owner}", Self::HOLD_PREFIX),
            CellState::Booked { booking_id } => booking_id.clone(),
        }
    }

    pub fn held_by(owner: &str) -> Self {
        CellState::Held { owner: owner.to_string() }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, CellState::Free)
    }

    pub fn is_held_by(&self, requester: &str) -> bool {
        matches!(self, CellState::Held { owner } if owner == requester)
    }

    pub fn is_booking(&self, id: &str) -> bool {
        matches!(self, CellState::Booked { booking_id } if booking_id == id)
    }
}

// ── Tabular store addressing ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Table {
    Rooms,
    Schedule,
    Bookings,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Rooms, Table::Schedule, Table::Bookings];

    pub fn title(self) -> &'static str {
        match self {
            Table::Rooms => "Rooms",
            Table::Schedule => "Schedule",
            Table::Bookings => "Bookings",
        }
    }

    pub fn headers(self) -> Vec<String> {
        match self {
            Table::Rooms => ["room_id", "room_type", "capacity_min", "capacity_max"]
                .map(String::from)
                .to_vec(),
            Table::Schedule => ["date", "room_id", "room_type"]
                .into_iter()
                .map(String::from)
                .chain((1..=SLOTS_PER_DAY).map(|s| format!("S{s}")))
                .collect(),
            Table::Bookings => [
                "booking_id",
                "requester_id",
                "date",
                "start_time",
                "end_time",
                "room_type",
                "room_id",
                "slots",
                "created_at",
                "status",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

/// A contiguous run of cells within one row. Rows and columns are 1-based; row 1 is the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRange {
    pub row: usize,
    pub first_col: usize,
    pub last_col: usize,
}

impl CellRange {
    pub fn new(row: usize, first_col: usize, last_col: usize) -> Self {
        debug_assert!(first_col >= 1 && first_col <= last_col, "CellRange columns out of order");
        Self { row, first_col, last_col }
    }

    pub fn cell(row: usize, col: usize) -> Self {
        Self::new(row, col, col)
    }

    /// Schedule cells `S{first}..=S{last}` of a row.
    pub fn slots(row: usize, first: Slot, last: Slot) -> Self {
        Self::new(row, SLOT_COLUMN_OFFSET + first, SLOT_COLUMN_OFFSET + last)
    }

    pub fn width(&self) -> usize {
        self.last_col - self.first_col + 1
    }

    /// A1 notation, e.g. `D14:G14` (or `D14` for a single cell).
    pub fn a1(&self) -> String {
        let first = format!("{}{}", column_letters(self.first_col), self.row);
        if self.first_col == self.last_col {
            first
        } else {
            format!("{first}:{}{}", column_letters(self.last_col), self.row)
        }
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.a1())
    }
}

/// Bijective base-26 column name: 1 → `A`, 26 → `Z`, 27 → `AA`.
pub fn column_letters(mut col: usize) -> String {
    let mut letters = Vec::new();
    while col > 0 {
        let rem = (col - 1) % 26;
        letters.push(b'A' + rem as u8);
        col = (col - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellUpdate {
    pub range: CellRange,
    pub values: Vec<String>,
}

impl CellUpdate {
    /// Write `value` into every cell of `range`.
    pub fn fill(range: CellRange, value: &str) -> Self {
        Self {
            range,
            values: vec![value.to_string(); range.width()],
        }
    }
}

/// Mutations of the local store. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RowsAppended {
        table: Table,
        rows: Vec<Vec<String>>,
    },
    CellsUpdated {
        table: Table,
        updates: Vec<CellUpdate>,
    },
    /// Full table image, written by compaction.
    TableReplaced {
        table: Table,
        rows: Vec<Vec<String>>,
    },
}

// ── Holds ────────────────────────────────────────────────────────

/// Handle for a live hold. Returned by `hold_room` and required by `finalize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldTicket {
    pub id: Ulid,
    pub day: Day,
    pub bucket: Bucket,
    pub room_id: RoomId,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub slots: Vec<Slot>,
    pub owner: Requester,
    pub held_at: Ms,
    pub expires_at: Ms,
}

impl HoldTicket {
    pub fn is_expired(&self, now: Ms) -> bool {
        self.expires_at <= now
    }
}
