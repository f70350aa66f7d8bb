use chrono::NaiveTime;
use tracing::warn;

use crate::catalog::Bucket;
use crate::limits::SLOTS_PER_DAY;
use crate::model::*;
use crate::observability;
use crate::slots::display_time;

use super::{Engine, EngineError, with_retry};

/// 1-based column of `status` in the Bookings table.
const STATUS_COLUMN: usize = 10;
const CREATED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingStatus {
    Active,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Active => "active",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Some(BookingStatus::Active),
            "cancelled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

/// One row of the booking ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRecord {
    pub booking_id: String,
    pub requester_id: String,
    pub day: Day,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub bucket: Bucket,
    pub room_id: RoomId,
    pub slots: Vec<Slot>,
    /// ISO-8601 local time, seconds precision. Kept as written.
    pub created_at: String,
    pub status: BookingStatus,
}

impl BookingRecord {
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.booking_id.clone(),
            self.requester_id.clone(),
            self.day.to_string(),
            display_time(self.start),
            display_time(self.end),
            self.bucket.code().to_string(),
            self.room_id.clone(),
            serde_json::to_string(&self.slots).unwrap_or_else(|_| "[]".into()),
            self.created_at.clone(),
            self.status.as_str().to_string(),
        ]
    }
}

pub(crate) fn created_at_now() -> String {
    chrono::Local::now().naive_local().format(CREATED_AT_FORMAT).to_string()
}

/// Slot list as stored: a JSON array of integers. Integral floats are accepted.
fn parse_slots(raw: &str) -> Option<Vec<Slot>> {
    let values: Vec<serde_json::Value> = serde_json::from_str(raw.trim()).ok()?;
    let mut slots = Vec::with_capacity(values.len());
    for value in values {
        let slot = match value.as_u64() {
            Some(n) => n,
            None => {
                let f = value.as_f64()?;
                if f.fract() != 0.0 || f < 0.0 {
                    return None;
                }
                f as u64
            }
        };
        if !(1..=SLOTS_PER_DAY as u64).contains(&slot) {
            return None;
        }
        slots.push(slot as Slot);
    }
    if slots.is_empty() { None } else { Some(slots) }
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%I:%M %p")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}

/// A raw Bookings row with its 1-based row number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    pub row: usize,
    pub cells: Vec<String>,
}

impl LedgerRow {
    fn field(&self, col: usize) -> &str {
        self.cells.get(col).map(|s| s.trim()).unwrap_or("")
    }

    /// Same requester and day. Only the columns needed for the match are parsed.
    pub fn matches(&self, requester: &Requester, day: Day) -> bool {
        Requester::parse(self.field(1)).id() == requester.id()
            && Day::parse(self.field(2)) == Some(day)
    }

    /// Requester matches and the row is active, but the date cannot be read.
    fn has_unreadable_day(&self, requester: &Requester) -> bool {
        self.is_active()
            && Requester::parse(self.field(1)).id() == requester.id()
            && Day::parse(self.field(2)).is_none()
    }

    pub fn is_active(&self) -> bool {
        BookingStatus::parse(self.field(9)) == Some(BookingStatus::Active)
    }

    pub fn decode(&self) -> Result<BookingRecord, EngineError> {
        let corrupt = |what: &str| {
            EngineError::DataCorruption(format!("Bookings row {}: {what}", self.row))
        };
        let booking_id = self.field(0);
        if booking_id.is_empty() {
            return Err(corrupt("missing booking_id"));
        }
        let bucket = Bucket::from_code(self.field(5))
            .or_else(|| Bucket::from_name(self.field(5)))
            .ok_or_else(|| corrupt("unknown room_type"))?;
        Ok(BookingRecord {
            booking_id: booking_id.to_string(),
            requester_id: Requester::parse(self.field(1)).id().to_string(),
            day: Day::parse(self.field(2)).ok_or_else(|| corrupt("unreadable date"))?,
            start: parse_time(self.field(3)).ok_or_else(|| corrupt("unreadable start_time"))?,
            end: parse_time(self.field(4)).ok_or_else(|| corrupt("unreadable end_time"))?,
            bucket,
            room_id: self.field(6).to_string(),
            slots: parse_slots(self.field(7)).ok_or_else(|| corrupt("unreadable slots"))?,
            created_at: self.field(8).to_string(),
            status: BookingStatus::parse(self.field(9)).ok_or_else(|| corrupt("unknown status"))?,
        })
    }
}

impl Engine {
    /// Every ledger row after the header. One retried read.
    pub(crate) async fn ledger_rows(&self) -> Result<Vec<LedgerRow>, EngineError> {
        let store = self.store.as_ref();
        let rows = with_retry(&self.config.retry, "read_all", move || {
            store.read_all(Table::Bookings)
        })
        .await?;
        Ok(rows
            .into_iter()
            .enumerate()
            .skip(1)
            .map(|(i, cells)| LedgerRow { row: i + 1, cells })
            .collect())
    }

    /// Active bookings of `requester` on `day`, in ledger order. Rows that match but cannot be
    /// decoded are logged, counted and left out.
    pub(crate) async fn active_bookings(
        &self,
        requester: &Requester,
        day: Day,
    ) -> Result<Vec<(LedgerRow, BookingRecord)>, EngineError> {
        let mut out = Vec::new();
        for row in self.ledger_rows().await? {
            if row.has_unreadable_day(requester) {
                skip_corrupt(&EngineError::DataCorruption(format!(
                    "Bookings row {}: unreadable date",
                    row.row
                )));
                continue;
            }
            if !row.is_active() || !row.matches(requester, day) {
                continue;
            }
            match row.decode() {
                Ok(record) => out.push((row, record)),
                Err(e) => skip_corrupt(&e),
            }
        }
        Ok(out)
    }

    /// Append one record. Never retried.
    pub(crate) async fn append_booking(&self, record: &BookingRecord) -> Result<usize, EngineError> {
        Ok(self
            .store
            .append_rows(Table::Bookings, vec![record.to_row()])
            .await?)
    }

    /// Flip `status` to cancelled on every listed row in one write.
    pub(crate) async fn mark_cancelled(&self, rows: &[usize]) -> Result<(), EngineError> {
        if rows.is_empty() {
            return Ok(());
        }
        let updates = rows
            .iter()
            .map(|&row| {
                CellUpdate::fill(
                    CellRange::cell(row, STATUS_COLUMN),
                    BookingStatus::Cancelled.as_str(),
                )
            })
            .collect();
        self.store.batch_update(Table::Bookings, updates).await?;
        Ok(())
    }
}

pub(super) fn skip_corrupt(e: &EngineError) {
    warn!("skipping ledger record: {e}");
    metrics::counter!(observability::CORRUPT_RECORDS_TOTAL).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> LedgerRow {
        LedgerRow {
            row: 2,
            cells: cells.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn sample() -> BookingRecord {
        BookingRecord {
            booking_id: "BKG-01ABCDEFGH".into(),
            requester_id: "1234567".into(),
            day: Day::from_ymd(2025, 6, 2).unwrap(),
            start: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            bucket: Bucket::Medium,
            room_id: "M-01".into(),
            slots: vec![13, 14, 15, 16],
            created_at: "2025-06-01T09:15:00".into(),
            status: BookingStatus::Active,
        }
    }

    #[test]
    fn record_renders_ledger_columns() {
        let cells = sample().to_row();
        assert_eq!(
            cells,
            vec![
                "BKG-01ABCDEFGH",
                "1234567",
                "02/06/2025",
                "02:00 PM",
                "04:00 PM",
                "DISCUSSION-M",
                "M-01",
                "[13,14,15,16]",
                "2025-06-01T09:15:00",
                "active",
            ]
        );
        assert_eq!(LedgerRow { row: 2, cells }.decode().unwrap(), sample());
    }

    #[test]
    fn slots_accept_integral_floats() {
        assert_eq!(parse_slots("[13.0, 14]"), Some(vec![13, 14]));
        assert_eq!(parse_slots(" [1] "), Some(vec![1]));
        assert_eq!(parse_slots("[13.5]"), None);
        assert_eq!(parse_slots("[0]"), None);
        assert_eq!(parse_slots("[25]"), None);
        assert_eq!(parse_slots("[]"), None);
        assert_eq!(parse_slots("13,14"), None);
        assert_eq!(parse_slots("[\"13\"]"), None);
    }

    #[test]
    fn decode_rejects_bad_rows() {
        let mut cells = sample().to_row();
        cells[7] = "oops".into();
        let err = LedgerRow { row: 5, cells }.decode().unwrap_err();
        assert!(matches!(err, EngineError::DataCorruption(ref m) if m.contains("row 5")));

        let mut cells = sample().to_row();
        cells[5] = "BALLROOM".into();
        assert!(LedgerRow { row: 2, cells }.decode().is_err());
    }

    #[test]
    fn matches_normalizes_requester() {
        let day = Day::from_ymd(2025, 6, 2).unwrap();
        let r = row(&["BKG-1", "1234567.0", "02/06/2025", "", "", "", "", "", "", "Active"]);
        assert!(r.matches(&Requester::parse("1234567"), day));
        assert!(r.is_active());
        assert!(!r.matches(&Requester::parse("7654321"), day));
        assert!(!r.matches(&Requester::parse("1234567"), Day::from_ymd(2025, 6, 3).unwrap()));
    }
}
