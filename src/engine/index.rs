use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::catalog::{Bucket, Catalog, Room};
use crate::limits::SLOTS_PER_DAY;
use crate::model::{Day, RoomId, Table};
use crate::store::TabularStore;

use super::{EngineError, RetryPolicy, with_retry};

pub type DayRows = Arc<HashMap<RoomId, usize>>;

/// Fresh Schedule row: `date, room_id, room_type` followed by empty slot cells.
fn schedule_row(day: Day, room: &Room) -> Vec<String> {
    let mut row = Vec::with_capacity(3 + SLOTS_PER_DAY);
    row.push(day.to_string());
    row.push(room.id.clone());
    row.push(room.bucket.name().to_string());
    row.resize(3 + SLOTS_PER_DAY, String::new());
    row
}

/// Per-day cache of room → Schedule row number.
///
/// A day is loaded with one full read of the Schedule table and afterwards only grows through
/// this index's own appends, so it never needs a second read.
#[derive(Default)]
pub struct ScheduleIndex {
    by_day: DashMap<Day, DayRows>,
}

impl ScheduleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn scan(rows: &[Vec<String>], day: Day) -> HashMap<RoomId, usize> {
        let mut map = HashMap::new();
        for (i, row) in rows.iter().enumerate().skip(1) {
            let (Some(date), Some(room)) = (row.first(), row.get(1)) else {
                continue;
            };
            if Day::parse(date) != Some(day) {
                continue;
            }
            let room = room.trim();
            if map.contains_key(room) {
                warn!("Schedule row {}: duplicate row for {room} on {day}, ignored", i + 1);
                continue;
            }
            map.insert(room.to_string(), i + 1);
        }
        map
    }

    /// Row numbers for `day`, loading the day on first use.
    pub async fn day_rows(
        &self,
        store: &dyn TabularStore,
        retry: &RetryPolicy,
        day: Day,
    ) -> Result<DayRows, EngineError> {
        if let Some(rows) = self.by_day.get(&day) {
            return Ok(rows.value().clone());
        }
        let table = with_retry(retry, "read_all", move || store.read_all(Table::Schedule)).await?;
        let loaded = Arc::new(Self::scan(&table, day));
        debug!("indexed {} schedule rows for {day}", loaded.len());
        // A concurrent loader or appender may have got here first; its map is at least as new.
        Ok(self.by_day.entry(day).or_insert(loaded).value().clone())
    }

    /// Cached row for `(day, room)`, without touching the store.
    pub fn row_for(&self, day: Day, room: &str) -> Option<usize> {
        self.by_day.get(&day).and_then(|rows| rows.value().get(room).copied())
    }

    /// Make sure every room of `bucket` has a row for `day`, appending all missing rows in a
    /// single call. Callers hold the (day, bucket) section.
    pub async fn ensure_rows_for_bucket(
        &self,
        store: &dyn TabularStore,
        retry: &RetryPolicy,
        catalog: &Catalog,
        day: Day,
        bucket: Bucket,
    ) -> Result<DayRows, EngineError> {
        let rows = self.day_rows(store, retry, day).await?;
        let missing: Vec<&Room> = catalog
            .rooms_in_bucket(bucket)
            .filter(|room| !rows.contains_key(&room.id))
            .collect();
        if missing.is_empty() {
            return Ok(rows);
        }
        self.append(store, day, &missing).await
    }

    /// Single-room variant of `ensure_rows_for_bucket`.
    pub async fn ensure_row(
        &self,
        store: &dyn TabularStore,
        retry: &RetryPolicy,
        day: Day,
        room: &Room,
    ) -> Result<usize, EngineError> {
        let rows = self.day_rows(store, retry, day).await?;
        if let Some(&row) = rows.get(&room.id) {
            return Ok(row);
        }
        let rows = self.append(store, day, &[room]).await?;
        rows.get(&room.id)
            .copied()
            .ok_or_else(|| EngineError::DataCorruption(format!("no schedule row for {} after append", room.id)))
    }

    async fn append(&self, store: &dyn TabularStore, day: Day, rooms: &[&Room]) -> Result<DayRows, EngineError> {
        let new_rows = rooms.iter().map(|room| schedule_row(day, room)).collect();
        let first = store.append_rows(Table::Schedule, new_rows).await?;
        debug!("appended {} schedule rows for {day} at row {first}", rooms.len());

        let mut entry = self.by_day.entry(day).or_default();
        let mut merged: HashMap<RoomId, usize> = entry.value().as_ref().clone();
        for (offset, room) in rooms.iter().enumerate() {
            merged.insert(room.id.clone(), first + offset);
        }
        *entry.value_mut() = Arc::new(merged);
        Ok(entry.value().clone())
    }

    pub fn invalidate(&self, day: Day) {
        self.by_day.remove(&day);
    }

    pub fn evict_before(&self, day: Day) {
        self.by_day.retain(|d, _| *d >= day);
    }

    pub fn cached_days(&self) -> usize {
        self.by_day.len()
    }
}
