use ulid::Ulid;

use crate::catalog::Bucket;
use crate::limits::SLOTS_PER_DAY;
use crate::model::*;

use super::ledger::skip_corrupt;
use super::{BookingRecord, Engine, EngineError};

/// Cell states of one room for a whole day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomOccupancy {
    pub room_id: RoomId,
    /// `cells[k - 1]` is slot `k`.
    pub cells: Vec<CellState>,
}

impl Engine {
    /// Whether `requester` holds an active booking on `day`. One ledger read.
    pub async fn active_booking_exists(&self, requester: &Requester, day: Day) -> Result<bool, EngineError> {
        Ok(self
            .ledger_rows()
            .await?
            .iter()
            .any(|row| row.is_active() && row.matches(requester, day)))
    }

    /// Every booking of `requester` on `day`, cancelled ones included, in ledger order.
    pub async fn bookings_for(&self, requester: &Requester, day: Day) -> Result<Vec<BookingRecord>, EngineError> {
        let mut out = Vec::new();
        for row in self.ledger_rows().await? {
            if !row.matches(requester, day) {
                continue;
            }
            match row.decode() {
                Ok(record) => out.push(record),
                Err(e) => skip_corrupt(&e),
            }
        }
        Ok(out)
    }

    /// Read-only snapshot of a bucket's cells on `day`. Rooms without a row are all Free.
    pub async fn occupancy(&self, day: Day, bucket: Bucket) -> Result<Vec<RoomOccupancy>, EngineError> {
        let rows = self
            .index
            .day_rows(self.store.as_ref(), &self.config.retry, day)
            .await?;
        let rooms: Vec<_> = self.catalog.rooms_in_bucket(bucket).collect();
        let ranges: Vec<CellRange> = rooms
            .iter()
            .filter_map(|room| rows.get(&room.id))
            .map(|&row| CellRange::slots(row, 1, SLOTS_PER_DAY))
            .collect();
        let mut cells = self.read_cells(&ranges).await?.into_iter();

        Ok(rooms
            .into_iter()
            .map(|room| {
                let values = if rows.contains_key(&room.id) { cells.next() } else { None };
                let states = match values {
                    Some(values) => values.iter().map(|raw| CellState::decode(raw)).collect(),
                    None => vec![CellState::Free; SLOTS_PER_DAY],
                };
                RoomOccupancy {
                    room_id: room.id.clone(),
                    cells: states,
                }
            })
            .collect())
    }

    pub fn hold(&self, id: Ulid) -> Option<HoldTicket> {
        self.holds.get(&id).map(|t| t.value().clone())
    }

    /// Live tickets, oldest first.
    pub fn holds(&self) -> Vec<HoldTicket> {
        let mut out: Vec<HoldTicket> = self.holds.iter().map(|t| t.value().clone()).collect();
        out.sort_by_key(|t| (t.held_at, t.id));
        out
    }

    /// Ids of tickets whose TTL ran out at `now`.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<Ulid> {
        self.holds
            .iter()
            .filter(|t| t.value().is_expired(now))
            .map(|t| *t.key())
            .collect()
    }
}
