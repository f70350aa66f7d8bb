use std::time::Instant;

use chrono::NaiveTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::catalog::{Bucket, Room};
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::slots::{SlotWindow, coalesce};

use super::{Engine, EngineError, now_ms};

/// Everything `hold_room` needs, already normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldRequest {
    pub day: Day,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub party_size: u32,
    pub requester: Requester,
}

/// First room whose cells for `window` are all free. `cells[i]` covers the window bounds of
/// `candidates[i]`.
fn first_fit<'a>(
    candidates: &[(&'a Room, usize)],
    cells: &[Vec<String>],
    window: &SlotWindow,
) -> Option<(&'a Room, usize)> {
    let (lo, _) = window.bounds();
    candidates
        .iter()
        .zip(cells)
        .find(|(_, values)| {
            window.slots().iter().all(|&slot| {
                let raw = values.get(slot - lo).map_or("", String::as_str);
                CellState::decode(raw).is_free()
            })
        })
        .map(|(&candidate, _)| candidate)
}

fn validate(start: NaiveTime, end: NaiveTime, party_size: u32) -> Result<(SlotWindow, Bucket), EngineError> {
    let window = SlotWindow::new(start, end)?;
    let bucket = Bucket::from_party_size(party_size).ok_or(EngineError::InvalidType(party_size))?;
    Ok((window, bucket))
}

impl Engine {
    /// Find the first free room of the party's bucket and mark the requested cells Held.
    ///
    /// Rejections leave the store untouched. Calls: ledger read (verified requesters only),
    /// Schedule read and batch append on a cold day, window read, hold write.
    pub async fn hold_room(&self, req: HoldRequest) -> Result<HoldTicket, EngineError> {
        let started = Instant::now();
        let result = self.try_hold(&req).await;

        let outcome = match &result {
            Ok(_) => "held",
            Err(e) => e.kind(),
        };
        metrics::counter!(observability::HOLDS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(observability::HOLD_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        match &result {
            Ok(ticket) => info!(
                "hold {} on {} {} slots {:?} for {}",
                ticket.id, ticket.day, ticket.room_id, ticket.slots, ticket.owner
            ),
            Err(e) if e.is_rejection() => debug!("hold rejected for {}: {e}", req.requester),
            Err(e) => warn!("hold failed for {}: {e}", req.requester),
        }
        result
    }

    async fn try_hold(&self, req: &HoldRequest) -> Result<HoldTicket, EngineError> {
        let (window, bucket) = validate(req.start, req.end, req.party_size)?;
        if req.requester.id().len() > MAX_REQUESTER_LEN {
            return Err(EngineError::LimitExceeded("requester id too long"));
        }

        let _section = self.bucket_section(req.day, bucket).await;

        if req.requester.is_verified() && self.active_booking_exists(&req.requester, req.day).await? {
            return Err(EngineError::AlreadyBooked {
                requester: req.requester.id().to_string(),
                day: req.day,
            });
        }

        let rows = self
            .index
            .ensure_rows_for_bucket(self.store.as_ref(), &self.config.retry, &self.catalog, req.day, bucket)
            .await?;
        let candidates: Vec<(&Room, usize)> = self
            .catalog
            .rooms_in_bucket(bucket)
            .filter_map(|room| rows.get(&room.id).map(|&row| (room, row)))
            .collect();

        let (lo, hi) = window.bounds();
        let ranges: Vec<CellRange> = candidates
            .iter()
            .map(|&(_, row)| CellRange::slots(row, lo, hi))
            .collect();
        let cells = self.read_cells(&ranges).await?;

        let Some((room, row)) = first_fit(&candidates, &cells, &window) else {
            return Err(EngineError::NoAvailability(bucket));
        };

        let held_at = now_ms();
        let ticket = HoldTicket {
            id: Ulid::new(),
            day: req.day,
            bucket,
            room_id: room.id.clone(),
            start: window.start(),
            end: window.end(),
            slots: window.slots().to_vec(),
            owner: req.requester.clone(),
            held_at,
            expires_at: self.hold_expiry(held_at),
        };
        // Registered before the write so cells from a write that landed but reported failure
        // are still owned by a ticket the reaper can release.
        self.holds.insert(ticket.id, ticket.clone());

        let tag = CellState::held_by(req.requester.id()).encode();
        let updates = coalesce(window.slots())
            .into_iter()
            .map(|(first, last)| CellUpdate::fill(CellRange::slots(row, first, last), &tag))
            .collect();
        if let Err(e) = self.store.batch_update(Table::Schedule, updates).await {
            // The cells were Free under this section, so any Held tag of ours there is this write's.
            if let Err(cleanup) = self.release_locked(&ticket).await {
                warn!("hold {} left for the reaper: {cleanup}", ticket.id);
            }
            return Err(e.into());
        }
        Ok(ticket)
    }

    /// Every room of the party's bucket that is free for the whole window, in allocation order.
    /// Read-only: rooms without a Schedule row for the day count as free and no rows are created.
    pub async fn available_rooms(
        &self,
        day: Day,
        start: NaiveTime,
        end: NaiveTime,
        party_size: u32,
    ) -> Result<Vec<Room>, EngineError> {
        let (window, bucket) = validate(start, end, party_size)?;
        let rows = self
            .index
            .day_rows(self.store.as_ref(), &self.config.retry, day)
            .await?;

        let (lo, hi) = window.bounds();
        let mut free = Vec::new();
        let mut materialized: Vec<(&Room, usize)> = Vec::new();
        for room in self.catalog.rooms_in_bucket(bucket) {
            match rows.get(&room.id) {
                Some(&row) => materialized.push((room, row)),
                None => free.push(room),
            }
        }
        let ranges: Vec<CellRange> = materialized
            .iter()
            .map(|&(_, row)| CellRange::slots(row, lo, hi))
            .collect();
        let cells = self.read_cells(&ranges).await?;
        for ((room, _), values) in materialized.iter().zip(&cells) {
            let all_free = window.slots().iter().all(|&slot| {
                CellState::decode(values.get(slot - lo).map_or("", String::as_str)).is_free()
            });
            if all_free {
                free.push(*room);
            }
        }

        // Restore catalog order across the two groups.
        let mut rooms: Vec<Room> = Vec::with_capacity(free.len());
        for room in self.catalog.rooms_in_bucket(bucket) {
            if free.iter().any(|r| r.id == room.id) {
                rooms.push(room.clone());
            }
        }
        Ok(rooms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn first_fit_skips_partially_taken_rooms() {
        let catalog = Catalog::with_counts(&[(Bucket::Small, 3)]);
        let rooms: Vec<&Room> = catalog.rooms_in_bucket(Bucket::Small).collect();
        let candidates = vec![(rooms[0], 2), (rooms[1], 3), (rooms[2], 4)];
        let window = SlotWindow::new(t(9, 0), t(10, 0)).unwrap();
        let cells: Vec<Vec<String>> = vec![
            vec!["".into(), "HOLD:1234567".into()],
            vec!["BKG-0000000001".into()],
            vec![],
        ];

        let (room, row) = first_fit(&candidates, &cells, &window).unwrap();
        assert_eq!(room.id, "S-03");
        assert_eq!(row, 4);
    }

    #[test]
    fn first_fit_none_when_all_taken() {
        let catalog = Catalog::with_counts(&[(Bucket::Solo, 1)]);
        let rooms: Vec<&Room> = catalog.rooms_in_bucket(Bucket::Solo).collect();
        let window = SlotWindow::new(t(8, 0), t(8, 30)).unwrap();
        let cells = vec![vec!["HOLD:PENDING".to_string()]];
        assert!(first_fit(&[(rooms[0], 2)], &cells, &window).is_none());
    }

    #[test]
    fn validate_orders_time_before_type() {
        assert!(matches!(
            validate(t(9, 15), t(10, 0), 0),
            Err(EngineError::InvalidTime(_))
        ));
        assert!(matches!(validate(t(9, 0), t(10, 0), 12), Err(EngineError::InvalidType(12))));
        let (window, bucket) = validate(t(14, 0), t(16, 0), 5).unwrap();
        assert_eq!(bucket, Bucket::Medium);
        assert_eq!(window.slots(), &[13, 14, 15, 16]);
    }
}
