use tracing::{error, info, warn};
use ulid::Ulid;

use crate::catalog::Bucket;
use crate::model::*;
use crate::observability;
use crate::slots::{coalesce, expand};

use super::ledger::created_at_now;
use super::{BookingRecord, BookingStatus, Engine, EngineError, new_booking_id, now_ms};

impl Engine {
    /// Turn a live hold into an active booking.
    ///
    /// The ticket's cells are re-read under the (day, bucket) section and must all still carry
    /// the owner's Held tag. On success they are rewritten to a new booking id in one write and
    /// one ledger row is appended. If either write fails, the Held tag goes back on every cell
    /// that took the new id.
    pub async fn finalize(
        &self,
        ticket: &HoldTicket,
        requester: &Requester,
    ) -> Result<BookingRecord, EngineError> {
        if !requester.is_verified() {
            return Err(EngineError::UnverifiedRequester);
        }
        if ticket.owner.is_verified() && ticket.owner != *requester {
            return Err(EngineError::HoldExpiredOrStolen(ticket.id));
        }

        let _requester_section = self.requester_section(ticket.day, requester.id()).await;
        let _section = self.bucket_section(ticket.day, ticket.bucket).await;

        // The registry copy is authoritative; a ticket that is gone was released or reaped.
        let Some(current) = self.holds.get(&ticket.id).map(|t| t.value().clone()) else {
            return Err(EngineError::HoldExpiredOrStolen(ticket.id));
        };
        if current.is_expired(now_ms()) {
            if let Err(e) = self.release_locked(&current).await {
                warn!("releasing expired hold {}: {e}", current.id);
            }
            return Err(EngineError::HoldExpiredOrStolen(current.id));
        }

        if self.active_booking_exists(requester, current.day).await? {
            return Err(EngineError::AlreadyBooked {
                requester: requester.id().to_string(),
                day: current.day,
            });
        }

        let room = self
            .catalog
            .room(&current.room_id)
            .ok_or_else(|| EngineError::UnknownRoom(current.room_id.clone()))?;
        let row = self
            .index
            .ensure_row(self.store.as_ref(), &self.config.retry, current.day, room)
            .await?;

        let ranges: Vec<CellRange> = coalesce(&current.slots)
            .into_iter()
            .map(|(first, last)| CellRange::slots(row, first, last))
            .collect();
        let cells = self.read_cells(&ranges).await?;
        let owner = current.owner.id();
        let still_held = cells.iter().map(Vec::len).sum::<usize>() == current.slots.len()
            && cells.iter().flatten().all(|raw| CellState::decode(raw).is_held_by(owner));
        if !still_held {
            self.holds.remove(&current.id);
            warn!("hold {} lost its cells before finalize", current.id);
            return Err(EngineError::HoldExpiredOrStolen(current.id));
        }

        let booking_id = new_booking_id();
        let booked = ranges
            .iter()
            .map(|&range| CellUpdate::fill(range, &booking_id))
            .collect();
        if let Err(e) = self.store.batch_update(Table::Schedule, booked).await {
            self.restore_held(&ranges, owner, &booking_id).await;
            return Err(e.into());
        }

        let record = BookingRecord {
            booking_id,
            requester_id: requester.id().to_string(),
            day: current.day,
            start: current.start,
            end: current.end,
            bucket: current.bucket,
            room_id: current.room_id.clone(),
            slots: current.slots.clone(),
            created_at: created_at_now(),
            status: BookingStatus::Active,
        };
        if let Err(e) = self.append_booking(&record).await {
            self.restore_held(&ranges, owner, &record.booking_id).await;
            return Err(e);
        }

        self.holds.remove(&current.id);
        metrics::counter!(observability::BOOKINGS_FINALIZED_TOTAL).increment(1);
        info!(
            "booked {} for {} on {} {} {:?}",
            record.booking_id, requester, record.day, record.room_id, record.slots
        );
        Ok(record)
    }

    /// Put `owner`'s Held tag back on every cell of `ranges` that carries `booking_id`.
    /// Caller holds the ticket's section.
    async fn restore_held(&self, ranges: &[CellRange], owner: &str, booking_id: &str) {
        let result = async {
            let cells = self.read_cells(ranges).await?;
            let tag = CellState::held_by(owner).encode();
            let mut updates = Vec::new();
            for (range, values) in ranges.iter().zip(&cells) {
                let landed: Vec<usize> = values
                    .iter()
                    .enumerate()
                    .filter(|(_, raw)| CellState::decode(raw).is_booking(booking_id))
                    .map(|(i, _)| range.first_col + i)
                    .collect();
                for (first, last) in coalesce(&landed) {
                    updates.push(CellUpdate::fill(CellRange::new(range.row, first, last), &tag));
                }
            }
            if !updates.is_empty() {
                self.store.batch_update(Table::Schedule, updates).await?;
            }
            Ok::<(), EngineError>(())
        }
        .await;
        if let Err(e) = result {
            error!("booking {booking_id} not recorded and cells not restored: {e}");
        }
    }

    /// `finalize` for a ticket looked up by id.
    pub async fn finalize_by_id(
        &self,
        hold_id: Ulid,
        requester: &Requester,
    ) -> Result<BookingRecord, EngineError> {
        let ticket = self.hold(hold_id).ok_or(EngineError::HoldNotFound(hold_id))?;
        self.finalize(&ticket, requester).await
    }

    /// Give a hold up. Only cells still carrying the owner's Held tag are cleared; returns how
    /// many were.
    pub async fn release_hold(&self, hold_id: Ulid) -> Result<usize, EngineError> {
        let ticket = self.hold(hold_id).ok_or(EngineError::HoldNotFound(hold_id))?;
        let _section = self.bucket_section(ticket.day, ticket.bucket).await;
        if !self.holds.contains_key(&hold_id) {
            return Err(EngineError::HoldNotFound(hold_id));
        }
        self.release_locked(&ticket).await
    }

    /// Caller holds the ticket's (day, bucket) section.
    pub(super) async fn release_locked(&self, ticket: &HoldTicket) -> Result<usize, EngineError> {
        let rows = self
            .index
            .day_rows(self.store.as_ref(), &self.config.retry, ticket.day)
            .await?;
        let Some(&row) = rows.get(&ticket.room_id) else {
            self.holds.remove(&ticket.id);
            return Ok(0);
        };

        let runs = coalesce(&ticket.slots);
        let ranges: Vec<CellRange> = runs
            .iter()
            .map(|&(first, last)| CellRange::slots(row, first, last))
            .collect();
        let cells = self.read_cells(&ranges).await?;

        let owner = ticket.owner.id();
        let held: Vec<Slot> = expand(&runs)
            .into_iter()
            .zip(cells.iter().flatten())
            .filter(|(_, raw)| CellState::decode(raw).is_held_by(owner))
            .map(|(slot, _)| slot)
            .collect();

        if !held.is_empty() {
            let cleared = coalesce(&held)
                .into_iter()
                .map(|(first, last)| CellUpdate::fill(CellRange::slots(row, first, last), ""))
                .collect();
            self.store.batch_update(Table::Schedule, cleared).await?;
        }
        self.holds.remove(&ticket.id);
        info!("released hold {} ({} cells)", ticket.id, held.len());
        Ok(held.len())
    }

    /// Cancel every active booking of `requester` on `day`; returns how many were cancelled.
    ///
    /// Only cells still carrying the booking's id are cleared, so a retry after a failed status
    /// write leaves later holds alone. One ledger read, at most one Schedule read, one cell read,
    /// one write clearing the cells and one write marking all rows cancelled. Rows that cannot be
    /// decoded are skipped.
    pub async fn cancel(&self, requester: &Requester, day: Day) -> Result<usize, EngineError> {
        let _requester_section = self.requester_section(day, requester.id()).await;

        let targets = self.active_bookings(requester, day).await?;
        if targets.is_empty() {
            return Ok(0);
        }

        let mut buckets: Vec<Bucket> = targets.iter().map(|(_, record)| record.bucket).collect();
        buckets.sort();
        buckets.dedup();
        let mut guards = Vec::with_capacity(buckets.len());
        for bucket in buckets {
            guards.push(self.bucket_section(day, bucket).await);
        }

        let rows = self
            .index
            .day_rows(self.store.as_ref(), &self.config.retry, day)
            .await?;
        // (row, booking id, slots) per range, in range order.
        let mut owners: Vec<(usize, &str, Vec<Slot>)> = Vec::new();
        let mut ranges = Vec::new();
        for (_, record) in &targets {
            let Some(&row) = rows.get(&record.room_id) else {
                warn!(
                    "booking {}: no schedule row for {} on {day}, cells left as is",
                    record.booking_id, record.room_id
                );
                continue;
            };
            for run in coalesce(&record.slots) {
                ranges.push(CellRange::slots(row, run.0, run.1));
                owners.push((row, record.booking_id.as_str(), expand(&[run])));
            }
        }
        let cells = self.read_cells(&ranges).await?;

        // A cell may have been freed by an earlier attempt and taken since; only our id is cleared.
        let mut cleared = Vec::new();
        for ((row, booking_id, slots), values) in owners.iter().zip(&cells) {
            let ours: Vec<Slot> = slots
                .iter()
                .zip(values)
                .filter(|(_, raw)| CellState::decode(raw).is_booking(booking_id))
                .map(|(&slot, _)| slot)
                .collect();
            for (first, last) in coalesce(&ours) {
                cleared.push(CellUpdate::fill(CellRange::slots(*row, first, last), ""));
            }
        }
        if !cleared.is_empty() {
            self.store.batch_update(Table::Schedule, cleared).await?;
        }

        let ledger_rows: Vec<usize> = targets.iter().map(|(row, _)| row.row).collect();
        self.mark_cancelled(&ledger_rows).await?;

        let cancelled = targets.len();
        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(cancelled as u64);
        info!("cancelled {cancelled} bookings for {requester} on {day}");
        Ok(cancelled)
    }
}
