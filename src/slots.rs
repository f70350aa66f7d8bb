use std::fmt;

use chrono::{NaiveTime, Timelike};

use crate::limits::*;
use crate::model::Slot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeError {
    /// Before opening or at/after closing.
    OutOfHours,
    /// Not on a :00 / :30 boundary.
    Misaligned,
    /// End is not after start.
    EmptyWindow,
    TooLong { slots: usize },
}

impl fmt::Display for TimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeError::OutOfHours => write!(
                f,
                "time outside opening hours {OPEN_HOUR:02}:00-{CLOSE_HOUR:02}:00"
            ),
            TimeError::Misaligned => write!(f, "times must fall on {SLOT_MINUTES}-minute boundaries"),
            TimeError::EmptyWindow => write!(f, "end time must be after start time"),
            TimeError::TooLong { slots } => write!(
                f,
                "{slots} slots requested, at most {MAX_BOOKING_SLOTS} allowed"
            ),
        }
    }
}

impl std::error::Error for TimeError {}

fn minute_of_day(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

fn is_aligned(time: NaiveTime) -> bool {
    time.second() == 0 && time.nanosecond() == 0 && time.minute() % SLOT_MINUTES == 0
}

/// 1-based slot containing `time`.
pub fn slot_index(time: NaiveTime) -> Result<Slot, TimeError> {
    let minute = minute_of_day(time);
    if !(OPEN_MINUTE..CLOSE_MINUTE).contains(&minute) {
        return Err(TimeError::OutOfHours);
    }
    Ok(((minute - OPEN_MINUTE) / SLOT_MINUTES) as Slot + 1)
}

/// Ascending contiguous slots covering `[start, end)`. Callers validate alignment and duration.
pub fn slots_for_period(start: NaiveTime, end: NaiveTime) -> Result<Vec<Slot>, TimeError> {
    let first = slot_index(start)?;
    let count = (minute_of_day(end).saturating_sub(minute_of_day(start)) / SLOT_MINUTES) as usize;
    Ok((first..first + count).collect())
}

/// Wall-clock start of a slot; `None` outside `1..=SLOTS_PER_DAY`.
pub fn slot_start(slot: Slot) -> Option<NaiveTime> {
    if !(1..=SLOTS_PER_DAY).contains(&slot) {
        return None;
    }
    let minute = OPEN_MINUTE + (slot as u32 - 1) * SLOT_MINUTES;
    NaiveTime::from_hms_opt(minute / 60, minute % 60, 0)
}

/// Wall-clock end of a slot (start of the next one).
pub fn slot_end(slot: Slot) -> Option<NaiveTime> {
    if !(1..=SLOTS_PER_DAY).contains(&slot) {
        return None;
    }
    let minute = OPEN_MINUTE + slot as u32 * SLOT_MINUTES;
    NaiveTime::from_hms_opt(minute / 60, minute % 60, 0)
}

/// A validated booking window: aligned, within opening hours, at most `MAX_BOOKING_SLOTS` long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotWindow {
    start: NaiveTime,
    end: NaiveTime,
    slots: Vec<Slot>,
}

impl SlotWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, TimeError> {
        if !is_aligned(start) || !is_aligned(end) {
            return Err(TimeError::Misaligned);
        }
        let (s, e) = (minute_of_day(start), minute_of_day(end));
        if e <= s {
            return Err(TimeError::EmptyWindow);
        }
        if s < OPEN_MINUTE || e > CLOSE_MINUTE {
            return Err(TimeError::OutOfHours);
        }
        let count = ((e - s) / SLOT_MINUTES) as usize;
        if count > MAX_BOOKING_SLOTS {
            return Err(TimeError::TooLong { slots: count });
        }
        let slots = slots_for_period(start, end)?;
        Ok(Self { start, end, slots })
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Inclusive `(min, max)` slot bounds.
    pub fn bounds(&self) -> (Slot, Slot) {
        // Non-empty by construction.
        let first = self.slots.first().copied().unwrap_or(1);
        let last = self.slots.last().copied().unwrap_or(first);
        (first, last)
    }
}

/// Merge slot indices into inclusive `(first, last)` runs of consecutive slots.
/// Input order and duplicates do not matter.
pub fn coalesce(slots: &[Slot]) -> Vec<(Slot, Slot)> {
    let mut sorted = slots.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs: Vec<(Slot, Slot)> = Vec::new();
    for slot in sorted {
        if let Some(last) = runs.last_mut()
            && slot == last.1 + 1 {
                last.1 = slot;
                continue;
            }
        runs.push((slot, slot));
    }
    runs
}

/// Inverse of `coalesce`.
pub fn expand(runs: &[(Slot, Slot)]) -> Vec<Slot> {
    runs.iter().flat_map(|&(first, last)| first..=last).collect()
}

/// `hh:mm AM/PM`, the ledger's time rendering.
pub fn display_time(time: NaiveTime) -> String {
    time.format("%I:%M %p").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn slot_index_bounds() {
        assert_eq!(slot_index(t(8, 0)), Ok(1));
        assert_eq!(slot_index(t(8, 29)), Ok(1));
        assert_eq!(slot_index(t(8, 30)), Ok(2));
        assert_eq!(slot_index(t(14, 0)), Ok(13));
        assert_eq!(slot_index(t(19, 30)), Ok(24));
        assert_eq!(slot_index(t(20, 0)), Err(TimeError::OutOfHours));
        assert_eq!(slot_index(t(7, 59)), Err(TimeError::OutOfHours));
    }

    #[test]
    fn period_to_slots() {
        assert_eq!(slots_for_period(t(14, 0), t(16, 0)), Ok(vec![13, 14, 15, 16]));
        assert_eq!(slots_for_period(t(8, 0), t(8, 30)), Ok(vec![1]));
        assert_eq!(slots_for_period(t(19, 30), t(20, 0)), Ok(vec![24]));
    }

    #[test]
    fn slot_start_end_inverse() {
        for slot in 1..=SLOTS_PER_DAY {
            let start = slot_start(slot).unwrap();
            assert_eq!(slot_index(start), Ok(slot));
            assert_eq!(slot_end(slot).unwrap(), start + chrono::Duration::minutes(30));
        }
        assert_eq!(slot_start(0), None);
        assert_eq!(slot_start(25), None);
        assert_eq!(slot_end(24), Some(t(20, 0)));
    }

    #[test]
    fn window_accepts_full_two_hours() {
        let w = SlotWindow::new(t(14, 0), t(16, 0)).unwrap();
        assert_eq!(w.slots(), &[13, 14, 15, 16]);
        assert_eq!(w.bounds(), (13, 16));
        assert_eq!(w.start(), t(14, 0));
        assert_eq!(w.end(), t(16, 0));
    }

    #[test]
    fn window_ending_at_close_is_valid() {
        let w = SlotWindow::new(t(18, 30), t(20, 0)).unwrap();
        assert_eq!(w.slots(), &[22, 23, 24]);
    }

    #[test]
    fn window_rejections() {
        assert_eq!(SlotWindow::new(t(14, 15), t(15, 0)), Err(TimeError::Misaligned));
        assert_eq!(
            SlotWindow::new(NaiveTime::from_hms_opt(14, 0, 30).unwrap(), t(15, 0)),
            Err(TimeError::Misaligned)
        );
        assert_eq!(SlotWindow::new(t(15, 0), t(15, 0)), Err(TimeError::EmptyWindow));
        assert_eq!(SlotWindow::new(t(16, 0), t(14, 0)), Err(TimeError::EmptyWindow));
        assert_eq!(SlotWindow::new(t(7, 30), t(8, 30)), Err(TimeError::OutOfHours));
        assert_eq!(SlotWindow::new(t(19, 30), t(20, 30)), Err(TimeError::OutOfHours));
        assert_eq!(
            SlotWindow::new(t(9, 0), t(11, 30)),
            Err(TimeError::TooLong { slots: 5 })
        );
    }

    #[test]
    fn coalesce_runs() {
        assert_eq!(coalesce(&[5, 6, 7, 10, 11]), vec![(5, 7), (10, 11)]);
        assert!(coalesce(&[]).is_empty());
        assert_eq!(coalesce(&[3]), vec![(3, 3)]);
    }

    #[test]
    fn coalesce_is_order_independent() {
        assert_eq!(coalesce(&[11, 5, 7, 10, 6]), coalesce(&[5, 6, 7, 10, 11]));
        assert_eq!(coalesce(&[6, 5, 6, 5]), vec![(5, 6)]);
    }

    #[test]
    fn coalesce_is_idempotent() {
        for input in [vec![5, 6, 7, 10, 11], vec![1, 3, 5], vec![24, 23, 1, 2]] {
            let once = coalesce(&input);
            assert_eq!(coalesce(&expand(&once)), once);
        }
    }

    #[test]
    fn ledger_time_rendering() {
        assert_eq!(display_time(t(14, 0)), "02:00 PM");
        assert_eq!(display_time(t(8, 30)), "08:30 AM");
    }
}
