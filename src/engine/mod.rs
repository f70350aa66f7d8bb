mod availability;
mod error;
mod index;
mod ledger;
mod mutations;
mod queries;

pub use availability::HoldRequest;
pub use error::EngineError;
pub use index::ScheduleIndex;
pub use ledger::{BookingRecord, BookingStatus, LedgerRow};
pub use queries::RoomOccupancy;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};
use ulid::Ulid;

use crate::catalog::{Bucket, Catalog};
use crate::limits::*;
use crate::model::*;
use crate::slots::{coalesce, slot_end, slot_start};
use crate::store::{StoreError, TabularStore};

/// Read retry schedule. Writes are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub hold_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_ttl: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub fn today() -> Day {
    Day::new(chrono::Local::now().date_naive())
}

/// `BKG-` followed by the ten random characters of a fresh ULID.
pub(crate) fn new_booking_id() -> String {
    let id = Ulid::new().to_string();
    format!("BKG-{}", &id[id.len() - 10..])
}

/// Run an idempotent store read, retrying transient failures with linear backoff.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: &'static str,
    mut call: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                attempt += 1;
                warn!("{op} failed ({e}), retry {attempt}/{}", policy.attempts);
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

type Section = Arc<Mutex<()>>;

pub struct Engine {
    pub(crate) store: Arc<dyn TabularStore>,
    pub(crate) catalog: Catalog,
    pub(crate) index: ScheduleIndex,
    pub(crate) holds: DashMap<Ulid, HoldTicket>,
    /// Serializes read-then-write of schedule cells per (day, bucket).
    sections: DashMap<(Day, Bucket), Section>,
    /// Serializes the one-booking-per-day check per (day, requester).
    requester_sections: DashMap<(Day, String), Section>,
    pub(crate) config: EngineConfig,
}

impl Engine {
    /// Prepare the store (headers, Room table) and recover holds left in the Schedule table.
    ///
    /// `seed` is written to an empty Room table; otherwise the stored rooms win.
    pub async fn open(
        store: Arc<dyn TabularStore>,
        seed: Catalog,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        for table in Table::ALL {
            store.ensure_header(table).await?;
        }

        let rows = {
            let store = store.as_ref();
            with_retry(&config.retry, "read_all", move || store.read_all(Table::Rooms)).await?
        };
        let catalog = if rows.len() <= 1 {
            store.append_rows(Table::Rooms, seed.to_rows()).await?;
            info!("seeded {} rooms", seed.len());
            seed
        } else {
            Catalog::from_rows(&rows)?
        };

        let engine = Self {
            store,
            catalog,
            index: ScheduleIndex::new(),
            holds: DashMap::new(),
            sections: DashMap::new(),
            requester_sections: DashMap::new(),
            config,
        };

        let adopted = engine.adopt_orphan_holds().await?;
        if adopted > 0 {
            info!("adopted {adopted} holds found in the schedule");
        }
        Ok(engine)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) async fn bucket_section(&self, day: Day, bucket: Bucket) -> OwnedMutexGuard<()> {
        let section = self.sections.entry((day, bucket)).or_default().value().clone();
        section.lock_owned().await
    }

    pub(crate) async fn requester_section(&self, day: Day, requester: &str) -> OwnedMutexGuard<()> {
        let section = self
            .requester_sections
            .entry((day, requester.to_string()))
            .or_default()
            .value()
            .clone();
        section.lock_owned().await
    }

    /// Batched Schedule read, retried.
    pub(crate) async fn read_cells(&self, ranges: &[CellRange]) -> Result<Vec<Vec<String>>, EngineError> {
        if ranges.is_empty() {
            return Ok(Vec::new());
        }
        if ranges.len() > MAX_BATCH_RANGES {
            return Err(EngineError::LimitExceeded("too many ranges in one read"));
        }
        let store = self.store.as_ref();
        let cells = with_retry(&self.config.retry, "batch_get", move || {
            store.batch_get(Table::Schedule, ranges)
        })
        .await?;
        Ok(cells)
    }

    pub(crate) fn hold_expiry(&self, held_at: Ms) -> Ms {
        held_at + self.config.hold_ttl.as_millis() as Ms
    }

    /// Drop cached state for days before `day`. Sections still in use are kept.
    pub fn evict_before(&self, day: Day) {
        self.index.evict_before(day);
        self.sections
            .retain(|(d, _), section| *d >= day || Arc::strong_count(section) > 1);
        self.requester_sections
            .retain(|(d, _), section| *d >= day || Arc::strong_count(section) > 1);
    }

    /// Register a ticket for every run of Held cells in the store. Runs are split per owner
    /// and per room; each gets a fresh TTL.
    async fn adopt_orphan_holds(&self) -> Result<usize, EngineError> {
        let rows = {
            let store = self.store.as_ref();
            with_retry(&self.config.retry, "read_all", move || store.read_all(Table::Schedule)).await?
        };

        let now = now_ms();
        let mut adopted = 0;
        for (i, row) in rows.iter().enumerate().skip(1) {
            let field = |col: usize| row.get(col).map(|s| s.trim()).unwrap_or("");
            let mut held: HashMap<String, Vec<Slot>> = HashMap::new();
            for slot in 1..=SLOTS_PER_DAY {
                // Slot k lives in 1-based column 3 + k, i.e. index 2 + k.
                if let CellState::Held { owner } = CellState::decode(field(SLOT_COLUMN_OFFSET + slot - 1)) {
                    held.entry(owner).or_default().push(slot);
                }
            }
            if held.is_empty() {
                continue;
            }

            let (Some(day), Some(room)) = (Day::parse(field(0)), self.catalog.room(field(1))) else {
                warn!("Schedule row {}: held cells on an unknown day or room, skipped", i + 1);
                continue;
            };
            for (owner, slots) in held {
                for (first, last) in coalesce(&slots) {
                    let (Some(start), Some(end)) = (slot_start(first), slot_end(last)) else {
                        continue;
                    };
                    let ticket = HoldTicket {
                        id: Ulid::new(),
                        day,
                        bucket: room.bucket,
                        room_id: room.id.clone(),
                        start,
                        end,
                        slots: (first..=last).collect(),
                        owner: Requester::parse(&owner),
                        held_at: now,
                        expires_at: self.hold_expiry(now),
                    };
                    self.holds.insert(ticket.id, ticket);
                    adopted += 1;
                }
            }
        }
        Ok(adopted)
    }
}
