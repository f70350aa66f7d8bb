use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::limits::*;
use crate::model::RoomId;

/// Capacity category a room belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Solo,
    Small,
    Medium,
    Large,
}

impl Bucket {
    pub const ALL: [Bucket; 4] = [Bucket::Solo, Bucket::Small, Bucket::Medium, Bucket::Large];

    /// 1 → solo, 2–3 → small, 4–6 → medium, 7–9 → large.
    pub fn from_party_size(n: u32) -> Option<Bucket> {
        match n {
            1 => Some(Bucket::Solo),
            2..=3 => Some(Bucket::Small),
            4..=6 => Some(Bucket::Medium),
            7..=MAX_PARTY_SIZE => Some(Bucket::Large),
            _ => None,
        }
    }

    /// Name used in the Room and Schedule tables.
    pub fn name(self) -> &'static str {
        match self {
            Bucket::Solo => "solo",
            Bucket::Small => "small",
            Bucket::Medium => "medium",
            Bucket::Large => "large",
        }
    }

    /// Room-type code used in the booking ledger.
    pub fn code(self) -> &'static str {
        match self {
            Bucket::Solo => "SOLO-1",
            Bucket::Small => "DISCUSSION-S",
            Bucket::Medium => "DISCUSSION-M",
            Bucket::Large => "DISCUSSION-L",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Bucket::Solo => "Solo room",
            Bucket::Small => "Small discussion room",
            Bucket::Medium => "Medium discussion room",
            Bucket::Large => "Large discussion room",
        }
    }

    pub fn from_name(name: &str) -> Option<Bucket> {
        let name = name.trim();
        Self::ALL.into_iter().find(|b| b.name().eq_ignore_ascii_case(name))
    }

    pub fn from_code(code: &str) -> Option<Bucket> {
        let code = code.trim();
        Self::ALL.into_iter().find(|b| b.code().eq_ignore_ascii_case(code))
    }

    /// Inclusive `(min, max)` occupants.
    pub fn capacity(self) -> (u32, u32) {
        match self {
            Bucket::Solo => (1, 1),
            Bucket::Small => (2, 3),
            Bucket::Medium => (4, 6),
            Bucket::Large => (7, MAX_PARTY_SIZE),
        }
    }

    fn id_prefix(self) -> &'static str {
        match self {
            Bucket::Solo => "SOLO",
            Bucket::Small => "S",
            Bucket::Medium => "M",
            Bucket::Large => "L",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub bucket: Bucket,
    pub capacity_min: u32,
    pub capacity_max: u32,
}

impl Room {
    fn to_row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.bucket.name().to_string(),
            self.capacity_min.to_string(),
            self.capacity_max.to_string(),
        ]
    }
}

/// Room counts of the reference deployment.
pub const REFERENCE_COUNTS: [(Bucket, usize); 4] = [
    (Bucket::Solo, 18),
    (Bucket::Small, 22),
    (Bucket::Medium, 13),
    (Bucket::Large, 8),
];

/// Fixed room inventory. Order within a bucket is the first-fit allocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    rooms: Vec<Room>,
}

impl Catalog {
    pub fn reference() -> Self {
        Self::with_counts(&REFERENCE_COUNTS)
    }

    /// Rooms named `<prefix>-NN`, numbered from 1 within each bucket.
    pub fn with_counts(counts: &[(Bucket, usize)]) -> Self {
        let mut rooms = Vec::new();
        for &(bucket, count) in counts {
            let (capacity_min, capacity_max) = bucket.capacity();
            for i in 1..=count {
                rooms.push(Room {
                    id: format!("{}-{i:02}", bucket.id_prefix()),
                    bucket,
                    capacity_min,
                    capacity_max,
                });
            }
        }
        Self { rooms }
    }

    /// Load from a Room table image (header row first).
    pub fn from_rows(rows: &[Vec<String>]) -> Result<Self, EngineError> {
        let mut rooms: Vec<Room> = Vec::new();
        for (i, row) in rows.iter().enumerate().skip(1) {
            let field = |col: usize| row.get(col).map(|s| s.trim()).unwrap_or("");
            let corrupt = |what: &str| {
                EngineError::DataCorruption(format!("Rooms row {}: {what}", i + 1))
            };
            let id = field(0);
            if id.is_empty() {
                continue;
            }
            let bucket = Bucket::from_name(field(1)).ok_or_else(|| corrupt("unknown room_type"))?;
            let capacity_min = field(2).parse().map_err(|_| corrupt("bad capacity_min"))?;
            let capacity_max = field(3).parse().map_err(|_| corrupt("bad capacity_max"))?;
            if rooms.iter().any(|r| r.id == id) {
                return Err(corrupt("duplicate room_id"));
            }
            rooms.push(Room {
                id: id.to_string(),
                bucket,
                capacity_min,
                capacity_max,
            });
        }
        for bucket in Bucket::ALL {
            if rooms.iter().filter(|r| r.bucket == bucket).count() > MAX_ROOMS_PER_BUCKET {
                return Err(EngineError::LimitExceeded("too many rooms in bucket"));
            }
        }
        Ok(Self { rooms })
    }

    pub fn to_rows(&self) -> Vec<Vec<String>> {
        self.rooms.iter().map(Room::to_row).collect()
    }

    pub fn rooms_in_bucket(&self, bucket: Bucket) -> impl Iterator<Item = &Room> {
        self.rooms.iter().filter(move |r| r.bucket == bucket)
    }

    pub fn room(&self, id: &str) -> Option<&Room> {
        self.rooms.iter().find(|r| r.id == id)
    }

    pub fn rooms(&self) -> &[Room] {
        &self.rooms
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
