use ulid::Ulid;

use crate::catalog::Bucket;
use crate::model::Day;
use crate::slots::TimeError;
use crate::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    InvalidTime(TimeError),
    /// Party size with no matching bucket.
    InvalidType(u32),
    AlreadyBooked { requester: String, day: Day },
    NoAvailability(Bucket),
    HoldExpiredOrStolen(Ulid),
    HoldNotFound(Ulid),
    UnverifiedRequester,
    UnknownRoom(String),
    DataCorruption(String),
    StoreUnavailable(String),
    LimitExceeded(&'static str),
}

impl EngineError {
    /// Expected outcomes of a request, as opposed to faults of the engine or its store.
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            EngineError::DataCorruption(_)
                | EngineError::StoreUnavailable(_)
                | EngineError::LimitExceeded(_)
        )
    }

    /// Stable label for metrics and command responses.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidTime(_) => "invalid_time",
            EngineError::InvalidType(_) => "invalid_type",
            EngineError::AlreadyBooked { .. } => "already_booked",
            EngineError::NoAvailability(_) => "no_availability",
            EngineError::HoldExpiredOrStolen(_) => "hold_expired_or_stolen",
            EngineError::HoldNotFound(_) => "hold_not_found",
            EngineError::UnverifiedRequester => "unverified_requester",
            EngineError::UnknownRoom(_) => "unknown_room",
            EngineError::DataCorruption(_) => "data_corruption",
            EngineError::StoreUnavailable(_) => "store_unavailable",
            EngineError::LimitExceeded(_) => "limit_exceeded",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidTime(e) => write!(f, "invalid time window: {e}"),
            EngineError::InvalidType(n) => write!(f, "no room type fits a party of {n}"),
            EngineError::AlreadyBooked { requester, day } => {
                write!(f, "requester {requester} already has an active booking on {day}")
            }
            EngineError::NoAvailability(bucket) => {
                write!(f, "no {} free for the requested slots", bucket.display_name().to_lowercase())
            }
            EngineError::HoldExpiredOrStolen(id) => {
                write!(f, "hold {id} expired or its slots were taken")
            }
            EngineError::HoldNotFound(id) => write!(f, "hold not found: {id}"),
            EngineError::UnverifiedRequester => {
                write!(f, "a 7-digit requester id is required to confirm")
            }
            EngineError::UnknownRoom(id) => write!(f, "unknown room: {id}"),
            EngineError::DataCorruption(msg) => write!(f, "data corruption: {msg}"),
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<TimeError> for EngineError {
    fn from(e: TimeError) -> Self {
        EngineError::InvalidTime(e)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::StoreUnavailable(e.to_string())
    }
}
