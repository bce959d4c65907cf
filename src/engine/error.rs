use ulid::Ulid;

use crate::model::BookingStatus;

/// Why a booking request was not admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Malformed date or time fields. The detail names the violated constraint.
    InvalidInput(String),
    /// The requested slot intersects an active booking of the same amenity and day.
    SlotOverlap(Ulid),
    /// The booking would be the resident's third consecutive day on this amenity.
    ConsecutiveDayLimitExceeded,
}

impl Rejection {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::InvalidInput(_) => "invalid_input",
            Rejection::SlotOverlap(_) => "slot_overlap",
            Rejection::ConsecutiveDayLimitExceeded => "consecutive_day_limit",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::InvalidInput(detail) => write!(f, "invalid input: {detail}"),
            Rejection::SlotOverlap(id) => {
                write!(f, "time slot already taken by booking {id}")
            }
            Rejection::ConsecutiveDayLimitExceeded => {
                write!(f, "cannot book the same amenity for more than 2 consecutive days")
            }
        }
    }
}

impl std::error::Error for Rejection {}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Rejected(Rejection),
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    NotActive(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl From<Rejection> for EngineError {
    fn from(r: Rejection) -> Self {
        EngineError::Rejected(r)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "booking already exists: {id}"),
            EngineError::Rejected(r) => write!(f, "booking rejected: {r}"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "booking {id} cannot move from {from} to {to}")
            }
            EngineError::NotActive(id) => write!(f, "booking {id} is cancelled"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Rejected(r) => Some(r),
            _ => None,
        }
    }
}
