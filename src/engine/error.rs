use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::ReservationStatus;

#[derive(Debug)]
pub enum EngineError {
    /// Empty, inverted, out-of-calendar or over-long date range.
    InvalidRange {
        start: NaiveDate,
        end: NaiveDate,
        reason: &'static str,
    },
    RoomNotFound(Ulid),
    GuestNotFound(Ulid),
    ReservationNotFound(Ulid),
    /// The requested stay overlaps this active reservation.
    Conflict(Ulid),
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    /// A room or guest cannot be removed while reservations still reference it.
    HasReservations(Ulid),
    AlreadyExists(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::RoomNotFound(_)
                | EngineError::GuestNotFound(_)
                | EngineError::ReservationNotFound(_)
        )
    }

    /// Status code a REST route layer answers with.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::InvalidRange { .. }
            | EngineError::Conflict(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::LimitExceeded(_) => 400,
            EngineError::RoomNotFound(_)
            | EngineError::GuestNotFound(_)
            | EngineError::ReservationNotFound(_) => 404,
            EngineError::HasReservations(_) | EngineError::AlreadyExists(_) => 409,
            EngineError::WalError(_) => 500,
        }
    }

    /// SQLSTATE reported over the wire protocol.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::InvalidRange { .. } => "22008",
            EngineError::RoomNotFound(_)
            | EngineError::GuestNotFound(_)
            | EngineError::ReservationNotFound(_) => "P0002",
            EngineError::Conflict(_) => "23P01",
            EngineError::InvalidTransition { .. } => "55000",
            EngineError::HasReservations(_) => "23503",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange { start, end, reason } => {
                write!(f, "invalid range [{start}, {end}): {reason}")
            }
            EngineError::RoomNotFound(id) => write!(f, "room not found: {id}"),
            EngineError::GuestNotFound(id) => write!(f, "guest not found: {id}"),
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::Conflict(id) => {
                write!(f, "room is not available for the given dates: conflicts with reservation {id}")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "reservation cannot go from {from} to {to}")
            }
            EngineError::HasReservations(id) => {
                write!(f, "cannot delete {id}: reservations still reference it")
            }
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
