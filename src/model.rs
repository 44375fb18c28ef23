use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open stay `[start, end)` in calendar days. `end` is the departure day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stay {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Stay {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start < end, "Stay start must be before end");
        Self { start, end }
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn overlaps(&self, other: &Stay) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Stay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Booked,
    CheckedIn,
    CheckedOut,
    Cancelled,
}

impl ReservationStatus {
    /// Active reservations hold their room; only they take part in conflict checks.
    pub fn is_active(self) -> bool {
        matches!(self, ReservationStatus::Booked | ReservationStatus::CheckedIn)
    }

    pub fn can_become(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        self == next
            || matches!(
                (self, next),
                (Booked, CheckedIn) | (Booked, Cancelled) | (CheckedIn, CheckedOut) | (Cancelled, Booked)
            )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Booked => "booked",
            ReservationStatus::CheckedIn => "checked_in",
            ReservationStatus::CheckedOut => "checked_out",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().replace('-', "_").as_str() {
            "booked" => Some(ReservationStatus::Booked),
            "checked_in" | "checkedin" => Some(ReservationStatus::CheckedIn),
            "checked_out" | "checkedout" => Some(ReservationStatus::CheckedOut),
            "cancelled" | "canceled" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomStatus {
    Available,
    Unavailable,
}

impl RoomStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomStatus::Available => "available",
            RoomStatus::Unavailable => "unavailable",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "available" => Some(RoomStatus::Available),
            "unavailable" => Some(RoomStatus::Unavailable),
            _ => None,
        }
    }
}

/// One booking of a room by a guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub room_id: Ulid,
    pub guest_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Actual arrival, independent of the planned stay.
    pub check_in_at: Option<NaiveDateTime>,
    /// Actual departure, independent of the planned stay.
    pub check_out_at: Option<NaiveDateTime>,
    pub status: ReservationStatus,
}

impl Reservation {
    pub fn stay(&self) -> Stay {
        Stay::new(self.start_date, self.end_date)
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// A reservation candidate before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub room_id: Ulid,
    pub guest_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Search criteria; every `None` field matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub room_id: Option<Ulid>,
    pub guest_id: Option<Ulid>,
    pub starts_on_or_after: Option<NaiveDate>,
    pub ends_on_or_before: Option<NaiveDate>,
    pub status: Option<ReservationStatus>,
}

impl ReservationFilter {
    pub fn for_room(room_id: Ulid) -> Self {
        Self { room_id: Some(room_id), ..Self::default() }
    }

    pub fn for_guest(guest_id: Ulid) -> Self {
        Self { guest_id: Some(guest_id), ..Self::default() }
    }

    pub fn matches(&self, r: &Reservation) -> bool {
        self.room_id.is_none_or(|id| r.room_id == id)
            && self.guest_id.is_none_or(|id| r.guest_id == id)
            && self.starts_on_or_after.is_none_or(|d| r.start_date >= d)
            && self.ends_on_or_before.is_none_or(|d| r.end_date <= d)
            && self.status.is_none_or(|s| r.status == s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    /// Front-desk code, unique across rooms (e.g. "101A").
    pub code: String,
    pub status: RoomStatus,
    /// Minor currency units.
    pub price_per_night: u32,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRoom {
    pub code: String,
    pub status: RoomStatus,
    pub price_per_night: u32,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub id: Ulid,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGuest {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Per-room conflict index.
///
/// Active reservations are kept sorted by start date. They never overlap, so
/// their end dates are sorted too and an overlap query is two binary searches.
/// Inactive reservations are kept only so the room can list its history.
#[derive(Debug, Clone, Default)]
pub struct RoomSchedule {
    active: Vec<Reservation>,
    inactive: Vec<Reservation>,
}

impl RoomSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert maintaining start-date order for active reservations.
    /// The caller has already checked that an active reservation does not overlap.
    pub fn insert(&mut self, reservation: Reservation) {
        if reservation.is_active() {
            let pos = self
                .active
                .partition_point(|r| r.start_date < reservation.start_date);
            debug_assert!(
                self.active.get(pos).is_none_or(|next| !next.stay().overlaps(&reservation.stay())),
                "overlapping active reservation inserted"
            );
            self.active.insert(pos, reservation);
        } else {
            self.inactive.push(reservation);
        }
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Reservation> {
        if let Some(pos) = self.active.iter().position(|r| r.id == id) {
            return Some(self.active.remove(pos));
        }
        let pos = self.inactive.iter().position(|r| r.id == id)?;
        Some(self.inactive.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.active
            .iter()
            .chain(self.inactive.iter())
            .find(|r| r.id == id)
    }

    /// Active reservations whose stay overlaps `stay`.
    pub fn overlapping(&self, stay: &Stay) -> impl Iterator<Item = &Reservation> {
        // Everything before `lo` departs on or before the arrival day; everything
        // from `hi` on arrives on or after the departure day.
        let lo = self.active.partition_point(|r| r.end_date <= stay.start);
        let hi = self.active.partition_point(|r| r.start_date < stay.end);
        self.active[lo..hi.max(lo)].iter()
    }

    pub fn active(&self) -> &[Reservation] {
        &self.active
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reservation> {
        self.active.iter().chain(self.inactive.iter())
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.inactive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.inactive.is_empty()
    }
}

/// Journal record. Each variant carries the full row so replay never
/// depends on earlier state beyond the row's own identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated(Room),
    RoomUpdated(Room),
    RoomDeleted { id: Ulid },
    GuestCreated(Guest),
    GuestUpdated(Guest),
    GuestDeleted { id: Ulid },
    ReservationCreated(Reservation),
    ReservationUpdated {
        previous_room_id: Ulid,
        reservation: Reservation,
    },
    ReservationDeleted { id: Ulid, room_id: Ulid },
}

#[cfg(test)]
pub(crate) fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}
