use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::free_windows;
use super::conflict::{colliding, validate_stay, validate_window};
use super::{EngineError, Scheduler};

impl Scheduler {
    /// True when no active reservation on the room, other than `exclude`,
    /// overlaps `[start, end)`. Read-only; takes no admission lock and does
    /// not check that the room exists.
    pub async fn is_available(
        &self,
        room_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        Ok(self.conflicts(room_id, start, end, exclude).await?.is_empty())
    }

    /// The active reservations that `[start, end)` would collide with.
    pub async fn conflicts(
        &self,
        room_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let stay = validate_window(start, end)?;
        let candidates = self.store.find_overlapping(room_id, stay).await?;
        Ok(colliding(candidates, &stay, exclude))
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.store
            .get_reservation(id)
            .await?
            .ok_or(EngineError::ReservationNotFound(id))
    }

    pub async fn list_reservations(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, EngineError> {
        self.store.list_reservations(filter).await
    }

    /// Free sub-ranges of `[start, end)` on one room.
    pub async fn free_windows(&self, room_id: Ulid, start: NaiveDate, end: NaiveDate) -> Result<Vec<Stay>, EngineError> {
        let window = validate_window(start, end)?;
        if !self.directory.room_exists(room_id).await? {
            return Err(EngineError::RoomNotFound(room_id));
        }
        let booked: Vec<Stay> = self
            .store
            .find_overlapping(room_id, window)
            .await?
            .iter()
            .filter(|r| r.is_active())
            .map(Reservation::stay)
            .collect();
        Ok(free_windows(&window, &booked))
    }

    /// Rooms open for sale with nothing active overlapping the stay, ordered by code.
    pub async fn available_rooms(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<Room>, EngineError> {
        let stay = validate_stay(start, end)?;
        let mut free = Vec::new();
        for room in self.directory.list_rooms().await? {
            if room.status != RoomStatus::Available {
                continue;
            }
            let candidates = self.store.find_overlapping(room.id, stay).await?;
            if colliding(candidates, &stay, None).is_empty() {
                free.push(room);
            }
        }
        Ok(free)
    }

    pub async fn get_room(&self, id: Ulid) -> Result<Room, EngineError> {
        self.directory
            .get_room(id)
            .await?
            .ok_or(EngineError::RoomNotFound(id))
    }

    pub async fn list_rooms(&self) -> Result<Vec<Room>, EngineError> {
        self.directory.list_rooms().await
    }

    pub async fn get_guest(&self, id: Ulid) -> Result<Guest, EngineError> {
        self.directory
            .get_guest(id)
            .await?
            .ok_or(EngineError::GuestNotFound(id))
    }

    pub async fn list_guests(&self) -> Result<Vec<Guest>, EngineError> {
        self.directory.list_guests().await
    }
}
