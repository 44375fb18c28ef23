use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Where reservations live. The scheduler holds no reservation state of its own.
///
/// Implementations must make each call atomic, and must reject (with
/// `EngineError::Conflict`) a write that would leave two active reservations
/// of one room overlapping. The scheduler serializes admissions per room, so
/// that rejection only fires when something outside this process races it.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Every Booked or CheckedIn reservation of the room.
    async fn list_active_reservations(&self, room_id: Ulid) -> Result<Vec<Reservation>, EngineError>;

    /// Active reservations of the room that overlap `stay`.
    ///
    /// Stores with an interval index should override this; the default is a
    /// linear scan over `list_active_reservations`.
    async fn find_overlapping(&self, room_id: Ulid, stay: Stay) -> Result<Vec<Reservation>, EngineError> {
        let mut hits = self.list_active_reservations(room_id).await?;
        hits.retain(|r| r.stay().overlaps(&stay));
        Ok(hits)
    }

    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, EngineError>;

    async fn list_reservations(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, EngineError>;

    /// Persist a new Booked reservation under a freshly generated id.
    async fn insert_reservation(&self, draft: NewReservation) -> Result<Reservation, EngineError>;

    /// Replace the stored row with the same id.
    async fn update_reservation(&self, reservation: Reservation) -> Result<Reservation, EngineError>;

    async fn remove_reservation(&self, id: Ulid) -> Result<Reservation, EngineError>;
}

/// Rooms and guests: existence checks consulted before admission, plus the
/// administration the front desk needs.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn room_exists(&self, id: Ulid) -> Result<bool, EngineError>;
    async fn guest_exists(&self, id: Ulid) -> Result<bool, EngineError>;

    async fn get_room(&self, id: Ulid) -> Result<Option<Room>, EngineError>;
    async fn list_rooms(&self) -> Result<Vec<Room>, EngineError>;
    async fn insert_room(&self, room: NewRoom) -> Result<Room, EngineError>;
    async fn update_room(&self, room: Room) -> Result<Room, EngineError>;
    async fn remove_room(&self, id: Ulid) -> Result<(), EngineError>;

    async fn get_guest(&self, id: Ulid) -> Result<Option<Guest>, EngineError>;
    async fn list_guests(&self) -> Result<Vec<Guest>, EngineError>;
    async fn insert_guest(&self, guest: NewGuest) -> Result<Guest, EngineError>;
    async fn update_guest(&self, guest: Guest) -> Result<Guest, EngineError>;
    async fn remove_guest(&self, id: Ulid) -> Result<(), EngineError>;
}
