use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::model::*;

use super::conflict::{check_no_conflict, now_utc, validate_stay};
use super::{EngineError, Scheduler, record_admission};

impl Scheduler {
    /// Admit a new Booked reservation.
    ///
    /// The range is validated before anything is looked up. The conflict check
    /// and the insert run under the room's admission lock.
    pub async fn create_reservation(&self, draft: NewReservation) -> Result<Reservation, EngineError> {
        let result = self.admit_new(draft).await;
        record_admission("create", &result);
        result
    }

    async fn admit_new(&self, draft: NewReservation) -> Result<Reservation, EngineError> {
        let stay = validate_stay(draft.start_date, draft.end_date)?;
        if !self.directory.room_exists(draft.room_id).await? {
            return Err(EngineError::RoomNotFound(draft.room_id));
        }
        if !self.directory.guest_exists(draft.guest_id).await? {
            return Err(EngineError::GuestNotFound(draft.guest_id));
        }

        let _lock = self.lock_room(draft.room_id).await;
        let candidates = self.store.find_overlapping(draft.room_id, stay).await?;
        check_no_conflict(candidates, &stay, None)?;
        let reservation = self.store.insert_reservation(draft).await?;
        tracing::debug!("reservation {} admitted on room {} for {stay}", reservation.id, reservation.room_id);
        Ok(reservation)
    }

    /// Replace a reservation's dates, room, guest, status or timestamps.
    ///
    /// The conflict check excludes the reservation itself and is skipped when
    /// an active reservation keeps its room and dates.
    pub async fn update_reservation(&self, updated: Reservation) -> Result<Reservation, EngineError> {
        let result = match validate_stay(updated.start_date, updated.end_date) {
            Ok(_) => self.admit_update(updated.id, move |_| updated.clone()).await,
            Err(e) => Err(e),
        };
        record_admission("update", &result);
        result
    }

    /// Read-modify-write of one reservation. `patch` sees the stored record as
    /// of the moment the room lock is held, so concurrent changes to other
    /// fields are kept.
    pub async fn modify_reservation<F>(&self, id: Ulid, patch: F) -> Result<Reservation, EngineError>
    where
        F: Fn(&Reservation) -> Reservation + Send + Sync,
    {
        let result = self.admit_update(id, patch).await;
        record_admission("update", &result);
        result
    }

    async fn admit_update<F>(&self, id: Ulid, patch: F) -> Result<Reservation, EngineError>
    where
        F: Fn(&Reservation) -> Reservation + Send + Sync,
    {
        loop {
            let seen = self
                .store
                .get_reservation(id)
                .await?
                .ok_or(EngineError::ReservationNotFound(id))?;
            let target = patch(&seen).room_id;
            let _locks = self.lock_rooms(&[seen.room_id, target]).await;

            let current = self
                .store
                .get_reservation(id)
                .await?
                .ok_or(EngineError::ReservationNotFound(id))?;
            let mut updated = patch(&current);
            updated.id = id;
            if current.room_id != seen.room_id || updated.room_id != target {
                // Moved by someone else while we waited; we hold the wrong locks.
                continue;
            }
            let stay = validate_stay(updated.start_date, updated.end_date)?;
            return self.apply_update(current, updated, stay).await;
        }
    }

    async fn apply_update(&self, current: Reservation, mut updated: Reservation, stay: Stay) -> Result<Reservation, EngineError> {
        if !current.status.can_become(updated.status) {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to: updated.status,
            });
        }
        if updated.room_id != current.room_id && !self.directory.room_exists(updated.room_id).await? {
            return Err(EngineError::RoomNotFound(updated.room_id));
        }
        if updated.guest_id != current.guest_id && !self.directory.guest_exists(updated.guest_id).await? {
            return Err(EngineError::GuestNotFound(updated.guest_id));
        }

        if updated.status == ReservationStatus::CheckedIn && updated.check_in_at.is_none() {
            updated.check_in_at = current.check_in_at.or_else(|| Some(now_utc()));
        }
        if updated.status == ReservationStatus::CheckedOut && updated.check_out_at.is_none() {
            updated.check_out_at = current.check_out_at.or_else(|| Some(now_utc()));
        }

        let moved = updated.room_id != current.room_id
            || updated.start_date != current.start_date
            || updated.end_date != current.end_date;
        let reactivated = !current.is_active();
        if updated.is_active() && (moved || reactivated) {
            let candidates = self.store.find_overlapping(updated.room_id, stay).await?;
            check_no_conflict(candidates, &stay, Some(updated.id))?;
        }

        let reservation = self.store.update_reservation(updated).await?;
        if current.status != reservation.status {
            tracing::debug!("reservation {} {} -> {}", reservation.id, current.status, reservation.status);
        }
        Ok(reservation)
    }

    /// Remove a reservation unconditionally. Its nights are free as soon as this returns.
    pub async fn delete_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let result = self.remove(id).await;
        record_admission("delete", &result);
        result
    }

    async fn remove(&self, id: Ulid) -> Result<Reservation, EngineError> {
        loop {
            let seen = self
                .store
                .get_reservation(id)
                .await?
                .ok_or(EngineError::ReservationNotFound(id))?;
            let _lock = self.lock_room(seen.room_id).await;
            let current = self
                .store
                .get_reservation(id)
                .await?
                .ok_or(EngineError::ReservationNotFound(id))?;
            if current.room_id != seen.room_id {
                continue;
            }
            return self.store.remove_reservation(id).await;
        }
    }

    async fn transition(
        &self,
        id: Ulid,
        status: ReservationStatus,
        stamp: impl Fn(&mut Reservation) + Send + Sync,
    ) -> Result<Reservation, EngineError> {
        self.modify_reservation(id, |current| {
            let mut next = current.clone();
            next.status = status;
            stamp(&mut next);
            next
        })
        .await
    }

    /// Mark the guest as arrived. `at` defaults to now (UTC).
    pub async fn check_in(&self, id: Ulid, at: Option<NaiveDateTime>) -> Result<Reservation, EngineError> {
        self.transition(id, ReservationStatus::CheckedIn, |r| {
            if at.is_some() {
                r.check_in_at = at;
            }
        })
        .await
    }

    /// Mark the guest as departed. `at` defaults to now (UTC).
    pub async fn check_out(&self, id: Ulid, at: Option<NaiveDateTime>) -> Result<Reservation, EngineError> {
        self.transition(id, ReservationStatus::CheckedOut, |r| {
            if at.is_some() {
                r.check_out_at = at;
            }
        })
        .await
    }

    /// Soft delete: the record stays but no longer holds the room.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(id, ReservationStatus::Cancelled, |_| {}).await
    }

    // ── Rooms ─────────────────────────────────────────────

    pub async fn create_room(&self, room: NewRoom) -> Result<Room, EngineError> {
        let room = self.directory.insert_room(room).await?;
        tracing::info!("room {} created as {}", room.code, room.id);
        Ok(room)
    }

    pub async fn update_room(&self, room: Room) -> Result<Room, EngineError> {
        let _lock = self.lock_room(room.id).await;
        self.directory.update_room(room).await
    }

    /// Like `modify_reservation`, for the room record itself.
    pub async fn modify_room<F>(&self, id: Ulid, patch: F) -> Result<Room, EngineError>
    where
        F: FnOnce(Room) -> Room + Send,
    {
        let _lock = self.lock_room(id).await;
        let current = self.directory.get_room(id).await?.ok_or(EngineError::RoomNotFound(id))?;
        let mut room = patch(current);
        room.id = id;
        self.directory.update_room(room).await
    }

    /// Fails with `HasReservations` while any reservation, active or not, names the room.
    pub async fn delete_room(&self, id: Ulid) -> Result<(), EngineError> {
        {
            let _lock = self.lock_room(id).await;
            if !self.directory.room_exists(id).await? {
                return Err(EngineError::RoomNotFound(id));
            }
            let booked = self.store.list_reservations(&ReservationFilter::for_room(id)).await?;
            if !booked.is_empty() {
                return Err(EngineError::HasReservations(id));
            }
            self.directory.remove_room(id).await?;
        }
        self.forget_room_lock(&id);
        tracing::info!("room {id} deleted");
        Ok(())
    }

    // ── Guests ────────────────────────────────────────────

    pub async fn create_guest(&self, guest: NewGuest) -> Result<Guest, EngineError> {
        self.directory.insert_guest(guest).await
    }

    pub async fn update_guest(&self, guest: Guest) -> Result<Guest, EngineError> {
        self.directory.update_guest(guest).await
    }

    pub async fn delete_guest(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.directory.guest_exists(id).await? {
            return Err(EngineError::GuestNotFound(id));
        }
        let booked = self.store.list_reservations(&ReservationFilter::for_guest(id)).await?;
        if !booked.is_empty() {
            return Err(EngineError::HasReservations(id));
        }
        self.directory.remove_guest(id).await
    }
}
