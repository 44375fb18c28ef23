use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;
use super::conflict::EMPTY_RANGE;
use super::journal::Journal;
use super::store::{Directory, ReservationStore};

pub struct RoomState {
    pub room: Room,
    pub schedule: RoomSchedule,
    /// Set when the room is deleted, for writers that fetched the state just before.
    retired: bool,
}

impl RoomState {
    fn new(room: Room) -> Self {
        Self { room, schedule: RoomSchedule::new(), retired: false }
    }
}

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// In-memory store with an optional write-ahead journal.
///
/// Every mutation is journaled before it is applied, under the write lock of
/// the room it touches. `write_gate` is held shared by every mutation and
/// exclusively by compaction and guest removal, which need a stable view
/// across rooms.
pub struct MemoryStore {
    rooms: DashMap<Ulid, SharedRoomState>,
    room_codes: DashMap<String, Ulid>,
    guests: DashMap<Ulid, Guest>,
    reservation_to_room: DashMap<Ulid, Ulid>,
    write_gate: RwLock<()>,
    journal: Option<Journal>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain maps the journal is replayed into before the store goes live.
#[derive(Default)]
struct Replay {
    rooms: HashMap<Ulid, RoomState>,
    guests: HashMap<Ulid, Guest>,
}

impl Replay {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::RoomCreated(room) => {
                self.rooms.insert(room.id, RoomState::new(room.clone()));
            }
            Event::RoomUpdated(room) => {
                if let Some(state) = self.rooms.get_mut(&room.id) {
                    state.room = room.clone();
                }
            }
            Event::RoomDeleted { id } => {
                self.rooms.remove(id);
            }
            Event::GuestCreated(guest) | Event::GuestUpdated(guest) => {
                self.guests.insert(guest.id, guest.clone());
            }
            Event::GuestDeleted { id } => {
                self.guests.remove(id);
            }
            Event::ReservationCreated(reservation) => {
                if let Some(state) = self.rooms.get_mut(&reservation.room_id) {
                    state.schedule.insert(reservation.clone());
                }
            }
            Event::ReservationUpdated { previous_room_id, reservation } => {
                if let Some(state) = self.rooms.get_mut(previous_room_id) {
                    state.schedule.remove(reservation.id);
                }
                if let Some(state) = self.rooms.get_mut(&reservation.room_id) {
                    state.schedule.insert(reservation.clone());
                }
            }
            Event::ReservationDeleted { id, room_id } => {
                if let Some(state) = self.rooms.get_mut(room_id) {
                    state.schedule.remove(*id);
                }
            }
        }
    }
}

impl MemoryStore {
    /// A store that forgets everything on drop.
    pub fn new() -> Self {
        Self::from_replay(Replay::default(), None)
    }

    /// Replay the journal at `path` and keep appending to it. Must run inside a runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (journal, events) = Journal::open(path)?;
        let mut replay = Replay::default();
        for event in &events {
            replay.apply(event);
        }
        tracing::info!(
            "replayed {} events from {}: {} rooms, {} guests",
            events.len(),
            path.display(),
            replay.rooms.len(),
            replay.guests.len()
        );
        Ok(Self::from_replay(replay, Some(journal)))
    }

    fn from_replay(replay: Replay, journal: Option<Journal>) -> Self {
        let store = Self {
            rooms: DashMap::new(),
            room_codes: DashMap::new(),
            guests: DashMap::new(),
            reservation_to_room: DashMap::new(),
            write_gate: RwLock::new(()),
            journal,
        };
        for (id, state) in replay.rooms {
            store.room_codes.insert(state.room.code.clone(), id);
            for r in state.schedule.iter() {
                store.reservation_to_room.insert(r.id, id);
            }
            store.rooms.insert(id, Arc::new(RwLock::new(state)));
        }
        for (id, guest) in replay.guests {
            store.guests.insert(id, guest);
        }
        store
    }

    async fn persist(&self, event: &Event) -> Result<(), EngineError> {
        match &self.journal {
            Some(journal) => journal.append(event).await,
            None => Ok(()),
        }
    }

    fn room_state(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    /// Snapshot the room handles so no map guard is held across an await.
    fn all_room_states(&self) -> Vec<SharedRoomState> {
        self.rooms.iter().map(|e| e.value().clone()).collect()
    }

    pub fn is_journaled(&self) -> bool {
        self.journal.is_some()
    }

    pub async fn appends_since_compact(&self) -> u64 {
        match &self.journal {
            Some(journal) => journal.appends_since_compact().await,
            None => 0,
        }
    }

    /// Rewrite the journal as the minimal set of events that rebuilds the current state.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let _gate = self.write_gate.write().await;

        let mut rooms = Vec::new();
        let mut reservations = Vec::new();
        for state in self.all_room_states() {
            let guard = state.read().await;
            rooms.push(Event::RoomCreated(guard.room.clone()));
            reservations.extend(guard.schedule.iter().cloned().map(Event::ReservationCreated));
        }
        let guests = self.guests.iter().map(|e| Event::GuestCreated(e.value().clone()));

        let mut events = rooms;
        events.extend(guests);
        events.extend(reservations);
        let count = events.len();
        journal.compact(events).await?;
        tracing::info!("journal compacted to {count} events");
        Ok(())
    }

    fn check_guest_fields(first_name: &str, last_name: &str, email: &Option<String>, phone: &Option<String>) -> Result<(), EngineError> {
        if first_name.len() > MAX_NAME_LEN || last_name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("guest name too long"));
        }
        if email.as_ref().is_some_and(|e| e.len() > MAX_NAME_LEN)
            || phone.as_ref().is_some_and(|p| p.len() > MAX_NAME_LEN)
        {
            return Err(EngineError::LimitExceeded("guest contact too long"));
        }
        Ok(())
    }

    fn check_room_fields(code: &str, description: &Option<String>) -> Result<(), EngineError> {
        if code.is_empty() || code.len() > MAX_CODE_LEN {
            return Err(EngineError::LimitExceeded("room code must be 1-32 bytes"));
        }
        if description.as_ref().is_some_and(|d| d.len() > MAX_TEXT_LEN) {
            return Err(EngineError::LimitExceeded("room description too long"));
        }
        Ok(())
    }

    /// Claim `code` for `room_id`, failing if another room holds it.
    fn claim_code(&self, code: &str, room_id: Ulid) -> Result<(), EngineError> {
        match self.room_codes.entry(code.to_string()) {
            Entry::Occupied(e) if *e.get() != room_id => {
                Err(EngineError::AlreadyExists(format!("room with code {code}")))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(e) => {
                e.insert(room_id);
                Ok(())
            }
        }
    }
}

fn check_stay(start: chrono::NaiveDate, end: chrono::NaiveDate) -> Result<Stay, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidRange { start, end, reason: EMPTY_RANGE });
    }
    Ok(Stay::new(start, end))
}

fn first_conflict(schedule: &RoomSchedule, stay: &Stay, exclude: Ulid) -> Option<Ulid> {
    schedule.overlapping(stay).find(|r| r.id != exclude).map(|r| r.id)
}

#[async_trait]
impl ReservationStore for MemoryStore {
    async fn list_active_reservations(&self, room_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let Some(state) = self.room_state(&room_id) else {
            return Ok(Vec::new());
        };
        let guard = state.read().await;
        Ok(guard.schedule.active().to_vec())
    }

    async fn find_overlapping(&self, room_id: Ulid, stay: Stay) -> Result<Vec<Reservation>, EngineError> {
        let Some(state) = self.room_state(&room_id) else {
            return Ok(Vec::new());
        };
        let guard = state.read().await;
        Ok(guard.schedule.overlapping(&stay).cloned().collect())
    }

    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, EngineError> {
        let Some(room_id) = self.reservation_to_room.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(state) = self.room_state(&room_id) else {
            return Ok(None);
        };
        let guard = state.read().await;
        Ok(guard.schedule.get(id).cloned())
    }

    async fn list_reservations(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, EngineError> {
        let states = match filter.room_id {
            Some(room_id) => self.room_state(&room_id).into_iter().collect(),
            None => self.all_room_states(),
        };
        let mut out = Vec::new();
        for state in states {
            let guard = state.read().await;
            out.extend(guard.schedule.iter().filter(|r| filter.matches(r)).cloned());
        }
        out.sort_by(|a, b| a.start_date.cmp(&b.start_date).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn insert_reservation(&self, draft: NewReservation) -> Result<Reservation, EngineError> {
        let stay = check_stay(draft.start_date, draft.end_date)?;
        let state = self
            .room_state(&draft.room_id)
            .ok_or(EngineError::RoomNotFound(draft.room_id))?;
        let _gate = self.write_gate.read().await;
        if !self.guests.contains_key(&draft.guest_id) {
            return Err(EngineError::GuestNotFound(draft.guest_id));
        }
        let mut guard = state.write().await;
        if guard.retired {
            return Err(EngineError::RoomNotFound(draft.room_id));
        }
        if guard.schedule.len() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations on room"));
        }
        if let Some(existing) = first_conflict(&guard.schedule, &stay, Ulid::nil()) {
            return Err(EngineError::Conflict(existing));
        }

        let reservation = Reservation {
            id: Ulid::new(),
            room_id: draft.room_id,
            guest_id: draft.guest_id,
            start_date: draft.start_date,
            end_date: draft.end_date,
            check_in_at: None,
            check_out_at: None,
            status: ReservationStatus::Booked,
        };
        self.persist(&Event::ReservationCreated(reservation.clone())).await?;
        guard.schedule.insert(reservation.clone());
        self.reservation_to_room.insert(reservation.id, reservation.room_id);
        Ok(reservation)
    }

    async fn update_reservation(&self, reservation: Reservation) -> Result<Reservation, EngineError> {
        let stay = check_stay(reservation.start_date, reservation.end_date)?;
        let previous_room_id = self
            .reservation_to_room
            .get(&reservation.id)
            .map(|e| *e.value())
            .ok_or(EngineError::ReservationNotFound(reservation.id))?;
        let from_state = self
            .room_state(&previous_room_id)
            .ok_or(EngineError::ReservationNotFound(reservation.id))?;
        let to_state = self
            .room_state(&reservation.room_id)
            .ok_or(EngineError::RoomNotFound(reservation.room_id))?;

        let _gate = self.write_gate.read().await;
        if !self.guests.contains_key(&reservation.guest_id) {
            return Err(EngineError::GuestNotFound(reservation.guest_id));
        }

        let event = Event::ReservationUpdated {
            previous_room_id,
            reservation: reservation.clone(),
        };

        if previous_room_id == reservation.room_id {
            let mut guard = from_state.write().await;
            if guard.retired || guard.schedule.get(reservation.id).is_none() {
                return Err(EngineError::ReservationNotFound(reservation.id));
            }
            if reservation.is_active()
                && let Some(existing) = first_conflict(&guard.schedule, &stay, reservation.id)
            {
                return Err(EngineError::Conflict(existing));
            }
            self.persist(&event).await?;
            guard.schedule.remove(reservation.id);
            guard.schedule.insert(reservation.clone());
            return Ok(reservation);
        }

        // Moving rooms: take both write locks in id order so two opposite moves can't deadlock.
        let (mut from, mut to) = if previous_room_id < reservation.room_id {
            let from = from_state.write_owned().await;
            let to = to_state.write_owned().await;
            (from, to)
        } else {
            let to = to_state.write_owned().await;
            let from = from_state.write_owned().await;
            (from, to)
        };
        if from.retired || from.schedule.get(reservation.id).is_none() {
            return Err(EngineError::ReservationNotFound(reservation.id));
        }
        if to.retired {
            return Err(EngineError::RoomNotFound(reservation.room_id));
        }
        if to.schedule.len() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations on room"));
        }
        if reservation.is_active()
            && let Some(existing) = first_conflict(&to.schedule, &stay, reservation.id)
        {
            return Err(EngineError::Conflict(existing));
        }
        self.persist(&event).await?;
        from.schedule.remove(reservation.id);
        to.schedule.insert(reservation.clone());
        self.reservation_to_room.insert(reservation.id, reservation.room_id);
        Ok(reservation)
    }

    async fn remove_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let room_id = self
            .reservation_to_room
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::ReservationNotFound(id))?;
        let state = self
            .room_state(&room_id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let _gate = self.write_gate.read().await;
        let mut guard = state.write().await;
        if guard.schedule.get(id).is_none() {
            return Err(EngineError::ReservationNotFound(id));
        }
        self.persist(&Event::ReservationDeleted { id, room_id }).await?;
        let removed = guard
            .schedule
            .remove(id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        self.reservation_to_room.remove(&id);
        Ok(removed)
    }
}

#[async_trait]
impl Directory for MemoryStore {
    async fn room_exists(&self, id: Ulid) -> Result<bool, EngineError> {
        Ok(self.rooms.contains_key(&id))
    }

    async fn guest_exists(&self, id: Ulid) -> Result<bool, EngineError> {
        Ok(self.guests.contains_key(&id))
    }

    async fn get_room(&self, id: Ulid) -> Result<Option<Room>, EngineError> {
        let Some(state) = self.room_state(&id) else {
            return Ok(None);
        };
        let guard = state.read().await;
        Ok(Some(guard.room.clone()))
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, EngineError> {
        let mut rooms = Vec::new();
        for state in self.all_room_states() {
            rooms.push(state.read().await.room.clone());
        }
        rooms.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(rooms)
    }

    async fn insert_room(&self, new: NewRoom) -> Result<Room, EngineError> {
        Self::check_room_fields(&new.code, &new.description)?;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        let room = Room {
            id: Ulid::new(),
            code: new.code,
            status: new.status,
            price_per_night: new.price_per_night,
            description: new.description,
        };
        let _gate = self.write_gate.read().await;
        self.claim_code(&room.code, room.id)?;
        if let Err(e) = self.persist(&Event::RoomCreated(room.clone())).await {
            self.room_codes.remove(&room.code);
            return Err(e);
        }
        self.rooms
            .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
        Ok(room)
    }

    async fn update_room(&self, room: Room) -> Result<Room, EngineError> {
        Self::check_room_fields(&room.code, &room.description)?;
        let state = self
            .room_state(&room.id)
            .ok_or(EngineError::RoomNotFound(room.id))?;
        let _gate = self.write_gate.read().await;
        let mut guard = state.write().await;
        if guard.retired {
            return Err(EngineError::RoomNotFound(room.id));
        }
        let old_code = guard.room.code.clone();
        let renamed = old_code != room.code;
        if renamed {
            self.claim_code(&room.code, room.id)?;
        }
        if let Err(e) = self.persist(&Event::RoomUpdated(room.clone())).await {
            if renamed {
                self.room_codes.remove(&room.code);
            }
            return Err(e);
        }
        if renamed {
            self.room_codes.remove(&old_code);
        }
        guard.room = room.clone();
        Ok(room)
    }

    async fn remove_room(&self, id: Ulid) -> Result<(), EngineError> {
        let state = self.room_state(&id).ok_or(EngineError::RoomNotFound(id))?;
        let _gate = self.write_gate.read().await;
        let mut guard = state.write().await;
        if guard.retired {
            return Err(EngineError::RoomNotFound(id));
        }
        if !guard.schedule.is_empty() {
            return Err(EngineError::HasReservations(id));
        }
        self.persist(&Event::RoomDeleted { id }).await?;
        guard.retired = true;
        self.rooms.remove(&id);
        self.room_codes.remove(&guard.room.code);
        Ok(())
    }

    async fn get_guest(&self, id: Ulid) -> Result<Option<Guest>, EngineError> {
        Ok(self.guests.get(&id).map(|e| e.value().clone()))
    }

    async fn list_guests(&self) -> Result<Vec<Guest>, EngineError> {
        let mut guests: Vec<Guest> = self.guests.iter().map(|e| e.value().clone()).collect();
        guests.sort_by(|a, b| {
            (&a.last_name, &a.first_name, a.id).cmp(&(&b.last_name, &b.first_name, b.id))
        });
        Ok(guests)
    }

    async fn insert_guest(&self, new: NewGuest) -> Result<Guest, EngineError> {
        Self::check_guest_fields(&new.first_name, &new.last_name, &new.email, &new.phone)?;
        if self.guests.len() >= MAX_GUESTS {
            return Err(EngineError::LimitExceeded("too many guests"));
        }
        let guest = Guest {
            id: Ulid::new(),
            first_name: new.first_name,
            last_name: new.last_name,
            email: new.email,
            phone: new.phone,
        };
        let _gate = self.write_gate.read().await;
        self.persist(&Event::GuestCreated(guest.clone())).await?;
        self.guests.insert(guest.id, guest.clone());
        Ok(guest)
    }

    async fn update_guest(&self, guest: Guest) -> Result<Guest, EngineError> {
        Self::check_guest_fields(&guest.first_name, &guest.last_name, &guest.email, &guest.phone)?;
        let _gate = self.write_gate.read().await;
        if !self.guests.contains_key(&guest.id) {
            return Err(EngineError::GuestNotFound(guest.id));
        }
        self.persist(&Event::GuestUpdated(guest.clone())).await?;
        self.guests.insert(guest.id, guest.clone());
        Ok(guest)
    }

    async fn remove_guest(&self, id: Ulid) -> Result<(), EngineError> {
        // Exclusive: no reservation can be written for this guest while we look.
        let _gate = self.write_gate.write().await;
        if !self.guests.contains_key(&id) {
            return Err(EngineError::GuestNotFound(id));
        }
        for state in self.all_room_states() {
            let guard = state.read().await;
            if guard.schedule.iter().any(|r| r.guest_id == id) {
                return Err(EngineError::HasReservations(id));
            }
        }
        self.persist(&Event::GuestDeleted { id }).await?;
        self.guests.remove(&id);
        Ok(())
    }
}
