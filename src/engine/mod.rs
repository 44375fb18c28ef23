mod availability;
mod conflict;
mod error;
mod journal;
mod memory;
mod mutations;
mod queries;
mod store;
#[cfg(test)]
mod tests;

pub use availability::{free_windows, merge_overlapping, subtract_intervals};
pub use error::EngineError;
pub use memory::{MemoryStore, RoomState, SharedRoomState};
pub use store::{Directory, ReservationStore};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::observability::ADMISSIONS_TOTAL;

/// The reservation scheduler core.
///
/// Holds no reservation state: everything lives behind `store`. What it does
/// own is one admission lock per room, so the conflict check and the write
/// that follows it are never interleaved with another admission on the same
/// room. Admissions on different rooms never wait on each other.
pub struct Scheduler {
    store: Arc<dyn ReservationStore>,
    directory: Arc<dyn Directory>,
    room_locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn ReservationStore>, directory: Arc<dyn Directory>) -> Self {
        Self {
            store,
            directory,
            room_locks: DashMap::new(),
        }
    }

    /// Scheduler over a `MemoryStore` that plays both collaborators.
    pub fn with_memory_store(store: Arc<MemoryStore>) -> Self {
        Self::new(store.clone(), store)
    }

    fn room_lock(&self, room_id: Ulid) -> Arc<Mutex<()>> {
        self.room_locks.entry(room_id).or_default().value().clone()
    }

    pub(super) async fn lock_room(&self, room_id: Ulid) -> OwnedMutexGuard<()> {
        self.room_lock(room_id).lock_owned().await
    }

    /// Acquire admission locks in sorted order to prevent deadlocks.
    pub(super) async fn lock_rooms(&self, room_ids: &[Ulid]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids = room_ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock_room(id).await);
        }
        guards
    }

    pub(super) fn forget_room_lock(&self, room_id: &Ulid) {
        self.room_locks.remove(room_id);
    }
}

fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(EngineError::Conflict(_)) => "conflict",
        Err(e) if e.is_not_found() => "not_found",
        Err(EngineError::InvalidRange { .. }) | Err(EngineError::InvalidTransition { .. }) => "invalid",
        Err(EngineError::LimitExceeded(_)) => "limit",
        Err(_) => "error",
    }
}

pub(super) fn record_admission<T>(operation: &'static str, result: &Result<T, EngineError>) {
    metrics::counter!(ADMISSIONS_TOTAL, "operation" => operation, "outcome" => outcome_label(result))
        .increment(1);
}
