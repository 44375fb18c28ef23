use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::MemoryStore;
use crate::observability::COMPACTIONS_TOTAL;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Background task that rewrites the journal once enough appends pile up.
pub async fn run_compactor(store: Arc<MemoryStore>, threshold: u64) {
    if !store.is_journaled() {
        return;
    }
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// Returns true when a compaction ran successfully.
pub async fn compact_if_due(store: &MemoryStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold.max(1) {
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            info!("compacted journal after {appends} appends");
            metrics::counter!(COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            true
        }
        Err(e) => {
            tracing::error!("journal compaction failed: {e}");
            metrics::counter!(COMPACTIONS_TOTAL, "status" => "error").increment(1);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Scheduler;
    use crate::model::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("innkeep_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn room(code: &str) -> NewRoom {
        NewRoom {
            code: code.into(),
            status: RoomStatus::Available,
            price_per_night: 10_000,
            description: None,
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = Arc::new(MemoryStore::open(&path).unwrap());
        let scheduler = Scheduler::with_memory_store(store.clone());

        scheduler.create_room(room("101")).await.unwrap();
        assert!(!compact_if_due(&store, 5).await);

        for code in ["102", "103", "104", "105"] {
            scheduler.create_room(room(code)).await.unwrap();
        }
        assert!(compact_if_due(&store, 5).await);
        assert_eq!(store.appends_since_compact().await, 0);

        drop(scheduler);
        drop(store);
        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(Scheduler::with_memory_store(Arc::new(reopened)).list_rooms().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn in_memory_store_never_compacts() {
        let store = Arc::new(MemoryStore::new());
        assert!(!compact_if_due(&store, 0).await);
    }
}
