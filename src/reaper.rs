use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, now_ms, today};
use crate::model::Ms;
use crate::observability;
use crate::store::LocalStore;

/// Release every hold expired at `now` and drop cached days before today. Returns the number
/// of holds released.
pub async fn reap_once(engine: &Engine, now: Ms) -> usize {
    let mut reaped = 0;
    for hold_id in engine.collect_expired_holds(now) {
        match engine.release_hold(hold_id).await {
            Ok(cells) => {
                reaped += 1;
                info!("reaped expired hold {hold_id} ({cells} cells)");
            }
            Err(e) => {
                // May already have been finalized or released.
                debug!("reaper skip {hold_id}: {e}");
            }
        }
    }
    if reaped > 0 {
        metrics::counter!(observability::HOLDS_REAPED_TOTAL).increment(reaped as u64);
    }
    engine.evict_before(today());
    reaped
}

/// Background task that periodically releases expired holds.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        reap_once(&engine, now_ms()).await;
    }
}

/// Background task that compacts the journal once `threshold` appends have piled up.
pub async fn run_compactor(store: Arc<LocalStore>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = store.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted journal after {appends} appends"),
            Err(e) => warn!("journal compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Bucket, Catalog};
    use crate::engine::{EngineConfig, HoldRequest};
    use crate::model::*;
    use crate::store::TabularStore;
    use chrono::NaiveTime;

    fn request(requester: &str) -> HoldRequest {
        HoldRequest {
            day: Day::from_ymd(2031, 3, 4).unwrap(),
            start: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            party_size: 1,
            requester: Requester::parse(requester),
        }
    }

    #[tokio::test]
    async fn reaper_releases_only_expired_holds() {
        let store = Arc::new(LocalStore::ephemeral());
        let engine = Engine::open(
            store.clone(),
            Catalog::with_counts(&[(Bucket::Solo, 2)]),
            EngineConfig::default(),
        )
        .await
        .unwrap();

        let ticket = engine.hold_room(request("1234567")).await.unwrap();
        assert_eq!(reap_once(&engine, now_ms()).await, 0);
        assert!(engine.hold(ticket.id).is_some());

        let later = ticket.expires_at;
        let expired = engine.collect_expired_holds(later);
        assert_eq!(expired, vec![ticket.id]);

        assert_eq!(reap_once(&engine, later).await, 1);
        assert!(engine.hold(ticket.id).is_none());
        assert!(engine.collect_expired_holds(later).is_empty());

        let occupancy = engine.occupancy(ticket.day, Bucket::Solo).await.unwrap();
        assert!(occupancy.iter().all(|room| room.cells.iter().all(CellState::is_free)));
    }

    #[tokio::test]
    async fn compactor_shrinks_journal() {
        let dir = std::env::temp_dir().join("roomslot_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("compactor.wal");
        let _ = std::fs::remove_file(&path);

        let store = Arc::new(LocalStore::open(&path).unwrap());
        store.ensure_header(Table::Bookings).await.unwrap();
        for i in 0..10 {
            store
                .batch_update(
                    Table::Bookings,
                    vec![CellUpdate::fill(CellRange::cell(1, 1), &format!("booking_id{i}"))],
                )
                .await
                .unwrap();
        }
        assert!(store.appends_since_compact().await >= 10);

        let task = tokio::spawn(run_compactor(store.clone(), 5, Duration::from_millis(10)));
        for _ in 0..100 {
            if store.appends_since_compact().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();
        assert_eq!(store.appends_since_compact().await, 0);
        assert_eq!(
            store.read_all(Table::Bookings).await.unwrap()[0][0],
            "booking_id9"
        );
    }
}
