use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;

/// Background task that expires stale waitlist entries and re-offers
/// slots whose offers lapsed.
pub async fn run_waitlist_sweep(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let outcome = engine.sweep_waitlist().await;
        let promoted = outcome.promotion.booked.len() + outcome.promotion.notified.len();
        if promoted > 0 {
            info!("tenant {}: sweep re-offered {promoted} slot(s)", engine.tenant());
        }
    }
}

/// Background task that compacts the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.appends_since_compact().await;
        if appends < threshold {
            debug!("tenant {}: {appends} appends since compaction", engine.tenant());
            continue;
        }
        match engine.compact().await {
            Ok(()) => info!("tenant {}: compacted WAL after {appends} appends", engine.tenant()),
            Err(e) => error!("tenant {}: WAL compaction failed: {e}", engine.tenant()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::{EngineDeps, WaitlistFilter, WaitlistRequest};
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("studioslot_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    // 2025-06-10T08:00:00Z
    const NOW: Ms = 1_749_542_400_000;

    #[tokio::test]
    async fn sweep_task_expires_started_slots() {
        let clock = Arc::new(ManualClock::new(NOW));
        let deps = EngineDeps { clock: clock.clone(), ..EngineDeps::default() };
        let path = test_wal_path("sweep_expires.wal");
        let engine = Arc::new(Engine::new("t", &path, TenantSettings::default(), deps).unwrap());
        let studio = Ulid::new();
        engine.create_studio(Actor::Admin, studio, None, 1).await.unwrap();

        let placement = engine
            .join_waitlist(WaitlistRequest {
                id: Ulid::new(),
                client_id: Ulid::new(),
                studio_id: Some(studio),
                preferred_date: chrono::NaiveDate::from_ymd_opt(2025, 6, 10).unwrap(),
                preferred_time_slot: TimeOfDay::from_hm(10, 0).unwrap(),
                notes: None,
            })
            .await
            .unwrap();

        clock.set(NOW + 3 * HOUR_MS);
        let task = tokio::spawn(run_waitlist_sweep(engine.clone(), Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        let entries = engine
            .list_waitlist(&WaitlistFilter { id: Some(placement.entry.id), ..Default::default() })
            .await;
        assert_eq!(entries[0].0.status, WaitlistStatus::Expired);
        assert_eq!(entries[0].1, None);
    }

    #[tokio::test]
    async fn compactor_task_shrinks_wal() {
        let path = test_wal_path("compactor.wal");
        let engine = Arc::new(Engine::new("t", &path, TenantSettings::default(), EngineDeps::default()).unwrap());
        let studio = Ulid::new();
        engine.create_studio(Actor::Admin, studio, None, 1).await.unwrap();
        for minutes in 20..30 {
            engine.set_setting(Actor::Admin, "session_minutes", &minutes.to_string()).await.unwrap();
        }
        assert_eq!(engine.appends_since_compact().await, 11);

        let task = tokio::spawn(run_compactor(engine.clone(), 5));
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        assert_eq!(engine.appends_since_compact().await, 0);
        let events = crate::wal::Wal::replay(&path).unwrap();
        assert_eq!(events.len(), 2);
    }
}
