use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Background task that cancels negotiations left unanswered for longer than `ttl`.
/// Only spawned when an expiry policy is configured.
pub async fn run_expiry(engine: Arc<Engine>, ttl: TimeDelta, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let expired = engine.expire_negotiations(ttl).await;
        for id in &expired {
            debug!("expired negotiation {id}");
        }
    }
}

/// Compact the log once enough appends have piled up. Returns whether it ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted log after {appends} appends");
            true
        }
        Err(e) => {
            warn!("log compaction failed: {e}");
            false
        }
    }
}

pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime};

    use super::*;
    use crate::negotiation::Decision;
    use crate::test_support::*;

    fn test_engine(name: &str) -> (Arc<Engine>, Arc<TestClock>) {
        let path = test_wal_path(&format!("reaper_{name}"));
        let clock = TestClock::fixture();
        let engine = engine_with(path, Arc::new(RecordingSink::default()), clock.clone());
        (Arc::new(engine), clock)
    }

    #[tokio::test]
    async fn compactor_waits_for_threshold() {
        let (engine, _) = test_engine("threshold.wal");
        engine
            .register_organizer(1, "Olga".into(), None, "olga".into())
            .await
            .unwrap();
        assert!(!compact_if_needed(&engine, 5).await);

        for i in 0..5 {
            engine
                .register_organizer(10 + i, format!("T{i}"), None, format!("t{i}"))
                .await
                .unwrap();
        }
        assert!(compact_if_needed(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.organizer_count(), 6);
    }

    #[tokio::test]
    async fn expiry_task_cancels_stale_requests() {
        let (engine, clock) = test_engine("expiry.wal");
        let olga = engine
            .register_organizer(1, "Olga".into(), None, "olga".into())
            .await
            .unwrap();
        let anna = engine
            .register_counterpart(2, "olga", "Anna".into())
            .await
            .unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        engine
            .create_booking(olga.id, anna.id, date, NaiveTime::from_hms_opt(15, 0, 0).unwrap())
            .await
            .unwrap();
        let id = engine.start_negotiation(2).await.unwrap().negotiation.id;
        clock.advance(TimeDelta::hours(2));

        let task = tokio::spawn(run_expiry(
            engine.clone(),
            TimeDelta::hours(1),
            Duration::from_millis(10),
        ));
        for _ in 0..100 {
            if engine.negotiation(id).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();

        assert!(engine.negotiation(id).await.is_err());
        assert!(matches!(
            engine.resolve_negotiation(id, 1, Decision::Decline).await,
            Err(crate::engine::EngineError::NotFound(_))
        ));
    }
}
