use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;
use crate::observability::WAL_COMPACTIONS_TOTAL;

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

/// One compactor pass. Returns whether the log was rewritten.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
            info!(appends, shifts = engine.shift_count(), "WAL compacted");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::Calendar;
    use crate::devices::DeviceRegistry;
    use crate::model::*;
    use crate::wal::Wal;

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let dir = std::env::temp_dir().join("shiftboard_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("threshold.wal");
        let _ = std::fs::remove_file(&path);

        let engine = Engine::new(path.clone(), DeviceRegistry::default(), Calendar::default()).unwrap();
        let admin = Actor::new("admin", Role::Admin);
        for i in 0..4 {
            let s = engine
                .create_shift(&admin, "u1", "MAC1", i * 1000, i * 1000 + 500)
                .await
                .unwrap();
            engine.delete_shift(&admin, s.id).await.unwrap();
        }
        engine.create_shift(&admin, "u1", "MAC1", 0, 10).await.unwrap();

        assert!(!compact_if_needed(&engine, 100).await);
        assert_eq!(Wal::replay(&path).unwrap().len(), 9);

        assert!(compact_if_needed(&engine, 9).await);
        assert_eq!(Wal::replay(&path).unwrap().len(), 1);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
