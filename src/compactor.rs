use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::engine::{Engine, EngineError};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the WAL if at least `threshold` events were appended since the
/// last compaction. Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compactor: {appends}/{threshold} appends, skipping");
        return Ok(false);
    }
    engine.compact_wal().await?;
    Ok(true)
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            error!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::Wal;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("guestbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn below_threshold_is_noop() {
        let path = test_wal_path("below.wal");
        let engine = Engine::new(path).unwrap();
        engine.provision_table(1, 4).await.unwrap();

        assert!(!compact_if_needed(&engine, 10).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 1);
    }

    #[tokio::test]
    async fn at_threshold_compacts_and_resets() {
        let path = test_wal_path("at_threshold.wal");
        let engine = Engine::new(path.clone()).unwrap();
        engine.provision_table(1, 10).await.unwrap();
        engine.reserve("john", 1, 2).await.unwrap();
        engine.arrive("john", 2).await.unwrap();
        engine.depart("john").await.unwrap();

        assert!(compact_if_needed(&engine, 4).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        let events = Wal::replay(&path).unwrap();
        assert_eq!(events.len(), 1);
    }
}
