//! Processing statistics on top of a [`StatsRepository`].

use std::sync::Arc;

use crate::error::StorageError;
use crate::storage::StatsRepository;
use crate::types::{DetailedStatistics, OperationKind, OperationStatistics, Statistics};

/// Records and reports upload and processing counters.
pub struct StatsService {
    repo: Arc<dyn StatsRepository>,
}

impl StatsService {
    pub fn new(repo: Arc<dyn StatsRepository>) -> Self {
        Self { repo }
    }

    pub async fn record_uploaded(&self, size: u64) -> Result<(), StorageError> {
        tracing::debug!(size, "Recording upload");
        self.repo.increment_uploaded(size).await
    }

    /// Count a successful stage of `kind` that took `duration_ms`.
    pub async fn record_processed(
        &self,
        kind: OperationKind,
        duration_ms: f64,
    ) -> Result<(), StorageError> {
        tracing::debug!(operation = %kind, duration_ms, "Recording processed");
        self.repo.increment_processed(duration_ms).await?;
        self.repo
            .update_operation_statistics(kind, true, duration_ms)
            .await
    }

    /// Count a failed stage of `kind`.
    pub async fn record_failed(
        &self,
        kind: OperationKind,
        duration_ms: f64,
    ) -> Result<(), StorageError> {
        tracing::debug!(operation = %kind, duration_ms, "Recording failure");
        self.repo.increment_failed().await?;
        self.repo
            .update_operation_statistics(kind, false, duration_ms)
            .await
    }

    /// Count a failure that cannot be attributed to a known operation kind.
    pub async fn record_unclassified_failure(&self) -> Result<(), StorageError> {
        self.repo.increment_failed().await
    }

    /// Aggregate counters with the most used operation filled in.
    ///
    /// A failed most-used lookup is reported as `"unknown"` rather than
    /// failing the whole call.
    pub async fn get_statistics(&self) -> Result<Statistics, StorageError> {
        let mut stats = self.repo.get_statistics().await?;
        stats.most_used_operation = match self.repo.get_most_used_operation().await {
            Ok(kind) => kind.map(|k| k.as_str().to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to look up most used operation");
                Some("unknown".to_string())
            }
        };
        Ok(stats)
    }

    pub async fn operation_statistics(&self) -> Result<Vec<OperationStatistics>, StorageError> {
        self.repo.get_operation_statistics().await
    }

    /// Aggregate and per-operation counters plus the success rate.
    pub async fn detailed_statistics(&self) -> Result<DetailedStatistics, StorageError> {
        let general = self.get_statistics().await?;
        let operations = self.operation_statistics().await?;
        let success_rate = success_rate(general.total_processed, general.total_failed);
        Ok(DetailedStatistics {
            general,
            operations,
            success_rate,
        })
    }
}

/// `(processed - failed) / processed * 100`, within 0..=100.
fn success_rate(processed: u64, failed: u64) -> f64 {
    if processed == 0 {
        return 0.0;
    }
    let rate = (processed as f64 - failed as f64) / processed as f64 * 100.0;
    rate.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStatsRepository;
    use async_trait::async_trait;

    fn service() -> StatsService {
        StatsService::new(Arc::new(MemoryStatsRepository::new()))
    }

    #[tokio::test]
    async fn test_records_feed_both_aggregate_and_per_operation() {
        let stats = service();
        stats.record_uploaded(1024).await.unwrap();
        stats
            .record_processed(OperationKind::Thumbnail, 12.0)
            .await
            .unwrap();
        stats
            .record_failed(OperationKind::Watermark, 0.0)
            .await
            .unwrap();
        stats.record_unclassified_failure().await.unwrap();

        let general = stats.get_statistics().await.unwrap();
        assert_eq!(general.total_uploaded, 1);
        assert_eq!(general.total_bytes, 1024);
        assert_eq!(general.total_processed, 1);
        assert_eq!(general.total_failed, 2);

        let ops = stats.operation_statistics().await.unwrap();
        assert_eq!(ops.len(), 2);
        let watermark = ops
            .iter()
            .find(|o| o.kind == OperationKind::Watermark)
            .unwrap();
        assert_eq!((watermark.success, watermark.failure), (0, 1));
    }

    #[tokio::test]
    async fn test_detailed_statistics_success_rate() {
        let stats = service();
        assert_eq!(stats.detailed_statistics().await.unwrap().success_rate, 0.0);

        for _ in 0..4 {
            stats
                .record_processed(OperationKind::Resize, 5.0)
                .await
                .unwrap();
        }
        stats.record_failed(OperationKind::Resize, 0.0).await.unwrap();

        let detailed = stats.detailed_statistics().await.unwrap();
        assert!((detailed.success_rate - 75.0).abs() < 1e-9);
        assert_eq!(
            detailed.general.most_used_operation.as_deref(),
            Some("resize")
        );
    }

    #[test]
    fn test_success_rate_is_clamped() {
        assert_eq!(success_rate(1, 5), 0.0);
        assert_eq!(success_rate(10, 0), 100.0);
    }

    struct BrokenMostUsed(MemoryStatsRepository);

    #[async_trait]
    impl StatsRepository for BrokenMostUsed {
        async fn increment_uploaded(&self, size: u64) -> Result<(), StorageError> {
            self.0.increment_uploaded(size).await
        }
        async fn increment_processed(&self, ms: f64) -> Result<(), StorageError> {
            self.0.increment_processed(ms).await
        }
        async fn increment_failed(&self) -> Result<(), StorageError> {
            self.0.increment_failed().await
        }
        async fn update_operation_statistics(
            &self,
            kind: OperationKind,
            success: bool,
            ms: f64,
        ) -> Result<(), StorageError> {
            self.0.update_operation_statistics(kind, success, ms).await
        }
        async fn get_statistics(&self) -> Result<Statistics, StorageError> {
            self.0.get_statistics().await
        }
        async fn get_operation_statistics(
            &self,
        ) -> Result<Vec<OperationStatistics>, StorageError> {
            self.0.get_operation_statistics().await
        }
        async fn get_most_used_operation(&self) -> Result<Option<OperationKind>, StorageError> {
            Err(StorageError::Io {
                message: "query failed".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_most_used_lookup_failure_reports_unknown() {
        let stats = StatsService::new(Arc::new(BrokenMostUsed(MemoryStatsRepository::new())));
        let general = stats.get_statistics().await.unwrap();
        assert_eq!(general.most_used_operation.as_deref(), Some("unknown"));
    }
}
