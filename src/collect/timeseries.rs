use super::{forward, message, Batch, CollectContext, CollectError};

/// Largest number of points packed into one time-series message.
pub const MAX_POINTS_PER_MESSAGE: usize = 500;

/// Packs records into messages of at most `MAX_POINTS_PER_MESSAGE` points.
#[derive(Debug, Clone)]
pub struct TimeSeriesStrategy {
    kind: &'static str,
    max_points: usize,
}

impl TimeSeriesStrategy {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            max_points: MAX_POINTS_PER_MESSAGE,
        }
    }

    pub fn with_max_points(mut self, max_points: usize) -> Self {
        self.max_points = max_points.max(1);
        self
    }

    pub fn name(&self) -> &str {
        self.kind
    }

    pub async fn deliver(
        &self,
        batch: &Batch<'_>,
        ctx: &CollectContext<'_>,
    ) -> Result<bool, CollectError> {
        let messages = batch
            .records
            .chunks(self.max_points)
            .map(|chunk| message::encode(self.kind, batch, chunk))
            .collect::<Result<Vec<_>, _>>()?;

        forward(messages, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use chrono::{TimeZone, Utc};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::collect::test_support::records;
    use crate::collect::DataCategory;
    use crate::query::{CollectionMode, QueryWindow};
    use crate::transport::{TransportClient, TransportConfig};

    #[tokio::test]
    async fn test_records_chunked_per_message() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let batch = Batch {
            source: "cpu",
            data_type: "cpu_load",
            category: DataCategory::TimeSeries,
            window: QueryWindow::new(start, start + chrono::Duration::minutes(1)),
            records: records(1_201, start),
        };

        let transport = TransportClient::new(
            TransportConfig::new("127.0.0.1", 1),
            CollectionMode::Historical,
        );
        let armed = AtomicBool::new(false);
        let cancel = CancellationToken::new();
        let ctx = CollectContext {
            source: "cpu",
            hint_interval_secs: 60,
            transport: Some(&transport),
            metadata: None,
            update_schema: &armed,
            cancel: &cancel,
        };

        let strategy = TimeSeriesStrategy::new("internal_time_series");
        assert!(strategy.deliver(&batch, &ctx).await.expect("deliver"));
        // 500 + 500 + 201
        assert_eq!(transport.queued(), 3);
    }

    #[test]
    fn test_max_points_never_zero() {
        let strategy = TimeSeriesStrategy::new("external_time_series").with_max_points(0);
        assert_eq!(strategy.max_points, 1);
    }
}
