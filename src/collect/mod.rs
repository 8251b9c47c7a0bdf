//! Turning fetched records into outbound messages.
//!
//! A `SourcePlugin` fetches records for a window; a `Strategy` decides how
//! those records are packaged and where they go.

mod gzip_file;
pub mod message;
mod notification;
mod timeseries;

use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::query::QueryWindow;
use crate::transport::{OutboundMessage, TransportClient, TransportError};

pub use gzip_file::GzipFileStrategy;
pub use notification::NotificationStrategy;
pub use timeseries::{TimeSeriesStrategy, MAX_POINTS_PER_MESSAGE};

/// A named attribute of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One item returned by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    pub attributes: Vec<Attribute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Record {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            attributes: Vec::new(),
            value: None,
            description: None,
        }
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.attributes.iter().map(|a| a.name.clone()).collect()
    }
}

/// Kind of data a source produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    Notification,
    TimeSeries,
}

impl DataCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notification => "notification",
            Self::TimeSeries => "time_series",
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Soft failure: back off for `suggested_wait` then use `partial`.
    #[error("query took too long ({} partial records)", partial.len())]
    QueryTookTooLong {
        partial: Vec<Record>,
        suggested_wait: Duration,
    },
    #[error("fetch failed: {reason}")]
    Failed { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// The source failed; the cycle yields no data.
    #[error("fetch failed: {reason}")]
    FetchFailed { reason: String },
    #[error("serializing batch")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("writing {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A data source polled by a poller.
pub trait SourcePlugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn data_type(&self) -> &str;

    fn category(&self) -> DataCategory;

    /// Fetch records in `[start, end)`. May block for as long as the
    /// source takes; it is never interrupted mid-call.
    fn fetch(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        hint_interval_secs: u64,
    ) -> impl Future<Output = Result<Vec<Record>, FetchError>> + Send;
}

/// External store for display and schema metadata.
pub trait MetadataSink: Send + Sync {
    fn register_schema(&self, data_type: &str, category: DataCategory, attributes: &[String]);
}

/// Records fetched for one window.
#[derive(Debug)]
pub struct Batch<'a> {
    pub source: &'a str,
    pub data_type: &'a str,
    pub category: DataCategory,
    pub window: QueryWindow,
    pub records: Vec<Record>,
}

/// What a strategy needs from its poller for one cycle.
pub struct CollectContext<'a> {
    pub source: &'a str,
    pub hint_interval_secs: u64,
    pub transport: Option<&'a TransportClient>,
    pub metadata: Option<&'a dyn MetadataSink>,
    /// Armed while the schema still needs registering.
    pub update_schema: &'a AtomicBool,
    pub cancel: &'a CancellationToken,
}

/// How collected records are packaged and delivered.
///
/// Uses enum dispatch rather than trait objects so `collect` stays a plain
/// async fn.
#[derive(Debug, Clone)]
pub enum Strategy {
    Notification(NotificationStrategy),
    InternalTimeSeries(TimeSeriesStrategy),
    ExternalTimeSeries(TimeSeriesStrategy),
    GzipFile(GzipFileStrategy),
}

impl Strategy {
    pub fn notification() -> Self {
        Self::Notification(NotificationStrategy)
    }

    pub fn internal_time_series() -> Self {
        Self::InternalTimeSeries(TimeSeriesStrategy::new("internal_time_series"))
    }

    pub fn external_time_series() -> Self {
        Self::ExternalTimeSeries(TimeSeriesStrategy::new("external_time_series"))
    }

    pub fn gzip_file(path: impl Into<PathBuf>) -> Self {
        Self::GzipFile(GzipFileStrategy::new(path))
    }

    /// Default strategy for a data category.
    pub fn for_category(category: DataCategory) -> Self {
        match category {
            DataCategory::Notification => Self::notification(),
            DataCategory::TimeSeries => Self::internal_time_series(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Notification(s) => s.name(),
            Self::InternalTimeSeries(s) | Self::ExternalTimeSeries(s) => s.name(),
            Self::GzipFile(s) => s.name(),
        }
    }

    /// Whether batches go to the backend rather than elsewhere.
    pub fn uses_transport(&self) -> bool {
        !matches!(self, Self::GzipFile(_))
    }

    /// Fetch `window` from `plugin` and deliver the result.
    ///
    /// Returns whether anything was delivered. A failed fetch comes back as
    /// `CollectError::FetchFailed` and delivers nothing.
    pub async fn collect<P: SourcePlugin>(
        &self,
        plugin: &P,
        window: &QueryWindow,
        ctx: &CollectContext<'_>,
    ) -> Result<bool, CollectError> {
        let records = fetch_records(plugin, window, ctx).await?;
        if records.is_empty() {
            debug!(source = ctx.source, window = %window, "no records this cycle");
            return Ok(false);
        }

        register_schema_once(plugin, &records, ctx);

        let batch = Batch {
            source: ctx.source,
            data_type: plugin.data_type(),
            category: plugin.category(),
            window: *window,
            records,
        };

        match self {
            Self::Notification(s) => s.deliver(&batch, ctx).await,
            Self::InternalTimeSeries(s) | Self::ExternalTimeSeries(s) => s.deliver(&batch, ctx).await,
            Self::GzipFile(s) => s.deliver(&batch, ctx).await,
        }
    }
}

async fn fetch_records<P: SourcePlugin>(
    plugin: &P,
    window: &QueryWindow,
    ctx: &CollectContext<'_>,
) -> Result<Vec<Record>, CollectError> {
    match plugin
        .fetch(window.start, window.end, ctx.hint_interval_secs)
        .await
    {
        Ok(records) => Ok(records),
        Err(FetchError::QueryTookTooLong {
            partial,
            suggested_wait,
        }) => {
            info!(
                source = ctx.source,
                window = %window,
                partial = partial.len(),
                wait_ms = suggested_wait.as_millis() as u64,
                "query took too long, backing off before sending partial results",
            );
            tokio::select! {
                _ = ctx.cancel.cancelled() => {}
                _ = tokio::time::sleep(suggested_wait) => {}
            }
            Ok(partial)
        }
        Err(FetchError::Failed { reason }) => Err(CollectError::FetchFailed { reason }),
    }
}

fn register_schema_once<P: SourcePlugin>(plugin: &P, records: &[Record], ctx: &CollectContext<'_>) {
    let Some(sink) = ctx.metadata else {
        return;
    };
    let Some(first) = records.first() else {
        return;
    };
    if !ctx.update_schema.swap(false, Ordering::AcqRel) {
        return;
    }

    let attributes = first.attribute_names();
    info!(
        source = ctx.source,
        data_type = plugin.data_type(),
        attributes = attributes.len(),
        "registering source schema",
    );
    sink.register_schema(plugin.data_type(), plugin.category(), &attributes);
}

/// Enqueue `messages` on the context's transport, marking the first as the
/// start of a batch. Stops early once the poller is cancelled.
pub(crate) async fn forward(
    messages: Vec<String>,
    ctx: &CollectContext<'_>,
) -> Result<bool, CollectError> {
    let Some(transport) = ctx.transport else {
        warn!(
            source = ctx.source,
            messages = messages.len(),
            "no transport client configured, dropping batch",
        );
        return Ok(false);
    };

    let mut sent = false;
    for (i, text) in messages.into_iter().enumerate() {
        let msg = if i == 0 {
            OutboundMessage::first_in_batch(text)
        } else {
            OutboundMessage::new(text)
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!(source = ctx.source, "collection cancelled mid-batch");
                break;
            }
            res = transport.enqueue(msg) => res?,
        }
        sent = true;

        if ctx.cancel.is_cancelled() {
            break;
        }
    }

    Ok(sent)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// Plugin returning a fixed outcome for every fetch.
    pub struct FixedPlugin {
        pub outcome: Mutex<Option<Result<Vec<Record>, FetchError>>>,
        pub calls: AtomicUsize,
        pub category: DataCategory,
    }

    impl FixedPlugin {
        pub fn returning(outcome: Result<Vec<Record>, FetchError>) -> Self {
            Self {
                outcome: Mutex::new(Some(outcome)),
                calls: AtomicUsize::new(0),
                category: DataCategory::TimeSeries,
            }
        }
    }

    impl SourcePlugin for FixedPlugin {
        fn name(&self) -> &str {
            "fixed"
        }

        fn data_type(&self) -> &str {
            "fixed_type"
        }

        fn category(&self) -> DataCategory {
            self.category
        }

        async fn fetch(
            &self,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _hint_interval_secs: u64,
        ) -> Result<Vec<Record>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.lock().take().unwrap_or(Ok(Vec::new()))
        }
    }

    #[derive(Default)]
    pub struct RecordingSink {
        pub calls: Mutex<Vec<(String, DataCategory, Vec<String>)>>,
    }

    impl MetadataSink for RecordingSink {
        fn register_schema(&self, data_type: &str, category: DataCategory, attributes: &[String]) {
            self.calls
                .lock()
                .push((data_type.to_string(), category, attributes.to_vec()));
        }
    }

    pub fn records(n: usize, at: DateTime<Utc>) -> Vec<Record> {
        (0..n)
            .map(|i| {
                Record::new(at)
                    .with_attribute(Attribute::new("host", format!("h{i}")))
                    .with_value(i as f64)
            })
            .collect()
    }

    pub fn arc_sink() -> Arc<RecordingSink> {
        Arc::new(RecordingSink::default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::test_support::*;
    use super::*;
    use crate::query::CollectionMode;
    use crate::transport::TransportConfig;

    fn window() -> QueryWindow {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        QueryWindow::new(start, start + chrono::Duration::minutes(5))
    }

    fn transport() -> TransportClient {
        TransportClient::new(TransportConfig::new("127.0.0.1", 1), CollectionMode::Historical)
    }

    #[tokio::test]
    async fn test_failed_fetch_delivers_nothing() {
        let plugin = FixedPlugin::returning(Err(FetchError::Failed {
            reason: "boom".into(),
        }));
        let transport = transport();
        let armed = AtomicBool::new(true);
        let cancel = CancellationToken::new();
        let ctx = CollectContext {
            source: "s",
            hint_interval_secs: 60,
            transport: Some(&transport),
            metadata: None,
            update_schema: &armed,
            cancel: &cancel,
        };

        let err = Strategy::internal_time_series()
            .collect(&plugin, &window(), &ctx)
            .await
            .expect_err("failure surfaces to the poller");
        assert!(matches!(err, CollectError::FetchFailed { reason } if reason == "boom"));
        assert_eq!(transport.queued(), 0);
    }

    #[tokio::test]
    async fn test_query_took_too_long_forwards_partial_results() {
        let w = window();
        let plugin = FixedPlugin::returning(Err(FetchError::QueryTookTooLong {
            partial: records(2, w.start),
            suggested_wait: Duration::from_millis(30),
        }));
        let transport = transport();
        let armed = AtomicBool::new(false);
        let cancel = CancellationToken::new();
        let ctx = CollectContext {
            source: "s",
            hint_interval_secs: 60,
            transport: Some(&transport),
            metadata: None,
            update_schema: &armed,
            cancel: &cancel,
        };

        let started = tokio::time::Instant::now();
        let sent = Strategy::notification()
            .collect(&plugin, &w, &ctx)
            .await
            .expect("collect");
        assert!(sent);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(transport.queued(), 2);
    }

    #[tokio::test]
    async fn test_schema_registered_once() {
        let w = window();
        let plugin = FixedPlugin::returning(Ok(records(3, w.start)));
        let sink = arc_sink();
        let transport = transport();
        let armed = AtomicBool::new(true);
        let cancel = CancellationToken::new();
        let ctx = CollectContext {
            source: "s",
            hint_interval_secs: 60,
            transport: Some(&transport),
            metadata: Some(sink.as_ref()),
            update_schema: &armed,
            cancel: &cancel,
        };

        let strategy = Strategy::internal_time_series();
        assert!(strategy.collect(&plugin, &w, &ctx).await.expect("collect"));

        *plugin.outcome.lock() = Some(Ok(records(1, w.start)));
        assert!(strategy.collect(&plugin, &w, &ctx).await.expect("collect"));

        let calls = sink.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "fixed_type");
        assert_eq!(calls[0].2, vec!["host".to_string()]);
        assert!(!armed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_forward_without_transport_drops() {
        let armed = AtomicBool::new(false);
        let cancel = CancellationToken::new();
        let ctx = CollectContext {
            source: "s",
            hint_interval_secs: 60,
            transport: None,
            metadata: None,
            update_schema: &armed,
            cancel: &cancel,
        };
        assert!(!forward(vec!["a".into()], &ctx).await.expect("forward"));
    }

    #[tokio::test]
    async fn test_forward_stops_when_cancelled() {
        let transport = transport();
        let armed = AtomicBool::new(false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = CollectContext {
            source: "s",
            hint_interval_secs: 60,
            transport: Some(&transport),
            metadata: None,
            update_schema: &armed,
            cancel: &cancel,
        };

        forward(vec!["a".into(), "b".into(), "c".into()], &ctx)
            .await
            .expect("forward");
        assert!(transport.queued() <= 1);
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(Strategy::notification().name(), "notification");
        assert_eq!(Strategy::internal_time_series().name(), "internal_time_series");
        assert_eq!(Strategy::external_time_series().name(), "external_time_series");
        assert_eq!(Strategy::gzip_file("/tmp/x.gz").name(), "gzip_file");
        assert!(!Strategy::gzip_file("/tmp/x.gz").uses_transport());
        assert!(matches!(
            Strategy::for_category(DataCategory::Notification),
            Strategy::Notification(_)
        ));
    }
}
