use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, DurationRound, Utc};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use backhaul::collect::{Attribute, DataCategory, FetchError, Record, SourcePlugin, Strategy};
use backhaul::poller::{Poller, PollerState};
use backhaul::query::{CollectionMode, HistoricalProducer, ProducerKind};
use backhaul::sync::SyncBarrier;
use backhaul::transport::{OutboundMessage, TransportConfig};

/// Returns one record for any window starting inside `[start, end)`.
struct RangePlugin {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    fetches: AtomicUsize,
}

impl SourcePlugin for RangePlugin {
    fn name(&self) -> &str {
        "range"
    }

    fn data_type(&self) -> &str {
        "range_metric"
    }

    fn category(&self) -> DataCategory {
        DataCategory::TimeSeries
    }

    async fn fetch(
        &self,
        start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _hint_interval_secs: u64,
    ) -> Result<Vec<Record>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if start >= self.start && start < self.end {
            Ok(vec![Record::new(start)
                .with_attribute(Attribute::new("host", "a"))
                .with_value(1.0)])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Accept one connection and count frames until the client closes it.
fn spawn_counting_server(listener: TcpListener) -> tokio::task::JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
        received
            .split(|b| *b == 0)
            .filter(|frame| !frame.is_empty())
            .map(|frame| String::from_utf8_lossy(frame).into_owned())
            .collect()
    })
}

#[tokio::test]
async fn test_historical_then_realtime_sends_each_window_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let server = spawn_counting_server(listener);

    let end = Utc::now()
        .duration_trunc(chrono::Duration::hours(1))
        .expect("truncate")
        - chrono::Duration::hours(1);
    let start = end - chrono::Duration::hours(2);

    let plugin = Arc::new(RangePlugin {
        start,
        end,
        fetches: AtomicUsize::new(0),
    });

    let poller = Arc::new(Poller::new(7, "range", Arc::new(SyncBarrier::new())));
    poller.set_plugin(Arc::clone(&plugin)).expect("plugin");
    poller
        .set_producer(Box::new(
            HistoricalProducer::new(start, end, Duration::from_secs(3600), true).expect("range"),
        ))
        .expect("producer");
    poller
        .set_strategy(Strategy::external_time_series())
        .expect("strategy");
    poller.set_update_interval(Duration::from_secs(3600)).expect("interval");

    let mut cfg = TransportConfig::new("127.0.0.1", port);
    cfg.accept_back_pressure = false;
    poller.set_transport(cfg).expect("transport");
    assert_eq!(poller.state(), PollerState::Configured);

    let run = {
        let poller = Arc::clone(&poller);
        tokio::spawn(async move { poller.run().await })
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    while poller.producer_kind() != Some(ProducerKind::Realtime) {
        assert!(Instant::now() < deadline, "poller never switched to realtime");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(poller.mode(), Some(CollectionMode::Realtime));
    assert_eq!(poller.first_query_start(), Some(end));

    // Let the first realtime window run; it lies after the range and is empty.
    let deadline = Instant::now() + Duration::from_secs(10);
    while plugin.fetches.load(Ordering::SeqCst) < 3 {
        assert!(Instant::now() < deadline, "no realtime fetch");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    poller.quit();
    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run ends after quit")
        .expect("run task")
        .expect("clean run");

    let frames = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server sees close")
        .expect("server task");
    assert_eq!(frames.len(), 2, "frames: {frames:?}");
    for frame in &frames {
        let value: serde_json::Value = serde_json::from_str(frame).expect("json frame");
        assert_eq!(value["data_type"], "range_metric");
        assert_eq!(value["records"].as_array().map(Vec::len), Some(1));
    }

    assert_eq!(poller.state(), PollerState::Finished);
    assert_eq!(poller.transport_stats().map(|s| s.messages_sent), Some(2));
}

#[tokio::test]
async fn test_initial_message_sent_before_data() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let server = spawn_counting_server(listener);

    let start = DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
        .expect("timestamp")
        .with_timezone(&Utc);
    let end = start + chrono::Duration::hours(1);

    let poller = Arc::new(Poller::new(1, "init", Arc::new(SyncBarrier::new())));
    poller
        .set_plugin(Arc::new(RangePlugin {
            start,
            end,
            fetches: AtomicUsize::new(0),
        }))
        .expect("plugin");
    poller
        .set_producer(Box::new(
            HistoricalProducer::new(start, end, Duration::from_secs(3600), false).expect("range"),
        ))
        .expect("producer");
    poller.set_initial_message("hello backend").expect("initial");

    let mut cfg = TransportConfig::new("127.0.0.1", port);
    cfg.accept_back_pressure = false;
    poller.set_transport(cfg).expect("transport");

    tokio::time::timeout(Duration::from_secs(10), poller.run())
        .await
        .expect("historical run ends")
        .expect("clean run");

    let frames = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server sees close")
        .expect("server task");
    assert_eq!(frames.len(), 2, "frames: {frames:?}");
    assert_eq!(frames[0], "hello backend");
    assert!(frames[1].starts_with('{'));
    assert!(poller.queries_finished());
}

#[tokio::test]
async fn test_message_queued_from_finished_callback_is_sent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let server = spawn_counting_server(listener);

    let start = DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
        .expect("timestamp")
        .with_timezone(&Utc);
    let end = start + chrono::Duration::hours(1);

    let poller = Arc::new(Poller::new(3, "marker", Arc::new(SyncBarrier::new())));
    poller
        .set_plugin(Arc::new(RangePlugin {
            start,
            end,
            fetches: AtomicUsize::new(0),
        }))
        .expect("plugin");
    poller
        .set_producer(Box::new(
            HistoricalProducer::new(start, end, Duration::from_secs(3600), false).expect("range"),
        ))
        .expect("producer");

    let mut cfg = TransportConfig::new("127.0.0.1", port);
    cfg.accept_back_pressure = false;
    poller.set_transport(cfg).expect("transport");

    let transport = poller.transport().expect("transport");
    poller.set_finished_callback(move |report| {
        let marker = OutboundMessage::new(format!("finished {}", report.name));
        transport.try_enqueue(marker).expect("room for the marker");
    });

    tokio::time::timeout(Duration::from_secs(10), poller.run())
        .await
        .expect("historical run ends")
        .expect("clean run");

    let frames = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server sees close")
        .expect("server task");
    assert_eq!(frames.len(), 2, "frames: {frames:?}");
    assert!(frames[0].starts_with('{'));
    assert_eq!(frames[1], "finished marker");
}
