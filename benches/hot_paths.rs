use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use backhaul::collect::{message, Batch, DataCategory};
use backhaul::plugin::SyntheticPlugin;
use backhaul::query::QueryWindow;
use backhaul::transport::protocol::{encode_frame, ControlCommand, FrameDecoder};

fn control_stream() -> Vec<u8> {
    let mut data = Vec::new();
    for i in 0..64u32 {
        if i % 2 == 0 {
            encode_frame(&format!("PRELERT_CMD_SD{}", 100 + i), &mut data);
        } else {
            encode_frame("PRELERT_CMD_SU", &mut data);
        }
    }
    data
}

fn bench_frames(c: &mut Criterion) {
    let payload = "x".repeat(4_096);
    let mut buf = Vec::with_capacity(payload.len() + 1);

    c.bench_function("frame/encode_4k", |b| {
        b.iter(|| {
            buf.clear();
            encode_frame(black_box(&payload), &mut buf);
            black_box(buf.len())
        })
    });

    let stream = control_stream();
    c.bench_function("frame/decode_control_stream", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            let mut total = 0u64;
            // Feed in small reads to exercise partial frames.
            for chunk in black_box(&stream).chunks(7) {
                for frame in decoder.feed(chunk) {
                    total += ControlCommand::parse(&frame).delay_ms();
                }
            }
            black_box(total)
        })
    });

    c.bench_function("control/parse_slow_down", |b| {
        b.iter(|| ControlCommand::parse(black_box(b"PRELERT_CMD_SD250")).delay_ms())
    });
}

fn bench_encode_batch(c: &mut Criterion) {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
    let plugin = SyntheticPlugin::new("bench", "bench_metric", DataCategory::TimeSeries)
        .with_records_per_window(500);
    let batch = Batch {
        source: "bench",
        data_type: "bench_metric",
        category: DataCategory::TimeSeries,
        window: QueryWindow::new(start, end),
        records: plugin.records_for(start, end),
    };

    c.bench_function("message/encode_500_points", |b| {
        b.iter(|| {
            let text = message::encode("external_time_series", black_box(&batch), &batch.records)
                .expect("encode");
            black_box(text.len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_frames(c);
    bench_encode_batch(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
