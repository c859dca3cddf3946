//! Performance benchmarks for the speed test engine
//!
//! Covers the per-sample hot paths: estimators fed by every chunk or probe,
//! warm-up classification, config resolution and duplex message parsing.

use clap::Parser;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use speedtest_engine::{
    cli::Cli,
    config::ConfigParser,
    engine::{GracePeriod, ProtocolOverheadEstimator},
    models::SpeedTestResult,
    output::{format_json, OutputFormatterFactory},
    server::generator,
    stats,
    transport::protocol::ServerMessage,
};
use std::hint::black_box;
use std::time::Duration;

/// Latency-like series with a spike every 17 samples
fn create_sample_series(count: usize) -> Vec<f64> {
    (0..count)
        .map(|i| 10.0 + (i % 7) as f64 * 0.4 + if i % 17 == 0 { 40.0 } else { 0.0 })
        .collect()
}

fn benchmark_statistics(c: &mut Criterion) {
    let mut group = c.benchmark_group("statistics");

    for size in [10usize, 100, 1000].iter() {
        let series = create_sample_series(*size);

        group.bench_with_input(BenchmarkId::new("trimmed_mean", size), &series, |b, series| {
            b.iter(|| black_box(stats::trimmed_mean(black_box(series))));
        });

        group.bench_with_input(BenchmarkId::new("jitter", size), &series, |b, series| {
            b.iter(|| black_box(stats::jitter(black_box(series))));
        });

        group.bench_with_input(BenchmarkId::new("stability", size), &series, |b, series| {
            b.iter(|| black_box(stats::stability(black_box(series))));
        });
    }

    group.bench_function("mbps", |b| {
        b.iter(|| black_box(stats::mbps(black_box(132_500_000), black_box(Duration::from_secs(10)))));
    });

    group.finish();
}

fn benchmark_overhead_estimation(c: &mut Criterion) {
    let mut group = c.benchmark_group("overhead");

    group.bench_function("detect_from_five_ratios", |b| {
        b.iter(|| {
            let mut estimator = ProtocolOverheadEstimator::new(1.06).with_required_samples(5);
            for observed in [1_040_000u64, 1_035_000, 1_045_000, 1_050_000, 1_030_000] {
                estimator.observe(black_box(1_000_000), black_box(observed));
            }
            black_box(estimator.report())
        });
    });

    group.bench_function("reject_implausible", |b| {
        let mut estimator = ProtocolOverheadEstimator::new(1.06);
        b.iter(|| black_box(estimator.observe(black_box(1_000_000), black_box(1_000_000))));
    });

    group.finish();
}

fn benchmark_grace_period(c: &mut Criterion) {
    let mut group = c.benchmark_group("grace_period");

    group.bench_function("classify_connection", |b| {
        b.iter(|| {
            let mut grace = GracePeriod::dynamic();
            let mut class = None;
            for step in 1..=10u64 {
                class = class.or(grace.observe(Duration::from_millis(step * 100), black_box(180.0)));
            }
            black_box(class)
        });
    });

    group.bench_function("observe_after_decision", |b| {
        let mut grace = GracePeriod::fixed(Duration::from_secs(2));
        b.iter(|| black_box(grace.observe(black_box(Duration::from_secs(5)), black_box(90.0))));
    });

    group.finish();
}

fn benchmark_config_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("config_parsing");

    let args = [
        "speedtest",
        "run",
        "--server",
        "http://10.0.0.5:3000",
        "--duration",
        "5",
        "--transport",
        "duplex",
    ];

    group.bench_function("parse_cli_args", |b| {
        b.iter(|| black_box(Cli::try_parse_from(black_box(args))));
    });

    group.bench_function("resolve_test_config", |b| {
        let parser = ConfigParser::new(Cli::parse_from(args));
        b.iter(|| black_box(parser.resolve_test_config(|_| None)));
    });

    group.finish();
}

fn benchmark_protocol(c: &mut Criterion) {
    let mut group = c.benchmark_group("duplex_protocol");

    let pong = r#"{"type":"pong","clientTimestamp":1700000000000,"serverTimestamp":1700000000004,"serverProcessingTime":0.2}"#;
    let progress = r#"{"type":"download_progress","bytesTransferred":1048576,"totalBytes":104857600}"#;

    group.bench_function("parse_pong", |b| {
        b.iter(|| black_box(ServerMessage::parse(black_box(pong))));
    });

    group.bench_function("parse_download_progress", |b| {
        b.iter(|| black_box(ServerMessage::parse(black_box(progress))));
    });

    group.bench_function("chunk_size_for", |b| {
        b.iter(|| black_box(generator::chunk_size_for(black_box(100 * 1024 * 1024))));
    });

    group.finish();
}

fn benchmark_output(c: &mut Criterion) {
    let mut group = c.benchmark_group("output");

    let result: SpeedTestResult = serde_json::from_str(
        r#"{
            "id": "00000000-0000-0000-0000-000000000000",
            "timestamp": "2026-01-01T00:00:00Z",
            "downloadMbps": 106.0,
            "uploadMbps": 42.5,
            "pingMs": 10.2,
            "jitterMs": 1.3,
            "testDurationS": 27.4,
            "packetLoss": {"sent": 50, "received": 49, "percentage": 2.0},
            "protocolOverhead": {"detected": true, "factor": 1.04, "overheadPercent": 4.0},
            "server": "http://127.0.0.1:3000",
            "transport": "duplex",
            "degraded": {"latency": false, "download": false, "upload": false, "packetLoss": false, "bufferbloat": false}
        }"#,
    )
    .expect("benchmark result fixture");
    let plain = OutputFormatterFactory::create_plain_formatter();

    group.bench_function("format_result_plain", |b| {
        b.iter(|| black_box(plain.format_result(black_box(&result))));
    });

    group.bench_function("format_json", |b| {
        b.iter(|| black_box(format_json(black_box(&result))));
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_statistics,
    benchmark_overhead_estimation,
    benchmark_grace_period,
    benchmark_config_parsing,
    benchmark_protocol,
    benchmark_output
);

criterion_main!(benches);
