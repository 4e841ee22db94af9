// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use geneva_exporter::{
    AnyValue, ExporterOptions, HistogramValue, LogExporter, LogRecord, MetricExporter,
    MetricExporterOptions, MetricRecord, MetricValue, MetricWireFormat, SpanId, SpanRecord,
    TraceExporter, TraceId,
};
use std::time::{Duration, UNIX_EPOCH};

// Never contacted: benches only serialize.
const CONNECTION_STRING: &str = "Endpoint=tcp://127.0.0.1:1;Account=acct;Namespace=ns";

fn log_record(attributes: usize) -> LogRecord {
    let mut record = LogRecord::new(
        "MyCompany.Orders.Api",
        9,
        UNIX_EPOCH + Duration::from_secs(1_700_000_000),
    )
    .with_body("Order 42 placed by customer 7");
    record.trace_id = TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").ok();
    record.span_id = SpanId::from_hex("b7ad6b7169203331").ok();
    for i in 0..attributes {
        record
            .attributes
            .push((format!("attribute{i}"), AnyValue::from(i as i64)));
    }
    record
}

fn bench_log_envelope(c: &mut Criterion) {
    let mut options = ExporterOptions::new(CONNECTION_STRING);
    options
        .prepopulated_fields
        .insert("cloud.role".to_string(), AnyValue::from("checkout"));
    let exporter = LogExporter::new(&options).expect("failed to create exporter");

    let mut group = c.benchmark_group("log_envelope");
    for attributes in [0, 8, 32] {
        let record = log_record(attributes);
        let mut buf = Vec::with_capacity(4096);
        group.bench_with_input(
            BenchmarkId::from_parameter(attributes),
            &record,
            |b, record| {
                b.iter(|| {
                    buf.clear();
                    exporter
                        .serialize(black_box(record), &mut buf)
                        .expect("serialize failed");
                });
            },
        );
    }
    group.finish();
}

fn bench_span_envelope(c: &mut Criterion) {
    let exporter = TraceExporter::new(&ExporterOptions::new(CONNECTION_STRING))
        .expect("failed to create exporter");
    let start = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    let span = SpanRecord::new(
        "GET /orders",
        TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").expect("valid trace id"),
        SpanId::from_hex("b7ad6b7169203331").expect("valid span id"),
        start,
        start + Duration::from_millis(12),
    )
    .with_attribute("http.method", "GET")
    .with_attribute("http.status_code", 200i64);

    let mut buf = Vec::with_capacity(4096);
    c.bench_function("span_envelope", |b| {
        b.iter(|| {
            buf.clear();
            exporter
                .serialize(black_box(&span), &mut buf)
                .expect("serialize failed");
        });
    });
}

fn bench_metrics(c: &mut Criterion) {
    let histogram = MetricRecord::new(
        "latency",
        UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        MetricValue::Histogram(HistogramValue::from_explicit_bounds(
            &[5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0],
            &[3, 8, 14, 9, 4, 2, 0, 1, 1],
            5230.0,
            1.0,
            1800.0,
        )),
    )
    .with_dimension("route", "/orders")
    .with_dimension("status", "200")
    .with_dimension("region", "westus2");

    let mut group = c.benchmark_group("metric_record");
    for wire_format in [MetricWireFormat::Tlv, MetricWireFormat::Legacy] {
        let mut options = MetricExporterOptions::new(CONNECTION_STRING);
        options.wire_format = wire_format;
        let exporter = MetricExporter::new(&options).expect("failed to create exporter");
        let mut buf = Vec::with_capacity(1024);
        group.bench_function(wire_format.to_string(), |b| {
            b.iter(|| {
                buf.clear();
                exporter
                    .serialize(black_box(&histogram), &mut buf)
                    .expect("serialize failed");
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_log_envelope, bench_span_envelope, bench_metrics);
criterion_main!(benches);
