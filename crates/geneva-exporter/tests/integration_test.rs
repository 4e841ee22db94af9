// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{
    decode_single, field_map, get, split_metric_records, table_name, RecordingTransport,
    TcpCapture,
};
use geneva_exporter::transport::{SessionState, StreamTransport};
use geneva_exporter::{
    AnyValue, ExportError, ExportOutcome, ExporterOptions, HistogramValue, LogExporter,
    LogRecord, MetricExporter, MetricExporterOptions, MetricRecord, MetricValue, SpanId,
    SpanRecord, TraceExporter, TraceId, TransportError,
};
use rmpv::Value;

fn timestamp() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

fn log(category: &str, body: &str) -> LogRecord {
    LogRecord::new(category, 9, timestamp()).with_body(body)
}

#[test]
fn logs_are_delivered_over_tcp() {
    let capture = TcpCapture::start();
    let mut options = ExporterOptions::new(capture.endpoint());
    options.table_name_mappings = HashMap::from([
        ("Orders".to_string(), "OrderEvents".to_string()),
        ("*".to_string(), "*".to_string()),
    ]);
    let exporter = LogExporter::new(&options).expect("failed to create exporter");

    for (category, body) in [
        ("Orders", "order placed"),
        ("my.app-Payments", "payment captured"),
    ] {
        assert_eq!(
            exporter.export(&log(category, body)).expect("export failed"),
            ExportOutcome::Exported
        );
    }

    let envelopes = capture.capture.wait_for_envelopes(2);
    assert_eq!(envelopes.len(), 2);
    assert_eq!(table_name(&envelopes[0]), "OrderEvents");
    assert_eq!(table_name(&envelopes[1]), "MyappPayments");

    let fields = field_map(&envelopes[0]);
    assert_eq!(get(fields, "env_name"), Some(&Value::from("OrderEvents")));
    assert_eq!(get(fields, "env_ver"), Some(&Value::from("4.0")));
    assert_eq!(get(fields, "body"), Some(&Value::from("order placed")));
    assert_eq!(capture.capture.connections(), 1);
}

#[test]
fn spans_are_delivered_over_one_tcp_connection() {
    let capture = TcpCapture::start();
    let options = ExporterOptions::new(capture.endpoint());
    let exporter = TraceExporter::new(&options).expect("failed to create exporter");

    let start = timestamp();
    let span = SpanRecord::new(
        "GET /orders",
        TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").expect("valid trace id"),
        SpanId::from_hex("b7ad6b7169203331").expect("valid span id"),
        start,
        start + Duration::from_millis(20),
    )
    .with_attribute("http.status_code", 200i64);

    for _ in 0..3 {
        exporter.export(&span).expect("export failed");
    }

    let envelopes = capture.capture.wait_for_envelopes(3);
    assert_eq!(envelopes.len(), 3);
    for envelope in &envelopes {
        assert_eq!(table_name(envelope), "Span");
        let fields = field_map(envelope);
        assert_eq!(
            get(fields, "env_dt_traceId"),
            Some(&Value::from("0af7651916cd43dd8448eb211c80319c"))
        );
        assert_eq!(get(fields, "http.status_code"), Some(&Value::from(200)));
    }
    assert_eq!(capture.capture.connections(), 1);
}

#[cfg(unix)]
#[test]
fn logs_are_delivered_over_unix_socket() {
    let capture = common::UnixCapture::start();
    let exporter = LogExporter::new(&ExporterOptions::new(capture.endpoint()))
        .expect("failed to create exporter");

    exporter
        .export(&log("Audit", "user signed in"))
        .expect("export failed");

    let envelopes = capture.capture.wait_for_envelopes(1);
    assert_eq!(envelopes.len(), 1);
    assert_eq!(table_name(&envelopes[0]), "Log");
}

#[test]
fn metrics_are_delivered_over_tcp() {
    let capture = TcpCapture::start();
    let options = MetricExporterOptions::new(format!(
        "{};Account=acct;Namespace=ns",
        capture.endpoint()
    ));
    let exporter = MetricExporter::new(&options).expect("failed to create exporter");

    let counter = MetricRecord::new("requests", timestamp(), MetricValue::ULong(12))
        .with_dimension("status", "200");
    let histogram = MetricRecord::new(
        "latency",
        timestamp(),
        MetricValue::Histogram(HistogramValue::from_explicit_bounds(
            &[100.0, 250.0, 500.0, 1000.0],
            &[1, 1, 0, 0, 2],
            4400.0,
            20.0,
            2000.0,
        )),
    );
    exporter.export(&counter).expect("export failed");
    exporter.export(&histogram).expect("export failed");

    let mut expected = Vec::new();
    exporter
        .serialize(&counter, &mut expected)
        .expect("serialize failed");
    exporter
        .serialize(&histogram, &mut expected)
        .expect("serialize failed");

    let received = capture.capture.wait_for_bytes(expected.len());
    assert_eq!(received, expected);

    let records = split_metric_records(&received);
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|(event_id, _)| *event_id == 70));
}

#[test]
fn unreachable_endpoint_fails_on_export_not_construction() {
    let capture = TcpCapture::start();
    let addr = capture.addr;
    capture.capture.stop();

    let exporter = LogExporter::new(&ExporterOptions::new(format!(
        "Endpoint=tcp://127.0.0.1:{};TimeoutMilliseconds=500",
        addr.port()
    )))
    .expect("construction does not connect");

    assert!(matches!(
        exporter.export(&log("Orders", "lost")),
        Err(ExportError::Transport(TransportError::Connect { .. }))
    ));
}

#[test]
fn write_failure_reconnects_once_on_next_send() {
    let capture = TcpCapture::start();
    let addr = capture.addr;
    let transport = Arc::new(StreamTransport::tcp(
        "127.0.0.1",
        addr.port(),
        Duration::from_secs(2),
    ));
    let exporter = LogExporter::with_transport(
        &ExporterOptions::new(capture.endpoint()),
        transport.clone(),
    )
    .expect("failed to create exporter");

    assert_eq!(transport.state(), SessionState::Disconnected);
    exporter
        .export(&log("Orders", "first"))
        .expect("export failed");
    assert_eq!(transport.state(), SessionState::Connected);
    assert_eq!(transport.connect_attempts(), 1);
    assert_eq!(capture.capture.wait_for_envelopes(1).len(), 1);

    capture.capture.stop();

    // The peer's close is only observed by a later write.
    let mut write_failed = false;
    for _ in 0..100 {
        match exporter.export(&log("Orders", "dropped")) {
            Ok(_) => thread::sleep(Duration::from_millis(10)),
            Err(ExportError::Transport(TransportError::Write { .. })) => {
                write_failed = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(write_failed, "write to a closed peer never failed");
    assert_eq!(transport.state(), SessionState::Disconnected);
    assert_eq!(transport.connect_attempts(), 1);
    assert!(transport.last_error().is_some());

    let restarted = TcpCapture::bind(addr);
    exporter
        .export(&log("Orders", "after restart"))
        .expect("export after restart failed");
    assert_eq!(transport.connect_attempts(), 2);
    assert_eq!(transport.state(), SessionState::Connected);

    let envelopes = restarted.capture.wait_for_envelopes(1);
    assert_eq!(envelopes.len(), 1);
    assert_eq!(
        get(field_map(&envelopes[0]), "body"),
        Some(&Value::from("after restart"))
    );
    assert_eq!(restarted.capture.connections(), 1);
}

#[test]
fn idle_transport_never_connects() {
    let capture = TcpCapture::start();
    let transport = StreamTransport::tcp("127.0.0.1", capture.addr.port(), Duration::from_secs(1));

    thread::sleep(Duration::from_millis(50));
    assert_eq!(transport.connect_attempts(), 0);
    assert_eq!(capture.capture.connections(), 0);
    assert_eq!(capture.capture.received_len(), 0);
}

#[test]
fn concurrent_exports_produce_independent_envelopes() {
    const THREADS: i64 = 8;
    const RECORDS: i64 = 50;

    let transport = Arc::new(RecordingTransport::default());
    let mut options = ExporterOptions::new("Endpoint=tcp://127.0.0.1:1");
    options
        .prepopulated_fields
        .insert("cloud.role".to_string(), AnyValue::from("checkout"));
    let exporter = Arc::new(
        LogExporter::with_transport(&options, transport.clone())
            .expect("failed to create exporter"),
    );

    let handles: Vec<_> = (0..THREADS)
        .map(|thread_id| {
            let exporter = Arc::clone(&exporter);
            thread::spawn(move || {
                for seq in 0..RECORDS {
                    // Vary the number of attributes so a shared buffer or field counter
                    // would show up as a malformed map.
                    let mut record = log("Orders", &format!("record {thread_id}/{seq}"))
                        .with_attribute("thread", thread_id)
                        .with_attribute("seq", seq);
                    for extra in 0..(seq % 4) {
                        record = record.with_attribute(format!("extra{extra}"), extra);
                    }
                    exporter.export(&record).expect("export failed");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("producer thread panicked");
    }

    let payloads = transport.payloads.lock().expect("poisoned");
    assert_eq!(payloads.len(), (THREADS * RECORDS) as usize);

    let mut seen = HashSet::new();
    for payload in payloads.iter() {
        let envelope = decode_single(payload);
        let fields = field_map(&envelope);

        let keys: HashSet<&str> = fields.iter().filter_map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys.len(), fields.len(), "duplicate keys in field map");
        assert_eq!(get(fields, "cloud.role"), Some(&Value::from("checkout")));

        let thread_id = get(fields, "thread")
            .and_then(Value::as_i64)
            .expect("thread attribute");
        let seq = get(fields, "seq")
            .and_then(Value::as_i64)
            .expect("seq attribute");
        let extras = fields
            .iter()
            .filter(|(k, _)| k.as_str().is_some_and(|k| k.starts_with("extra")))
            .count();
        assert_eq!(extras as i64, seq % 4);
        assert_eq!(
            get(fields, "body"),
            Some(&Value::from(format!("record {thread_id}/{seq}")))
        );
        assert!(seen.insert((thread_id, seq)));
    }
    assert_eq!(seen.len(), (THREADS * RECORDS) as usize);
}

#[test]
fn concurrent_exports_do_not_interleave_on_the_wire() {
    let capture = TcpCapture::start();
    let exporter = Arc::new(
        LogExporter::new(&ExporterOptions::new(capture.endpoint()))
            .expect("failed to create exporter"),
    );

    let handles: Vec<_> = (0..4)
        .map(|thread_id| {
            let exporter = Arc::clone(&exporter);
            thread::spawn(move || {
                let body = "x".repeat(1000 * (thread_id + 1));
                for _ in 0..25 {
                    exporter
                        .export(&log("Orders", &body))
                        .expect("export failed");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("producer thread panicked");
    }

    let envelopes = capture.capture.wait_for_envelopes(100);
    assert_eq!(envelopes.len(), 100);
    for envelope in &envelopes {
        assert_eq!(table_name(envelope), "Log");
        let body = get(field_map(envelope), "body")
            .and_then(Value::as_str)
            .expect("body");
        assert!(body.len() % 1000 == 0 && body.bytes().all(|b| b == b'x'));
    }
    assert_eq!(capture.capture.connections(), 1);
}
